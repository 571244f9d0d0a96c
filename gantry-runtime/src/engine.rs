//! Engine: the step scheduler that runs a batch through the
//! Prefilled → ForwardPass → Sampled → Added cycle, dispatching every event
//! to the request's mods and applying what they return.
//!
//! Each event type acts as a barrier: every active request finishes dispatch
//! for it before the next phase starts. All per-request state lives in the
//! pass's [`BatchState`].

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use gantry_core::{
    Event, FinishReason, ForwardModel, GantryError, InferenceRequest, RequestOutput, Result,
    SampleInput, Sampler, SeqInput, TerminalKind, Tokenizer,
};
use gantry_scheduler::{BatchQueue, BatchState, RequestPhase, RequestState};

use crate::actions::{ActionProcessor, StepOutcome};
use crate::config::EngineConfig;
use crate::dispatch::{ModDispatcher, StampedEvent};
use crate::mods::ModRegistry;
use crate::trace::{EventRecord, NullSink, TraceRecord, TraceSink};

/// Messages accepted by [`Engine::run`].
pub enum EngineCommand {
    Submit(InferenceRequest),
    /// Replace the mod registry. Takes effect from the next pass.
    SwapMods(ModRegistry),
    /// Drop a request that is still queued.
    Cancel(String),
    /// Finish queued work, then stop.
    Shutdown,
}

/// Results emitted by [`Engine::run`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Finished(RequestOutput),
    /// A queued request was cancelled before it was scheduled.
    Cancelled { request_id: String },
    Error { request_id: String, error: String },
}

pub struct Engine<M: ForwardModel, S: Sampler> {
    model: M,
    sampler: S,
    tokenizer: Arc<dyn Tokenizer>,
    mods: ModRegistry,
    config: EngineConfig,
    dispatcher: ModDispatcher,
    processor: ActionProcessor,
    /// `max_request_tokens`, capped by what the model cache holds.
    max_request_tokens: usize,
    trace: Box<dyn TraceSink>,
}

impl<M: ForwardModel, S: Sampler> Engine<M, S> {
    pub fn new(
        model: M,
        sampler: S,
        tokenizer: Arc<dyn Tokenizer>,
        mods: ModRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let max_request_tokens = model
            .max_positions()
            .map_or(config.max_request_tokens, |p| p.min(config.max_request_tokens));
        let processor = ActionProcessor::new(model.vocab_size())
            .with_limits(config.max_prompt_tokens, max_request_tokens);
        Ok(Self {
            model,
            sampler,
            tokenizer,
            mods,
            dispatcher: ModDispatcher::new(config.mod_error_policy),
            processor,
            max_request_tokens,
            config,
            trace: Box::new(NullSink),
        })
    }

    pub fn with_trace(mut self, sink: impl TraceSink + 'static) -> Self {
        self.trace = Box::new(sink);
        self
    }

    pub fn set_trace(&mut self, sink: Box<dyn TraceSink>) {
        self.trace = sink;
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token budget each request is held to.
    pub fn max_request_tokens(&self) -> usize {
        self.max_request_tokens
    }

    pub fn mods(&self) -> &ModRegistry {
        &self.mods
    }

    /// Install a new registry with the next version number and return the old one.
    pub fn swap_mods(&mut self, mut registry: ModRegistry) -> ModRegistry {
        registry.set_version(self.mods.version() + 1);
        info!(
            version = registry.version(),
            mods = ?registry.names(),
            "mod registry swapped"
        );
        std::mem::replace(&mut self.mods, registry)
    }

    /// Validate a request against the engine limits and resolve its mods.
    pub fn check_request(&self, request: &InferenceRequest) -> Result<Vec<usize>> {
        if request.prompt_tokens.is_empty() {
            return Err(GantryError::InvalidArgument(format!(
                "request {} has an empty prompt",
                request.request_id
            )));
        }
        if request.prompt_tokens.len() > self.config.max_prompt_tokens {
            return Err(GantryError::InvalidArgument(format!(
                "request {} prompt has {} tokens, limit is {}",
                request.request_id,
                request.prompt_tokens.len(),
                self.config.max_prompt_tokens
            )));
        }
        if request.prompt_tokens.len() > self.max_request_tokens {
            return Err(GantryError::InvalidArgument(format!(
                "request {} prompt has {} tokens, model holds {} per request",
                request.request_id,
                request.prompt_tokens.len(),
                self.max_request_tokens
            )));
        }
        if request.max_steps == Some(0) {
            return Err(GantryError::InvalidArgument(format!(
                "request {} has max_steps of zero",
                request.request_id
            )));
        }
        self.mods.resolve(request.mods.as_deref())
    }

    /// Run one scheduling pass to completion.
    ///
    /// Mod failures, illegal actions and backtrack overflows only affect
    /// their own request. A model or sampler failure aborts the whole pass.
    pub fn run_pass(&mut self, requests: Vec<InferenceRequest>) -> Result<Vec<RequestOutput>> {
        let mut batch = self.admit(requests)?;
        let started = Instant::now();
        info!(
            requests = batch.len(),
            mods_version = self.mods.version(),
            "scheduling pass started"
        );

        let result = self.drive(&mut batch);
        for state in batch.iter() {
            if let Err(e) = self.model.release(&state.request_id) {
                warn!(request_id = %state.request_id, error = %e, "failed to release model cache");
            }
        }
        if let Err(e) = result {
            error!(error = %e, step = batch.step, "scheduling pass failed");
            self.trace.flush();
            return Err(e);
        }

        let steps = batch.step;
        let outputs: Vec<RequestOutput> = batch
            .into_requests()
            .into_iter()
            .map(|state| self.finalize(state))
            .collect();
        for output in &outputs {
            self.trace.record(TraceRecord::Request(output.clone()));
        }
        self.trace.flush();
        info!(
            requests = outputs.len(),
            steps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scheduling pass finished"
        );
        Ok(outputs)
    }

    /// Serve commands until `Shutdown` (or the sender is dropped) and the
    /// queue is drained.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<()> {
        let mut queue = BatchQueue::new(self.config.queue_config());
        let mut accepting = true;
        loop {
            if queue.is_empty() {
                if !accepting {
                    break;
                }
                match commands.recv().await {
                    Some(command) => {
                        accepting = self.handle_command(command, &mut queue, &events).await
                    }
                    None => accepting = false,
                }
            }
            while accepting {
                match commands.try_recv() {
                    Ok(command) => {
                        accepting = self.handle_command(command, &mut queue, &events).await
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => accepting = false,
                }
            }

            let requests = queue.next_batch();
            if !requests.is_empty() {
                self.serve_batch(requests, &events).await;
            }
        }
        info!("engine loop stopped");
        Ok(())
    }

    /// Returns whether the loop keeps accepting commands.
    async fn handle_command(
        &mut self,
        command: EngineCommand,
        queue: &mut BatchQueue,
        events: &mpsc::Sender<EngineEvent>,
    ) -> bool {
        match command {
            EngineCommand::Submit(request) => {
                let request_id = request.request_id.clone();
                let admitted = self
                    .check_request(&request)
                    .and_then(|_| queue.enqueue(request));
                if let Err(e) = admitted {
                    warn!(request_id = %request_id, error = %e, "request rejected");
                    let _ = events
                        .send(EngineEvent::Error {
                            request_id,
                            error: e.to_string(),
                        })
                        .await;
                }
                true
            }
            EngineCommand::SwapMods(registry) => {
                self.swap_mods(registry);
                true
            }
            EngineCommand::Cancel(request_id) => {
                let event = match queue.cancel(&request_id) {
                    Ok(_) => {
                        info!(request_id = %request_id, "queued request cancelled");
                        EngineEvent::Cancelled { request_id }
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "cancel failed");
                        EngineEvent::Error {
                            request_id,
                            error: e.to_string(),
                        }
                    }
                };
                let _ = events.send(event).await;
                true
            }
            EngineCommand::Shutdown => {
                info!(queued = queue.len(), "shutdown requested, draining queue");
                false
            }
        }
    }

    async fn serve_batch(
        &mut self,
        requests: Vec<InferenceRequest>,
        events: &mpsc::Sender<EngineEvent>,
    ) {
        // The registry may have been swapped since these were queued.
        let mut admitted = Vec::with_capacity(requests.len());
        for request in requests {
            match self.check_request(&request) {
                Ok(_) => admitted.push(request),
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "request rejected");
                    let _ = events
                        .send(EngineEvent::Error {
                            request_id: request.request_id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
        if admitted.is_empty() {
            return;
        }

        let ids: Vec<String> = admitted.iter().map(|r| r.request_id.clone()).collect();
        match self.run_pass(admitted) {
            Ok(outputs) => {
                for output in outputs {
                    if events.send(EngineEvent::Finished(output)).await.is_err() {
                        debug!("event receiver dropped");
                    }
                }
            }
            Err(e) => {
                for request_id in ids {
                    let _ = events
                        .send(EngineEvent::Error {
                            request_id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    fn admit(&self, requests: Vec<InferenceRequest>) -> Result<BatchState> {
        if requests.len() > self.config.max_batch_size {
            return Err(GantryError::InvalidArgument(format!(
                "batch of {} requests exceeds max_batch_size {}",
                requests.len(),
                self.config.max_batch_size
            )));
        }
        let eos = if self.config.stop_on_eos {
            self.tokenizer.eos_token_id()
        } else {
            None
        };

        let mut batch = BatchState::new();
        for mut request in requests {
            let mod_ids = self.check_request(&request)?;
            if let Some(eos) = eos {
                let stops = &mut request.sampling_params.stop_token_ids;
                if !stops.contains(&eos) {
                    stops.push(eos);
                }
            }
            batch.insert(RequestState::new(
                request,
                mod_ids,
                self.config.default_max_steps,
            ))?;
        }
        Ok(batch)
    }

    fn drive(&mut self, batch: &mut BatchState) -> Result<()> {
        for state in batch.iter_mut() {
            state.begin_prefill();
        }
        loop {
            let active = batch.active_ids();
            if active.is_empty() {
                return Ok(());
            }
            debug!(step = batch.step, active = active.len(), "step started");

            for id in &active {
                self.fire_prefilled(batch, id);
            }

            let active = batch.active_ids();
            if active.is_empty() {
                return Ok(());
            }
            self.forward_step(batch, &active)?;

            let to_sample: Vec<String> = active
                .iter()
                .filter(|id| {
                    batch.get(id).is_some_and(|s| {
                        s.is_active() && !s.scratch.consumed && !s.has_forced()
                    })
                })
                .cloned()
                .collect();
            self.sample_step(batch, &to_sample)?;
            for id in &to_sample {
                self.fire_sampled(batch, id);
            }

            for id in &active {
                self.commit(batch, id);
            }
            self.end_step(batch, &active);
        }
    }

    /// Stamp an event, dispatch it and apply the resulting actions.
    fn fire(&mut self, batch: &mut BatchState, event: Event) -> StepOutcome {
        let sequence_order = batch.next_sequence_order();
        self.trace.record(TraceRecord::Event(EventRecord::new(
            &event,
            sequence_order,
            &*self.tokenizer,
            self.config.trace_top_tokens,
        )));
        let stamped = StampedEvent {
            sequence_order,
            event,
        };
        let proposed = self.dispatcher.dispatch(
            &stamped,
            &mut self.mods,
            batch,
            &*self.tokenizer,
            &mut *self.trace,
        );
        match batch.get_mut(stamped.event.request_id()) {
            Some(state) => {
                self.processor
                    .apply_all(proposed, stamped.event.kind(), state, &mut *self.trace)
            }
            None => StepOutcome::Continue,
        }
    }

    fn fire_prefilled(&mut self, batch: &mut BatchState, id: &str) {
        let event = match batch.get(id) {
            Some(state) if state.is_active() => Event::Prefilled {
                request_id: id.to_string(),
                step: state.step,
                prompt_tokens: state.prompt_tokens.clone(),
                tokens_so_far_len: state.total_len(),
                max_steps: state.max_steps,
            },
            _ => return,
        };
        self.fire(batch, event);
    }

    /// Bring each cache in line with its history and run one batched forward.
    ///
    /// Positions the cache holds past the surviving history (after a
    /// backtrack) are rewound first. If nothing new would be fed, the last
    /// history token is rewound and fed again so the model has an input.
    fn forward_step(&mut self, batch: &mut BatchState, active: &[String]) -> Result<()> {
        let mut inputs = Vec::with_capacity(active.len());
        for id in active {
            let state = batch
                .get_mut(id)
                .ok_or_else(|| GantryError::RequestNotFound(id.clone()))?;
            let history_len = state.total_len();
            let mut keep = state.fed_len.min(history_len);
            if keep == history_len {
                keep = history_len.saturating_sub(1);
            }
            let rewind = state.fed_len - keep;
            if rewind > 0 {
                self.model.rewind_cache(id, rewind)?;
                debug!(
                    request_id = %id,
                    rewind,
                    pending_rewind = state.rewind_offset(),
                    "model cache rewound"
                );
            }
            state.pending_rewind = None;
            inputs.push(SeqInput {
                request_id: id.clone(),
                tokens: state.history_from(keep),
                position_offset: keep,
                is_prefill: state.phase == RequestPhase::Prefilling,
            });
            state.fed_len = history_len;
        }

        let rows = self.model.forward(&inputs)?;
        if rows.len() != inputs.len() {
            return Err(GantryError::Model(format!(
                "forward returned {} rows for {} inputs",
                rows.len(),
                inputs.len()
            )));
        }

        let vocab_size = self.model.vocab_size();
        for (id, row) in active.iter().zip(rows) {
            if row.len() != vocab_size {
                return Err(GantryError::Model(format!(
                    "logits row for {id} has {} entries, vocabulary has {vocab_size}",
                    row.len()
                )));
            }
            let step = match batch.get_mut(id) {
                Some(state) => {
                    state.begin_generating();
                    state.scratch.logits = Some(row.clone());
                    state.step
                }
                None => continue,
            };
            self.fire(
                batch,
                Event::ForwardPass {
                    request_id: id.clone(),
                    step,
                    logits: row,
                },
            );
        }
        Ok(())
    }

    fn sample_step(&mut self, batch: &mut BatchState, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let histories: Vec<Vec<u32>> = ids
            .iter()
            .map(|id| batch.get(id).map(RequestState::history).unwrap_or_default())
            .collect();

        let results = {
            let mut inputs = Vec::with_capacity(ids.len());
            for (id, history) in ids.iter().zip(&histories) {
                let state = batch
                    .get(id)
                    .ok_or_else(|| GantryError::RequestNotFound(id.clone()))?;
                let logits = state
                    .scratch
                    .adjusted_logits
                    .as_deref()
                    .or(state.scratch.logits.as_deref())
                    .ok_or_else(|| GantryError::Internal(format!("no logits for request {id}")))?;
                inputs.push(SampleInput {
                    request_id: id,
                    logits,
                    params: &state.sampling_params,
                    temperature_override: state.scratch.token_temp,
                    history,
                    step: state.step,
                });
            }
            self.sampler.sample(&inputs)?
        };
        if results.len() != ids.len() {
            return Err(GantryError::Sampler(format!(
                "sampler returned {} tokens for {} requests",
                results.len(),
                ids.len()
            )));
        }

        for (id, result) in ids.iter().zip(results) {
            if let Some(state) = batch.get_mut(id) {
                state.scratch.sampled = Some(result.token_id);
            }
        }
        Ok(())
    }

    fn fire_sampled(&mut self, batch: &mut BatchState, id: &str) {
        let event = match batch.get(id) {
            Some(state) if state.is_active() && !state.scratch.consumed => {
                match state.scratch.sampled {
                    Some(sampled_token) => Event::Sampled {
                        request_id: id.to_string(),
                        step: state.step,
                        sampled_token,
                    },
                    None => return,
                }
            }
            _ => return,
        };
        self.fire(batch, event);
    }

    /// Append this step's tokens: the whole forced queue if anything is
    /// queued, otherwise the sampled token. Then dispatch `Added`.
    fn commit(&mut self, batch: &mut BatchState, id: &str) {
        let Some(state) = batch.get_mut(id) else {
            return;
        };
        if !state.is_active() || state.scratch.consumed {
            return;
        }
        let (tokens, forced) = if state.has_forced() {
            (state.take_forced(), true)
        } else if let Some(token) = state.scratch.sampled {
            (vec![token], false)
        } else {
            return;
        };
        state.generated_tokens.extend_from_slice(&tokens);
        let hit_stop = tokens.iter().any(|&t| state.is_stop_token(t));
        let step = state.step;

        self.fire(
            batch,
            Event::Added {
                request_id: id.to_string(),
                step,
                added_tokens: tokens,
                forced,
            },
        );

        if hit_stop {
            if let Some(state) = batch.get_mut(id) {
                if state.is_active() && !state.scratch.consumed {
                    state.finish(TerminalKind::Completed, FinishReason::StopToken);
                    debug!(request_id = %id, step, "stop token committed");
                }
            }
        }
    }

    fn end_step(&mut self, batch: &mut BatchState, active: &[String]) {
        for id in active {
            let Some(state) = batch.get_mut(id) else {
                continue;
            };
            if !state.is_active() {
                continue;
            }
            state.step += 1;
            state.reset_step();
            if state.step >= state.max_steps {
                state.finish(TerminalKind::Completed, FinishReason::MaxSteps);
                debug!(request_id = %id, steps = state.step, "step budget exhausted");
            } else if state.total_len() >= self.max_request_tokens {
                state.finish(TerminalKind::Completed, FinishReason::Length);
                debug!(request_id = %id, tokens = state.total_len(), "token budget exhausted");
            }
        }
        batch.step += 1;
    }

    fn finalize(&self, mut state: RequestState) -> RequestOutput {
        if !state.is_done {
            state.finish(TerminalKind::Completed, FinishReason::MaxSteps);
        }
        let token_ids = match state.terminal_kind {
            TerminalKind::ForcedOutput => state.forced_output.take().unwrap_or_default(),
            TerminalKind::ToolCalled => Vec::new(),
            _ if self.config.strip_stop_tokens => state
                .generated_tokens
                .iter()
                .copied()
                .filter(|&t| !state.is_stop_token(t))
                .collect(),
            _ => state.generated_tokens.clone(),
        };
        let text = match state.terminal_kind {
            TerminalKind::ToolCalled => None,
            _ => match self.tokenizer.decode(&token_ids) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(request_id = %state.request_id, error = %e, "failed to decode output");
                    None
                }
            },
        };
        RequestOutput {
            request_id: state.request_id,
            terminal: state.terminal_kind,
            finish_reason: state.finish_reason.unwrap_or(FinishReason::MaxSteps),
            token_ids,
            text,
            tool_calls: state.tool_calls,
            error: state.error,
            steps: state.step,
            prompt_len: state.prompt_tokens.len(),
        }
    }
}
