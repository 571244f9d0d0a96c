use std::collections::VecDeque;

use gantry_core::{FinishReason, InferenceRequest, SamplingParams, TerminalKind};
use serde::Serialize;
use serde_json::Value;

/// Lifecycle of a request within one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestPhase {
    /// Admitted, no event fired yet.
    Created,
    /// `Prefilled` has fired but the model has not seen the prompt.
    Prefilling,
    Generating,
    /// Terminal. No further events are dispatched.
    Finished,
}

/// State that only lives for the duration of one step.
#[derive(Debug, Default)]
pub struct StepScratch {
    /// Logits row produced by this step's forward pass.
    pub logits: Option<Vec<f32>>,
    /// Replacement logits from `AdjustLogits`.
    pub adjusted_logits: Option<Vec<f32>>,
    pub token_temp: Option<f32>,
    pub sampled: Option<u32>,
    /// Set by a backtrack: nothing more is sampled or committed this step.
    pub consumed: bool,
}

#[derive(Debug)]
pub struct RequestState {
    pub request_id: String,
    pub prompt_tokens: Vec<u32>,
    pub generated_tokens: Vec<u32>,
    pub sampling_params: SamplingParams,
    /// Registry indices of the mods attached to this request, in dispatch order.
    pub mod_ids: Vec<usize>,
    pub step: usize,
    pub max_steps: usize,
    pub phase: RequestPhase,
    pub is_done: bool,
    pub terminal_kind: TerminalKind,
    pub finish_reason: Option<FinishReason>,
    pub forced_queue: VecDeque<u32>,
    /// Tokens removed by backtracks since the last forward pass. Recorded for
    /// tracing only: the engine derives the actual cache rewind from
    /// `fed_len`, because the last committed token may never have been fed.
    pub pending_rewind: Option<usize>,
    pub mod_call_sequence: u64,
    /// Number of history tokens the model cache has ingested.
    pub fed_len: usize,
    pub forced_output: Option<Vec<u32>>,
    pub tool_calls: Option<Value>,
    pub error: Option<String>,
    pub scratch: StepScratch,
}

impl RequestState {
    pub fn new(request: InferenceRequest, mod_ids: Vec<usize>, default_max_steps: usize) -> Self {
        Self {
            request_id: request.request_id,
            prompt_tokens: request.prompt_tokens,
            generated_tokens: Vec::new(),
            sampling_params: request.sampling_params,
            mod_ids,
            step: 0,
            max_steps: request.max_steps.unwrap_or(default_max_steps),
            phase: RequestPhase::Created,
            is_done: false,
            terminal_kind: TerminalKind::None,
            finish_reason: None,
            forced_queue: VecDeque::new(),
            pending_rewind: None,
            mod_call_sequence: 0,
            fed_len: 0,
            forced_output: None,
            tool_calls: None,
            error: None,
            scratch: StepScratch::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_done
    }

    pub fn total_len(&self) -> usize {
        self.prompt_tokens.len() + self.generated_tokens.len()
    }

    /// Prompt followed by generated tokens.
    pub fn history(&self) -> Vec<u32> {
        let mut all = Vec::with_capacity(self.total_len());
        all.extend_from_slice(&self.prompt_tokens);
        all.extend_from_slice(&self.generated_tokens);
        all
    }

    /// History tokens from position `start` onwards.
    pub fn history_from(&self, start: usize) -> Vec<u32> {
        let prompt_len = self.prompt_tokens.len();
        if start >= prompt_len {
            let offset = (start - prompt_len).min(self.generated_tokens.len());
            return self.generated_tokens[offset..].to_vec();
        }
        let mut tail = self.prompt_tokens[start..].to_vec();
        tail.extend_from_slice(&self.generated_tokens);
        tail
    }

    /// Tokens removed by backtracks since the last forward pass.
    pub fn rewind_offset(&self) -> usize {
        self.pending_rewind.unwrap_or(0)
    }

    pub fn enqueue_forced(&mut self, tokens: &[u32]) {
        self.forced_queue.extend(tokens.iter().copied());
    }

    pub fn has_forced(&self) -> bool {
        !self.forced_queue.is_empty()
    }

    /// Drain the whole forced queue.
    pub fn take_forced(&mut self) -> Vec<u32> {
        self.forced_queue.drain(..).collect()
    }

    /// Next per-request mod-call sequence number.
    pub fn next_mod_call(&mut self) -> u64 {
        let seq = self.mod_call_sequence;
        self.mod_call_sequence += 1;
        seq
    }

    pub fn begin_prefill(&mut self) {
        if self.phase == RequestPhase::Created {
            self.phase = RequestPhase::Prefilling;
        }
    }

    pub fn begin_generating(&mut self) {
        if self.phase == RequestPhase::Prefilling {
            self.phase = RequestPhase::Generating;
        }
    }

    /// Clear per-step scratch before the next step.
    pub fn reset_step(&mut self) {
        self.scratch = StepScratch::default();
    }

    pub fn is_stop_token(&self, token: u32) -> bool {
        self.sampling_params.stop_token_ids.contains(&token)
    }

    /// Move to a terminal state. Returns `false` if the request already was
    /// terminal, in which case nothing changes.
    pub fn finish(&mut self, kind: TerminalKind, reason: FinishReason) -> bool {
        if self.is_done {
            return false;
        }
        self.is_done = true;
        self.phase = RequestPhase::Finished;
        self.terminal_kind = kind;
        self.finish_reason = Some(reason);
        self.forced_queue.clear();
        true
    }

    pub fn finish_with_output(&mut self, tokens: Vec<u32>) -> bool {
        let finished = self.finish(TerminalKind::ForcedOutput, FinishReason::ForcedOutput);
        if finished {
            self.forced_output = Some(tokens);
        }
        finished
    }

    pub fn finish_with_tool_calls(&mut self, payload: Value) -> bool {
        let finished = self.finish(TerminalKind::ToolCalled, FinishReason::ToolCalls);
        if finished {
            self.tool_calls = Some(payload);
        }
        finished
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let finished = self.finish(TerminalKind::Errored, FinishReason::Error);
        if finished {
            self.error = Some(message.into());
        }
        finished
    }
}
