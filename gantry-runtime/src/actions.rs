//! Applies legal actions to a request's state.

use gantry_core::{Action, EventKind};
use gantry_scheduler::{RequestPhase, RequestState};
use tracing::{debug, error, info, warn};

use crate::backtrack::BacktrackCoordinator;
use crate::dispatch::ProposedAction;
use crate::trace::{ActionDisposition, ActionRecord, TraceRecord, TraceSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// The request finished or its step was consumed; later actions are skipped.
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResult {
    pub outcome: StepOutcome,
    pub disposition: ActionDisposition,
    pub reason: Option<String>,
}

impl ApplyResult {
    fn applied(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            disposition: ActionDisposition::Applied,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Continue,
            disposition: ActionDisposition::Rejected,
            reason: Some(reason.into()),
        }
    }
}

pub struct ActionProcessor {
    vocab_size: usize,
    max_prompt_tokens: usize,
    /// Prompt plus generated plus queued forced tokens allowed per request.
    max_request_tokens: usize,
    backtrack: BacktrackCoordinator,
}

impl ActionProcessor {
    /// A processor with no length limits.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            max_prompt_tokens: usize::MAX,
            max_request_tokens: usize::MAX,
            backtrack: BacktrackCoordinator::new(),
        }
    }

    pub fn with_limits(mut self, max_prompt_tokens: usize, max_request_tokens: usize) -> Self {
        self.max_prompt_tokens = max_prompt_tokens;
        self.max_request_tokens = max_request_tokens;
        self
    }

    fn out_of_vocab(&self, tokens: &[u32]) -> Option<String> {
        tokens
            .iter()
            .find(|&&t| t as usize >= self.vocab_size)
            .map(|t| format!("token {t} is outside the vocabulary of {}", self.vocab_size))
    }

    /// `Some` if `kept` history tokens, the forced queue and `extra` queued
    /// tokens would not fit in the request budget.
    fn over_budget(&self, state: &RequestState, kept: usize, extra: usize) -> Option<String> {
        let needed = kept + state.forced_queue.len() + extra;
        (needed > self.max_request_tokens).then(|| {
            format!(
                "request {} would hold {needed} tokens, budget is {}",
                state.request_id, self.max_request_tokens
            )
        })
    }

    /// End the request as `Errored`; the action is recorded as rejected.
    fn fail(&self, state: &mut RequestState, message: String) -> ApplyResult {
        error!(request_id = %state.request_id, step = state.step, error = %message, "action failed, request errored");
        state.fail(message.clone());
        ApplyResult {
            outcome: StepOutcome::Terminal,
            disposition: ActionDisposition::Rejected,
            reason: Some(message),
        }
    }

    pub fn apply(&self, action: &Action, event: EventKind, state: &mut RequestState) -> ApplyResult {
        if state.is_done {
            return ApplyResult::rejected("request already finished");
        }
        match action {
            Action::Noop => ApplyResult::applied(StepOutcome::Continue),
            Action::AdjustPrefill { tokens, max_steps } => {
                if state.phase != RequestPhase::Prefilling {
                    return ApplyResult::rejected(
                        "AdjustPrefill is only honored before the first forward pass",
                    );
                }
                if !tokens.is_empty() {
                    if let Some(reason) = self.out_of_vocab(tokens) {
                        return ApplyResult::rejected(reason);
                    }
                    if tokens.len() > self.max_prompt_tokens {
                        return ApplyResult::rejected(format!(
                            "AdjustPrefill prompt has {} tokens, limit is {}",
                            tokens.len(),
                            self.max_prompt_tokens
                        ));
                    }
                    let kept = tokens.len() + state.generated_tokens.len();
                    if let Some(reason) = self.over_budget(state, kept, 0) {
                        return ApplyResult::rejected(reason);
                    }
                    state.prompt_tokens = tokens.clone();
                }
                if let Some(max_steps) = max_steps.filter(|&m| m > 0) {
                    state.max_steps = max_steps;
                }
                ApplyResult::applied(StepOutcome::Continue)
            }
            Action::ForceTokens { tokens } => {
                if let Some(reason) = self.out_of_vocab(tokens) {
                    return ApplyResult::rejected(reason);
                }
                if let Some(reason) = self.over_budget(state, state.total_len(), tokens.len()) {
                    return self.fail(state, reason);
                }
                state.enqueue_forced(tokens);
                ApplyResult::applied(StepOutcome::Continue)
            }
            Action::AdjustLogits { logits, token_temp } => {
                if logits.len() != self.vocab_size {
                    return ApplyResult::rejected(format!(
                        "AdjustLogits carries {} logits, vocabulary has {}",
                        logits.len(),
                        self.vocab_size
                    ));
                }
                if let Some(bad) = logits.iter().find(|l| !l.is_finite()) {
                    return ApplyResult::rejected(format!(
                        "AdjustLogits carries non-finite logit {bad}"
                    ));
                }
                if let Some(t) = token_temp {
                    if !t.is_finite() || *t < 0.0 {
                        return ApplyResult::rejected(format!("invalid token_temp {t}"));
                    }
                }
                state.scratch.adjusted_logits = Some(logits.clone());
                state.scratch.token_temp = *token_temp;
                ApplyResult::applied(StepOutcome::Continue)
            }
            Action::Backtrack {
                n,
                replacement_tokens,
            } => {
                let replacement = replacement_tokens.as_deref().unwrap_or_default();
                if let Some(reason) = self.out_of_vocab(replacement) {
                    return ApplyResult::rejected(reason);
                }
                if *n <= state.generated_tokens.len() {
                    let kept = state.total_len() - n;
                    if let Some(reason) = self.over_budget(state, kept, replacement.len()) {
                        return self.fail(state, reason);
                    }
                }
                match self
                    .backtrack
                    .backtrack(*n, replacement_tokens.as_deref(), state)
                {
                    Ok(()) => ApplyResult::applied(StepOutcome::Terminal),
                    Err(e) => self.fail(state, e.to_string()),
                }
            }
            Action::ForceOutput { tokens } => {
                if let Some(reason) = self.out_of_vocab(tokens) {
                    return ApplyResult::rejected(reason);
                }
                state.finish_with_output(tokens.clone());
                ApplyResult::applied(StepOutcome::Terminal)
            }
            Action::ToolCalls { payload } => {
                state.finish_with_tool_calls(payload.clone());
                ApplyResult::applied(StepOutcome::Terminal)
            }
            Action::EmitError { message } => {
                error!(request_id = %state.request_id, step = state.step, event = %event, error = %message, "request errored");
                state.fail(message.clone());
                ApplyResult::applied(StepOutcome::Terminal)
            }
        }
    }

    /// Apply the actions of one event in order, recording each disposition.
    /// A terminal outcome stops application; the remaining actions are
    /// recorded as skipped.
    pub fn apply_all(
        &self,
        proposed: Vec<ProposedAction>,
        event: EventKind,
        state: &mut RequestState,
        trace: &mut dyn TraceSink,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::Continue;
        for p in proposed {
            let result = if outcome == StepOutcome::Terminal {
                ApplyResult {
                    outcome,
                    disposition: ActionDisposition::Skipped,
                    reason: Some("an earlier action ended the step".to_string()),
                }
            } else {
                self.apply(&p.action, event, state)
            };

            match result.disposition {
                ActionDisposition::Applied if p.action.kind().is_terminal() => {
                    info!(request_id = %state.request_id, mod_name = %p.mod_name, action = %p.action.kind(), terminal = ?state.terminal_kind, "request ended by mod")
                }
                ActionDisposition::Applied => {
                    debug!(request_id = %state.request_id, mod_name = %p.mod_name, action = %p.action.kind(), "action applied")
                }
                ActionDisposition::Rejected => {
                    warn!(request_id = %state.request_id, mod_name = %p.mod_name, action = %p.action.kind(), reason = ?result.reason, "action rejected")
                }
                ActionDisposition::Skipped => {}
            }

            trace.record(TraceRecord::Action(ActionRecord {
                mod_call_index: p.mod_call_index,
                request_id: state.request_id.clone(),
                mod_name: p.mod_name,
                action_type: p.action.kind().to_string(),
                action_order: p.action_order,
                disposition: result.disposition,
                reason: result.reason,
                details: p.action.details(),
            }));
            outcome = result.outcome;
        }
        outcome
    }
}
