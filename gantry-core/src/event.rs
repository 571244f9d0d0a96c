//! Generation events fired to mods, and the actions mods answer with.
//!
//! Every step of a request produces the same cycle of events: `Prefilled`
//! (re-fired at the start of every step), `ForwardPass`, `Sampled` and
//! `Added`. Which actions a mod may return depends on the event it is
//! answering; see [`EventKind::allows`].

use serde::Serialize;
use serde_json::{json, Value};

/// Maximum number of token ids rendered into action details.
pub const MAX_TOKEN_PREVIEW: usize = 128;
/// Tool payloads are truncated to this many characters in action details.
pub const MAX_TOOL_PAYLOAD_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Prefilled,
    ForwardPass,
    Sampled,
    Added,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Prefilled => "Prefilled",
            EventKind::ForwardPass => "ForwardPass",
            EventKind::Sampled => "Sampled",
            EventKind::Added => "Added",
        }
    }

    /// Whether `action` may be returned in response to this event.
    ///
    /// `EmitError` is accepted everywhere. `AdjustPrefill` is only meaningful
    /// before the first forward pass, `AdjustLogits` only while logits exist.
    pub fn allows(&self, action: ActionKind) -> bool {
        use ActionKind::*;
        match self {
            EventKind::Prefilled => matches!(
                action,
                Noop | AdjustPrefill | ForceOutput | ToolCalls | EmitError
            ),
            EventKind::ForwardPass => matches!(
                action,
                Noop | ForceTokens | AdjustLogits | Backtrack | ForceOutput | ToolCalls | EmitError
            ),
            EventKind::Sampled | EventKind::Added => matches!(
                action,
                Noop | ForceTokens | Backtrack | ForceOutput | ToolCalls | EmitError
            ),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Prefilled {
        request_id: String,
        step: usize,
        prompt_tokens: Vec<u32>,
        tokens_so_far_len: usize,
        max_steps: usize,
    },
    ForwardPass {
        request_id: String,
        step: usize,
        logits: Vec<f32>,
    },
    Sampled {
        request_id: String,
        step: usize,
        sampled_token: u32,
    },
    Added {
        request_id: String,
        step: usize,
        added_tokens: Vec<u32>,
        forced: bool,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Prefilled { .. } => EventKind::Prefilled,
            Event::ForwardPass { .. } => EventKind::ForwardPass,
            Event::Sampled { .. } => EventKind::Sampled,
            Event::Added { .. } => EventKind::Added,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Event::Prefilled { request_id, .. }
            | Event::ForwardPass { request_id, .. }
            | Event::Sampled { request_id, .. }
            | Event::Added { request_id, .. } => request_id,
        }
    }

    pub fn step(&self) -> usize {
        match self {
            Event::Prefilled { step, .. }
            | Event::ForwardPass { step, .. }
            | Event::Sampled { step, .. }
            | Event::Added { step, .. } => *step,
        }
    }

    /// Top `k` tokens by log-probability for a `ForwardPass`; empty for other events.
    pub fn top_k_logprobs(&self, k: usize) -> Vec<(u32, f32)> {
        match self {
            Event::ForwardPass { logits, .. } => top_k_logprobs(logits, k),
            _ => Vec::new(),
        }
    }
}

/// Log-softmax over `logits`, returning the `k` most likely `(token_id, logprob)`
/// pairs in descending order.
pub fn top_k_logprobs(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    if logits.is_empty() || k == 0 {
        return Vec::new();
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;

    let mut indexed: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i as u32, l - log_sum))
        .collect();
    let k = k.min(indexed.len());
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, |a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
        });
        indexed.truncate(k);
    }
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionKind {
    Noop,
    AdjustPrefill,
    ForceTokens,
    AdjustLogits,
    Backtrack,
    ForceOutput,
    ToolCalls,
    EmitError,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Noop => "Noop",
            ActionKind::AdjustPrefill => "AdjustPrefill",
            ActionKind::ForceTokens => "ForceTokens",
            ActionKind::AdjustLogits => "AdjustLogits",
            ActionKind::Backtrack => "Backtrack",
            ActionKind::ForceOutput => "ForceOutput",
            ActionKind::ToolCalls => "ToolCalls",
            ActionKind::EmitError => "EmitError",
        }
    }

    /// Actions that end the request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionKind::ForceOutput | ActionKind::ToolCalls | ActionKind::EmitError
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Noop,
    AdjustPrefill {
        tokens: Vec<u32>,
        max_steps: Option<usize>,
    },
    ForceTokens {
        tokens: Vec<u32>,
    },
    AdjustLogits {
        logits: Vec<f32>,
        token_temp: Option<f32>,
    },
    Backtrack {
        n: usize,
        replacement_tokens: Option<Vec<u32>>,
    },
    ForceOutput {
        tokens: Vec<u32>,
    },
    ToolCalls {
        payload: Value,
    },
    EmitError {
        message: String,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Noop => ActionKind::Noop,
            Action::AdjustPrefill { .. } => ActionKind::AdjustPrefill,
            Action::ForceTokens { .. } => ActionKind::ForceTokens,
            Action::AdjustLogits { .. } => ActionKind::AdjustLogits,
            Action::Backtrack { .. } => ActionKind::Backtrack,
            Action::ForceOutput { .. } => ActionKind::ForceOutput,
            Action::ToolCalls { .. } => ActionKind::ToolCalls,
            Action::EmitError { .. } => ActionKind::EmitError,
        }
    }

    /// Bounded JSON rendering of the action's arguments for trace records.
    pub fn details(&self) -> Value {
        match self {
            Action::Noop => json!({}),
            Action::AdjustPrefill { tokens, max_steps } => json!({
                "tokens": token_preview(tokens),
                "token_count": tokens.len(),
                "max_steps": max_steps,
            }),
            Action::ForceTokens { tokens } | Action::ForceOutput { tokens } => json!({
                "tokens": token_preview(tokens),
                "token_count": tokens.len(),
            }),
            Action::AdjustLogits { logits, token_temp } => json!({
                "logits_len": logits.len(),
                "token_temp": token_temp,
            }),
            Action::Backtrack {
                n,
                replacement_tokens,
            } => json!({
                "n": n,
                "replacement_tokens": replacement_tokens.as_deref().map(token_preview),
            }),
            Action::ToolCalls { payload } => {
                let rendered = payload.to_string();
                let truncated = rendered.chars().count() > MAX_TOOL_PAYLOAD_CHARS;
                let text: String = rendered.chars().take(MAX_TOOL_PAYLOAD_CHARS).collect();
                json!({ "payload": text, "truncated": truncated })
            }
            Action::EmitError { message } => json!({ "message": message }),
        }
    }
}

fn token_preview(tokens: &[u32]) -> Value {
    if tokens.len() <= MAX_TOKEN_PREVIEW {
        json!(tokens)
    } else {
        json!(&tokens[..MAX_TOKEN_PREVIEW])
    }
}
