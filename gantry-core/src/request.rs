use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FinishReason, SamplingParams, TerminalKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: String,
    pub prompt_tokens: Vec<u32>,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    /// Falls back to the engine's `default_max_steps`.
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Names of the mods to attach; `None` attaches every registered mod.
    #[serde(default)]
    pub mods: Option<Vec<String>>,
}

impl InferenceRequest {
    pub fn new(request_id: impl Into<String>, prompt_tokens: Vec<u32>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt_tokens,
            sampling_params: SamplingParams::default(),
            max_steps: None,
            mods: None,
        }
    }

    pub fn with_sampling(mut self, params: SamplingParams) -> Self {
        self.sampling_params = params;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_mods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mods = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Final result of one request after a scheduling pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutput {
    pub request_id: String,
    pub terminal: TerminalKind,
    pub finish_reason: FinishReason,
    /// Generated tokens, or the forced output for `ForcedOutput`.
    pub token_ids: Vec<u32>,
    pub text: Option<String>,
    pub tool_calls: Option<Value>,
    pub error: Option<String>,
    pub steps: usize,
    pub prompt_len: usize,
}
