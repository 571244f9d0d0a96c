use std::path::Path;

use gantry_core::{GantryError, Result};
use gantry_scheduler::QueueConfig;
use serde::{Deserialize, Serialize};

/// What happens to a request whose mod returns an error or panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModErrorPolicy {
    /// Record the failure, treat the call as `Noop` and keep generating.
    #[default]
    Continue,
    /// Record the failure and end the request as `Errored`.
    FailRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_batch_size: usize,
    /// Step budget for requests that do not set `max_steps`.
    pub default_max_steps: usize,
    pub max_prompt_tokens: usize,
    /// Upper bound on prompt, generated and queued forced tokens of one request.
    pub max_request_tokens: usize,
    pub mod_error_policy: ModErrorPolicy,
    /// Number of top tokens recorded with every `ForwardPass` trace event.
    pub trace_top_tokens: usize,
    /// Treat the tokenizer's EOS as a stop token.
    pub stop_on_eos: bool,
    /// Drop stop tokens from the final output.
    pub strip_stop_tokens: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            default_max_steps: 256,
            max_prompt_tokens: 4096,
            max_request_tokens: 8192,
            mod_error_policy: ModErrorPolicy::Continue,
            trace_top_tokens: 20,
            stop_on_eos: true,
            strip_stop_tokens: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("max_batch_size", self.max_batch_size),
            ("default_max_steps", self.default_max_steps),
            ("max_prompt_tokens", self.max_prompt_tokens),
            ("max_request_tokens", self.max_request_tokens),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(GantryError::InvalidArgument(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.max_prompt_tokens > self.max_request_tokens {
            return Err(GantryError::InvalidArgument(format!(
                "max_prompt_tokens ({}) exceeds max_request_tokens ({})",
                self.max_prompt_tokens, self.max_request_tokens
            )));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_batch_size: self.max_batch_size,
            max_prompt_tokens: self.max_prompt_tokens,
        }
    }
}
