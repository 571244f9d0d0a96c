use gantry_scheduler::RequestState;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BacktrackError {
    #[error("cannot backtrack {n} tokens, only {available} generated")]
    Overflow { n: usize, available: usize },
}

/// Removes trailing generated tokens and records how far the model cache
/// must be rewound. The cache itself is reconciled by the engine before the
/// next forward pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktrackCoordinator;

impl BacktrackCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Truncate `n` generated tokens, queue `replacement` for the next `Added`,
    /// and consume the current step. Prompt tokens are never removed.
    pub fn backtrack(
        &self,
        n: usize,
        replacement: Option<&[u32]>,
        state: &mut RequestState,
    ) -> Result<(), BacktrackError> {
        let available = state.generated_tokens.len();
        if n > available {
            return Err(BacktrackError::Overflow { n, available });
        }
        state.generated_tokens.truncate(available - n);
        if n > 0 {
            *state.pending_rewind.get_or_insert(0) += n;
        }
        if let Some(tokens) = replacement {
            state.enqueue_forced(tokens);
        }
        state.scratch.consumed = true;
        debug!(
            request_id = %state.request_id,
            n,
            replacement = replacement.map_or(0, <[u32]>::len),
            pending_rewind = state.rewind_offset(),
            "backtracked"
        );
        Ok(())
    }
}
