use std::collections::{HashSet, VecDeque};

use gantry_core::{GantryError, InferenceRequest, Result};
use tracing::debug;

/// Admission limits for the request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_batch_size: usize,
    pub max_prompt_tokens: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            max_prompt_tokens: 4096,
        }
    }
}

/// First-come first-served queue feeding scheduling passes.
pub struct BatchQueue {
    config: QueueConfig,
    waiting: VecDeque<InferenceRequest>,
    queued_ids: HashSet<String>,
}

impl BatchQueue {
    pub fn new(config: QueueConfig) -> Self {
        // A zero batch size would never drain the queue.
        let config = QueueConfig {
            max_batch_size: config.max_batch_size.max(1),
            ..config
        };
        Self {
            config,
            waiting: VecDeque::new(),
            queued_ids: HashSet::new(),
        }
    }

    pub fn enqueue(&mut self, request: InferenceRequest) -> Result<()> {
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
        if !self.queued_ids.insert(request.request_id.clone()) {
            return Err(GantryError::DuplicateRequest(request.request_id));
        }
        debug!(request_id = %request.request_id, queued = self.waiting.len() + 1, "request queued");
        self.waiting.push_back(request);
        Ok(())
    }

    /// Remove a request that has not been scheduled yet.
    pub fn cancel(&mut self, request_id: &str) -> Result<InferenceRequest> {
        let pos = self
            .waiting
            .iter()
            .position(|r| r.request_id == request_id)
            .ok_or_else(|| GantryError::RequestNotFound(request_id.to_string()))?;
        self.queued_ids.remove(request_id);
        self.waiting
            .remove(pos)
            .ok_or_else(|| GantryError::Internal(format!("queue index {pos} vanished")))
    }

    /// Pop up to `max_batch_size` requests in arrival order.
    pub fn next_batch(&mut self) -> Vec<InferenceRequest> {
        let n = self.waiting.len().min(self.config.max_batch_size);
        let batch: Vec<InferenceRequest> = self.waiting.drain(..n).collect();
        for request in &batch {
            self.queued_ids.remove(&request.request_id);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
