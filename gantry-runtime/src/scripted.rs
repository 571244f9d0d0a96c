//! Deterministic stand-in for a real model.
//!
//! Each request follows a continuation script: at generated position `k` the
//! logits row peaks at `script[k]`, and at EOS once the script runs out. The
//! position is read from the request's cache slot, so the model only produces
//! the right continuation if the engine keeps the cache in step with history.

use std::collections::HashMap;

use gantry_core::{ForwardModel, GantryError, Result, SeqInput};
use gantry_kvcache::SlotCache;
use tracing::debug;

const PEAK_LOGIT: f32 = 30.0;

pub struct ScriptedModel {
    vocab_size: usize,
    eos_token_id: u32,
    cache: SlotCache,
    prefill_lens: HashMap<String, usize>,
    scripts: HashMap<String, Vec<u32>>,
    default_script: Vec<u32>,
    forward_calls: usize,
    fail_on_call: Option<usize>,
    rewinds: Vec<(String, usize)>,
}

impl ScriptedModel {
    pub fn new(vocab_size: usize, eos_token_id: u32, max_slots: usize, slot_capacity: usize) -> Self {
        Self {
            vocab_size,
            eos_token_id,
            cache: SlotCache::new(max_slots, slot_capacity),
            prefill_lens: HashMap::new(),
            scripts: HashMap::new(),
            default_script: Vec::new(),
            forward_calls: 0,
            fail_on_call: None,
            rewinds: Vec::new(),
        }
    }

    /// Script followed by requests without their own.
    pub fn with_default_script(mut self, script: Vec<u32>) -> Self {
        self.default_script = script;
        self
    }

    pub fn with_script(mut self, request_id: impl Into<String>, script: Vec<u32>) -> Self {
        self.set_script(request_id, script);
        self
    }

    pub fn set_script(&mut self, request_id: impl Into<String>, script: Vec<u32>) {
        self.scripts.insert(request_id.into(), script);
    }

    /// Make the `call`-th forward call (1-based) fail.
    pub fn fail_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn cache(&self) -> &SlotCache {
        &self.cache
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls
    }

    /// Every `rewind_cache` call received, in order.
    pub fn rewinds(&self) -> &[(String, usize)] {
        &self.rewinds
    }

    fn next_token(&self, request_id: &str, generated_pos: usize) -> u32 {
        self.scripts
            .get(request_id)
            .unwrap_or(&self.default_script)
            .get(generated_pos)
            .copied()
            .unwrap_or(self.eos_token_id)
    }

    fn row_for(&self, token_id: u32) -> Result<Vec<f32>> {
        let idx = token_id as usize;
        if idx >= self.vocab_size {
            return Err(GantryError::Model(format!(
                "scripted token {token_id} outside vocabulary of {}",
                self.vocab_size
            )));
        }
        let mut row = vec![0.0; self.vocab_size];
        row[idx] = PEAK_LOGIT;
        Ok(row)
    }
}

impl ForwardModel for ScriptedModel {
    fn forward(&mut self, batch: &[SeqInput]) -> Result<Vec<Vec<f32>>> {
        self.forward_calls += 1;
        if self.fail_on_call == Some(self.forward_calls) {
            return Err(GantryError::Model(format!(
                "injected failure on forward call {}",
                self.forward_calls
            )));
        }

        let mut rows = Vec::with_capacity(batch.len());
        for input in batch {
            let id = input.request_id.as_str();
            if input.is_prefill && !self.cache.contains(id) {
                self.cache.allocate(id)?;
            }
            let cached = self.cache.seq_len(id)?;
            if cached != input.position_offset {
                return Err(GantryError::Model(format!(
                    "request {id} fed at position {} but cache holds {cached}",
                    input.position_offset
                )));
            }
            if input.tokens.is_empty() {
                return Err(GantryError::Model(format!("request {id} fed no tokens")));
            }
            let len = self.cache.append(id, &input.tokens)?;
            if input.is_prefill {
                self.prefill_lens.insert(id.to_string(), len);
            }
            let prefill_len = self.prefill_lens.get(id).copied().unwrap_or(len);
            let next = self.next_token(id, len.saturating_sub(prefill_len));
            rows.push(self.row_for(next)?);
        }
        debug!(batch = batch.len(), call = self.forward_calls, "scripted forward");
        Ok(rows)
    }

    fn rewind_cache(&mut self, request_id: &str, n: usize) -> Result<()> {
        self.cache.rewind(request_id, n)?;
        self.rewinds.push((request_id.to_string(), n));
        Ok(())
    }

    fn release(&mut self, request_id: &str) -> Result<()> {
        self.prefill_lens.remove(request_id);
        if self.cache.contains(request_id) {
            self.cache.free(request_id)?;
        }
        Ok(())
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_positions(&self) -> Option<usize> {
        Some(self.cache.usage().slot_capacity)
    }
}
