use std::collections::HashMap;

use gantry_core::{GantryError, Result};

use crate::request::RequestState;

/// All requests of one scheduling pass plus the counters shared between them.
///
/// Iteration follows admission order. `sequence_order` and `mod_call_index`
/// are unique across every request and event type of the pass.
#[derive(Debug, Default)]
pub struct BatchState {
    requests: Vec<RequestState>,
    index: HashMap<String, usize>,
    sequence_order: u64,
    mod_call_index: u64,
    pub step: usize,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: RequestState) -> Result<()> {
        if self.index.contains_key(&state.request_id) {
            return Err(GantryError::DuplicateRequest(state.request_id));
        }
        self.index
            .insert(state.request_id.clone(), self.requests.len());
        self.requests.push(state);
        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Option<&RequestState> {
        self.index.get(request_id).map(|&i| &self.requests[i])
    }

    pub fn get_mut(&mut self, request_id: &str) -> Option<&mut RequestState> {
        match self.index.get(request_id) {
            Some(&i) => Some(&mut self.requests[i]),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestState> {
        self.requests.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RequestState> {
        self.requests.iter_mut()
    }

    /// Snapshot of the ids of requests that are not terminal, in admission order.
    pub fn active_ids(&self) -> Vec<String> {
        self.requests
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.request_id.clone())
            .collect()
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        self.get(request_id).is_some_and(RequestState::is_active)
    }

    pub fn all_done(&self) -> bool {
        self.requests.iter().all(|r| r.is_done)
    }

    /// Claim the next event sequence number.
    pub fn next_sequence_order(&mut self) -> u64 {
        let order = self.sequence_order;
        self.sequence_order += 1;
        order
    }

    /// Claim the next batch-wide mod call index.
    pub fn next_mod_call_index(&mut self) -> u64 {
        let index = self.mod_call_index;
        self.mod_call_index += 1;
        index
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn into_requests(self) -> Vec<RequestState> {
        self.requests
    }
}
