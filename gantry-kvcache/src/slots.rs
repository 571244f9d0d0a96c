//! Slot cache: every request owns a fixed-capacity window of one flat buffer.
//!
//! Slot `i` covers `[i * slot_capacity, (i + 1) * slot_capacity)`. Appends
//! write into the owner's window and rewinds only move its fill length back,
//! so a backtrack on one request never touches another request's positions.

use std::collections::HashMap;

use gantry_core::{GantryError, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub total_slots: usize,
    pub used_slots: usize,
    pub slot_capacity: usize,
    pub used_positions: usize,
}

impl CacheUsage {
    pub fn free_slots(&self) -> usize {
        self.total_slots - self.used_slots
    }

    pub fn usage_ratio(&self) -> f32 {
        if self.total_slots == 0 {
            return 1.0;
        }
        self.used_slots as f32 / self.total_slots as f32
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    index: usize,
    len: usize,
}

pub struct SlotCache {
    positions: Vec<u32>,
    slot_capacity: usize,
    slots: HashMap<String, Slot>,
    /// Free slot indices, popped from the back.
    free_list: Vec<usize>,
}

impl SlotCache {
    pub fn new(max_slots: usize, slot_capacity: usize) -> Self {
        Self {
            positions: vec![0; max_slots * slot_capacity],
            slot_capacity,
            slots: HashMap::new(),
            free_list: (0..max_slots).rev().collect(),
        }
    }

    pub fn can_allocate(&self) -> bool {
        !self.free_list.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.slots.contains_key(request_id)
    }

    pub fn allocate(&mut self, request_id: &str) -> Result<()> {
        if self.slots.contains_key(request_id) {
            return Err(GantryError::DuplicateRequest(request_id.to_string()));
        }
        let index = self.free_list.pop().ok_or_else(|| {
            GantryError::OutOfCapacity(format!(
                "all {} cache slots are in use",
                self.slots.len()
            ))
        })?;
        debug!(request_id, slot = index, "cache slot allocated");
        self.slots
            .insert(request_id.to_string(), Slot { index, len: 0 });
        Ok(())
    }

    /// Write `tokens` after the slot's current fill. Returns the new length.
    pub fn append(&mut self, request_id: &str, tokens: &[u32]) -> Result<usize> {
        let slot = self
            .slots
            .get_mut(request_id)
            .ok_or_else(|| GantryError::RequestNotFound(request_id.to_string()))?;
        let new_len = slot.len + tokens.len();
        if new_len > self.slot_capacity {
            return Err(GantryError::OutOfCapacity(format!(
                "request {request_id} needs {new_len} positions, slot holds {}",
                self.slot_capacity
            )));
        }
        let base = slot.index * self.slot_capacity;
        self.positions[base + slot.len..base + new_len].copy_from_slice(tokens);
        slot.len = new_len;
        Ok(new_len)
    }

    /// Forget the last `n` positions of a slot.
    pub fn rewind(&mut self, request_id: &str, n: usize) -> Result<()> {
        let slot = self
            .slots
            .get_mut(request_id)
            .ok_or_else(|| GantryError::RequestNotFound(request_id.to_string()))?;
        if n > slot.len {
            return Err(GantryError::InvalidArgument(format!(
                "cannot rewind {n} positions of request {request_id}, only {} cached",
                slot.len
            )));
        }
        slot.len -= n;
        Ok(())
    }

    pub fn tokens(&self, request_id: &str) -> Result<&[u32]> {
        let slot = self
            .slots
            .get(request_id)
            .ok_or_else(|| GantryError::RequestNotFound(request_id.to_string()))?;
        let base = slot.index * self.slot_capacity;
        Ok(&self.positions[base..base + slot.len])
    }

    pub fn seq_len(&self, request_id: &str) -> Result<usize> {
        self.slots
            .get(request_id)
            .map(|slot| slot.len)
            .ok_or_else(|| GantryError::RequestNotFound(request_id.to_string()))
    }

    pub fn free(&mut self, request_id: &str) -> Result<()> {
        let slot = self
            .slots
            .remove(request_id)
            .ok_or_else(|| GantryError::RequestNotFound(request_id.to_string()))?;
        self.free_list.push(slot.index);
        debug!(request_id, slot = slot.index, "cache slot freed");
        Ok(())
    }

    pub fn usage(&self) -> CacheUsage {
        CacheUsage {
            total_slots: self.slots.len() + self.free_list.len(),
            used_slots: self.slots.len(),
            slot_capacity: self.slot_capacity,
            used_positions: self.slots.values().map(|s| s.len).sum(),
        }
    }
}
