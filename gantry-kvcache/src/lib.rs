//! Gantry position cache: one contiguous buffer split into per-request slots.

pub mod slots;

pub use slots::{CacheUsage, SlotCache};
