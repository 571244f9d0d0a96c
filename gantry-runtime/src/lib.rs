//! Gantry runtime: the step scheduler that drives mods through generation.

pub mod actions;
pub mod backtrack;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod mods;
pub mod sampling;
pub mod scripted;
pub mod trace;

pub use actions::{ActionProcessor, ApplyResult, StepOutcome};
pub use backtrack::{BacktrackCoordinator, BacktrackError};
pub use config::{EngineConfig, ModErrorPolicy};
pub use dispatch::{ModDispatcher, ProposedAction, StampedEvent};
pub use engine::{Engine, EngineCommand, EngineEvent};
pub use mods::{mod_fn, Actions, FnMod, Mod, ModContext, ModLogLevel, ModRegistry};
pub use sampling::CpuSampler;
pub use scripted::ScriptedModel;
pub use trace::{
    ActionDisposition, ChannelSink, JsonlSink, MemorySink, NullSink, TraceRecord, TraceSink,
};
