//! Gantry core types, traits, and error definitions.

pub mod error;
pub mod event;
pub mod model;
pub mod request;
pub mod sampling;
pub mod tokenizer;
pub mod types;

pub use error::{GantryError, Result};
pub use event::{top_k_logprobs, Action, ActionKind, Event, EventKind};
pub use model::{ForwardModel, SeqInput};
pub use request::{InferenceRequest, RequestOutput};
pub use sampling::{SampleInput, SampleResult, Sampler};
pub use tokenizer::{Tokenizer, VocabTokenizer};
pub use types::*;
