//! Structured trace of a scheduling pass.
//!
//! Records arrive in emission order. `event_sequence_order` links mod calls to
//! the event that triggered them, and `mod_call_index` links actions and log
//! lines to the mod call that produced them.

use std::io::Write;
use std::sync::{Arc, Mutex};

use gantry_core::{Event, EventKind, RequestOutput, Tokenizer};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::mods::ModLogLevel;

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub request_id: String,
    pub event_type: EventKind,
    pub step: usize,
    pub sequence_order: u64,
    pub fields: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModCallRecord {
    pub mod_call_index: u64,
    pub request_id: String,
    pub request_call_sequence: u64,
    pub event_sequence_order: u64,
    pub event_type: EventKind,
    pub mod_name: String,
    pub step: usize,
    pub execution_time_ms: f64,
    pub exception_occurred: bool,
    pub exception_message: Option<String>,
    pub exception_trace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDisposition {
    Applied,
    Rejected,
    /// Not applied because an earlier action of the same event ended the step.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub mod_call_index: u64,
    pub request_id: String,
    pub mod_name: String,
    pub action_type: String,
    pub action_order: usize,
    pub disposition: ActionDisposition,
    pub reason: Option<String>,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModLogRecord {
    pub mod_call_index: u64,
    pub request_id: String,
    pub mod_name: String,
    pub log_level: ModLogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TraceRecord {
    Event(EventRecord),
    ModCall(ModCallRecord),
    Action(ActionRecord),
    ModLog(ModLogRecord),
    Request(RequestOutput),
}

impl EventRecord {
    /// Render an event, decoding token ids where the tokenizer allows it.
    pub fn new(
        event: &Event,
        sequence_order: u64,
        tokenizer: &dyn Tokenizer,
        top_tokens: usize,
    ) -> Self {
        let decode = |ids: &[u32]| tokenizer.decode(ids).ok();
        let fields = match event {
            Event::Prefilled {
                prompt_tokens,
                tokens_so_far_len,
                max_steps,
                ..
            } => json!({
                "prompt_length": prompt_tokens.len(),
                "tokens_so_far_len": tokens_so_far_len,
                "max_steps": max_steps,
            }),
            Event::ForwardPass { logits, .. } => {
                let top: Vec<Value> = event
                    .top_k_logprobs(top_tokens)
                    .into_iter()
                    .map(|(token, logprob)| {
                        json!({
                            "token": token,
                            "logprob": logprob,
                            "token_str": decode(&[token]),
                        })
                    })
                    .collect();
                json!({ "vocab_size": logits.len(), "top_tokens": top })
            }
            Event::Sampled { sampled_token, .. } => json!({
                "sampled_token": sampled_token,
                "token_text": decode(&[*sampled_token]),
            }),
            Event::Added {
                added_tokens,
                forced,
                ..
            } => json!({
                "added_tokens": added_tokens,
                "token_count": added_tokens.len(),
                "forced": forced,
                "tokens_as_text": added_tokens
                    .iter()
                    .map(|&t| decode(&[t]))
                    .collect::<Vec<_>>(),
            }),
        };
        Self {
            request_id: event.request_id().to_string(),
            event_type: event.kind(),
            step: event.step(),
            sequence_order,
            fields,
        }
    }
}

pub trait TraceSink: Send {
    fn record(&mut self, record: TraceRecord);

    fn flush(&mut self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn record(&mut self, _record: TraceRecord) {}
}

/// Keeps records in memory. Clones share the same buffer, so a test can hand
/// one clone to the engine and inspect the other.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TraceRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TraceRecord::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn mod_calls(&self) -> Vec<ModCallRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TraceRecord::ModCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn actions(&self) -> Vec<ActionRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TraceRecord::Action(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    pub fn logs(&self) -> Vec<ModLogRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TraceRecord::ModLog(l) => Some(l),
                _ => None,
            })
            .collect()
    }
}

impl TraceSink for MemorySink {
    fn record(&mut self, record: TraceRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}

/// Writes one JSON object per line. Write errors are logged once and then
/// ignored; tracing never stops generation.
pub struct JsonlSink<W: Write + Send> {
    writer: W,
    failed: bool,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn report(&mut self, error: &dyn std::fmt::Display) {
        if !self.failed {
            warn!(error = %error, "trace write failed, further trace errors suppressed");
            self.failed = true;
        }
    }
}

impl<W: Write + Send> TraceSink for JsonlSink<W> {
    fn record(&mut self, record: TraceRecord) {
        if let Err(e) = serde_json::to_writer(&mut self.writer, &record) {
            self.report(&e);
            return;
        }
        if let Err(e) = self.writer.write_all(b"\n") {
            self.report(&e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            self.report(&e);
        }
    }
}

/// Forwards records to an unbounded tokio channel. A dropped receiver is ignored.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TraceRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<TraceRecord>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TraceRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TraceSink for ChannelSink {
    fn record(&mut self, record: TraceRecord) {
        let _ = self.tx.send(record);
    }
}
