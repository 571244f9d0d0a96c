//! Fans an event out to the mods attached to its request.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use gantry_core::{Action, Event, Tokenizer};
use gantry_scheduler::BatchState;
use tracing::{debug, warn};

use crate::config::ModErrorPolicy;
use crate::mods::{ModContext, ModLogLevel, ModRegistry};
use crate::trace::{
    ActionDisposition, ActionRecord, ModCallRecord, ModLogRecord, TraceRecord, TraceSink,
};

/// An event together with its batch-wide sequence number.
#[derive(Debug, Clone)]
pub struct StampedEvent {
    pub sequence_order: u64,
    pub event: Event,
}

/// A legal action waiting to be applied.
#[derive(Debug, Clone)]
pub struct ProposedAction {
    pub mod_call_index: u64,
    pub mod_name: String,
    pub action_order: usize,
    pub action: Action,
}

struct ModFailure {
    message: String,
    trace: String,
}

impl ModFailure {
    fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            trace: format!("{err:?}"),
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "mod panicked".to_string()
        };
        Self {
            trace: format!("panic: {message}"),
            message,
        }
    }
}

pub struct ModDispatcher {
    policy: ModErrorPolicy,
}

impl ModDispatcher {
    pub fn new(policy: ModErrorPolicy) -> Self {
        Self { policy }
    }

    /// Invoke every mod attached to the event's request, in registration order.
    ///
    /// Failed calls and illegal actions are recorded here and dropped; the
    /// returned list only holds actions the processor may apply. Under
    /// [`ModErrorPolicy::FailRequest`] a failed call yields an `EmitError`.
    pub fn dispatch(
        &self,
        stamped: &StampedEvent,
        registry: &mut ModRegistry,
        batch: &mut BatchState,
        tokenizer: &dyn Tokenizer,
        trace: &mut dyn TraceSink,
    ) -> Vec<ProposedAction> {
        let event = &stamped.event;
        let request_id = event.request_id();
        let kind = event.kind();
        let mod_ids = match batch.get(request_id) {
            Some(state) if state.is_active() => state.mod_ids.clone(),
            _ => return Vec::new(),
        };

        let mut proposed = Vec::new();
        for (action_order, mod_id) in mod_ids.into_iter().enumerate() {
            let Some(handler) = registry.get_mut(mod_id) else {
                warn!(request_id, mod_id, "mod missing from registry, skipped");
                continue;
            };
            let mod_name = handler.name().to_string();
            let mod_call_index = batch.next_mod_call_index();
            let request_call_sequence = batch
                .get_mut(request_id)
                .map(|state| state.next_mod_call())
                .unwrap_or_default();

            let mut ctx = ModContext::new(tokenizer);
            let started = Instant::now();
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_event(event, &mut ctx)));
            let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;

            let result = match outcome {
                Ok(Ok(action)) => Ok(action),
                Ok(Err(err)) => Err(ModFailure::from_error(&err)),
                Err(payload) => Err(ModFailure::from_panic(payload)),
            };

            let failure = result.as_ref().err();
            trace.record(TraceRecord::ModCall(ModCallRecord {
                mod_call_index,
                request_id: request_id.to_string(),
                request_call_sequence,
                event_sequence_order: stamped.sequence_order,
                event_type: kind,
                mod_name: mod_name.clone(),
                step: event.step(),
                execution_time_ms,
                exception_occurred: failure.is_some(),
                exception_message: failure.map(|f| f.message.clone()),
                exception_trace: failure.map(|f| f.trace.clone()),
            }));

            for line in ctx.take_logs() {
                debug!(request_id, mod_name = %mod_name, level = ?line.level, "{}", line.message);
                trace.record(TraceRecord::ModLog(ModLogRecord {
                    mod_call_index,
                    request_id: request_id.to_string(),
                    mod_name: mod_name.clone(),
                    log_level: line.level,
                    message: line.message,
                }));
            }

            let action = match result {
                Ok(action) => action,
                Err(failure) => {
                    warn!(
                        request_id,
                        step = event.step(),
                        mod_name = %mod_name,
                        event = %kind,
                        error = %failure.message,
                        "mod call failed"
                    );
                    match self.policy {
                        ModErrorPolicy::Continue => continue,
                        ModErrorPolicy::FailRequest => Action::EmitError {
                            message: format!("mod {mod_name} failed: {}", failure.message),
                        },
                    }
                }
            };

            if !kind.allows(action.kind()) {
                let reason = format!("{} is not permitted in response to {kind}", action.kind());
                warn!(request_id, mod_name = %mod_name, "{reason}");
                trace.record(TraceRecord::ModLog(ModLogRecord {
                    mod_call_index,
                    request_id: request_id.to_string(),
                    mod_name: mod_name.clone(),
                    log_level: ModLogLevel::Error,
                    message: reason.clone(),
                }));
                trace.record(TraceRecord::Action(ActionRecord {
                    mod_call_index,
                    request_id: request_id.to_string(),
                    mod_name,
                    action_type: action.kind().to_string(),
                    action_order,
                    disposition: ActionDisposition::Rejected,
                    reason: Some(reason),
                    details: action.details(),
                }));
                continue;
            }

            debug!(request_id, mod_name = %mod_name, action = %action.kind(), "mod proposed action");
            proposed.push(ProposedAction {
                mod_call_index,
                mod_name,
                action_order,
                action,
            });
        }
        proposed
    }
}
