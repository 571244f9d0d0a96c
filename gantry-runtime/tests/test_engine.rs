mod common;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use gantry_core::{
    Action, Event, EventKind, FinishReason, GantryError, TerminalKind, Tokenizer,
};
use gantry_runtime::{mod_fn, ActionDisposition, EngineConfig, ModErrorPolicy, ModRegistry};
use serde_json::json;

use common::*;

fn noop_registry() -> ModRegistry {
    ModRegistry::new()
        .with(mod_fn("watcher", |_, _| Ok(Action::Noop)))
        .unwrap()
}

#[test]
fn test_sequence_order_strictly_increasing() {
    let tk = tokenizer();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());

    let requests = (1..=3)
        .map(|i| request(&format!("req-{i}"), chars(&tk, "hi"), 4))
        .collect();
    let outputs = engine.run_pass(requests).unwrap();
    assert_eq!(outputs.len(), 3);

    let events = sink.events();
    // 3 requests x 4 steps x 4 events
    assert_eq!(events.len(), 48);
    for pair in events.windows(2) {
        assert!(pair[0].sequence_order < pair[1].sequence_order);
    }
    let orders: HashSet<u64> = events.iter().map(|e| e.sequence_order).collect();
    assert_eq!(orders.len(), events.len());

    let calls = sink.mod_calls();
    assert_eq!(calls.len(), events.len());
    let indices: HashSet<u64> = calls.iter().map(|c| c.mod_call_index).collect();
    assert_eq!(indices.len(), calls.len());
    for call in &calls {
        assert!(orders.contains(&call.event_sequence_order));
    }
}

#[test]
fn test_event_cycle_order_within_step() {
    let tk = tokenizer();
    let model = scripted(&tk).with_default_script(chars(&tk, "ab"));
    let (mut engine, sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());
    engine
        .run_pass(vec![request("req-1", chars(&tk, "hi"), 2)])
        .unwrap();

    let kinds: Vec<(usize, EventKind)> = sink
        .events()
        .iter()
        .map(|e| (e.step, e.event_type))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (0, EventKind::Prefilled),
            (0, EventKind::ForwardPass),
            (0, EventKind::Sampled),
            (0, EventKind::Added),
            (1, EventKind::Prefilled),
            (1, EventKind::ForwardPass),
            (1, EventKind::Sampled),
            (1, EventKind::Added),
        ]
    );
}

#[test]
fn test_prefilled_refire_needs_guard() {
    let tk = tokenizer();
    let naive_counts: Arc<Mutex<HashMap<String, usize>>> = Default::default();
    let guarded_counts: Arc<Mutex<HashMap<String, usize>>> = Default::default();

    let naive = {
        let counts = naive_counts.clone();
        mod_fn("naive", move |event, _| {
            let mut counts = counts.lock().unwrap();
            match event {
                Event::Prefilled { request_id, .. } => {
                    counts.insert(request_id.clone(), 0);
                }
                Event::Added { request_id, .. } => {
                    *counts.entry(request_id.clone()).or_insert(0) += 1;
                }
                _ => {}
            }
            Ok(Action::Noop)
        })
    };
    let guarded = {
        let counts = guarded_counts.clone();
        mod_fn("guarded", move |event, _| {
            let mut counts = counts.lock().unwrap();
            match event {
                Event::Prefilled { request_id, .. } => {
                    counts.entry(request_id.clone()).or_insert(0);
                }
                Event::Added { request_id, .. } => {
                    *counts.entry(request_id.clone()).or_insert(0) += 1;
                }
                _ => {}
            }
            Ok(Action::Noop)
        })
    };
    let registry = ModRegistry::new().with(naive).unwrap().with(guarded).unwrap();

    let model = scripted(&tk).with_default_script(chars(&tk, "abcdefgh"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());
    engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 5)])
        .unwrap();

    let prefilled = sink
        .events()
        .iter()
        .filter(|e| e.event_type == EventKind::Prefilled)
        .count();
    assert_eq!(prefilled, 5);
    assert_eq!(guarded_counts.lock().unwrap()["req-1"], 5);
    assert_eq!(naive_counts.lock().unwrap()["req-1"], 1);
}

#[test]
fn test_adjust_prefill_rejected_after_prefill() {
    let tk = tokenizer();
    let replacement = chars(&tk, "zzzz");
    let registry = ModRegistry::new()
        .with(mod_fn("late-prefill", move |event, ctx| {
            Ok(match event {
                Event::Added { .. } => ctx.actions().adjust_prefill(replacement.clone(), Some(1)),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "hey"), 3)])
        .unwrap();
    let output = &outputs[0];
    assert_eq!(output.prompt_len, 3);
    assert_eq!(output.steps, 3);
    assert_eq!(output.text.as_deref(), Some("abc"));

    let adjustments: Vec<_> = sink
        .actions()
        .into_iter()
        .filter(|a| a.action_type == "AdjustPrefill")
        .collect();
    assert_eq!(adjustments.len(), 3);
    assert!(adjustments
        .iter()
        .all(|a| a.disposition == ActionDisposition::Rejected));

    for event in sink.events() {
        if event.event_type == EventKind::Prefilled {
            assert_eq!(event.fields["prompt_length"], json!(3));
        }
    }
}

#[test]
fn test_adjust_prefill_only_honored_before_first_forward() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("rewrite-prompt", |event, ctx| {
            let tokenizer = ctx.tokenizer();
            Ok(match event {
                Event::Prefilled { .. } => {
                    ctx.actions()
                        .adjust_prefill(tokenizer.encode("new prompt")?, Some(2))
                }
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "old"), 6)])
        .unwrap();
    assert_eq!(outputs[0].prompt_len, "new prompt".len());
    assert_eq!(outputs[0].steps, 2);

    let dispositions: Vec<ActionDisposition> = sink
        .actions()
        .iter()
        .filter(|a| a.action_type == "AdjustPrefill")
        .map(|a| a.disposition)
        .collect();
    assert_eq!(
        dispositions,
        vec![ActionDisposition::Applied, ActionDisposition::Rejected]
    );
}

#[test]
fn test_adjust_prefill_zero_max_steps_keeps_budget() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("prompt-only", |event, ctx| {
            Ok(match event {
                Event::Prefilled { step: 0, .. } => ctx.actions().adjust_prefill(Vec::new(), Some(0)),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, _sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "old"), 4)])
        .unwrap();
    assert_eq!(outputs[0].prompt_len, 3);
    assert_eq!(outputs[0].steps, 4);
}

fn run_force_output_at(kind: EventKind) {
    let tk = tokenizer();
    let forced = chars(&tk, "done");
    let forced_for_mod = forced.clone();
    let trigger_step = if kind == EventKind::Prefilled { 0 } else { 1 };
    let registry = ModRegistry::new()
        .with(mod_fn("ender", move |event, ctx| {
            Ok(if event.kind() == kind && event.step() == trigger_step {
                ctx.actions().force_output(forced_for_mod.clone())
            } else {
                Action::Noop
            })
        }))
        .unwrap()
        .with(mod_fn("follower", move |event, ctx| {
            Ok(if event.kind() == kind && event.step() == trigger_step {
                ctx.actions().emit_error("should never apply")
            } else {
                Action::Noop
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "hi"), 5)])
        .unwrap();
    let output = &outputs[0];
    assert_eq!(output.terminal, TerminalKind::ForcedOutput, "{kind}");
    assert_eq!(output.finish_reason, FinishReason::ForcedOutput);
    assert_eq!(output.token_ids, forced);
    assert_eq!(output.text.as_deref(), Some("done"));
    assert!(output.error.is_none());

    let events = sink.events();
    let trigger = events
        .iter()
        .find(|e| e.event_type == kind && e.step == trigger_step)
        .unwrap();
    assert_eq!(events.last().unwrap().sequence_order, trigger.sequence_order);

    let actions = sink.actions();
    let skipped = actions
        .iter()
        .find(|a| a.mod_name == "follower" && a.action_type == "EmitError")
        .unwrap();
    assert_eq!(skipped.disposition, ActionDisposition::Skipped);
}

#[test]
fn test_force_output_ends_request_at_every_event() {
    for kind in [
        EventKind::Prefilled,
        EventKind::ForwardPass,
        EventKind::Sampled,
        EventKind::Added,
    ] {
        run_force_output_at(kind);
    }
}

#[test]
fn test_backtrack_replaces_tail() {
    let tk = tokenizer();
    let replacement = chars(&tk, "xy");
    let fired: Arc<Mutex<HashSet<String>>> = Default::default();
    let registry = {
        let fired = fired.clone();
        let replacement = replacement.clone();
        ModRegistry::new()
            .with(mod_fn("rewriter", move |event, ctx| {
                if let Event::Added {
                    request_id, step: 3, ..
                } = event
                {
                    if fired.lock().unwrap().insert(request_id.clone()) {
                        return Ok(ctx.actions().backtrack(2, Some(replacement.clone())));
                    }
                }
                Ok(Action::Noop)
            }))
            .unwrap()
    };
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdefgh"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 8)])
        .unwrap();
    let output = &outputs[0];
    assert_eq!(output.text.as_deref(), Some("abxyefg"));
    assert_eq!(output.terminal, TerminalKind::Completed);
    assert_eq!(output.steps, 8);

    let added: Vec<(usize, Vec<u32>, bool)> = sink
        .events()
        .iter()
        .filter(|e| e.event_type == EventKind::Added)
        .map(|e| {
            let tokens: Vec<u32> = serde_json::from_value(e.fields["added_tokens"].clone()).unwrap();
            (e.step, tokens, e.fields["forced"].as_bool().unwrap())
        })
        .collect();
    assert_eq!(added[3], (3, chars(&tk, "d"), false));
    assert_eq!(added[4], (4, replacement, true));
    assert_eq!(added[5], (5, chars(&tk, "e"), false));

    // The forced step never samples.
    assert!(!sink
        .events()
        .iter()
        .any(|e| e.event_type == EventKind::Sampled && e.step == 4));

    // `c` and `d` dropped; `d` was never fed, `b` is fed again.
    assert_eq!(engine.model().rewinds(), &[("req-1".to_string(), 2)]);
}

#[test]
fn test_backtrack_at_forward_pass_consumes_step() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("undo", |event, ctx| {
            Ok(match event {
                Event::ForwardPass { step: 2, .. } => ctx.actions().backtrack(1, None),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 4)])
        .unwrap();
    // step 0: a, step 1: b, step 2: drop b, step 3: b again
    assert_eq!(outputs[0].text.as_deref(), Some("ab"));
    assert_eq!(outputs[0].steps, 4);
    assert!(!sink
        .events()
        .iter()
        .any(|e| e.step == 2 && matches!(e.event_type, EventKind::Sampled | EventKind::Added)));
}

#[test]
fn test_backtrack_overflow_errors_only_that_request() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("greedy-undo", |event, ctx| {
            Ok(match event {
                Event::Added {
                    request_id, step: 0, ..
                } if request_id == "req-2" => ctx.actions().backtrack(5, None),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, _sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![
            request("req-1", chars(&tk, "go"), 3),
            request("req-2", chars(&tk, "go"), 3),
        ])
        .unwrap();
    assert_eq!(outputs[0].terminal, TerminalKind::Completed);
    assert_eq!(outputs[0].text.as_deref(), Some("abc"));
    assert_eq!(outputs[1].terminal, TerminalKind::Errored);
    assert!(outputs[1]
        .error
        .as_deref()
        .unwrap()
        .contains("cannot backtrack 5"));
}

fn failing_mod_registry() -> ModRegistry {
    ModRegistry::new()
        .with(mod_fn("flaky", |event, _| {
            if let Event::ForwardPass {
                request_id, step: 5, ..
            } = event
            {
                if request_id == "req-2" {
                    anyhow::bail!("flaky mod gave up");
                }
            }
            Ok(Action::Noop)
        }))
        .unwrap()
}

fn three_requests(tk: &gantry_core::VocabTokenizer) -> Vec<gantry_core::InferenceRequest> {
    (1..=3)
        .map(|i| request(&format!("req-{i}"), chars(tk, "go"), 10))
        .collect()
}

#[test]
fn test_failing_mod_isolated_with_fail_request_policy() {
    let tk = tokenizer();
    let config = EngineConfig {
        mod_error_policy: ModErrorPolicy::FailRequest,
        ..Default::default()
    };
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdefghijkl"));
    let (mut engine, sink) = build_engine(&tk, model, failing_mod_registry(), config);

    let outputs = engine.run_pass(three_requests(&tk)).unwrap();
    for i in [0, 2] {
        assert_eq!(outputs[i].terminal, TerminalKind::Completed);
        assert_eq!(outputs[i].finish_reason, FinishReason::MaxSteps);
        assert_eq!(outputs[i].text.as_deref(), Some("abcdefghij"));
    }
    assert_eq!(outputs[1].terminal, TerminalKind::Errored);
    assert_eq!(outputs[1].steps, 5);
    assert!(outputs[1].error.as_deref().unwrap().contains("flaky"));

    let failures: Vec<_> = sink
        .mod_calls()
        .into_iter()
        .filter(|c| c.exception_occurred)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].request_id, "req-2");
    assert_eq!(failures[0].step, 5);
    assert_eq!(
        failures[0].exception_message.as_deref(),
        Some("flaky mod gave up")
    );
}

#[test]
fn test_failing_mod_treated_as_noop_by_default() {
    let tk = tokenizer();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdefghijkl"));
    let (mut engine, sink) =
        build_engine(&tk, model, failing_mod_registry(), EngineConfig::default());

    let outputs = engine.run_pass(three_requests(&tk)).unwrap();
    assert!(outputs
        .iter()
        .all(|o| o.terminal == TerminalKind::Completed && o.steps == 10));
    assert_eq!(
        sink.mod_calls().iter().filter(|c| c.exception_occurred).count(),
        1
    );
    assert!(sink.actions().iter().all(|a| a.action_type == "Noop"));
}

#[test]
fn test_panicking_mod_is_recovered() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("panicky", |event, _| {
            if event.kind() == EventKind::Sampled && event.step() == 1 {
                panic!("mod exploded");
            }
            Ok(Action::Noop)
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("abc"));

    let failed: Vec<_> = sink
        .mod_calls()
        .into_iter()
        .filter(|c| c.exception_occurred)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .exception_message
        .as_deref()
        .unwrap()
        .contains("mod exploded"));
}

#[test]
fn test_budget_termination() {
    let tk = tokenizer();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdefghijklmnopqrst"));
    let (mut engine, sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 10)])
        .unwrap();
    let output = &outputs[0];
    assert_eq!(output.terminal, TerminalKind::Completed);
    assert_eq!(output.finish_reason, FinishReason::MaxSteps);
    assert_eq!(output.steps, 10);
    assert_eq!(output.token_ids.len(), 10);
    assert_eq!(sink.events().iter().map(|e| e.step).max(), Some(9));
}

#[test]
fn test_default_max_steps_from_config() {
    let tk = tokenizer();
    let config = EngineConfig {
        default_max_steps: 3,
        ..Default::default()
    };
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), config);

    let req = gantry_core::InferenceRequest::new("req-1", chars(&tk, "go"))
        .with_sampling(gantry_core::SamplingParams::greedy());
    let outputs = engine.run_pass(vec![req]).unwrap();
    assert_eq!(outputs[0].steps, 3);
}

#[test]
fn test_count_to_three_end_to_end() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("count", |event, ctx| {
            Ok(match event {
                Event::ForwardPass { step: 0, .. } => {
                    let tokenizer = ctx.tokenizer();
                    let ids = ["1,", "2,", "3"]
                        .iter()
                        .map(|piece| tokenizer.encode(piece))
                        .collect::<gantry_core::Result<Vec<Vec<u32>>>>()?
                        .concat();
                    ctx.actions().force_tokens(ids)
                }
                _ => Action::Noop,
            })
        }))
        .unwrap();
    // An empty script makes the model predict EOS immediately.
    let model = scripted(&tk);
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let prompt = tk.encode("Count to 3: ").unwrap();
    assert_eq!(prompt.len(), 4);
    let outputs = engine
        .run_pass(vec![request("count", prompt, 16)])
        .unwrap();
    let output = &outputs[0];

    let expected = vec![tok(&tk, "1,"), tok(&tk, "2,"), tok(&tk, "3")];
    assert_eq!(output.token_ids, expected);
    assert_eq!(output.text.as_deref(), Some("1,2,3"));
    assert_eq!(output.terminal, TerminalKind::Completed);
    assert_eq!(output.finish_reason, FinishReason::StopToken);

    let forced_added = sink
        .events()
        .into_iter()
        .find(|e| e.event_type == EventKind::Added && e.step == 0)
        .unwrap();
    assert_eq!(forced_added.fields["forced"], json!(true));
    assert_eq!(forced_added.fields["added_tokens"], json!(expected));
}

#[test]
fn test_stop_tokens_kept_when_not_stripping() {
    let tk = tokenizer();
    let config = EngineConfig {
        strip_stop_tokens: false,
        ..Default::default()
    };
    let model = scripted(&tk).with_default_script(chars(&tk, "ok"));
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), config);

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 10)])
        .unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("ok</s>"));
    assert_eq!(outputs[0].steps, 2);
}

#[test]
fn test_custom_stop_token() {
    let tk = tokenizer();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc.def"));
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());

    let mut req = request("req-1", chars(&tk, "go"), 10);
    req.sampling_params.stop_token_ids = vec![tok(&tk, ".")];
    let outputs = engine.run_pass(vec![req]).unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("abc"));
    assert_eq!(outputs[0].finish_reason, FinishReason::StopToken);
}

#[test]
fn test_adjust_logits_steers_sampling() {
    let tk = tokenizer();
    let vocab = tk.vocab_size();
    let z = tok(&tk, "z");
    let registry = ModRegistry::new()
        .with(mod_fn("steer", move |event, ctx| {
            Ok(match event {
                Event::ForwardPass { .. } => {
                    let mut logits = vec![0.0; vocab];
                    logits[z as usize] = 100.0;
                    ctx.actions().adjust_logits(logits, Some(0.0))
                }
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, _sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("zzz"));
}

#[test]
fn test_adjust_logits_wrong_length_rejected() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("bad-steer", |event, ctx| {
            Ok(match event {
                Event::ForwardPass { .. } => ctx.actions().adjust_logits(vec![1.0; 3], None),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("abc"));
    let steering: Vec<_> = sink
        .actions()
        .into_iter()
        .filter(|a| a.action_type == "AdjustLogits")
        .collect();
    assert_eq!(steering.len(), 3);
    assert!(steering
        .iter()
        .all(|a| a.disposition == ActionDisposition::Rejected));
}

#[test]
fn test_force_tokens_at_sampled_discards_sample() {
    let tk = tokenizer();
    let q = tok(&tk, "q");
    let registry = ModRegistry::new()
        .with(mod_fn("swap", move |event, ctx| {
            Ok(match event {
                Event::Sampled { step: 0, .. } => ctx.actions().force_tokens(vec![q]),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    // The model continues its script from the next position.
    assert_eq!(outputs[0].text.as_deref(), Some("qbc"));
    let first_added = sink
        .events()
        .into_iter()
        .find(|e| e.event_type == EventKind::Added)
        .unwrap();
    assert_eq!(first_added.fields["forced"], json!(true));
}

#[test]
fn test_force_tokens_at_added_emitted_next_step() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("append", |event, ctx| {
            Ok(match event {
                Event::Added { step: 0, .. } => ctx.actions().force_text("!!")?,
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, _sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("a!!d"));
}

#[test]
fn test_tool_calls_terminal() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("tools", |event, ctx| {
            Ok(match event {
                Event::Added { step: 1, .. } => ctx
                    .actions()
                    .tool_calls(json!([{ "name": "lookup", "arguments": { "q": "rust" } }])),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdef"));
    let (mut engine, _sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 6)])
        .unwrap();
    let output = &outputs[0];
    assert_eq!(output.terminal, TerminalKind::ToolCalled);
    assert_eq!(output.finish_reason, FinishReason::ToolCalls);
    assert_eq!(output.tool_calls.as_ref().unwrap()[0]["name"], json!("lookup"));
    assert!(output.token_ids.is_empty());
    assert!(output.text.is_none());
    assert_eq!(output.steps, 1);
}

#[test]
fn test_emit_error_terminal() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("guard", |event, ctx| {
            Ok(match event {
                Event::Prefilled { .. } => ctx.actions().emit_error("prompt refused"),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    assert_eq!(outputs[0].terminal, TerminalKind::Errored);
    assert_eq!(outputs[0].error.as_deref(), Some("prompt refused"));
    assert_eq!(outputs[0].steps, 0);
    assert_eq!(engine.model().forward_calls(), 0);
    assert_eq!(sink.events().len(), 1);
}

#[test]
fn test_mods_selected_per_request() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("alpha", |_, _| Ok(Action::Noop)))
        .unwrap()
        .with(mod_fn("beta", |_, _| Ok(Action::Noop)))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![
            request("only-beta", chars(&tk, "go"), 2).with_mods(["beta"]),
            request("none", chars(&tk, "go"), 2).with_mods(Vec::<String>::new()),
        ])
        .unwrap();
    assert_eq!(outputs.len(), 2);
    let calls = sink.mod_calls();
    assert!(!calls.is_empty());
    assert!(calls
        .iter()
        .all(|c| c.mod_name == "beta" && c.request_id == "only-beta"));
}

#[test]
fn test_unknown_mod_rejected() {
    let tk = tokenizer();
    let model = scripted(&tk);
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());
    let result = engine.run_pass(vec![request("req-1", chars(&tk, "go"), 2).with_mods(["nope"])]);
    assert!(matches!(result, Err(GantryError::InvalidArgument(_))));
}

#[test]
fn test_duplicate_request_ids_rejected() {
    let tk = tokenizer();
    let model = scripted(&tk);
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());
    let result = engine.run_pass(vec![
        request("req-1", chars(&tk, "go"), 2),
        request("req-1", chars(&tk, "go"), 2),
    ]);
    assert!(matches!(result, Err(GantryError::DuplicateRequest(_))));
}

#[test]
fn test_forward_failure_is_fatal() {
    let tk = tokenizer();
    let model = scripted(&tk)
        .with_default_script(chars(&tk, "abcdef"))
        .fail_on_call(2);
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());

    let result = engine.run_pass(vec![request("req-1", chars(&tk, "go"), 5)]);
    assert!(matches!(result, Err(GantryError::Model(_))));
    // Cache slots are released even on failure.
    assert_eq!(engine.model().cache().usage().used_slots, 0);
}

#[test]
fn test_cache_released_after_pass() {
    let tk = tokenizer();
    let model = scripted(&tk).with_default_script(chars(&tk, "ab"));
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());
    engine
        .run_pass(vec![
            request("req-1", chars(&tk, "go"), 4),
            request("req-2", chars(&tk, "hi"), 4),
        ])
        .unwrap();
    assert_eq!(engine.model().cache().usage().used_slots, 0);
    assert_eq!(engine.model().forward_calls(), 3);
}

#[test]
fn test_oversized_force_tokens_errors_only_that_request() {
    let tk = tokenizer();
    let a = tok(&tk, "a");
    let registry = ModRegistry::new()
        .with(mod_fn("flood", move |event, ctx| {
            Ok(match event {
                Event::ForwardPass {
                    request_id, step: 1, ..
                } if request_id == "req-2" => ctx.actions().force_tokens(vec![a; 600]),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcde"));
    let (mut engine, _sink) = build_engine(&tk, model, registry, EngineConfig::default());
    assert_eq!(engine.max_request_tokens(), 512);

    let outputs = engine
        .run_pass(
            (1..=3)
                .map(|i| request(&format!("req-{i}"), chars(&tk, "go"), 5))
                .collect(),
        )
        .unwrap();
    for i in [0, 2] {
        assert_eq!(outputs[i].terminal, TerminalKind::Completed);
        assert_eq!(outputs[i].text.as_deref(), Some("abcde"));
    }
    assert_eq!(outputs[1].terminal, TerminalKind::Errored);
    assert!(outputs[1].error.as_deref().unwrap().contains("budget is 512"));
    assert_eq!(engine.model().cache().usage().used_slots, 0);
}

#[test]
fn test_token_budget_ends_request() {
    let tk = tokenizer();
    let config = EngineConfig {
        max_prompt_tokens: 4,
        max_request_tokens: 5,
        ..Default::default()
    };
    let model = scripted(&tk).with_default_script(chars(&tk, "abcdefgh"));
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), config);

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 10)])
        .unwrap();
    assert_eq!(outputs[0].terminal, TerminalKind::Completed);
    assert_eq!(outputs[0].finish_reason, FinishReason::Length);
    assert_eq!(outputs[0].text.as_deref(), Some("abc"));
    assert_eq!(outputs[0].steps, 3);
}

#[test]
fn test_prompt_longer_than_model_slot_rejected() {
    let tk = tokenizer();
    let model = gantry_runtime::ScriptedModel::new(
        tk.vocab_size(),
        tk.eos_token_id().unwrap(),
        2,
        4,
    );
    let (mut engine, _sink) = build_engine(&tk, model, noop_registry(), EngineConfig::default());
    assert_eq!(engine.max_request_tokens(), 4);

    let err = engine
        .run_pass(vec![request("req-1", chars(&tk, "hello"), 2)])
        .unwrap_err();
    assert!(matches!(err, GantryError::InvalidArgument(_)));
}

#[test]
fn test_out_of_vocab_tokens_rejected() {
    let tk = tokenizer();
    let oov = tk.vocab_size() as u32 + 1000;
    let registry = ModRegistry::new()
        .with(mod_fn("stray-ids", move |event, ctx| {
            Ok(match event {
                Event::ForwardPass { step: 0, .. } => ctx.actions().force_tokens(vec![oov]),
                Event::Added { step: 1, .. } => ctx.actions().force_output(vec![oov]),
                Event::Added { step: 2, .. } => ctx.actions().backtrack(1, Some(vec![oov])),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    assert_eq!(outputs[0].terminal, TerminalKind::Completed);
    assert_eq!(outputs[0].token_ids, chars(&tk, "abc"));
    assert_eq!(outputs[0].text.as_deref(), Some("abc"));

    let rejected: Vec<_> = sink
        .actions()
        .into_iter()
        .filter(|a| a.action_type != "Noop")
        .collect();
    assert_eq!(rejected.len(), 3);
    for action in &rejected {
        assert_eq!(action.disposition, ActionDisposition::Rejected);
        assert!(action
            .reason
            .as_deref()
            .unwrap()
            .contains("outside the vocabulary"));
    }
}

#[test]
fn test_backtrack_leaves_sibling_caches_alone() {
    let tk = tokenizer();
    let registry = ModRegistry::new()
        .with(mod_fn("undo-two", |event, ctx| {
            Ok(match event {
                Event::Added {
                    request_id, step: 2, ..
                } if request_id == "req-2" => ctx.actions().backtrack(2, None),
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abcde"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(
            (1..=3)
                .map(|i| request(&format!("req-{i}"), chars(&tk, "go"), 5))
                .collect(),
        )
        .unwrap();
    let texts: Vec<&str> = outputs.iter().map(|o| o.text.as_deref().unwrap()).collect();
    assert_eq!(texts, vec!["abcde", "abc", "abcde"]);
    assert!(outputs
        .iter()
        .all(|o| o.terminal == TerminalKind::Completed));

    assert_eq!(engine.model().rewinds(), &[("req-2".to_string(), 2)]);
    for event in sink.events() {
        if event.event_type == EventKind::Added && event.request_id != "req-2" {
            assert_eq!(event.fields["forced"], json!(false));
        }
    }
}

#[test]
fn test_adjust_logits_non_finite_rejected() {
    let tk = tokenizer();
    let vocab = tk.vocab_size();
    let registry = ModRegistry::new()
        .with(mod_fn("nan-steer", move |event, ctx| {
            let bad = match event.step() {
                0 => f32::NAN,
                1 => f32::INFINITY,
                _ => f32::NEG_INFINITY,
            };
            Ok(match event {
                Event::ForwardPass { .. } => {
                    let mut logits = vec![0.0; vocab];
                    logits[0] = bad;
                    ctx.actions().adjust_logits(logits, None)
                }
                _ => Action::Noop,
            })
        }))
        .unwrap();
    let model = scripted(&tk).with_default_script(chars(&tk, "abc"));
    let (mut engine, sink) = build_engine(&tk, model, registry, EngineConfig::default());

    let outputs = engine
        .run_pass(vec![request("req-1", chars(&tk, "go"), 3)])
        .unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("abc"));
    let steering: Vec<_> = sink
        .actions()
        .into_iter()
        .filter(|a| a.action_type == "AdjustLogits")
        .collect();
    assert_eq!(steering.len(), 3);
    for action in &steering {
        assert_eq!(action.disposition, ActionDisposition::Rejected);
        assert!(action.reason.as_deref().unwrap().contains("non-finite"));
    }
}
