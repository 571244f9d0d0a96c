//! Demo mods shipped with the `gantry` binary.
//!
//! Every mod instance is shared by all requests in a pass, so per-request
//! state is keyed by request id.

use std::collections::HashMap;

use anyhow::Context;
use gantry_core::{Action, Event};
use gantry_runtime::{Mod, ModContext, ModLogLevel, ModRegistry};

pub const DEMO_MODS: [&str; 4] = ["count", "censor", "stop-after", "counter"];

/// Settings for the demo mods that take parameters.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub banned: String,
    pub replacement: String,
    pub stop_after: usize,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            banned: "scripted".into(),
            replacement: "prepared".into(),
            stop_after: 8,
        }
    }
}

/// Registry with every demo mod, in [`DEMO_MODS`] order.
pub fn demo_registry(options: &DemoOptions) -> gantry_core::Result<ModRegistry> {
    ModRegistry::new()
        .with(CountMod::new("1, 2, 3"))?
        .with(CensorMod::new(&options.banned, &options.replacement))?
        .with(StopAfterMod::new(options.stop_after))?
        .with(CounterMod::default())
}

/// Forces a fixed text on the first forward pass.
pub struct CountMod {
    text: String,
}

impl CountMod {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Mod for CountMod {
    fn name(&self) -> &str {
        "count"
    }

    fn on_event(&mut self, event: &Event, ctx: &mut ModContext<'_>) -> anyhow::Result<Action> {
        match event {
            Event::ForwardPass { step: 0, .. } => Ok(ctx.actions().force_text(&self.text)?),
            _ => Ok(Action::Noop),
        }
    }
}

/// Watches committed text and replaces a banned word as soon as it appears.
pub struct CensorMod {
    banned: String,
    replacement: String,
    committed: HashMap<String, Vec<u32>>,
}

impl CensorMod {
    pub fn new(banned: &str, replacement: &str) -> Self {
        Self {
            banned: banned.to_string(),
            replacement: replacement.to_string(),
            committed: HashMap::new(),
        }
    }

    fn check(
        &mut self,
        request_id: &str,
        added_tokens: &[u32],
        ctx: &mut ModContext<'_>,
    ) -> anyhow::Result<Action> {
        let tokens = self.committed.entry(request_id.to_string()).or_default();
        tokens.extend_from_slice(added_tokens);
        if self.banned.is_empty() {
            return Ok(Action::Noop);
        }
        let text = ctx.tokenizer().decode(tokens)?;
        if !text.ends_with(&self.banned) {
            return Ok(Action::Noop);
        }

        // Fewest trailing tokens whose text covers the banned word.
        let mut n = 0;
        while n < tokens.len() {
            n += 1;
            let tail = ctx.tokenizer().decode(&tokens[tokens.len() - n..])?;
            if tail.len() >= self.banned.len() {
                break;
            }
        }
        let replacement = ctx
            .tokenizer()
            .encode(&self.replacement)
            .with_context(|| format!("encoding replacement {:?}", self.replacement))?;
        tokens.truncate(tokens.len() - n);
        ctx.info(format!(
            "replacing {:?} ({n} tokens) with {:?}",
            self.banned, self.replacement
        ));
        Ok(ctx.actions().backtrack(n, Some(replacement)))
    }
}

impl Mod for CensorMod {
    fn name(&self) -> &str {
        "censor"
    }

    fn on_event(&mut self, event: &Event, ctx: &mut ModContext<'_>) -> anyhow::Result<Action> {
        match event {
            Event::Prefilled {
                request_id,
                step: 0,
                ..
            } => {
                self.committed.insert(request_id.clone(), Vec::new());
                Ok(Action::Noop)
            }
            Event::Added {
                request_id,
                added_tokens,
                ..
            } => self.check(request_id, added_tokens, ctx),
            _ => Ok(Action::Noop),
        }
    }
}

/// Ends a request with the text generated so far once it has `limit` tokens.
pub struct StopAfterMod {
    limit: usize,
    generated: HashMap<String, Vec<u32>>,
}

impl StopAfterMod {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            generated: HashMap::new(),
        }
    }
}

impl Mod for StopAfterMod {
    fn name(&self) -> &str {
        "stop-after"
    }

    fn on_event(&mut self, event: &Event, ctx: &mut ModContext<'_>) -> anyhow::Result<Action> {
        match event {
            Event::Prefilled {
                request_id,
                step: 0,
                ..
            } => {
                self.generated.insert(request_id.clone(), Vec::new());
                Ok(Action::Noop)
            }
            Event::Added {
                request_id,
                added_tokens,
                ..
            } => {
                let tokens = self.generated.entry(request_id.clone()).or_default();
                tokens.extend_from_slice(added_tokens);
                if tokens.len() < self.limit {
                    return Ok(Action::Noop);
                }
                let mut output = std::mem::take(tokens);
                output.truncate(self.limit);
                ctx.info(format!("stopping after {} tokens", output.len()));
                Ok(ctx.actions().force_output(output))
            }
            _ => Ok(Action::Noop),
        }
    }
}

/// Counts `Prefilled` deliveries per request. Only the first one initializes.
#[derive(Default)]
pub struct CounterMod {
    seen: HashMap<String, usize>,
}

impl CounterMod {
    pub fn seen(&self, request_id: &str) -> usize {
        self.seen.get(request_id).copied().unwrap_or(0)
    }
}

impl Mod for CounterMod {
    fn name(&self) -> &str {
        "counter"
    }

    fn on_event(&mut self, event: &Event, ctx: &mut ModContext<'_>) -> anyhow::Result<Action> {
        if let Event::Prefilled {
            request_id, step, ..
        } = event
        {
            let count = self.seen.entry(request_id.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                ctx.info(format!("initialized at step {step}"));
            } else {
                ctx.log(
                    ModLogLevel::Debug,
                    format!("prefilled seen {count} times, already initialized"),
                );
            }
        }
        Ok(Action::Noop)
    }
}
