//! Mods: user callbacks invoked on every generation event.
//!
//! A mod receives the event and a [`ModContext`] giving it the tokenizer, an
//! [`Actions`] constructor and a log sink, and answers with one [`Action`].
//! Mod instances are shared by every request they are attached to, so any
//! state they keep must be keyed by `request_id`. `Prefilled` is re-fired at
//! the start of every step; initialization on it must be guarded.

use std::collections::HashMap;

use gantry_core::{Action, Event, GantryError, Result, Tokenizer};
use serde::Serialize;
use serde_json::Value;

pub trait Mod: Send {
    fn name(&self) -> &str;

    fn on_event(&mut self, event: &Event, ctx: &mut ModContext<'_>) -> anyhow::Result<Action>;
}

/// A mod built from a closure.
pub struct FnMod<F> {
    name: String,
    f: F,
}

pub fn mod_fn<F>(name: impl Into<String>, f: F) -> FnMod<F>
where
    F: FnMut(&Event, &mut ModContext<'_>) -> anyhow::Result<Action> + Send,
{
    FnMod {
        name: name.into(),
        f,
    }
}

impl<F> Mod for FnMod<F>
where
    F: FnMut(&Event, &mut ModContext<'_>) -> anyhow::Result<Action> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&mut self, event: &Event, ctx: &mut ModContext<'_>) -> anyhow::Result<Action> {
        (self.f)(event, ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct ModLogLine {
    pub level: ModLogLevel,
    pub message: String,
}

/// Action constructors, including the ones that go through the tokenizer.
#[derive(Clone, Copy)]
pub struct Actions<'a> {
    tokenizer: &'a dyn Tokenizer,
}

impl<'a> Actions<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer) -> Self {
        Self { tokenizer }
    }

    pub fn noop(&self) -> Action {
        Action::Noop
    }

    pub fn adjust_prefill(&self, tokens: Vec<u32>, max_steps: Option<usize>) -> Action {
        Action::AdjustPrefill { tokens, max_steps }
    }

    pub fn force_tokens(&self, tokens: Vec<u32>) -> Action {
        Action::ForceTokens { tokens }
    }

    pub fn force_text(&self, text: &str) -> Result<Action> {
        Ok(Action::ForceTokens {
            tokens: self.tokenizer.encode(text)?,
        })
    }

    pub fn adjust_logits(&self, logits: Vec<f32>, token_temp: Option<f32>) -> Action {
        Action::AdjustLogits { logits, token_temp }
    }

    pub fn backtrack(&self, n: usize, replacement_tokens: Option<Vec<u32>>) -> Action {
        Action::Backtrack {
            n,
            replacement_tokens,
        }
    }

    pub fn force_output(&self, tokens: Vec<u32>) -> Action {
        Action::ForceOutput { tokens }
    }

    pub fn force_output_text(&self, text: &str) -> Result<Action> {
        Ok(Action::ForceOutput {
            tokens: self.tokenizer.encode(text)?,
        })
    }

    pub fn tool_calls(&self, payload: Value) -> Action {
        Action::ToolCalls { payload }
    }

    pub fn emit_error(&self, message: impl Into<String>) -> Action {
        Action::EmitError {
            message: message.into(),
        }
    }
}

/// Capabilities handed to a mod for a single call.
pub struct ModContext<'a> {
    tokenizer: &'a dyn Tokenizer,
    logs: Vec<ModLogLine>,
}

impl<'a> ModContext<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            tokenizer,
            logs: Vec::new(),
        }
    }

    pub fn tokenizer(&self) -> &'a dyn Tokenizer {
        self.tokenizer
    }

    pub fn actions(&self) -> Actions<'a> {
        Actions::new(self.tokenizer)
    }

    pub fn log(&mut self, level: ModLogLevel, message: impl Into<String>) {
        self.logs.push(ModLogLine {
            level,
            message: message.into(),
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(ModLogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(ModLogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(ModLogLevel::Error, message);
    }

    pub fn take_logs(&mut self) -> Vec<ModLogLine> {
        std::mem::take(&mut self.logs)
    }
}

/// Ordered set of mods. Registration order is dispatch order.
#[derive(Default)]
pub struct ModRegistry {
    mods: Vec<Box<dyn Mod>>,
    by_name: HashMap<String, usize>,
    version: u64,
}

impl ModRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, m: Box<dyn Mod>) -> Result<usize> {
        let name = m.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(GantryError::InvalidArgument(format!(
                "mod {name:?} is already registered"
            )));
        }
        let id = self.mods.len();
        self.by_name.insert(name, id);
        self.mods.push(m);
        Ok(id)
    }

    pub fn with<M: Mod + 'static>(mut self, m: M) -> Result<Self> {
        self.register(Box::new(m))?;
        Ok(self)
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Registry indices for `names`, or every mod when `names` is `None`.
    pub fn resolve(&self, names: Option<&[String]>) -> Result<Vec<usize>> {
        match names {
            None => Ok((0..self.mods.len()).collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.lookup(name).ok_or_else(|| {
                        GantryError::InvalidArgument(format!("unknown mod {name:?}"))
                    })
                })
                .collect(),
        }
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut (dyn Mod + 'static)> {
        self.mods.get_mut(id).map(|m| m.as_mut())
    }

    pub fn names(&self) -> Vec<&str> {
        self.mods.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
