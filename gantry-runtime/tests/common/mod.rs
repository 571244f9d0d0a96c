#![allow(dead_code)]

use std::sync::Arc;

use gantry_core::{InferenceRequest, SamplingParams, Tokenizer, VocabTokenizer};
use gantry_runtime::{CpuSampler, Engine, EngineConfig, MemorySink, ModRegistry, ScriptedModel};

pub type TestEngine = Engine<ScriptedModel, CpuSampler>;

/// Printable ASCII plus a few multi-character words and `</s>` as EOS.
pub fn tokenizer() -> Arc<VocabTokenizer> {
    Arc::new(
        VocabTokenizer::ascii_with(["Count", " to", " 3:", "1,", "2,"]).with_eos("</s>"),
    )
}

pub fn tok(tokenizer: &VocabTokenizer, piece: &str) -> u32 {
    tokenizer.token_id(piece).unwrap()
}

/// One token per character of `text`.
pub fn chars(tokenizer: &VocabTokenizer, text: &str) -> Vec<u32> {
    text.chars()
        .map(|c| tok(tokenizer, &c.to_string()))
        .collect()
}

pub fn scripted(tokenizer: &VocabTokenizer) -> ScriptedModel {
    ScriptedModel::new(
        tokenizer.vocab_size(),
        tokenizer.eos_token_id().unwrap(),
        8,
        512,
    )
}

pub fn request(id: &str, prompt: Vec<u32>, max_steps: usize) -> InferenceRequest {
    InferenceRequest::new(id, prompt)
        .with_sampling(SamplingParams::greedy())
        .with_max_steps(max_steps)
}

pub fn build_engine(
    tokenizer: &Arc<VocabTokenizer>,
    model: ScriptedModel,
    registry: ModRegistry,
    config: EngineConfig,
) -> (TestEngine, MemorySink) {
    let sink = MemorySink::new();
    let tokenizer: Arc<dyn Tokenizer> = tokenizer.clone();
    let engine = Engine::new(model, CpuSampler::new(), tokenizer, registry, config)
        .unwrap()
        .with_trace(sink.clone());
    (engine, sink)
}
