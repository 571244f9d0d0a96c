use crate::{Result, SamplingParams};

#[derive(Debug, Clone)]
pub struct SampleInput<'a> {
    pub request_id: &'a str,
    pub logits: &'a [f32],
    pub params: &'a SamplingParams,
    /// Replaces `params.temperature` for this draw only.
    pub temperature_override: Option<f32>,
    /// Prompt plus generated tokens, for repetition penalty.
    pub history: &'a [u32],
    pub step: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleResult {
    pub token_id: u32,
    pub logprob: f32,
}

pub trait Sampler: Send {
    /// Draw one token per input, in input order.
    fn sample(&mut self, batch: &[SampleInput<'_>]) -> Result<Vec<SampleResult>>;
}
