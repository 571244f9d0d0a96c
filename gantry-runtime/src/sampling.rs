//! CPU reference sampler.
//!
//! Penalties and temperature work in the logit domain; top-k, top-p and
//! min-p prune a probability-sorted candidate list before the multinomial
//! draw.

use std::collections::HashSet;

use gantry_core::{GantryError, Result, SampleInput, SampleResult, Sampler, SamplingParams};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Logit-domain adjustments applied before any candidate pruning.
pub struct LogitAdjuster {
    temperature: f32,
    repetition_penalty: f32,
}

impl LogitAdjuster {
    pub fn new(params: &SamplingParams, temperature_override: Option<f32>) -> Self {
        Self {
            temperature: temperature_override.unwrap_or(params.temperature),
            repetition_penalty: params.repetition_penalty,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    pub fn apply(&self, logits: &mut [f32], history: &[u32]) {
        self.apply_repetition_penalty(logits, history);
        self.apply_temperature(logits);
    }

    /// Each distinct token in `history` is penalized once.
    fn apply_repetition_penalty(&self, logits: &mut [f32], history: &[u32]) {
        if (self.repetition_penalty - 1.0).abs() < f32::EPSILON {
            return;
        }
        let seen: HashSet<u32> = history.iter().copied().collect();
        for token_id in seen {
            if let Some(logit) = logits.get_mut(token_id as usize) {
                if *logit > 0.0 {
                    *logit /= self.repetition_penalty;
                } else {
                    *logit *= self.repetition_penalty;
                }
            }
        }
    }

    fn apply_temperature(&self, logits: &mut [f32]) {
        if self.is_greedy() || (self.temperature - 1.0).abs() < f32::EPSILON {
            return;
        }
        for logit in logits.iter_mut() {
            *logit /= self.temperature;
        }
    }
}

/// Token candidates sorted by descending probability.
struct Candidates {
    items: Vec<(u32, f32)>,
}

impl Candidates {
    fn from_logits(logits: &[f32]) -> Self {
        let probs = softmax(logits);
        let mut items: Vec<(u32, f32)> = probs
            .into_iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p))
            .collect();
        items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Self { items }
    }

    /// `k == 0` keeps everything.
    fn top_k(&mut self, k: usize) {
        if k > 0 {
            self.items.truncate(k);
        }
    }

    /// Smallest prefix whose cumulative probability exceeds `top_p`.
    fn top_p(&mut self, top_p: f32) {
        if top_p >= 1.0 {
            return;
        }
        let mut cumulative = 0.0;
        let mut keep = self.items.len();
        for (i, &(_, p)) in self.items.iter().enumerate() {
            cumulative += p;
            if cumulative > top_p {
                keep = i + 1;
                break;
            }
        }
        self.items.truncate(keep.max(1));
    }

    fn min_p(&mut self, min_p: f32) {
        let Some(&(_, max_prob)) = self.items.first() else {
            return;
        };
        let threshold = min_p * max_prob;
        self.items.retain(|&(_, p)| p >= threshold);
    }

    fn total(&self) -> f32 {
        self.items.iter().map(|&(_, p)| p).sum()
    }

    /// Draw with probability proportional to the surviving mass.
    fn draw(&self, rng: &mut dyn RngCore) -> Option<SampleResult> {
        let total = self.total();
        if total <= 0.0 || !total.is_finite() {
            return None;
        }
        let r: f32 = rng.r#gen::<f32>() * total;
        let mut cumulative = 0.0;
        for &(token_id, p) in &self.items {
            cumulative += p;
            if cumulative >= r {
                return Some(SampleResult {
                    token_id,
                    logprob: (p / total).ln(),
                });
            }
        }
        self.items.last().map(|&(token_id, p)| SampleResult {
            token_id,
            logprob: (p / total).ln(),
        })
    }
}

/// Greedy or seeded multinomial sampling on the CPU.
///
/// With a seed, each draw uses an `StdRng` seeded from `seed + step` so a
/// request replays identically regardless of what else is in the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuSampler;

impl CpuSampler {
    pub fn new() -> Self {
        Self
    }

    pub fn sample_one(&self, input: &SampleInput<'_>) -> Result<SampleResult> {
        if input.logits.is_empty() {
            return Err(GantryError::Sampler(format!(
                "empty logits for request {}",
                input.request_id
            )));
        }
        let adjuster = LogitAdjuster::new(input.params, input.temperature_override);
        let mut logits = input.logits.to_vec();
        adjuster.apply(&mut logits, input.history);

        if adjuster.is_greedy() {
            return greedy(&logits);
        }

        let params = input.params;
        let mut candidates = Candidates::from_logits(&logits);
        if let Some(k) = params.top_k {
            candidates.top_k(k);
        }
        candidates.top_p(params.top_p);
        if let Some(min_p) = params.min_p {
            candidates.min_p(min_p);
        }

        let mut rng: Box<dyn RngCore> = match params.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed.wrapping_add(input.step as u64))),
            None => Box::new(rand::thread_rng()),
        };
        match candidates.draw(rng.as_mut()) {
            Some(result) => Ok(result),
            None => greedy(&logits),
        }
    }
}

impl Sampler for CpuSampler {
    fn sample(&mut self, batch: &[SampleInput<'_>]) -> Result<Vec<SampleResult>> {
        batch.iter().map(|input| self.sample_one(input)).collect()
    }
}

fn greedy(logits: &[f32]) -> Result<SampleResult> {
    let (token_id, _) = logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| GantryError::Sampler("empty logits".into()))?;
    let p = softmax(logits)[token_id];
    Ok(SampleResult {
        token_id: token_id as u32,
        logprob: if p > 0.0 { p.ln() } else { f32::NEG_INFINITY },
    })
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
