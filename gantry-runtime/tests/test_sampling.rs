use gantry_core::{SampleInput, Sampler, SamplingParams};
use gantry_runtime::sampling::LogitAdjuster;
use gantry_runtime::CpuSampler;

fn input<'a>(logits: &'a [f32], params: &'a SamplingParams, step: usize) -> SampleInput<'a> {
    SampleInput {
        request_id: "req",
        logits,
        params,
        temperature_override: None,
        history: &[],
        step,
    }
}

#[test]
fn test_greedy_sampling() {
    let logits = vec![0.1, 0.3, 0.9, 0.2];
    let params = SamplingParams::greedy();
    let result = CpuSampler.sample_one(&input(&logits, &params, 0)).unwrap();
    assert_eq!(result.token_id, 2);
    assert!(result.logprob < 0.0);
}

#[test]
fn test_temperature_override_forces_greedy() {
    let logits = vec![1.0, 1.1, 1.0];
    let params = SamplingParams::default();
    let mut sample = input(&logits, &params, 0);
    sample.temperature_override = Some(0.0);
    for _ in 0..20 {
        assert_eq!(CpuSampler.sample_one(&sample).unwrap().token_id, 1);
    }
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let logits = vec![1.0, 1.0, 1.0, 1.0, 1.0];
    let params = SamplingParams {
        seed: Some(42),
        ..Default::default()
    };
    let first: Vec<u32> = (0..10)
        .map(|step| CpuSampler.sample_one(&input(&logits, &params, step)).unwrap().token_id)
        .collect();
    let second: Vec<u32> = (0..10)
        .map(|step| CpuSampler.sample_one(&input(&logits, &params, step)).unwrap().token_id)
        .collect();
    assert_eq!(first, second);
}

#[test]
fn test_top_k_one_matches_greedy() {
    let logits = vec![0.5, 2.0, 1.5, -1.0];
    let params = SamplingParams {
        top_k: Some(1),
        ..Default::default()
    };
    for step in 0..20 {
        let result = CpuSampler.sample_one(&input(&logits, &params, step)).unwrap();
        assert_eq!(result.token_id, 1);
        assert!(result.logprob.abs() < 1e-6);
    }
}

#[test]
fn test_top_p_keeps_nucleus() {
    // Token 0 holds nearly all mass.
    let logits = vec![10.0, 0.0, 0.0, 0.0];
    let params = SamplingParams {
        top_p: 0.5,
        seed: Some(7),
        ..Default::default()
    };
    for step in 0..20 {
        assert_eq!(
            CpuSampler.sample_one(&input(&logits, &params, step)).unwrap().token_id,
            0
        );
    }
}

#[test]
fn test_min_p_prunes_unlikely_tokens() {
    let logits = vec![5.0, 4.9, -5.0, -5.0];
    let params = SamplingParams {
        min_p: Some(0.5),
        seed: Some(3),
        ..Default::default()
    };
    for step in 0..50 {
        let token = CpuSampler.sample_one(&input(&logits, &params, step)).unwrap().token_id;
        assert!(token == 0 || token == 1);
    }
}

#[test]
fn test_repetition_penalty_changes_choice() {
    let logits = vec![2.0, 1.9, 0.0];
    let params = SamplingParams {
        repetition_penalty: 2.0,
        ..SamplingParams::greedy()
    };
    let mut sample = input(&logits, &params, 0);
    let history = [0u32, 0, 0];
    sample.history = &history;
    assert_eq!(CpuSampler.sample_one(&sample).unwrap().token_id, 1);
}

#[test]
fn test_adjuster_penalizes_each_token_once() {
    let params = SamplingParams {
        repetition_penalty: 2.0,
        ..Default::default()
    };
    let mut logits = vec![4.0, -1.0, 3.0];
    LogitAdjuster::new(&params, None).apply(&mut logits, &[0, 0, 1]);
    assert!((logits[0] - 2.0).abs() < 1e-6);
    assert!((logits[1] + 2.0).abs() < 1e-6);
    assert!((logits[2] - 3.0).abs() < 1e-6);
}

#[test]
fn test_adjuster_temperature_scaling() {
    let params = SamplingParams {
        temperature: 0.5,
        ..Default::default()
    };
    let mut logits = vec![1.0, 2.0, 3.0];
    LogitAdjuster::new(&params, None).apply(&mut logits, &[]);
    assert!((logits[0] - 2.0).abs() < 1e-5);
    assert!((logits[2] - 6.0).abs() < 1e-5);

    let mut logits = vec![1.0, 2.0];
    LogitAdjuster::new(&params, Some(2.0)).apply(&mut logits, &[]);
    assert!((logits[1] - 1.0).abs() < 1e-5);
}

#[test]
fn test_empty_logits_is_error() {
    let params = SamplingParams::greedy();
    assert!(CpuSampler.sample_one(&input(&[], &params, 0)).is_err());
}

#[test]
fn test_batch_preserves_order() {
    let a = vec![0.0, 9.0, 0.0];
    let b = vec![9.0, 0.0, 0.0];
    let params = SamplingParams::greedy();
    let batch = vec![input(&a, &params, 0), input(&b, &params, 0)];
    let results = CpuSampler.sample(&batch).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].token_id, 1);
    assert_eq!(results[1].token_id, 0);
}
