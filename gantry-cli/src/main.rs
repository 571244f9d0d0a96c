//! gantry: run prompts through the mod-dispatch engine with the demo mods.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gantry_cli::mods::{demo_registry, DemoOptions, DEMO_MODS};
use gantry_cli::tokenizer::HfTokenizer;
use gantry_core::{InferenceRequest, SamplingParams, Tokenizer, VocabTokenizer};
use gantry_runtime::{
    CpuSampler, Engine, EngineCommand, EngineConfig, EngineEvent, JsonlSink, NullSink,
    ScriptedModel, TraceSink,
};

const DEFAULT_SCRIPT: &str = "Hello there, this is a scripted completion.";

/// Multi-character tokens added to the built-in vocabulary.
const DEMO_WORDS: [&str; 6] = ["Hello", " there", "1,", " 2,", " 3", "Count to 3:"];

#[derive(Parser)]
#[command(name = "gantry", about = "Run prompts through the gantry mod-dispatch engine")]
struct Cli {
    /// Prompt text; repeat the flag or pass several values for a batch
    #[arg(long = "prompt", required = true, num_args = 1..)]
    prompts: Vec<String>,

    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hugging Face tokenizer.json; defaults to a built-in ASCII vocabulary
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Continuation the scripted model produces for every request
    #[arg(long, default_value = DEFAULT_SCRIPT)]
    script: String,

    /// Demo mods to attach to every request (count, censor, stop-after, counter)
    #[arg(long, value_delimiter = ',')]
    mods: Vec<String>,

    /// Step budget per request; overrides `default_max_steps` from the config
    #[arg(long)]
    max_steps: Option<usize>,

    /// Write the JSONL trace here
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Seed for sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Sampling temperature; 0 is greedy
    #[arg(long, default_value = "1.0")]
    temperature: f32,

    /// Word the censor mod replaces
    #[arg(long, default_value = "scripted")]
    ban: String,

    /// Replacement used by the censor mod
    #[arg(long, default_value = "prepared")]
    replacement: String,

    /// Token limit for the stop-after mod
    #[arg(long, default_value = "8")]
    stop_after: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(max_steps) = cli.max_steps {
        config.default_max_steps = max_steps;
    }
    config.validate()?;

    let tokenizer: Arc<dyn Tokenizer> = match &cli.tokenizer {
        Some(path) => Arc::new(HfTokenizer::from_file(path)?),
        None => Arc::new(VocabTokenizer::ascii_with(DEMO_WORDS).with_eos("</s>")),
    };
    let eos = tokenizer
        .eos_token_id()
        .context("tokenizer has no EOS token")?;
    info!(vocab_size = tokenizer.vocab_size(), eos, "tokenizer loaded");

    let script = tokenizer.encode(&cli.script)?;
    let model = ScriptedModel::new(
        tokenizer.vocab_size(),
        eos,
        config.max_batch_size.min(cli.prompts.len()),
        config.max_request_tokens,
    )
    .with_default_script(script);

    for name in &cli.mods {
        if !DEMO_MODS.contains(&name.as_str()) {
            anyhow::bail!("unknown mod {name:?}, expected one of {DEMO_MODS:?}");
        }
    }
    let registry = demo_registry(&DemoOptions {
        banned: cli.ban.clone(),
        replacement: cli.replacement.clone(),
        stop_after: cli.stop_after,
    })?;

    let sink: Box<dyn TraceSink> = match &cli.trace {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create trace {}", path.display()))?;
            Box::new(JsonlSink::new(BufWriter::new(file)))
        }
        None => Box::new(NullSink),
    };

    let mut engine = Engine::new(
        model,
        CpuSampler::new(),
        tokenizer.clone(),
        registry,
        config,
    )?;
    engine.set_trace(sink);

    let (command_tx, command_rx) = mpsc::channel(1024);
    let (event_tx, mut event_rx) = mpsc::channel(1024);
    let engine_task = tokio::spawn(async move { engine.run(command_rx, event_tx).await });

    let params = SamplingParams {
        temperature: cli.temperature,
        seed: cli.seed,
        ..Default::default()
    };
    for (i, prompt) in cli.prompts.iter().enumerate() {
        let request = InferenceRequest::new(format!("req-{i}"), tokenizer.encode(prompt)?)
            .with_sampling(params.clone())
            .with_mods(cli.mods.iter().cloned());
        submit(&command_tx, EngineCommand::Submit(request)).await?;
    }
    submit(&command_tx, EngineCommand::Shutdown).await?;

    let mut failed = 0;
    while let Some(event) = event_rx.recv().await {
        match event {
            EngineEvent::Finished(output) => println!("{}", serde_json::to_string(&output)?),
            EngineEvent::Cancelled { request_id } => info!(request_id = %request_id, "request cancelled"),
            EngineEvent::Error { request_id, error } => {
                error!(request_id = %request_id, error = %error, "request failed");
                failed += 1;
            }
        }
    }
    engine_task.await??;

    if failed > 0 {
        anyhow::bail!("{failed} request(s) failed");
    }
    Ok(())
}

async fn submit(tx: &mpsc::Sender<EngineCommand>, command: EngineCommand) -> anyhow::Result<()> {
    tx.send(command)
        .await
        .map_err(|_| anyhow::anyhow!("engine stopped before accepting all commands"))
}
