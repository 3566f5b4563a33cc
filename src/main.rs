//! LocalRelay command-line entry point.
//!
//! Runs one chat-completion request through the relay and prints the
//! aggregate JSON response or the raw SSE frames.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use localrelay::cache::{ModelCache, ModelRegistry};
use localrelay::inference::config::{find_config_path, load_config};
use localrelay::inference::{RelayConfig, RuntimeSet};
use localrelay::pipeline::{CompletionOutput, CompletionPipeline, CompletionRequest};
use localrelay::tools::ToolRegistry;

/// OpenAI-compatible relay for local model runtimes.
#[derive(Parser, Debug)]
#[command(name = "localrelay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to relay.yaml (default: $LOCALRELAY_CONFIG, then upward search).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to DIR/relay.log instead of stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Merge models installed in the runtimes into the configured set.
    #[arg(long, global = true)]
    discover: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one chat-completion request.
    Complete {
        /// Request body (OpenAI chat-completion JSON), or `-` for stdin.
        request: String,
        /// Force streaming output regardless of the request's `stream` flag.
        #[arg(long)]
        stream: bool,
    },
    /// List the models the relay can serve.
    Models,
    /// Probe every configured runtime.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    localrelay::init_tracing(cli.log_dir.as_deref(), cli.json_logs);

    let config = resolve_config(cli.config.clone(), cli.discover)?;
    let runtimes = RuntimeSet::from_config(&config)?;
    let mut registry = ModelRegistry::from_config(&config);
    if cli.discover {
        registry = registry.merge_discovered(runtimes.discover().await);
    }

    match cli.command {
        Command::Complete { request, stream } => {
            let mut request = read_request(&request)?;
            request.stream |= stream;
            let cache = ModelCache::from_config(registry, runtimes, &config.cache);
            for name in &config.cache.preload {
                cache.preload(name)?;
            }
            let pipeline =
                CompletionPipeline::from_config(cache, ToolRegistry::with_builtins(), &config.pipeline);
            run_request(&pipeline, request).await
        }
        Command::Models => {
            for name in registry.names() {
                if let Some(model) = registry.get(name) {
                    println!(
                        "{name}\t{:?}\t{}\ttools={}\tstreaming={}",
                        model.provider, model.path, model.supports_tools, model.supports_streaming
                    );
                }
            }
            Ok(())
        }
        Command::Health => {
            let mut all_healthy = true;
            for (runtime, healthy) in runtimes.health().await {
                all_healthy &= healthy;
                println!("{runtime}\t{}", if healthy { "ok" } else { "unreachable" });
            }
            if !all_healthy {
                bail!("one or more runtimes are unreachable");
            }
            Ok(())
        }
    }
}

/// Explicit path, then the usual search. Without a file, `--discover` runs
/// on defaults.
fn resolve_config(explicit: Option<PathBuf>, discover: bool) -> Result<RelayConfig> {
    let path = match explicit {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("cannot read working directory")?;
            match find_config_path(&cwd) {
                Ok(path) => path,
                Err(_) if discover => {
                    tracing::info!("no relay.yaml found, using defaults with discovery");
                    return Ok(RelayConfig::default());
                }
                Err(e) => return Err(e).context("no configuration (pass --config or --discover)"),
            }
        }
    };
    load_config(&path).with_context(|| format!("loading {}", path.display()))
}

fn read_request(source: &str) -> Result<CompletionRequest> {
    let raw = if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading request from stdin")?;
        raw
    } else {
        std::fs::read_to_string(source).with_context(|| format!("reading {source}"))?
    };
    serde_json::from_str(&raw).context("request is not a valid chat-completion body")
}

async fn run_request(pipeline: &CompletionPipeline, request: CompletionRequest) -> Result<()> {
    match pipeline.run(request).await {
        Ok(CompletionOutput::Aggregate(completion)) => {
            println!("{}", serde_json::to_string_pretty(&completion.response)?);
            Ok(())
        }
        Ok(CompletionOutput::Stream(mut frames)) => {
            while let Some(frame) = frames.next().await {
                print!("{frame}");
            }
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.to_error_body())?);
            bail!("request failed with status {}", e.status_code())
        }
    }
}
