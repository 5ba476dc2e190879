mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use warden_engine::bundle::{build_to_file, BuildParams};
use warden_engine::BuiltinRegistry;
use warden_runtime::{Config, ExplainMode, QueryOptions, Runtime, RuntimeOptions};

use crate::cli::{BuildArgs, CliArgs, Command, LogFormat, QueryArgs, RunArgs, RuntimeArgs, StatusArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_format);

    match args.command {
        Command::Run(run_args) => run(run_args).await,
        Command::Query(query_args) => query(query_args).await,
        Command::Build(build_args) => build(build_args),
        Command::Status(status_args) => status(status_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &RuntimeArgs) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    config.local_bundles.paths.extend(args.bundles.iter().cloned());
    if args.skip_verification {
        config.local_bundles.skip_verification = true;
    }
    Ok(config)
}

async fn start(config: Config) -> Result<Arc<Runtime>> {
    let rt = Runtime::new(config, RuntimeOptions::default())
        .await
        .context("failed to initialize runtime")?;
    rt.start().await.context("failed to start plugins")?;
    Ok(rt)
}

// ── run ───────────────────────────────────────────────────────

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.runtime)?;
    if args.watch {
        config.local_bundles.watch = true;
    }
    let wait = Duration::from_secs(config.max_plugin_wait_time_seconds);
    let rt = start(config).await?;

    match rt.wait_for_ready(wait).await {
        Ok(()) => info!("runtime ready"),
        Err(e) => warn!(error = %e, code = e.code(), "runtime not ready yet, continuing"),
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutting down");
    rt.stop().await;
    Ok(())
}

// ── query ─────────────────────────────────────────────────────

fn read_input(args: &QueryArgs) -> Result<Option<Value>> {
    if let Some(raw) = &args.input {
        return Ok(Some(serde_json::from_str(raw).context("--input is not valid JSON")?));
    }
    if let Some(path) = &args.input_file {
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(Some(
            serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?,
        ));
    }
    Ok(None)
}

async fn query(args: QueryArgs) -> Result<()> {
    let input = read_input(&args)?;
    let config = load_config(&args.runtime)?;
    let rt = Runtime::new(config, RuntimeOptions::default())
        .await
        .context("failed to initialize runtime")?;

    let options = QueryOptions {
        explain: ExplainMode::from(args.explain.as_str()),
        pretty: args.pretty,
        include_metrics: args.metrics,
        include_instrumentation: args.instrument,
    };
    let outcome = rt.query(&args.query, input.as_ref(), &options).await;
    rt.stop().await;

    let result = outcome.with_context(|| format!("query {:?} failed", args.query))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// ── build ─────────────────────────────────────────────────────

fn build(args: BuildArgs) -> Result<()> {
    let params = BuildParams {
        revision: args.revision,
        digests: args.digests,
        ignore: args.ignore,
        ..BuildParams::default()
    };
    let manifest = build_to_file(&args.paths, &params, &BuiltinRegistry::with_defaults(), &args.output)
        .with_context(|| format!("failed to build {}", args.output.display()))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

// ── status ────────────────────────────────────────────────────

async fn status(args: StatusArgs) -> Result<()> {
    let config = load_config(&args.runtime)?;
    let wait = Duration::from_secs(args.timeout.unwrap_or(config.max_plugin_wait_time_seconds));
    let rt = start(config).await?;

    let ready = rt.wait_for_ready(wait).await;
    println!("{}", serde_json::to_string_pretty(rt.status().as_ref())?);
    rt.stop().await;

    if let Err(e) = ready {
        bail!("runtime is not ready ({}): {e}", e.code());
    }
    Ok(())
}
