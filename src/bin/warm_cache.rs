#![forbid(unsafe_code)]

//! Pre-downloads popular episodes from the relay into the audio cache.
//! Meant to run from cron next to the backend, sharing its env file.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use podcast_tools::{
    cache::FsCacheIndex,
    catalog::JsonCatalog,
    config::{DEFAULT_CONFIG_PATH, EnvConfig, load_runtime_config},
    relay::HttpRelay,
    resolver::{ResolutionEngine, WarmPolicy, WarmSummary},
    security::ensure_not_root,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cache popular podcast episodes ahead of time.")]
struct WarmArgs {
    #[arg(long, env = "PODCAST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long, value_name = "PATH")]
    catalog: Option<PathBuf>,
    #[arg(long = "cache-dir", value_name = "PATH")]
    cache_dir: Option<PathBuf>,
    #[arg(long = "relay-url", value_name = "URL")]
    relay_url: Option<String>,
    /// Maximum number of episodes to materialize in this run.
    #[arg(long, default_value_t = WarmPolicy::default().batch_size)]
    limit: usize,
    /// Only episodes strictly longer than this many seconds.
    #[arg(long = "min-duration", default_value_t = WarmPolicy::default().min_duration_secs)]
    min_duration: u64,
    /// Only episodes strictly shorter than this many seconds.
    #[arg(long = "max-duration", default_value_t = WarmPolicy::default().max_duration_secs)]
    max_duration: u64,
}

impl WarmArgs {
    fn policy(&self) -> Result<WarmPolicy> {
        if self.min_duration >= self.max_duration {
            anyhow::bail!(
                "--min-duration ({}) must be below --max-duration ({})",
                self.min_duration,
                self.max_duration
            );
        }
        Ok(WarmPolicy {
            min_duration_secs: self.min_duration,
            max_duration_secs: self.max_duration,
            batch_size: self.limit,
        })
    }

    fn overrides(&self) -> EnvConfig {
        EnvConfig {
            catalog_path: self.catalog.clone(),
            cache_dir: self.cache_dir.clone(),
            relay_url: self.relay_url.clone(),
            ..EnvConfig::default()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podcast_tools=info,warm_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = WarmArgs::parse();
    let outcome = ensure_not_root("warm_cache").and_then(|()| run(args));
    match outcome {
        Ok(summary) if summary.failed_count == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: WarmArgs) -> Result<WarmSummary> {
    let policy = args.policy()?;
    let config = load_runtime_config(
        &args.config,
        args.config != PathBuf::from(DEFAULT_CONFIG_PATH),
        args.overrides(),
    )
    .context("loading configuration")?;

    let cache = FsCacheIndex::open(&config.cache_dir, config.cache_extension.clone())
        .context("initializing audio cache")?;
    let engine = ResolutionEngine::new(
        Arc::new(JsonCatalog::new(&config.catalog_path)),
        Arc::new(cache),
        Arc::new(HttpRelay::new(
            config.relay_url.clone(),
            config.relay_health_timeout,
            config.relay_fetch_timeout,
        )),
        config.min_valid_bytes,
    );

    let summary = engine.warm_popular(&policy)?;
    for failure in &summary.failures {
        warn!(id = %failure.content_id, "{}", failure.error);
    }
    info!(
        cached = summary.cached_count,
        failed = summary.failed_count,
        considered = summary.total_considered,
        "cache warm finished"
    );
    Ok(summary)
}
