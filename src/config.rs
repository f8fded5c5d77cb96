//! Runtime configuration for the podcast binaries.
//!
//! Values are layered: built-in defaults, then the `KEY="value"` env file
//! (`/etc/podcast-env` unless overridden), then the process environment, then
//! whatever the binary's command line sets. Each layer is an [`EnvConfig`]
//! with every field optional; [`RuntimeConfig`] is the resolved result.

use anyhow::{Context, Result, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/podcast-env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_CATALOG_PATH: &str = "podcasts.json";
pub const DEFAULT_CACHE_DIR: &str = "audio_cache";
pub const DEFAULT_CACHE_EXTENSION: &str = "m4a";
pub const DEFAULT_MIN_VALID_BYTES: u64 = 100_000;
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8765";
pub const DEFAULT_RELAY_HEALTH_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RELAY_FETCH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvConfig {
    pub catalog_path: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub cache_extension: Option<String>,
    pub min_valid_bytes: Option<u64>,
    pub relay_url: Option<String>,
    pub relay_health_timeout_ms: Option<u64>,
    pub relay_fetch_timeout_secs: Option<u64>,
    pub yt_dlp_bin: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
}

impl EnvConfig {
    /// Builds a layer from `(KEY, value)` pairs. Unknown keys are ignored and
    /// empty values leave the field unset. `origin` only feeds error messages.
    pub fn from_pairs<I, K, V>(pairs: I, origin: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = Self::default();
        for (key, value) in pairs {
            let value = value.as_ref().trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key.as_ref().trim() {
                "CATALOG_PATH" => cfg.catalog_path = Some(PathBuf::from(value)),
                "CACHE_DIR" => cfg.cache_dir = Some(PathBuf::from(value)),
                "CACHE_EXTENSION" => cfg.cache_extension = Some(value.to_string()),
                "MIN_VALID_BYTES" => {
                    cfg.min_valid_bytes = Some(parse_number(value, "MIN_VALID_BYTES", origin)?)
                }
                "RELAY_URL" => cfg.relay_url = Some(value.trim_end_matches('/').to_string()),
                "RELAY_HEALTH_TIMEOUT_MS" => {
                    cfg.relay_health_timeout_ms =
                        Some(parse_number(value, "RELAY_HEALTH_TIMEOUT_MS", origin)?)
                }
                "RELAY_FETCH_TIMEOUT_SECS" => {
                    cfg.relay_fetch_timeout_secs =
                        Some(parse_number(value, "RELAY_FETCH_TIMEOUT_SECS", origin)?)
                }
                "YT_DLP_BIN" => cfg.yt_dlp_bin = Some(PathBuf::from(value)),
                "PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("Parsing PORT from {origin}"))?;
                    cfg.port = Some(port);
                }
                "HOST" => cfg.host = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(cfg)
    }

    /// Returns a copy of `self` where every field set in `higher` wins.
    pub fn overlay(self, higher: EnvConfig) -> EnvConfig {
        EnvConfig {
            catalog_path: higher.catalog_path.or(self.catalog_path),
            cache_dir: higher.cache_dir.or(self.cache_dir),
            cache_extension: higher.cache_extension.or(self.cache_extension),
            min_valid_bytes: higher.min_valid_bytes.or(self.min_valid_bytes),
            relay_url: higher.relay_url.or(self.relay_url),
            relay_health_timeout_ms: higher
                .relay_health_timeout_ms
                .or(self.relay_health_timeout_ms),
            relay_fetch_timeout_secs: higher
                .relay_fetch_timeout_secs
                .or(self.relay_fetch_timeout_secs),
            yt_dlp_bin: higher.yt_dlp_bin.or(self.yt_dlp_bin),
            port: higher.port.or(self.port),
            host: higher.host.or(self.host),
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str, origin: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {origin}"))
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub catalog_path: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_extension: String,
    pub min_valid_bytes: u64,
    pub relay_url: String,
    pub relay_health_timeout: Duration,
    pub relay_fetch_timeout: Duration,
    pub yt_dlp_bin: PathBuf,
    pub port: u16,
    pub host: String,
}

impl RuntimeConfig {
    pub fn from_env_config(cfg: EnvConfig) -> Result<Self> {
        let cache_extension = cfg
            .cache_extension
            .unwrap_or_else(|| DEFAULT_CACHE_EXTENSION.to_string());
        let cache_extension = cache_extension.trim_start_matches('.').to_string();
        if cache_extension.is_empty()
            || !cache_extension.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            bail!("CACHE_EXTENSION must be alphanumeric, got {cache_extension:?}");
        }

        let relay_url = cfg
            .relay_url
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
        if !relay_url.starts_with("http://") && !relay_url.starts_with("https://") {
            bail!("RELAY_URL must be an http(s) URL, got {relay_url}");
        }

        Ok(Self {
            catalog_path: cfg
                .catalog_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH)),
            cache_dir: cfg
                .cache_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            cache_extension,
            min_valid_bytes: cfg.min_valid_bytes.unwrap_or(DEFAULT_MIN_VALID_BYTES),
            relay_url,
            relay_health_timeout: Duration::from_millis(
                cfg.relay_health_timeout_ms
                    .unwrap_or(DEFAULT_RELAY_HEALTH_TIMEOUT_MS),
            ),
            relay_fetch_timeout: Duration::from_secs(
                cfg.relay_fetch_timeout_secs
                    .unwrap_or(DEFAULT_RELAY_FETCH_TIMEOUT_SECS),
            ),
            yt_dlp_bin: cfg
                .yt_dlp_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP_BIN)),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        })
    }
}

/// Parses an env file of `KEY="value"` lines. Returns `Ok(None)` when the file
/// does not exist.
pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let pairs = content.lines().filter_map(|line| {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        trimmed.split_once('=')
    });
    EnvConfig::from_pairs(pairs, &path.display().to_string()).map(Some)
}

/// Reads the same keys from the process environment.
pub fn read_process_env() -> Result<EnvConfig> {
    EnvConfig::from_pairs(std::env::vars(), "the process environment")
}

/// Resolves the configuration from the env file at `path` plus the process
/// environment, with `overrides` (typically parsed CLI flags) on top.
///
/// A missing file is fine when `required` is false, which is how binaries
/// treat the default path; an explicitly requested file must exist.
pub fn load_runtime_config(
    path: &Path,
    required: bool,
    overrides: EnvConfig,
) -> Result<RuntimeConfig> {
    let file_layer = match read_env_config(path)? {
        Some(cfg) => cfg,
        None if required => return Err(anyhow!("Missing config file at {}", path.display())),
        None => EnvConfig::default(),
    };
    let merged = file_layer.overlay(read_process_env()?).overlay(overrides);
    RuntimeConfig::from_env_config(merged)
}
