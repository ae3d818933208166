use anyhow::{anyhow, Result};
use std::path::PathBuf;

/// Connection settings shared by every subcommand.
/// Configuration priority: CLI args > Environment variables > Defaults
#[derive(clap::Args, Debug)]
pub struct ClientArgs {
    /// Backend origin, e.g. https://admin.example.com
    #[arg(long, env = "ADMINBASE_URL")]
    pub base_url: Option<String>,

    /// Request timeout in milliseconds (1000-600000)
    #[arg(long, env = "ADMINBASE_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Bound on waiting for authentication in milliseconds (1000-600000)
    #[arg(long, env = "ADMINBASE_AUTH_WAIT_MS")]
    pub auth_wait_ms: Option<u64>,

    /// How long a download may hold its per-URL lock, in milliseconds (100-60000)
    #[arg(long, env = "ADMINBASE_LOCK_TIMEOUT_MS")]
    pub lock_timeout_ms: Option<u64>,

    /// TTL for cached responses in milliseconds (1000-86400000)
    #[arg(long, env = "ADMINBASE_CACHE_TTL_MS")]
    pub cache_ttl_ms: Option<u64>,

    /// Hard cap on 401-triggered retries of a single call (0-10)
    #[arg(long, env = "ADMINBASE_AUTH_RETRY_MAX")]
    pub auth_retry_max: Option<u32>,

    /// Session state file (defaults to the platform data dir)
    #[arg(long, env = "ADMINBASE_SESSION_FILE")]
    pub session_file: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub auth_wait_ms: u64,
    pub lock_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub auth_retry_max: u32,
    pub session_file: Option<PathBuf>,
}

/// Validate that a value is within a given range (inclusive)
fn validate_in_range<T>(val: T, min: T, max: T, name: &str) -> Result<T>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if val < min || val > max {
        Err(anyhow!("{name} must be in range [{min}, {max}], got {val}"))
    } else {
        Ok(val)
    }
}

fn validate_url(url: &str, name: &str) -> Result<()> {
    if url.is_empty() {
        return Err(anyhow!("{name} cannot be empty"));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!("{name} must start with http:// or https://"))
    }
}

/// Build a validated configuration from parsed CLI args (clap already folds
/// in the environment variables).
pub fn load(args: &ClientArgs) -> Result<Config> {
    let base_url = args
        .base_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:3000".to_string());
    validate_url(&base_url, "ADMINBASE_URL")?;

    let request_timeout_ms = validate_in_range(
        args.request_timeout_ms.unwrap_or(30_000),
        1_000,
        600_000,
        "ADMINBASE_TIMEOUT_MS",
    )?;

    let auth_wait_ms = validate_in_range(
        args.auth_wait_ms.unwrap_or(120_000),
        1_000,
        600_000,
        "ADMINBASE_AUTH_WAIT_MS",
    )?;

    let lock_timeout_ms = validate_in_range(
        args.lock_timeout_ms.unwrap_or(5_000),
        100,
        60_000,
        "ADMINBASE_LOCK_TIMEOUT_MS",
    )?;

    let cache_ttl_ms = validate_in_range(
        args.cache_ttl_ms.unwrap_or(3_600_000),
        1_000,
        86_400_000,
        "ADMINBASE_CACHE_TTL_MS",
    )?;

    let auth_retry_max = validate_in_range(
        args.auth_retry_max.unwrap_or(3),
        0,
        10,
        "ADMINBASE_AUTH_RETRY_MAX",
    )?;

    Ok(Config {
        base_url,
        request_timeout_ms,
        auth_wait_ms,
        lock_timeout_ms,
        cache_ttl_ms,
        auth_retry_max,
        session_file: args.session_file.clone(),
    })
}

impl Config {
    pub fn log_summary(&self) {
        log::debug!("adminbase configuration:");
        log::debug!("  Base URL: {}", self.base_url);
        log::debug!("  Request timeout: {}ms", self.request_timeout_ms);
        log::debug!("  Auth wait: {}ms", self.auth_wait_ms);
        log::debug!("  Lock timeout: {}ms", self.lock_timeout_ms);
        log::debug!("  Cache TTL: {}ms", self.cache_ttl_ms);
        log::debug!("  Auth retry cap: {}", self.auth_retry_max);
    }
}
