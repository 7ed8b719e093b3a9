use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Args;

/// Default URL cache directory, relative to the working directory
pub const DEFAULT_MEDIA_DIR: &str = "temp/media";
/// User-Agent for URL downloads
pub const USER_AGENT: &str = "Skyalt/0.1";

/// Runtime tunables of the sidecar
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// URL cache directory
    pub media_dir: PathBuf,
    /// Overall limit for one URL download
    pub download_timeout: Duration,
    pub user_agent: String,
    /// Time between maintenance cycles
    pub sweep_interval: Duration,
    /// Entries unused for longer are evicted
    pub idle_timeout: Duration,
    /// Media parse polling: `parse_attempts` polls, `parse_poll` apart
    pub parse_poll: Duration,
    pub parse_attempts: u32,
    /// Upper bound for a paused seek to become visible
    pub seek_deadline: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from(DEFAULT_MEDIA_DIR),
            download_timeout: Duration::from_secs(30 * 60),
            user_agent: USER_AGENT.to_string(),
            sweep_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            parse_poll: Duration::from_millis(100),
            parse_attempts: 100,
            seek_deadline: Duration::from_secs(2),
        }
    }
}

impl SidecarConfig {
    /// Create config from CLI arguments and environment variables
    ///
    /// Priority: CLI args → ENV var → defaults
    /// - `SKYALT_MEDIA_DIR`
    /// - `SKYALT_DOWNLOAD_TIMEOUT` (seconds)
    /// - `SKYALT_IDLE_TIMEOUT` (seconds)
    /// - `SKYALT_SWEEP_INTERVAL` (seconds)
    pub fn from_env_and_cli(args: &Args) -> Result<Self> {
        Self::resolve(args, |key| std::env::var(key).ok())
    }

    fn resolve(args: &Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let media_dir = args
            .media_dir
            .clone()
            .or_else(|| env("SKYALT_MEDIA_DIR").map(PathBuf::from))
            .unwrap_or(defaults.media_dir);

        let secs = |cli: Option<u64>, key: &str, default: Duration| -> Result<Duration> {
            if let Some(v) = cli {
                return Ok(Duration::from_secs(v));
            }
            match env(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{} must be a number of seconds, got {:?}", key, raw)),
                None => Ok(default),
            }
        };

        Ok(Self {
            media_dir,
            download_timeout: secs(args.download_timeout, "SKYALT_DOWNLOAD_TIMEOUT", defaults.download_timeout)?,
            idle_timeout: secs(args.idle_timeout, "SKYALT_IDLE_TIMEOUT", defaults.idle_timeout)?,
            sweep_interval: secs(args.sweep_interval, "SKYALT_SWEEP_INTERVAL", defaults.sweep_interval)?,
            ..defaults
        })
    }
}

/// Get path to a data file (logs)
///
/// Platform paths:
/// - Linux: ~/.local/share/skyalt/{name}
/// - macOS: ~/Library/Application Support/skyalt/{name}
/// - Windows: %APPDATA%\skyalt\{name}
pub fn data_file(name: &str) -> PathBuf {
    get_data_dir().join(name)
}

/// Ensure the data directory exists
pub fn ensure_data_dir() -> Result<()> {
    let data_dir = get_data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

fn get_data_dir() -> PathBuf {
    if let Some(dir) = dirs_next::data_dir() {
        return dir.join("skyalt");
    }

    // Fallback: "." if everything else fails
    PathBuf::from(".")
}
