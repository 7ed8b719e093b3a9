use clap::Parser;
use std::path::PathBuf;

// Audio output backend (compile-time)
#[cfg(feature = "audio")]
const AUDIO_BACKEND: &str = "cpal";
#[cfg(not(feature = "audio"))]
const AUDIO_BACKEND: &str = "none (clock only)";

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Video:  playa-ffmpeg 8.0 (static)\n",
    "Audio:  ", AUDIO_BACKEND, "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Media sidecar: decodes images and plays audio/video for a parent process
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// TCP port of the parent process on localhost
    #[arg(value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Directory for downloaded URL payloads (default: temp/media)
    #[arg(long = "media-dir", value_name = "DIR")]
    pub media_dir: Option<PathBuf>,

    /// Overall timeout for one URL download, in seconds (default: 1800)
    #[arg(long = "download-timeout", value_name = "SECS")]
    pub download_timeout: Option<u64>,

    /// Evict entries unused for this many seconds (default: 60)
    #[arg(long = "idle-timeout", value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Seconds between maintenance sweeps (default: 10)
    #[arg(long = "sweep-interval", value_name = "SECS")]
    pub sweep_interval: Option<u64>,

    /// Enable logging to file (default: skyalt_media.log in the data directory)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
