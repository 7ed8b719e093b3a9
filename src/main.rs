use skyalt_media::cli::Args;
use skyalt_media::config::{self, SidecarConfig};
use skyalt_media::{Dispatcher, FfmpegBackend, Maintenance, MediaRegistry, Session, UrlCache};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info};
use std::sync::Arc;

fn main() {
    // Parse command-line arguments first (needed for log setup)
    let args = Args::parse();

    init_logging(&args);

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        eprintln!("skyalt-media: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(args: &Args) {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        // File logging with specified verbosity level
        let log_path = match log_path_opt {
            Some(path) => path.clone(),
            None => {
                if let Err(e) = config::ensure_data_dir() {
                    eprintln!("Warning: {:#}", e);
                }
                config::data_file("skyalt_media.log")
            }
        };

        match std::fs::File::create(&log_path) {
            Ok(file) => {
                env_logger::Builder::new()
                    .filter_level(log_level)
                    .filter_module("reqwest", log::LevelFilter::Info)
                    .format_timestamp_millis()
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .init();

                info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
                return;
            }
            Err(e) => {
                eprintln!("Warning: cannot create log file {}: {}", log_path.display(), e);
            }
        }
    }

    // Console logging with specified verbosity level (respects RUST_LOG if set)
    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .filter_module("reqwest", log::LevelFilter::Info)
        .format_timestamp_millis()
        .init();
}

fn run(args: &Args) -> Result<()> {
    info!("Skyalt media sidecar v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    playa_ffmpeg::init().context("Failed to initialize FFmpeg")?;

    let config = SidecarConfig::from_env_and_cli(args)?;
    debug!("Config: {:?}", config);

    let urls = UrlCache::new(&config.media_dir, config.download_timeout, &config.user_agent)?;
    let registry = MediaRegistry::new(FfmpegBackend::from_config(&config), config.seek_deadline).shared();

    // Stopped and joined when dropped at the end of `run`
    let _maintenance = Maintenance::start(Arc::clone(&registry), config.sweep_interval, config.idle_timeout)
        .context("Failed to start maintenance thread")?;

    let mut session = Session::connect(args.port, Dispatcher::new(registry, Arc::new(urls)))?;
    session.run().context("Parent connection failed")?;

    info!("Shutting down");
    Ok(())
}
