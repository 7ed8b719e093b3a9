//! Background sweep that reclaims idle and stale registry entries
//!
//! Each cycle:
//! 1. Snapshot (key, path) pairs under the lock, then restat every source
//!    file *outside* it - stat is the slow part and must not starve commands
//! 2. Re-take the lock, store the observed mtimes, evict entries that are
//!    idle (`last_use_time < now - idle_timeout`) or whose file changed
//!
//! Shutdown: dropping `Maintenance` signals the thread over a channel and
//! joins it.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};

use super::registry::{SharedRegistry, SourceStat};
use crate::entities::DecoderBackend;
use crate::utils::time::{file_mtime_nanos, nanos_ago};

/// Maintenance thread handle
pub struct Maintenance {
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Maintenance {
    /// Spawn the sweep thread
    ///
    /// * `interval` - time between cycles
    /// * `idle_timeout` - entries unused for longer are evicted
    pub fn start<B: DecoderBackend>(
        registry: SharedRegistry<B>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("media-maintenance".to_string())
            .spawn(move || {
                debug!("Maintenance started: every {:?}, idle after {:?}", interval, idle_timeout);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            sweep(&registry, idle_timeout);
                        }
                        // Stop requested or handle dropped
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Maintenance stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Maintenance thread panicked");
            }
        }
    }
}

/// One maintenance cycle; returns the number of evicted entries
pub fn sweep<B: DecoderBackend>(registry: &SharedRegistry<B>, idle_timeout: Duration) -> usize {
    let sources = registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .sources();

    // Restat without holding the lock
    let stats: Vec<SourceStat> = sources
        .into_iter()
        .map(|(key, path)| {
            let mtime = file_mtime_nanos(&path);
            SourceStat { key, path, mtime }
        })
        .collect();
    trace!("Maintenance restat: {} sources", stats.len());

    let min_time = nanos_ago(idle_timeout);

    let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
    reg.apply_stats(&stats);
    let evicted = reg.evict(min_time);
    if evicted > 0 {
        info!(
            "Maintenance evicted {} entries ({} images, {} players left)",
            evicted,
            reg.image_count(),
            reg.player_count()
        );
    }
    evicted
}
