//! Image and player registries behind one lock
//!
//! Structure:
//! - `images`: path -> ImageEntry (decoded stills)
//! - `players`: player id -> PlayerEntry (open decoders)
//!
//! **Why one lock**: both maps are small and maintenance always walks them
//! together, so a single `Mutex<MediaRegistry>` keeps ordering trivial.
//!
//! **Used by**: server session (one command per lock hold), Maintenance
//! (restat snapshot + eviction)
//!
//! # Entry lifetime
//!
//! - `check` never creates entries
//! - `frame`/`play`/`seek`/`volume` create on miss; a player id reused with a
//!   different path tears the old decoder down first
//! - Maintenance evicts idle entries and entries whose source file changed

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace};
use serde::Serialize;

use crate::entities::{DecoderBackend, ImageEntry, MediaError, MediaSession, PlayState, PlayerEntry};
use crate::utils::media::MediaKind;

/// Registry shared by the session loop and maintenance
pub type SharedRegistry<B> = Arc<Mutex<MediaRegistry<B>>>;

/// Poll step while waiting for a paused seek to land on a video frame
const SEEK_POLL_VIDEO: Duration = Duration::from_millis(1);
/// Poll step while waiting for a paused seek on audio
const SEEK_POLL_AUDIO: Duration = Duration::from_millis(10);

/// `check` answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub playing: bool,
    pub diff: bool,
}

/// Successful `frame` answer
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub width: usize,
    pub height: usize,
    pub rgba: Vec<u8>,
    pub seek_ms: u64,
    pub duration_ms: u64,
    pub kind: MediaKind,
}

/// One player in the `info` JSON
#[derive(Debug, Clone, Serialize)]
pub struct PlayerInfo {
    pub path: String,
    pub volume: f32,
    pub seek_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
}

/// Registry key of an entry with a file behind it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Image(PathBuf),
    Player(u64),
}

/// File mtime observed outside the lock
#[derive(Debug, Clone)]
pub struct SourceStat {
    pub key: SourceKey,
    pub path: PathBuf,
    /// `None` when the file disappeared
    pub mtime: Option<i64>,
}

/// Why maintenance dropped an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Idle,
    FileChanged,
}

/// Eviction predicate shared by both registries
pub fn evict_reason(
    last_use_time: i64,
    open_file_time: i64,
    check_file_time: i64,
    min_time: i64,
) -> Option<EvictReason> {
    if last_use_time > 0 && last_use_time < min_time {
        Some(EvictReason::Idle)
    } else if check_file_time != open_file_time {
        Some(EvictReason::FileChanged)
    } else {
        None
    }
}

pub struct MediaRegistry<B: DecoderBackend> {
    backend: B,
    images: HashMap<PathBuf, ImageEntry>,
    players: HashMap<u64, PlayerEntry<B::Session>>,
    /// Upper bound for the paused-seek settle wait
    seek_deadline: Duration,
}

impl<B: DecoderBackend> MediaRegistry<B> {
    pub fn new(backend: B, seek_deadline: Duration) -> Self {
        Self {
            backend,
            images: HashMap::new(),
            players: HashMap::new(),
            seek_deadline,
        }
    }

    pub fn shared(self) -> SharedRegistry<B> {
        Arc::new(Mutex::new(self))
    }

    // ===== Commands =====

    /// Report play state and whether the parent should re-fetch the frame
    pub fn check(&mut self, path: &Path, player_id: u64) -> CheckResult {
        if !kind_of(path).is_playable() {
            return match self.images.get_mut(path) {
                Some(entry) => {
                    entry.touch();
                    CheckResult { playing: false, diff: false }
                }
                None => CheckResult { playing: false, diff: true },
            };
        }

        match self.players.get_mut(&player_id) {
            Some(entry) => {
                entry.touch();
                let counter = entry.updated_counter();
                let diff = entry.path() != path || counter != entry.last_observed_counter;
                entry.last_observed_counter = counter;
                CheckResult { playing: entry.session().is_playing(), diff }
            }
            None => CheckResult { playing: false, diff: true },
        }
    }

    /// Current pixels of an image or player, creating the entry on miss
    pub fn frame(&mut self, path: &Path, blob: &[u8], player_id: u64) -> Result<FrameResult, MediaError> {
        let kind = kind_of(path);

        if kind.is_playable() {
            let entry = self.ensure_player(path, player_id)?;
            // The parent is about to receive everything up to this counter
            entry.last_observed_counter = entry.updated_counter();
            return Ok(FrameResult {
                width: entry.width(),
                height: entry.height(),
                rgba: entry.pixels(),
                seek_ms: entry.seek_ms(),
                duration_ms: entry.duration_ms(),
                kind,
            });
        }

        let entry = self.ensure_image(path, blob)?;
        Ok(FrameResult {
            width: entry.width(),
            height: entry.height(),
            rgba: entry.rgba().to_vec(),
            seek_ms: 0,
            duration_ms: 0,
            kind,
        })
    }

    /// Start (`play_it`) or pause playback; Ended media restarts from 0
    pub fn play(&mut self, path: &Path, player_id: u64, play_it: bool) -> Result<(), MediaError> {
        let entry = self.ensure_playable(path, player_id)?;
        let session = entry.session_mut();

        if play_it {
            if session.state() == PlayState::Ended {
                session.stop();
            }
            session.play()?;
        } else {
            session.pause();
        }
        debug!("play({}, {}) -> {:?}", player_id, play_it, session.state());
        Ok(())
    }

    /// Move to `pos_ms` (clamped to the media). A paused player stays paused
    /// but shows the new position.
    pub fn seek(&mut self, path: &Path, player_id: u64, pos_ms: u64) -> Result<(), MediaError> {
        let deadline = self.seek_deadline;
        let entry = self.ensure_playable(path, player_id)?;

        let target = pos_ms.min(entry.duration_ms().saturating_sub(1));
        if target == entry.seek_ms() {
            return Ok(());
        }

        let was_playing = entry.session().is_playing();
        if !was_playing {
            entry.session_mut().play()?;
        }

        let counter_before = entry.updated_counter();
        entry.session_mut().seek_ms(target)?;

        if was_playing {
            return Ok(());
        }

        // Wait until the seek is visible, then pause again
        let has_video = entry.info().has_video();
        let step = if has_video { SEEK_POLL_VIDEO } else { SEEK_POLL_AUDIO };
        let start = Instant::now();
        let settled = loop {
            let observed = if has_video {
                entry.updated_counter() != counter_before && entry.session().seek_presented()
            } else {
                entry.session().is_playing()
            };
            if observed {
                break true;
            }
            if start.elapsed() >= deadline {
                break false;
            }
            thread::sleep(step);
        };
        entry.session_mut().pause();

        trace!("seek({}, {}) settled={} in {:?}", player_id, target, settled, start.elapsed());
        if settled { Ok(()) } else { Err(MediaError::SeekTimeout) }
    }

    /// Set volume from a 0..100 integer
    pub fn volume(&mut self, path: &Path, player_id: u64, volume_0_100: u64) -> Result<(), MediaError> {
        let entry = self.ensure_playable(path, player_id)?;
        let volume = (volume_0_100.min(100) as f32) / 100.0;
        entry.session_mut().set_volume(volume)
    }

    /// Players that have moved past the start, keyed by id
    pub fn info(&self) -> BTreeMap<String, PlayerInfo> {
        self.players
            .iter()
            .filter(|(_, entry)| entry.seek_ms() > 0)
            .map(|(id, entry)| {
                (
                    id.to_string(),
                    PlayerInfo {
                        path: entry.path().to_string_lossy().into_owned(),
                        volume: entry.session().volume().clamp(0.0, 1.0),
                        seek_ms: entry.seek_ms(),
                        duration_ms: entry.duration_ms(),
                        is_playing: entry.session().is_playing(),
                    },
                )
            })
            .collect()
    }

    /// `info()` as JSON bytes
    pub fn info_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.info())
    }

    // ===== Entry management =====

    fn ensure_image(&mut self, path: &Path, blob: &[u8]) -> Result<&mut ImageEntry, MediaError> {
        if !self.images.contains_key(path) {
            let entry = ImageEntry::open(path, blob)?;
            info!("Image opened: {} ({}x{})", path.display(), entry.width(), entry.height());
            self.images.insert(path.to_path_buf(), entry);
        }
        let entry = self
            .images
            .get_mut(path)
            .ok_or_else(|| MediaError::Image(format!("entry vanished: {}", path.display())))?;
        entry.touch();
        Ok(entry)
    }

    fn ensure_playable(&mut self, path: &Path, player_id: u64) -> Result<&mut PlayerEntry<B::Session>, MediaError> {
        if !kind_of(path).is_playable() {
            return Err(MediaError::Unsupported(path.display().to_string()));
        }
        self.ensure_player(path, player_id)
    }

    fn ensure_player(&mut self, path: &Path, player_id: u64) -> Result<&mut PlayerEntry<B::Session>, MediaError> {
        let reuse = self
            .players
            .get(&player_id)
            .is_some_and(|entry| entry.path() == path);

        if !reuse {
            if let Some(old) = self.players.remove(&player_id) {
                info!(
                    "Player {} switches {} -> {}",
                    player_id,
                    old.path().display(),
                    path.display()
                );
                drop(old);
            }
            let entry = PlayerEntry::open(&self.backend, path)?;
            self.players.insert(player_id, entry);
        }

        let entry = self
            .players
            .get_mut(&player_id)
            .ok_or_else(|| MediaError::Decoder(format!("player {} vanished", player_id)))?;
        entry.touch();
        Ok(entry)
    }

    // ===== Maintenance support =====

    /// Every entry that has a file to restat
    pub fn sources(&self) -> Vec<(SourceKey, PathBuf)> {
        let images = self
            .images
            .values()
            .filter(|entry| entry.has_source_file())
            .map(|entry| (SourceKey::Image(entry.path().to_path_buf()), entry.path().to_path_buf()));
        let players = self
            .players
            .iter()
            .map(|(id, entry)| (SourceKey::Player(*id), entry.path().to_path_buf()));
        images.chain(players).collect()
    }

    /// Store mtimes observed outside the lock. Missing files and entries
    /// replaced in the meantime are skipped.
    pub fn apply_stats(&mut self, stats: &[SourceStat]) {
        for stat in stats {
            let Some(mtime) = stat.mtime else {
                continue;
            };
            match &stat.key {
                SourceKey::Image(key) => {
                    if let Some(entry) = self.images.get_mut(key) {
                        entry.check_file_time = mtime;
                    }
                }
                SourceKey::Player(id) => {
                    if let Some(entry) = self.players.get_mut(id) {
                        if entry.path() == stat.path {
                            entry.check_file_time = mtime;
                        }
                    }
                }
            }
        }
    }

    /// Drop idle or changed entries; returns how many went
    pub fn evict(&mut self, min_time: i64) -> usize {
        let before = self.images.len() + self.players.len();

        self.images.retain(|path, entry| {
            match evict_reason(entry.last_use_time, entry.open_file_time, entry.check_file_time, min_time) {
                Some(reason) => {
                    info!("Evicting image {} ({:?})", path.display(), reason);
                    false
                }
                None => true,
            }
        });

        // Dropping an entry stops its decoder before the frame buffer goes
        self.players.retain(|id, entry| {
            match evict_reason(entry.last_use_time, entry.open_file_time, entry.check_file_time, min_time) {
                Some(reason) => {
                    info!("Evicting player {} {} ({:?})", id, entry.path().display(), reason);
                    false
                }
                None => true,
            }
        });

        before - (self.images.len() + self.players.len())
    }

    // ===== Introspection =====

    pub fn image(&self, path: &Path) -> Option<&ImageEntry> {
        self.images.get(path)
    }

    pub fn player(&self, player_id: u64) -> Option<&PlayerEntry<B::Session>> {
        self.players.get(&player_id)
    }

    pub fn player_mut(&mut self, player_id: u64) -> Option<&mut PlayerEntry<B::Session>> {
        self.players.get_mut(&player_id)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

fn kind_of(path: &Path) -> MediaKind {
    MediaKind::from_path(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::loader::tests::png_bytes;
    use crate::entities::player::tests::FakeBackend;
    use crate::utils::time::now_nanos;

    fn registry() -> MediaRegistry<FakeBackend> {
        let backend = FakeBackend::default()
            .with("v.mkv", 32, 18, 60_000)
            .with("other.mkv", 64, 36, 5_000)
            .with("s.mp3", 0, 0, 3_000);
        MediaRegistry::new(backend, Duration::from_millis(200))
    }

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, png_bytes(6, 4)).unwrap();
        path
    }

    #[test]
    fn test_image_first_load_then_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png");
        let mut reg = registry();

        assert_eq!(reg.check(&path, 0), CheckResult { playing: false, diff: true });
        assert_eq!(reg.image_count(), 0); // check never creates

        let frame = reg.frame(&path, &[], 0).unwrap();
        assert_eq!((frame.width, frame.height), (6, 4));
        assert_eq!(frame.rgba.len(), 6 * 4 * 4);
        assert_eq!((frame.seek_ms, frame.duration_ms), (0, 0));
        assert_eq!(frame.kind, MediaKind::Image);

        assert_eq!(reg.check(&path, 0), CheckResult { playing: false, diff: false });
        assert_eq!(reg.check(&path, 0), CheckResult { playing: false, diff: false });
    }

    #[test]
    fn test_image_from_blob() {
        let mut reg = registry();
        let path = Path::new("pasted.png");
        let frame = reg.frame(path, &png_bytes(3, 2), 0).unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(reg.image(path).unwrap().open_file_time, 0);
        // Not restatted by maintenance
        assert!(reg.sources().is_empty());
    }

    #[test]
    fn test_image_decode_error_leaves_registry_untouched() {
        let mut reg = registry();
        let err = reg.frame(Path::new("broken.png"), b"nope", 0).unwrap_err();
        assert!(matches!(err, MediaError::Image(_)));
        assert_eq!(reg.image_count(), 0);
    }

    #[test]
    fn test_video_frame_and_check() {
        let mut reg = registry();
        let path = Path::new("v.mkv");

        let frame = reg.frame(path, &[], 7).unwrap();
        assert_eq!((frame.width, frame.height), (32, 18));
        assert_eq!(frame.rgba.len(), 32 * 18 * 4);
        assert_eq!(frame.seek_ms, 0);
        assert_eq!(frame.duration_ms, 60_000);
        assert_eq!(frame.kind, MediaKind::Video);

        assert_eq!(reg.check(path, 7), CheckResult { playing: false, diff: false });

        // A decoder write flips diff exactly once
        drop(reg.player(7).unwrap().frame().unwrap().lock());
        assert!(reg.check(path, 7).diff);
        assert!(!reg.check(path, 7).diff);

        // Another path under the same id is a diff
        assert!(reg.check(Path::new("other.mkv"), 7).diff);
        // Unknown id
        assert_eq!(reg.check(path, 8), CheckResult { playing: false, diff: true });
    }

    #[test]
    fn test_seek_while_paused_settles_and_pauses() {
        let mut reg = registry();
        let path = Path::new("v.mkv");
        reg.frame(path, &[], 7).unwrap();

        reg.seek(path, 7, 5000).unwrap();

        let info = reg.info();
        let p = info.get("7").unwrap();
        assert_eq!(p.seek_ms, 5000);
        assert!(!p.is_playing);
        assert_eq!(p.path, "v.mkv");
        assert_eq!(p.duration_ms, 60_000);
        assert!(reg.check(path, 7).diff); // new frame visible
    }

    #[test]
    fn test_seek_clamps_and_noops() {
        let mut reg = registry();
        let path = Path::new("v.mkv");

        reg.seek(path, 1, 10_000_000).unwrap();
        assert_eq!(reg.player(1).unwrap().seek_ms(), 59_999);

        // Same position: no play/pause cycle, counter unchanged
        let counter = reg.player(1).unwrap().updated_counter();
        reg.seek(path, 1, 59_999).unwrap();
        assert_eq!(reg.player(1).unwrap().updated_counter(), counter);
    }

    #[test]
    fn test_seek_while_playing_keeps_playing() {
        let mut reg = registry();
        let path = Path::new("v.mkv");
        reg.play(path, 3, true).unwrap();
        reg.seek(path, 3, 1234).unwrap();
        let entry = reg.player(3).unwrap();
        assert!(entry.session().is_playing());
        assert_eq!(entry.seek_ms(), 1234);
    }

    #[test]
    fn test_seek_timeout_when_frame_never_lands() {
        let mut reg = registry();
        let path = Path::new("v.mkv");
        reg.frame(path, &[], 2).unwrap();
        // Detach the buffer from the fake so seeks never present
        reg.player_mut(2).unwrap().session_mut().frame = None;

        let err = reg.seek(path, 2, 100).unwrap_err();
        assert!(matches!(err, MediaError::SeekTimeout));
        assert!(!reg.player(2).unwrap().session().is_playing());
    }

    #[test]
    fn test_player_id_reuse_with_new_path() {
        let mut reg = registry();
        reg.frame(Path::new("v.mkv"), &[], 7).unwrap();

        let frame = reg.frame(Path::new("other.mkv"), &[], 7).unwrap();
        assert_eq!((frame.width, frame.height), (64, 36));
        assert_eq!(reg.player_count(), 1);

        let dropped = reg.backend().shared.dropped.lock().unwrap().clone();
        assert_eq!(dropped, vec![PathBuf::from("v.mkv")]);
    }

    #[test]
    fn test_audio_only_play_and_restart() {
        let mut reg = registry();
        let path = Path::new("s.mp3");

        let frame = reg.frame(path, &[], 1).unwrap();
        assert_eq!((frame.width, frame.height), (0, 0));
        assert!(frame.rgba.is_empty());
        assert_eq!(frame.kind, MediaKind::Audio);

        reg.play(path, 1, true).unwrap();
        assert!(reg.check(path, 1).playing);

        // Decoder reaches the end
        {
            let session = reg.player_mut(1).unwrap().session_mut();
            session.state = PlayState::Ended;
            session.position = 3_000;
        }
        reg.play(path, 1, true).unwrap();
        let entry = reg.player(1).unwrap();
        assert!(entry.session().is_playing());
        assert_eq!(entry.seek_ms(), 0);

        reg.play(path, 1, false).unwrap();
        assert!(!reg.check(path, 1).playing);
    }

    #[test]
    fn test_audio_seek_waits_for_playing() {
        let mut reg = registry();
        let path = Path::new("s.mp3");
        reg.seek(path, 4, 1500).unwrap();
        let entry = reg.player(4).unwrap();
        assert_eq!(entry.seek_ms(), 1500);
        assert!(!entry.session().is_playing());
    }

    #[test]
    fn test_volume_scaled() {
        let mut reg = registry();
        let path = Path::new("v.mkv");
        reg.volume(path, 9, 40).unwrap();
        assert!((reg.player(9).unwrap().session().volume() - 0.4).abs() < 1e-6);
        reg.volume(path, 9, 250).unwrap();
        assert_eq!(reg.player(9).unwrap().session().volume(), 1.0);
    }

    #[test]
    fn test_transport_on_image_path_is_unsupported() {
        let mut reg = registry();
        let path = Path::new("a.png");
        assert!(matches!(reg.play(path, 1, true), Err(MediaError::Unsupported(_))));
        assert!(matches!(reg.seek(path, 1, 10), Err(MediaError::Unsupported(_))));
        assert!(matches!(reg.volume(path, 1, 10), Err(MediaError::Unsupported(_))));
        let err = reg.play(path, 1, true).unwrap_err();
        assert!(err.to_string().contains("a.png"));
        assert_eq!(reg.player_count(), 0);
    }

    #[test]
    fn test_parse_failure_creates_nothing() {
        let mut reg = registry();
        assert!(reg.frame(Path::new("missing.mp4"), &[], 5).is_err());
        assert_eq!(reg.player_count(), 0);
    }

    #[test]
    fn test_info_lists_only_started_players() {
        let mut reg = registry();
        reg.frame(Path::new("v.mkv"), &[], 1).unwrap();
        reg.seek(Path::new("other.mkv"), 2, 250).unwrap();
        reg.volume(Path::new("other.mkv"), 2, 50).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&reg.info_json().unwrap()).unwrap();
        let map = json.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["2"]["seek_ms"], 250);
        assert_eq!(map["2"]["volume"], 0.5);
        assert_eq!(map["2"]["is_playing"], false);
    }

    #[test]
    fn test_evict_reason_predicate() {
        let min = 1_000;
        assert_eq!(evict_reason(0, 5, 5, min), None);
        assert_eq!(evict_reason(999, 5, 5, min), Some(EvictReason::Idle));
        assert_eq!(evict_reason(1_000, 5, 5, min), None);
        assert_eq!(evict_reason(2_000, 5, 6, min), Some(EvictReason::FileChanged));
        assert_eq!(evict_reason(2_000, 5, 5, min), None);
    }

    #[test]
    fn test_evict_idle_and_changed() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png");
        let b = write_png(dir.path(), "b.png");
        let mut reg = registry();
        reg.frame(&a, &[], 0).unwrap();
        reg.frame(&b, &[], 0).unwrap();
        reg.frame(Path::new("v.mkv"), &[], 1).unwrap();

        // Nothing stale yet
        let min_time = now_nanos() - 60_000_000_000;
        assert_eq!(reg.evict(min_time), 0);

        // b's file changed, player went idle
        reg.apply_stats(&[SourceStat {
            key: SourceKey::Image(b.clone()),
            path: b.clone(),
            mtime: Some(1),
        }]);
        reg.player_mut(1).unwrap().last_use_time = 1;

        assert_eq!(reg.evict(min_time), 2);
        assert!(reg.image(&a).is_some());
        assert!(reg.image(&b).is_none());
        assert!(reg.player(1).is_none());
    }

    #[test]
    fn test_apply_stats_skips_missing_and_replaced() {
        let mut reg = registry();
        reg.frame(Path::new("v.mkv"), &[], 1).unwrap();
        let open = reg.player(1).unwrap().open_file_time;

        reg.apply_stats(&[
            SourceStat { key: SourceKey::Player(1), path: PathBuf::from("v.mkv"), mtime: None },
            SourceStat { key: SourceKey::Player(1), path: PathBuf::from("old.mkv"), mtime: Some(42) },
        ]);
        assert_eq!(reg.player(1).unwrap().check_file_time, open);
    }
}
