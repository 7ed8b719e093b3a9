//! Parent connection and command dispatch
//!
//! The sidecar dials the parent on localhost and then serves strictly one
//! command at a time. Each command resolves URLs first (the URL cache has its
//! own lock), then runs against the registry under the registry lock.

use std::io::{self, BufReader, BufWriter};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use super::protocol::{Command, Response};
use crate::core::registry::{MediaRegistry, SharedRegistry};
use crate::core::url_cache::UrlCache;
use crate::core::wire::{WireReader, WireWriter};
use crate::entities::{DecoderBackend, MediaError};
use crate::utils::media::MediaKind;

/// Executes commands against the registries; no socket involved
pub struct Dispatcher<B: DecoderBackend> {
    registry: SharedRegistry<B>,
    urls: Arc<UrlCache>,
}

impl<B: DecoderBackend> Dispatcher<B> {
    pub fn new(registry: SharedRegistry<B>, urls: Arc<UrlCache>) -> Self {
        Self { registry, urls }
    }

    pub fn registry(&self) -> &SharedRegistry<B> {
        &self.registry
    }

    /// Run one command. `Exit` has no response and yields `None`.
    pub fn execute(&self, command: Command) -> Option<Response> {
        let response = match command {
            Command::Exit => return None,
            Command::Check { path, player_id } => {
                let path = self.lookup(&path);
                Response::Check(self.lock().check(&path, player_id))
            }
            Command::Type { path } => {
                let path = self.lookup(&path);
                Response::Type(MediaKind::from_path(&path.to_string_lossy()).wire_code())
            }
            Command::Info => {
                let json = self.lock().info_json().unwrap_or_else(|e| {
                    warn!("info serialization failed: {}", e);
                    b"{}".to_vec()
                });
                Response::Info(json)
            }
            Command::Frame { path, blob, player_id } => {
                // A blob carries the content; the URL only names the entry
                let local = if blob.is_empty() { self.fetch(&path) } else { Ok(self.lookup(&path)) };
                let result = local.and_then(|local| self.lock().frame(&local, &blob, player_id));
                Response::Frame(result.map_err(|e| self.report("frame", &path, e)))
            }
            Command::Play { path, player_id, play_it } => {
                let result = self
                    .fetch(&path)
                    .and_then(|local| self.lock().play(&local, player_id, play_it));
                Response::Status(result.map_err(|e| self.report("play", &path, e)))
            }
            Command::Seek { path, player_id, pos_ms } => {
                let result = self
                    .fetch(&path)
                    .and_then(|local| self.lock().seek(&local, player_id, pos_ms));
                Response::Status(result.map_err(|e| self.report("seek", &path, e)))
            }
            Command::Volume { path, player_id, volume } => {
                let result = self
                    .fetch(&path)
                    .and_then(|local| self.lock().volume(&local, player_id, volume));
                Response::Status(result.map_err(|e| self.report("volume", &path, e)))
            }
        };
        Some(response)
    }

    fn lock(&self) -> MutexGuard<'_, MediaRegistry<B>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Local path of a command argument; URLs map to their cache file
    /// without downloading
    fn lookup(&self, path: &str) -> PathBuf {
        if UrlCache::is_url(path) {
            self.urls.path_for(path)
        } else {
            PathBuf::from(path)
        }
    }

    /// Local path of a command argument, downloading URLs on a miss
    fn fetch(&self, path: &str) -> Result<PathBuf, MediaError> {
        if UrlCache::is_url(path) {
            self.urls
                .get(path)
                .map_err(|e| MediaError::Download(format!("{:#}", e)))
        } else {
            Ok(PathBuf::from(path))
        }
    }

    fn report(&self, tag: &str, path: &str, err: MediaError) -> String {
        warn!("{} {} failed: {}", tag, path, err);
        err.to_string()
    }
}

/// One connection to the parent
pub struct Session<B: DecoderBackend> {
    reader: WireReader<BufReader<TcpStream>>,
    writer: WireWriter<BufWriter<TcpStream>>,
    dispatcher: Dispatcher<B>,
}

impl<B: DecoderBackend> Session<B> {
    /// Dial the parent at `localhost:port`
    pub fn connect(port: u16, dispatcher: Dispatcher<B>) -> Result<Self> {
        let stream = TcpStream::connect(("localhost", port))
            .with_context(|| format!("Failed to connect to parent on localhost:{}", port))?;
        info!("Connected to parent on localhost:{}", port);
        Self::from_stream(stream, dispatcher).context("Failed to set up parent connection")
    }

    pub fn from_stream(stream: TcpStream, dispatcher: Dispatcher<B>) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let read_half = stream.try_clone()?;
        Ok(Self {
            reader: WireReader::new(BufReader::new(read_half)),
            writer: WireWriter::new(BufWriter::new(stream)),
            dispatcher,
        })
    }

    /// Serve until `exit`. Any socket error ends the session.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            let Some(command) = Command::read(&mut self.reader)? else {
                continue;
            };
            let tag = command.tag();

            let Some(response) = self.dispatcher.execute(command) else {
                info!("Parent requested exit");
                return Ok(());
            };

            response.write(&mut self.writer)?;
            self.writer.flush()?;
            debug!("-> {}", tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::loader::tests::png_bytes;
    use crate::entities::player::tests::FakeBackend;
    use crate::server::protocol::FrameReply;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn dispatcher(dir: &std::path::Path) -> Dispatcher<FakeBackend> {
        let backend = FakeBackend::default()
            .with("v.mkv", 32, 18, 60_000)
            .with("other.mkv", 64, 36, 5_000);
        let registry = MediaRegistry::new(backend, Duration::from_millis(500)).shared();
        let urls = UrlCache::new(dir.join("media"), Duration::from_secs(5), "Skyalt/0.1").unwrap();
        Dispatcher::new(registry, Arc::new(urls))
    }

    #[test]
    fn test_check_on_url_never_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let response = dispatcher.execute(Command::Check {
            path: "https://example.invalid/x.png".into(),
            player_id: 0,
        });
        assert!(matches!(response, Some(Response::Check(c)) if c.diff && !c.playing));

        let response = dispatcher.execute(Command::Type { path: "https://example.invalid/clip.webm?s=1".into() });
        assert!(matches!(response, Some(Response::Type(1))));
        assert_eq!(std::fs::read_dir(dir.path().join("media")).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_download_is_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        // Nothing listens on port 1
        let response = dispatcher.execute(Command::Frame {
            path: "http://127.0.0.1:1/x.png".into(),
            blob: Vec::new(),
            player_id: 0,
        });
        match response {
            Some(Response::Frame(Err(err))) => assert!(err.starts_with("Download failed")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dispatcher.registry().lock().unwrap().image_count(), 0);
    }

    #[test]
    fn test_frame_blob_with_url_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        // Nothing listens on port 1, so a download attempt would fail
        let response = dispatcher.execute(Command::Frame {
            path: "http://127.0.0.1:1/mem.png".into(),
            blob: png_bytes(5, 3),
            player_id: 0,
        });
        match response {
            Some(Response::Frame(Ok(frame))) => assert_eq!((frame.width, frame.height), (5, 3)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dispatcher.registry().lock().unwrap().image_count(), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("media")).unwrap().count(), 0);
    }

    #[test]
    fn test_player_commands_reject_images() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let response = dispatcher.execute(Command::Volume { path: "a.png".into(), player_id: 1, volume: 50 });
        match response {
            Some(Response::Status(Err(err))) => assert_eq!(err, "Unsupported path: a.png"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exit_has_no_response() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dispatcher(dir.path()).execute(Command::Exit).is_none());
    }

    /// Full round trip: the test plays the parent controller
    #[test]
    fn test_session_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let png_path = dir.path().join("a.png");
        std::fs::write(&png_path, png_bytes(6, 4)).unwrap();
        let png = png_path.to_string_lossy().into_owned();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let sidecar_dispatcher = dispatcher(dir.path());
        let sidecar = thread::spawn(move || {
            let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let mut session = Session::from_stream(stream, sidecar_dispatcher).unwrap();
            session.run()
        });

        let (stream, _) = listener.accept().unwrap();
        let mut reader = WireReader::new(BufReader::new(stream.try_clone().unwrap()));
        let mut writer = WireWriter::new(BufWriter::new(stream));

        // Image first load
        Command::Frame { path: png.clone(), blob: Vec::new(), player_id: 0 }.write(&mut writer).unwrap();
        let reply = FrameReply::read(&mut reader).unwrap();
        assert_eq!(reply.err, "");
        assert_eq!((reply.width, reply.height), (6, 4));
        assert_eq!(reply.rgba.len(), 6 * 4 * 4);
        assert_eq!((reply.seek_ms, reply.duration_ms, reply.kind), (0, 0, 0));

        Command::Check { path: png.clone(), player_id: 0 }.write(&mut writer).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 0);
        assert_eq!(reader.read_u64().unwrap(), 0);

        // Image from an in-memory blob
        Command::Frame { path: "mem.png".into(), blob: png_bytes(3, 2), player_id: 0 }
            .write(&mut writer)
            .unwrap();
        let reply = FrameReply::read(&mut reader).unwrap();
        assert_eq!((reply.err.as_str(), reply.width, reply.height), ("", 3, 2));

        Command::Type { path: "x.mp3".into() }.write(&mut writer).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 2);

        // Video open, paused seek, info
        Command::Frame { path: "v.mkv".into(), blob: Vec::new(), player_id: 7 }.write(&mut writer).unwrap();
        let reply = FrameReply::read(&mut reader).unwrap();
        assert_eq!((reply.width, reply.height, reply.duration_ms, reply.kind), (32, 18, 60_000, 1));

        Command::Seek { path: "v.mkv".into(), player_id: 7, pos_ms: 5000 }.write(&mut writer).unwrap();
        assert_eq!(reader.read_string().unwrap(), "");

        Command::Info.write(&mut writer).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&reader.read_bytes().unwrap()).unwrap();
        assert_eq!(json["7"]["seek_ms"], 5000);
        assert_eq!(json["7"]["is_playing"], false);
        assert_eq!(json["7"]["path"], "v.mkv");

        // Id reuse with a different file
        Command::Frame { path: "other.mkv".into(), blob: Vec::new(), player_id: 7 }.write(&mut writer).unwrap();
        let reply = FrameReply::read(&mut reader).unwrap();
        assert_eq!((reply.width, reply.height), (64, 36));

        // Unknown tag is dropped without a reply; the stream stays in sync
        writer.write_str("bogus").unwrap();
        Command::Type { path: "a.webm".into() }.write(&mut writer).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 1);

        Command::Play { path: png.clone(), player_id: 0, play_it: true }.write(&mut writer).unwrap();
        assert!(reader.read_string().unwrap().starts_with("Unsupported path"));

        Command::Exit.write(&mut writer).unwrap();
        sidecar.join().unwrap().unwrap();
    }
}
