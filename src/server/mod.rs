//! Parent controller link: one TCP connection, one command at a time
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  tag + payload   ┌──────────────────────────────┐
//! │ Parent process   │ ───────────────▶ │ Session (main thread)        │
//! │ (TCP listener on │                  │  Command::read               │
//! │  localhost:PORT) │ ◀─────────────── │  Dispatcher::execute         │
//! └──────────────────┘    response      │   ├─ UrlCache (own lock)     │
//!                                       │   └─ MediaRegistry (lock)    │
//!                                       └──────────────┬───────────────┘
//!                                                      │ same lock
//!                                       ┌──────────────┴───────────────┐
//!                                       │ Maintenance thread           │
//!                                       └──────────────────────────────┘
//! ```
//!
//! # Commands
//!
//! | Tag      | Request                          | Response                                   |
//! |----------|----------------------------------|--------------------------------------------|
//! | `exit`   | -                                | -                                          |
//! | `check`  | path, player_id                  | playing, diff                              |
//! | `type`   | path                             | 0=image 1=video 2=audio                    |
//! | `info`   | -                                | JSON array                                 |
//! | `frame`  | path, blob, player_id            | err, w, h, rgba, seek_ms, duration_ms, type |
//! | `play`   | path, player_id, play_it         | err                                        |
//! | `seek`   | path, player_id, pos_ms          | err                                        |
//! | `volume` | path, player_id, volume_0_100    | err                                        |
//!
//! Unknown tags are dropped without a response.

pub mod protocol;
pub mod session;

pub use protocol::{Command, FrameReply, Response};
pub use session::{Dispatcher, Session};
