//! Command vocabulary and response layouts of the parent socket
//!
//! A request is a tag array followed by the tag's payload; a response is the
//! tag's fixed field list. All integers are u64 LE, arrays are length
//! prefixed (see `core::wire`).

use std::io::{self, Read, Write};

use log::{debug, trace};

use crate::core::registry::{CheckResult, FrameResult};
use crate::core::wire::{WireReader, WireWriter};

/// One parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Check { path: String, player_id: u64 },
    Type { path: String },
    Info,
    Frame { path: String, blob: Vec<u8>, player_id: u64 },
    Play { path: String, player_id: u64, play_it: bool },
    Seek { path: String, player_id: u64, pos_ms: u64 },
    Volume { path: String, player_id: u64, volume: u64 },
}

impl Command {
    /// Read the next request. Unknown tags yield `Ok(None)`: only the tag is
    /// consumed and nothing is answered.
    pub fn read<R: Read>(reader: &mut WireReader<R>) -> io::Result<Option<Command>> {
        let tag = reader.read_string()?;

        let command = match tag.as_str() {
            "exit" => Command::Exit,
            "check" => Command::Check {
                path: reader.read_string()?,
                player_id: reader.read_u64()?,
            },
            "type" => Command::Type {
                path: reader.read_string()?,
            },
            "info" => Command::Info,
            "frame" => Command::Frame {
                path: reader.read_string()?,
                blob: reader.read_bytes()?,
                player_id: reader.read_u64()?,
            },
            "play" => Command::Play {
                path: reader.read_string()?,
                player_id: reader.read_u64()?,
                play_it: reader.read_u64()? != 0,
            },
            "seek" => Command::Seek {
                path: reader.read_string()?,
                player_id: reader.read_u64()?,
                pos_ms: reader.read_u64()?,
            },
            "volume" => Command::Volume {
                path: reader.read_string()?,
                player_id: reader.read_u64()?,
                volume: reader.read_u64()?,
            },
            other => {
                debug!("Dropping unknown command tag {:?}", other);
                return Ok(None);
            }
        };

        trace!("<- {}", command.tag());
        Ok(Some(command))
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Command::Exit => "exit",
            Command::Check { .. } => "check",
            Command::Type { .. } => "type",
            Command::Info => "info",
            Command::Frame { .. } => "frame",
            Command::Play { .. } => "play",
            Command::Seek { .. } => "seek",
            Command::Volume { .. } => "volume",
        }
    }

    /// Write this request (parent side; used by tests and tooling)
    pub fn write<W: Write>(&self, writer: &mut WireWriter<W>) -> io::Result<()> {
        writer.write_str(self.tag())?;
        match self {
            Command::Exit | Command::Info => {}
            Command::Check { path, player_id } => {
                writer.write_str(path)?;
                writer.write_u64(*player_id)?;
            }
            Command::Type { path } => writer.write_str(path)?,
            Command::Frame { path, blob, player_id } => {
                writer.write_str(path)?;
                writer.write_bytes(blob)?;
                writer.write_u64(*player_id)?;
            }
            Command::Play { path, player_id, play_it } => {
                writer.write_str(path)?;
                writer.write_u64(*player_id)?;
                writer.write_bool(*play_it)?;
            }
            Command::Seek { path, player_id, pos_ms: value }
            | Command::Volume { path, player_id, volume: value } => {
                writer.write_str(path)?;
                writer.write_u64(*player_id)?;
                writer.write_u64(*value)?;
            }
        }
        writer.flush()
    }
}

/// One answer; `Err` strings travel in the `err` array
#[derive(Debug, Clone)]
pub enum Response {
    Check(CheckResult),
    Type(u64),
    Info(Vec<u8>),
    Frame(Result<FrameResult, String>),
    Status(Result<(), String>),
}

impl Response {
    pub fn write<W: Write>(&self, writer: &mut WireWriter<W>) -> io::Result<()> {
        match self {
            Response::Check(check) => {
                writer.write_bool(check.playing)?;
                writer.write_bool(check.diff)?;
            }
            Response::Type(code) => writer.write_u64(*code)?,
            Response::Info(json) => writer.write_bytes(json)?,
            Response::Frame(Ok(frame)) => {
                writer.write_bytes(&[])?;
                writer.write_u64(frame.width as u64)?;
                writer.write_u64(frame.height as u64)?;
                writer.write_bytes(&frame.rgba)?;
                writer.write_u64(frame.seek_ms)?;
                writer.write_u64(frame.duration_ms)?;
                writer.write_u64(frame.kind.wire_code())?;
            }
            Response::Frame(Err(err)) => {
                writer.write_str(err)?;
                writer.write_u64(0)?;
                writer.write_u64(0)?;
                writer.write_bytes(&[])?;
                writer.write_u64(0)?;
                writer.write_u64(0)?;
                writer.write_u64(0)?;
            }
            Response::Status(result) => {
                writer.write_str(result.as_ref().err().map(String::as_str).unwrap_or(""))?;
            }
        }
        Ok(())
    }
}

/// Parsed `frame` response (parent side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReply {
    pub err: String,
    pub width: u64,
    pub height: u64,
    pub rgba: Vec<u8>,
    pub seek_ms: u64,
    pub duration_ms: u64,
    pub kind: u64,
}

impl FrameReply {
    pub fn read<R: Read>(reader: &mut WireReader<R>) -> io::Result<Self> {
        Ok(Self {
            err: reader.read_string()?,
            width: reader.read_u64()?,
            height: reader.read_u64()?,
            rgba: reader.read_bytes()?,
            seek_ms: reader.read_u64()?,
            duration_ms: reader.read_u64()?,
            kind: reader.read_u64()?,
        })
    }
}
