//! Carabiner wire codec
//!
//! Outgoing commands are single newline-terminated lines. Carabiner answers with
//! tagged forms such as `status { :peers 1 :bpm 120.000000 :start 7374 :beat 2.5 }`,
//! and it may pack several of them into one TCP read or split one across reads.
//! The decoder only consumes complete forms; anything left over stays in the
//! buffer for the next read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Beats per bar used for every quantum sent to Carabiner (Pro DJ Link is always 4/4)
pub const BAR_QUANTUM: f64 = 4.0;

/// Upper bound for bytes buffered without a complete form
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Commands understood by the Carabiner daemon
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set the Link session tempo
    Bpm(f64),
    /// Ask which beat falls at a timestamp (microseconds on the shared clock)
    BeatAtTime { when: i64, quantum: f64 },
    /// Force the Link timeline so that `beat` falls at `when`
    ForceBeatAtTime { beat: i64, when: i64, quantum: f64 },
    /// Ask for the phase at a timestamp
    PhaseAtTime { when: i64, quantum: f64 },
    /// Request a status report
    Status,
    /// Request the daemon version
    Version,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Bpm(bpm) => write!(f, "bpm {}", bpm),
            Command::BeatAtTime { when, quantum } => {
                write!(f, "beat-at-time {} {:?}", when, quantum)
            },
            Command::ForceBeatAtTime {
                beat,
                when,
                quantum,
            } => write!(f, "force-beat-at-time {} {} {:?}", beat, when, quantum),
            Command::PhaseAtTime { when, quantum } => {
                write!(f, "phase-at-time {} {:?}", when, quantum)
            },
            Command::Status => f.write_str("status"),
            Command::Version => f.write_str("version"),
        }
    }
}

/// Messages received from Carabiner
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Current Link session state
    Status { bpm: f64, peers: i64 },
    /// Answer to `beat-at-time`
    BeatAtTime { beat: f64, when: i64 },
    /// Answer to `phase-at-time`
    PhaseAtTime { phase: f64, when: i64 },
    /// Answer to `version`
    Version(String),
    /// The daemon did not understand a command we sent
    Unsupported { command: String },
    /// A form we could not interpret
    Unrecognized { raw: String },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no complete message within {0} buffered bytes")]
    Overflow(usize),
}

/// Encode a command into the bytes sent on the wire
pub fn encode(command: &Command) -> Bytes {
    let mut buf = BytesMut::new();
    write_command(command, &mut buf);
    buf.freeze()
}

fn write_command(command: &Command, dst: &mut BytesMut) {
    let line = command.to_string();
    dst.reserve(line.len() + 1);
    dst.extend_from_slice(line.as_bytes());
    dst.put_u8(b'\n');
}

/// Codec for the Carabiner line protocol
#[derive(Debug, Default)]
pub struct CarabinerCodec;

impl CarabinerCodec {
    /// Decode every complete message currently buffered
    ///
    /// A trailing partial form is left in `src`.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<Message>, CodecError> {
        let mut messages = Vec::new();
        while let Some(message) = self.decode(src)? {
            messages.push(message);
        }
        Ok(messages)
    }
}

impl Encoder<Command> for CarabinerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_command(&item, dst);
        Ok(())
    }
}

impl Decoder for CarabinerCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| !is_separator(*b)) {
            Some(start) => src.advance(start),
            None => {
                src.clear();
                return Ok(None);
            },
        }

        match form_length(&src[..]) {
            Some(len) => {
                let form = src.split_to(len);
                let raw = String::from_utf8_lossy(&form);
                Ok(Some(parse_form(raw.trim())))
            },
            None if src.len() > MAX_PENDING_BYTES => {
                let pending = src.len();
                src.clear();
                Err(CodecError::Overflow(pending))
            },
            None => Ok(None),
        }
    }
}

fn is_separator(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b','
}

/// Length of the first complete `tag value` form, or None if more bytes are needed
fn form_length(bytes: &[u8]) -> Option<usize> {
    let tag_end = bytes.iter().position(|b| is_separator(*b))?;

    let mut i = tag_end;
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b',') {
        i += 1;
    }
    if i == bytes.len() {
        return None;
    }

    match bytes[i] {
        // Tag with no value
        b'\n' | b'\r' => Some(i),
        // A line that ends before the map closes is a form of its own
        b'{' => closing_brace(bytes, i).map(|end| match bytes[end] {
            b'}' => end + 1,
            _ => end,
        }),
        b'"' => closing_quote(bytes, i + 1).map(|end| end + 1),
        _ => bytes[i..]
            .iter()
            .position(|b| is_separator(*b))
            .map(|n| i + n),
    }
}

/// Index of the brace closing the map at `open`, or of the newline cutting it short
fn closing_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = closing_quote(bytes, i + 1)?,
            b'\n' => return Some(i),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            },
            _ => {},
        }
        i += 1;
    }
    None
}

fn closing_quote(bytes: &[u8], from: usize) -> Option<usize> {
    let mut escaped = false;
    for (offset, &b) in bytes[from..].iter().enumerate() {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return Some(from + offset);
        }
    }
    None
}

fn parse_form(raw: &str) -> Message {
    let (tag, value) = match raw.split_once(|c: char| c.is_whitespace() || c == ',') {
        Some((tag, value)) => (tag, value.trim()),
        None => (raw, ""),
    };

    let parsed = match tag {
        "status" => EdnMap::parse(value).and_then(|map| {
            Some(Message::Status {
                bpm: map.float("bpm")?,
                peers: map.int("peers")?,
            })
        }),
        "beat-at-time" => EdnMap::parse(value).and_then(|map| {
            Some(Message::BeatAtTime {
                beat: map.float("beat")?,
                when: map.int("when")?,
            })
        }),
        "phase-at-time" => EdnMap::parse(value).and_then(|map| {
            Some(Message::PhaseAtTime {
                phase: map.float("phase")?,
                when: map.int("when")?,
            })
        }),
        "version" => unquote(value).map(Message::Version),
        "unsupported" if !value.is_empty() => Some(Message::Unsupported {
            command: value.to_string(),
        }),
        _ => None,
    };

    parsed.unwrap_or_else(|| Message::Unrecognized {
        raw: raw.to_string(),
    })
}

fn unquote(value: &str) -> Option<String> {
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.replace("\\\"", "\"").replace("\\\\", "\\"))
}

/// The flat `{ :key value ... }` maps Carabiner sends
struct EdnMap(HashMap<String, String>);

impl EdnMap {
    fn parse(value: &str) -> Option<Self> {
        let inner = value.strip_prefix('{')?.strip_suffix('}')?;
        let tokens = tokenize(inner);
        let mut entries = HashMap::new();
        for pair in tokens.chunks(2) {
            if let [key, val] = pair {
                let key = key.strip_prefix(':')?;
                entries.insert(key.to_string(), val.clone());
            }
        }
        Some(Self(entries))
    }

    fn float(&self, key: &str) -> Option<f64> {
        let raw = self.0.get(key)?;
        raw.trim_end_matches('M').parse().ok()
    }

    fn int(&self, key: &str) -> Option<i64> {
        let raw = self.0.get(key)?;
        raw.trim_end_matches('N').parse().ok()
    }
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c.is_whitespace() || c == ',' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
