//! Wire format of the worker log stream.
//!
//! Each line a worker writes to stdout or stderr is one JSON object
//! (`LogRecord`). `LogCodec` frames the raw byte stream into records,
//! buffering partial trailing lines until the next chunk. Lines that do not
//! parse become synthetic `SYSTEM/runtime-parse-error` records rather than
//! being dropped.

use std::io;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// SYSTEM record announcing the IPC socket (`text = "ready"`) or a
/// termination (`text = "killed"`).
pub const RUNTIME_STATUS: &str = "runtime-status";
/// SYSTEM record carrying the worker's trigger enumeration.
pub const TRIGGERS_PARSED: &str = "triggers-parsed";
/// Synthetic SYSTEM record for a line that failed to parse.
pub const RUNTIME_PARSE_ERROR: &str = "runtime-parse-error";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    /// Control signals between worker and gateway.
    System,
    User,
    Debug,
    Info,
    Warn,
    /// A user error that also requests worker termination.
    Fatal,
}

/// One parsed log line from a worker pipe. Unknown fields survive a
/// round-trip via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogRecord {
    pub fn system(kind: impl Into<String>, text: impl Into<String>, data: Value) -> Self {
        Self {
            level: LogLevel::System,
            kind: kind.into(),
            text: text.into(),
            data,
            extra: Map::new(),
        }
    }

    /// Synthetic record emitted by the supervisor when it terminates a
    /// worker, either on `kill()` or in response to a FATAL record.
    pub fn killed() -> Self {
        Self::system(RUNTIME_STATUS, "killed", Value::Null)
    }

    /// Synthetic record wrapping a line that failed to parse.
    pub fn parse_error(line: &str) -> Self {
        Self::system(RUNTIME_PARSE_ERROR, "", json!({ "line": line }))
    }

    pub fn from_line(line: &str) -> Self {
        serde_json::from_str(line).unwrap_or_else(|_| Self::parse_error(line))
    }

    pub fn is_system(&self, kind: &str) -> bool {
        self.level == LogLevel::System && self.kind == kind
    }

    /// String field of `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Line framing for one worker pipe. Empty lines are skipped; everything
/// else yields exactly one record, in write order.
pub struct LogCodec {
    lines: LinesCodec,
}

impl LogCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new(),
        }
    }
}

impl Default for LogCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn map_lines_error(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "log line too long")
        }
    }
}

impl Decoder for LogCodec {
    type Item = LogRecord;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogRecord>, io::Error> {
        while let Some(line) = self.lines.decode(src).map_err(map_lines_error)? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(LogRecord::from_line(&line)));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<LogRecord>, io::Error> {
        while let Some(line) = self.lines.decode_eof(src).map_err(map_lines_error)? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(LogRecord::from_line(&line)));
        }
        Ok(None)
    }
}
