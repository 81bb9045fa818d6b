//! Line-delimited event records
//!
//! The response body is a sequence of lines. Lines carrying an event start
//! with `data:` followed by a JSON object `{"type": ..., "msg": ...}`. Other
//! lines are ignored; event lines that fail to parse are logged and skipped.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Prefix marking an event line
pub const EVENT_MARKER: &str = "data:";

/// Record type carrying reply text
pub const TEXT_RECORD: &str = "text";

/// One decoded event record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamRecord {
    /// Record type (`text`, `meta`, `plugin`, ...)
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: String,

    /// Payload text; numbers and booleans are taken in their JSON form
    #[serde(default, deserialize_with = "lenient_string")]
    pub msg: String,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl StreamRecord {
    /// The text fragment this record carries, if it is a non-empty text record
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        (self.kind == TEXT_RECORD && !self.msg.is_empty()).then_some(self.msg.as_str())
    }
}

/// Decode one line
///
/// Returns `None` for lines without the event marker and for malformed
/// records, which are logged.
#[must_use]
pub fn parse_line(line: &str) -> Option<StreamRecord> {
    let payload = line.trim().strip_prefix(EVENT_MARKER)?.trim();
    if payload.is_empty() {
        return None;
    }

    match serde_json::from_str::<StreamRecord>(payload) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(error = %e, line = payload, "skipping malformed stream record");
            None
        }
    }
}

/// Text fragment carried by a line, if any
#[must_use]
pub fn text_fragment(line: &str) -> Option<String> {
    parse_line(line).and_then(|record| record.text().map(ToString::to_string))
}

/// Reassembles lines from arbitrarily split body chunks
///
/// Works on bytes so a multi-byte character split across chunks is decoded
/// only once the whole line has arrived.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return every line it completes, without terminators
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Take the trailing unterminated line at end of body
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest);
        let line = line.trim_end_matches(['\r', '\n']);
        (!line.trim().is_empty()).then(|| line.to_string())
    }
}
