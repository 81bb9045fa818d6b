//! Incremental sentence segmentation for streamed replies
//!
//! Text arrives from the network a few characters at a time. Speaking each
//! fragment as it lands sounds choppy, and waiting for the whole answer adds
//! seconds of silence, so fragments are buffered and released as speakable
//! units at sentence boundaries. An unterminated buffer is released once it
//! grows past a length cap or goes quiet for longer than a timeout.

use std::time::{Duration, Instant};

use crate::config::SegmenterConfig;

/// Characters that close a sentence, half-width and full-width
pub const SENTENCE_TERMINATORS: [char; 10] =
    ['.', '。', '!', '！', '?', '？', ';', '；', ':', '：'];

/// Text ready to be handed to the synthesizer as one utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakableUnit(String);

impl SpeakableUnit {
    /// Build a unit from text, returning `None` when nothing is voiceable
    ///
    /// Whitespace is trimmed. Text made only of terminators (a stray `。`
    /// split off from the previous sentence) is dropped as well.
    #[must_use]
    pub fn new(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.chars().all(|c| c.is_whitespace() || is_terminator(c)) {
            return None;
        }
        Some(Self(text.to_string()))
    }

    /// The text to speak
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for SpeakableUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `c` closes a sentence
#[must_use]
pub fn is_terminator(c: char) -> bool {
    SENTENCE_TERMINATORS.contains(&c)
}

/// Buffers streamed text and emits speakable units
#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    last_append: Option<Instant>,
    max_chars: usize,
    timeout: Duration,
}

impl SentenceSegmenter {
    /// Create a segmenter with the given bounds
    #[must_use]
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            buffer: String::new(),
            last_append: None,
            max_chars: config.max_chars,
            timeout: config.timeout,
        }
    }

    /// Append a fragment, returning any units it completes
    pub fn append(&mut self, fragment: &str) -> Vec<SpeakableUnit> {
        self.append_at(fragment, Instant::now())
    }

    /// Append a fragment that arrived at `now`
    pub fn append_at(&mut self, fragment: &str, now: Instant) -> Vec<SpeakableUnit> {
        if fragment.trim().is_empty() && self.buffer.is_empty() {
            return Vec::new();
        }

        self.buffer.push_str(fragment);
        self.last_append = Some(now);

        let mut units = Vec::new();

        if let Some(end) = self.buffer.rfind(is_terminator) {
            let split = end + self.buffer[end..].chars().next().map_or(1, char::len_utf8);
            let rest = self.buffer.split_off(split);
            let head = std::mem::replace(&mut self.buffer, rest.trim_start().to_string());
            units.extend(SpeakableUnit::new(&head));
        } else if self.buffer.trim().chars().count() >= self.max_chars {
            units.extend(self.take_all());
        }

        if !units.is_empty() {
            tracing::trace!(units = units.len(), pending = self.buffer.len(), "segmented");
        }
        units
    }

    /// Emit the buffer if it has gone quiet for longer than the timeout
    ///
    /// Must be called periodically: the timeout can expire without any
    /// further `append`.
    pub fn tick(&mut self) -> Option<SpeakableUnit> {
        self.tick_at(Instant::now())
    }

    /// Timeout check against an explicit clock reading
    pub fn tick_at(&mut self, now: Instant) -> Option<SpeakableUnit> {
        let last = self.last_append?;
        if self.buffer.trim().is_empty() {
            return None;
        }
        if now.saturating_duration_since(last) > self.timeout {
            tracing::trace!(pending = self.buffer.len(), "sentence timeout");
            return self.take_all();
        }
        None
    }

    /// Emit whatever is buffered, regardless of terminators or bounds
    ///
    /// Called when the stream completes.
    pub fn flush(&mut self) -> Option<SpeakableUnit> {
        self.take_all()
    }

    /// Drop buffered text without emitting it
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_append = None;
    }

    /// Text not yet emitted, trimmed
    #[must_use]
    pub fn pending(&self) -> &str {
        self.buffer.trim()
    }

    /// Whether anything is waiting to be emitted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    fn take_all(&mut self) -> Option<SpeakableUnit> {
        let text = std::mem::take(&mut self.buffer);
        self.last_append = None;
        SpeakableUnit::new(&text)
    }
}
