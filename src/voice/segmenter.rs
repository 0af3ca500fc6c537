//! Streaming phrase segmentation
//!
//! LLM output arrives a few tokens at a time. Synthesis should start as soon
//! as there is something worth saying, but splitting mid-sentence sounds
//! unnatural. [`TextSegmenter`] splits on sentence delimiters once a phrase is
//! long enough; [`FirstPhraseSegmenter`] trades sentence correctness for
//! latency on the first phrase of a turn; [`TurnSegmenter`] chains the two.

use std::time::{Duration, Instant};

use regex::Regex;

/// Default minimum phrase length in characters
pub const DEFAULT_MIN_CHARS: usize = 25;

/// Default minimum length of the first phrase of a turn
pub const DEFAULT_FIRST_PHRASE_MIN_CHARS: usize = 12;

/// Default grace period before the first phrase is force-split
pub const DEFAULT_FIRST_PHRASE_GRACE: Duration = Duration::from_millis(250);

/// Default phrase delimiters
pub const DEFAULT_DELIMITERS: &[&str] = &[".\n", "!\n", ". ", "! ", "\n\n"];

/// Compile literal delimiters into one alternation, longest first
///
/// The regex engine prefers earlier alternatives at the same position, so
/// `".\n"` wins over `"."` when both match.
///
/// Returns `None` when there is nothing to split on.
fn delimiter_pattern(delimiters: &[&str]) -> Option<Regex> {
    let mut sorted: Vec<&str> = delimiters.iter().copied().filter(|d| !d.is_empty()).collect();
    sorted.sort_by(|a, b| b.len().cmp(&a.len()));
    sorted.dedup();
    if sorted.is_empty() {
        return None;
    }

    let alternation = sorted
        .iter()
        .map(|d| regex::escape(d))
        .collect::<Vec<_>>()
        .join("|");

    Regex::new(&alternation)
        .inspect_err(|e| tracing::warn!(error = %e, "invalid phrase delimiters"))
        .ok()
}

/// Byte offset of the `n`th character, or `None` if the text is shorter
fn char_offset(text: &str, n: usize) -> Option<usize> {
    if n == 0 {
        return Some(0);
    }
    text.char_indices().nth(n).map(|(i, _)| i).or_else(|| {
        (text.chars().count() == n).then_some(text.len())
    })
}

/// Push `text` trimmed onto `out` unless it is blank
fn push_phrase(out: &mut Vec<String>, text: &str) {
    let phrase = text.trim();
    if !phrase.is_empty() {
        out.push(phrase.to_string());
    }
}

/// Splits streaming text into speakable phrases on sentence delimiters
#[derive(Debug, Clone)]
pub struct TextSegmenter {
    buffer: String,
    pattern: Option<Regex>,
    min_chars: usize,
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CHARS)
    }
}

impl TextSegmenter {
    /// Create a segmenter with the default delimiters
    #[must_use]
    pub fn new(min_chars: usize) -> Self {
        Self::with_delimiters(min_chars, DEFAULT_DELIMITERS)
    }

    /// Create a segmenter with custom literal delimiters
    #[must_use]
    pub fn with_delimiters(min_chars: usize, delimiters: &[&str]) -> Self {
        Self {
            buffer: String::new(),
            pattern: delimiter_pattern(delimiters),
            min_chars,
        }
    }

    /// Minimum phrase length in characters
    #[must_use]
    pub const fn min_chars(&self) -> usize {
        self.min_chars
    }

    /// Text received but not yet emitted
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Append a chunk of text and return every phrase now complete
    pub fn consume(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        self.drain_leading_whitespace();

        let mut phrases = Vec::new();
        while let Some(split) = self.split_point() {
            push_phrase(&mut phrases, &self.buffer[..split]);
            self.buffer.drain(..split);
            self.drain_leading_whitespace();
        }
        phrases
    }

    /// Emit whatever remains at end of stream
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let phrase = rest.trim();
        (!phrase.is_empty()).then(|| phrase.to_string())
    }

    /// End of the earliest delimiter starting at or after `min_chars`
    fn split_point(&self) -> Option<usize> {
        let start = char_offset(&self.buffer, self.min_chars)?;
        self.pattern
            .as_ref()
            .and_then(|p| p.find_at(&self.buffer, start))
            .map(|m| m.end())
    }

    fn drain_leading_whitespace(&mut self) {
        let leading = self.buffer.len() - self.buffer.trim_start().len();
        if leading > 0 {
            self.buffer.drain(..leading);
        }
    }

    /// Take the buffered text, leaving the segmenter empty
    fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

/// Latency-first segmenter for the opening phrase of a turn
///
/// Once `min_chars` characters are buffered, splits at the earliest delimiter
/// or whitespace boundary. If neither shows up within the grace period the
/// whole buffer is emitted.
#[derive(Debug, Clone)]
pub struct FirstPhraseSegmenter {
    buffer: String,
    pattern: Option<Regex>,
    min_chars: usize,
    grace: Duration,
    threshold_reached: Option<Instant>,
}

impl FirstPhraseSegmenter {
    /// Create a first-phrase segmenter with the default delimiters
    #[must_use]
    pub fn new(min_chars: usize, grace: Duration) -> Self {
        Self {
            buffer: String::new(),
            pattern: delimiter_pattern(DEFAULT_DELIMITERS),
            min_chars,
            grace,
            threshold_reached: None,
        }
    }

    /// Append a chunk, returning the first phrase once it is ready
    pub fn consume(&mut self, chunk: &str) -> Option<String> {
        self.consume_at(chunk, Instant::now())
    }

    /// Like [`Self::consume`] with an explicit clock reading
    pub fn consume_at(&mut self, chunk: &str, now: Instant) -> Option<String> {
        self.buffer.push_str(chunk);
        let trimmed = self.buffer.len() - self.buffer.trim_start().len();
        self.buffer.drain(..trimmed);

        let start = char_offset(&self.buffer, self.min_chars)?;
        let reached = *self.threshold_reached.get_or_insert(now);

        let delimiter_end = self
            .pattern
            .as_ref()
            .and_then(|p| p.find_at(&self.buffer, start))
            .map(|m| m.end());
        let whitespace_end = self.buffer[start..]
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, c)| start + i + c.len_utf8());

        let split = match (delimiter_end, whitespace_end) {
            (Some(d), Some(w)) => Some(d.min(w)),
            (d, w) => d.or(w),
        };

        if let Some(split) = split {
            return self.emit(split);
        }

        if now.duration_since(reached) >= self.grace {
            let len = self.buffer.len();
            return self.emit(len);
        }

        None
    }

    /// Instant at which the grace period expires, if it is running
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.threshold_reached.map(|t| t + self.grace)
    }

    /// Force-split if the grace period has elapsed at `now`
    pub fn poll_deadline(&mut self, now: Instant) -> Option<String> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let len = self.buffer.len();
        self.emit(len)
    }

    /// Emit whatever remains at end of stream
    pub fn flush(&mut self) -> Option<String> {
        self.threshold_reached = None;
        let rest = std::mem::take(&mut self.buffer);
        let phrase = rest.trim();
        (!phrase.is_empty()).then(|| phrase.to_string())
    }

    /// Remaining text after the first phrase was emitted
    #[must_use]
    pub fn into_remainder(self) -> String {
        self.buffer
    }

    fn emit(&mut self, split: usize) -> Option<String> {
        let phrase = self.buffer[..split].trim().to_string();
        self.buffer.drain(..split);
        self.threshold_reached = None;
        (!phrase.is_empty()).then_some(phrase)
    }
}

/// Segmenter for a whole turn: latency-first opening phrase, then
/// delimiter-only phrases
#[derive(Debug)]
pub struct TurnSegmenter {
    first: Option<FirstPhraseSegmenter>,
    rest: TextSegmenter,
}

impl TurnSegmenter {
    /// Create a turn segmenter
    #[must_use]
    pub fn new(first_min_chars: usize, grace: Duration, min_chars: usize) -> Self {
        Self {
            first: Some(FirstPhraseSegmenter::new(first_min_chars, grace)),
            rest: TextSegmenter::new(min_chars),
        }
    }

    /// Build from pipeline settings
    #[must_use]
    pub fn from_settings(settings: &crate::config::SegmenterSettings) -> Self {
        Self::new(
            settings.first_phrase_min_chars,
            settings.first_phrase_grace(),
            settings.min_chars,
        )
    }

    /// Whether the opening phrase has been emitted
    #[must_use]
    pub const fn first_emitted(&self) -> bool {
        self.first.is_none()
    }

    /// Append a chunk and return the phrases now complete
    pub fn consume(&mut self, chunk: &str) -> Vec<String> {
        self.consume_at(chunk, Instant::now())
    }

    /// Like [`Self::consume`] with an explicit clock reading
    pub fn consume_at(&mut self, chunk: &str, now: Instant) -> Vec<String> {
        let Some(first) = self.first.as_mut() else {
            return self.rest.consume(chunk);
        };

        match first.consume_at(chunk, now) {
            Some(phrase) => {
                let mut phrases = vec![phrase];
                phrases.extend(self.hand_over());
                phrases
            }
            None => Vec::new(),
        }
    }

    /// Grace deadline of the opening phrase, if one is pending
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.first.as_ref().and_then(FirstPhraseSegmenter::deadline)
    }

    /// Force-split the opening phrase once its grace period has elapsed
    pub fn poll_deadline(&mut self, now: Instant) -> Vec<String> {
        let Some(first) = self.first.as_mut() else {
            return Vec::new();
        };
        match first.poll_deadline(now) {
            Some(phrase) => {
                let mut phrases = vec![phrase];
                phrases.extend(self.hand_over());
                phrases
            }
            None => Vec::new(),
        }
    }

    /// Emit whatever remains at end of stream
    pub fn flush(&mut self) -> Option<String> {
        match self.first.take() {
            Some(mut first) => first.flush(),
            None => self.rest.flush(),
        }
    }

    /// Move the first segmenter's leftover text into the delimiter segmenter
    fn hand_over(&mut self) -> Vec<String> {
        let remainder = self
            .first
            .take()
            .map(FirstPhraseSegmenter::into_remainder)
            .unwrap_or_default();
        let leftover = self.rest.take_buffer();
        self.rest.consume(&(leftover + &remainder))
    }
}
