//! SSE frame parser.
//!
//! Turns the upstream byte stream into [`Event`] values. Only the `event:` and
//! `data:` fields are understood; comments, `id:` and `retry:` lines are
//! skipped. A blank line closes the current frame.

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use log::*;

use crate::error::{Error, ParseError};
use crate::message::Event;

/// Largest accepted line, matching the provider's documented frame ceiling.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental, push-based SSE parser.
///
/// Bytes go in through [`FrameParser::feed`]; completed events come out of
/// [`FrameParser::next_event`] in order. One parser belongs to exactly one
/// upstream session and is discarded when that session ends.
#[derive(Debug)]
pub struct FrameParser {
    buffer: BytesMut,
    // Prefix of `buffer` already known to contain no newline.
    scanned: usize,
    max_line_bytes: usize,
    event_type: String,
    data: Vec<String>,
}

impl FrameParser {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
            event_type: String::new(),
            data: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pulls the next completed event out of the buffered bytes.
    ///
    /// Returns `Ok(None)` when more input is needed. An error leaves the
    /// parser unusable; the session that owns it must end.
    pub fn next_event(&mut self) -> Result<Option<Event>, ParseError> {
        while let Some(line) = self.next_line()? {
            if let Some(event) = self.accept_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Discards any partial line and unterminated frame left at end of stream.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() || !self.data.is_empty() {
            debug!(
                "Discarding unterminated frame ({} buffered bytes, {} data lines)",
                self.buffer.len(),
                self.data.len()
            );
        }
        self.buffer.clear();
        self.scanned = 0;
        self.reset();
    }

    fn next_line(&mut self) -> Result<Option<String>, ParseError> {
        let newline = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n');

        let Some(offset) = newline else {
            self.scanned = self.buffer.len();
            if self.buffer.len() > self.max_line_bytes {
                return Err(ParseError::LineTooLong {
                    limit: self.max_line_bytes,
                });
            }
            return Ok(None);
        };

        let end = self.scanned + offset;
        let mut raw = self.buffer.split_to(end + 1);
        self.scanned = 0;
        raw.truncate(end);
        if raw.last() == Some(&b'\r') {
            raw.truncate(raw.len() - 1);
        }

        if raw.len() > self.max_line_bytes {
            return Err(ParseError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }

        std::str::from_utf8(&raw)
            .map(|line| Some(line.to_owned()))
            .map_err(|_| ParseError::InvalidUtf8)
    }

    fn accept_line(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            return self.flush();
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.event_type = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim().to_owned());
        } else {
            trace!("Ignoring SSE line: {line}");
        }
        None
    }

    fn flush(&mut self) -> Option<Event> {
        if self.data.is_empty() {
            self.reset();
            return None;
        }

        let event = Event::new(
            std::mem::take(&mut self.event_type),
            self.data.join("\n"),
        );
        self.data.clear();
        Some(event)
    }

    fn reset(&mut self) {
        self.event_type.clear();
        self.data.clear();
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

/// Adapts an upstream byte stream into a lazy stream of events.
///
/// The stream ends after the first error; a clean end of input discards any
/// unterminated trailing frame.
pub fn events<S>(bytes: S, max_line_bytes: usize) -> impl Stream<Item = Result<Event, Error>>
where
    S: Stream<Item = Result<Bytes, Error>> + Unpin,
{
    try_stream! {
        let mut bytes = bytes;
        let mut parser = FrameParser::new(max_line_bytes);

        while let Some(chunk) = bytes.next().await {
            parser.feed(&chunk?);
            while let Some(event) = parser.next_event()? {
                yield event;
            }
        }

        parser.finish();
    }
}
