use bytes::Bytes;

/// One logical SSE event as parsed from the upstream feed.
///
/// `event_type` is empty when the provider omits the `event:` field. `data`
/// holds every `data:` line of the frame joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    event_type: String,
    data: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Re-frames the event for downstream clients:
    /// `event: <type>\ndata: <data>\n\n`.
    ///
    /// Multi-line data is emitted as one `data:` line per source line so the
    /// browser's EventSource reassembles the same newline-joined string.
    pub fn to_frame(&self) -> Bytes {
        let mut frame = String::with_capacity(self.event_type.len() + self.data.len() + 16);
        frame.push_str("event: ");
        frame.push_str(&self.event_type);
        frame.push('\n');
        for line in self.data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        Bytes::from(frame)
    }
}
