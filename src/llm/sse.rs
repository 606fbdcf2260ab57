//! Incremental Server-Sent Events decoder for streamed chat completions.
//!
//! Feed raw response bytes with [`SseDecoder::feed`]; complete events come
//! out as they close. The `[DONE]` sentinel used by OpenAI-compatible
//! endpoints is exposed via [`SseEvent::is_done`].

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if present.
    pub event: Option<String>,
    /// Joined `data:` payload (multi-line data joined with `\n`).
    pub data: String,
}

impl SseEvent {
    /// Whether this event is the end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Stateful line decoder; survives events split across arbitrary chunk
/// boundaries.
#[derive(Debug, Default)]
pub struct SseDecoder {
    partial_line: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of bytes, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        for byte_char in String::from_utf8_lossy(chunk).chars() {
            if byte_char != '\n' {
                self.partial_line.push(byte_char);
                continue;
            }
            let line = std::mem::take(&mut self.partial_line);
            if let Some(event) = self.take_line(line.strip_suffix('\r').unwrap_or(&line)) {
                out.push(event);
            }
        }
        out
    }

    /// Flush a trailing unterminated event when the stream closes.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            self.take_line(line.strip_suffix('\r').unwrap_or(&line));
        }
        self.close_event()
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.close_event();
        }
        // Comment lines start with a colon.
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => return None,
        };
        match field {
            "data" => self.data_lines.push(value.to_owned()),
            "event" => self.event_name = Some(value.to_owned()),
            // id/retry and unknown fields are ignored.
            _ => {}
        }
        None
    }

    fn close_event(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event_name = None;
            return None;
        }
        Some(SseEvent {
            event: self.event_name.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<SseEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.feed(input.as_bytes());
        if let Some(trailing) = decoder.finish() {
            events.push(trailing);
        }
        events
    }

    // ── Whole-buffer decoding ─────────────────────────────────

    #[test]
    fn single_event() {
        let events = decode_all("data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn multiple_events() {
        let events = decode_all("data: one\n\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn multi_line_data_joined() {
        let events = decode_all("data: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn event_field_carried() {
        let events = decode_all("event: delta\ndata: x\n\n");
        assert_eq!(events[0].event.as_deref(), Some("delta"));
    }

    #[test]
    fn comments_and_unknown_fields_ignored() {
        let events = decode_all(": keepalive\nretry: 5000\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn no_space_after_colon() {
        let events = decode_all("data:tight\n\n");
        assert_eq!(events[0].data, "tight");
    }

    #[test]
    fn json_payload_with_colons() {
        let events = decode_all("data: {\"a\":\"b:c\"}\n\n");
        assert_eq!(events[0].data, "{\"a\":\"b:c\"}");
    }

    #[test]
    fn done_sentinel() {
        let events = decode_all("data: [DONE]\n\n");
        assert!(events[0].is_done());
    }

    #[test]
    fn crlf_lines() {
        let events = decode_all("data: hi\r\n\r\n");
        assert_eq!(events[0].data, "hi");
    }

    // ── Chunked decoding ──────────────────────────────────────

    #[test]
    fn event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        let events = decoder.feed(b"lo\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        let trailing = decoder.finish().expect("trailing event");
        assert_eq!(trailing.data, "tail");
    }

    #[test]
    fn finish_without_data_is_none() {
        let mut decoder = SseDecoder::new();
        let _ = decoder.feed(b"event: only-a-name\n");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn empty_lines_between_events_are_harmless() {
        let events = decode_all("\n\ndata: a\n\n\n\ndata: b\n\n");
        assert_eq!(events.len(), 2);
    }
}
