//! SSE (Server-Sent Events) stream decoder for the provider endpoints.
//!
//! Handles the `data: ` prefix, `[DONE]` termination, line buffering across
//! TCP chunk boundaries, and empty keep-alive lines. A stream that reaches
//! EOF without the decoder having seen `[DONE]` dropped mid-stream.

use serde_json::Value;

/// SSE stream decoder.
///
/// Feed raw byte chunks with [`decode`](SseDecoder::decode); complete
/// `data:` payloads come back as parsed JSON. The `[DONE]` sentinel is
/// consumed and recorded, not returned.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: String,
    done: bool,
}

impl SseDecoder {
    /// Create a new empty SSE decoder.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            done: false,
        }
    }

    /// Whether the `data: [DONE]` terminator has been observed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes into the decoder and return any complete JSON payloads.
    ///
    /// Handles `data: ` prefix lines, ignores `event:` lines and empty
    /// keep-alive lines. Unparseable payloads are logged and skipped so one
    /// malformed frame cannot take the stream down.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut values = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();

            if line.is_empty() || line.starts_with("event:") {
                continue;
            }

            if let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            {
                let data = data.trim();

                if data == "[DONE]" {
                    self.done = true;
                    continue;
                }

                match serde_json::from_str::<Value>(data) {
                    Ok(val) => values.push(val),
                    Err(err) => {
                        tracing::warn!(%err, payload = data, "skipping undecodable stream chunk");
                    }
                }
            }
        }

        values
    }

    /// Flush any remaining buffer content after the stream ends.
    pub fn flush(&mut self) -> Vec<Value> {
        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();

        if remaining.is_empty() {
            return Vec::new();
        }

        let mut values = Vec::new();
        for line in remaining.lines() {
            let line = line.trim();
            if let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            {
                let data = data.trim();
                if data == "[DONE]" {
                    self.done = true;
                } else if let Ok(val) = serde_json::from_str::<Value>(data) {
                    values.push(val);
                }
            }
        }

        values
    }

    /// The undecoded tail, for error reporting when a stream ends early.
    pub fn remainder(&self) -> &str {
        self.buffer.trim()
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_basic_decode() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"choices\":[{\"text\":\"Hello\"}]}\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert!(values[0]["choices"][0]["text"].as_str().is_some());
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_sse_done_recorded() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"choices\":[]}\n\ndata: [DONE]\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_sse_empty_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let values = decoder.decode(b"\n\n\ndata: {\"x\":1}\n\n\n\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["x"], 1);
    }

    #[test]
    fn test_sse_event_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let values = decoder.decode(b"event: message\ndata: {\"x\":1}\n\n");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_sse_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        let v1 = decoder.decode(b"data: {\"cho");
        assert!(v1.is_empty());

        let v2 = decoder.decode(b"ices\":[{\"text\":\"Hi\"}]}\n\n");
        assert_eq!(v2.len(), 1);
    }

    #[test]
    fn test_sse_multiple_events() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\ndata: {\"a\":3}\n\ndata: [DONE]\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 3);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_sse_malformed_payload_skipped() {
        let mut decoder = SseDecoder::new();
        let values = decoder.decode(b"data: {broken\n\ndata: {\"ok\":true}\n\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["ok"], true);
    }

    #[test]
    fn test_sse_flush_handles_trailing_done() {
        let mut decoder = SseDecoder::new();
        decoder.decode(b"data: {\"a\":1}\n\ndata: [DONE]");
        assert!(!decoder.is_done());
        let values = decoder.flush();
        assert!(values.is_empty());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_sse_remainder_exposed() {
        let mut decoder = SseDecoder::new();
        decoder.decode(b"data: {\"a\":1}\n\n{\"error\": {\"message\": \"boom\"}}");
        assert!(decoder.remainder().contains("boom"));
    }
}
