//! Upstream SSE framing.

use serde_json::Value;

/// Payload of an upstream `data:` event.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Data(Value),
    Done,
}

pub fn parse_event(payload: &str) -> Result<UpstreamEvent, serde_json::Error> {
    if payload.trim() == "[DONE]" {
        return Ok(UpstreamEvent::Done);
    }
    serde_json::from_str(payload).map(UpstreamEvent::Data)
}

/// Collects `data:` lines into event payloads. Bytes are buffered until a full
/// line is available so multi-byte characters split across network chunks
/// decode intact.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(line, &mut events);
        }
        events
    }

    /// Flushes an event left open when the stream ends without a blank line.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            self.take_line(line, &mut events);
        }
        if !self.data_lines.is_empty() {
            events.push(self.data_lines.join("\n"));
            self.data_lines.clear();
        }
        events
    }

    fn take_line(&mut self, line: String, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                events.push(self.data_lines.join("\n"));
                self.data_lines.clear();
            }
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim_start().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_events_on_blank_lines() {
        let mut accumulator = SseAccumulator::new();
        let events = accumulator.push(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn ignores_comments_and_other_fields() {
        let mut accumulator = SseAccumulator::new();
        let events = accumulator.push(b": keepalive\nevent: message\nid: 4\ndata: x\r\n\r\n");
        assert_eq!(events, vec!["x".to_string()]);
    }

    #[test]
    fn joins_multiline_data_and_survives_split_chunks() {
        let mut accumulator = SseAccumulator::new();
        let text = "data: caf\u{e9}\ndata: two\n\n".as_bytes();
        let split = text.iter().position(|byte| *byte == 0xc3).expect("multibyte") + 1;
        assert!(accumulator.push(&text[..split]).is_empty());
        assert_eq!(accumulator.push(&text[split..]), vec!["caf\u{e9}\ntwo".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut accumulator = SseAccumulator::new();
        assert!(accumulator.push(b"data: {\"b\":2}").is_empty());
        assert_eq!(accumulator.finish(), vec!["{\"b\":2}".to_string()]);
        assert!(accumulator.finish().is_empty());
    }

    #[test]
    fn parses_done_and_json_payloads() {
        assert_eq!(parse_event("[DONE]").expect("done"), UpstreamEvent::Done);
        assert_eq!(
            parse_event("{\"x\":true}").expect("json"),
            UpstreamEvent::Data(json!({"x": true}))
        );
        assert!(parse_event("{oops").is_err());
    }
}
