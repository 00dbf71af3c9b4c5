//! Incremental decoder for `text/event-stream` bodies as sent by
//! OpenAI-compatible chat endpoints.

use serde_json::Value;

use crate::llm::LlmError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Feeds raw body chunks in, gets complete events out. Chunk boundaries may
/// fall anywhere, including inside a UTF-8 sequence or a `\r\n` pair.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        for &b in chunk {
            if b == b'\n' {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.on_line(&String::from_utf8_lossy(&line), &mut out);
            } else {
                self.line.push(b);
            }
        }
        out
    }

    /// Flushes a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.on_line(&String::from_utf8_lossy(&line), &mut out);
        }
        self.dispatch(&mut out);
        out
    }

    fn on_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line.starts_with(':') {
            return; // comment / keep-alive
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            self.data.push(rest.to_string());
        }
        // event:, id:, retry: carry nothing we use.
    }

    fn dispatch(&mut self, out: &mut Vec<SseEvent>) {
        if self.data.is_empty() {
            return;
        }
        let payload = std::mem::take(&mut self.data).join("\n");
        if payload.trim() == "[DONE]" {
            out.push(SseEvent::Done);
        } else {
            out.push(SseEvent::Data(payload));
        }
    }
}

/// Extracts `choices[0].delta.content` from one streamed chunk.
/// `Ok(None)` for role-only or finish chunks.
pub fn parse_delta(payload: &str) -> Result<Option<String>, LlmError> {
    let v: Value = serde_json::from_str(payload)
        .map_err(|e| LlmError::new("E_LLM_PARSE", format!("invalid stream chunk: {e}")))?;
    if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| err.to_string());
        return Err(LlmError::new("E_LLM_API", msg));
    }
    let content = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut d = SseDecoder::new();
        let mut ev = d.push(b"data: {\"a\"");
        assert!(ev.is_empty());
        ev.extend(d.push(b":1}\r"));
        ev.extend(d.push(b"\n\r\n: ping\n\ndata: [DONE]\n\n"));
        assert_eq!(
            ev,
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
    }

    #[test]
    fn multibyte_char_split_between_chunks() {
        let bytes = "data: 你好\n\n".as_bytes();
        let mut d = SseDecoder::new();
        let mut ev = d.push(&bytes[..8]);
        ev.extend(d.push(&bytes[8..]));
        assert_eq!(ev, vec![SseEvent::Data("你好".to_string())]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: tail").is_empty());
        assert_eq!(d.finish(), vec![SseEvent::Data("tail".to_string())]);
        assert!(d.finish().is_empty());
    }

    #[test]
    fn delta_content_and_skips() {
        let c = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_delta(c).unwrap(), Some("Hel".to_string()));
        let role = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(role).unwrap(), None);
        let fin = r#"{"choices":[{"delta":{"content":""},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_delta(fin).unwrap(), None);
    }

    #[test]
    fn in_stream_error_payload() {
        let e = parse_delta(r#"{"error":{"message":"context too long"}}"#).unwrap_err();
        assert_eq!(e.code, "E_LLM_API");
        assert_eq!(e.message, "context too long");
        assert_eq!(parse_delta("nope").unwrap_err().code, "E_LLM_PARSE");
    }
}
