//! Incremental decoder for downstream `text/event-stream` bodies.
//!
//! Bytes arrive in arbitrary chunks. The decoder buffers until a full line
//! is available, gathers `data:` lines into an event and dispatches it on
//! the blank line that ends the event.

/// One decoded frame from the downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A piece of generated text.
    Token(String),
    /// The downstream's completion marker.
    Done,
    /// The downstream reported a failure in-band.
    Error(String),
}

/// Stateful line decoder. Feed it chunks, collect frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.process_line(&line, &mut frames);
            } else {
                self.line.push(byte);
            }
        }
        frames
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.process_line(&line, &mut frames);
        }
        self.dispatch(&mut frames);
        frames
    }

    fn process_line(&mut self, raw: &[u8], frames: &mut Vec<SseFrame>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);

        if line.is_empty() {
            self.dispatch(frames);
            return;
        }
        // Comments and keep-alives.
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data.push(value.to_string());
        }
        // `event:`, `id:` and `retry:` carry nothing the relay needs.
    }

    fn dispatch(&mut self, frames: &mut Vec<SseFrame>) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        if let Some(frame) = parse_payload(&payload) {
            frames.push(frame);
        }
    }
}

/// Interpret one event payload.
///
/// JSON objects carry `token` or `content` text, `done: true`, or `error`.
/// `[DONE]` is also accepted as completion. Anything that is not JSON is
/// forwarded as raw text.
fn parse_payload(payload: &str) -> Option<SseFrame> {
    let trimmed = payload.trim();
    if trimmed == "[DONE]" {
        return Some(SseFrame::Done);
    }

    let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            return (!payload.is_empty()).then(|| SseFrame::Token(payload.to_string()));
        }
    };

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = match error {
            serde_json::Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        return Some(SseFrame::Error(message));
    }

    if let Some(text) = value
        .get("token")
        .or_else(|| value.get("content"))
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
    {
        return Some(SseFrame::Token(text.to_string()));
    }

    if value.get("done").and_then(|d| d.as_bool()) == Some(true) {
        return Some(SseFrame::Done);
    }

    None
}
