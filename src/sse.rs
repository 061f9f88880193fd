//! Incremental parser for server-sent events.
//!
//! Marathon's `/v2/events` endpoint speaks SSE
//! (<https://html.spec.whatwg.org/multipage/comms.html#server-sent-events>).
//! The parser is fed raw response chunks and yields complete events; partial
//! lines are buffered across chunks.

/// Lines longer than this abort the connection.
const MAX_LINE_LENGTH: usize = 16_384;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

#[derive(Debug, thiserror::Error)]
#[error("SSE line exceeded {MAX_LINE_LENGTH} bytes")]
pub struct LineLengthExceeded;

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body, returning any completed events.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, LineLengthExceeded> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        // A trailing newline means the last line is complete; otherwise it
        // stays buffered until the next chunk.
        let complete = self.buffer.ends_with('\n') || self.buffer.ends_with('\r');
        let mut lines = split_lines(&self.buffer);
        if complete {
            self.buffer.clear();
        } else {
            self.buffer = lines.pop().unwrap_or_default();
        }

        let mut events = Vec::new();
        for line in lines {
            if line.len() > MAX_LINE_LENGTH {
                return Err(LineLengthExceeded);
            }
            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else {
                self.handle_field(&line);
            }
        }

        if self.buffer.len() > MAX_LINE_LENGTH {
            return Err(LineLengthExceeded);
        }
        Ok(events)
    }

    fn handle_field(&mut self, line: &str) {
        let Some((field, value)) = parse_field_value(line) else {
            return;
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // "id" and "retry" are not implemented; unknown fields ignored.
            _ => {}
        }
    }

    /// Finish the pending event. Events without data are discarded.
    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        let data_lines = std::mem::take(&mut self.data_lines);
        if data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            data: data_lines.join("\n"),
        })
    }
}

/// Split on `\r\n`, `\n`, and `\r`, keeping an unterminated final line.
fn split_lines(s: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => lines.push(std::mem::take(&mut current)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                lines.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Parse `field: value` per the SSE spec. Comment lines yield `None`; a line
/// without a colon is a field with an empty value; a single leading space in
/// the value is stripped.
fn parse_field_value(line: &str) -> Option<(&str, &str)> {
    if line.starts_with(':') {
        return None;
    }
    match line.split_once(':') {
        None => Some((line, "")),
        Some((field, value)) => Some((field, value.strip_prefix(' ').unwrap_or(value))),
    }
}
