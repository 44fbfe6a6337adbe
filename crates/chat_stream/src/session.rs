//! Incremental parser for the chat stream body.
//!
//! The body grows chunk by chunk. Each [`StreamSession::ingest`] call looks only
//! at bytes past `last_processed_offset` and consumes complete lines; a trailing
//! partial line waits for its line break (or for [`StreamSession::finish`]).

use serde_json::{Map, Value};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const KEEP_ALIVES: &[&str] = &["[PING]", "ping", "keep-alive", ":keepalive"];

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A piece of the assistant's reply, in order.
    Fragment(String),
    /// Out-of-band data such as the personality context.
    Metadata(Value),
    Done,
}

#[derive(Debug, Default)]
pub struct StreamSession {
    buffer: Vec<u8>,
    last_processed_offset: usize,
    content: String,
    content_chars: usize,
    fragments: usize,
    complete: bool,
    metadata: Option<Value>,
}

/// Only a truly empty payload is a blank keep-alive; a payload of spaces is
/// reply text.
fn is_keep_alive(payload: &str) -> bool {
    if payload.is_empty() {
        return true;
    }
    let trimmed = payload.trim();
    KEEP_ALIVES
        .iter()
        .any(|sentinel| trimmed.eq_ignore_ascii_case(sentinel))
}

/// `content`, or the OpenAI-style `choices[0].delta.content`.
fn content_of(object: &Map<String, Value>) -> Option<&str> {
    object.get("content").and_then(Value::as_str).or_else(|| {
        object
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
    })
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes and parse every complete line beyond the
    /// processed offset. Data after the terminal sentinel is ignored.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        if self.complete {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);
        self.process(false)
    }

    /// The body ended: parse whatever partial line remains.
    pub fn finish(&mut self) -> Vec<StreamItem> {
        if self.complete {
            return Vec::new();
        }
        self.process(true)
    }

    fn process(&mut self, at_end: bool) -> Vec<StreamItem> {
        let delta = &self.buffer[self.last_processed_offset..];
        let consumed = if at_end {
            delta.len()
        } else {
            match delta.iter().rposition(|&b| b == b'\n') {
                Some(idx) => idx + 1,
                None => return Vec::new(),
            }
        };
        // Line breaks never occur inside a multi-byte UTF-8 sequence, so
        // complete lines always decode cleanly.
        let text = String::from_utf8_lossy(&delta[..consumed]).into_owned();
        self.last_processed_offset += consumed;

        let mut items = Vec::new();
        for line in text.lines() {
            self.parse_line(line, &mut items);
            if self.complete {
                break;
            }
        }
        items
    }

    fn parse_line(&mut self, line: &str, items: &mut Vec<StreamItem>) {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        if payload.trim() == DONE_SENTINEL {
            self.complete = true;
            items.push(StreamItem::Done);
            return;
        }
        if is_keep_alive(payload) {
            return;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(object)) => {
                if let Some(context) = object.get("personalityContext") {
                    self.metadata = Some(context.clone());
                    items.push(StreamItem::Metadata(context.clone()));
                }
                if let Some(text) = content_of(&object) {
                    self.push_fragment(text.to_string(), items);
                }
            }
            Ok(Value::String(text)) => self.push_fragment(text, items),
            // Not a JSON object: the payload itself is the text.
            _ => self.push_fragment(payload.to_string(), items),
        }
    }

    fn push_fragment(&mut self, text: String, items: &mut Vec<StreamItem>) {
        if text.is_empty() {
            return;
        }
        self.content.push_str(&text);
        self.content_chars += text.chars().count();
        self.fragments += 1;
        items.push(StreamItem::Fragment(text));
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn into_content(self) -> String {
        self.content
    }

    pub fn content_chars(&self) -> usize {
        self.content_chars
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn last_processed_offset(&self) -> usize {
        self.last_processed_offset
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
