//! Incremental decoding of the answer stream.
//!
//! The backend streams plain text, but may also send a JSON control object
//! (`{"error": ...}` or `{"response": ...}`) through the same channel. Every
//! buffer is therefore parsed speculatively: a failed parse is the ordinary
//! case and means "literal text", never an error.

use serde_json::{Map, Value};

use crate::state::Update;

/// Held text that still looks like a truncated JSON object is released as
/// literal content once it grows past this size.
const MAX_HELD_BYTES: usize = 16 * 1024;

/// Outcome of one speculative parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// `{"error": "..."}`: terminal failure for the exchange.
    Error(String),
    /// `{"response": "..."}`: the answer text carried by this unit.
    Response(String),
    /// Starts like a JSON object but ended early; more bytes may complete it.
    Truncated,
    /// Anything else, including valid JSON that is not a control object.
    Literal,
}

enum ParseAttempt {
    Object(Map<String, Value>),
    Truncated,
    NotJson,
}

fn parse_object(text: &str) -> ParseAttempt {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => ParseAttempt::Object(map),
        Ok(_) => ParseAttempt::NotJson,
        Err(e) if e.is_eof() && text.trim_start().starts_with('{') => ParseAttempt::Truncated,
        Err(_) => ParseAttempt::NotJson,
    }
}

/// Classify a decoded text unit.
pub fn probe(text: &str) -> Probe {
    let map = match parse_object(text) {
        ParseAttempt::Object(map) => map,
        ParseAttempt::Truncated => return Probe::Truncated,
        ParseAttempt::NotJson => return Probe::Literal,
    };

    match map.get("error") {
        Some(Value::String(message)) if !message.is_empty() => {
            return Probe::Error(message.clone());
        }
        Some(value) if !is_blank(value) => return Probe::Error(value.to_string()),
        _ => {}
    }

    match map.get("response") {
        Some(Value::String(text)) => Probe::Response(text.clone()),
        _ => Probe::Literal,
    }
}

/// Values that count as "nothing there": null, false, zero and "".
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// UTF-8 decoding that tolerates multibyte sequences split across chunks.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for the next chunk
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn flush(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}

/// Turns raw body chunks into conversation updates, in arrival order.
///
/// After each chunk the whole pending buffer is probed. Literal text and
/// `response` objects are dispatched and reset the buffer; a truncated JSON
/// object is held until more bytes arrive; an `error` object ends decoding for
/// good.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    utf8: Utf8Carry,
    buffer: String,
    failed: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the update it produces, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Update> {
        if self.failed {
            return None;
        }
        let text = self.utf8.decode(chunk);
        self.buffer.push_str(&text);
        self.dispatch(false)
    }

    /// Signal end of stream and release anything still held.
    pub fn finish(&mut self) -> Option<Update> {
        if self.failed {
            return None;
        }
        let tail = self.utf8.flush();
        self.buffer.push_str(&tail);
        self.dispatch(true)
    }

    /// True once an in-band error has been seen.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn dispatch(&mut self, at_end: bool) -> Option<Update> {
        if self.buffer.is_empty() {
            return None;
        }

        match probe(&self.buffer) {
            Probe::Error(message) => {
                self.failed = true;
                self.buffer.clear();
                Some(Update::Failed(message))
            }
            Probe::Response(text) => {
                self.buffer.clear();
                Some(Update::Fragment(text))
            }
            Probe::Truncated if !at_end && self.buffer.len() <= MAX_HELD_BYTES => None,
            Probe::Truncated | Probe::Literal => {
                Some(Update::Fragment(std::mem::take(&mut self.buffer)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(s: &str) -> Option<Update> {
        Some(Update::Fragment(s.to_string()))
    }

    #[test]
    fn test_probe_plain_text_is_literal() {
        assert_eq!(probe("Hello, "), Probe::Literal);
        assert_eq!(probe(""), Probe::Literal);
        assert_eq!(probe("   \n"), Probe::Literal);
    }

    #[test]
    fn test_probe_json_scalars_are_literal() {
        assert_eq!(probe("42"), Probe::Literal);
        assert_eq!(probe("true"), Probe::Literal);
        assert_eq!(probe("\"quoted\""), Probe::Literal);
        assert_eq!(probe("[1, 2]"), Probe::Literal);
    }

    #[test]
    fn test_probe_control_objects() {
        assert_eq!(probe(r#"{"error":"bad input"}"#), Probe::Error("bad input".into()));
        assert_eq!(probe(r#"{"response":"42"}"#), Probe::Response("42".into()));
        assert_eq!(probe(r#"{"other":1}"#), Probe::Literal);
    }

    #[test]
    fn test_probe_error_wins_over_response() {
        let text = r#"{"response":"partial","error":"model crashed"}"#;
        assert_eq!(probe(text), Probe::Error("model crashed".into()));
    }

    #[test]
    fn test_probe_empty_error_is_not_control() {
        assert_eq!(probe(r#"{"error":""}"#), Probe::Literal);
        assert_eq!(probe(r#"{"error":null,"response":"ok"}"#), Probe::Response("ok".into()));
    }

    #[test]
    fn test_probe_zero_error_is_not_control() {
        assert_eq!(probe(r#"{"error":0}"#), Probe::Literal);
        assert_eq!(probe(r#"{"error":0.0,"response":"ok"}"#), Probe::Response("ok".into()));
        assert_eq!(probe(r#"{"error":3}"#), Probe::Error("3".into()));
    }

    #[test]
    fn test_probe_structured_error_value() {
        assert_eq!(probe(r#"{"error":{"code":7}}"#), Probe::Error(r#"{"code":7}"#.into()));
    }

    #[test]
    fn test_probe_truncated_object() {
        assert_eq!(probe(r#"{"error":"bad"#), Probe::Truncated);
        assert_eq!(probe("{abc"), Probe::Literal);
    }

    #[test]
    fn test_decoder_plain_chunks_pass_through() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(b"Hello, "), fragment("Hello, "));
        assert_eq!(decoder.push(b"world!"), fragment("world!"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_error_is_terminal() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(b"Some text"), fragment("Some text"));
        assert_eq!(
            decoder.push(br#"{"error":"bad input"}"#),
            Some(Update::Failed("bad input".into()))
        );
        assert!(decoder.is_failed());
        assert_eq!(decoder.push(b"more"), None);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_error_split_across_chunks() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(br#"{"error":"#), None);
        assert_eq!(
            decoder.push(br#""timeout"}"#),
            Some(Update::Failed("timeout".into()))
        );
    }

    #[test]
    fn test_decoder_response_object_per_chunk() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(br#"{"response":"The answer"}"#), fragment("The answer"));
        assert_eq!(decoder.push(b" continues"), fragment(" continues"));
    }

    #[test]
    fn test_decoder_flushes_held_text_at_end() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(br#"{"unfinished"#), None);
        assert_eq!(decoder.finish(), fragment(r#"{"unfinished"#));
    }

    #[test]
    fn test_decoder_releases_oversized_hold() {
        let mut decoder = StreamDecoder::new();
        let mut chunk = String::from("{\"k\":\"");
        chunk.push_str(&"x".repeat(MAX_HELD_BYTES));
        assert_eq!(decoder.push(chunk.as_bytes()), Some(Update::Fragment(chunk.clone())));
    }

    #[test]
    fn test_decoder_multibyte_split_across_chunks() {
        let bytes = "héllo".as_bytes();
        // 'é' is two bytes; split in the middle of it
        let (a, b) = bytes.split_at(2);
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(a), fragment("h"));
        assert_eq!(decoder.push(b), fragment("éllo"));
    }

    #[test]
    fn test_decoder_invalid_utf8_replaced() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(&[b'a', 0xFF, b'b']), fragment("a\u{FFFD}b"));
    }

    #[test]
    fn test_decoder_dangling_bytes_flushed_lossy() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(&[b'o', b'k', 0xE2, 0x82]), fragment("ok"));
        assert_eq!(decoder.finish(), fragment("\u{FFFD}"));
    }
}
