//! Reassembly of BLE notifications into complete messages.
//!
//! Targets push JSON over a notify characteristic whose payloads are capped by
//! the negotiated MTU, so one logical message can arrive in several pieces and
//! several messages can share one notification. Messages are terminated by
//! `\r\r` or `\r\n`; short messages frequently arrive as a single notification
//! with no terminator at all.
//!
//! [`FrameReassembler::feed`] handles both cases:
//!
//! 1. Append the new bytes to the buffer.
//! 2. If the whole buffer is one valid JSON document, emit it and clear.
//! 3. Otherwise split at the *last* separator in the buffer (the later of
//!    `\r\r` and `\r\n` wins); everything before it is one message, everything
//!    after it stays buffered.
//!
//! At most one separator-delimited message is extracted per call. A message
//! that is not valid UTF-8 is logged and dropped, as are empty frames.

use tracing::{trace, warn};

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

/// Two-byte message terminators accepted from targets.
pub const SEPARATORS: [[u8; 2]; 2] = [[CR, CR], [CR, LF]];

/// Stateful byte buffer turning raw notifications into message strings.
///
/// One instance per connection; call [`reset`](Self::reset) on disconnect.
#[derive(Debug, Default, Clone)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly received bytes, returning any messages completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        if bytes.is_empty() {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);
        trace!(received = bytes.len(), buffered = self.buffer.len(), "Notification appended");

        // A bare terminator left over after a self-delimited JSON message.
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return Vec::new();
        }

        if is_complete_json(&self.buffer) {
            let mut raw = std::mem::take(&mut self.buffer);
            while raw.last().is_some_and(|b| *b == CR || *b == LF) {
                raw.pop();
            }
            return decode(raw).into_iter().collect();
        }

        let Some(index) = last_separator(&self.buffer) else {
            return Vec::new();
        };

        let remainder = self.buffer.split_off(index + 2);
        let mut complete = std::mem::replace(&mut self.buffer, remainder);
        complete.truncate(index);
        trace!(message_len = complete.len(), buffered = self.buffer.len(), "Separator found");

        decode(complete).into_iter().collect()
    }

    /// Drop any partially received message.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently held waiting for a terminator.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn is_complete_json(buffer: &[u8]) -> bool {
    matches!(serde_json::from_slice::<serde_json::Value>(buffer), Ok(serde_json::Value::Object(_)))
}

/// Index of the last separator, preferring whichever kind occurs later.
pub(crate) fn last_separator(buffer: &[u8]) -> Option<usize> {
    SEPARATORS.iter().filter_map(|sep| rfind(buffer, sep)).max()
}

fn rfind(buffer: &[u8], needle: &[u8; 2]) -> Option<usize> {
    buffer.windows(2).rposition(|window| window == needle)
}

fn decode(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match String::from_utf8(bytes) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(len = e.as_bytes().len(), "Dropping message with invalid UTF-8: {}", e.utf8_error());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MESSAGE: &str = r#"{"type":"netlink","action":"forward","device":"T-A","content":{"ack":"ready"}}"#;

    #[test]
    fn whole_json_without_separator_is_emitted() {
        let mut reassembler = FrameReassembler::new();
        let out = reassembler.feed(MESSAGE.as_bytes());
        assert_eq!(out, vec![MESSAGE.to_string()]);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn empty_input_is_noop() {
        let mut reassembler = FrameReassembler::new();
        reassembler.feed(b"{\"type\":");
        assert!(reassembler.feed(&[]).is_empty());
        assert_eq!(reassembler.buffered(), b"{\"type\":");
    }

    #[test]
    fn partial_frame_is_retained() {
        let mut reassembler = FrameReassembler::new();
        let (head, tail) = MESSAGE.split_at(30);
        assert!(reassembler.feed(head.as_bytes()).is_empty());
        assert_eq!(reassembler.buffered().len(), 30);
        assert_eq!(reassembler.feed(tail.as_bytes()), vec![MESSAGE.to_string()]);
    }

    #[test]
    fn separator_straddling_two_feeds() {
        let mut reassembler = FrameReassembler::new();
        let mut first = b"not json ".to_vec();
        first.push(CR);
        assert!(reassembler.feed(&first).is_empty());
        assert_eq!(reassembler.feed(&[LF, b'x']), vec!["not json ".to_string()]);
        assert_eq!(reassembler.buffered(), b"x");
    }

    #[test]
    fn later_separator_wins() {
        let mut reassembler = FrameReassembler::new();
        // \r\r at index 1, \r\n at index 4
        let out = reassembler.feed(b"a\r\rb\r\nc");
        assert_eq!(out, vec!["a\r\rb".to_string()]);
        assert_eq!(reassembler.buffered(), b"c");
    }

    #[test]
    fn carriage_return_carriage_return_alone() {
        let mut reassembler = FrameReassembler::new();
        let out = reassembler.feed(b"{\"a\":1\r\r");
        assert_eq!(out, vec!["{\"a\":1".to_string()]);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn only_one_message_per_feed() {
        let mut reassembler = FrameReassembler::new();
        let out = reassembler.feed(b"one\r\ntwo\r\nthree");
        // The last separator splits; everything before it is a single message.
        assert_eq!(out, vec!["one\r\ntwo".to_string()]);
        assert_eq!(reassembler.buffered(), b"three");
    }

    #[test]
    fn invalid_utf8_message_is_dropped() {
        let mut reassembler = FrameReassembler::new();
        let out = reassembler.feed(&[0xFF, 0xFE, CR, LF, b'{']);
        assert!(out.is_empty());
        assert_eq!(reassembler.buffered(), b"{");
    }

    #[test]
    fn reset_clears_partial_frame() {
        let mut reassembler = FrameReassembler::new();
        reassembler.feed(b"{\"partial\":");
        reassembler.reset();
        assert!(reassembler.is_empty());
        assert_eq!(reassembler.feed(MESSAGE.as_bytes()), vec![MESSAGE.to_string()]);
    }

    #[test]
    fn trailing_terminator_after_fast_path_is_discarded() {
        let mut reassembler = FrameReassembler::new();
        let mut bytes = MESSAGE.as_bytes().to_vec();
        bytes.push(CR);
        assert_eq!(reassembler.feed(&bytes), vec![MESSAGE.to_string()]);
        assert!(reassembler.feed(&[LF]).is_empty());
        assert!(reassembler.is_empty());
    }

    #[test]
    fn json_array_is_not_a_complete_message() {
        let mut reassembler = FrameReassembler::new();
        assert!(reassembler.feed(b"[1,2]").is_empty());
    }

    proptest! {
        #[test]
        fn message_survives_any_split(
            split in 0usize..=MESSAGE.len(),
            use_crlf in any::<bool>(),
        ) {
            let separator: &[u8] = if use_crlf { b"\r\n" } else { b"\r\r" };
            let mut bytes = MESSAGE.as_bytes().to_vec();
            bytes.extend_from_slice(separator);

            let mut reassembler = FrameReassembler::new();
            let mut out = reassembler.feed(&bytes[..split]);
            out.extend(reassembler.feed(&bytes[split..]));

            prop_assert_eq!(out, vec![MESSAGE.to_string()]);
            prop_assert!(reassembler.is_empty());
        }

        #[test]
        fn message_survives_byte_by_byte_delivery(key in "[a-z]{1,8}", value in "[a-zA-Z0-9 ]{0,40}") {
            let message = serde_json::json!({ key: value }).to_string();
            let mut reassembler = FrameReassembler::new();
            let mut out = Vec::new();
            for byte in message.as_bytes() {
                out.extend(reassembler.feed(std::slice::from_ref(byte)));
            }
            out.extend(reassembler.feed(b"\r\n"));
            prop_assert_eq!(out, vec![message]);
        }

        #[test]
        fn split_point_is_latest_separator(prefix in "[a-z]{0,10}", middle in "[a-z]{0,10}", suffix in "[a-z]{0,10}") {
            let text = format!("{prefix}\r\r{middle}\r\n{suffix}");
            let expected = text.len() - suffix.len() - 2;
            prop_assert_eq!(last_separator(text.as_bytes()), Some(expected));
        }
    }
}
