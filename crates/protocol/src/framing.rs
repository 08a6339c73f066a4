//! Wire frames exchanged with the device manager.
//!
//! Pair requests and the `connect` challenge response travel as text
//! frames. Everything else is an encrypted envelope in a binary frame, and
//! the ciphertext must reach the peer byte-for-byte.

/// One WebSocket payload, independent of the socket library in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame carrying plain JSON.
    Text(String),
    /// Binary frame carrying `IV || ciphertext`.
    Binary(Vec<u8>),
}

impl Frame {
    /// Returns true for binary frames.
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    /// Returns the payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the payload for an error log entry: text as-is, binary as hex.
    pub fn display_payload(&self) -> String {
        match self {
            Frame::Text(text) => text.clone(),
            Frame::Binary(bytes) => hex::encode(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kinds() {
        let text = Frame::Text("{}".to_string());
        let binary = Frame::Binary(vec![1u8, 2, 3]);
        assert!(!text.is_binary());
        assert!(binary.is_binary());
        assert_eq!(text.len(), 2);
        assert_eq!(binary.len(), 3);
        assert!(Frame::Binary(Vec::new()).is_empty());
    }

    #[test]
    fn test_display_payload() {
        assert_eq!(Frame::Text("abc".into()).display_payload(), "abc");
        assert_eq!(Frame::Binary(vec![0xde, 0xad]).display_payload(), "dead");
    }
}
