//! Exec session frames.
//!
//! Every websocket text message carries exactly one JSON object with a single
//! key naming the frame kind:
//!
//! ```text
//! {"stdin":{"data":"DQ=="}}                    client -> server
//! {"tty_size":{"width":80,"height":24}}        client -> server
//! {"stdout":{"data":"c2gtMy4yIPCfpbMk"}}       server -> client
//! ```
//!
//! Byte payloads are base64 on the wire so arbitrary terminal bytes survive
//! the JSON encoding. Dimensions are plain integers.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TtySize {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

impl TtySize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl Default for TtySize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// One decoded exec frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keystrokes from the local terminal.
    Stdin(Vec<u8>),
    /// Output from the remote process.
    Stdout(Vec<u8>),
    /// Local terminal dimensions.
    TtySize(TtySize),
}

/// On-the-wire shape: payloads still base64-encoded.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireFrame {
    Stdin(WireData),
    Stdout(WireData),
    TtySize(TtySize),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireData {
    data: String,
}

impl Frame {
    /// Builds a `stdin` frame from raw keystroke bytes.
    pub fn stdin(bytes: impl Into<Vec<u8>>) -> Self {
        Frame::Stdin(bytes.into())
    }

    /// Builds a `tty_size` frame.
    pub fn tty_size(width: u16, height: u16) -> Self {
        Frame::TtySize(TtySize::new(width, height))
    }

    /// The wire tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Stdin(_) => "stdin",
            Frame::Stdout(_) => "stdout",
            Frame::TtySize(_) => "tty_size",
        }
    }

    /// Serializes the frame into one JSON text message.
    pub fn to_json(&self) -> Result<String> {
        let wire = match self {
            Frame::Stdin(bytes) => WireFrame::Stdin(WireData {
                data: STANDARD.encode(bytes),
            }),
            Frame::Stdout(bytes) => WireFrame::Stdout(WireData {
                data: STANDARD.encode(bytes),
            }),
            Frame::TtySize(size) => WireFrame::TtySize(*size),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parses one JSON text message of any kind.
    pub fn from_json(text: &str) -> Result<Self> {
        let wire: WireFrame = serde_json::from_str(text)?;
        Ok(match wire {
            WireFrame::Stdin(WireData { data }) => Frame::Stdin(STANDARD.decode(data)?),
            WireFrame::Stdout(WireData { data }) => Frame::Stdout(STANDARD.decode(data)?),
            WireFrame::TtySize(size) => Frame::TtySize(size),
        })
    }

    /// Parses a server message and returns the output bytes it carries.
    ///
    /// Only `stdout` is valid in the server-to-client direction.
    pub fn decode_output(text: &str) -> Result<Vec<u8>> {
        match Self::from_json(text)? {
            Frame::Stdout(bytes) => Ok(bytes),
            other => Err(ProtocolError::UnexpectedFrame { kind: other.kind() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tty_size_wire_shape() {
        let json = Frame::tty_size(80, 24).to_json().unwrap();
        assert_eq!(json, r#"{"tty_size":{"width":80,"height":24}}"#);
    }

    #[test]
    fn test_stdin_wire_shape() {
        let json = Frame::stdin(b"\r".to_vec()).to_json().unwrap();
        assert_eq!(json, r#"{"stdin":{"data":"DQ=="}}"#);
    }

    #[test]
    fn test_stdin_binary_payload() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let json = Frame::stdin(bytes.clone()).to_json().unwrap();
        assert_eq!(Frame::from_json(&json).unwrap(), Frame::Stdin(bytes));
    }

    #[test]
    fn test_decode_output_utf8() {
        let bytes = Frame::decode_output(r#"{"stdout":{"data":"c2gtMy4yIPCfpbMk"}}"#).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "sh-3.2 🥳$");
    }

    #[test]
    fn test_decode_output_empty_payload() {
        let bytes = Frame::decode_output(r#"{"stdout":{"data":""}}"#).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_decode_output_ignores_extra_payload_fields() {
        let bytes = Frame::decode_output(r#"{"stdout":{"data":"aGk=","seq":3}}"#).unwrap();
        assert_eq!(bytes, b"hi");
    }

    #[test]
    fn test_decode_output_rejects_client_frames() {
        let err = Frame::decode_output(r#"{"stdin":{"data":"DQ=="}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedFrame { kind: "stdin" }));

        let err = Frame::decode_output(r#"{"tty_size":{"width":1,"height":1}}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedFrame { kind: "tty_size" }
        ));
    }

    #[test]
    fn test_decode_output_rejects_unknown_tag() {
        let err = Frame::decode_output(r#"{"exited":true}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_decode_output_rejects_two_tags() {
        let err = Frame::decode_output(
            r#"{"stdout":{"data":"aGk="},"stdin":{"data":"aGk="}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_decode_output_rejects_missing_data() {
        let err = Frame::decode_output(r#"{"stdout":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_decode_output_rejects_bad_base64() {
        let err = Frame::decode_output(r#"{"stdout":{"data":"not base64!"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn test_decode_output_rejects_garbage() {
        let err = Frame::decode_output("hello").unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_kind() {
        assert_eq!(Frame::stdin(vec![]).kind(), "stdin");
        assert_eq!(Frame::Stdout(vec![]).kind(), "stdout");
        assert_eq!(Frame::tty_size(1, 1).kind(), "tty_size");
    }

    #[test]
    fn test_default_tty_size() {
        assert_eq!(TtySize::default(), TtySize::new(80, 24));
    }
}
