//! JSON messages exchanged over a session WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminant. Byte payloads
//! travel as standard base64 so arbitrary terminal output survives the
//! trip unchanged. Messages carry no session identity: the connection is
//! bound to one session for its whole life.

use serde::{Deserialize, Serialize};
use tb_core::types::{CloseReason, SignalName};
use tb_session::pty::PtyError;
use tb_session::validator::ValidationError;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bytes for the process's input.
    Input {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Resize { rows: u16, cols: u16 },
    Signal { name: SignalName },
    /// End-of-input marker.
    Eof,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Bytes produced by the process (or replayed from history).
    Output {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Error { code: ErrorCode, message: String },
    /// Sent once per connection, before any replayed output.
    Attached {
        session_id: Uuid,
        logical_key: String,
        resumed: bool,
        replay_bytes: usize,
    },
    /// The process ended; the server closes the socket next.
    Exit { code: Option<i32> },
    /// The server ended this connection's binding.
    Closed { reason: CloseReason },
}

impl ServerMessage {
    pub fn output(data: impl Into<Vec<u8>>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TooLarge,
    DangerousPattern,
    DecodeError,
    /// The process has exited; input can no longer reach it.
    ProcessClosed,
    /// The process is alive but this message was not delivered (input
    /// queue stayed full, or a signal could not be sent).
    InputFailed,
    InvalidResize,
    SpawnFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TooLarge => "TOO_LARGE",
            ErrorCode::DangerousPattern => "DANGEROUS_PATTERN",
            ErrorCode::DecodeError => "DECODE_ERROR",
            ErrorCode::ProcessClosed => "PROCESS_CLOSED",
            ErrorCode::InputFailed => "INPUT_FAILED",
            ErrorCode::InvalidResize => "INVALID_RESIZE",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
        }
    }
}

impl From<&ValidationError> for ErrorCode {
    fn from(err: &ValidationError) -> Self {
        match err {
            ValidationError::TooLarge { .. } => ErrorCode::TooLarge,
            ValidationError::DangerousPattern { .. } => ErrorCode::DangerousPattern,
        }
    }
}

impl From<&ValidationError> for ServerMessage {
    fn from(err: &ValidationError) -> Self {
        ServerMessage::error(err.into(), err.to_string())
    }
}

impl From<&PtyError> for ServerMessage {
    fn from(err: &PtyError) -> Self {
        match err {
            PtyError::Closed => {
                ServerMessage::error(ErrorCode::ProcessClosed, "the session's process has exited")
            }
            other => ServerMessage::error(ErrorCode::InputFailed, other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame limits
// ---------------------------------------------------------------------------

/// Room for the JSON envelope around an `input` payload.
const FRAME_ENVELOPE_BYTES: usize = 256;
/// Oversized input within this factor of the limit is still read and
/// answered with `TOO_LARGE`; anything beyond is refused by the transport.
const FRAME_SLACK: usize = 4;
const MIN_FRAME_BYTES: usize = 64 * 1024;

/// Largest WebSocket frame or message accepted for a given input limit.
pub fn max_frame_bytes(max_input_bytes: usize) -> usize {
    let encoded = max_input_bytes.div_ceil(3).saturating_mul(4);
    encoded
        .saturating_add(FRAME_ENVELOPE_BYTES)
        .saturating_mul(FRAME_SLACK)
        .max(MIN_FRAME_BYTES)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Why a client frame was refused before reaching the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("resize to {rows}x{cols} is not allowed")]
    InvalidResize { rows: u16, cols: u16 },
}

impl DecodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DecodeError::Malformed(_) => ErrorCode::DecodeError,
            DecodeError::InvalidResize { .. } => ErrorCode::InvalidResize,
        }
    }

    /// The `error` reply sent back to the client.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.code(), self.to_string())
    }
}

/// Parse one client text frame.
pub fn decode_client(text: &str) -> Result<ClientMessage, DecodeError> {
    let msg: ClientMessage =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if let ClientMessage::Resize { rows, cols } = msg {
        if rows == 0 || cols == 0 {
            return Err(DecodeError::InvalidResize { rows, cols });
        }
    }
    Ok(msg)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn input_payload_is_base64() {
        let msg = decode_client(r#"{"type":"input","data":"G1tBaGk="}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Input {
                data: b"\x1b[Ahi".to_vec()
            }
        );
    }

    #[test]
    fn output_keeps_non_utf8_bytes() {
        let raw = vec![0xff, 0x00, 0x1b, b'[', b'm', 0xc3];
        let text = ServerMessage::output(raw.clone()).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "output");
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ServerMessage::Output { data: raw });
    }

    #[test]
    fn control_messages_decode() {
        assert_eq!(
            decode_client(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap(),
            ClientMessage::Resize { rows: 40, cols: 120 }
        );
        assert_eq!(
            decode_client(r#"{"type":"signal","name":"interrupt"}"#).unwrap(),
            ClientMessage::Signal {
                name: SignalName::Interrupt
            }
        );
        assert_eq!(decode_client(r#"{"type":"eof"}"#).unwrap(), ClientMessage::Eof);
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        for text in [
            "not json",
            r#"{"data":"aGk="}"#,
            r#"{"type":"launch_missiles"}"#,
            r#"{"type":"input","data":"***"}"#,
            r#"{"type":"signal","name":"kill"}"#,
            r#"{"type":"resize","rows":-1,"cols":80}"#,
        ] {
            let err = decode_client(text).expect_err(text);
            assert_eq!(err.code(), ErrorCode::DecodeError, "{text}");
        }
    }

    #[test]
    fn zero_sized_resize_is_rejected() {
        let err = decode_client(r#"{"type":"resize","rows":0,"cols":80}"#).unwrap_err();
        assert_eq!(err, DecodeError::InvalidResize { rows: 0, cols: 80 });
        let reply: Value = serde_json::from_str(&err.to_message().encode().unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "INVALID_RESIZE");
    }

    #[test]
    fn server_status_messages_shape() {
        let id = Uuid::new_v4();
        let attached = ServerMessage::Attached {
            session_id: id,
            logical_key: "ticket-7".into(),
            resumed: true,
            replay_bytes: 12,
        };
        assert_eq!(
            serde_json::to_value(&attached).unwrap(),
            json!({
                "type": "attached",
                "session_id": id,
                "logical_key": "ticket-7",
                "resumed": true,
                "replay_bytes": 12,
            })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Exit { code: Some(0) }).unwrap(),
            json!({"type": "exit", "code": 0})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Closed {
                reason: CloseReason::Evicted
            })
            .unwrap(),
            json!({"type": "closed", "reason": "evicted"})
        );
    }

    #[test]
    fn validation_errors_map_to_codes() {
        let err = ValidationError::TooLarge { size: 5000, max: 2048 };
        let msg = ServerMessage::from(&err);
        match msg {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::TooLarge);
                assert_eq!(code.as_str(), "TOO_LARGE");
                assert!(message.contains("5000"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            serde_json::to_value(ErrorCode::DangerousPattern).unwrap(),
            json!("DANGEROUS_PATTERN")
        );
    }

    #[test]
    fn pty_errors_distinguish_exit_from_delivery_failure() {
        let closed = serde_json::to_value(ServerMessage::from(&PtyError::Closed)).unwrap();
        assert_eq!(closed["code"], "PROCESS_CLOSED");

        let timeout = PtyError::Internal("input queue full for 5s".into());
        let failed = serde_json::to_value(ServerMessage::from(&timeout)).unwrap();
        assert_eq!(failed["code"], "INPUT_FAILED");
        assert!(failed["message"].as_str().unwrap().contains("input queue full"));

        let io = PtyError::Io(std::io::Error::from_raw_os_error(1));
        let failed = serde_json::to_value(ServerMessage::from(&io)).unwrap();
        assert_eq!(failed["code"], "INPUT_FAILED");
    }

    #[test]
    fn frame_limit_covers_encoded_input() {
        assert_eq!(max_frame_bytes(2048), 64 * 1024);
        assert_eq!(max_frame_bytes(0), 64 * 1024);

        // 1 MiB of input is 1,398,104 bytes of base64.
        let limit = max_frame_bytes(1024 * 1024);
        assert!(limit >= 1_398_104 + FRAME_ENVELOPE_BYTES);
        assert_eq!(limit, (1_398_104 + FRAME_ENVELOPE_BYTES) * FRAME_SLACK);

        assert_eq!(max_frame_bytes(usize::MAX), usize::MAX);
    }
}
