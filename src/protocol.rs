//! The framed control protocol spoken between exposers and the relay.
//!
//! Control messages are single CRLF-terminated lines of the form
//! `TAG JSON_PAYLOAD ID`. They are carried inline on the same TCP port as
//! HTTP traffic, always as the very first bytes of a connection, which is
//! what lets the relay tell an exposer apart from an ordinary HTTP client.
//! Tag names are deliberately disjoint from HTTP method tokens.

use n0_error::{Result, StdResultExt, stack_error};
use serde::{Deserialize, Serialize};

/// Opens a new couloir. Payload: [`OpenPayload`]. Answered with an `ACK`.
pub const TAG_OPEN_COULOIR: &str = "OPEN_COULOIR";
/// Joins an existing couloir as an idle exposer socket. Answered with an `ACK`.
pub const TAG_JOIN_COULOIR: &str = "JOIN_COULOIR";
/// Sent by the relay to a joined socket: raw client bytes follow. No `ACK`.
pub const TAG_STREAM: &str = "STREAM";
/// Response to `OPEN_COULOIR` and `JOIN_COULOIR` requests.
pub const TAG_ACK: &str = "ACK";

const TAGS: &[&str] = &[TAG_OPEN_COULOIR, TAG_JOIN_COULOIR, TAG_STREAM, TAG_ACK];

/// Payload of an `OPEN_COULOIR` request.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OpenPayload {
    /// Requested couloir hostname. Absent or foreign hostnames make the
    /// relay pick a default name under its own domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Shared relay password, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Payload of a `JOIN_COULOIR` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinPayload {
    /// The couloir key returned by a previous `OPEN_COULOIR`.
    pub key: String,
}

/// Payload of an `ACK` response.
///
/// A successful `OPEN_COULOIR` ack carries `host` and `key`; a successful
/// `JOIN_COULOIR` ack is empty; failures carry `error` only.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn opened(host: String, key: String) -> Self {
        Self {
            host: Some(host),
            key: Some(key),
            error: None,
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            host: None,
            key: None,
            error: Some(message.to_string()),
        }
    }
}

/// One parsed control line.
#[derive(Debug)]
pub enum ControlFrame {
    Open { payload: OpenPayload, id: u64 },
    Join { payload: JoinPayload, id: u64 },
    Stream { id: u64 },
    Ack { payload: AckPayload, id: u64 },
}

/// Errors produced while decoding control lines.
#[stack_error(derive, from_sources)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The line does not start with a known control tag.
    #[error("unknown control tag")]
    UnknownTag,
    /// The line is not `TAG JSON ID`.
    #[error("malformed control line")]
    Malformed,
    /// The JSON payload does not deserialize for this tag.
    #[error("invalid control payload")]
    InvalidPayload {
        #[error(source, std_err)]
        source: serde_json::Error,
    },
}

impl ControlFrame {
    pub fn open(payload: OpenPayload, id: u64) -> Self {
        Self::Open { payload, id }
    }

    pub fn join(key: String, id: u64) -> Self {
        Self::Join {
            payload: JoinPayload { key },
            id,
        }
    }

    pub fn stream(id: u64) -> Self {
        Self::Stream { id }
    }

    pub fn ack(payload: AckPayload, id: u64) -> Self {
        Self::Ack { payload, id }
    }

    /// Parses one control line (without its trailing CRLF).
    ///
    /// The JSON payload may contain spaces, so the line is split at the
    /// first space (tag) and the last space (id), with the payload between.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::Malformed)?;
        let (tag, rest) = line.split_once(' ').ok_or(ProtocolError::Malformed)?;
        if !TAGS.contains(&tag) {
            return Err(ProtocolError::UnknownTag);
        }
        let (json, id) = rest.rsplit_once(' ').ok_or(ProtocolError::Malformed)?;
        let id: u64 = id.parse().map_err(|_| ProtocolError::Malformed)?;
        let frame = match tag {
            TAG_OPEN_COULOIR => Self::Open {
                payload: serde_json::from_str(json)?,
                id,
            },
            TAG_JOIN_COULOIR => Self::Join {
                payload: serde_json::from_str(json)?,
                id,
            },
            TAG_STREAM => {
                // The payload is an empty object today; accept any object.
                let _: serde_json::Value = serde_json::from_str(json)?;
                Self::Stream { id }
            }
            TAG_ACK => Self::Ack {
                payload: serde_json::from_str(json)?,
                id,
            },
            _ => unreachable!("tag checked against TAGS above"),
        };
        Ok(frame)
    }

    /// Serializes the frame as a CRLF-terminated control line.
    pub fn encode(&self) -> Result<String> {
        let (tag, json, id) = match self {
            Self::Open { payload, id } => {
                (TAG_OPEN_COULOIR, serde_json::to_string(payload).anyerr()?, id)
            }
            Self::Join { payload, id } => {
                (TAG_JOIN_COULOIR, serde_json::to_string(payload).anyerr()?, id)
            }
            Self::Stream { id } => (TAG_STREAM, "{}".to_string(), id),
            Self::Ack { payload, id } => (TAG_ACK, serde_json::to_string(payload).anyerr()?, id),
        };
        Ok(format!("{tag} {json} {id}\r\n"))
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Open { id, .. }
            | Self::Join { id, .. }
            | Self::Stream { id }
            | Self::Ack { id, .. } => *id,
        }
    }
}

/// Returns the index just past the first CRLF, if the buffer contains one.
pub(crate) fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|pos| pos + 2)
}

/// Whether the buffered preface is, or could still become, a control line.
///
/// With a partial buffer this returns `true` while the bytes are a prefix of
/// some `TAG ` sequence, so the caller keeps reading before classifying the
/// socket as an HTTP client.
pub(crate) fn looks_like_control(buf: &[u8]) -> bool {
    TAGS.iter().any(|tag| {
        let tag = tag.as_bytes();
        if buf.len() <= tag.len() {
            tag.starts_with(buf)
        } else {
            buf.starts_with(tag) && buf[tag.len()] == b' '
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let frame = ControlFrame::open(
            OpenPayload {
                host: Some("x.my.test".into()),
                password: None,
            },
            7,
        );
        let line = frame.encode().unwrap();
        assert_eq!(line, "OPEN_COULOIR {\"host\":\"x.my.test\"} 7\r\n");
        let parsed = ControlFrame::parse(line.trim_end().as_bytes()).unwrap();
        match parsed {
            ControlFrame::Open { payload, id } => {
                assert_eq!(payload.host.as_deref(), Some("x.my.test"));
                assert_eq!(payload.password, None);
                assert_eq!(id, 7);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ack_error_payload_may_contain_spaces() {
        let frame = ControlFrame::ack(AckPayload::error("Couloir host x is already opened"), 3);
        let line = frame.encode().unwrap();
        let parsed = ControlFrame::parse(line.trim_end().as_bytes()).unwrap();
        match parsed {
            ControlFrame::Ack { payload, id } => {
                assert_eq!(
                    payload.error.as_deref(),
                    Some("Couloir host x is already opened")
                );
                assert_eq!(id, 3);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn stream_has_no_payload_fields() {
        let line = ControlFrame::stream(42).encode().unwrap();
        assert_eq!(line, "STREAM {} 42\r\n");
        let parsed = ControlFrame::parse(line.trim_end().as_bytes()).unwrap();
        assert_eq!(parsed.id(), 42);
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = ControlFrame::parse(b"GARBAGE {} 1").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag { .. }));
    }

    #[test]
    fn malformed_lines_rejected() {
        assert!(ControlFrame::parse(b"OPEN_COULOIR").is_err());
        assert!(ControlFrame::parse(b"OPEN_COULOIR {}").is_err());
        assert!(ControlFrame::parse(b"OPEN_COULOIR {} notanumber").is_err());
        assert!(ControlFrame::parse(b"ACK notjson 1").is_err());
    }

    #[test]
    fn control_prefix_detection() {
        assert!(looks_like_control(b""));
        assert!(looks_like_control(b"OP"));
        assert!(looks_like_control(b"OPEN_COULOIR {"));
        assert!(looks_like_control(b"STREAM {} 1\r\n"));
        // Diverges from every tag: an HTTP request line.
        assert!(!looks_like_control(b"GET / HTTP/1.1\r\n"));
        // OPTIONS shares a prefix with OPEN_COULOIR only up to "OP".
        assert!(!looks_like_control(b"OPTIONS / HTTP/1.1\r\n"));
    }

    #[test]
    fn line_end_detection() {
        assert_eq!(find_line_end(b"no line yet"), None);
        assert_eq!(find_line_end(b"ACK {} 1\r\nrest"), Some(10));
    }
}
