//! # Wire Codec Module
//!
//! Framed binary message protocol shared by the manager and runner ends of
//! a bridge session. Four frame kinds travel the two streams of a session:
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┬───────────┐
//! │ Kind     │ Layout after the tag byte                    │ Direction │
//! ├──────────┼──────────────────────────────────────────────┼───────────┤
//! │ Call     │ i32 id, string method, blob arguments        │ mgr → run │
//! │ Response │ i32 id, string status, blob result           │ run → mgr │
//! │ Event    │ string name, blob payload                    │ run → mgr │
//! │ Log      │ string severity, string message              │ run → mgr │
//! └──────────┴──────────────────────────────────────────────┴───────────┘
//! ```
//!
//! ## Pinned conventions
//!
//! Both sides of the session must agree on the byte-level encoding, so it
//! is pinned here rather than left to a serialisation library's defaults:
//!
//! - every integer field is fixed-width **little-endian**;
//! - a *string* is a `u32` byte-length prefix followed by UTF-8 bytes;
//! - a *blob* is an `i32` byte-length prefix followed by raw bytes, where
//!   a length of zero is legal and means "absent value";
//! - blob contents are MessagePack, written and read through [`rmpv`] so
//!   the receiving side can decode without a schema;
//! - argument blobs contain one outer MessagePack array whose elements
//!   positionally match the invoked method's parameters.
//!
//! Frames are strictly self-delimited. A reader that encounters a tag,
//! status, or length it cannot accept reports a [`WireError`] and the
//! owning loop tears the transport down, which unblocks the peer's next
//! read.
//!
//! The codec is not thread-safe; callers serialise writes (see the
//! manager's and runner's shared write locks).

use rmpv::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::defaults::MAX_FIELD_BYTES;

/// Tag byte identifying a [`Frame::Call`].
pub const TAG_CALL: u8 = 0x01;
/// Tag byte identifying a [`Frame::Response`].
pub const TAG_RESPONSE: u8 = 0x02;
/// Tag byte identifying a [`Frame::Event`].
pub const TAG_EVENT: u8 = 0x03;
/// Tag byte identifying a [`Frame::Log`].
pub const TAG_LOG: u8 = 0x04;

/// Errors produced while encoding or decoding frames and their payloads.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    #[error("unknown response status `{0}`")]
    UnknownStatus(String),

    #[error("field length {len} exceeds the {max} byte limit")]
    Oversized { len: u64, max: u64 },

    #[error("negative blob length {0}")]
    NegativeLength(i32),

    #[error("invalid utf-8 in string field: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("payload encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("payload serialise error: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("payload decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("unexpected payload shape: {0}")]
    UnexpectedPayload(&'static str),
}

/// Outcome carried by a [`Frame::Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The call completed; the result blob holds the return value, or is
    /// empty when the method returns nothing.
    Success,
    /// The call failed; the result blob holds a single message string.
    Error,
}

impl ResponseStatus {
    /// Wire spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Result<Self, WireError> {
        match s {
            "success" => Ok(ResponseStatus::Success),
            "error" => Ok(ResponseStatus::Error),
            other => Err(WireError::UnknownStatus(other.to_string())),
        }
    }
}

/// A self-delimited message on one of the session streams.
///
/// Payload fields stay as raw blobs at this layer; the helpers further
/// down convert between blobs and [`rmpv::Value`]s so the owning loops
/// decide when (and whether) a payload is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Manager-originated method invocation.
    Call {
        id: i32,
        method: String,
        args: Vec<u8>,
    },
    /// Runner-originated reply to a [`Frame::Call`] with a matching id.
    Response {
        id: i32,
        status: ResponseStatus,
        payload: Vec<u8>,
    },
    /// Runner-originated service event.
    Event { name: String, payload: Vec<u8> },
    /// Runner-originated structured log record.
    Log { severity: String, message: String },
}

impl Frame {
    /// Read one frame from the stream.
    ///
    /// Blocks until a complete frame is available. An end-of-stream before
    /// the tag byte surfaces as `WireError::Io` with
    /// `ErrorKind::UnexpectedEof`, which the reading loops treat as the
    /// peer having closed the transport.
    pub async fn read_from<R>(r: &mut R) -> Result<Frame, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let tag = r.read_u8().await?;
        match tag {
            TAG_CALL => {
                let id = r.read_i32_le().await?;
                let method = read_string(r).await?;
                let args = read_blob(r).await?;
                Ok(Frame::Call { id, method, args })
            }
            TAG_RESPONSE => {
                let id = r.read_i32_le().await?;
                let status = ResponseStatus::parse(&read_string(r).await?)?;
                let payload = read_blob(r).await?;
                Ok(Frame::Response {
                    id,
                    status,
                    payload,
                })
            }
            TAG_EVENT => {
                let name = read_string(r).await?;
                let payload = read_blob(r).await?;
                Ok(Frame::Event { name, payload })
            }
            TAG_LOG => {
                let severity = read_string(r).await?;
                let message = read_string(r).await?;
                Ok(Frame::Log { severity, message })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }

    /// Write this frame and flush the stream.
    ///
    /// The flush is part of the frame write on purpose: the pending-call
    /// registry treats "inserted" as "flushed to the command stream", and
    /// the runner's respond-before-exit stop handling relies on the final
    /// Response reaching the socket before the process exits.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            Frame::Call { id, method, args } => {
                w.write_u8(TAG_CALL).await?;
                w.write_i32_le(*id).await?;
                write_string(w, method).await?;
                write_blob(w, args).await?;
            }
            Frame::Response {
                id,
                status,
                payload,
            } => {
                w.write_u8(TAG_RESPONSE).await?;
                w.write_i32_le(*id).await?;
                write_string(w, status.as_str()).await?;
                write_blob(w, payload).await?;
            }
            Frame::Event { name, payload } => {
                w.write_u8(TAG_EVENT).await?;
                write_string(w, name).await?;
                write_blob(w, payload).await?;
            }
            Frame::Log { severity, message } => {
                w.write_u8(TAG_LOG).await?;
                write_string(w, severity).await?;
                write_string(w, message).await?;
            }
        }
        w.flush().await?;
        Ok(())
    }
}

async fn read_string<R>(r: &mut R) -> Result<String, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u32_le().await? as u64;
    if len > MAX_FIELD_BYTES {
        return Err(WireError::Oversized {
            len,
            max: MAX_FIELD_BYTES,
        });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

async fn write_string<W>(w: &mut W, s: &str) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = s.len() as u64;
    if len > MAX_FIELD_BYTES {
        return Err(WireError::Oversized {
            len,
            max: MAX_FIELD_BYTES,
        });
    }
    w.write_u32_le(len as u32).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

async fn read_blob<R>(r: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_i32_le().await?;
    if len < 0 {
        return Err(WireError::NegativeLength(len));
    }
    let len = len as u64;
    if len > MAX_FIELD_BYTES {
        return Err(WireError::Oversized {
            len,
            max: MAX_FIELD_BYTES,
        });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_blob<W>(w: &mut W, blob: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = blob.len() as u64;
    if len > MAX_FIELD_BYTES {
        return Err(WireError::Oversized {
            len,
            max: MAX_FIELD_BYTES,
        });
    }
    w.write_i32_le(len as i32).await?;
    w.write_all(blob).await?;
    Ok(())
}

/// Encode a single value into a payload blob.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)?;
    Ok(buf)
}

/// Decode a payload blob into a single value.
///
/// A zero-length blob is the wire spelling for "no payload" and decodes
/// to `None`.
pub fn decode_value(blob: &[u8]) -> Result<Option<Value>, WireError> {
    if blob.is_empty() {
        return Ok(None);
    }
    let value = rmpv::decode::read_value(&mut &blob[..])?;
    Ok(Some(value))
}

/// Encode an ordered argument sequence as the outer positional array.
pub fn encode_args(args: Vec<Value>) -> Result<Vec<u8>, WireError> {
    encode_value(&Value::Array(args))
}

/// Decode an argument blob back into its positional sequence.
///
/// An empty blob decodes to an empty sequence, so zero-argument calls
/// need no payload at all.
pub fn decode_args(blob: &[u8]) -> Result<Vec<Value>, WireError> {
    match decode_value(blob)? {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(WireError::UnexpectedPayload(
            "argument payload is not an array",
        )),
    }
}

/// Encode the human-readable message of a failed call.
pub fn encode_error_message(message: &str) -> Result<Vec<u8>, WireError> {
    encode_value(&Value::from(message))
}

/// Decode the message blob of an error Response.
pub fn decode_error_message(blob: &[u8]) -> Result<String, WireError> {
    match decode_value(blob)? {
        None => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.into_str().unwrap_or_default()),
        Some(_) => Err(WireError::UnexpectedPayload(
            "error payload is not a string",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn round_trip(frame: Frame) -> Frame {
        let mut buf: Vec<u8> = Vec::new();
        frame.write_to(&mut buf).await.unwrap();
        Frame::read_from(&mut Cursor::new(buf)).await.unwrap()
    }

    #[tokio::test]
    async fn call_frame_reproduces_fields() {
        let args = encode_args(vec![Value::from(5), Value::from("x")]).unwrap();
        let frame = Frame::Call {
            id: 42,
            method: "add".to_string(),
            args,
        };
        assert_eq!(round_trip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn response_frame_with_empty_payload_means_absent() {
        let frame = Frame::Response {
            id: 7,
            status: ResponseStatus::Success,
            payload: Vec::new(),
        };
        let decoded = round_trip(frame).await;
        match decoded {
            Frame::Response { id, status, payload } => {
                assert_eq!(id, 7);
                assert_eq!(status, ResponseStatus::Success);
                assert_eq!(decode_value(&payload).unwrap(), None);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_and_log_frames_round_trip() {
        let payload = encode_value(&Value::from("Echoed: hi")).unwrap();
        let event = Frame::Event {
            name: "on_message".to_string(),
            payload,
        };
        assert_eq!(round_trip(event.clone()).await, event);

        let log = Frame::Log {
            severity: "Warning".to_string(),
            message: "low disk".to_string(),
        };
        assert_eq!(round_trip(log.clone()).await, log);
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let err = Frame::read_from(&mut Cursor::new(vec![0x7fu8]))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownTag(0x7f)));
    }

    #[tokio::test]
    async fn unknown_status_is_rejected() {
        let mut buf: Vec<u8> = Vec::new();
        let frame = Frame::Response {
            id: 1,
            status: ResponseStatus::Success,
            payload: Vec::new(),
        };
        frame.write_to(&mut buf).await.unwrap();
        // Corrupt the status string in place: "success" -> "suxcess".
        let pos = buf.iter().position(|b| *b == b'c').unwrap();
        buf[pos] = b'x';
        let err = Frame::read_from(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, WireError::UnknownStatus(_)));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocation() {
        let mut buf = vec![TAG_EVENT];
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        let err = Frame::read_from(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, WireError::Oversized { .. }));
    }

    #[tokio::test]
    async fn negative_blob_length_is_rejected() {
        let mut buf = vec![TAG_EVENT];
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"evt");
        buf.extend_from_slice(&(-5i32).to_le_bytes());
        let err = Frame::read_from(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, WireError::NegativeLength(-5)));
    }

    #[test]
    fn args_decode_positionally() {
        let blob = encode_args(vec![Value::from(1), Value::from(true)]).unwrap();
        let args = decode_args(&blob).unwrap();
        assert_eq!(args, vec![Value::from(1), Value::from(true)]);
        // No payload at all is a legal zero-argument call.
        assert!(decode_args(&[]).unwrap().is_empty());
    }

    #[test]
    fn non_array_argument_payload_is_rejected() {
        let blob = encode_value(&Value::from(3)).unwrap();
        assert!(matches!(
            decode_args(&blob),
            Err(WireError::UnexpectedPayload(_))
        ));
    }

    #[test]
    fn error_message_round_trips() {
        let blob = encode_error_message("Test exception").unwrap();
        assert_eq!(decode_error_message(&blob).unwrap(), "Test exception");
        assert_eq!(decode_error_message(&[]).unwrap(), "");
    }
}
