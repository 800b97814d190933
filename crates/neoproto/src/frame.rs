//! NEO01 frame protocol — the fabric's canonical framing.
//!
//! Every hub/worker/caller connection exchanges length-prefixed frames:
//!
//! ```text
//! len(4, LE)                   total length of everything after this field
//! kind(1)                      message kind (u8)
//! id_len(4, LE)     id         correlation id (opaque bytes, <= 65535)
//! service_len(4, LE) service   UTF-8 service label (<= 65535)
//! method_len(4, LE)  method    UTF-8 method label (<= 65535)
//! meta_len(4, LE)    meta      metadata as JSON object of string -> string
//! data_len(4, LE)    data      payload bytes (possibly compressed)
//! ```
//!
//! The envelope fields with no fixed slot (compression, priority, trace id,
//! timestamp) ride in the metadata JSON under reserved `x-neo-*` keys; the
//! codec injects them on encode and lifts them back out on decode, so the
//! six-field layout above is exact. Metadata is kept in a `BTreeMap`, which
//! makes key order lexicographic on the wire — two independent senders
//! encoding equal logical frames produce byte-identical buffers.
//!
//! All integers little-endian. Payload compression is applied to `data`
//! only, after the envelope is assembled.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::compression::{compress, decompress, Compression};
use crate::error::ProtocolError;

/// Default cap on a single encoded frame (10 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Decompressed payloads may expand to at most this many times the frame cap.
pub const DECOMPRESS_EXPANSION_CAP: usize = 10;

/// Labels (correlation id, service, method) are capped at this length.
pub const MAX_LABEL_BYTES: usize = u16::MAX as usize;

/// Reserved metadata keys used by the codec and the dispatch layer.
pub mod meta {
    /// Marks a response as an error: `"true"`.
    pub const ERROR: &str = "error";
    /// Stable machine-readable error code on error responses.
    pub const ERROR_CODE: &str = "x-neo-error-code";
    /// Comma-joined method names advertised by a registering worker.
    pub const METHODS: &str = "x-neo-methods";
    /// Best-effort cancellation marker carrying the correlation id to drop.
    pub const CANCEL: &str = "x-neo-cancel";
    /// Shutdown notice from the hub to its sessions.
    pub const SHUTDOWN: &str = "x-neo-shutdown";

    // Envelope fields carried through the metadata JSON.
    pub const COMPRESSION: &str = "x-neo-compression";
    pub const PRIORITY: &str = "x-neo-priority";
    pub const TRACE_ID: &str = "x-neo-trace-id";
    pub const TIMESTAMP: &str = "x-neo-ts";
}

/// Message kind (1 byte on the wire).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Caller -> hub -> worker invocation.
    Request = 1,
    /// Worker -> hub -> caller result (or error with `metadata.error`).
    Response = 2,
    /// Worker announces a service name and its method table.
    Register = 3,
    /// Bidirectional liveness; empty payload, any received payload ignored.
    Heartbeat = 4,
    /// Standalone error; routed like a Response carrying error metadata.
    Error = 5,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            3 => Ok(FrameKind::Register),
            4 => Ok(FrameKind::Heartbeat),
            5 => Ok(FrameKind::Error),
            _ => Err(ProtocolError::InvalidFrame("unknown frame kind")),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Advisory delivery priority. Only consulted when a peer's write queue
/// backs up; otherwise frames flow in arrival order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Lenient parse; unknown values fall back to Normal.
    pub fn parse(name: &str) -> Self {
        match name {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Caller-assigned id echoed on the matching response. Opaque bytes.
    pub correlation_id: Bytes,
    pub service: String,
    pub method: String,
    pub metadata: BTreeMap<String, String>,
    /// Uncompressed payload. Compression is applied at encode time.
    pub payload: Bytes,
    pub compression: Compression,
    pub priority: Priority,
    /// UUID rendered ASCII (36 bytes), for tracing.
    pub trace_id: String,
    /// Millisecond epoch stamp, set at construction.
    pub timestamp_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Frame {
    fn blank(kind: FrameKind) -> Self {
        Self {
            kind,
            correlation_id: Bytes::new(),
            service: String::new(),
            method: String::new(),
            metadata: BTreeMap::new(),
            payload: Bytes::new(),
            compression: Compression::None,
            priority: Priority::Normal,
            trace_id: Uuid::new_v4().to_string(),
            timestamp_ms: now_ms(),
        }
    }

    /// Create a request frame. The correlation id is left empty; the caller
    /// bridge assigns one at issue time if the caller did not.
    pub fn request(service: impl Into<String>, method: impl Into<String>, payload: Bytes) -> Self {
        let mut frame = Self::blank(FrameKind::Request);
        frame.service = service.into();
        frame.method = method.into();
        frame.payload = payload;
        frame
    }

    /// Create a success response echoing `correlation_id`.
    pub fn response(correlation_id: Bytes, payload: Bytes) -> Self {
        let mut frame = Self::blank(FrameKind::Response);
        frame.correlation_id = correlation_id;
        frame.payload = payload;
        frame
    }

    /// Create an error response: `metadata.error = "true"`, a stable code,
    /// and the `{"error": message}` payload shape callers expect.
    pub fn error_response(
        correlation_id: Bytes,
        code: &str,
        message: impl AsRef<str>,
    ) -> Self {
        let mut frame = Self::response(
            correlation_id,
            Bytes::from(
                serde_json::json!({ "error": message.as_ref() })
                    .to_string()
                    .into_bytes(),
            ),
        );
        frame
            .metadata
            .insert(meta::ERROR.to_string(), "true".to_string());
        frame
            .metadata
            .insert(meta::ERROR_CODE.to_string(), code.to_string());
        frame
    }

    /// Create a registration frame advertising `methods` as the session's
    /// static capability set.
    pub fn register(
        name: &str,
        metadata: &BTreeMap<String, String>,
        methods: &[String],
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "name": name,
            "metadata": metadata,
        }))
        .map_err(|e| ProtocolError::Json {
            context: "register payload",
            source: e,
        })?;

        let mut frame = Self::blank(FrameKind::Register);
        frame.service = name.to_string();
        frame.payload = Bytes::from(payload);
        if !methods.is_empty() {
            frame
                .metadata
                .insert(meta::METHODS.to_string(), methods.join(","));
        }
        Ok(frame)
    }

    /// Create an empty heartbeat for `service`.
    pub fn heartbeat(service: impl Into<String>) -> Self {
        let mut frame = Self::blank(FrameKind::Heartbeat);
        frame.service = service.into();
        frame.priority = Priority::Low;
        frame
    }

    pub fn with_correlation_id(mut self, id: impl Into<Bytes>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Whether this frame carries error metadata.
    pub fn is_error(&self) -> bool {
        self.kind == FrameKind::Error
            || self.metadata.get(meta::ERROR).map(String::as_str) == Some("true")
    }

    /// Stable error code, if any.
    pub fn error_code(&self) -> Option<&str> {
        self.metadata.get(meta::ERROR_CODE).map(String::as_str)
    }

    /// Encode to wire bytes (including the length prefix).
    pub fn encode(&self, max_frame_bytes: usize) -> Result<Bytes, ProtocolError> {
        for label in [
            &self.correlation_id[..],
            self.service.as_bytes(),
            self.method.as_bytes(),
        ] {
            if label.len() > MAX_LABEL_BYTES {
                return Err(ProtocolError::InvalidFrame("label too long"));
            }
        }
        if self.kind == FrameKind::Register && self.service.is_empty() {
            return Err(ProtocolError::InvalidFrame("register without service"));
        }

        let data = compress(self.compression, &self.payload)?;

        // Inject the envelope extras so the six-field layout stays exact.
        let mut metadata = self.metadata.clone();
        metadata.insert(
            meta::COMPRESSION.to_string(),
            self.compression.as_str().to_string(),
        );
        metadata.insert(
            meta::PRIORITY.to_string(),
            self.priority.as_str().to_string(),
        );
        metadata.insert(meta::TRACE_ID.to_string(), self.trace_id.clone());
        metadata.insert(meta::TIMESTAMP.to_string(), self.timestamp_ms.to_string());
        let meta_json = serde_json::to_vec(&metadata).map_err(|e| ProtocolError::Json {
            context: "metadata",
            source: e,
        })?;

        let content_len = 1
            + 4 + self.correlation_id.len()
            + 4 + self.service.len()
            + 4 + self.method.len()
            + 4 + meta_json.len()
            + 4 + data.len();
        if content_len > max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: content_len,
                max: max_frame_bytes,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + content_len);
        buf.put_u32_le(content_len as u32);
        buf.put_u8(self.kind.to_u8());
        for field in [
            &self.correlation_id[..],
            self.service.as_bytes(),
            self.method.as_bytes(),
            &meta_json,
            &data,
        ] {
            buf.put_u32_le(field.len() as u32);
            buf.put_slice(field);
        }
        Ok(buf.freeze())
    }

    /// Decode from wire bytes (including the length prefix). Trailing bytes
    /// beyond the declared length are rejected.
    pub fn decode(buf: &[u8], max_frame_bytes: usize) -> Result<Self, ProtocolError> {
        if buf.len() < 4 {
            return Err(ProtocolError::InvalidFrame("missing length prefix"));
        }
        let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if declared > max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max: max_frame_bytes,
            });
        }
        if buf.len() - 4 != declared {
            return Err(ProtocolError::InvalidFrame("length prefix mismatch"));
        }
        Self::decode_body(&buf[4..], max_frame_bytes)
    }

    /// Decode a frame body (everything after the length prefix).
    pub fn decode_body(body: &[u8], max_frame_bytes: usize) -> Result<Self, ProtocolError> {
        let mut cursor = body;
        if cursor.remaining() < 1 {
            return Err(ProtocolError::InvalidFrame("empty frame"));
        }
        let kind = FrameKind::from_u8(cursor.get_u8())?;

        let correlation_id = read_field(&mut cursor)?;
        let service = read_field(&mut cursor)?;
        let method = read_field(&mut cursor)?;
        let meta_json = read_field(&mut cursor)?;
        let data = read_field(&mut cursor)?;
        if cursor.has_remaining() {
            return Err(ProtocolError::InvalidFrame("trailing bytes"));
        }
        if correlation_id.len() > MAX_LABEL_BYTES
            || service.len() > MAX_LABEL_BYTES
            || method.len() > MAX_LABEL_BYTES
        {
            return Err(ProtocolError::InvalidFrame("label too long"));
        }

        let service = String::from_utf8(service.to_vec())
            .map_err(|_| ProtocolError::InvalidFrame("service not UTF-8"))?;
        let method = String::from_utf8(method.to_vec())
            .map_err(|_| ProtocolError::InvalidFrame("method not UTF-8"))?;
        let mut metadata: BTreeMap<String, String> = if meta_json.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(&meta_json).map_err(|e| ProtocolError::Json {
                context: "metadata",
                source: e,
            })?
        };

        if kind == FrameKind::Register && service.is_empty() {
            return Err(ProtocolError::InvalidFrame("register without service"));
        }

        // Lift the envelope extras back out of the metadata map.
        let compression = match metadata.remove(meta::COMPRESSION) {
            Some(name) => Compression::parse(&name)?,
            None => Compression::None,
        };
        let priority = metadata
            .remove(meta::PRIORITY)
            .map(|p| Priority::parse(&p))
            .unwrap_or_default();
        let trace_id = metadata.remove(meta::TRACE_ID).unwrap_or_default();
        let timestamp_ms = metadata
            .remove(meta::TIMESTAMP)
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);

        let payload = decompress(
            compression,
            &data,
            max_frame_bytes.saturating_mul(DECOMPRESS_EXPANSION_CAP),
        )?;

        Ok(Frame {
            kind,
            correlation_id,
            service,
            method,
            metadata,
            payload: Bytes::from(payload),
            compression,
            priority,
            trace_id,
            timestamp_ms,
        })
    }
}

/// Read one `len(4 LE) + bytes` field, bounds-checked against the cursor.
fn read_field(cursor: &mut &[u8]) -> Result<Bytes, ProtocolError> {
    if cursor.remaining() < 4 {
        return Err(ProtocolError::InvalidFrame("truncated field length"));
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.remaining() < len {
        return Err(ProtocolError::InvalidFrame("field length out of bounds"));
    }
    let field = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(field)
}

/// Read one frame from an async stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. Never consumes
/// past the declared frame length.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Frame>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let declared = u32::from_le_bytes(len_buf) as usize;
    if declared > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: declared,
            max: max_frame_bytes,
        });
    }
    let mut body = vec![0u8; declared];
    reader.read_exact(&mut body).await?;
    Frame::decode_body(&body, max_frame_bytes).map(Some)
}

/// Write one frame to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError> {
    let bytes = frame.encode(max_frame_bytes)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
