//! Discovery framing — the self-describing, checksummed boundary protocol.
//!
//! Spoken only between peers and the hub's discovery endpoint, never on the
//! internal fabric. All integers big-endian.
//!
//! Request:
//!
//! ```text
//! magic(2)    = 0xAEBD
//! version(1)  = 0x01
//! msg_id_len(2)  msg_id      UTF-8, usually a UUID
//! method_len(2)  method      "register" | "deregister" | "discover"
//! param_len(4)   param_json  parameters as a JSON object
//! checksum(4)                CRC-32 over every byte preceding this field
//! ```
//!
//! Response:
//!
//! ```text
//! magic(2) | version(1) | body_len(4) | body_json
//! ```
//!
//! The body is always `{"result": ..., "error": ...}` with `error == null`
//! on success.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Wire magic for discovery traffic.
pub const DISCOVERY_MAGIC: u16 = 0xAEBD;

/// Current discovery protocol version.
pub const DISCOVERY_VERSION: u8 = 0x01;

/// One discovery request.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryRequest {
    pub msg_id: String,
    pub method: String,
    pub params: Value,
}

impl DiscoveryRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Uniform discovery response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DiscoveryReply {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Encode a request, checksum included.
pub fn encode_request(request: &DiscoveryRequest) -> Result<Bytes, ProtocolError> {
    let msg_id = request.msg_id.as_bytes();
    let method = request.method.as_bytes();
    if msg_id.len() > u16::MAX as usize || method.len() > u16::MAX as usize {
        return Err(ProtocolError::InvalidFrame("label too long"));
    }
    let params = serde_json::to_vec(&request.params).map_err(|e| ProtocolError::Json {
        context: "discovery params",
        source: e,
    })?;

    let mut buf = BytesMut::with_capacity(2 + 1 + 2 + msg_id.len() + 2 + method.len() + 4 + params.len() + 4);
    buf.put_u16(DISCOVERY_MAGIC);
    buf.put_u8(DISCOVERY_VERSION);
    buf.put_u16(msg_id.len() as u16);
    buf.put_slice(msg_id);
    buf.put_u16(method.len() as u16);
    buf.put_slice(method);
    buf.put_u32(params.len() as u32);
    buf.put_slice(&params);

    let checksum = crc32fast::hash(&buf);
    buf.put_u32(checksum);
    Ok(buf.freeze())
}

/// Decode a complete request buffer, verifying magic, version, and checksum.
/// Trailing bytes after the checksum are rejected.
pub fn decode_request(buf: &[u8], max_param_bytes: usize) -> Result<DiscoveryRequest, ProtocolError> {
    let mut cursor = buf;
    if cursor.remaining() < 3 {
        return Err(ProtocolError::InvalidFrame("truncated discovery header"));
    }
    let magic = cursor.get_u16();
    if magic != DISCOVERY_MAGIC {
        return Err(ProtocolError::InvalidFrame("bad discovery magic"));
    }
    let version = cursor.get_u8();
    if version != DISCOVERY_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let msg_id = read_u16_field(&mut cursor)?;
    let method = read_u16_field(&mut cursor)?;

    if cursor.remaining() < 4 {
        return Err(ProtocolError::InvalidFrame("truncated param length"));
    }
    let param_len = cursor.get_u32() as usize;
    if param_len > max_param_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: param_len,
            max: max_param_bytes,
        });
    }
    if cursor.remaining() < param_len {
        return Err(ProtocolError::InvalidFrame("param length out of bounds"));
    }
    let params_bytes = &cursor[..param_len];
    cursor.advance(param_len);

    if cursor.remaining() != 4 {
        return Err(ProtocolError::InvalidFrame("bad trailer length"));
    }
    let declared = cursor.get_u32();
    let actual = crc32fast::hash(&buf[..buf.len() - 4]);
    if declared != actual {
        return Err(ProtocolError::ChecksumMismatch);
    }

    let params: Value = serde_json::from_slice(params_bytes).map_err(|e| ProtocolError::Json {
        context: "discovery params",
        source: e,
    })?;

    Ok(DiscoveryRequest {
        msg_id: String::from_utf8(msg_id.to_vec())
            .map_err(|_| ProtocolError::InvalidFrame("msg id not UTF-8"))?,
        method: String::from_utf8(method.to_vec())
            .map_err(|_| ProtocolError::InvalidFrame("method not UTF-8"))?,
        params,
    })
}

/// Encode a response envelope around a reply body.
pub fn encode_response(reply: &DiscoveryReply) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(reply).map_err(|e| ProtocolError::Json {
        context: "discovery reply",
        source: e,
    })?;
    let mut buf = BytesMut::with_capacity(2 + 1 + 4 + body.len());
    buf.put_u16(DISCOVERY_MAGIC);
    buf.put_u8(DISCOVERY_VERSION);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a complete response buffer into the reply body.
pub fn decode_response(buf: &[u8], max_body_bytes: usize) -> Result<DiscoveryReply, ProtocolError> {
    let mut cursor = buf;
    if cursor.remaining() < 7 {
        return Err(ProtocolError::InvalidFrame("truncated discovery response"));
    }
    let magic = cursor.get_u16();
    if magic != DISCOVERY_MAGIC {
        return Err(ProtocolError::InvalidFrame("bad discovery magic"));
    }
    let version = cursor.get_u8();
    if version != DISCOVERY_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let body_len = cursor.get_u32() as usize;
    if body_len > max_body_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: max_body_bytes,
        });
    }
    if cursor.remaining() != body_len {
        return Err(ProtocolError::InvalidFrame("body length mismatch"));
    }
    serde_json::from_slice(&cursor[..body_len]).map_err(|e| ProtocolError::Json {
        context: "discovery reply",
        source: e,
    })
}

/// Read one request from an async stream, verifying the checksum over the
/// exact bytes received. Returns `Ok(None)` on a clean EOF before the magic.
pub async fn read_request<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    max_param_bytes: usize,
) -> Result<Option<DiscoveryRequest>, ProtocolError> {
    use tokio::io::AsyncReadExt;

    let mut raw = Vec::new();
    let mut header = [0u8; 3];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    raw.extend_from_slice(&header);
    if u16::from_be_bytes([header[0], header[1]]) != DISCOVERY_MAGIC {
        return Err(ProtocolError::InvalidFrame("bad discovery magic"));
    }
    if header[2] != DISCOVERY_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[2]));
    }

    // msg id and method, both u16-prefixed
    for _ in 0..2 {
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await?;
        raw.extend_from_slice(&len_buf);
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut field = vec![0u8; len];
        reader.read_exact(&mut field).await?;
        raw.extend_from_slice(&field);
    }

    // params, u32-prefixed and capped
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    raw.extend_from_slice(&len_buf);
    let param_len = u32::from_be_bytes(len_buf) as usize;
    if param_len > max_param_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: param_len,
            max: max_param_bytes,
        });
    }
    let mut params = vec![0u8; param_len];
    reader.read_exact(&mut params).await?;
    raw.extend_from_slice(&params);

    // checksum trailer
    let mut trailer = [0u8; 4];
    reader.read_exact(&mut trailer).await?;
    raw.extend_from_slice(&trailer);

    decode_request(&raw, max_param_bytes).map(Some)
}

/// Read one response from an async stream.
pub async fn read_response<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    max_body_bytes: usize,
) -> Result<DiscoveryReply, ProtocolError> {
    use tokio::io::AsyncReadExt;

    let mut header = [0u8; 7];
    reader.read_exact(&mut header).await?;
    if u16::from_be_bytes([header[0], header[1]]) != DISCOVERY_MAGIC {
        return Err(ProtocolError::InvalidFrame("bad discovery magic"));
    }
    if header[2] != DISCOVERY_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[2]));
    }
    let body_len = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
    if body_len > max_body_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: max_body_bytes,
        });
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| ProtocolError::Json {
        context: "discovery reply",
        source: e,
    })
}

fn read_u16_field(cursor: &mut &[u8]) -> Result<Bytes, ProtocolError> {
    if cursor.remaining() < 2 {
        return Err(ProtocolError::InvalidFrame("truncated field length"));
    }
    let len = cursor.get_u16() as usize;
    if cursor.remaining() < len {
        return Err(ProtocolError::InvalidFrame("field length out of bounds"));
    }
    let field = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CAP: usize = 1024 * 1024;

    #[test]
    fn request_roundtrip() {
        let request = DiscoveryRequest::new("discover", serde_json::json!({"name": "math"}));
        let encoded = encode_request(&request).unwrap();
        let parsed = decode_request(&encoded, CAP).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn response_roundtrip() {
        let reply = DiscoveryReply::ok(serde_json::json!([{"id": "i-1", "name": "math"}]));
        let encoded = encode_response(&reply).unwrap();
        let parsed = decode_response(&encoded, CAP).unwrap();
        assert_eq!(parsed, reply);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn error_reply_shape() {
        let reply = DiscoveryReply::err("unknown method: frobnicate");
        let encoded = encode_response(&reply).unwrap();
        let parsed = decode_response(&encoded, CAP).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("unknown method: frobnicate"));
        assert!(parsed.result.is_none());
    }

    #[test]
    fn every_bit_flip_is_detected() {
        let request = DiscoveryRequest {
            msg_id: "m-1".into(),
            method: "register".into(),
            params: serde_json::json!({"name": "math", "id": "i-1"}),
        };
        let encoded = encode_request(&request).unwrap();

        for byte in 0..encoded.len() {
            for bit in 0..8 {
                let mut corrupted = encoded.to_vec();
                corrupted[byte] ^= 1 << bit;
                let result = decode_request(&corrupted, CAP);
                assert!(
                    result.is_err(),
                    "flip at byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn checksum_mismatch_reported_for_body_corruption() {
        let request = DiscoveryRequest::new("discover", serde_json::json!({"name": "math"}));
        let mut encoded = encode_request(&request).unwrap().to_vec();
        // Flip a bit inside the params JSON, past the header region, at a
        // position that keeps the JSON parse irrelevant (checksum runs first).
        let idx = encoded.len() - 8;
        encoded[idx] ^= 0x01;
        assert!(matches!(
            decode_request(&encoded, CAP),
            Err(ProtocolError::ChecksumMismatch)
        ));
    }

    #[test]
    fn bad_magic_and_version() {
        let request = DiscoveryRequest::new("discover", serde_json::json!({}));
        let encoded = encode_request(&request).unwrap();

        let mut bad_magic = encoded.to_vec();
        bad_magic[0] = 0x00;
        assert!(matches!(
            decode_request(&bad_magic, CAP),
            Err(ProtocolError::InvalidFrame(_))
        ));

        let mut bad_version = encoded.to_vec();
        bad_version[2] = 0x7f;
        assert!(matches!(
            decode_request(&bad_version, CAP),
            Err(ProtocolError::UnsupportedVersion(0x7f))
        ));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let request = DiscoveryRequest::new("discover", serde_json::json!({}));
        let mut encoded = encode_request(&request).unwrap().to_vec();
        encoded.push(0xff);
        assert!(decode_request(&encoded, CAP).is_err());
    }

    #[test]
    fn param_cap_enforced() {
        let request = DiscoveryRequest::new(
            "register",
            serde_json::json!({"blob": "x".repeat(4096)}),
        );
        let encoded = encode_request(&request).unwrap();
        assert!(matches!(
            decode_request(&encoded, 128),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn async_stream_roundtrip() {
        let request = DiscoveryRequest::new("register", serde_json::json!({"name": "math"}));
        let encoded = encode_request(&request).unwrap();
        let mut reader = std::io::Cursor::new(encoded.to_vec());
        let parsed = read_request(&mut reader, CAP).await.unwrap().unwrap();
        assert_eq!(parsed, request);
        // Clean EOF after one request.
        assert!(read_request(&mut reader, CAP).await.unwrap().is_none());

        let reply = DiscoveryReply::ok(serde_json::json!({"id": "i-1"}));
        let encoded = encode_response(&reply).unwrap();
        let mut reader = std::io::Cursor::new(encoded.to_vec());
        let parsed = read_response(&mut reader, CAP).await.unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn truncated_buffers_rejected() {
        let request = DiscoveryRequest::new("discover", serde_json::json!({"name": "math"}));
        let encoded = encode_request(&request).unwrap();
        for cut in 0..encoded.len() {
            assert!(decode_request(&encoded[..cut], CAP).is_err(), "cut {}", cut);
        }
    }
}
