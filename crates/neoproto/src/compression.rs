//! Per-frame payload compression.
//!
//! The algorithm travels in the frame envelope, so every peer can pick its
//! own codec per message. Decompression is bounded: output beyond the caller
//! supplied cap aborts with [`ProtocolError::DecompressBomb`] instead of
//! allocating without limit.

use std::io::{Read, Write};

use crate::error::ProtocolError;

/// Payload compression algorithm.
///
/// `None` and `Gzip` are always available; `Zstd` and `Lz4` are compiled in
/// here but a peer may lack them, in which case registration fails with
/// `UNSUPPORTED_COMPRESSION` rather than silently falling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            "lz4" => Ok(Compression::Lz4),
            other => Err(ProtocolError::UnsupportedCompression(other.to_string())),
        }
    }

    /// All algorithms this build can encode and decode.
    pub fn supported() -> &'static [&'static str] {
        &["none", "gzip", "zstd", "lz4"]
    }
}

/// Compress `data` with the given codec.
pub fn compress(codec: Compression, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(6));
            encoder
                .write_all(data)
                .map_err(|e| ProtocolError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| ProtocolError::Compression(e.to_string()))
        }
        Compression::Zstd => {
            zstd::stream::encode_all(data, 3).map_err(|e| ProtocolError::Compression(e.to_string()))
        }
        Compression::Lz4 => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
            encoder
                .write_all(data)
                .map_err(|e| ProtocolError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| ProtocolError::Compression(e.to_string()))
        }
    }
}

/// Decompress `data`, refusing to produce more than `max_out` bytes.
pub fn decompress(
    codec: Compression,
    data: &[u8],
    max_out: usize,
) -> Result<Vec<u8>, ProtocolError> {
    match codec {
        Compression::None => {
            if data.len() > max_out {
                return Err(ProtocolError::DecompressBomb { cap: max_out });
            }
            Ok(data.to_vec())
        }
        Compression::Gzip => bounded_read(flate2::read::GzDecoder::new(data), max_out),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(data)
                .map_err(|e| ProtocolError::Compression(e.to_string()))?;
            bounded_read(decoder, max_out)
        }
        Compression::Lz4 => bounded_read(lz4_flex::frame::FrameDecoder::new(data), max_out),
    }
}

/// Drain a decoder into a Vec, stopping one byte past the cap.
fn bounded_read<R: Read>(decoder: R, max_out: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    let mut limited = decoder.take(max_out as u64 + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    if out.len() > max_out {
        return Err(ProtocolError::DecompressBomb { cap: max_out });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"the quick brown fox jumps over the lazy dog, repeatedly, \
        the quick brown fox jumps over the lazy dog";

    #[test]
    fn roundtrip_all_codecs() {
        for codec in [
            Compression::None,
            Compression::Gzip,
            Compression::Zstd,
            Compression::Lz4,
        ] {
            let packed = compress(codec, SAMPLE).unwrap();
            let unpacked = decompress(codec, &packed, 1024).unwrap();
            assert_eq!(unpacked, SAMPLE, "codec {:?}", codec);
        }
    }

    #[test]
    fn gzip_actually_shrinks_repetitive_data() {
        let data = vec![b'a'; 4096];
        let packed = compress(Compression::Gzip, &data).unwrap();
        assert!(packed.len() < data.len());
    }

    #[test]
    fn parse_names() {
        assert_eq!(Compression::parse("gzip").unwrap(), Compression::Gzip);
        assert_eq!(Compression::parse("none").unwrap(), Compression::None);
        assert!(matches!(
            Compression::parse("snappy"),
            Err(ProtocolError::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn bomb_cap_enforced() {
        let data = vec![0u8; 64 * 1024];
        let packed = compress(Compression::Gzip, &data).unwrap();
        // Tiny compressed input, huge output: must abort at the cap.
        let err = decompress(Compression::Gzip, &packed, 1024).unwrap_err();
        assert!(matches!(err, ProtocolError::DecompressBomb { cap: 1024 }));
    }

    #[test]
    fn none_respects_cap_too() {
        let data = vec![0u8; 2048];
        assert!(matches!(
            decompress(Compression::None, &data, 1024),
            Err(ProtocolError::DecompressBomb { .. })
        ));
    }

    #[test]
    fn garbage_input_is_an_error_not_a_panic() {
        let garbage = b"\x01\x02\x03\x04not a stream";
        assert!(decompress(Compression::Gzip, garbage, 1024).is_err());
        assert!(decompress(Compression::Zstd, garbage, 1024).is_err());
        assert!(decompress(Compression::Lz4, garbage, 1024).is_err());
    }
}
