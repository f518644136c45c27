//! 메시지 단위 압축
//!
//! zlib 포맷 (RFC 1950). 원본 피어의 `zlib.compress` / `zlib.decompress`와 호환.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::{Error, Result};

/// 압축 게이트 결과
#[derive(Debug, Clone)]
pub enum CompressResult {
    /// 압축본이 원본보다 작아서 채택됨
    Compressed(Bytes),

    /// 임계값 이하이거나 압축 이득이 없음
    Uncompressed(Bytes),
}

impl CompressResult {
    pub fn is_compressed(&self) -> bool {
        matches!(self, CompressResult::Compressed(_))
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            CompressResult::Compressed(data) | CompressResult::Uncompressed(data) => data,
        }
    }
}

/// zlib 압축
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// zlib 압축 해제
///
/// 출력이 `limit` 바이트를 넘으면 `Error::Decompression`.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));

    // 한 바이트 더 읽어서 상한 초과 여부 판별
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(Error::Decompression)?;

    if out.len() > limit {
        return Err(Error::Decompression(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("압축 해제 크기 상한 초과: > {} bytes", limit),
        )));
    }
    Ok(out)
}

/// `threshold`를 초과하는 메시지만 압축하고, 엄격히 작아질 때만 채택
pub fn compress_if_smaller(data: Bytes, threshold: usize) -> Result<CompressResult> {
    if data.len() <= threshold {
        return Ok(CompressResult::Uncompressed(data));
    }

    let compressed = compress(&data)?;
    if compressed.len() < data.len() {
        Ok(CompressResult::Compressed(Bytes::from(compressed)))
    } else {
        Ok(CompressResult::Uncompressed(data))
    }
}
