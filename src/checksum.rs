//! 메시지 무결성 다이제스트
//!
//! 조각화와 무관하게 메시지 전체(압축 후 바이트)에 대해 CRC32를 한 번 계산.
//! 다항식은 IEEE (zlib `crc32`와 동일).

use std::fmt;

/// 메시지 전체의 CRC32 계산
pub fn digest(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 기대값과 비교
pub fn verify(data: &[u8], expected: u32) -> bool {
    digest(data) == expected
}

/// 조각 단위로 누적하는 CRC32
#[derive(Clone, Default)]
pub struct Digest {
    hasher: crc32fast::Hasher,
    len: usize,
}

impl Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len();
    }

    /// 지금까지 누적된 바이트 수
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:08X}, {} bytes)", self.value(), self.len)
    }
}
