//! 에러 타입 정의

use thiserror::Error;

/// MBP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 패킷: {len} bytes (헤더 {header} bytes 미만)", header = crate::HEADER_SIZE)]
    MalformedPacket { len: usize },

    #[error("알 수 없는 패킷 타입: 0x{0:02X}")]
    UnknownPacketType(u8),

    #[error("유효하지 않은 플래그: 0x{0:02X}")]
    InvalidFlags(u8),

    #[error("페이로드 길이 불일치: declared {declared}, actual {actual}")]
    PayloadLengthMismatch { declared: u16, actual: usize },

    #[error("제어 패킷 페이로드 오류: {0}")]
    InvalidControlPayload(&'static str),

    #[error("압축 해제 실패: {0}")]
    Decompression(std::io::Error),

    #[error("채널 에러: {0}")]
    Channel(String),

    #[error("연결되지 않음")]
    NotConnected,

    #[error("연결 실패: {target}")]
    ConnectFailed { target: String },

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("MTU가 너무 작음: mtu {mtu}, overhead {overhead}")]
    MtuTooSmall { mtu: usize, overhead: usize },

    #[error("메시지가 너무 큼: {len} bytes, 최대 {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("페이로드가 너무 큼: {len} bytes, 최대 {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("ACK 타임아웃: sequence_id={sequence_id}")]
    AckTimeout { sequence_id: u16 },
}

impl Error {
    /// 단일 패킷 디코딩 실패 여부
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket { .. }
                | Error::UnknownPacketType(_)
                | Error::InvalidFlags(_)
                | Error::PayloadLengthMismatch { .. }
                | Error::InvalidControlPayload(_)
        )
    }

    /// 채널 계층에서 발생한 에러 여부
    pub fn is_channel(&self) -> bool {
        matches!(
            self,
            Error::Channel(_)
                | Error::NotConnected
                | Error::ConnectFailed { .. }
                | Error::ConnectionClosed
                | Error::Io(_)
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::MalformedPacket { len: 3 }.is_malformed());
        assert!(Error::UnknownPacketType(0x09).is_malformed());
        assert!(!Error::Decompression(std::io::ErrorKind::InvalidData.into()).is_malformed());
        assert!(Error::NotConnected.is_channel());
        assert!(!Error::AckTimeout { sequence_id: 5 }.is_channel());
    }

    #[test]
    fn test_error_display() {
        let err = Error::PayloadLengthMismatch {
            declared: 10,
            actual: 4,
        };
        assert_eq!(err.to_string(), "페이로드 길이 불일치: declared 10, actual 4");
        assert_eq!(
            Error::MalformedPacket { len: 3 }.to_string(),
            "잘못된 패킷: 3 bytes (헤더 8 bytes 미만)"
        );
    }
}
