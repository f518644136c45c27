//! 프로토콜 설정

use std::time::Duration;

use crate::{
    COMPRESSION_THRESHOLD, DEFAULT_MTU, DEFAULT_PACKET_INTERVAL_MS, DEFAULT_WINDOW_SIZE,
    HEADER_SIZE,
};

/// 흐름 제어 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// ACK_REQUIRED는 체크포인트 신호일 뿐, 송신측은 ACK를 기다리지 않음
    #[default]
    Advisory,

    /// 미확인 체크포인트가 `max_pending_acks`개면 가장 오래된 ACK를 기다림
    Windowed {
        /// 동시에 대기 가능한 체크포인트 수 (최소 1)
        max_pending_acks: usize,
        /// ACK 대기 타임아웃
        ack_timeout: Duration,
    },
}

impl FlowControl {
    /// 기본 윈도우 흐름 제어
    pub fn windowed() -> Self {
        FlowControl::Windowed {
            max_pending_acks: 1,
            ack_timeout: Duration::from_secs(2),
        }
    }
}

/// MBP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 채널이 MTU를 알려주지 않을 때 사용할 값 (바이트)
    pub default_mtu: usize,

    /// 헤더 외 채널 자체 오버헤드 (바이트)
    /// BLE ATT write는 3바이트
    pub channel_overhead: usize,

    /// 압축 사용 여부
    pub compression_enabled: bool,

    /// 이 크기를 초과하는 메시지만 압축 시도 (바이트)
    pub compression_threshold: usize,

    /// ACK 체크포인트 간격 (패킷 수)
    pub window_size: u16,

    /// 패킷 전송 간격 (밀리초)
    /// 0이면 간격 없이 전송
    pub packet_interval_ms: u64,

    /// write-with-response 사용 여부
    pub write_with_response: bool,

    /// 흐름 제어 방식
    pub flow_control: FlowControl,

    /// 재조립 버퍼 유휴 타임아웃 (밀리초)
    pub reassembly_timeout_ms: u64,

    /// 연결 타임아웃 (밀리초)
    pub connect_timeout_ms: u64,

    /// 수신 이벤트 채널 크기
    pub event_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mtu: DEFAULT_MTU,
            channel_overhead: 0,
            compression_enabled: true,
            compression_threshold: COMPRESSION_THRESHOLD,
            window_size: DEFAULT_WINDOW_SIZE,
            packet_interval_ms: DEFAULT_PACKET_INTERVAL_MS, // 10ms
            write_with_response: false,
            flow_control: FlowControl::Advisory,
            reassembly_timeout_ms: 30_000, // 30초
            connect_timeout_ms: 20_000,    // 20초
            event_buffer_size: 256,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 패킷 하나에 담을 수 있는 최대 페이로드 계산
    pub fn max_payload(&self, mtu: usize) -> Option<usize> {
        mtu.checked_sub(HEADER_SIZE + self.channel_overhead)
            .filter(|&size| size > 0)
    }

    /// `default_mtu` 기준 재조립 가능한 최대 메시지 길이
    ///
    /// 수신측 압축 해제 상한으로도 사용.
    pub fn max_message_len(&self) -> usize {
        self.max_payload(self.default_mtu)
            .unwrap_or(1)
            .saturating_mul(u16::MAX as usize)
    }

    /// 패킷 전송 간격
    pub fn packet_interval(&self) -> Duration {
        Duration::from_millis(self.packet_interval_ms)
    }

    /// 재조립 버퍼 유휴 타임아웃
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    /// 연결 타임아웃
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// ATT 오버헤드를 반영한 BLE GATT용 설정
    pub fn att() -> Self {
        Self {
            channel_overhead: 3,
            ..Self::default()
        }
    }

    /// 저지연 설정 (간격 없음, 압축 없음)
    pub fn low_latency() -> Self {
        Self {
            compression_enabled: false,
            packet_interval_ms: 0,
            ..Self::default()
        }
    }

    /// 신뢰성 우선 설정 (윈도우 흐름 제어 + write-with-response)
    pub fn reliable() -> Self {
        Self {
            packet_interval_ms: 20,
            write_with_response: true,
            flow_control: FlowControl::windowed(),
            ..Self::default()
        }
    }
}
