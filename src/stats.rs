//! 전송 통계
//!
//! 관측용 카운터. 프로토콜 동작에는 영향 없음.

use std::time::{Duration, Instant};

/// 세션 누적 통계 (송신 + 수신)
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    // 송신측
    /// 전송 완료된 메시지 수
    pub messages_sent: u64,

    /// 전송한 패킷 수 (Data + Checksum + Metadata)
    pub packets_sent: u64,

    /// 헤더 포함 전송 바이트
    pub bytes_sent: u64,

    /// 압축 전 원본 페이로드 바이트
    pub payload_bytes: u64,

    /// 압축이 채택된 메시지 수
    pub compressed_messages: u64,

    /// 압축으로 절약한 바이트
    pub compression_saved_bytes: u64,

    /// ACK_REQUIRED 체크포인트 수
    pub acks_requested: u64,

    /// 받은 ACK 수
    pub acks_received: u64,

    // 수신측
    /// 체크섬 검증을 통과한 메시지 수
    pub messages_received: u64,

    /// 수신한 Data 패킷 수
    pub packets_received: u64,

    /// 체크섬 불일치 수
    pub checksum_failures: u64,

    /// 디코딩 실패 패킷 수
    pub malformed_packets: u64,

    /// 알 수 없는 타입 패킷 수
    pub unhandled_packets: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,

    /// 버려진 미완성 메시지 수
    pub discarded_partials: u64,

    /// 이벤트 큐가 가득 차 버려진 이벤트 수
    pub dropped_events: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            messages_sent: 0,
            packets_sent: 0,
            bytes_sent: 0,
            payload_bytes: 0,
            compressed_messages: 0,
            compression_saved_bytes: 0,
            acks_requested: 0,
            acks_received: 0,
            messages_received: 0,
            packets_received: 0,
            checksum_failures: 0,
            malformed_packets: 0,
            unhandled_packets: 0,
            acks_sent: 0,
            discarded_partials: 0,
            dropped_events: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 송신 처리율 (bytes/sec, 헤더 포함)
    pub fn overall_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 압축률 (전송 페이로드 / 원본), 보낸 게 없으면 1.0
    pub fn compression_ratio(&self) -> f64 {
        if self.payload_bytes == 0 {
            return 1.0;
        }
        let wire = self.payload_bytes.saturating_sub(self.compression_saved_bytes);
        wire as f64 / self.payload_bytes as f64
    }

    /// 두 통계 합치기 (송신자 + 수신자)
    pub fn merge(&mut self, other: &TransferStats) {
        self.start_time = self.start_time.min(other.start_time);
        self.messages_sent += other.messages_sent;
        self.packets_sent += other.packets_sent;
        self.bytes_sent += other.bytes_sent;
        self.payload_bytes += other.payload_bytes;
        self.compressed_messages += other.compressed_messages;
        self.compression_saved_bytes += other.compression_saved_bytes;
        self.acks_requested += other.acks_requested;
        self.acks_received += other.acks_received;
        self.messages_received += other.messages_received;
        self.packets_received += other.packets_received;
        self.checksum_failures += other.checksum_failures;
        self.malformed_packets += other.malformed_packets;
        self.unhandled_packets += other.unhandled_packets;
        self.acks_sent += other.acks_sent;
        self.discarded_partials += other.discarded_partials;
        self.dropped_events += other.dropped_events;
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} msgs / {} pkts / {} bytes | Compression: {:.1}% | Received: {} msgs | CRC fail: {} | Malformed: {} | ACKs: {}/{} | Discarded: {} | Dropped events: {}",
            self.elapsed().as_secs_f64(),
            self.messages_sent,
            self.packets_sent,
            self.bytes_sent,
            self.compression_ratio() * 100.0,
            self.messages_received,
            self.checksum_failures,
            self.malformed_packets,
            self.acks_received,
            self.acks_requested,
            self.discarded_partials,
            self.dropped_events,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 한 번의 `send` 결과 (관측용)
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// 원본 메시지 길이
    pub message_len: usize,

    /// 전송된 메시지 길이 (압축 후)
    pub wire_len: usize,

    pub compressed: bool,

    /// Data 패킷 수 (체크섬 제외)
    pub data_packets: usize,

    /// 헤더 포함 총 전송 바이트
    pub bytes_on_wire: usize,

    pub elapsed: Duration,
}

impl TransferReport {
    /// 원본 기준 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.message_len as f64 / secs
    }

    /// 압축률 (0이면 1.0)
    pub fn compression_ratio(&self) -> f64 {
        if self.message_len == 0 {
            return 1.0;
        }
        self.wire_len as f64 / self.message_len as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_ratio() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.compression_ratio(), 1.0);

        stats.payload_bytes = 200;
        stats.compression_saved_bytes = 150;
        assert!((stats.compression_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge() {
        let mut tx = TransferStats::new();
        tx.messages_sent = 2;
        tx.acks_requested = 3;

        let mut rx = TransferStats::new();
        rx.messages_received = 1;
        rx.acks_sent = 3;
        rx.dropped_events = 2;

        tx.merge(&rx);
        assert_eq!(tx.messages_sent, 2);
        assert_eq!(tx.messages_received, 1);
        assert_eq!(tx.acks_sent, 3);
        assert_eq!(tx.dropped_events, 2);
        assert!(tx.summary().contains("Received: 1 msgs"));
        assert!(tx.summary().contains("Dropped events: 2"));
    }

    #[test]
    fn test_report_throughput() {
        let report = TransferReport {
            message_len: 1000,
            wire_len: 250,
            compressed: true,
            data_packets: 2,
            bytes_on_wire: 274,
            elapsed: Duration::from_millis(500),
        };
        assert!((report.throughput() - 2000.0).abs() < 1e-6);
        assert!((report.compression_ratio() - 0.25).abs() < 1e-9);

        let empty = TransferReport {
            elapsed: Duration::ZERO,
            ..report
        };
        assert_eq!(empty.throughput(), 0.0);
    }
}
