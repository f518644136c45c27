//! 송신 파이프라인
//!
//! 메시지 하나의 흐름: 압축 → 분할 → 간격 두고 순차 전송 → 체크섬 패킷.
//! 한 송신자에서 전송은 한 번에 하나씩 (직렬화).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::checksum;
use crate::compress::{self, CompressResult};
use crate::config::FlowControl;
use crate::fragment::Fragmenter;
use crate::packet::{Packet, PacketFlags};
use crate::stats::{TransferReport, TransferStats};
use crate::{Config, Error, Result, HEADER_SIZE};

/// 전송 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Compressing,
    Fragmenting,
    Transmitting,
    Finalizing,
}

/// 대기 중인 체크포인트 ACK
///
/// 송신자와 수신 태스크가 공유. 수신 태스크가 Ack 패킷을 받으면
/// `acknowledge`로 대기 중인 송신자를 깨움.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: DashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 체크포인트 등록 (패킷 전송 전에 호출)
    pub fn register(&self, sequence_id: u16) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(sequence_id, tx).is_some() {
            warn!("체크포인트 {} 중복 등록", sequence_id);
        }
        rx
    }

    /// ACK 도착 처리, 기다리던 체크포인트였으면 `true`
    pub fn acknowledge(&self, sequence_id: u16) -> bool {
        match self.pending.remove(&sequence_id) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// 대기 중인 체크포인트 모두 폐기
    pub fn clear(&self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// 한 번의 `send` 호출 동안의 상태
struct TransferSession {
    started_at: Instant,
    message_len: usize,
    mtu: usize,
    max_payload: usize,
    wire_len: usize,
    compressed: bool,
    data_packets: usize,
    bytes_on_wire: usize,

    /// 윈도우 모드에서 아직 확인되지 않은 체크포인트 (오래된 순)
    pending: VecDeque<(u16, oneshot::Receiver<()>)>,
}

impl TransferSession {
    fn new(message_len: usize, mtu: usize, max_payload: usize) -> Self {
        Self {
            started_at: Instant::now(),
            message_len,
            mtu,
            max_payload,
            wire_len: message_len,
            compressed: false,
            data_packets: 0,
            bytes_on_wire: 0,
            pending: VecDeque::new(),
        }
    }

    fn report(&self) -> TransferReport {
        TransferReport {
            message_len: self.message_len,
            wire_len: self.wire_len,
            compressed: self.compressed,
            data_packets: self.data_packets,
            bytes_on_wire: self.bytes_on_wire,
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// `send`가 끝나거나 future가 버려질 때 대기표를 비우고 Idle로 복귀
struct TransferReset<'a> {
    sender: &'a Sender,
}

impl Drop for TransferReset<'_> {
    fn drop(&mut self) {
        self.sender.acks.clear();
        self.sender.enter(SendPhase::Idle);
    }
}

/// 송신자
pub struct Sender {
    /// 설정
    config: Config,

    channel: Arc<dyn Channel>,

    /// 수신 태스크와 공유하는 ACK 대기표
    acks: Arc<AckTracker>,

    /// 전송 통계
    stats: RwLock<TransferStats>,

    /// 현재 단계
    phase: RwLock<SendPhase>,

    /// 전송 직렬화
    send_lock: tokio::sync::Mutex<()>,
}

impl Sender {
    /// 새 송신자 생성
    pub fn new(config: Config, channel: Arc<dyn Channel>, acks: Arc<AckTracker>) -> Self {
        Self {
            config,
            channel,
            acks,
            stats: RwLock::new(TransferStats::new()),
            phase: RwLock::new(SendPhase::Idle),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 현재 전송 단계
    pub fn phase(&self) -> SendPhase {
        *self.phase.read()
    }

    /// 통계 반환
    pub fn get_stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    pub fn acks(&self) -> &Arc<AckTracker> {
        &self.acks
    }

    fn enter(&self, phase: SendPhase) {
        let prev = std::mem::replace(&mut *self.phase.write(), phase);
        debug!(?prev, ?phase, "send phase");
    }

    /// 현재 MTU에서의 최대 페이로드
    ///
    /// 채널이 MTU를 알려주지 못하면 (에러 또는 0) `default_mtu` 사용.
    async fn negotiate(&self) -> Result<(usize, usize)> {
        let mtu = match self.channel.current_mtu().await {
            Ok(0) => {
                debug!("채널 MTU 0, 기본값 사용: {}", self.config.default_mtu);
                self.config.default_mtu
            }
            Ok(mtu) => mtu,
            Err(e) => {
                warn!("MTU 조회 실패, 기본값 {} 사용: {}", self.config.default_mtu, e);
                self.config.default_mtu
            }
        };
        let max_payload = self
            .config
            .max_payload(mtu)
            .ok_or(Error::MtuTooSmall {
                mtu,
                overhead: HEADER_SIZE + self.config.channel_overhead,
            })?;
        Ok((mtu, max_payload))
    }

    /// 메시지 하나 전송
    ///
    /// 마지막 체크섬 패킷까지 채널에 쓰면 반환. 첫 write 실패에서 중단하고
    /// 그 에러를 그대로 반환 (재전송 없음).
    pub async fn send(&self, data: &[u8]) -> Result<TransferReport> {
        let _lock = self.send_lock.lock().await;
        let _reset = TransferReset { sender: self };

        self.run_transfer(data).await
    }

    async fn run_transfer(&self, data: &[u8]) -> Result<TransferReport> {
        let (mtu, max_payload) = self.negotiate().await?;
        let mut session = TransferSession::new(data.len(), mtu, max_payload);

        // 압축
        self.enter(SendPhase::Compressing);
        let original = Bytes::copy_from_slice(data);
        let wire = if self.config.compression_enabled {
            match compress::compress_if_smaller(original, self.config.compression_threshold)? {
                CompressResult::Compressed(bytes) => {
                    session.compressed = true;
                    bytes
                }
                CompressResult::Uncompressed(bytes) => bytes,
            }
        } else {
            original
        };
        session.wire_len = wire.len();

        if session.compressed {
            debug!(
                "압축: {} -> {} bytes ({:.1}%)",
                session.message_len,
                session.wire_len,
                session.wire_len as f64 / session.message_len as f64 * 100.0
            );
        }

        // 분할
        self.enter(SendPhase::Fragmenting);
        let base_flags = if session.compressed {
            PacketFlags::COMPRESSED
        } else {
            PacketFlags::NONE
        };
        let packets = Fragmenter::new(session.max_payload, self.config.window_size)
            .split(&wire, base_flags)?;
        debug!(
            "분할: {} bytes -> {} 패킷 (mtu={}, max_payload={})",
            session.wire_len,
            packets.len(),
            session.mtu,
            session.max_payload
        );

        // 전송
        self.enter(SendPhase::Transmitting);
        self.transmit(&packets, &mut session).await?;
        self.drain_acks(&mut session).await?;

        // 체크섬
        self.enter(SendPhase::Finalizing);
        let digest = checksum::digest(&wire);
        let checksum_packet = Packet::checksum(digest);
        self.write(&checksum_packet, &mut session).await?;

        let report = session.report();
        {
            let mut stats = self.stats.write();
            stats.messages_sent += 1;
            stats.payload_bytes += session.message_len as u64;
            if session.compressed {
                stats.compressed_messages += 1;
                stats.compression_saved_bytes +=
                    session.message_len.saturating_sub(session.wire_len) as u64;
            }
        }

        info!(
            "메시지 전송 완료: {} bytes, {} 패킷, crc={:08X}, {:.2}ms",
            report.message_len,
            report.data_packets,
            digest,
            report.elapsed.as_secs_f64() * 1000.0
        );

        Ok(report)
    }

    /// Data 패킷 순차 전송
    async fn transmit(&self, packets: &[Packet], session: &mut TransferSession) -> Result<()> {
        let interval = self.config.packet_interval();

        for packet in packets {
            if packet.ack_required() {
                self.stats.write().acks_requested += 1;

                if let FlowControl::Windowed {
                    max_pending_acks,
                    ack_timeout,
                } = self.config.flow_control
                {
                    while session.pending.len() >= max_pending_acks.max(1) {
                        self.wait_oldest(session, ack_timeout).await?;
                    }
                    // 전송 전에 등록해야 ACK를 놓치지 않음
                    let rx = self.acks.register(packet.sequence_id);
                    session.pending.push_back((packet.sequence_id, rx));
                }
            }

            self.write(packet, session).await?;
            session.data_packets += 1;

            // 전송 간격
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        Ok(())
    }

    /// 남은 체크포인트 ACK 모두 대기
    async fn drain_acks(&self, session: &mut TransferSession) -> Result<()> {
        if let FlowControl::Windowed { ack_timeout, .. } = self.config.flow_control {
            while !session.pending.is_empty() {
                self.wait_oldest(session, ack_timeout).await?;
            }
        }
        Ok(())
    }

    async fn wait_oldest(&self, session: &mut TransferSession, timeout: Duration) -> Result<()> {
        let Some((sequence_id, rx)) = session.pending.pop_front() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                trace!("체크포인트 {} 확인", sequence_id);
                self.stats.write().acks_received += 1;
                Ok(())
            }
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                warn!("ACK 타임아웃: sequence_id={}", sequence_id);
                Err(Error::AckTimeout { sequence_id })
            }
        }
    }

    async fn write(&self, packet: &Packet, session: &mut TransferSession) -> Result<()> {
        let bytes = packet.encode()?;
        if let Err(e) = self
            .channel
            .write_packet(&bytes, self.config.write_with_response)
            .await
        {
            warn!(
                "패킷 전송 실패: type={:?}, seq={}: {}",
                packet.packet_type, packet.sequence_id, e
            );
            return Err(e);
        }

        session.bytes_on_wire += bytes.len();
        let mut stats = self.stats.write();
        stats.packets_sent += 1;
        stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    /// 메타데이터 패킷 하나 전송
    pub async fn send_metadata(&self, payload: &[u8]) -> Result<()> {
        let _guard = self.send_lock.lock().await;

        let (mtu, max_payload) = self.negotiate().await?;
        if payload.len() > max_payload {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: max_payload,
            });
        }

        let mut session = TransferSession::new(payload.len(), mtu, max_payload);
        let packet = Packet::metadata(Bytes::copy_from_slice(payload));
        self.write(&packet, &mut session).await?;

        debug!("메타데이터 전송: {} bytes", payload.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, PacketHandler};
    use crate::packet::PacketType;

    /// 체크포인트를 받으면 바로 ACK 대기표를 풀어주는 상대
    struct AckingPeer {
        acks: Arc<AckTracker>,
    }

    impl PacketHandler for AckingPeer {
        fn on_packet_received(&self, data: &[u8]) {
            if let Ok(packet) = Packet::decode(data) {
                if packet.ack_required() {
                    self.acks.acknowledge(packet.sequence_id);
                }
            }
        }
    }

    fn sender_for(config: Config, channel: Arc<MemoryChannel>) -> Sender {
        Sender::new(config, channel, Arc::new(AckTracker::new()))
    }

    fn decode_all(frames: &[Bytes]) -> Vec<Packet> {
        frames.iter().map(|f| Packet::decode(f).unwrap()).collect()
    }

    #[test]
    fn test_ack_tracker() {
        let tracker = AckTracker::new();
        let mut rx = tracker.register(5);
        assert_eq!(tracker.pending_count(), 1);

        assert!(!tracker.acknowledge(10));
        assert!(tracker.acknowledge(5));
        assert!(rx.try_recv().is_ok());
        assert_eq!(tracker.pending_count(), 0);

        let _rx = tracker.register(15);
        tracker.clear();
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ab_pattern_frames() {
        // MTU 28 - 헤더 8 = 페이로드 20
        let (a, _b) = MemoryChannel::pair(28);
        let a = Arc::new(a);
        let sender = sender_for(Config::low_latency(), a.clone());

        let data = b"AB".repeat(40);
        let report = sender.send(&data).await.unwrap();
        assert_eq!(report.data_packets, 4);
        assert!(!report.compressed);
        assert_eq!(sender.phase(), SendPhase::Idle);

        let packets = decode_all(&a.sent_frames());
        assert_eq!(packets.len(), 5);
        assert!(packets[..4]
            .iter()
            .all(|p| p.packet_type == PacketType::Data && p.total_count == 4));
        assert!(packets[3].is_last());
        assert!(!packets[2].is_last());

        let trailer = &packets[4];
        assert_eq!(trailer.packet_type, PacketType::Checksum);
        assert_eq!(trailer.sequence_id, 0);
        assert_eq!(trailer.total_count, 1);
        assert!(trailer.is_last());
        assert_eq!(trailer.checksum_value().unwrap(), checksum::digest(&data));
    }

    #[tokio::test]
    async fn test_compressed_digest_covers_wire_bytes() {
        let (a, _b) = MemoryChannel::pair(64);
        let a = Arc::new(a);
        let config = Config {
            packet_interval_ms: 0,
            ..Config::default()
        };
        let sender = sender_for(config, a.clone());

        let data = b"Hello from client! ".repeat(10);
        let report = sender.send(&data).await.unwrap();
        assert!(report.compressed);
        assert!(report.wire_len < data.len());

        let packets = decode_all(&a.sent_frames());
        let (trailer, data_packets) = packets.split_last().unwrap();
        assert!(data_packets
            .iter()
            .all(|p| p.flags.contains(PacketFlags::COMPRESSED)));

        let wire: Vec<u8> = data_packets
            .iter()
            .flat_map(|p| p.payload.iter().copied())
            .collect();
        assert_eq!(trailer.checksum_value().unwrap(), checksum::digest(&wire));
        assert_eq!(compress::decompress(&wire, data.len()).unwrap(), data);

        let stats = sender.get_stats();
        assert_eq!(stats.compressed_messages, 1);
        assert_eq!(stats.packets_sent as usize, packets.len());
    }

    #[tokio::test]
    async fn test_empty_message_is_checksum_only() {
        let (a, _b) = MemoryChannel::pair(28);
        let a = Arc::new(a);
        let sender = sender_for(Config::low_latency(), a.clone());

        let report = sender.send(b"").await.unwrap();
        assert_eq!(report.data_packets, 0);

        let packets = decode_all(&a.sent_frames());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].checksum_value().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mtu_too_small() {
        let (a, _b) = MemoryChannel::pair(8);
        let sender = sender_for(Config::low_latency(), Arc::new(a));

        let err = sender.send(b"hi").await.unwrap_err();
        assert!(matches!(err, Error::MtuTooSmall { mtu: 8, overhead: 8 }));
    }

    #[tokio::test]
    async fn test_write_failure_aborts() {
        let (a, _b) = MemoryChannel::pair(18);
        let a = Arc::new(a);
        a.fail_writes_after(2);
        let sender = sender_for(Config::low_latency(), a.clone());

        let err = sender.send(&[7u8; 100]).await.unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
        assert_eq!(a.sent_frames().len(), 2);
        assert_eq!(sender.phase(), SendPhase::Idle);
        assert_eq!(sender.get_stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_windowed_with_acking_peer() {
        let (a, b) = MemoryChannel::pair(18);
        let a = Arc::new(a);
        let acks = Arc::new(AckTracker::new());
        b.subscribe(Arc::new(AckingPeer { acks: acks.clone() }))
            .await
            .unwrap();

        let config = Config {
            flow_control: FlowControl::windowed(),
            ..Config::low_latency()
        };
        let sender = Sender::new(config, a.clone(), acks.clone());

        // 페이로드 10 x 12 패킷 => 체크포인트 5, 10
        let report = sender.send(&[3u8; 120]).await.unwrap();
        assert_eq!(report.data_packets, 12);

        let stats = sender.get_stats();
        assert_eq!(stats.acks_requested, 2);
        assert_eq!(stats.acks_received, 2);
        assert_eq!(acks.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_windowed_silent_peer_times_out() {
        let (a, _b) = MemoryChannel::pair(18);
        let a = Arc::new(a);
        let config = Config {
            flow_control: FlowControl::Windowed {
                max_pending_acks: 1,
                ack_timeout: Duration::from_millis(50),
            },
            ..Config::low_latency()
        };
        let sender = sender_for(config, a.clone());

        let err = sender.send(&[3u8; 120]).await.unwrap_err();
        assert!(matches!(err, Error::AckTimeout { sequence_id: 5 }));
        assert_eq!(sender.acks().pending_count(), 0);

        // 체크섬 패킷은 나가지 않음
        let packets = decode_all(&a.sent_frames());
        assert!(packets.iter().all(|p| p.packet_type == PacketType::Data));
    }

    #[tokio::test]
    async fn test_cancelled_send_resets_state() {
        let (a, b) = MemoryChannel::pair(18);
        let a = Arc::new(a);
        let config = Config {
            flow_control: FlowControl::Windowed {
                max_pending_acks: 1,
                ack_timeout: Duration::from_secs(10),
            },
            ..Config::low_latency()
        };
        let sender = sender_for(config, a.clone());

        // ACK를 기다리는 중에 future를 버림
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), sender.send(&[3u8; 120])).await;
        assert!(cancelled.is_err());
        assert_eq!(sender.acks().pending_count(), 0);
        assert_eq!(sender.phase(), SendPhase::Idle);

        // 늦게 도착한 이전 메시지의 ACK는 다음 전송에 영향 없음
        assert!(!sender.acks().acknowledge(5));

        b.subscribe(Arc::new(AckingPeer {
            acks: sender.acks().clone(),
        }))
        .await
        .unwrap();
        let report = sender.send(&[4u8; 120]).await.unwrap();
        assert_eq!(report.data_packets, 12);
        assert_eq!(sender.acks().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_mtu_fallback_and_renegotiation() {
        let (a, _b) = MemoryChannel::pair(28);
        let a = Arc::new(a);
        let sender = sender_for(Config::low_latency(), a.clone());

        let report = sender.send(&[1u8; 80]).await.unwrap();
        assert_eq!(report.data_packets, 4);

        // 전송 사이에 MTU가 커지면 다음 메시지부터 반영
        a.set_mtu(48);
        let report = sender.send(&[1u8; 80]).await.unwrap();
        assert_eq!(report.data_packets, 2);

        // MTU를 모르면 default_mtu
        a.set_mtu(0);
        assert_eq!(sender.negotiate().await.unwrap(), (244, 236));

        a.disconnect().await.unwrap();
        assert_eq!(sender.negotiate().await.unwrap(), (244, 236));
    }

    #[tokio::test]
    async fn test_send_metadata() {
        let (a, _b) = MemoryChannel::pair(28);
        let a = Arc::new(a);
        let sender = sender_for(Config::low_latency(), a.clone());

        sender.send_metadata(b"name=temp").await.unwrap();
        let packets = decode_all(&a.sent_frames());
        assert_eq!(packets[0].packet_type, PacketType::Metadata);
        assert_eq!(packets[0].flags, PacketFlags::METADATA | PacketFlags::LAST_PACKET);

        let err = sender.send_metadata(&[0u8; 21]).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { len: 21, max: 20 }));
    }
}
