//! 수신자
//!
//! - Reassembler: 패킷 단위 디스패치, 재조립, 체크섬 검증, ACK 합성 (동기)
//! - Receiver: 채널 콜백을 큐로 받아 단일 태스크에서 Reassembler를 구동

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, PacketHandler};
use crate::compress;
use crate::fragment::{AppendOutcome, MessageId, ReassemblyBuffer};
use crate::packet::{Packet, PacketFlags, PacketType};
use crate::sender::AckTracker;
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 검증을 통과한 메시지
#[derive(Debug, Clone)]
pub struct CompletedMessage {
    pub message_id: MessageId,

    /// 애플리케이션 데이터 (압축 해제 후)
    pub data: Bytes,

    /// 전송 시 압축되어 있었는지
    pub compressed: bool,

    /// 수신한 바이트 수 (압축 상태)
    pub wire_len: usize,

    pub checksum: u32,

    /// 받은 Data 패킷 수
    pub packet_count: u32,
}

/// 패킷 하나를 처리한 결과
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Data 패킷 누적, 체크포인트면 보낼 ACK 포함
    Fragment {
        sequence_id: u16,
        ack: Option<Packet>,
    },

    /// 체크섬 일치
    Message(CompletedMessage),

    /// 체크섬 불일치 (버퍼는 이미 비워짐)
    IntegrityFailure {
        message_id: MessageId,
        expected: u32,
        actual: u32,
        len: usize,
    },

    /// 상대가 보낸 체크포인트 ACK
    Ack { sequence_id: u16 },

    Metadata(Packet),

    /// 알 수 없는 타입
    Unhandled { packet_type: u8 },
}

/// 재조립기 (수신 태스크 전용, 동기)
pub struct Reassembler {
    buffer: ReassemblyBuffer,
    reassembly_timeout: Duration,

    /// 압축 해제 출력 상한
    max_message_len: usize,

    stats: TransferStats,
}

impl Reassembler {
    pub fn new(config: &Config) -> Self {
        Self {
            buffer: ReassemblyBuffer::new(),
            reassembly_timeout: config.reassembly_timeout(),
            max_message_len: config.max_message_len(),
            stats: TransferStats::new(),
        }
    }

    /// 버퍼에 쌓인 바이트 수
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 현재 재조립 중인 메시지 ID
    pub fn message_id(&self) -> MessageId {
        self.buffer.message_id()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    fn record_ack_sent(&mut self) {
        self.stats.acks_sent += 1;
    }

    fn record_dropped_event(&mut self) {
        self.stats.dropped_events += 1;
    }

    /// 수신 프레임 하나 처리
    ///
    /// 디코딩 실패는 에러로 반환하고 버퍼는 건드리지 않음.
    /// 알 수 없는 타입만 `Inbound::Unhandled`로 관대하게 처리.
    pub fn on_packet(&mut self, raw: &[u8]) -> Result<Inbound> {
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(Error::UnknownPacketType(packet_type)) => {
                self.stats.unhandled_packets += 1;
                warn!("Unhandled packet type: 0x{:02X}", packet_type);
                return Ok(Inbound::Unhandled { packet_type });
            }
            Err(e) => {
                self.stats.malformed_packets += 1;
                warn!("패킷 디코딩 실패 ({} bytes): {}", raw.len(), e);
                return Err(e);
            }
        };

        if packet.packet_type.is_control() && packet.sequence_id != 0 {
            trace!(
                "제어 패킷 sequence_id가 0이 아님: {:?} seq={}",
                packet.packet_type,
                packet.sequence_id
            );
        }

        match packet.packet_type {
            PacketType::Data => Ok(self.on_data(packet)),
            PacketType::Checksum => self.on_checksum(&packet),
            PacketType::Ack => match packet.ack_sequence() {
                Ok(sequence_id) => {
                    trace!("ACK 수신: {}", sequence_id);
                    Ok(Inbound::Ack { sequence_id })
                }
                Err(e) => {
                    self.stats.malformed_packets += 1;
                    Err(e)
                }
            },
            PacketType::Metadata => {
                debug!("메타데이터 수신: {} bytes", packet.payload.len());
                Ok(Inbound::Metadata(packet))
            }
        }
    }

    fn on_data(&mut self, packet: Packet) -> Inbound {
        if !self.buffer.is_empty() {
            let stale = self
                .buffer
                .idle_for()
                .is_some_and(|idle| idle > self.reassembly_timeout);

            if stale || packet.sequence_id == 1 {
                let message_id = self.buffer.message_id();
                let received = self.buffer.received_count();
                let age = self.buffer.age().unwrap_or_default();
                let dropped = self.buffer.discard();
                self.stats.discarded_partials += 1;
                warn!(
                    "미완성 메시지 {} 폐기: {} 패킷, {} bytes, {:.1}s 경과 ({})",
                    message_id,
                    received,
                    dropped,
                    age.as_secs_f64(),
                    if stale { "유휴 타임아웃" } else { "새 메시지 시작" }
                );
            }
        }

        if let AppendOutcome::Gap { expected, got } = self.buffer.append(&packet) {
            warn!(
                "시퀀스 불연속: message={}, expected {}, got {}",
                self.buffer.message_id(),
                expected,
                got
            );
        }
        self.stats.packets_received += 1;

        trace!(
            "Data {}/{} ({} bytes, flags={:?})",
            packet.sequence_id,
            packet.total_count,
            packet.payload.len(),
            packet.flags
        );

        let ack = packet
            .flags
            .contains(PacketFlags::ACK_REQUIRED)
            .then(|| Packet::ack(packet.sequence_id));

        Inbound::Fragment {
            sequence_id: packet.sequence_id,
            ack,
        }
    }

    fn on_checksum(&mut self, packet: &Packet) -> Result<Inbound> {
        let expected = match packet.checksum_value() {
            Ok(value) => value,
            Err(e) => {
                // 체크섬 패킷은 형식이 틀려도 메시지 경계
                self.buffer.discard();
                self.stats.malformed_packets += 1;
                return Err(e);
            }
        };

        let assembled = self.buffer.finish();
        if !assembled.is_complete() {
            warn!(
                "메시지 {}: {} 패킷 수신, 기대 {:?}",
                assembled.message_id, assembled.received_count, assembled.expected_total
            );
        }

        if assembled.digest != expected {
            self.stats.checksum_failures += 1;
            warn!(
                "체크섬 불일치: message={}, expected {:08X}, got {:08X}",
                assembled.message_id, expected, assembled.digest
            );
            return Ok(Inbound::IntegrityFailure {
                message_id: assembled.message_id,
                expected,
                actual: assembled.digest,
                len: assembled.data.len(),
            });
        }

        let wire_len = assembled.data.len();
        let data = if assembled.compressed {
            Bytes::from(compress::decompress(&assembled.data, self.max_message_len)?)
        } else {
            assembled.data
        };

        self.stats.messages_received += 1;
        debug!(
            "메시지 {} 수신: {} bytes (wire {}), crc={:08X}",
            assembled.message_id,
            data.len(),
            wire_len,
            expected
        );

        Ok(Inbound::Message(CompletedMessage {
            message_id: assembled.message_id,
            data,
            compressed: assembled.compressed,
            wire_len,
            checksum: expected,
            packet_count: assembled.received_count,
        }))
    }
}

/// 애플리케이션에 전달되는 수신 이벤트
#[derive(Debug)]
pub enum ReceiverEvent {
    Message(CompletedMessage),

    ChecksumMismatch {
        message_id: MessageId,
        expected: u32,
        actual: u32,
    },

    Ack { sequence_id: u16 },

    Metadata { flags: PacketFlags, payload: Bytes },

    Unhandled { packet_type: u8 },

    /// 패킷 단위 에러 (디코딩, 압축 해제, ACK 전송 실패)
    Error(Error),
}

impl ReceiverEvent {
    fn kind(&self) -> &'static str {
        match self {
            ReceiverEvent::Message(_) => "Message",
            ReceiverEvent::ChecksumMismatch { .. } => "ChecksumMismatch",
            ReceiverEvent::Ack { .. } => "Ack",
            ReceiverEvent::Metadata { .. } => "Metadata",
            ReceiverEvent::Unhandled { .. } => "Unhandled",
            ReceiverEvent::Error(_) => "Error",
        }
    }
}

/// 수신 이벤트 채널 수신기 타입
pub type EventReceiver = mpsc::Receiver<ReceiverEvent>;

/// `stop` 시 남은 큐 처리를 기다리는 최대 시간
const STOP_GRACE: Duration = Duration::from_secs(1);

/// 내부 명령
enum ReceiverCmd {
    Packet(Bytes),
    Stop,
}

/// 채널 콜백 → 큐
struct QueueHandler {
    tx: mpsc::UnboundedSender<ReceiverCmd>,
}

impl PacketHandler for QueueHandler {
    fn on_packet_received(&self, data: &[u8]) {
        let _ = self.tx.send(ReceiverCmd::Packet(Bytes::copy_from_slice(data)));
    }
}

/// 수신자 내부 상태 (단일 태스크에서만 접근)
struct ReceiverInner {
    config: Config,
    reassembler: Reassembler,
    channel: Arc<dyn Channel>,
    acks: Arc<AckTracker>,
    event_tx: mpsc::Sender<ReceiverEvent>,
}

impl ReceiverInner {
    async fn handle_packet(&mut self, raw: &[u8]) {
        let event = match self.reassembler.on_packet(raw) {
            Ok(Inbound::Fragment { ack, .. }) => {
                if let Some(ack) = ack {
                    self.send_ack(&ack).await;
                }
                return;
            }
            Ok(Inbound::Message(message)) => ReceiverEvent::Message(message),
            Ok(Inbound::IntegrityFailure {
                message_id,
                expected,
                actual,
                ..
            }) => ReceiverEvent::ChecksumMismatch {
                message_id,
                expected,
                actual,
            },
            Ok(Inbound::Ack { sequence_id }) => {
                self.acks.acknowledge(sequence_id);
                ReceiverEvent::Ack { sequence_id }
            }
            Ok(Inbound::Metadata(packet)) => ReceiverEvent::Metadata {
                flags: packet.flags,
                payload: packet.payload,
            },
            Ok(Inbound::Unhandled { packet_type }) => ReceiverEvent::Unhandled { packet_type },
            Err(e) => ReceiverEvent::Error(e),
        };

        self.emit(event);
    }

    /// 이벤트 전달 (큐가 가득 차면 버림, 수신 태스크는 기다리지 않음)
    fn emit(&mut self, event: ReceiverEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.reassembler.record_dropped_event();
                if matches!(event, ReceiverEvent::Ack { .. }) {
                    trace!("이벤트 큐 가득 참, Ack 이벤트 버림");
                } else {
                    warn!("이벤트 큐 가득 참, {} 이벤트 버림", event.kind());
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("이벤트 수신기 없음");
            }
        }
    }

    async fn send_ack(&mut self, ack: &Packet) {
        let result = match ack.encode() {
            Ok(bytes) => {
                self.channel
                    .write_packet(&bytes, self.config.write_with_response)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.reassembler.record_ack_sent();
                trace!("ACK 전송: {:?}", ack.ack_sequence().ok());
            }
            Err(e) => {
                warn!("ACK 전송 실패: {}", e);
                self.emit(ReceiverEvent::Error(e));
            }
        }
    }
}

/// 수신자 핸들 (외부에서 제어용)
pub struct Receiver {
    cmd_tx: mpsc::UnboundedSender<ReceiverCmd>,
    stats: Arc<RwLock<TransferStats>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    /// 채널에 핸들러를 등록하고 수신 태스크 시작
    pub async fn start(
        config: Config,
        channel: Arc<dyn Channel>,
        acks: Arc<AckTracker>,
    ) -> Result<(Self, EventReceiver)> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ReceiverCmd>();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size.max(1));

        channel
            .subscribe(Arc::new(QueueHandler { tx: cmd_tx.clone() }))
            .await?;

        let stats = Arc::new(RwLock::new(TransferStats::new()));
        let running = Arc::new(AtomicBool::new(true));

        let mut inner = ReceiverInner {
            reassembler: Reassembler::new(&config),
            config,
            channel,
            acks,
            event_tx,
        };

        let stats_main = stats.clone();
        let running_main = running.clone();

        let task = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ReceiverCmd::Packet(raw) => {
                        inner.handle_packet(&raw).await;
                    }
                    ReceiverCmd::Stop => {
                        break;
                    }
                }

                // 통계 업데이트
                *stats_main.write() = inner.reassembler.stats().clone();
            }

            running_main.store(false, Ordering::SeqCst);
            debug!("수신 태스크 종료");
        });

        info!("MBP Receiver started");

        let receiver = Self {
            cmd_tx,
            stats,
            running,
            task: Mutex::new(Some(task)),
        };

        Ok((receiver, event_rx))
    }

    /// 정지
    ///
    /// 큐에 남은 패킷은 처리 후 종료. `STOP_GRACE` 안에 끝나지 않으면
    /// 태스크를 중단시킴 (채널 write가 멈춘 경우).
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(ReceiverCmd::Stop);

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("수신 태스크가 {:?} 안에 종료되지 않아 중단", STOP_GRACE);
                task.abort();
                let _ = task.await;
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// 통계 반환
    pub fn get_stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
