//! 조각화와 재조립 버퍼
//!
//! - Fragmenter: 메시지를 MTU 이하의 Data 패킷들로 분할 (송신측)
//! - ReassemblyBuffer: Data 페이로드를 순서대로 누적 (수신측)

use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::checksum::Digest;
use crate::packet::{Packet, PacketFlags};
use crate::{Error, Result};

/// 메시지 ID (체크섬 경계마다 증가)
pub type MessageId = u64;

/// 메시지 분할기 (송신측)
#[derive(Debug, Clone)]
pub struct Fragmenter {
    max_payload: usize,
    window_size: u16,
}

impl Fragmenter {
    pub fn new(max_payload: usize, window_size: u16) -> Self {
        Self {
            max_payload: max_payload.max(1),
            window_size,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// 필요한 Data 패킷 수 (ceil)
    pub fn packet_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_payload)
    }

    /// 한 메시지에 담을 수 있는 최대 바이트
    pub fn max_message_len(&self) -> usize {
        self.max_payload * u16::MAX as usize
    }

    /// 데이터를 Data 패킷들로 분할
    ///
    /// 모든 패킷에 `base_flags`가 붙고, 마지막 패킷은 LAST_PACKET,
    /// `window_size`의 배수 sequence_id는 ACK_REQUIRED.
    /// 패킷 위치로 정해지는 두 플래그는 `base_flags`에서 무시.
    pub fn split(&self, data: &Bytes, base_flags: PacketFlags) -> Result<Vec<Packet>> {
        let total = self.packet_count(data.len());
        let total_count = u16::try_from(total).map_err(|_| Error::MessageTooLarge {
            len: data.len(),
            max: self.max_message_len(),
        })?;

        let mut base_flags = base_flags;
        base_flags.remove(PacketFlags::LAST_PACKET | PacketFlags::ACK_REQUIRED);

        let packets = (0..total)
            .map(|idx| {
                let start = idx * self.max_payload;
                let end = (start + self.max_payload).min(data.len());
                let sequence_id = (idx + 1) as u16;

                let mut flags = base_flags;
                if sequence_id == total_count {
                    flags.insert(PacketFlags::LAST_PACKET);
                }
                if self.window_size > 0 && sequence_id % self.window_size == 0 {
                    flags.insert(PacketFlags::ACK_REQUIRED);
                }

                Packet::data(flags, sequence_id, total_count, data.slice(start..end))
            })
            .collect();

        Ok(packets)
    }
}

/// 재조립 버퍼 (수신측, 한 번에 하나의 메시지)
#[derive(Debug)]
pub struct ReassemblyBuffer {
    message_id: MessageId,
    data: BytesMut,
    digest: Digest,

    /// 수신한 Data 패킷 수
    received_count: u32,

    /// 첫 패킷이 알려준 총 패킷 수
    expected_total: Option<u16>,

    /// 마지막으로 받은 sequence_id
    last_sequence: u16,

    /// 이번 메시지가 압축되었는지
    compressed: bool,

    started_at: Option<Instant>,
    last_activity: Option<Instant>,
}

/// 누적 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 기대한 순서대로 도착
    InOrder,

    /// 순서가 어긋남 (기대값, 실제값)
    Gap { expected: u16, got: u16 },
}

/// 체크섬 시점에 꺼낸 완성 메시지
#[derive(Debug, Clone)]
pub struct AssembledMessage {
    pub message_id: MessageId,

    /// 수신 그대로의 바이트 (압축 상태 유지)
    pub data: Bytes,

    /// 누적 CRC32
    pub digest: u32,

    pub received_count: u32,
    pub expected_total: Option<u16>,
    pub compressed: bool,
}

impl AssembledMessage {
    /// 기대한 수만큼 Data 패킷이 도착했는지
    pub fn is_complete(&self) -> bool {
        self.expected_total
            .map_or(self.received_count == 0, |total| self.received_count == total as u32)
    }
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self {
            message_id: 0,
            data: BytesMut::new(),
            digest: Digest::new(),
            received_count: 0,
            expected_total: None,
            last_sequence: 0,
            compressed: false,
            started_at: None,
            last_activity: None,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Data 패킷을 하나도 받지 않은 상태
    pub fn is_empty(&self) -> bool {
        self.received_count == 0
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    /// 마지막 패킷 이후 경과 시간
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.last_activity.map(|t| t.elapsed())
    }

    /// 버퍼가 생성된 이후 경과 시간
    pub fn age(&self) -> Option<std::time::Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Data 패킷 페이로드 누적
    pub fn append(&mut self, packet: &Packet) -> AppendOutcome {
        let now = Instant::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
            self.expected_total = Some(packet.total_count);
        }
        self.last_activity = Some(now);

        let expected = self.last_sequence.wrapping_add(1);
        let outcome = if packet.sequence_id == expected {
            AppendOutcome::InOrder
        } else {
            AppendOutcome::Gap {
                expected,
                got: packet.sequence_id,
            }
        };

        self.data.extend_from_slice(&packet.payload);
        self.digest.update(&packet.payload);
        self.received_count += 1;
        self.last_sequence = packet.sequence_id;
        if packet.flags.contains(PacketFlags::COMPRESSED) {
            self.compressed = true;
        }

        outcome
    }

    /// 현재 메시지를 꺼내고 버퍼를 비움, 메시지 ID 증가
    pub fn finish(&mut self) -> AssembledMessage {
        let assembled = AssembledMessage {
            message_id: self.message_id,
            data: self.data.split().freeze(),
            digest: self.digest.value(),
            received_count: self.received_count,
            expected_total: self.expected_total,
            compressed: self.compressed,
        };
        self.reset();
        assembled
    }

    /// 미완성 메시지를 버림, 버린 바이트 수 반환
    pub fn discard(&mut self) -> usize {
        let dropped = self.data.len();
        self.reset();
        dropped
    }

    fn reset(&mut self) {
        self.message_id += 1;
        self.data.clear();
        self.digest.reset();
        self.received_count = 0;
        self.expected_total = None;
        self.last_sequence = 0;
        self.compressed = false;
        self.started_at = None;
        self.last_activity = None;
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}
