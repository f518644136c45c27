//! 패킷 코덱
//!
//! 모든 패킷은 8바이트 고정 헤더 + 페이로드로 구성됨 (리틀 엔디언)
//!
//! ```text
//! +------+-------+-------------+-------------+----------------+---------+
//! | type | flags | sequence_id | total_count | payload_length | payload |
//! |  1B  |  1B   |   2B (LE)   |   2B (LE)   |    2B (LE)     |  가변   |
//! +------+-------+-------------+-------------+----------------+---------+
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, HEADER_SIZE};

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// 메시지 조각
    Data = 0x01,

    /// 체크포인트 확인 응답
    Ack = 0x02,

    /// 메시지 종료 + CRC32
    Checksum = 0x03,

    /// 애플리케이션 메타데이터
    Metadata = 0x04,
}

impl PacketType {
    /// 바이트에서 패킷 타입 변환
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Ack),
            0x03 => Some(Self::Checksum),
            0x04 => Some(Self::Metadata),
            _ => None,
        }
    }

    /// 제어 패킷 여부 (sequence_id = 0)
    pub const fn is_control(&self) -> bool {
        !matches!(self, Self::Data)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::from_u8(value).ok_or(Error::UnknownPacketType(value))
    }
}

/// 패킷 플래그 (비트셋)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: Self = Self(0);

    /// 메시지의 마지막 패킷
    pub const LAST_PACKET: Self = Self(1 << 0);

    /// 수신측이 ACK를 보내야 함 (체크포인트)
    pub const ACK_REQUIRED: Self = Self(1 << 1);

    /// 메타데이터 페이로드
    pub const METADATA: Self = Self(1 << 2);

    /// Base64 인코딩된 페이로드
    pub const BASE64_ENCODED: Self = Self(1 << 3);

    /// 메시지 전체가 zlib 압축됨
    pub const COMPRESSED: Self = Self(1 << 4);

    /// 정의된 비트 전체
    pub const ALL: Self = Self(0x1F);

    /// 정의되지 않은 비트가 있으면 `None`
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL.0 != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PacketFlags, &str); 5] = [
            (PacketFlags::LAST_PACKET, "LAST_PACKET"),
            (PacketFlags::ACK_REQUIRED, "ACK_REQUIRED"),
            (PacketFlags::METADATA, "METADATA"),
            (PacketFlags::BASE64_ENCODED, "BASE64_ENCODED"),
            (PacketFlags::COMPRESSED, "COMPRESSED"),
        ];

        if self.is_empty() {
            return write!(f, "NONE");
        }

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// 전송 단위 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub flags: PacketFlags,

    /// 메시지 내 1부터 시작, 제어 패킷은 0
    pub sequence_id: u16,

    /// 메시지의 총 데이터 패킷 수
    pub total_count: u16,

    pub payload: Bytes,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        flags: PacketFlags,
        sequence_id: u16,
        total_count: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            packet_type,
            flags,
            sequence_id,
            total_count,
            payload,
        }
    }

    /// 데이터 조각 패킷
    pub fn data(flags: PacketFlags, sequence_id: u16, total_count: u16, payload: Bytes) -> Self {
        Self::new(PacketType::Data, flags, sequence_id, total_count, payload)
    }

    /// `sequence_id` 체크포인트에 대한 ACK 패킷
    pub fn ack(sequence_id: u16) -> Self {
        Self::new(
            PacketType::Ack,
            PacketFlags::LAST_PACKET,
            0,
            1,
            Bytes::copy_from_slice(&sequence_id.to_le_bytes()),
        )
    }

    /// 메시지를 종료하는 체크섬 패킷
    pub fn checksum(digest: u32) -> Self {
        Self::new(
            PacketType::Checksum,
            PacketFlags::LAST_PACKET,
            0,
            1,
            Bytes::copy_from_slice(&digest.to_le_bytes()),
        )
    }

    /// 메타데이터 패킷
    pub fn metadata(payload: Bytes) -> Self {
        Self::new(
            PacketType::Metadata,
            PacketFlags::METADATA | PacketFlags::LAST_PACKET,
            0,
            1,
            payload,
        )
    }

    /// 헤더 포함 인코딩 크기
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn is_last(&self) -> bool {
        self.flags.contains(PacketFlags::LAST_PACKET)
    }

    pub fn ack_required(&self) -> bool {
        self.flags.contains(PacketFlags::ACK_REQUIRED)
    }

    /// 바이트로 직렬화
    ///
    /// MTU 제한은 호출측 책임. 페이로드가 u16 범위를 넘으면 에러.
    pub fn encode(&self) -> Result<Bytes> {
        let payload_length =
            u16::try_from(self.payload.len()).map_err(|_| Error::PayloadTooLarge {
                len: self.payload.len(),
                max: u16::MAX as usize,
            })?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.sequence_id);
        buf.put_u16_le(self.total_count);
        buf.put_u16_le(payload_length);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// 바이트에서 역직렬화
    ///
    /// `payload_length`보다 짧으면 에러, 길면 뒤쪽 패딩은 무시.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedPacket { len: bytes.len() });
        }

        let mut header = &bytes[..HEADER_SIZE];
        let packet_type = PacketType::try_from(header.get_u8())?;
        let raw_flags = header.get_u8();
        let flags = PacketFlags::from_bits(raw_flags).ok_or(Error::InvalidFlags(raw_flags))?;
        let sequence_id = header.get_u16_le();
        let total_count = header.get_u16_le();
        let payload_length = header.get_u16_le();

        let body = &bytes[HEADER_SIZE..];
        if body.len() < payload_length as usize {
            return Err(Error::PayloadLengthMismatch {
                declared: payload_length,
                actual: body.len(),
            });
        }

        Ok(Self {
            packet_type,
            flags,
            sequence_id,
            total_count,
            payload: Bytes::copy_from_slice(&body[..payload_length as usize]),
        })
    }

    /// ACK 페이로드에서 확인된 sequence_id 추출
    pub fn ack_sequence(&self) -> Result<u16> {
        if self.packet_type != PacketType::Ack {
            return Err(Error::InvalidControlPayload("ACK 패킷 아님"));
        }
        let raw = <[u8; 2]>::try_from(&self.payload[..])
            .map_err(|_| Error::InvalidControlPayload("ACK 페이로드는 2바이트"))?;
        Ok(u16::from_le_bytes(raw))
    }

    /// 체크섬 페이로드에서 CRC32 추출
    pub fn checksum_value(&self) -> Result<u32> {
        if self.packet_type != PacketType::Checksum {
            return Err(Error::InvalidControlPayload("체크섬 패킷 아님"));
        }
        let raw = <[u8; 4]>::try_from(&self.payload[..])
            .map_err(|_| Error::InvalidControlPayload("체크섬 페이로드는 4바이트"))?;
        Ok(u32::from_le_bytes(raw))
    }
}

/// 헤더 필드를 받아 바로 인코딩
pub fn encode(
    packet_type: PacketType,
    flags: PacketFlags,
    sequence_id: u16,
    total_count: u16,
    payload: &[u8],
) -> Result<Bytes> {
    Packet::new(
        packet_type,
        flags,
        sequence_id,
        total_count,
        Bytes::copy_from_slice(payload),
    )
    .encode()
}

/// [`Packet::decode`] 별칭
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    Packet::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = encode(
            PacketType::Data,
            PacketFlags::LAST_PACKET | PacketFlags::COMPRESSED,
            0x0102,
            0x0304,
            b"xyz",
        )
        .unwrap();

        assert_eq!(
            bytes.as_ref(),
            &[0x01, 0x11, 0x02, 0x01, 0x04, 0x03, 0x03, 0x00, b'x', b'y', b'z']
        );
    }

    #[test]
    fn test_packet_roundtrip() {
        let cases = [
            (PacketType::Data, PacketFlags::NONE, 1, 1, vec![]),
            (PacketType::Data, PacketFlags::ALL, u16::MAX, u16::MAX, vec![0xAA; 236]),
            (PacketType::Metadata, PacketFlags::METADATA, 0, 1, b"name=temp".to_vec()),
        ];

        for (packet_type, flags, seq, total, payload) in cases {
            let bytes = encode(packet_type, flags, seq, total, &payload).unwrap();
            let packet = decode(&bytes).unwrap();

            assert_eq!(packet.packet_type, packet_type);
            assert_eq!(packet.flags, flags);
            assert_eq!(packet.sequence_id, seq);
            assert_eq!(packet.total_count, total);
            assert_eq!(packet.payload.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_packet_roundtrip_random() {
        use rand::{Rng, RngCore};

        const TYPES: [PacketType; 4] = [
            PacketType::Data,
            PacketType::Ack,
            PacketType::Checksum,
            PacketType::Metadata,
        ];

        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let packet_type = TYPES[rng.gen_range(0..TYPES.len())];
            let flags = PacketFlags::from_bits(rng.gen::<u8>() & PacketFlags::ALL.bits()).unwrap();
            let seq: u16 = rng.gen();
            let total: u16 = rng.gen();
            let mut payload = vec![0u8; rng.gen_range(0..=512)];
            rng.fill_bytes(&mut payload);

            let bytes = encode(packet_type, flags, seq, total, &payload).unwrap();
            assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

            let packet = decode(&bytes).unwrap();
            assert_eq!(packet.packet_type, packet_type);
            assert_eq!(packet.flags, flags);
            assert_eq!(packet.sequence_id, seq);
            assert_eq!(packet.total_count, total);
            assert_eq!(packet.payload.as_ref(), payload.as_slice());
            assert_eq!(packet.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn test_truncated_packet() {
        let err = Packet::decode(&[0x01, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket { len: 3 }));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_unknown_type_and_flags() {
        let err = Packet::decode(&[0x09, 0x00, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::UnknownPacketType(0x09)));

        let err = Packet::decode(&[0x01, 0x20, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::InvalidFlags(0x20)));
    }

    #[test]
    fn test_payload_length_mismatch() {
        let mut bytes = encode(PacketType::Data, PacketFlags::NONE, 1, 1, b"abcd")
            .unwrap()
            .to_vec();
        bytes.truncate(bytes.len() - 1);

        let err = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadLengthMismatch { declared: 4, actual: 3 }
        ));

        // 뒤쪽 패딩은 잘라냄
        let mut padded = encode(PacketType::Data, PacketFlags::NONE, 1, 1, b"ab")
            .unwrap()
            .to_vec();
        padded.extend_from_slice(&[0, 0]);
        assert_eq!(Packet::decode(&padded).unwrap().payload.as_ref(), b"ab");
    }

    #[test]
    fn test_control_packets() {
        let ack = Packet::ack(5);
        let bytes = ack.encode().unwrap();
        assert_eq!(&bytes[HEADER_SIZE..], &[0x05, 0x00]);
        assert_eq!(ack.sequence_id, 0);
        assert_eq!(ack.total_count, 1);
        assert!(ack.is_last());
        assert_eq!(Packet::decode(&bytes).unwrap().ack_sequence().unwrap(), 5);

        let checksum = Packet::checksum(0xDEADBEEF);
        let bytes = checksum.encode().unwrap();
        assert_eq!(&bytes[HEADER_SIZE..], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(
            Packet::decode(&bytes).unwrap().checksum_value().unwrap(),
            0xDEADBEEF
        );

        assert!(checksum.ack_sequence().is_err());
        let short = Packet::new(PacketType::Checksum, PacketFlags::NONE, 0, 1, Bytes::from_static(b"ab"));
        assert!(matches!(
            short.checksum_value(),
            Err(Error::InvalidControlPayload(_))
        ));
    }

    #[test]
    fn test_flags_insert_remove() {
        let mut flags = PacketFlags::COMPRESSED;
        flags.insert(PacketFlags::LAST_PACKET | PacketFlags::ACK_REQUIRED);
        assert_eq!(flags.bits(), 0x13);

        flags.remove(PacketFlags::ACK_REQUIRED);
        assert!(flags.contains(PacketFlags::LAST_PACKET | PacketFlags::COMPRESSED));
        assert!(!flags.contains(PacketFlags::ACK_REQUIRED));

        // 없는 비트 제거는 무시
        flags.remove(PacketFlags::METADATA);
        assert_eq!(flags.bits(), 0x11);

        flags.remove(PacketFlags::ALL);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_control_types() {
        assert!(!PacketType::Data.is_control());
        assert!(PacketType::Ack.is_control());
        assert!(PacketType::Checksum.is_control());
        assert!(PacketType::Metadata.is_control());
        assert!(Packet::ack(3).packet_type.is_control());
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", PacketFlags::NONE), "NONE");
        assert_eq!(
            format!("{:?}", PacketFlags::LAST_PACKET | PacketFlags::ACK_REQUIRED),
            "LAST_PACKET | ACK_REQUIRED"
        );
    }
}
