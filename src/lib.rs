//! # MBP (Multiparty BLE Protocol)
//!
//! MTU 제한이 있는 BLE GATT write/notify 채널 위의 패킷 프레이밍/조각화/재조립 프로토콜
//!
//! ## 핵심 특징
//! - **고정 헤더**: 8바이트 리틀 엔디언 헤더 + 가변 페이로드
//! - **조각화**: 메시지를 `MTU - 헤더` 크기의 Data 패킷으로 분할
//! - **압축**: 64바이트 초과 메시지는 zlib 압축, 작아질 때만 채택
//! - **무결성**: 메시지 끝에 CRC32 체크섬 패킷 하나
//! - **체크포인트 ACK**: `window_size`번째 패킷마다 ACK 요청
//! - **흐름 제어**: 기본은 advisory, 선택적으로 윈도우 기반 백프레셔
//! - **채널 추상화**: BLE 스택은 [`channel::Channel`] 구현으로 주입

pub mod channel;
pub mod checksum;
pub mod compress;
pub mod config;
pub mod error;
pub mod fragment;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;

pub use channel::{Channel, MemoryChannel, PacketHandler, UdpChannel};
pub use config::{Config, FlowControl};
pub use error::{Error, Result};
pub use fragment::{Fragmenter, MessageId, ReassemblyBuffer};
pub use packet::{Packet, PacketFlags, PacketType};
pub use receiver::{CompletedMessage, EventReceiver, Inbound, Reassembler, Receiver, ReceiverEvent};
pub use sender::{AckTracker, SendPhase, Sender};
pub use session::Session;
pub use stats::{TransferReport, TransferStats};

/// 고정 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 8;

/// 기본 MTU (바이트)
pub const DEFAULT_MTU: usize = 244;

/// 기본 ACK 체크포인트 간격 (패킷 수)
pub const DEFAULT_WINDOW_SIZE: u16 = 5;

/// 이 크기를 초과하는 메시지만 압축 시도 (바이트)
pub const COMPRESSION_THRESHOLD: usize = 64;

/// 기본 패킷 전송 간격 (밀리초)
pub const DEFAULT_PACKET_INTERVAL_MS: u64 = 10;
