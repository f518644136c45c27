//! 채널 어댑터
//!
//! 코어는 전송 계층을 모름. 순서가 보장되는 best-effort 프레임 전달과
//! 조회 가능한 MTU만 요구함. BLE GATT write/notify 쌍은 플랫폼 BLE 스택이
//! 이 트레이트를 구현해서 제공.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

pub mod memory;
pub mod udp;

pub use memory::MemoryChannel;
pub use udp::UdpChannel;

/// 수신 프레임 진입점
///
/// 채널은 프레임이 도착할 때마다 (다른 실행 컨텍스트에서라도) 이 메서드를 호출.
pub trait PacketHandler: Send + Sync {
    fn on_packet_received(&self, data: &[u8]);
}

/// 양방향 바이트 채널
#[async_trait]
pub trait Channel: Send + Sync {
    /// 대상에 연결. 타임아웃이나 거절이면 `false`
    async fn connect(&self, target: &str, timeout: Duration) -> Result<bool>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// 프레임 하나 전송
    async fn write_packet(&self, data: &[u8], with_response: bool) -> Result<()>;

    /// 수신 핸들러 등록 (기존 핸들러는 교체)
    async fn subscribe(&self, handler: Arc<dyn PacketHandler>) -> Result<()>;

    async fn unsubscribe(&self) -> Result<()>;

    /// 현재 협상된 MTU (바이트)
    async fn current_mtu(&self) -> Result<usize>;
}
