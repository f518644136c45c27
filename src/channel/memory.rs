//! 프로세스 내 루프백 채널
//!
//! `pair()`로 만든 두 끝점은 서로 연결되어 있고, 한쪽의 write는 같은 호출
//! 안에서 순서대로 상대 핸들러에 전달됨. 테스트와 데모용.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{Channel, PacketHandler};
use crate::{Error, Result};

/// 한쪽 끝점의 공유 상태
struct Endpoint {
    handler: RwLock<Option<Arc<dyn PacketHandler>>>,
    connected: AtomicBool,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            connected: AtomicBool::new(true),
        }
    }

    fn deliver(&self, data: &[u8]) -> bool {
        // 핸들러 호출 중에는 락을 잡지 않음
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                handler.on_packet_received(data);
                true
            }
            None => false,
        }
    }
}

/// 루프백 채널 끝점
pub struct MemoryChannel {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
    mtu: AtomicUsize,

    /// 이 끝점이 쓴 프레임 기록
    written: Mutex<Vec<Bytes>>,

    /// 이 횟수만큼 쓴 뒤부터 write 실패 (usize::MAX면 무제한)
    write_budget: AtomicUsize,
}

impl MemoryChannel {
    /// 연결된 두 끝점 생성
    pub fn pair(mtu: usize) -> (Self, Self) {
        let a = Arc::new(Endpoint::new());
        let b = Arc::new(Endpoint::new());

        (Self::new(a.clone(), b.clone(), mtu), Self::new(b, a, mtu))
    }

    fn new(local: Arc<Endpoint>, peer: Arc<Endpoint>, mtu: usize) -> Self {
        Self {
            local,
            peer,
            mtu: AtomicUsize::new(mtu),
            written: Mutex::new(Vec::new()),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// MTU 재협상 흉내
    pub fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::SeqCst);
    }

    /// `count`번 성공한 뒤의 write는 모두 실패
    pub fn fail_writes_after(&self, count: usize) {
        let already = self.written.lock().len();
        self.write_budget.store(already + count, Ordering::SeqCst);
    }

    /// 지금까지 쓴 프레임
    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    /// 상대가 보낸 것처럼 로컬 핸들러에 프레임 전달
    pub fn inject_inbound(&self, data: &[u8]) -> bool {
        self.local.deliver(data)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn connect(&self, target: &str, _timeout: Duration) -> Result<bool> {
        trace!(peer = target, "memory channel connect");
        self.local.connected.store(true, Ordering::SeqCst);
        self.peer.connected.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        self.local.connected.store(false, Ordering::SeqCst);
        self.peer.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.local.connected.load(Ordering::SeqCst)
    }

    async fn write_packet(&self, data: &[u8], _with_response: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mtu = self.mtu.load(Ordering::SeqCst);
        if data.len() > mtu {
            return Err(Error::Channel(format!(
                "프레임이 MTU 초과: {} > {}",
                data.len(),
                mtu
            )));
        }

        {
            let mut written = self.written.lock();
            if written.len() >= self.write_budget.load(Ordering::SeqCst) {
                return Err(Error::Channel("write 실패 (주입됨)".into()));
            }
            written.push(Bytes::copy_from_slice(data));
        }

        if !self.peer.deliver(data) {
            trace!(len = data.len(), "구독자 없음, 프레임 폐기");
        }
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn PacketHandler>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        *self.local.handler.write() = Some(handler);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.local.handler.write().take();
        Ok(())
    }

    async fn current_mtu(&self) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(self.mtu.load(Ordering::SeqCst))
    }
}
