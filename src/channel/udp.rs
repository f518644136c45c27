//! UDP 데이터그램 채널
//!
//! 패킷 하나 = 데이터그램 하나. BLE 하드웨어 없이 GATT write/notify 쌍을
//! 대신하는 용도. MTU는 바인딩 시 고정.
//!
//! - central: `connect(target)`으로 상대 주소 고정
//! - peripheral: 첫 수신 데이터그램의 발신 주소를 상대로 학습

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Channel, PacketHandler};
use crate::{Error, Result};

/// 수신 루프를 포기하기 전 허용하는 연속 에러 수
const MAX_RECV_ERRORS: u32 = 16;

/// 연속 에러 `consecutive`번째 뒤의 대기 시간 (10ms부터 두 배씩, 최대 1초)
///
/// 한도를 넘으면 `None`.
fn recv_backoff(consecutive: u32) -> Option<Duration> {
    if consecutive > MAX_RECV_ERRORS {
        return None;
    }
    let ms = 10u64 << consecutive.saturating_sub(1).min(7);
    Some(Duration::from_millis(ms.min(1000)))
}

/// UDP 채널
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    mtu: usize,

    /// 상대 주소
    peer: Arc<RwLock<Option<SocketAddr>>>,

    /// 수신 루프 태스크
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpChannel {
    /// 로컬 주소에 바인딩
    pub async fn bind(addr: SocketAddr, mtu: usize) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("UDP channel bound on {}, mtu={}", socket.local_addr()?, mtu);

        Ok(Self {
            socket,
            mtu,
            peer: Arc::new(RwLock::new(None)),
            recv_task: Mutex::new(None),
        })
    }

    /// 실제 바인딩된 주소
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 현재 상대 주소
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    fn stop_recv_task(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn connect(&self, target: &str, timeout: Duration) -> Result<bool> {
        let addr = match tokio::time::timeout(timeout, tokio::net::lookup_host(target)).await {
            Ok(Ok(mut addrs)) => addrs.next(),
            Ok(Err(e)) => {
                warn!("주소 해석 실패: {}: {}", target, e);
                None
            }
            Err(_) => {
                warn!("주소 해석 타임아웃: {}", target);
                None
            }
        };

        match addr {
            Some(addr) => {
                *self.peer.write() = Some(addr);
                info!("UDP peer 설정: {}", addr);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_recv_task();
        if let Some(addr) = self.peer.write().take() {
            debug!("UDP peer 해제: {}", addr);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.peer.read().is_some()
    }

    async fn write_packet(&self, data: &[u8], _with_response: bool) -> Result<()> {
        let peer = (*self.peer.read()).ok_or(Error::NotConnected)?;

        if data.len() > self.mtu {
            return Err(Error::Channel(format!(
                "프레임이 MTU 초과: {} > {}",
                data.len(),
                self.mtu
            )));
        }

        let sent = self.socket.send_to(data, peer).await?;
        if sent != data.len() {
            return Err(Error::Channel(format!(
                "부분 전송: {}/{} bytes",
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn PacketHandler>) -> Result<()> {
        self.stop_recv_task();

        let socket = self.socket.clone();
        let peer = self.peer.clone();
        let mtu = self.mtu;

        let task = tokio::spawn(async move {
            // MTU 초과 데이터그램도 잘리지 않고 디코더까지 도달
            let mut buf = vec![0u8; mtu.max(1) * 2];
            let mut consecutive_errors = 0u32;

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        consecutive_errors = 0;
                        {
                            let mut known_peer = peer.write();
                            match *known_peer {
                                None => {
                                    info!("UDP peer 학습: {}", addr);
                                    *known_peer = Some(addr);
                                }
                                Some(known) if known != addr => {
                                    debug!("알 수 없는 발신지 무시: {}", addr);
                                    continue;
                                }
                                Some(_) => {}
                            }
                        }
                        handler.on_packet_received(&buf[..len]);
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        match recv_backoff(consecutive_errors) {
                            Some(delay) => {
                                warn!("수신 에러 ({}회 연속): {}", consecutive_errors, e);
                                tokio::time::sleep(delay).await;
                            }
                            None => {
                                warn!("수신 에러 {}회 연속, 수신 루프 종료: {}", consecutive_errors, e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        *self.recv_task.lock() = Some(task);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.stop_recv_task();
        Ok(())
    }

    async fn current_mtu(&self) -> Result<usize> {
        Ok(self.mtu)
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.stop_recv_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Vec<u8>>);

    impl PacketHandler for Forward {
        fn on_packet_received(&self, data: &[u8]) {
            let _ = self.0.send(data.to_vec());
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_central_to_peripheral_and_back() {
        let peripheral = UdpChannel::bind(loopback(), 64).await.unwrap();
        let central = UdpChannel::bind(loopback(), 64).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        peripheral.subscribe(Arc::new(Forward(tx))).await.unwrap();
        assert!(!peripheral.is_connected());

        let target = peripheral.local_addr().unwrap().to_string();
        assert!(central
            .connect(&target, Duration::from_secs(1))
            .await
            .unwrap());

        central.write_packet(b"hello", false).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"hello");

        // 첫 데이터그램으로 상대 주소 학습
        assert_eq!(peripheral.peer_addr(), Some(central.local_addr().unwrap()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        central.subscribe(Arc::new(Forward(tx))).await.unwrap();
        peripheral.write_packet(b"ack", false).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"ack");
    }

    #[test]
    fn test_recv_backoff() {
        assert_eq!(recv_backoff(1), Some(Duration::from_millis(10)));
        assert_eq!(recv_backoff(2), Some(Duration::from_millis(20)));
        assert_eq!(recv_backoff(7), Some(Duration::from_millis(640)));
        assert_eq!(recv_backoff(8), Some(Duration::from_secs(1)));
        assert_eq!(recv_backoff(MAX_RECV_ERRORS), Some(Duration::from_secs(1)));
        assert_eq!(recv_backoff(MAX_RECV_ERRORS + 1), None);
    }

    #[tokio::test]
    async fn test_write_without_peer() {
        let channel = UdpChannel::bind(loopback(), 32).await.unwrap();
        assert!(matches!(
            channel.write_packet(b"x", false).await,
            Err(Error::NotConnected)
        ));

        channel
            .connect("127.0.0.1:9", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            channel.write_packet(&[0u8; 33], false).await,
            Err(Error::Channel(_))
        ));

        channel.disconnect().await.unwrap();
        assert!(!channel.is_connected());
    }
}
