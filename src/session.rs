//! 세션
//!
//! 채널 하나에 송신자와 수신자를 묶은 호출자 소유 객체.
//! 수명: `open` (또는 `attach`) → `send` / 이벤트 수신 → `close`

use std::sync::Arc;

use tracing::{info, warn};

use crate::channel::Channel;
use crate::receiver::{EventReceiver, Receiver};
use crate::sender::{AckTracker, Sender};
use crate::stats::{TransferReport, TransferStats};
use crate::{Config, Error, Result};

/// MBP 세션
pub struct Session {
    channel: Arc<dyn Channel>,
    sender: Sender,
    receiver: Receiver,
    closed: bool,
}

impl Session {
    /// 대상에 연결한 뒤 세션 시작 (central 역할)
    pub async fn open(
        config: Config,
        channel: Arc<dyn Channel>,
        target: &str,
    ) -> Result<(Self, EventReceiver)> {
        let connected = channel.connect(target, config.connect_timeout()).await?;
        if !connected {
            warn!("연결 실패: {}", target);
            return Err(Error::ConnectFailed {
                target: target.to_string(),
            });
        }
        info!("연결됨: {}", target);

        Self::attach(config, channel).await
    }

    /// 이미 연결된 (또는 상대를 기다리는) 채널로 세션 시작 (peripheral 역할)
    pub async fn attach(config: Config, channel: Arc<dyn Channel>) -> Result<(Self, EventReceiver)> {
        let acks = Arc::new(AckTracker::new());
        let (receiver, events) = Receiver::start(config.clone(), channel.clone(), acks.clone()).await?;
        let sender = Sender::new(config, channel.clone(), acks);

        let session = Self {
            channel,
            sender,
            receiver,
            closed: false,
        };
        Ok((session, events))
    }

    /// 메시지 전송
    pub async fn send(&self, data: &[u8]) -> Result<TransferReport> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.sender.send(data).await
    }

    /// 메타데이터 전송
    pub async fn send_metadata(&self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.sender.send_metadata(payload).await
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.channel.is_connected()
    }

    /// 송신 + 수신 통계
    pub fn stats(&self) -> TransferStats {
        let mut stats = self.sender.get_stats();
        stats.merge(&self.receiver.get_stats());
        stats
    }

    /// 수신 중단, 구독 해제, 연결 종료
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.receiver.stop().await;
        self.channel.unsubscribe().await?;
        self.channel.disconnect().await?;

        info!("세션 종료: {}", self.stats().summary());
        Ok(())
    }
}
