//! MBP 서버 (peripheral, 수신자)
//!
//! UDP 채널을 GATT write/notify 대신 사용. 첫 데이터그램을 보낸 주소를
//! 상대로 학습하고, 체크포인트 ACK는 그 주소로 되돌려 보냄.
//!
//! 사용법:
//!   cargo run --release --bin mbp-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin mbp-server -- --bind 127.0.0.1:9000
//!
//!   # 수신 메시지를 파일에 이어 쓰기, 3개 받으면 종료
//!   cargo run --release --bin mbp-server -- -o received.bin --count 3

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mbp::{Config, ReceiverEvent, Session, UdpChannel, DEFAULT_MTU};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    mtu: usize,
    output_path: Option<PathBuf>,
    count: Option<u64>,
    verbose: bool,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            mtu: DEFAULT_MTU,
            output_path: None,
            count: None,
            verbose: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    config.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--reassembly-timeout" => {
                if i + 1 < args.len() {
                    config.config.reassembly_timeout_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--att" => {
                config.config.channel_overhead = Config::att().channel_overhead;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"MBP Server - Multiparty BLE Protocol 수신자

UDP 데이터그램 하나를 GATT write 하나로 간주하는 peripheral
- 조각 재조립 + CRC32 검증 + zlib 압축 해제
- ACK_REQUIRED 체크포인트마다 ACK 응답

사용법:
  cargo run --release --bin mbp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>            바인드 주소 (기본: 127.0.0.1:9000)
  --mtu <BYTES>                MTU (기본: 244)
  -o, --output <PATH>          수신 메시지를 이어 쓸 파일
  -n, --count <N>              N개 메시지 수신 후 종료
  --reassembly-timeout <MS>    미완성 메시지 유휴 타임아웃 (기본: 30000)
  --att                        ATT 오버헤드 3바이트 반영
  -v, --verbose                debug 로그 출력
  -h, --help                   이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_config = parse_args();

    // 로깅 설정 (RUST_LOG 우선)
    let default_level = if server_config.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("MBP Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("MTU: {} bytes", server_config.mtu);

    let channel = Arc::new(UdpChannel::bind(server_config.bind_addr, server_config.mtu).await?);
    let (mut session, mut events) = Session::attach(server_config.config.clone(), channel).await?;

    let mut output = match &server_config.output_path {
        Some(path) => {
            info!("Output file: {:?}", path);
            Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            )
        }
        None => None,
    };

    let mut received = 0u64;

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, 종료");
                break;
            }
        };

        match event {
            ReceiverEvent::Message(message) => {
                received += 1;
                info!(
                    "메시지 #{} 수신: {} bytes (wire {}, compressed={}), crc={:08X}",
                    message.message_id,
                    message.data.len(),
                    message.wire_len,
                    message.compressed,
                    message.checksum
                );

                match std::str::from_utf8(&message.data) {
                    Ok(text) if text.len() <= 256 => info!("  내용: {}", text),
                    _ => debug!("  바이너리 또는 긴 내용"),
                }

                if let Some(file) = output.as_mut() {
                    file.write_all(&message.data).await?;
                }

                if server_config.count.is_some_and(|count| received >= count) {
                    info!("{}개 메시지 수신 완료", received);
                    break;
                }
            }
            ReceiverEvent::ChecksumMismatch {
                message_id,
                expected,
                actual,
            } => {
                warn!(
                    "메시지 #{} 체크섬 불일치: expected {:08X}, got {:08X}",
                    message_id, expected, actual
                );
            }
            ReceiverEvent::Metadata { flags, payload } => {
                info!(
                    "메타데이터 수신: {} (flags={:?})",
                    String::from_utf8_lossy(&payload),
                    flags
                );
            }
            ReceiverEvent::Ack { sequence_id } => {
                debug!("ACK 수신: {}", sequence_id);
            }
            ReceiverEvent::Unhandled { packet_type } => {
                warn!("Unhandled packet type: 0x{:02X}", packet_type);
            }
            ReceiverEvent::Error(e) => {
                warn!("수신 에러: {}", e);
            }
        }
    }

    if let Some(mut file) = output {
        file.flush().await?;
    }

    session.close().await?;
    info!("Server finished: {}", session.stats().summary());

    Ok(())
}
