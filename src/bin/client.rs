//! MBP 클라이언트 (central, 송신자)
//!
//! UDP 채널로 서버에 메시지를 보냄. 압축 → 분할 → 간격 전송 → 체크섬.
//!
//! 사용법:
//!   cargo run --release --bin mbp-client -- [OPTIONS]
//!
//! 예시:
//!   # 기본 메시지 전송
//!   cargo run --release --bin mbp-client -- --server 127.0.0.1:9000
//!
//!   # 파일 전송 + 윈도우 흐름 제어
//!   cargo run --release --bin mbp-client -- -s 127.0.0.1:9000 -f data.bin --reliable

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mbp::{Config, FlowControl, Session, UdpChannel, DEFAULT_MTU};

/// 클라이언트 설정
struct ClientConfig {
    bind_addr: SocketAddr,
    server_addr: String,
    mtu: usize,
    file_path: Option<PathBuf>,
    message: Option<String>,
    metadata: Option<String>,
    repeat: usize,
    verbose: bool,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            server_addr: "127.0.0.1:9000".to_string(),
            mtu: DEFAULT_MTU,
            file_path: None,
            message: None,
            metadata: None,
            repeat: 1,
            verbose: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].clone();
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    config.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--message" | "-m" => {
                if i + 1 < args.len() {
                    config.message = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--metadata" => {
                if i + 1 < args.len() {
                    config.metadata = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--repeat" | "-n" => {
                if i + 1 < args.len() {
                    config.repeat = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--interval" => {
                if i + 1 < args.len() {
                    config.config.packet_interval_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--window" => {
                if i + 1 < args.len() {
                    config.config.window_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--no-compress" => {
                config.config.compression_enabled = false;
            }
            "--reliable" => {
                config.config.write_with_response = true;
                config.config.flow_control = FlowControl::windowed();
            }
            "--att" => {
                config.config.channel_overhead = Config::att().channel_overhead;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"MBP Client - Multiparty BLE Protocol 송신자

UDP 데이터그램 하나를 GATT write 하나로 간주하는 central
- 64바이트 초과 메시지는 zlib 압축
- MTU에 맞춰 분할, 5번째 패킷마다 ACK 요청, 마지막에 CRC32

사용법:
  cargo run --release --bin mbp-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:9000)
  --mtu <BYTES>           MTU (기본: 244)
  -f, --file <PATH>       전송할 파일
  -m, --message <TEXT>    전송할 문자열
  --metadata <TEXT>       본문 전에 메타데이터 패킷 전송
  -n, --repeat <N>        같은 메시지 N번 전송 (기본: 1)
  --interval <MS>         패킷 간격 (기본: 10)
  --window <N>            ACK 체크포인트 간격 (기본: 5)
  --no-compress           압축 비활성화
  --reliable              윈도우 흐름 제어 + write-with-response
  --att                   ATT 오버헤드 3바이트 반영
  -v, --verbose           debug 로그 출력
  -h, --help              이 도움말 출력
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
    let client_config = parse_args();

    // 로깅 설정 (RUST_LOG 우선)
    let default_level = if client_config.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("MBP Client starting...");
    info!("Server address: {}", client_config.server_addr);
    info!("MTU: {} bytes", client_config.mtu);

    // 전송할 데이터 준비
    let data = if let Some(path) = &client_config.file_path {
        info!("Loading file: {:?}", path);
        tokio::fs::read(path).await?
    } else if let Some(message) = &client_config.message {
        message.clone().into_bytes()
    } else {
        "Hello from client! ".repeat(10).into_bytes()
    };

    let channel = Arc::new(UdpChannel::bind(client_config.bind_addr, client_config.mtu).await?);
    info!("Bound to local address: {}", channel.local_addr()?);

    let (mut session, _events) = Session::open(
        client_config.config.clone(),
        channel,
        &client_config.server_addr,
    )
    .await?;

    if let Some(metadata) = &client_config.metadata {
        session.send_metadata(metadata.as_bytes()).await?;
        info!("Metadata sent: {}", metadata);
    }

    for round in 1..=client_config.repeat {
        match session.send(&data).await {
            Ok(report) => {
                info!(
                    "[{}/{}] {} bytes -> {} bytes on wire, {} 패킷, compressed={}, {:.2}ms ({:.2} KB/s)",
                    round,
                    client_config.repeat,
                    report.message_len,
                    report.bytes_on_wire,
                    report.data_packets,
                    report.compressed,
                    report.elapsed.as_secs_f64() * 1000.0,
                    report.throughput() / 1024.0
                );
            }
            Err(e) => {
                warn!("전송 실패: {}", e);
                session.close().await?;
                return Err(e.into());
            }
        }
    }

    // 마지막 ACK가 돌아올 시간
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.close().await?;
    info!("Client finished: {}", session.stats().summary());

    Ok(())
}
