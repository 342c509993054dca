//! SLNet 채팅 서버
//!
//! 접속한 클라이언트의 문자열 메시지를 나머지 모두에게 중계
//! - ReliableOrdered 채널 0으로 중계
//! - 탐색 요청에 서버 이름으로 응답
//!
//! 사용법:
//!   cargo run --release --bin slnet-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트
//!   cargo run --release --bin slnet-server -- --port 14242
//!
//!   # 연결별 키 합의 + 체크섬
//!   cargo run --release --bin slnet-server -- -p 14242 --encrypt --checksums

use std::time::Duration;

use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use slnet::{
    ConnectionStatus, DeliveryMethod, EncryptionMode, IncomingKinds, IncomingMessageKind, Peer,
    PeerConfig,
};

/// 서버 설정
struct ServerConfig {
    name: String,
    config: PeerConfig,
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut server = ServerConfig {
        name: String::from("slnet chat"),
        config: PeerConfig::server("slnet-chat", 14242),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port = args[i + 1].parse().expect("유효한 포트 필요");
                    server.config.local_address.set_port(port);
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    server.name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--max-connections" => {
                if i + 1 < args.len() {
                    server.config.maximum_connections = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--encrypt" | "-e" => {
                server.config.encryption = EncryptionMode::Negotiated;
            }
            "--checksums" => {
                server.config.datagram_checksums = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"SLNet Chat Server

사용법:
  cargo run --release --bin slnet-server -- [OPTIONS]

옵션:
  -p, --port <PORT>         바인드 포트 (기본: 14242)
  -n, --name <NAME>         탐색 응답에 쓰는 서버 이름
  --max-connections <N>     최대 동시 연결 (기본: 32)
  -e, --encrypt             연결별 키 합의 (X25519 + ChaCha20-Poly1305)
  --checksums               데이터그램 CRC32 검증
  -h, --help                이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    server.config.enable(IncomingKinds::DISCOVERY_REQUEST);
    server
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server = parse_args();
    info!("SLNet Server starting...");
    info!("Encryption: {:?}", server.config.encryption);

    let mut peer = Peer::new(server.config)?;
    let addr = peer.start()?;
    info!("Server listening on {}", addr);

    loop {
        let Some(mut message) = peer.wait_message(Duration::from_millis(100)) else {
            continue;
        };

        match message.kind().clone() {
            IncomingMessageKind::StatusChanged { status, reason } => {
                let Some(from) = message.sender_endpoint() else {
                    continue;
                };
                info!("{} → {:?} ({})", from, status, reason);

                let notice = match status {
                    ConnectionStatus::Connected | ConnectionStatus::ConnectedSecured => {
                        format!("* {} joined", from)
                    }
                    ConnectionStatus::Disconnected => format!("* {} left ({})", from, reason),
                    _ => continue,
                };
                let others: Vec<_> = peer
                    .connections()
                    .into_iter()
                    .filter(|c| c.remote_endpoint() != from)
                    .collect();
                if others.is_empty() {
                    continue;
                }
                let mut out = peer.create_message();
                out.write_string(&notice);
                if let Err(e) = peer.send_message_to_many(out, &others, DeliveryMethod::ReliableOrdered, 0) {
                    debug!("알림 전송 생략: {}", e);
                }
            }
            IncomingMessageKind::Data => {
                let Some(sender) = message.sender().cloned() else {
                    continue;
                };
                let text = match message.read_string() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("{} 잘못된 메시지: {}", sender.remote_endpoint(), e);
                        continue;
                    }
                };
                info!("{}: {}", sender.remote_endpoint(), text);

                let others: Vec<_> = peer
                    .connections()
                    .into_iter()
                    .filter(|c| *c != sender)
                    .collect();
                if !others.is_empty() {
                    let mut out = peer.create_message();
                    out.write_string(&format!("{}: {}", sender.remote_endpoint(), text));
                    if let Err(e) =
                        peer.send_message_to_many(out, &others, DeliveryMethod::ReliableOrdered, 0)
                    {
                        warn!("중계 실패: {}", e);
                    }
                }
                peer.recycle(message);
            }
            IncomingMessageKind::DiscoveryRequest => {
                let Some(from) = message.sender_endpoint() else {
                    continue;
                };
                debug!("탐색 요청: {}", from);
                let mut out = peer.create_message();
                out.write_string(&server.name);
                out.write_u32(peer.connections_count() as u32);
                if let Err(e) = peer.send_discovery_response(out, from) {
                    warn!("탐색 응답 실패: {}", e);
                }
            }
            IncomingMessageKind::WarningMessage(text) | IncomingMessageKind::ErrorMessage(text) => {
                warn!("{}", text);
            }
            other => debug!("무시: {:?}", other),
        }
    }
}
