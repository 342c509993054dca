//! SLNet 채팅 클라이언트
//!
//! 표준 입력 한 줄을 서버로 보내고, 서버가 중계한 메시지를 출력
//!
//! 사용법:
//!   cargo run --release --bin slnet-client -- [OPTIONS]
//!
//! 예시:
//!   # 서버 지정
//!   cargo run --release --bin slnet-client -- --server 127.0.0.1:14242
//!
//!   # 로컬 네트워크에서 서버 탐색 후 접속
//!   cargo run --release --bin slnet-client -- --discover 14242

use std::io::BufRead;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, TryRecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use slnet::{
    Connection, ConnectionStatus, DeliveryMethod, EncryptionMode, IncomingKinds,
    IncomingMessageKind, Peer, PeerConfig,
};

/// 클라이언트 설정
struct ClientConfig {
    server_addr: Option<SocketAddr>,
    discover_port: Option<u16>,
    hail: Option<String>,
    config: PeerConfig,
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut client = ClientConfig {
        server_addr: None,
        discover_port: None,
        hail: None,
        config: PeerConfig::new("slnet-chat"),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    client.server_addr = Some(args[i + 1].parse().expect("유효한 주소 필요"));
                    i += 1;
                }
            }
            "--discover" | "-d" => {
                if i + 1 < args.len() {
                    client.discover_port = Some(args[i + 1].parse().expect("유효한 포트 필요"));
                    i += 1;
                }
            }
            "--hail" => {
                if i + 1 < args.len() {
                    client.hail = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--encrypt" | "-e" => {
                client.config.encryption = EncryptionMode::Negotiated;
            }
            "--checksums" => {
                client.config.datagram_checksums = true;
            }
            "--loss" => {
                if i + 1 < args.len() {
                    client.config.simulated_loss = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"SLNet Chat Client

사용법:
  cargo run --release --bin slnet-client -- [OPTIONS]

옵션:
  -s, --server <ADDR>       서버 주소 (기본: 127.0.0.1:14242)
  -d, --discover <PORT>     브로드캐스트 탐색으로 서버 찾기
  --hail <TEXT>             핸드쉐이크에 실어 보낼 문자열
  -e, --encrypt             연결별 키 합의 (서버도 --encrypt 필요)
  --checksums               데이터그램 CRC32 검증 (서버와 동일해야 함)
  --loss <RATIO>            테스트용 송신 손실률 0.0~1.0
  -h, --help                이 도움말 출력

입력한 줄은 서버로 전송됨. /quit 으로 종료.
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    client.config.enable(IncomingKinds::DISCOVERY_RESPONSE);
    client
}

/// 탐색 응답을 기다려 첫 서버 주소 반환
fn discover(peer: &Peer, port: u16) -> Option<SocketAddr> {
    if let Err(e) = peer.discover_local_peers(port) {
        warn!("탐색 실패: {}", e);
        return None;
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        let Some(mut message) = peer.wait_message(Duration::from_millis(100)) else {
            continue;
        };
        if *message.kind() != IncomingMessageKind::DiscoveryResponse {
            continue;
        }
        let name = message.read_string().unwrap_or_default();
        let users = message.read_u32().unwrap_or(0);
        let from = message.sender_endpoint()?;
        info!("서버 발견: {} at {} ({} users)", name, from, users);
        return Some(from);
    }
    None
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = parse_args();
    let mut peer = Peer::new(client.config)?;
    peer.start()?;

    let server_addr = match (client.server_addr, client.discover_port) {
        (Some(addr), _) => addr,
        (None, Some(port)) => match discover(&peer, port) {
            Some(addr) => addr,
            None => {
                warn!("서버를 찾지 못함");
                return Ok(());
            }
        },
        (None, None) => "127.0.0.1:14242".parse()?,
    };

    let hail = client.hail.map(|text| {
        let mut message = peer.create_message();
        message.write_string(&text);
        message
    });
    let connection: Connection = peer.connect(server_addr, hail)?;
    info!("Connecting to {}...", server_addr);

    // 입력 스레드
    let (line_tx, line_rx) = unbounded::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        while let Some(mut message) = peer.wait_message(Duration::from_millis(20)) {
            match message.kind().clone() {
                IncomingMessageKind::StatusChanged { status, reason } => {
                    info!("상태: {:?} ({})", status, reason);
                    if status == ConnectionStatus::Disconnected {
                        peer.shutdown("bye");
                        return Ok(());
                    }
                }
                IncomingMessageKind::Data => match message.read_string() {
                    Ok(text) => println!("{}", text),
                    Err(e) => warn!("잘못된 메시지: {}", e),
                },
                IncomingMessageKind::WarningMessage(text) | IncomingMessageKind::ErrorMessage(text) => {
                    warn!("{}", text);
                }
                other => debug!("무시: {:?}", other),
            }
        }

        match line_rx.try_recv() {
            Ok(line) if line.trim() == "/quit" => {
                connection.disconnect("user quit");
            }
            Ok(line) => {
                if !connection.status().is_connected() {
                    warn!("아직 연결되지 않음");
                    continue;
                }
                let mut message = peer.create_message();
                message.write_string(&line);
                if let Err(e) = peer.send_message(message, &connection, DeliveryMethod::ReliableOrdered, 0) {
                    warn!("전송 실패: {}", e);
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                connection.disconnect("input closed");
            }
        }
    }
}
