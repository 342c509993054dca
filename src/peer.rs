//! 피어: 사용자 스레드 API + 네트워크 스레드
//!
//! 모든 연결 상태는 네트워크 스레드가 소유. 사용자 스레드는 명령을 보내고
//! 수신 큐에서 메시지를 꺼내며, 공개 테이블로 연결을 조회함.

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, CodecRegistry, CompressionAlgorithm};
use crate::config::PeerConfig;
use crate::connection::Connection;
use crate::context::{default_agreement_factory, AgreementFactory, Command, CommandSink, PeerEvent, PeerShared};
use crate::core::PeerCore;
use crate::crypto::KeyAgreement;
use crate::message::{DeliveryMethod, IncomingMessage, OutgoingMessage};
use crate::stats::PeerStatistics;
use crate::upnp::Upnp;
use crate::wire::MESSAGE_HEADER_MAX_BYTES;
use crate::{checksum, Error, Result};

/// 수신 버퍼 크기 (UDP 최대 페이로드)
const RECEIVE_BUFFER_SIZE: usize = 65536;

/// 피어 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    NotRunning,
    Running,
    ShutdownRequested,
}

/// SLNet 피어
pub struct Peer {
    shared: Arc<PeerShared>,
    sink: Arc<CommandSink>,
    codecs: CodecRegistry,
    upnp: Option<Arc<dyn Upnp>>,
    agreement_factory: AgreementFactory,
    status: Arc<RwLock<PeerStatus>>,
    local_address: Option<SocketAddr>,
    unique_id: Option<u64>,
    thread: Option<JoinHandle<()>>,
}

impl Peer {
    /// 설정 검증 후 생성 (아직 소켓을 열지 않음)
    pub fn new(config: PeerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PeerShared::new(config)),
            sink: Arc::new(CommandSink::new()),
            codecs: CodecRegistry::new(),
            upnp: None,
            agreement_factory: default_agreement_factory(),
            status: Arc::new(RwLock::new(PeerStatus::NotRunning)),
            local_address: None,
            unique_id: None,
            thread: None,
        })
    }

    pub fn with_codec(mut self, algorithm: CompressionAlgorithm, codec: Arc<dyn Codec>) -> Self {
        self.codecs.register(algorithm, codec);
        self
    }

    pub fn with_upnp(mut self, upnp: Arc<dyn Upnp>) -> Self {
        self.upnp = Some(upnp);
        self
    }

    /// 기본 X25519 대신 사용할 키 합의
    pub fn with_key_agreement<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn KeyAgreement> + Send + Sync + 'static,
    {
        self.agreement_factory = Arc::new(factory);
        self
    }

    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// 바인드된 주소 (시작 후)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_address
    }

    pub fn unique_id(&self) -> Option<u64> {
        self.unique_id
    }

    /// 소켓 바인드 후 네트워크 스레드 시작
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.thread.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let config = &self.shared.config;
        if let Some(algorithm) = config.compression {
            if !self.codecs.contains(algorithm) {
                return Err(Error::CodecMissing(algorithm));
            }
        }

        let socket = StdUdpSocket::bind(config.local_address)?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        let local_address = socket.local_addr()?;

        let core = PeerCore::new(
            self.shared.clone(),
            self.sink.clone(),
            local_address,
            self.codecs.clone(),
            self.agreement_factory.clone(),
            self.upnp.clone(),
            Instant::now(),
        );
        let unique_id = core.unique_id();

        let sink = self.sink.clone();
        let status = self.status.clone();
        let heartbeat = config.heartbeat_interval;
        *self.status.write() = PeerStatus::Running;

        let spawned = std::thread::Builder::new()
            .name(config.network_thread_name.clone())
            .spawn(move || {
                network_thread(core, socket, sink, heartbeat);
                *status.write() = PeerStatus::NotRunning;
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                *self.status.write() = PeerStatus::NotRunning;
                return Err(e.into());
            }
        };

        info!(
            "피어 시작: {} (id {:016X}, {})",
            local_address, unique_id, config.app_identifier
        );
        self.thread = Some(thread);
        self.local_address = Some(local_address);
        self.unique_id = Some(unique_id);
        Ok(local_address)
    }

    /// 모든 연결에 사유를 보내고 네트워크 스레드 종료까지 대기
    pub fn shutdown(&mut self, reason: &str) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        *self.status.write() = PeerStatus::ShutdownRequested;
        self.sink.post(Command::Shutdown {
            reason: reason.to_string(),
        });
        if thread.join().is_err() {
            error!("네트워크 스레드 패닉");
        }
        *self.status.write() = PeerStatus::NotRunning;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status() != PeerStatus::Running {
            return Err(Error::NotRunning);
        }
        Ok(())
    }

    /// 풀에서 저장소를 빌린 송신 메시지
    pub fn create_message(&self) -> OutgoingMessage {
        self.create_message_with_capacity(64)
    }

    pub fn create_message_with_capacity(&self, bytes: usize) -> OutgoingMessage {
        OutgoingMessage::pooled(&self.shared.pool, bytes)
    }

    /// 원격 피어에 연결 시작. 결과는 상태 변경 알림으로 전달됨
    pub fn connect(&self, endpoint: SocketAddr, hail: Option<OutgoingMessage>) -> Result<Connection> {
        self.ensure_running()?;
        if self.shared.connections.contains_key(&endpoint)
            || self.shared.handshakes.contains_key(&endpoint)
        {
            return Err(Error::AlreadyConnected(endpoint));
        }

        let connection = Connection::new(endpoint, self.sink.clone());
        self.sink.post(Command::Connect {
            connection: connection.clone(),
            hail: hail.map(|h| h.as_bytes().to_vec()),
        });
        Ok(connection)
    }

    /// 연결된 상대에게 메시지 전송. 메시지는 소비됨
    pub fn send_message(
        &self,
        message: OutgoingMessage,
        recipient: &Connection,
        method: DeliveryMethod,
        sequence_channel: u8,
    ) -> Result<()> {
        method.validate_channel(sequence_channel)?;
        if !recipient.status().is_connected() {
            return Err(Error::ConnectionClosed);
        }
        self.post_send(message, vec![recipient.clone()], method, sequence_channel)
    }

    /// 여러 상대에게 같은 메시지 전송. 연결되지 않은 상대는 제외
    pub fn send_message_to_many(
        &self,
        message: OutgoingMessage,
        recipients: &[Connection],
        method: DeliveryMethod,
        sequence_channel: u8,
    ) -> Result<()> {
        method.validate_channel(sequence_channel)?;
        let recipients: Vec<Connection> = recipients
            .iter()
            .filter(|c| c.status().is_connected())
            .cloned()
            .collect();
        if recipients.is_empty() {
            return Err(Error::NoRecipients);
        }
        self.post_send(message, recipients, method, sequence_channel)
    }

    fn post_send(
        &self,
        message: OutgoingMessage,
        recipients: Vec<Connection>,
        method: DeliveryMethod,
        channel: u8,
    ) -> Result<()> {
        self.ensure_running()?;
        let (payload, pool) = message.into_parts();
        self.sink.post(Command::Send {
            payload,
            pool,
            recipients,
            method,
            channel,
        });
        Ok(())
    }

    /// 연결 없는 단일 데이터그램 메시지가 들어갈 수 있는지
    fn check_unfragmented(&self, message: &OutgoingMessage) -> Result<()> {
        let config = &self.shared.config;
        let mut budget = config.maximum_transmission_unit;
        if config.datagram_checksums {
            budget -= checksum::CHECKSUM_SIZE;
        }
        let size = message.length_bytes() + MESSAGE_HEADER_MAX_BYTES;
        if size > budget {
            return Err(Error::MessageTooLarge { size, mtu: budget });
        }
        Ok(())
    }

    /// 연결 없이 전송 (분할 불가, 재전송 없음)
    pub fn send_unconnected_message(&self, message: OutgoingMessage, endpoint: SocketAddr) -> Result<()> {
        self.ensure_running()?;
        self.check_unfragmented(&message)?;
        self.shared.unconnected.enqueue((endpoint, message));
        self.sink.wake();
        Ok(())
    }

    /// 로컬 네트워크에 탐색 요청 브로드캐스트
    pub fn discover_local_peers(&self, port: u16) -> Result<()> {
        let endpoint = SocketAddr::new(self.shared.config.broadcast_ip(), port);
        self.discover_known_peer(endpoint)
    }

    /// 알려진 주소에 탐색 요청
    pub fn discover_known_peer(&self, endpoint: SocketAddr) -> Result<()> {
        self.ensure_running()?;
        debug!("탐색 요청 → {}", endpoint);
        self.sink.post(Command::Discover { endpoint });
        Ok(())
    }

    /// 탐색 요청에 응답
    pub fn send_discovery_response(&self, message: OutgoingMessage, endpoint: SocketAddr) -> Result<()> {
        self.ensure_running()?;
        self.check_unfragmented(&message)?;
        let (payload, _pool) = message.into_parts();
        self.sink.post(Command::DiscoveryResponse { endpoint, payload });
        Ok(())
    }

    /// 대기 없이 수신 메시지 하나
    pub fn read_message(&self) -> Option<IncomingMessage> {
        self.shared.incoming.try_dequeue()
    }

    /// 메시지가 올 때까지 최대 `timeout` 대기
    pub fn wait_message(&self, timeout: Duration) -> Option<IncomingMessage> {
        self.shared.incoming.wait_dequeue(timeout)
    }

    /// 다 읽은 메시지의 저장소를 풀로 반환
    pub fn recycle(&self, message: IncomingMessage) {
        self.shared.pool.recycle(message.into_buffer().into_storage());
    }

    pub fn get_connection(&self, endpoint: &SocketAddr) -> Option<Connection> {
        self.shared.connections.get(endpoint).map(|c| c.value().clone())
    }

    pub fn get_connection_by_id(&self, unique_id: u64) -> Option<Connection> {
        self.shared
            .connections_by_id
            .get(&unique_id)
            .map(|c| c.value().clone())
    }

    /// 연결 완료된 연결 목록
    pub fn connections(&self) -> Vec<Connection> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connections_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// 네트워크 스레드가 마지막으로 게시한 통계
    pub fn statistics(&self) -> PeerStatistics {
        self.shared.statistics.read().clone()
    }

    /// 상태/지연 변경 이벤트 구독
    pub fn subscribe(&self) -> Receiver<PeerEvent> {
        self.shared.subscribe()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown("peer dropped");
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("app_identifier", &self.shared.config.app_identifier)
            .field("local_address", &self.local_address)
            .field("status", &self.status())
            .finish()
    }
}

/// 네트워크 스레드 본체: 전용 current-thread 런타임에서 루프 실행
fn network_thread(core: PeerCore, socket: StdUdpSocket, sink: Arc<CommandSink>, heartbeat: Duration) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("네트워크 런타임 생성 실패: {}", e);
            return;
        }
    };

    if let Err(e) = runtime.block_on(network_loop(core, socket, sink, heartbeat)) {
        error!("네트워크 루프 종료: {}", e);
    }
}

async fn network_loop(
    mut core: PeerCore,
    socket: StdUdpSocket,
    sink: Arc<CommandSink>,
    heartbeat: Duration,
) -> Result<()> {
    let socket = UdpSocket::from_std(socket)?;
    core.bind_network_thread();

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => core.receive_datagram(from, &buf[..len], Instant::now()),
                // ICMP 도달 불가 등은 연결 타임아웃에 맡김
                Err(e) => debug!("수신 에러: {}", e),
            },
            _ = sink.notified() => {}
            _ = ticker.tick() => {}
        }

        let running = core.pump(Instant::now());
        for (to, datagram) in core.take_outbox() {
            if let Err(e) = socket.send_to(&datagram, to).await {
                warn!("{} 송신 실패: {}", to, e);
            }
        }
        if !running {
            break;
        }
    }

    debug!("네트워크 루프 정상 종료");
    Ok(())
}
