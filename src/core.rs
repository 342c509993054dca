//! 피어 코어 (네트워크 스레드 상태)
//!
//! 소켓을 직접 다루지 않음. 네트워크 루프가 받은 데이터그램과 현재 시간을 넣고,
//! 쌓인 송신 데이터그램을 꺼내 소켓으로 보냄. 테스트는 두 코어를 메모리에서 연결.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::buffer::BitBuffer;
use crate::checksum;
use crate::codec::CodecRegistry;
use crate::config::EncryptionMode;
use crate::connection::{Connection, ConnectionCore, ConnectionStatus, Outcome};
use crate::context::{AgreementFactory, Command, CommandSink, PeerContext, PeerShared};
use crate::message::{DeliveryMethod, IncomingMessage, IncomingMessageKind, MessageType};
use crate::pool::MessagePool;
use crate::upnp::Upnp;
use crate::wire::{self, ConnectPayload, ReceivedMessage};

/// UPnP 탐색 후 포트 포워딩까지 대기 시간
const UPNP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

enum UpnpState {
    Idle,
    Discovering { since: Instant },
    Done,
}

/// 네트워크 스레드의 피어 상태
pub(crate) struct PeerCore {
    ctx: PeerContext,
    connections: HashMap<SocketAddr, ConnectionCore>,
    handshakes: HashMap<SocketAddr, ConnectionCore>,
    upnp: Option<Arc<dyn Upnp>>,
    upnp_state: UpnpState,
    network_thread: Option<ThreadId>,
    running: bool,
    commands: Vec<Command>,
}

fn lookup<'a>(
    connections: &'a mut HashMap<SocketAddr, ConnectionCore>,
    handshakes: &'a mut HashMap<SocketAddr, ConnectionCore>,
    endpoint: &SocketAddr,
) -> Option<&'a mut ConnectionCore> {
    match connections.get_mut(endpoint) {
        Some(connection) => Some(connection),
        None => handshakes.get_mut(endpoint),
    }
}

impl PeerCore {
    pub fn new(
        shared: Arc<PeerShared>,
        sink: Arc<CommandSink>,
        local_address: SocketAddr,
        codecs: CodecRegistry,
        agreement_factory: AgreementFactory,
        upnp: Option<Arc<dyn Upnp>>,
        now: Instant,
    ) -> Self {
        let ctx = PeerContext::new(shared, sink, local_address, codecs, agreement_factory, now);
        Self {
            ctx,
            connections: HashMap::new(),
            handshakes: HashMap::new(),
            upnp,
            upnp_state: UpnpState::Idle,
            network_thread: None,
            running: true,
            commands: Vec::new(),
        }
    }

    pub fn unique_id(&self) -> u64 {
        self.ctx.unique_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// 이후 호출은 현재 스레드에서만 허용
    pub fn bind_network_thread(&mut self) {
        self.network_thread = Some(std::thread::current().id());
    }

    fn verify_network_thread(&self) {
        if let Some(expected) = self.network_thread {
            debug_assert_eq!(
                std::thread::current().id(),
                expected,
                "네트워크 스레드 밖에서 피어 코어 접근"
            );
        }
    }

    pub fn take_outbox(&mut self) -> Vec<(SocketAddr, Bytes)> {
        self.ctx.take_outbox()
    }

    /// 받은 데이터그램 처리
    pub fn receive_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        self.verify_network_thread();
        self.ctx.statistics.received_packets += 1;
        self.ctx.statistics.received_bytes += data.len() as u64;

        let body = if self.ctx.config.datagram_checksums {
            match checksum::strip(data) {
                Some(len) => &data[..len],
                None => {
                    warn!("{}에서 체크섬 불일치 데이터그램", from);
                    self.ctx.statistics.malformed_packets += 1;
                    if lookup(&mut self.connections, &mut self.handshakes, &from).is_some() {
                        self.disconnect(from, "checksum mismatch", true);
                    }
                    return;
                }
            }
        } else {
            data
        };

        let messages = match wire::decode_datagram(body) {
            Ok(messages) => messages,
            Err(e) => {
                debug!("{}에서 해석 불가 데이터그램: {}", from, e);
                self.ctx.statistics.malformed_packets += 1;
                return;
            }
        };

        if let Some(connection) = lookup(&mut self.connections, &mut self.handshakes, &from) {
            connection.record_received_datagram(data.len());
        }

        for message in messages {
            self.dispatch(from, message, now);
        }
        self.flush_all();
    }

    fn dispatch(&mut self, from: SocketAddr, mut message: ReceivedMessage, now: Instant) {
        let kind = match message.message_type {
            MessageType::Unconnected => Some(IncomingMessageKind::UnconnectedData),
            MessageType::Discovery => Some(IncomingMessageKind::DiscoveryRequest),
            MessageType::DiscoveryResponse => Some(IncomingMessageKind::DiscoveryResponse),
            _ => None,
        };
        if let Some(kind) = kind {
            let mut incoming = IncomingMessage::new(kind, message.payload).with_endpoint(from);
            if let Some(connection) = self.connections.get(&from) {
                incoming = incoming.with_sender(connection.handle().clone());
            }
            self.ctx.release(incoming);
            return;
        }

        let outcome = match lookup(&mut self.connections, &mut self.handshakes, &from) {
            Some(connection) => connection.receive(message, now, &mut self.ctx),
            None => {
                if message.message_type == MessageType::Connect {
                    match ConnectPayload::read(&mut message.payload) {
                        Ok(payload) => self.accept_connect(from, payload, now),
                        Err(e) => {
                            debug!("{}에서 잘못된 Connect: {}", from, e);
                            self.reject(from, "malformed handshake");
                        }
                    }
                } else {
                    trace!("{}: 연결 없는 {:?} 무시", from, message.message_type);
                }
                return;
            }
        };
        self.apply_outcome(from, outcome, now);
    }

    fn reject(&mut self, to: SocketAddr, reason: &str) {
        debug!("{} 연결 거부: {}", to, reason);
        let mut buffer = BitBuffer::with_capacity(reason.len() + 2);
        buffer.write_string(reason);
        self.ctx.send_control(to, MessageType::Disconnect, buffer);
    }

    /// 모르는 엔드포인트의 Connect
    fn accept_connect(&mut self, from: SocketAddr, payload: ConnectPayload, now: Instant) {
        if payload.app_identifier != self.ctx.config.app_identifier {
            self.reject(from, "wrong application identifier");
            return;
        }
        if !self.ctx.config.accept_incoming_connections {
            self.reject(from, "not accepting connections");
            return;
        }
        if self.connections.len() + self.handshakes.len() >= self.ctx.config.maximum_connections {
            self.reject(from, "server full");
            return;
        }

        info!("{}에서 연결 요청", from);
        let handle = Connection::new(from, self.ctx.sink.clone());
        self.ctx.shared.handshakes.insert(from, handle.clone());
        let (connection, outcome) = ConnectionCore::incoming(handle, payload, now, &mut self.ctx);
        self.handshakes.insert(from, connection);
        self.apply_outcome(from, outcome, now);
    }

    fn apply_outcome(&mut self, endpoint: SocketAddr, outcome: Outcome, now: Instant) {
        match outcome {
            Outcome::Continue => {}
            Outcome::Established => {
                if let Some(connection) = self.handshakes.remove(&endpoint) {
                    self.ctx.publish_established(connection.handle());
                    self.connections.insert(endpoint, connection);
                }
            }
            Outcome::Disconnect {
                reason,
                notify_remote,
            } => self.disconnect(endpoint, &reason, notify_remote),
            Outcome::Reconnect(payload) => {
                self.disconnect(endpoint, "reconnecting", false);
                self.accept_connect(endpoint, payload, now);
            }
        }
    }

    /// 연결 종료 후 모든 테이블에서 제거
    fn disconnect(&mut self, endpoint: SocketAddr, reason: &str, notify_remote: bool) {
        let removed = match self.connections.remove(&endpoint) {
            Some(connection) => Some(connection),
            None => self.handshakes.remove(&endpoint),
        };
        let Some(mut connection) = removed else {
            return;
        };

        connection.execute_disconnect(reason, notify_remote, &mut self.ctx);
        self.ctx.publish_removed(connection.handle());
    }

    /// 명령 처리 + 주기 작업. 종료 후 false
    pub fn pump(&mut self, now: Instant) -> bool {
        self.verify_network_thread();

        let mut commands = std::mem::take(&mut self.commands);
        self.ctx.sink.drain(&mut commands);
        for command in commands.drain(..) {
            self.execute(command, now);
            if !self.running {
                break;
            }
        }
        self.commands = commands;
        if !self.running {
            return false;
        }

        let mut unconnected = Vec::new();
        self.ctx.shared.unconnected.try_drain(&mut unconnected);
        for (endpoint, message) in unconnected {
            let (buffer, pool) = message.into_parts();
            let copy = BitBuffer::from_bytes(buffer.as_bytes().to_vec(), buffer.bit_length());
            self.ctx.send_control(endpoint, MessageType::Unconnected, copy);
            if let Some(pool) = pool {
                pool.recycle(buffer.into_storage());
            }
        }

        self.heartbeat(now);
        true
    }

    fn execute(&mut self, command: Command, now: Instant) {
        match command {
            Command::Connect { connection, hail } => {
                let endpoint = connection.remote_endpoint();
                if lookup(&mut self.connections, &mut self.handshakes, &endpoint).is_some() {
                    warn!("{}: 이미 연결 중", endpoint);
                    self.ctx
                        .notify_status(&connection, ConnectionStatus::Disconnected, "already connected");
                    return;
                }
                self.ctx.shared.handshakes.insert(endpoint, connection.clone());
                let core = ConnectionCore::outgoing(connection, hail, now, &mut self.ctx);
                self.handshakes.insert(endpoint, core);
            }
            Command::Send {
                payload,
                pool,
                recipients,
                method,
                channel,
            } => self.send_message(payload, pool, &recipients, method, channel),
            Command::Approve { endpoint, hail } => {
                if let Some(connection) = self.handshakes.get_mut(&endpoint) {
                    let outcome = connection.approve(hail, now, &mut self.ctx);
                    self.apply_outcome(endpoint, outcome, now);
                }
            }
            Command::Deny { endpoint, reason } => {
                if self
                    .handshakes
                    .get(&endpoint)
                    .is_some_and(ConnectionCore::is_awaiting_approval)
                {
                    self.disconnect(endpoint, &reason, true);
                }
            }
            Command::Disconnect { endpoint, reason } => self.disconnect(endpoint, &reason, true),
            Command::Discover { endpoint } => {
                self.ctx
                    .send_control(endpoint, MessageType::Discovery, BitBuffer::new());
            }
            Command::DiscoveryResponse { endpoint, payload } => {
                self.ctx
                    .send_control(endpoint, MessageType::DiscoveryResponse, payload);
            }
            Command::Shutdown { reason } => self.shutdown(&reason),
        }
    }

    /// 수신자들의 채널 큐에 추가. 정적 키 모드는 인코딩 결과를 공유
    fn send_message(
        &mut self,
        payload: BitBuffer,
        pool: Option<MessagePool>,
        recipients: &[Connection],
        method: DeliveryMethod,
        channel: u8,
    ) {
        let targets: Vec<SocketAddr> = recipients
            .iter()
            .map(Connection::remote_endpoint)
            .filter(|endpoint| self.connections.contains_key(endpoint))
            .collect();
        if targets.is_empty() {
            debug!("연결된 수신자 없음: 메시지 폐기");
            return;
        }

        let mtu = targets
            .iter()
            .filter_map(|endpoint| self.connections.get(endpoint).map(ConnectionCore::mtu))
            .min()
            .unwrap_or(self.ctx.config.maximum_transmission_unit);

        if self.ctx.config.encryption == EncryptionMode::Negotiated {
            for endpoint in &targets {
                let Some(connection) = self.connections.get_mut(endpoint) else {
                    continue;
                };
                let encoded = match self
                    .ctx
                    .encode_payload(connection.cipher(&self.ctx), payload.clone())
                {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("{} 메시지 인코딩 실패: {}", endpoint, e);
                        continue;
                    }
                };
                let queued = self.ctx.prepare(encoded, pool.as_ref(), mtu);
                connection.enqueue(method, channel, queued);
            }
            return;
        }

        let encoded = match self.ctx.encode_payload(self.ctx.static_cipher(), payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("메시지 인코딩 실패: {}", e);
                self.ctx.release_warning(format!("메시지 인코딩 실패: {}", e));
                return;
            }
        };
        let queued = self.ctx.prepare(encoded, pool.as_ref(), mtu);
        for endpoint in &targets {
            if let Some(connection) = self.connections.get_mut(endpoint) {
                connection.enqueue(method, channel, queued.clone());
            }
        }
    }

    /// 모든 연결의 주기 작업
    pub fn heartbeat(&mut self, now: Instant) {
        self.verify_network_thread();

        let endpoints: Vec<SocketAddr> = self
            .handshakes
            .keys()
            .chain(self.connections.keys())
            .copied()
            .collect();
        for endpoint in endpoints {
            let Some(connection) = lookup(&mut self.connections, &mut self.handshakes, &endpoint)
            else {
                continue;
            };
            let outcome = connection.heartbeat(now, &mut self.ctx);
            self.apply_outcome(endpoint, outcome, now);
        }

        self.flush_all();
        self.upnp_tick(now);
        self.ctx
            .publish_statistics(self.connections.len(), self.handshakes.len());
    }

    fn flush_all(&mut self) {
        for connection in self.handshakes.values_mut().chain(self.connections.values_mut()) {
            connection.flush(&mut self.ctx);
        }
    }

    fn upnp_tick(&mut self, now: Instant) {
        if !self.ctx.config.enable_upnp {
            return;
        }
        let Some(upnp) = self.upnp.clone() else {
            return;
        };

        match self.upnp_state {
            UpnpState::Idle => {
                debug!("UPnP 게이트웨이 탐색 시작");
                upnp.discover();
                self.upnp_state = UpnpState::Discovering { since: now };
            }
            UpnpState::Discovering { since } => {
                if now.saturating_duration_since(since) < UPNP_DISCOVERY_TIMEOUT {
                    return;
                }
                self.upnp_state = UpnpState::Done;
                let port = self.ctx.local_address.port();
                let description = self.ctx.config.app_identifier.clone();
                // 포워딩 요청은 네트워크 스레드를 막지 않도록 별도 스레드에서
                std::thread::spawn(move || {
                    if upnp.forward_port(port, &description) {
                        info!("UPnP 포트 포워딩 성공: {} (external {:?})", port, upnp.external_ip());
                    } else {
                        warn!("UPnP 포트 포워딩 실패: {}", port);
                    }
                });
            }
            UpnpState::Done => {}
        }
    }

    /// 모든 연결을 사유와 함께 닫고 종료 상태로
    pub fn shutdown(&mut self, reason: &str) {
        info!("피어 종료: {}", reason);
        let endpoints: Vec<SocketAddr> = self
            .handshakes
            .keys()
            .chain(self.connections.keys())
            .copied()
            .collect();
        for endpoint in endpoints {
            self.disconnect(endpoint, reason, true);
        }
        self.ctx.publish_statistics(0, 0);
        self.running = false;
    }

    #[cfg(test)]
    fn connection(&self, endpoint: &SocketAddr) -> Option<&ConnectionCore> {
        self.connections
            .get(endpoint)
            .or_else(|| self.handshakes.get(endpoint))
    }
}
