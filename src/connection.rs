//! 연결 상태 머신
//!
//! `Connection`은 사용자 스레드에 주는 핸들 (상태 조회 + 명령 전달),
//! `ConnectionCore`는 네트워크 스레드만 다루는 실제 연결 상태.
//!
//! 핸드쉐이크:
//! ```text
//! 시작측                          응답측
//! InitiatedConnect --Connect-->   (승인 대기) → RespondedConnect
//!                  <--ConnectResponse--
//! Connected        --ConnectionEstablished--> Connected
//! ```
//! 응답측은 ConnectionEstablished가 유실되어도 첫 데이터 수신 시 연결 완료로 봄.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::buffer::BitBuffer;
use crate::chunk::FragmentAssembler;
use crate::config::EncryptionMode;
use crate::context::{Command, CommandSink, PeerContext};
use crate::crypto::{KeyAgreement, MessageCipher, PUBLIC_KEY_SIZE};
use crate::message::{
    DeliveryMethod, IncomingMessage, IncomingMessageKind, MessageType, OutgoingMessage, CHANNEL_SLOTS,
};
use crate::receiver::{Arrival, ReceiverChannel};
use crate::sender::{QueuedMessage, ResendPolicy, SenderChannel};
use crate::stats::{ConnectionStatistics, RttEstimator};
use crate::wire::{self, ConnectPayload, ReceivedMessage, WireMessage, ACK_ENTRY_BYTES, MESSAGE_HEADER_MAX_BYTES};
use crate::Result;

/// 연결 상태
///
/// 한 연결의 상태는 되돌아가지 않음. 재연결은 새 연결로 처리됨.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    None,
    InitiatedConnect,
    RespondedConnect,
    Connected,
    /// 연결 완료 + 사용자 메시지 암호화
    ConnectedSecured,
    Disconnecting,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::ConnectedSecured)
    }

    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnectionStatus::None
                | ConnectionStatus::InitiatedConnect
                | ConnectionStatus::RespondedConnect
        )
    }
}

/// 네트워크 스레드가 갱신하는 핸들 정보
#[derive(Debug, Clone)]
struct ConnectionInfo {
    status: ConnectionStatus,
    remote_unique_id: Option<u64>,
    average_rtt: Option<f64>,
    remote_time_offset: f64,
    remote_hail: Option<Vec<u8>>,
    disconnect_reason: Option<String>,
    statistics: ConnectionStatistics,
}

struct ConnectionShared {
    remote_endpoint: SocketAddr,
    info: RwLock<ConnectionInfo>,
    sink: Arc<CommandSink>,
}

/// 원격 피어와의 연결 핸들
///
/// 복제해도 같은 연결을 가리킴. 조작은 명령으로 네트워크 스레드에 전달됨.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    pub(crate) fn new(remote_endpoint: SocketAddr, sink: Arc<CommandSink>) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                remote_endpoint,
                info: RwLock::new(ConnectionInfo {
                    status: ConnectionStatus::None,
                    remote_unique_id: None,
                    average_rtt: None,
                    remote_time_offset: 0.0,
                    remote_hail: None,
                    disconnect_reason: None,
                    statistics: ConnectionStatistics::default(),
                }),
                sink,
            }),
        }
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.shared.remote_endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.info.read().status
    }

    /// 핸드쉐이크로 받은 상대 고유 ID
    pub fn remote_unique_id(&self) -> Option<u64> {
        self.shared.info.read().remote_unique_id
    }

    /// 평활 평균 왕복 시간
    pub fn average_rtt(&self) -> Option<Duration> {
        self.shared
            .info
            .read()
            .average_rtt
            .map(Duration::from_secs_f64)
    }

    /// 상대 시계 - 로컬 시계 (초)
    pub fn remote_time_offset(&self) -> f64 {
        self.shared.info.read().remote_time_offset
    }

    /// 상대가 핸드쉐이크에 실어 보낸 hail 메시지
    pub fn remote_hail(&self) -> Option<BitBuffer> {
        self.shared
            .info
            .read()
            .remote_hail
            .as_deref()
            .map(BitBuffer::from_slice)
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.shared.info.read().disconnect_reason.clone()
    }

    pub fn statistics(&self) -> ConnectionStatistics {
        self.shared.info.read().statistics.clone()
    }

    /// 승인 대기 중인 연결 수락
    pub fn approve(&self) {
        self.shared.sink.post(Command::Approve {
            endpoint: self.remote_endpoint(),
            hail: None,
        });
    }

    /// hail 메시지와 함께 수락
    pub fn approve_with_hail(&self, hail: OutgoingMessage) {
        self.shared.sink.post(Command::Approve {
            endpoint: self.remote_endpoint(),
            hail: Some(hail.as_bytes().to_vec()),
        });
    }

    /// 승인 대기 중인 연결 거절
    pub fn deny(&self, reason: impl Into<String>) {
        self.shared.sink.post(Command::Deny {
            endpoint: self.remote_endpoint(),
            reason: reason.into(),
        });
    }

    /// 연결 종료 요청. 상대에게 사유가 전달됨
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.shared.sink.post(Command::Disconnect {
            endpoint: self.remote_endpoint(),
            reason: reason.into(),
        });
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus, reason: &str) {
        let mut info = self.shared.info.write();
        info.status = status;
        if status == ConnectionStatus::Disconnected {
            info.disconnect_reason = Some(reason.to_string());
        }
    }

    fn update(&self, apply: impl FnOnce(&mut ConnectionInfo)) {
        apply(&mut self.shared.info.write());
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_endpoint", &self.shared.remote_endpoint)
            .field("status", &self.status())
            .finish()
    }
}

/// 연결 처리 결과. 테이블 이동은 피어 코어가 수행
#[derive(Debug)]
pub(crate) enum Outcome {
    Continue,
    Established,
    Disconnect { reason: String, notify_remote: bool },
    /// 같은 엔드포인트의 새 핸드쉐이크. 기존 연결을 닫고 새로 수락
    Reconnect(ConnectPayload),
}

impl Outcome {
    fn disconnect(reason: impl Into<String>, notify_remote: bool) -> Self {
        Outcome::Disconnect {
            reason: reason.into(),
            notify_remote,
        }
    }
}

/// 네트워크 스레드의 연결 상태
pub(crate) struct ConnectionCore {
    handle: Connection,
    endpoint: SocketAddr,
    status: ConnectionStatus,
    is_initiator: bool,
    mtu: usize,

    remote_unique_id: Option<u64>,
    remote_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    remote_connect_timestamp: f64,
    local_hail: Option<Vec<u8>>,

    agreement: Option<Box<dyn KeyAgreement>>,
    cipher: Option<MessageCipher>,

    awaiting_approval: bool,
    handshake_attempts: u32,
    last_handshake_sent: Instant,
    created_at: Instant,

    senders: Vec<Option<SenderChannel>>,
    receivers: Vec<Option<ReceiverChannel>>,
    pending_acks: Vec<(u8, u16)>,
    fragments: FragmentAssembler,
    outgoing: Vec<WireMessage>,

    rtt: RttEstimator,
    remote_time_offset: f64,
    last_heard: Instant,
    next_ping: Instant,
    ping_number: u8,
    last_ping_sent: Instant,

    statistics: ConnectionStatistics,
}

impl ConnectionCore {
    fn base(handle: Connection, now: Instant, ctx: &PeerContext) -> Self {
        Self {
            endpoint: handle.remote_endpoint(),
            handle,
            status: ConnectionStatus::None,
            is_initiator: false,
            mtu: ctx.config.maximum_transmission_unit,
            remote_unique_id: None,
            remote_public_key: None,
            remote_connect_timestamp: 0.0,
            local_hail: None,
            agreement: None,
            cipher: None,
            awaiting_approval: false,
            handshake_attempts: 0,
            last_handshake_sent: now,
            created_at: now,
            senders: (0..CHANNEL_SLOTS).map(|_| None).collect(),
            receivers: (0..CHANNEL_SLOTS).map(|_| None).collect(),
            pending_acks: Vec::new(),
            fragments: FragmentAssembler::new(),
            outgoing: Vec::new(),
            rtt: RttEstimator::new(),
            remote_time_offset: 0.0,
            last_heard: now,
            next_ping: now,
            ping_number: 0,
            last_ping_sent: now,
            statistics: ConnectionStatistics::default(),
        }
    }

    /// 로컬에서 시작하는 연결. Connect 전송
    pub fn outgoing(
        handle: Connection,
        hail: Option<Vec<u8>>,
        now: Instant,
        ctx: &mut PeerContext,
    ) -> Self {
        let mut core = Self::base(handle, now, ctx);
        core.is_initiator = true;
        core.local_hail = hail;
        if ctx.config.encryption == EncryptionMode::Negotiated {
            core.agreement = Some(ctx.new_agreement());
        }

        info!("{}에 연결 시도", core.endpoint);
        core.set_status(ConnectionStatus::InitiatedConnect, "connecting", ctx);
        core.send_handshake(MessageType::Connect, now, ctx);
        core
    }

    /// 상대가 시작한 연결. 승인 모드면 대기, 아니면 바로 응답
    pub fn incoming(
        handle: Connection,
        payload: ConnectPayload,
        now: Instant,
        ctx: &mut PeerContext,
    ) -> (Self, Outcome) {
        let mut core = Self::base(handle, now, ctx);
        core.apply_remote(&payload);

        if ctx.config.approval_required() {
            core.awaiting_approval = true;
            debug!("{} 연결 승인 대기", core.endpoint);
            let buffer = BitBuffer::from_slice(payload.hail.as_deref().unwrap_or_default());
            ctx.release(
                IncomingMessage::new(IncomingMessageKind::ConnectionApproval, buffer)
                    .with_sender(core.handle.clone()),
            );
            return (core, Outcome::Continue);
        }

        let outcome = core.respond(now, ctx);
        (core, outcome)
    }

    pub fn handle(&self) -> &Connection {
        &self.handle
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    #[cfg(test)]
    pub(crate) fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// 아직 송신되지 않은 채널 큐의 (참조 수, 바이트)
    #[cfg(test)]
    pub(crate) fn queued_payloads(&self) -> Vec<(usize, Vec<u8>)> {
        self.senders
            .iter()
            .flatten()
            .flat_map(|sender| sender.queued())
            .map(|queued| (queued.payload.recycling_count(), queued.payload.bytes().to_vec()))
            .collect()
    }

    pub fn is_awaiting_approval(&self) -> bool {
        self.awaiting_approval
    }

    /// 큐에 있거나 확인 대기 중인 송신 메시지 수
    pub fn pending_count(&self) -> usize {
        self.senders.iter().flatten().map(SenderChannel::pending_count).sum()
    }

    /// 현재 암호화 모드에서 사용자 메시지에 쓸 암호화기
    pub fn cipher<'a>(&'a self, ctx: &'a PeerContext) -> Option<&'a MessageCipher> {
        match ctx.config.encryption {
            EncryptionMode::Disabled => None,
            EncryptionMode::StaticKey(_) => ctx.static_cipher(),
            EncryptionMode::Negotiated => self.cipher.as_ref(),
        }
    }

    fn apply_remote(&mut self, payload: &ConnectPayload) {
        self.remote_unique_id = Some(payload.unique_id);
        self.remote_public_key = payload.public_key;
        self.remote_connect_timestamp = payload.timestamp;
        let hail = payload.hail.clone();
        let id = payload.unique_id;
        self.handle.update(|info| {
            info.remote_unique_id = Some(id);
            info.remote_hail = hail;
        });
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: &str, ctx: &PeerContext) {
        if self.status == status {
            return;
        }
        self.status = status;
        ctx.notify_status(&self.handle, status, reason);
    }

    fn push_control(&mut self, message_type: MessageType, payload: BitBuffer) {
        self.outgoing.push(WireMessage::control(message_type, payload));
    }

    fn send_handshake(&mut self, message_type: MessageType, now: Instant, ctx: &PeerContext) {
        let payload = ConnectPayload {
            app_identifier: ctx.config.app_identifier.clone(),
            unique_id: ctx.unique_id,
            timestamp: ctx.local_time(now),
            public_key: self.agreement.as_ref().map(|a| a.public_key()),
            hail: self.local_hail.clone(),
        };
        trace!("{:?} → {} (attempt {})", message_type, self.endpoint, self.handshake_attempts + 1);
        self.push_control(message_type, payload.to_buffer());
        self.last_handshake_sent = now;
        self.handshake_attempts += 1;
    }

    fn send_established(&mut self, now: Instant, ctx: &PeerContext) {
        let mut buffer = BitBuffer::with_capacity(8);
        buffer.write_f64(ctx.local_time(now));
        self.push_control(MessageType::ConnectionEstablished, buffer);
    }

    /// 상대 공개키로 연결 키 생성
    fn derive_cipher(&mut self, ctx: &PeerContext) -> std::result::Result<(), String> {
        if ctx.config.encryption != EncryptionMode::Negotiated {
            return Ok(());
        }
        let Some(remote_key) = self.remote_public_key else {
            return Err("상대가 키 합의를 지원하지 않음".into());
        };
        let agreement = self.agreement.get_or_insert_with(|| ctx.new_agreement());
        let secret = agreement
            .shared_secret(&remote_key)
            .map_err(|e| e.to_string())?;
        self.cipher = Some(MessageCipher::new(&secret));
        Ok(())
    }

    fn respond(&mut self, now: Instant, ctx: &mut PeerContext) -> Outcome {
        if let Err(reason) = self.derive_cipher(ctx) {
            return Outcome::disconnect(reason, true);
        }
        self.awaiting_approval = false;
        self.handshake_attempts = 0;
        self.set_status(ConnectionStatus::RespondedConnect, "responding", ctx);
        self.send_handshake(MessageType::ConnectResponse, now, ctx);
        Outcome::Continue
    }

    /// 애플리케이션의 승인
    pub fn approve(&mut self, hail: Option<Vec<u8>>, now: Instant, ctx: &mut PeerContext) -> Outcome {
        if !self.awaiting_approval {
            debug!("{}: 승인 대기 중이 아님", self.endpoint);
            return Outcome::Continue;
        }
        self.local_hail = hail;
        self.respond(now, ctx)
    }

    fn establish(&mut self, now: Instant, remote_timestamp: Option<f64>, ctx: &PeerContext) {
        let rtt = now
            .saturating_duration_since(self.last_handshake_sent)
            .as_secs_f64();
        self.rtt.record(rtt);
        if let Some(remote) = remote_timestamp {
            self.remote_time_offset = remote + rtt / 2.0 - ctx.local_time(now);
        }

        self.last_heard = now;
        self.next_ping = now + ctx.config.ping_interval;
        self.agreement = None;

        let average = self.rtt.average();
        let offset = self.remote_time_offset;
        self.handle.update(|info| {
            info.average_rtt = average;
            info.remote_time_offset = offset;
        });

        let status = if self.cipher(ctx).is_some() {
            ConnectionStatus::ConnectedSecured
        } else {
            ConnectionStatus::Connected
        };
        info!("{} 연결 완료 ({:?})", self.endpoint, status);
        self.set_status(status, "connected", ctx);
    }

    /// 데이터그램에서 나온 메시지 하나 처리
    pub fn receive(&mut self, mut message: ReceivedMessage, now: Instant, ctx: &mut PeerContext) -> Outcome {
        self.last_heard = now;

        match message.message_type {
            MessageType::Connect => self.receive_connect(message, now, ctx),
            MessageType::ConnectResponse => self.receive_connect_response(message, now, ctx),
            MessageType::ConnectionEstablished => {
                if self.status != ConnectionStatus::RespondedConnect {
                    return Outcome::Continue;
                }
                let remote = message.payload.read_f64().ok();
                self.establish(now, remote, ctx);
                Outcome::Established
            }
            MessageType::Disconnect => {
                let reason = message
                    .payload
                    .read_string()
                    .unwrap_or_else(|_| "disconnected".to_string());
                Outcome::disconnect(reason, false)
            }
            MessageType::LibraryError => {
                let text = message.payload.read_string().unwrap_or_default();
                warn!("{} 라이브러리 에러 수신: {}", self.endpoint, text);
                ctx.release(
                    IncomingMessage::new(IncomingMessageKind::ErrorMessage(text), BitBuffer::new())
                        .with_sender(self.handle.clone()),
                );
                Outcome::Continue
            }
            _ => self.receive_connected(message, now, ctx),
        }
    }

    fn receive_connect(&mut self, mut message: ReceivedMessage, now: Instant, ctx: &mut PeerContext) -> Outcome {
        let payload = match ConnectPayload::read(&mut message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} 잘못된 Connect: {}", self.endpoint, e);
                return Outcome::disconnect("malformed handshake", true);
            }
        };

        match self.status {
            // 응답 유실: 같은 항목으로 다시 응답
            ConnectionStatus::RespondedConnect => {
                self.send_handshake(MessageType::ConnectResponse, now, ctx);
                Outcome::Continue
            }
            // 동시 연결: 상대 요청을 받아들여 응답측으로 전환
            ConnectionStatus::InitiatedConnect => {
                if payload.app_identifier != ctx.config.app_identifier {
                    return Outcome::disconnect("wrong application identifier", true);
                }
                self.apply_remote(&payload);
                self.respond(now, ctx)
            }
            ConnectionStatus::Connected | ConnectionStatus::ConnectedSecured => {
                let margin = ctx.config.resend_handshake_interval.as_secs_f64()
                    * ctx.config.maximum_handshake_attempts as f64;
                let new_identity = Some(payload.unique_id) != self.remote_unique_id;
                let new_session = payload.timestamp > self.remote_connect_timestamp + margin;
                if new_identity || new_session {
                    info!("{} 재연결 요청", self.endpoint);
                    Outcome::Reconnect(payload)
                } else {
                    trace!("{} 중복 Connect 무시", self.endpoint);
                    Outcome::Continue
                }
            }
            _ => Outcome::Continue,
        }
    }

    fn receive_connect_response(
        &mut self,
        mut message: ReceivedMessage,
        now: Instant,
        ctx: &mut PeerContext,
    ) -> Outcome {
        match self.status {
            // 상대가 우리 응답을 못 받음
            ConnectionStatus::RespondedConnect if !self.is_initiator => {
                self.send_handshake(MessageType::ConnectResponse, now, ctx);
                Outcome::Continue
            }
            // 동시 연결이면 응답측으로 전환했어도 상대 응답으로 연결 완료
            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {
                let payload = match ConnectPayload::read(&mut message.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("{} 잘못된 ConnectResponse: {}", self.endpoint, e);
                        return Outcome::disconnect("malformed handshake", true);
                    }
                };
                if payload.app_identifier != ctx.config.app_identifier {
                    return Outcome::disconnect("wrong application identifier", true);
                }

                self.apply_remote(&payload);
                if let Err(reason) = self.derive_cipher(ctx) {
                    return Outcome::disconnect(reason, true);
                }

                self.send_established(now, ctx);
                self.establish(now, Some(payload.timestamp), ctx);
                Outcome::Established
            }
            ConnectionStatus::Connected | ConnectionStatus::ConnectedSecured => {
                // ConnectionEstablished 유실
                if self.is_initiator {
                    self.send_established(now, ctx);
                }
                Outcome::Continue
            }
            _ => Outcome::Continue,
        }
    }

    fn receive_connected(&mut self, mut message: ReceivedMessage, now: Instant, ctx: &mut PeerContext) -> Outcome {
        let mut outcome = Outcome::Continue;
        if self.status == ConnectionStatus::RespondedConnect {
            debug!("{} ConnectionEstablished 없이 데이터 수신: 연결 완료 처리", self.endpoint);
            self.establish(now, None, ctx);
            outcome = Outcome::Established;
        }
        if !self.status.is_connected() {
            trace!("{} 연결 전 메시지 무시: {:?}", self.endpoint, message.message_type);
            return outcome;
        }

        match message.message_type {
            MessageType::Ping => {
                if let Ok(number) = message.payload.read_u8() {
                    let mut pong = BitBuffer::with_capacity(9);
                    pong.write_u8(number);
                    pong.write_f64(ctx.local_time(now));
                    self.push_control(MessageType::Pong, pong);
                }
            }
            MessageType::Pong => self.receive_pong(message, now, ctx),
            MessageType::Acknowledge => self.receive_acknowledge(message),
            MessageType::User { .. } => {
                if let Err(e) = self.receive_user(message, now, ctx) {
                    warn!("{} 메시지 처리 실패: {}", self.endpoint, e);
                    return Outcome::disconnect(e.to_string(), true);
                }
            }
            other => ctx.warn_unsupported(self.endpoint, &format!("{:?}", other)),
        }
        outcome
    }

    fn receive_pong(&mut self, mut message: ReceivedMessage, now: Instant, ctx: &PeerContext) {
        let (Ok(number), Ok(remote_time)) = (message.payload.read_u8(), message.payload.read_f64()) else {
            return;
        };
        if number != self.ping_number.wrapping_sub(1) {
            trace!("{} 오래된 pong 무시: {}", self.endpoint, number);
            return;
        }

        let rtt = now.saturating_duration_since(self.last_ping_sent).as_secs_f64();
        self.rtt.record(rtt);
        self.remote_time_offset = remote_time + rtt / 2.0 - ctx.local_time(now);

        let average = self.rtt.average();
        let offset = self.remote_time_offset;
        self.handle.update(|info| {
            info.average_rtt = average;
            info.remote_time_offset = offset;
        });
        ctx.notify_latency(&self.handle, average.unwrap_or(rtt));
    }

    fn receive_acknowledge(&mut self, mut message: ReceivedMessage) {
        let entries = match wire::read_acks(&mut message.payload) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("{} 잘못된 확인 메시지: {}", self.endpoint, e);
                return;
            }
        };

        for entry in entries {
            let Some(slot) = MessageType::from_code(entry.code)
                .ok()
                .and_then(MessageType::channel_slot)
            else {
                continue;
            };
            if let Some(sender) = self.senders[slot].as_mut() {
                for sequence in entry.sequences() {
                    sender.receive_acknowledge(sequence);
                }
            }
        }
    }

    fn receive_user(&mut self, message: ReceivedMessage, now: Instant, ctx: &mut PeerContext) -> Result<()> {
        let MessageType::User { method, .. } = message.message_type else {
            return Ok(());
        };
        let Some(slot) = message.message_type.channel_slot() else {
            return Ok(());
        };

        let code = message.message_type.code();
        let sequence = message.sequence;
        let mut released = Vec::new();
        let arrival = self.receivers[slot]
            .get_or_insert_with(|| ReceiverChannel::new(method))
            .receive(message, &mut released);

        if method.is_reliable() && arrival.should_acknowledge() {
            self.pending_acks.push((code, sequence));
        }
        match arrival {
            Arrival::Duplicate => self.statistics.dropped_duplicates += 1,
            Arrival::Stale | Arrival::TooEarly => self.statistics.dropped_stale += 1,
            Arrival::Delivered | Arrival::Buffered => {}
        }

        for message in released {
            self.deliver(message, now, ctx)?;
        }
        Ok(())
    }

    fn deliver(&mut self, message: ReceivedMessage, now: Instant, ctx: &PeerContext) -> Result<()> {
        let payload = match message.fragment {
            Some(header) => {
                self.statistics.received_fragments += 1;
                match self.fragments.receive(&header, message.payload.as_bytes(), now)? {
                    Some(complete) => complete,
                    None => return Ok(()),
                }
            }
            None => message.payload,
        };

        let payload = ctx.decode_payload(self.cipher(ctx), payload)?;
        self.statistics.received_messages += 1;
        ctx.release(
            IncomingMessage::new(IncomingMessageKind::Data, payload)
                .with_sender(self.handle.clone())
                .with_type(message.message_type, message.sequence),
        );
        Ok(())
    }

    /// 준비된 메시지를 채널 큐에 추가
    pub fn enqueue(&mut self, method: DeliveryMethod, channel: u8, messages: Vec<QueuedMessage>) {
        let Some(slot) = MessageType::user(method, channel).channel_slot() else {
            return;
        };
        let sender = self.senders[slot].get_or_insert_with(|| SenderChannel::new(method, channel));
        for message in messages {
            sender.enqueue(message);
        }
    }

    /// 주기 작업: 핸드쉐이크 재전송, 핑, 타임아웃, 확인, 채널 송신
    pub fn heartbeat(&mut self, now: Instant, ctx: &mut PeerContext) -> Outcome {
        match self.status {
            ConnectionStatus::None => {
                if now.saturating_duration_since(self.created_at) >= ctx.config.connection_timeout {
                    return Outcome::disconnect("approval timed out", true);
                }
                Outcome::Continue
            }
            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {
                if now.saturating_duration_since(self.last_handshake_sent)
                    < ctx.config.resend_handshake_interval
                {
                    return Outcome::Continue;
                }
                if self.handshake_attempts >= ctx.config.maximum_handshake_attempts {
                    return Outcome::disconnect("no response from remote host", false);
                }
                let message_type = if self.status == ConnectionStatus::InitiatedConnect {
                    MessageType::Connect
                } else {
                    MessageType::ConnectResponse
                };
                self.send_handshake(message_type, now, ctx);
                Outcome::Continue
            }
            ConnectionStatus::Connected | ConnectionStatus::ConnectedSecured => {
                self.heartbeat_connected(now, ctx)
            }
            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected => Outcome::Continue,
        }
    }

    fn heartbeat_connected(&mut self, now: Instant, ctx: &mut PeerContext) -> Outcome {
        if now.saturating_duration_since(self.last_heard) >= ctx.config.connection_timeout {
            return Outcome::disconnect("connection timed out", true);
        }

        if now >= self.next_ping {
            let mut ping = BitBuffer::with_capacity(1);
            ping.write_u8(self.ping_number);
            self.ping_number = self.ping_number.wrapping_add(1);
            self.push_control(MessageType::Ping, ping);
            self.last_ping_sent = now;
            self.next_ping = now + ctx.config.ping_interval;
        }

        if !self.pending_acks.is_empty() {
            let entries = wire::pack_acks(&self.pending_acks);
            self.pending_acks.clear();
            let per_message = ((ctx.datagram_budget(self.mtu) - MESSAGE_HEADER_MAX_BYTES)
                / ACK_ENTRY_BYTES)
                .max(1);
            for batch in entries.chunks(per_message) {
                self.push_control(MessageType::Acknowledge, wire::write_acks(batch));
            }
        }

        let policy = ResendPolicy {
            delay: self
                .rtt
                .resend_delay(ctx.config.resend_base_delay, ctx.config.resend_rtt_multiplier),
            max_attempts: ctx.config.max_resend_attempts,
        };
        for sender in self.senders.iter_mut().flatten() {
            match sender.send_queued(now, policy, &mut self.outgoing) {
                Ok(report) => {
                    self.statistics.sent_messages += report.sent as u64;
                    self.statistics.resent_messages += report.resent as u64;
                }
                Err(failure) => {
                    warn!(
                        "{} 재전송 한도 초과: seq {} ({}회)",
                        self.endpoint, failure.sequence, failure.attempts
                    );
                    return Outcome::disconnect("too many resends", true);
                }
            }
        }

        self.fragments.expire(now, ctx.config.fragment_group_timeout);
        self.publish_statistics();
        Outcome::Continue
    }

    /// 쌓인 메시지를 데이터그램으로 묶어 전송
    pub fn flush(&mut self, ctx: &mut PeerContext) {
        if self.outgoing.is_empty() {
            return;
        }
        let budget = ctx.datagram_budget(self.mtu);
        for datagram in wire::pack_datagrams(&self.outgoing, budget) {
            self.statistics.sent_packets += 1;
            self.statistics.sent_bytes += datagram.len() as u64;
            ctx.emit(self.endpoint, datagram);
        }
        self.outgoing.clear();
    }

    pub fn record_received_datagram(&mut self, bytes: usize) {
        self.statistics.received_packets += 1;
        self.statistics.received_bytes += bytes as u64;
    }

    fn publish_statistics(&mut self) {
        self.statistics.pending_messages = self.pending_count() as u64;
        let snapshot = self.statistics.clone();
        self.handle.update(|info| info.statistics = snapshot);
    }

    /// 연결 종료. 채널을 비우고 Disconnected로 전환
    pub fn execute_disconnect(&mut self, reason: &str, notify_remote: bool, ctx: &mut PeerContext) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }

        if notify_remote {
            self.outgoing.clear();
            let mut buffer = BitBuffer::with_capacity(reason.len() + 2);
            buffer.write_string(reason);
            self.push_control(MessageType::Disconnect, buffer);
            self.flush(ctx);
            self.set_status(ConnectionStatus::Disconnecting, reason, ctx);
        }

        for sender in self.senders.iter_mut().flatten() {
            sender.reset();
        }
        for receiver in self.receivers.iter_mut().flatten() {
            receiver.reset();
        }
        self.pending_acks.clear();
        self.fragments.clear();
        self.outgoing.clear();
        self.agreement = None;
        self.publish_statistics();

        info!("{} 연결 종료: {}", self.endpoint, reason);
        self.set_status(ConnectionStatus::Disconnected, reason, ctx);
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status)
            .field("pending", &self.pending_count())
            .finish()
    }
}
