//! 메시지 타입과 송수신 메시지 정의
//!
//! 타입 코드 0~89는 내부(핸드쉐이크/제어)용, 90~139는 사용자 데이터,
//! 140은 끝 표시. 암호화/압축은 사용자 범위에만 적용됨.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use crate::buffer::BitBuffer;
use crate::config::IncomingKinds;
use crate::connection::{Connection, ConnectionStatus};
use crate::pool::MessagePool;
use crate::{Error, Result};

/// 전송 방식당 최대 시퀀스 채널 수
pub const MAX_SEQUENCE_CHANNELS: u8 = 16;

/// 내부 타입 범위의 마지막 코드
pub const LAST_INTERNAL_CODE: u8 = 89;

const USER_UNRELIABLE: u8 = 90;
const USER_SEQUENCED: u8 = 91;
const USER_RELIABLE_UNORDERED: u8 = 107;
const USER_RELIABLE_SEQUENCED: u8 = 108;
const USER_RELIABLE_ORDERED: u8 = 124;

/// 사용자 범위 끝 표시
pub const USER_END_CODE: u8 = 140;

/// 연결당 송신/수신 채널 슬롯 수
pub const CHANNEL_SLOTS: usize = (USER_END_CODE - USER_UNRELIABLE) as usize;

/// 전송 보장 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// 보내고 잊음
    Unreliable,
    /// 최신 것만 전달, 재전송 없음
    Sequenced,
    /// 재전송, 도착 순서대로 전달
    ReliableUnordered,
    /// 재전송, 오래된 것은 버림
    ReliableSequenced,
    /// 재전송, 보낸 순서대로 전달
    ReliableOrdered,
}

impl DeliveryMethod {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }

    /// 이 방식이 쓸 수 있는 시퀀스 채널 수
    pub fn channel_count(self) -> u8 {
        match self {
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => 1,
            _ => MAX_SEQUENCE_CHANNELS,
        }
    }

    fn base_code(self) -> u8 {
        match self {
            DeliveryMethod::Unreliable => USER_UNRELIABLE,
            DeliveryMethod::Sequenced => USER_SEQUENCED,
            DeliveryMethod::ReliableUnordered => USER_RELIABLE_UNORDERED,
            DeliveryMethod::ReliableSequenced => USER_RELIABLE_SEQUENCED,
            DeliveryMethod::ReliableOrdered => USER_RELIABLE_ORDERED,
        }
    }

    pub fn validate_channel(self, channel: u8) -> Result<()> {
        if channel >= self.channel_count() {
            return Err(Error::InvalidSequenceChannel {
                method: self,
                channel,
            });
        }
        Ok(())
    }
}

/// 와이어 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Unconnected,
    LibraryError,
    Ping,
    Pong,
    Connect,
    ConnectResponse,
    ConnectionEstablished,
    Acknowledge,
    Disconnect,
    Discovery,
    DiscoveryResponse,
    User { method: DeliveryMethod, channel: u8 },
}

impl MessageType {
    pub fn user(method: DeliveryMethod, channel: u8) -> Self {
        MessageType::User { method, channel }
    }

    pub fn code(self) -> u8 {
        match self {
            MessageType::Unconnected => 0,
            MessageType::LibraryError => 1,
            MessageType::Ping => 2,
            MessageType::Pong => 3,
            MessageType::Connect => 4,
            MessageType::ConnectResponse => 5,
            MessageType::ConnectionEstablished => 6,
            MessageType::Acknowledge => 7,
            MessageType::Disconnect => 8,
            MessageType::Discovery => 9,
            MessageType::DiscoveryResponse => 10,
            MessageType::User { method, channel } => method.base_code() + channel,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        let ty = match code {
            0 => MessageType::Unconnected,
            1 => MessageType::LibraryError,
            2 => MessageType::Ping,
            3 => MessageType::Pong,
            4 => MessageType::Connect,
            5 => MessageType::ConnectResponse,
            6 => MessageType::ConnectionEstablished,
            7 => MessageType::Acknowledge,
            8 => MessageType::Disconnect,
            9 => MessageType::Discovery,
            10 => MessageType::DiscoveryResponse,
            USER_UNRELIABLE => MessageType::user(DeliveryMethod::Unreliable, 0),
            USER_SEQUENCED..=106 => {
                MessageType::user(DeliveryMethod::Sequenced, code - USER_SEQUENCED)
            }
            USER_RELIABLE_UNORDERED => MessageType::user(DeliveryMethod::ReliableUnordered, 0),
            USER_RELIABLE_SEQUENCED..=123 => MessageType::user(
                DeliveryMethod::ReliableSequenced,
                code - USER_RELIABLE_SEQUENCED,
            ),
            USER_RELIABLE_ORDERED..=139 => MessageType::user(
                DeliveryMethod::ReliableOrdered,
                code - USER_RELIABLE_ORDERED,
            ),
            other => return Err(Error::UnknownMessageType(other)),
        };
        Ok(ty)
    }

    /// 사용자 범위 여부: 내부 범위 끝과 끝 표시 사이
    pub fn is_user(self) -> bool {
        let code = self.code();
        code > LAST_INTERNAL_CODE && code < USER_END_CODE
    }

    /// 헤더에 시퀀스 번호가 붙는지
    pub fn has_sequence(self) -> bool {
        matches!(self, MessageType::User { method, .. } if method != DeliveryMethod::Unreliable)
    }

    /// 송신/수신 채널 배열 인덱스
    pub fn channel_slot(self) -> Option<usize> {
        self.is_user()
            .then(|| (self.code() - USER_UNRELIABLE) as usize)
    }

    pub fn delivery(self) -> Option<(DeliveryMethod, u8)> {
        match self {
            MessageType::User { method, channel } => Some((method, channel)),
            _ => None,
        }
    }
}

/// 애플리케이션에 전달되는 메시지 종류
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessageKind {
    /// 연결된 상대의 사용자 데이터
    Data,
    /// 연결 상태 변경
    StatusChanged {
        status: ConnectionStatus,
        reason: String,
    },
    /// 승인 대기 중인 연결 요청 (버퍼에 상대의 hail)
    ConnectionApproval,
    /// 연결 없이 받은 데이터
    UnconnectedData,
    DiscoveryRequest,
    DiscoveryResponse,
    /// 핑 응답으로 RTT 갱신 (초)
    ConnectionLatencyUpdated { rtt: f32 },
    DebugMessage(String),
    WarningMessage(String),
    ErrorMessage(String),
}

impl IncomingMessageKind {
    pub fn flag(&self) -> IncomingKinds {
        match self {
            IncomingMessageKind::Data => IncomingKinds::DATA,
            IncomingMessageKind::StatusChanged { .. } => IncomingKinds::STATUS_CHANGED,
            IncomingMessageKind::ConnectionApproval => IncomingKinds::CONNECTION_APPROVAL,
            IncomingMessageKind::UnconnectedData => IncomingKinds::UNCONNECTED_DATA,
            IncomingMessageKind::DiscoveryRequest => IncomingKinds::DISCOVERY_REQUEST,
            IncomingMessageKind::DiscoveryResponse => IncomingKinds::DISCOVERY_RESPONSE,
            IncomingMessageKind::ConnectionLatencyUpdated { .. } => {
                IncomingKinds::CONNECTION_LATENCY_UPDATED
            }
            IncomingMessageKind::DebugMessage(_) => IncomingKinds::DEBUG_MESSAGE,
            IncomingMessageKind::WarningMessage(_) => IncomingKinds::WARNING_MESSAGE,
            IncomingMessageKind::ErrorMessage(_) => IncomingKinds::ERROR_MESSAGE,
        }
    }
}

/// 수신 메시지
#[derive(Debug)]
pub struct IncomingMessage {
    kind: IncomingMessageKind,
    sender_endpoint: Option<SocketAddr>,
    sender: Option<Connection>,
    message_type: Option<MessageType>,
    sequence_number: u16,
    receive_time: Instant,
    buffer: BitBuffer,
}

impl IncomingMessage {
    pub(crate) fn new(kind: IncomingMessageKind, buffer: BitBuffer) -> Self {
        Self {
            kind,
            sender_endpoint: None,
            sender: None,
            message_type: None,
            sequence_number: 0,
            receive_time: Instant::now(),
            buffer,
        }
    }

    pub(crate) fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.sender_endpoint = Some(endpoint);
        self
    }

    pub(crate) fn with_sender(mut self, connection: Connection) -> Self {
        self.sender_endpoint = Some(connection.remote_endpoint());
        self.sender = Some(connection);
        self
    }

    pub(crate) fn with_type(mut self, message_type: MessageType, sequence_number: u16) -> Self {
        self.message_type = Some(message_type);
        self.sequence_number = sequence_number;
        self
    }

    pub fn kind(&self) -> &IncomingMessageKind {
        &self.kind
    }

    pub fn sender_endpoint(&self) -> Option<SocketAddr> {
        self.sender_endpoint
    }

    /// 연결된 상대에게서 온 경우 그 연결
    pub fn sender(&self) -> Option<&Connection> {
        self.sender.as_ref()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    pub fn delivery_method(&self) -> Option<DeliveryMethod> {
        self.message_type.and_then(MessageType::delivery).map(|(m, _)| m)
    }

    pub fn sequence_channel(&self) -> u8 {
        self.message_type
            .and_then(MessageType::delivery)
            .map(|(_, c)| c)
            .unwrap_or(0)
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn receive_time(&self) -> Instant {
        self.receive_time
    }

    pub fn buffer(&self) -> &BitBuffer {
        &self.buffer
    }

    pub(crate) fn into_buffer(self) -> BitBuffer {
        self.buffer
    }
}

impl Deref for IncomingMessage {
    type Target = BitBuffer;

    fn deref(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl DerefMut for IncomingMessage {
    fn deref_mut(&mut self) -> &mut BitBuffer {
        &mut self.buffer
    }
}

/// 송신 메시지
///
/// 전송 API가 값으로 소비하므로 한 번 보낸 메시지는 다시 쓸 수 없음.
/// 보내지 않고 버리면 저장소가 풀로 돌아감.
#[derive(Debug)]
pub struct OutgoingMessage {
    buffer: BitBuffer,
    pool: Option<MessagePool>,
}

impl OutgoingMessage {
    pub fn new() -> Self {
        Self {
            buffer: BitBuffer::new(),
            pool: None,
        }
    }

    pub(crate) fn pooled(pool: &MessagePool, initial_capacity: usize) -> Self {
        Self {
            buffer: BitBuffer::from_storage(pool.checkout(initial_capacity)),
            pool: Some(pool.clone()),
        }
    }

    pub fn from_buffer(buffer: BitBuffer) -> Self {
        Self { buffer, pool: None }
    }

    pub(crate) fn into_parts(mut self) -> (BitBuffer, Option<MessagePool>) {
        let buffer = std::mem::take(&mut self.buffer);
        (buffer, self.pool.take())
    }
}

impl Default for OutgoingMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OutgoingMessage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.buffer).into_storage());
        }
    }
}

impl Deref for OutgoingMessage {
    type Target = BitBuffer;

    fn deref(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut BitBuffer {
        &mut self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_cover_user_range() {
        for code in 0..=255u8 {
            match MessageType::from_code(code) {
                Ok(ty) => {
                    assert_eq!(ty.code(), code);
                    assert_eq!(ty.is_user(), code > LAST_INTERNAL_CODE && code < USER_END_CODE);
                }
                Err(Error::UnknownMessageType(c)) => {
                    assert_eq!(c, code);
                    assert!((11..USER_UNRELIABLE).contains(&code) || code >= USER_END_CODE);
                }
                Err(e) => panic!("unexpected {e}"),
            }
        }
    }

    #[test]
    fn test_channel_slots_unique() {
        let mut seen = vec![false; CHANNEL_SLOTS];
        for code in USER_UNRELIABLE..USER_END_CODE {
            let slot = MessageType::from_code(code).unwrap().channel_slot().unwrap();
            assert!(!seen[slot]);
            seen[slot] = true;
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(MessageType::Connect.channel_slot(), None);
    }

    #[test]
    fn test_validate_channel() {
        assert!(DeliveryMethod::ReliableOrdered.validate_channel(15).is_ok());
        assert!(DeliveryMethod::ReliableOrdered.validate_channel(16).is_err());
        assert!(DeliveryMethod::Unreliable.validate_channel(1).is_err());
        assert!(DeliveryMethod::ReliableUnordered.validate_channel(0).is_ok());
    }

    #[test]
    fn test_dropped_outgoing_returns_storage() {
        let pool = MessagePool::new(4);
        let mut msg = OutgoingMessage::pooled(&pool, 32);
        msg.write_u32(1);
        drop(msg);
        assert_eq!(pool.pooled_count(), 1);
    }
}
