//! 네트워크 스레드와 사용자 스레드가 공유하는 상태
//!
//! - `PeerShared`: 수신 큐, 공개 연결 조회 테이블, 통계, 상태 구독자
//! - `CommandSink`: 사용자 스레드 → 네트워크 스레드 명령 큐 + 깨우기 신호
//! - `PeerContext`: 네트워크 스레드 전용. 연결 처리 중 필요한 피어 수준 서비스

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::buffer::BitBuffer;
use crate::checksum;
use crate::chunk::{Fragmenter, GroupId};
use crate::codec::CodecRegistry;
use crate::config::{EncryptionMode, PeerConfig};
use crate::connection::{Connection, ConnectionStatus};
use crate::crypto::{KeyAgreement, MessageCipher, X25519Agreement};
use crate::message::{DeliveryMethod, IncomingMessage, IncomingMessageKind, MessageType, OutgoingMessage};
use crate::pool::{MessagePool, SharedPayload};
use crate::queue::NetQueue;
use crate::sender::QueuedMessage;
use crate::stats::PeerStatistics;
use crate::wire::{WireMessage, FRAGMENT_HEADER_MAX_BYTES, MESSAGE_HEADER_MAX_BYTES};
use crate::{Error, Result};

/// 연결마다 새 키 합의 객체를 만드는 팩토리
pub type AgreementFactory = Arc<dyn Fn() -> Box<dyn KeyAgreement> + Send + Sync>;

pub(crate) fn default_agreement_factory() -> AgreementFactory {
    Arc::new(|| Box::new(X25519Agreement::generate()))
}

/// 네트워크 스레드가 처리할 명령
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        connection: Connection,
        hail: Option<Vec<u8>>,
    },
    Send {
        payload: BitBuffer,
        pool: Option<MessagePool>,
        recipients: Vec<Connection>,
        method: DeliveryMethod,
        channel: u8,
    },
    Approve {
        endpoint: SocketAddr,
        hail: Option<Vec<u8>>,
    },
    Deny {
        endpoint: SocketAddr,
        reason: String,
    },
    Disconnect {
        endpoint: SocketAddr,
        reason: String,
    },
    Discover {
        endpoint: SocketAddr,
    },
    DiscoveryResponse {
        endpoint: SocketAddr,
        payload: BitBuffer,
    },
    Shutdown {
        reason: String,
    },
}

/// 명령 큐 + 네트워크 스레드 깨우기
pub(crate) struct CommandSink {
    queue: NetQueue<Command>,
    wake: Notify,
}

impl CommandSink {
    pub fn new() -> Self {
        Self {
            queue: NetQueue::new(),
            wake: Notify::new(),
        }
    }

    pub fn post(&self, command: Command) {
        self.queue.enqueue(command);
        self.wake.notify_one();
    }

    /// 대기 중인 네트워크 루프를 깨움 (신호는 다음 대기까지 보존됨)
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn notified(&self) {
        self.wake.notified().await
    }

    pub fn drain(&self, out: &mut Vec<Command>) -> usize {
        self.queue.try_drain(out)
    }
}

/// 연결 상태 변경 알림
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StatusChanged {
        connection: Connection,
        status: ConnectionStatus,
        reason: String,
    },
    LatencyUpdated {
        connection: Connection,
        rtt: Duration,
    },
}

/// 피어 공유 상태
pub(crate) struct PeerShared {
    pub config: PeerConfig,
    pub incoming: NetQueue<IncomingMessage>,
    pub unconnected: NetQueue<(SocketAddr, OutgoingMessage)>,
    pub connections: DashMap<SocketAddr, Connection>,
    pub connections_by_id: DashMap<u64, Connection>,
    pub handshakes: DashMap<SocketAddr, Connection>,
    pub statistics: RwLock<PeerStatistics>,
    pub pool: MessagePool,
    subscribers: Mutex<Vec<Sender<PeerEvent>>>,
}

impl PeerShared {
    pub fn new(config: PeerConfig) -> Self {
        let pool = MessagePool::new(config.pool_max_per_class);
        Self {
            config,
            incoming: NetQueue::with_capacity(64),
            unconnected: NetQueue::new(),
            connections: DashMap::new(),
            connections_by_id: DashMap::new(),
            handshakes: DashMap::new(),
            statistics: RwLock::new(PeerStatistics::new()),
            pool,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<PeerEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 끊긴 구독자는 제거
    fn publish(&self, event: PeerEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// 네트워크 스레드 전용 피어 서비스
pub(crate) struct PeerContext {
    pub config: PeerConfig,
    pub shared: Arc<PeerShared>,
    pub sink: Arc<CommandSink>,
    pub unique_id: u64,
    pub local_address: SocketAddr,
    pub statistics: PeerStatistics,
    start: Instant,
    outbox: Vec<(SocketAddr, Bytes)>,
    next_group: GroupId,
    static_cipher: Option<MessageCipher>,
    codecs: CodecRegistry,
    agreement_factory: AgreementFactory,
}

impl PeerContext {
    pub fn new(
        shared: Arc<PeerShared>,
        sink: Arc<CommandSink>,
        local_address: SocketAddr,
        codecs: CodecRegistry,
        agreement_factory: AgreementFactory,
        now: Instant,
    ) -> Self {
        let config = shared.config.clone();
        let unique_id = config
            .unique_identifier
            .unwrap_or_else(|| derive_unique_id(&config.app_identifier, local_address));
        let static_cipher = match &config.encryption {
            EncryptionMode::StaticKey(key) => Some(MessageCipher::new(key)),
            _ => None,
        };

        Self {
            config,
            shared,
            sink,
            unique_id,
            local_address,
            statistics: PeerStatistics::new(),
            start: now,
            outbox: Vec::new(),
            next_group: 1,
            static_cipher,
            codecs,
            agreement_factory,
        }
    }

    /// 피어 시작 후 경과 시간 (초). 핸드쉐이크 타임스탬프에 사용
    pub fn local_time(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.start).as_secs_f64()
    }

    pub fn new_agreement(&self) -> Box<dyn KeyAgreement> {
        (self.agreement_factory)()
    }

    pub fn static_cipher(&self) -> Option<&MessageCipher> {
        self.static_cipher.as_ref()
    }

    pub fn next_group_id(&mut self) -> GroupId {
        let id = self.next_group;
        self.next_group = self.next_group.wrapping_add(1).max(1);
        id
    }

    /// 체크섬을 제외하고 메시지가 쓸 수 있는 데이터그램 크기
    pub fn datagram_budget(&self, mtu: usize) -> usize {
        if self.config.datagram_checksums {
            mtu - checksum::CHECKSUM_SIZE
        } else {
            mtu
        }
    }

    /// 데이터그램 송신 대기열에 추가 (체크섬, 손실 시뮬레이션 적용)
    pub fn emit(&mut self, to: SocketAddr, mut datagram: Vec<u8>) {
        if self.config.datagram_checksums {
            checksum::append(&mut datagram);
        }

        if self.config.simulated_loss > 0.0 && rand::random::<f32>() < self.config.simulated_loss {
            trace!("simulated loss: {} bytes to {}", datagram.len(), to);
            self.statistics.simulated_dropped_packets += 1;
            return;
        }

        self.statistics.sent_packets += 1;
        self.statistics.sent_bytes += datagram.len() as u64;

        let datagram = Bytes::from(datagram);
        if self.config.simulated_duplicates_chance > 0.0
            && rand::random::<f32>() < self.config.simulated_duplicates_chance
        {
            self.outbox.push((to, datagram.clone()));
        }
        self.outbox.push((to, datagram));
    }

    /// 연결과 무관한 제어 메시지 하나를 단독 데이터그램으로 전송
    pub fn send_control(&mut self, to: SocketAddr, message_type: MessageType, payload: BitBuffer) {
        let message = WireMessage::control(message_type, payload);
        let mut datagram = Vec::with_capacity(message.encoded_len());
        message.encode(&mut datagram);
        self.emit(to, datagram);
    }

    pub fn take_outbox(&mut self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut self.outbox)
    }

    /// 활성화된 종류면 애플리케이션 큐로
    pub fn release(&self, message: IncomingMessage) {
        if self.config.is_enabled(message.kind().flag()) {
            self.shared.incoming.enqueue(message);
        }
    }

    pub fn release_warning(&self, text: String) {
        self.release(IncomingMessage::new(
            IncomingMessageKind::WarningMessage(text),
            BitBuffer::new(),
        ));
    }

    /// 상태 변경을 핸들, 구독자, 수신 큐에 알림
    pub fn notify_status(&self, connection: &Connection, status: ConnectionStatus, reason: &str) {
        debug!("{} 상태 변경: {:?} ({})", connection.remote_endpoint(), status, reason);
        connection.set_status(status, reason);

        self.shared.publish(PeerEvent::StatusChanged {
            connection: connection.clone(),
            status,
            reason: reason.to_string(),
        });

        let mut buffer = BitBuffer::with_capacity(reason.len() + 2);
        buffer.write_u8(status as u8);
        buffer.write_string(reason);
        self.release(
            IncomingMessage::new(
                IncomingMessageKind::StatusChanged {
                    status,
                    reason: reason.to_string(),
                },
                buffer,
            )
            .with_sender(connection.clone()),
        );
    }

    pub fn notify_latency(&self, connection: &Connection, rtt: f64) {
        self.shared.publish(PeerEvent::LatencyUpdated {
            connection: connection.clone(),
            rtt: Duration::from_secs_f64(rtt.max(0.0)),
        });
        self.release(
            IncomingMessage::new(
                IncomingMessageKind::ConnectionLatencyUpdated { rtt: rtt as f32 },
                BitBuffer::new(),
            )
            .with_sender(connection.clone()),
        );
    }

    /// 사용자 페이로드 변환: 암호화 후 압축
    ///
    /// 각 단계는 입력 비트 길이를 앞에 붙여서 바이트 정렬이 아닌 페이로드도 보존.
    pub fn encode_payload(
        &self,
        cipher: Option<&MessageCipher>,
        payload: BitBuffer,
    ) -> Result<BitBuffer> {
        let mut payload = payload;

        if let Some(cipher) = cipher {
            let mut plain = BitBuffer::with_capacity(payload.length_bytes() + 5);
            plain.write_var_u32(payload.bit_length() as u32);
            plain.write_bytes(payload.as_bytes());
            let sealed = cipher.encrypt(plain.as_bytes())?;
            payload = BitBuffer::from_slice(&sealed);
        }

        if let Some(algorithm) = self.config.compression {
            let codec = self.codecs.get(algorithm)?;
            let packed = codec.compress(payload.as_bytes())?;
            let mut framed = BitBuffer::with_capacity(packed.len() + 5);
            framed.write_var_u32(payload.bit_length() as u32);
            framed.write_bytes(&packed);
            payload = framed;
        }

        Ok(payload)
    }

    /// `encode_payload`의 역순: 압축 해제 후 복호화
    pub fn decode_payload(
        &self,
        cipher: Option<&MessageCipher>,
        payload: BitBuffer,
    ) -> Result<BitBuffer> {
        let mut payload = payload;

        if let Some(algorithm) = self.config.compression {
            let bits = payload.read_var_u32()? as usize;
            let start = payload.position() / 8;
            let codec = self.codecs.get(algorithm)?;
            let data = codec.decompress(&payload.as_bytes()[start..])?;
            if bits > data.len() * 8 {
                return Err(Error::Codec("압축 해제 길이 불일치".into()));
            }
            payload = BitBuffer::from_bytes(data, bits);
        }

        if let Some(cipher) = cipher {
            let opened = cipher.decrypt(payload.as_bytes())?;
            let mut plain = BitBuffer::from_slice(&opened);
            let bits = plain.read_var_u32()? as usize;
            let start = plain.position() / 8;
            let data = opened[start..].to_vec();
            if bits > data.len() * 8 {
                return Err(Error::MalformedPacket("복호화 길이 불일치"));
            }
            payload = BitBuffer::from_bytes(data, bits);
        }

        Ok(payload)
    }

    /// 인코딩된 페이로드를 채널 큐 단위로 준비. MTU를 넘으면 분할
    pub fn prepare(
        &mut self,
        payload: BitBuffer,
        pool: Option<&MessagePool>,
        mtu: usize,
    ) -> Vec<QueuedMessage> {
        let payload = SharedPayload::new(payload, pool.cloned());
        let budget = self.datagram_budget(mtu);

        if payload.len() + MESSAGE_HEADER_MAX_BYTES <= budget {
            return vec![QueuedMessage {
                payload,
                fragment: None,
            }];
        }

        let chunk_size = budget - MESSAGE_HEADER_MAX_BYTES - FRAGMENT_HEADER_MAX_BYTES;
        let group = self.next_group_id();
        let chunks = Fragmenter::new(chunk_size).split(group, &payload, pool);
        debug!(
            "메시지 분할: {} bytes → {} chunks (group {})",
            payload.len(),
            chunks.len(),
            group
        );

        chunks
            .into_iter()
            .map(|(header, payload)| QueuedMessage {
                payload,
                fragment: Some(header),
            })
            .collect()
    }

    /// 공개 테이블 갱신: 핸드쉐이크 → 연결
    pub fn publish_established(&self, connection: &Connection) {
        let endpoint = connection.remote_endpoint();
        if let Some(id) = connection.remote_unique_id() {
            self.shared.connections_by_id.insert(id, connection.clone());
        }
        self.shared.connections.insert(endpoint, connection.clone());
        self.shared.handshakes.remove(&endpoint);
    }

    /// 공개 테이블에서 제거
    pub fn publish_removed(&self, connection: &Connection) {
        let endpoint = connection.remote_endpoint();
        self.shared
            .handshakes
            .remove_if(&endpoint, |_, existing| existing == connection);
        self.shared
            .connections
            .remove_if(&endpoint, |_, existing| existing == connection);
        if let Some(id) = connection.remote_unique_id() {
            self.shared
                .connections_by_id
                .remove_if(&id, |_, existing| existing == connection);
        }
    }

    pub fn publish_statistics(&mut self, connections: usize, handshakes: usize) {
        self.statistics.connections = connections;
        self.statistics.handshakes = handshakes;
        self.statistics.pooled_buffers = self.shared.pool.pooled_count();
        *self.shared.statistics.write() = self.statistics.clone();
    }

    pub fn warn_unsupported(&self, from: SocketAddr, what: &str) {
        warn!("{}에서 처리할 수 없는 메시지: {}", from, what);
    }
}

/// 식별자와 로컬 엔드포인트 해시를 섞은 64비트 ID
fn derive_unique_id(app_identifier: &str, local_address: SocketAddr) -> u64 {
    let seed = format!("{}{}", app_identifier, local_address);
    let hash = crc32fast::hash(seed.as_bytes()) as u64;
    rand::random::<u64>() ^ (hash << 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CompressionAlgorithm, RunLengthCodec};

    fn context(config: PeerConfig, codecs: CodecRegistry) -> PeerContext {
        let shared = Arc::new(PeerShared::new(config));
        PeerContext::new(
            shared,
            Arc::new(CommandSink::new()),
            "127.0.0.1:5000".parse().unwrap(),
            codecs,
            default_agreement_factory(),
            Instant::now(),
        )
    }

    fn odd_payload() -> BitBuffer {
        let mut buffer = BitBuffer::new();
        buffer.write_string("hello hello hello");
        buffer.write_bits(0b101, 3);
        buffer
    }

    #[test]
    fn test_transform_round_trip_with_cipher_and_codec() {
        let mut config = PeerConfig::new("test");
        config.compression = Some(CompressionAlgorithm::Zlib);
        let mut codecs = CodecRegistry::new();
        codecs.register(CompressionAlgorithm::Zlib, Arc::new(RunLengthCodec));
        let ctx = context(config, codecs);

        let cipher = MessageCipher::new(&[3u8; 32]);
        let original = odd_payload();
        let encoded = ctx.encode_payload(Some(&cipher), original.clone()).unwrap();
        assert_ne!(encoded.as_bytes(), original.as_bytes());

        let decoded = ctx.decode_payload(Some(&cipher), encoded).unwrap();
        assert_eq!(decoded.bit_length(), original.bit_length());
        assert_eq!(decoded.as_bytes(), original.as_bytes());
    }

    #[test]
    fn test_wrong_key_fails_decode() {
        let ctx = context(PeerConfig::new("test"), CodecRegistry::new());
        let encoded = ctx
            .encode_payload(Some(&MessageCipher::new(&[1u8; 32])), odd_payload())
            .unwrap();
        assert!(ctx
            .decode_payload(Some(&MessageCipher::new(&[2u8; 32])), encoded)
            .is_err());
    }

    #[test]
    fn test_missing_codec_is_error() {
        let mut config = PeerConfig::new("test");
        config.compression = Some(CompressionAlgorithm::Lzma);
        let ctx = context(config, CodecRegistry::new());
        assert!(matches!(
            ctx.encode_payload(None, odd_payload()),
            Err(Error::CodecMissing(CompressionAlgorithm::Lzma))
        ));
    }

    #[test]
    fn test_prepare_fragments_large_payload() {
        let mut ctx = context(PeerConfig::new("test"), CodecRegistry::new());
        let small = ctx.prepare(BitBuffer::from_slice(&[1u8; 100]), None, 1400);
        assert_eq!(small.len(), 1);
        assert!(small[0].fragment.is_none());

        let large = ctx.prepare(BitBuffer::from_slice(&[2u8; 5000]), None, 1400);
        assert!(large.len() >= 4);
        let group = large[0].fragment.map(|h| h.group);
        assert!(large.iter().all(|m| m.fragment.map(|h| h.group) == group));
        let budget = ctx.datagram_budget(1400);
        assert!(large
            .iter()
            .all(|m| m.payload.len() + MESSAGE_HEADER_MAX_BYTES + FRAGMENT_HEADER_MAX_BYTES <= budget));
    }

    #[test]
    fn test_checksum_and_loss_in_emit() {
        let mut config = PeerConfig::new("test");
        config.datagram_checksums = true;
        let mut ctx = context(config, CodecRegistry::new());
        let to: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        ctx.emit(to, vec![1, 2, 3]);
        let out = ctx.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(checksum::strip(&out[0].1), Some(3));

        let mut config = PeerConfig::new("test");
        config.simulated_loss = 1.0;
        let mut ctx = context(config, CodecRegistry::new());
        ctx.emit(to, vec![1, 2, 3]);
        assert!(ctx.take_outbox().is_empty());
        assert_eq!(ctx.statistics.simulated_dropped_packets, 1);
    }
}
