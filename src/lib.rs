//! # SLNet
//!
//! UDP 위의 연결 지향 메시지 네트워킹
//!
//! ## 핵심 특징
//! - **연결 핸드쉐이크**: 애플리케이션 식별자 검증, 승인 모드, hail 메시지
//! - **전송 방식**: Unreliable / Sequenced / ReliableUnordered / ReliableSequenced / ReliableOrdered
//! - **시퀀스 채널**: 순차 방식마다 16개의 독립 채널
//! - **분할/조립**: MTU보다 큰 메시지는 청크로 나눠 보내고 수신측에서 재조립
//! - **암호화**: 정적 키 또는 연결별 X25519 합의 키 + ChaCha20-Poly1305
//! - **단일 네트워크 스레드**: 모든 연결 상태를 한 스레드가 소유, 사용자 스레드는 큐로 통신
//!
//! ```no_run
//! use slnet::{DeliveryMethod, Peer, PeerConfig};
//!
//! let mut peer = Peer::new(PeerConfig::new("chat"))?;
//! peer.start()?;
//! let connection = peer.connect("127.0.0.1:14242".parse().unwrap(), None)?;
//! // ... 상태 변경 메시지로 연결 완료 확인 후
//! let mut message = peer.create_message();
//! message.write_string("hello");
//! peer.send_message(message, &connection, DeliveryMethod::ReliableOrdered, 0)?;
//! # Ok::<(), slnet::Error>(())
//! ```

pub mod buffer;
pub mod checksum;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod connection;
pub(crate) mod context;
pub(crate) mod core;
pub mod crypto;
pub mod error;
pub mod message;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod sequence;
pub mod stats;
pub mod upnp;
pub mod wire;

pub use buffer::{BitBuffer, WireRead, WireWrite};
pub use codec::{Codec, CompressionAlgorithm};
pub use config::{EncryptionMode, IncomingKinds, PeerConfig};
pub use connection::{Connection, ConnectionStatus};
pub use context::{AgreementFactory, PeerEvent};
pub use crypto::{CryptoError, KeyAgreement, MessageCipher, X25519Agreement};
pub use error::{Error, Result};
pub use message::{DeliveryMethod, IncomingMessage, IncomingMessageKind, MessageType, OutgoingMessage};
pub use peer::{Peer, PeerStatus};
pub use queue::NetQueue;
pub use stats::{ConnectionStatistics, PeerStatistics};
pub use upnp::Upnp;

/// 기본 MTU (바이트)
pub const DEFAULT_MTU: usize = 1408;

/// 허용 MTU 범위
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 8192;
