//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::message::DeliveryMethod;

/// SLNet 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    /// 버퍼에 기록된 길이보다 더 읽으려 함
    #[error("데이터 부족: {requested} 비트 요청, 남은 비트 {available}")]
    OutOfData { requested: usize, available: usize },

    #[error("유효하지 않은 UTF-8 문자열")]
    InvalidString,

    #[error("알 수 없는 메시지 타입: {0}")]
    UnknownMessageType(u8),

    #[error("잘못된 패킷: {0}")]
    MalformedPacket(&'static str),

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    /// 전송 방식이 허용하지 않는 시퀀스 채널
    #[error("{method:?} 전송 방식에 사용할 수 없는 시퀀스 채널: {channel}")]
    InvalidSequenceChannel { method: DeliveryMethod, channel: u8 },

    /// 연결 없이 보내는 메시지는 분할할 수 없음
    #[error("메시지가 MTU 초과: {size} 바이트 > {mtu} 바이트")]
    MessageTooLarge { size: usize, mtu: usize },

    #[error("수신자 없음")]
    NoRecipients,

    #[error("이미 연결 중인 주소: {0}")]
    AlreadyConnected(SocketAddr),

    #[error("압축 코덱 미등록: {0:?}")]
    CodecMissing(crate::codec::CompressionAlgorithm),

    #[error("압축 에러: {0}")]
    Codec(String),

    #[error("설정 오류: {0}")]
    InvalidConfig(String),

    #[error("피어가 실행 중이 아님")]
    NotRunning,

    #[error("피어가 이미 실행 중")]
    AlreadyRunning,

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
