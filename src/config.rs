//! 피어 설정

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bitflags::bitflags;

use crate::codec::CompressionAlgorithm;
use crate::{Error, Result, DEFAULT_MTU};

bitflags! {
    /// 애플리케이션 큐로 올릴 수신 메시지 종류
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IncomingKinds: u32 {
        const DATA = 1 << 0;
        const STATUS_CHANGED = 1 << 1;
        const CONNECTION_APPROVAL = 1 << 2;
        const UNCONNECTED_DATA = 1 << 3;
        const DISCOVERY_REQUEST = 1 << 4;
        const DISCOVERY_RESPONSE = 1 << 5;
        const CONNECTION_LATENCY_UPDATED = 1 << 6;
        const DEBUG_MESSAGE = 1 << 7;
        const WARNING_MESSAGE = 1 << 8;
        const ERROR_MESSAGE = 1 << 9;
    }
}

impl Default for IncomingKinds {
    fn default() -> Self {
        IncomingKinds::DATA
            | IncomingKinds::STATUS_CHANGED
            | IncomingKinds::UNCONNECTED_DATA
            | IncomingKinds::WARNING_MESSAGE
            | IncomingKinds::ERROR_MESSAGE
    }
}

/// 메시지 암호화 키 출처
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionMode {
    Disabled,
    /// 모든 연결이 같은 정적 키 사용 (ChaCha20-Poly1305, 32바이트)
    StaticKey([u8; 32]),
    /// 핸드쉐이크 중 연결별 키 합의 (X25519)
    Negotiated,
}

/// SLNet 피어 설정
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// 애플리케이션 식별자. 양쪽이 같아야 연결됨
    pub app_identifier: String,

    /// 바인드 주소 (포트 0이면 OS가 선택)
    pub local_address: SocketAddr,

    /// 단일 데이터그램 최대 크기 (바이트)
    pub maximum_transmission_unit: usize,

    /// 핸드쉐이크 재전송 간격
    pub resend_handshake_interval: Duration,

    /// 핸드쉐이크 최대 시도 횟수
    pub maximum_handshake_attempts: u32,

    /// 연결 유지 핑 간격
    pub ping_interval: Duration,

    /// 이 시간 동안 아무것도 못 받으면 연결 종료
    pub connection_timeout: Duration,

    /// 신뢰 채널 재전송 기본 지연
    pub resend_base_delay: Duration,

    /// 재전송 지연에 더하는 RTT 배수
    pub resend_rtt_multiplier: f32,

    /// 재전송 최대 횟수, 초과하면 연결 실패
    pub max_resend_attempts: u32,

    /// 네트워크 스레드 주기 작업 간격
    pub heartbeat_interval: Duration,

    /// 최대 동시 연결 수
    pub maximum_connections: usize,

    /// 들어오는 연결 허용 여부
    pub accept_incoming_connections: bool,

    /// 애플리케이션 큐로 올릴 수신 메시지 종류
    pub enabled_incoming: IncomingKinds,

    /// 암호화
    pub encryption: EncryptionMode,

    /// 압축 (None이면 사용 안 함)
    pub compression: Option<CompressionAlgorithm>,

    /// 데이터그램 끝 CRC32 추가/검증
    pub datagram_checksums: bool,

    /// 미완성 분할 그룹 폐기 시간
    pub fragment_group_timeout: Duration,

    /// 탐색 브로드캐스트 주소 (None이면 255.255.255.255)
    pub broadcast_address: Option<IpAddr>,

    /// 네트워크 스레드 이름
    pub network_thread_name: String,

    /// 시작 시 UPnP 탐색
    pub enable_upnp: bool,

    /// 고유 ID 지정 (None이면 식별자 + 엔드포인트로 생성)
    pub unique_identifier: Option<u64>,

    /// 풀의 크기 등급당 최대 보관 버퍼 수
    pub pool_max_per_class: usize,

    /// 테스트용 송신 손실률 (0.0 ~ 1.0)
    pub simulated_loss: f32,

    /// 테스트용 중복 송신 확률 (0.0 ~ 1.0)
    pub simulated_duplicates_chance: f32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            app_identifier: String::from("slnet"),
            local_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            maximum_transmission_unit: DEFAULT_MTU,
            resend_handshake_interval: Duration::from_secs(3),
            maximum_handshake_attempts: 5,
            ping_interval: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(25),
            resend_base_delay: Duration::from_millis(25),
            resend_rtt_multiplier: 2.1,
            max_resend_attempts: 32,
            heartbeat_interval: Duration::from_millis(5),
            maximum_connections: 32,
            accept_incoming_connections: false,
            enabled_incoming: IncomingKinds::default(),
            encryption: EncryptionMode::Disabled,
            compression: None,
            datagram_checksums: false,
            fragment_group_timeout: Duration::from_secs(30),
            broadcast_address: None,
            network_thread_name: String::from("slnet network thread"),
            enable_upnp: false,
            unique_identifier: None,
            pool_max_per_class: 64,
            simulated_loss: 0.0,
            simulated_duplicates_chance: 0.0,
        }
    }
}

impl PeerConfig {
    /// 새 설정 생성
    pub fn new(app_identifier: impl Into<String>) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            ..Self::default()
        }
    }

    /// 서버용: 포트 지정 + 연결 수락
    pub fn server(app_identifier: impl Into<String>, port: u16) -> Self {
        Self {
            local_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            accept_incoming_connections: true,
            ..Self::new(app_identifier)
        }
    }

    /// 로컬 네트워크용 설정
    pub fn lan(app_identifier: impl Into<String>) -> Self {
        Self {
            resend_handshake_interval: Duration::from_millis(500),
            ping_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(10),
            resend_base_delay: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(2),
            ..Self::new(app_identifier)
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network(app_identifier: impl Into<String>) -> Self {
        Self {
            maximum_transmission_unit: 1000, // 작은 데이터그램
            resend_handshake_interval: Duration::from_secs(2),
            maximum_handshake_attempts: 10,
            connection_timeout: Duration::from_secs(60),
            resend_base_delay: Duration::from_millis(50),
            resend_rtt_multiplier: 3.0,
            max_resend_attempts: 64,
            datagram_checksums: true,
            ..Self::new(app_identifier)
        }
    }

    pub fn enable(&mut self, kinds: IncomingKinds) -> &mut Self {
        self.enabled_incoming.insert(kinds);
        self
    }

    pub fn disable(&mut self, kinds: IncomingKinds) -> &mut Self {
        self.enabled_incoming.remove(kinds);
        self
    }

    pub fn is_enabled(&self, kinds: IncomingKinds) -> bool {
        self.enabled_incoming.contains(kinds)
    }

    /// 연결 승인 모드 여부
    pub fn approval_required(&self) -> bool {
        self.is_enabled(IncomingKinds::CONNECTION_APPROVAL)
    }

    /// 탐색 브로드캐스트 주소
    pub fn broadcast_ip(&self) -> IpAddr {
        self.broadcast_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST))
    }

    /// 피어 시작 전 검증
    pub fn validate(&self) -> Result<()> {
        if self.app_identifier.is_empty() {
            return Err(Error::InvalidConfig("app_identifier 비어 있음".into()));
        }
        if self.maximum_transmission_unit < crate::MIN_MTU
            || self.maximum_transmission_unit > crate::MAX_MTU
        {
            return Err(Error::InvalidConfig(format!(
                "MTU {} 범위 밖 ({}..={})",
                self.maximum_transmission_unit,
                crate::MIN_MTU,
                crate::MAX_MTU
            )));
        }
        if self.maximum_handshake_attempts == 0 {
            return Err(Error::InvalidConfig("maximum_handshake_attempts는 1 이상".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig("heartbeat_interval은 0보다 커야 함".into()));
        }
        if !(0.0..=1.0).contains(&self.simulated_loss)
            || !(0.0..=1.0).contains(&self.simulated_duplicates_chance)
        {
            return Err(Error::InvalidConfig("시뮬레이션 확률은 0.0 ~ 1.0".into()));
        }
        Ok(())
    }
}
