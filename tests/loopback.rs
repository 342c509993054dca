//! 실제 UDP 소켓(루프백)을 쓰는 피어 간 통합 테스트

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use slnet::{
    Connection, ConnectionStatus, DeliveryMethod, EncryptionMode, IncomingKinds, IncomingMessage,
    IncomingMessageKind, Peer, PeerConfig, PeerEvent,
};

const WAIT: Duration = Duration::from_secs(5);

fn loopback(mut config: PeerConfig) -> (Peer, SocketAddr) {
    config.local_address = "127.0.0.1:0".parse().unwrap();
    config.heartbeat_interval = Duration::from_millis(2);
    let mut peer = Peer::new(config).unwrap();
    let addr = peer.start().unwrap();
    (peer, addr)
}

fn server_config() -> PeerConfig {
    let mut config = PeerConfig::new("loopback");
    config.accept_incoming_connections = true;
    config
}

/// 조건을 만족하는 메시지가 올 때까지 대기 (나머지는 버림)
fn wait_for(peer: &Peer, mut accept: impl FnMut(&IncomingMessage) -> bool) -> Option<IncomingMessage> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(message) = peer.wait_message(Duration::from_millis(20)) {
            if accept(&message) {
                return Some(message);
            }
        }
    }
    None
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn connect(client: &Peer, server_addr: SocketAddr) -> Connection {
    let connection = client.connect(server_addr, None).unwrap();
    assert!(
        wait_until(|| connection.status().is_connected()),
        "연결 실패: {:?}",
        connection.status()
    );
    connection
}

#[test]
fn test_connect_and_exchange_ordered() {
    let (server, server_addr) = loopback(server_config());
    let (client, _) = loopback(PeerConfig::new("loopback"));
    let connection = connect(&client, server_addr);

    for i in 0..50u32 {
        let mut message = client.create_message();
        message.write_u32(i);
        message.write_string("payload");
        client
            .send_message(message, &connection, DeliveryMethod::ReliableOrdered, 2)
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 50 {
        let mut message = wait_for(&server, |m| *m.kind() == IncomingMessageKind::Data)
            .expect("데이터 수신 시간 초과");
        assert_eq!(message.delivery_method(), Some(DeliveryMethod::ReliableOrdered));
        assert_eq!(message.sequence_channel(), 2);
        received.push(message.read_u32().unwrap());
        assert_eq!(message.read_string().unwrap(), "payload");
        server.recycle(message);
    }
    assert_eq!(received, (0..50).collect::<Vec<_>>());

    assert!(wait_until(|| server.connections_count() == 1));
    let remote = server.connections().pop().unwrap();
    assert_eq!(server.get_connection_by_id(client.unique_id().unwrap()), Some(remote));
}

#[test]
fn test_fragmented_message_over_sockets() {
    let (server, server_addr) = loopback(server_config());
    let (client, _) = loopback(PeerConfig::new("loopback"));
    let connection = connect(&client, server_addr);

    let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut message = client.create_message();
    message.write_bytes(&data);
    client
        .send_message(message, &connection, DeliveryMethod::ReliableUnordered, 0)
        .unwrap();

    let message = wait_for(&server, |m| *m.kind() == IncomingMessageKind::Data).expect("조립 실패");
    assert_eq!(message.as_bytes(), &data[..]);
}

#[test]
fn test_disconnect_reaches_remote() {
    let (server, server_addr) = loopback(server_config());
    let (client, _) = loopback(PeerConfig::new("loopback"));
    let events = server.subscribe();
    let connection = connect(&client, server_addr);

    connection.disconnect("see you");
    let message = wait_for(&server, |m| {
        matches!(
            m.kind(),
            IncomingMessageKind::StatusChanged {
                status: ConnectionStatus::Disconnected,
                ..
            }
        )
    })
    .expect("종료 알림 없음");
    assert!(matches!(
        message.kind(),
        IncomingMessageKind::StatusChanged { reason, .. } if reason == "see you"
    ));
    assert!(wait_until(|| server.connections_count() == 0));
    assert!(client.get_connection(&server_addr).is_none());

    let statuses: Vec<ConnectionStatus> = events
        .try_iter()
        .filter_map(|event| match event {
            PeerEvent::StatusChanged { status, .. } => Some(status),
            PeerEvent::LatencyUpdated { .. } => None,
        })
        .collect();
    assert_eq!(statuses.last(), Some(&ConnectionStatus::Disconnected));
}

#[test]
fn test_negotiated_encryption_over_sockets() {
    let mut server_config = server_config();
    server_config.encryption = EncryptionMode::Negotiated;
    let mut client_config = PeerConfig::new("loopback");
    client_config.encryption = EncryptionMode::Negotiated;

    let (server, server_addr) = loopback(server_config);
    let (client, _) = loopback(client_config);
    let connection = connect(&client, server_addr);
    assert_eq!(connection.status(), ConnectionStatus::ConnectedSecured);

    let mut message = client.create_message();
    message.write_string("top secret");
    client
        .send_message(message, &connection, DeliveryMethod::ReliableOrdered, 0)
        .unwrap();
    let mut message = wait_for(&server, |m| *m.kind() == IncomingMessageKind::Data).unwrap();
    assert_eq!(message.read_string().unwrap(), "top secret");
}

#[test]
fn test_wrong_app_identifier_is_refused() {
    let (_server, server_addr) = loopback(server_config());
    let (client, _) = loopback(PeerConfig::new("something else"));
    let connection = client.connect(server_addr, None).unwrap();

    assert!(wait_until(|| connection.status() == ConnectionStatus::Disconnected));
    assert_eq!(
        connection.disconnect_reason().as_deref(),
        Some("wrong application identifier")
    );
}

#[test]
fn test_unconnected_and_discovery() {
    let mut config = server_config();
    config.enable(IncomingKinds::DISCOVERY_REQUEST);
    let (server, server_addr) = loopback(config);
    let mut client_config = PeerConfig::new("loopback");
    client_config.enable(IncomingKinds::DISCOVERY_RESPONSE);
    let (client, client_addr) = loopback(client_config);

    let mut message = client.create_message();
    message.write_string("ping?");
    client.send_unconnected_message(message, server_addr).unwrap();
    let mut message = wait_for(&server, |m| *m.kind() == IncomingMessageKind::UnconnectedData).unwrap();
    assert_eq!(message.sender_endpoint(), Some(client_addr));
    assert_eq!(message.read_string().unwrap(), "ping?");

    client.discover_known_peer(server_addr).unwrap();
    let request = wait_for(&server, |m| *m.kind() == IncomingMessageKind::DiscoveryRequest).unwrap();
    let mut response = server.create_message();
    response.write_string("loopback server");
    server
        .send_discovery_response(response, request.sender_endpoint().unwrap())
        .unwrap();

    let mut message = wait_for(&client, |m| *m.kind() == IncomingMessageKind::DiscoveryResponse).unwrap();
    assert_eq!(message.sender_endpoint(), Some(server_addr));
    assert_eq!(message.read_string().unwrap(), "loopback server");
}

#[test]
fn test_simulated_loss_still_delivers_reliably() {
    let mut client_config = PeerConfig::new("loopback");
    client_config.simulated_loss = 0.2;
    client_config.maximum_handshake_attempts = 20;
    client_config.resend_handshake_interval = Duration::from_millis(50);
    let (server, server_addr) = loopback(server_config());
    let (client, _) = loopback(client_config);
    let connection = connect(&client, server_addr);

    for i in 0..30u16 {
        let mut message = client.create_message();
        message.write_u16(i);
        client
            .send_message(message, &connection, DeliveryMethod::ReliableOrdered, 0)
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 30 {
        let mut message = wait_for(&server, |m| *m.kind() == IncomingMessageKind::Data)
            .expect("손실 복구 실패");
        received.push(message.read_u16().unwrap());
    }
    assert_eq!(received, (0..30).collect::<Vec<_>>());
}

#[test]
fn test_shutdown_notifies_connections() {
    let (server, server_addr) = loopback(server_config());
    let (mut client, _) = loopback(PeerConfig::new("loopback"));
    let _connection = connect(&client, server_addr);
    assert!(wait_until(|| server.connections_count() == 1));

    client.shutdown("client closing");
    let message = wait_for(&server, |m| {
        matches!(
            m.kind(),
            IncomingMessageKind::StatusChanged {
                status: ConnectionStatus::Disconnected,
                ..
            }
        )
    });
    assert!(message.is_some());
    assert!(wait_until(|| server.connections_count() == 0));
}
