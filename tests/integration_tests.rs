//! End-to-end tests over the in-memory transport.
//!
//! Each test runs a server and a client manager (or a hand-driven raw peer)
//! and checks behaviour visible at the handler and wire level.

use std::sync::Arc;
use std::time::Duration;
use tether_core::auth::{AUTHENTICATION_FAILED, AUTHENTICATION_REQUIRED};
use tether_core::{
    ControlMessage, Credentials, Frame, NetworkConfig, NetworkConnection, NetworkError,
    Reliability, UserDirectory,
};
use tether_integration_tests::fixtures::{Event, RawPeer, SERVER, TwoPeerFixture};
use tether_transport::{Listener, MemoryNetwork, TcpHost, TcpLink};
use tokio::time::Instant;

fn requests(events: &[Event]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Request { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

fn secure_config() -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.auth.require_authentication = true;
    config
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_connect_exchanges_request_and_response() {
    let fixture = TwoPeerFixture::new().await;

    let (connection, response) = fixture.connect(Some("hi"), None).await.unwrap();
    assert_eq!(response.as_deref(), Some("welcome"));
    assert!(connection.is_connected());
    assert!(!connection.is_local());
    assert!(!connection.is_secure());
    assert!(connection.user().is_none());

    fixture
        .server_events
        .wait_for(|events| {
            events.iter().find_map(|event| match event {
                Event::Connected { message, .. } => Some(assert_eq!(message.as_deref(), Some("hi"))),
                _ => None,
            })
        })
        .await;
    assert!(fixture.client_events.events().contains(&Event::Connected {
        connection: connection.id(),
        message: Some("welcome".to_string()),
    }));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_rejected_connect() {
    let fixture = TwoPeerFixture::new().await;

    let result = fixture.connect(Some("deny"), None).await;
    assert_eq!(result.err(), Some(NetworkError::rejected("denied")));
    assert!(fixture.client.connections().await.unwrap().is_empty());
    assert!(fixture.server.connections().await.unwrap().is_empty());
    assert_eq!(
        fixture
            .client_events
            .count(|event| matches!(event, Event::Connected { .. })),
        0
    );

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_graceful_close_notifies_both_sides() {
    let fixture = TwoPeerFixture::new().await;
    let (connection, _) = fixture.connect(None, None).await.unwrap();

    connection.close().await;
    assert!(!connection.is_connected());

    fixture
        .server_events
        .wait_for(|events| {
            events.iter().find_map(|event| match event {
                Event::Disconnected { error, .. } => Some(assert_eq!(*error, None)),
                _ => None,
            })
        })
        .await;
    assert!(fixture.client_events.events().contains(&Event::Disconnected {
        connection: connection.id(),
        error: None,
    }));
    assert!(matches!(
        connection.send("late".to_string(), Reliability::Ordered),
        Err(NetworkError::Closed)
    ));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let fixture = TwoPeerFixture::new().await;
    let (connection, _) = fixture.connect(None, None).await.unwrap();

    fixture.server.shutdown().await;
    assert!(!fixture.network.is_bound(SERVER));

    fixture
        .client_events
        .wait_for(|events| {
            events
                .contains(&Event::Disconnected {
                    connection: connection.id(),
                    error: None,
                })
                .then_some(())
        })
        .await;
    assert!(!connection.is_connected());

    fixture.client.shutdown().await;
}

#[tokio::test]
async fn test_close_host_stops_accepting() {
    let network = MemoryNetwork::new();
    let fixture = TwoPeerFixture::new().await;
    let second = fixture
        .server
        .host(Arc::new(network.listener("second")))
        .await
        .unwrap();
    assert!(network.is_bound("second"));

    fixture.server.close_host(second).await.unwrap();
    assert!(!network.is_bound("second"));
    assert!(network.dial("second", "client").is_err());

    // The first host is untouched
    assert!(fixture.connect(None, None).await.is_ok());
    fixture.shutdown().await;
}

// ============================================================================
// Messages and Requests
// ============================================================================

#[tokio::test]
async fn test_messages_and_requests() {
    let fixture = TwoPeerFixture::new().await;
    let (connection, _) = fixture.connect(None, None).await.unwrap();

    connection
        .send("hello".to_string(), Reliability::Ordered)
        .unwrap();
    fixture
        .server_events
        .wait_for(|events| {
            events.iter().find_map(|event| match event {
                Event::Received { message, .. } => Some(assert_eq!(message, "hello")),
                _ => None,
            })
        })
        .await;

    let reply = connection.request("ping".to_string(), None).await.unwrap();
    assert_eq!(reply, "echo ping");

    let refused = connection.request("refuse".to_string(), None).await;
    assert_eq!(refused.err(), Some(NetworkError::rejected("refused")));

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_releases_id_after_delay() {
    let mut config = NetworkConfig::default();
    config.connection.request_timeout = Duration::from_millis(100);
    config.connection.request_id_reuse_delay = Duration::from_secs(1);
    let fixture = TwoPeerFixture::with_config(config).await;
    let (connection, _) = fixture.connect(None, None).await.unwrap();

    let started = Instant::now();
    let result = connection.request("ignore".to_string(), None).await;
    assert!(matches!(result, Err(NetworkError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(100));

    // ID 1 is parked; the next request gets a fresh ID
    assert_eq!(
        connection.request("ping".to_string(), None).await.unwrap(),
        "echo ping"
    );
    assert_eq!(requests(&fixture.server_events.events()), vec![1, 2]);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(
        connection.request("ping".to_string(), None).await.unwrap(),
        "echo ping"
    );
    assert_eq!(requests(&fixture.server_events.events()), vec![1, 2, 1]);

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_honours_explicit_timeout() {
    let fixture = TwoPeerFixture::new().await;
    let (connection, _) = fixture.connect(None, None).await.unwrap();

    let started = Instant::now();
    let result = connection
        .request("ignore".to_string(), Some(Duration::from_millis(250)))
        .await;
    assert!(matches!(result, Err(NetworkError::Timeout(_))));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_secs(3));

    fixture.shutdown().await;
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_authenticated_connect_is_secure() {
    let fixture = TwoPeerFixture::with_config(secure_config()).await;
    fixture.directory.insert_secret("alice", "hunter2").unwrap();

    let (connection, response) = fixture
        .connect(Some("hi"), Some(Credentials::login("alice", "hunter2")))
        .await
        .unwrap();
    assert_eq!(response.as_deref(), Some("welcome"));
    assert!(connection.is_secure());
    assert_eq!(connection.user().unwrap().identifier, "alice");

    let servers = fixture.server.connections().await.unwrap();
    assert_eq!(servers.len(), 1);
    assert!(servers[0].is_secure());
    assert_eq!(servers[0].user().unwrap().identifier, "alice");

    assert_eq!(
        connection.request("ping".to_string(), None).await.unwrap(),
        "echo ping"
    );
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_wrong_secret_fails_authentication() {
    let fixture = TwoPeerFixture::with_config(secure_config()).await;
    fixture.directory.insert_secret("alice", "hunter2").unwrap();

    let result = fixture
        .connect(None, Some(Credentials::login("alice", "wrong")))
        .await;
    match result {
        Err(NetworkError::Authentication(reason)) => assert_eq!(reason, AUTHENTICATION_FAILED),
        other => panic!("expected authentication failure, got {:?}", other.err()),
    }
    assert!(fixture.server.connections().await.unwrap().is_empty());
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_unknown_user_fails_authentication() {
    let fixture = TwoPeerFixture::with_config(secure_config()).await;

    let result = fixture
        .connect(None, Some(Credentials::login("mallory", "secret")))
        .await;
    assert!(matches!(result, Err(NetworkError::Authentication(_))));
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_authentication_required() {
    let fixture = TwoPeerFixture::with_config(secure_config()).await;

    let result = fixture.connect(None, None).await;
    match result {
        Err(NetworkError::Authentication(reason)) => assert_eq!(reason, AUTHENTICATION_REQUIRED),
        other => panic!("expected authentication failure, got {:?}", other.err()),
    }
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_registration() {
    let mut config = secure_config();
    config.auth.allow_registration = true;
    let fixture = TwoPeerFixture::with_config(config).await;

    let (connection, _) = fixture
        .connect(None, Some(Credentials::register("bob", "swordfish")))
        .await
        .unwrap();
    assert!(connection.is_secure());
    assert!(fixture.directory.lookup("bob").is_some());
    connection.close().await;

    // Taken identifiers cannot be registered again
    let again = fixture
        .connect(None, Some(Credentials::register("bob", "other")))
        .await;
    assert!(matches!(again, Err(NetworkError::Authentication(_))));

    // The registered secret logs in
    let (connection, _) = fixture
        .connect(None, Some(Credentials::login("bob", "swordfish")))
        .await
        .unwrap();
    assert_eq!(connection.user().unwrap().identifier, "bob");

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_registration_disabled() {
    let fixture = TwoPeerFixture::with_config(secure_config()).await;

    let result = fixture
        .connect(None, Some(Credentials::register("bob", "swordfish")))
        .await;
    assert!(matches!(result, Err(NetworkError::Authentication(_))));
    assert!(fixture.directory.lookup("bob").is_none());
    fixture.shutdown().await;
}

// ============================================================================
// Local Connections
// ============================================================================

#[tokio::test]
async fn test_local_pair() {
    let fixture = TwoPeerFixture::new().await;
    let pair = fixture.server.connect_local(Some("hi".to_string())).await.unwrap();
    assert_eq!(pair.response.as_deref(), Some("welcome"));
    assert!(pair.outgoing.is_local());
    assert!(pair.outgoing.is_secure());

    pair.outgoing
        .send("hello".to_string(), Reliability::Unreliable)
        .unwrap();
    assert!(fixture.server_events.events().contains(&Event::Received {
        connection: pair.incoming.id(),
        message: "hello".to_string(),
    }));

    let reply = pair.outgoing.request("ping".to_string(), None).await.unwrap();
    assert_eq!(reply, "echo ping");

    pair.outgoing.close().await;
    assert!(!pair.incoming.is_connected());
    assert_eq!(
        fixture
            .server_events
            .count(|event| matches!(event, Event::Disconnected { error: None, .. })),
        2
    );

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_local_channel() {
    let fixture = TwoPeerFixture::new().await;
    let pair = fixture.server.connect_local(None).await.unwrap();
    let incoming: tether_core::ConnectionRef<String> = pair.incoming.clone();

    let channel = fixture
        .server
        .open_channel(Some("profile".to_string()))
        .await
        .unwrap();
    channel.update("v1".to_string()).unwrap();
    channel.open(&incoming).unwrap();

    let outgoing = pair.outgoing.id();
    let id = channel.id();
    fixture
        .server_events
        .wait_for(|events| {
            events
                .contains(&Event::ChannelUpdate {
                    connection: outgoing,
                    channel: id,
                    message: "v1".to_string(),
                })
                .then_some(())
        })
        .await;
    assert!(fixture.server_events.events().contains(&Event::ChannelOpened {
        connection: outgoing,
        channel: id,
        profile: Some("profile".to_string()),
    }));

    channel.close().unwrap();
    fixture
        .server_events
        .wait_for(|events| {
            events
                .contains(&Event::ChannelClosed {
                    connection: outgoing,
                    channel: id,
                })
                .then_some(())
        })
        .await;

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_channel_closes_and_releases_id() {
    let fixture = TwoPeerFixture::new().await;
    let pair = fixture.server.connect_local(None).await.unwrap();
    let incoming: tether_core::ConnectionRef<String> = pair.incoming.clone();

    let channel = fixture.server.open_channel(None).await.unwrap();
    let id = channel.id();
    channel.open(&incoming).unwrap();
    drop(channel);

    let outgoing = pair.outgoing.id();
    fixture
        .server_events
        .wait_for(|events| {
            events
                .contains(&Event::ChannelClosed {
                    connection: outgoing,
                    channel: id,
                })
                .then_some(())
        })
        .await;

    let delay = NetworkConfig::default().channel.channel_id_reuse_delay;
    tokio::time::sleep(delay + Duration::from_millis(1)).await;
    let reopened = fixture.server.open_channel(None).await.unwrap();
    assert_eq!(reopened.id(), id);

    fixture.shutdown().await;
}

// ============================================================================
// Channels
// ============================================================================

#[tokio::test]
async fn test_channel_replication() {
    let fixture = TwoPeerFixture::new().await;
    let (connection, _) = fixture.connect(None, None).await.unwrap();
    let server_side = fixture.server.connections().await.unwrap().remove(0);

    let channel = fixture
        .server
        .open_channel(Some("scores".to_string()))
        .await
        .unwrap();
    channel.open(&server_side).unwrap();
    channel.update("a".to_string()).unwrap();
    channel.update("b".to_string()).unwrap();
    // Unchanged values are skipped
    channel.update("b".to_string()).unwrap();
    channel.update("c".to_string()).unwrap();

    let client = connection.id();
    let id = channel.id();
    fixture
        .client_events
        .wait_for(|events| {
            events
                .contains(&Event::ChannelUpdate {
                    connection: client,
                    channel: id,
                    message: "c".to_string(),
                })
                .then_some(())
        })
        .await;

    let updates: Vec<String> = fixture
        .client_events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::ChannelUpdate { message, .. } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec!["a", "b", "c"]);
    assert!(fixture.client_events.events().contains(&Event::ChannelOpened {
        connection: client,
        channel: id,
        profile: Some("scores".to_string()),
    }));

    channel.close_for(&server_side).unwrap();
    fixture
        .client_events
        .wait_for(|events| {
            events
                .contains(&Event::ChannelClosed {
                    connection: client,
                    channel: id,
                })
                .then_some(())
        })
        .await;

    fixture.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_channel_resends_until_acknowledged() {
    let fixture = TwoPeerFixture::new().await;
    let mut acking = RawPeer::dial(&fixture.network, SERVER, "acking").await;
    let mut silent = RawPeer::dial(&fixture.network, SERVER, "silent").await;
    assert_eq!(acking.connect(None).await.as_deref(), Some("welcome"));
    assert_eq!(silent.connect(None).await.as_deref(), Some("welcome"));

    let connections = fixture.server.connections().await.unwrap();
    assert_eq!(connections.len(), 2);
    let channel = fixture.server.open_channel(None).await.unwrap();
    for connection in &connections {
        channel.open(connection).unwrap();
    }
    channel.update("v1".to_string()).unwrap();

    for peer in [&mut acking, &mut silent] {
        loop {
            match peer.next().await.unwrap() {
                Frame::Update {
                    channel: id,
                    sequence,
                    message,
                } => {
                    assert_eq!(id, channel.id());
                    assert_eq!(sequence, 1);
                    assert_eq!(message, "v1");
                    break;
                }
                Frame::Control(ControlMessage::OpenChannel { channel: id, .. }) => {
                    assert_eq!(id, channel.id());
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
    acking.sync(channel.id(), 1).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    let is_update = |frame: &Frame<String>| matches!(frame, Frame::Update { sequence: 1, .. });
    assert_eq!(acking.drain().iter().filter(|f| is_update(*f)).count(), 0);
    assert!(silent.drain().iter().filter(|f| is_update(*f)).count() >= 1);

    // Once acknowledged, resends stop
    silent.sync(channel.id(), 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    silent.drain();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(silent.drain().is_empty());

    fixture.shutdown().await;
}

// ============================================================================
// Misbehaving Peers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_setup_timeout_disconnects_idle_peer() {
    let mut config = NetworkConfig::default();
    config.connection.setup_timeout = Duration::from_millis(500);
    let fixture = TwoPeerFixture::with_config(config).await;
    let mut idle = RawPeer::dial(&fixture.network, SERVER, "idle").await;

    let started = Instant::now();
    assert_eq!(
        idle.next().await,
        Some(Frame::Control(ControlMessage::Disconnect {
            reason: Some("setup timeout".to_string()),
        }))
    );
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(idle.next().await, None);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_channel_flood_disconnects_peer() {
    let mut config = NetworkConfig::default();
    config.channel.max_received_channels = 2;
    let fixture = TwoPeerFixture::with_config(config).await;
    let mut flooder = RawPeer::dial(&fixture.network, SERVER, "flooder").await;
    assert_eq!(flooder.connect(None).await.as_deref(), Some("welcome"));

    // Reopening a known channel does not count against the cap
    for channel in [1, 2, 2] {
        flooder
            .send_control(ControlMessage::OpenChannel {
                channel,
                profile: None,
            })
            .await;
    }
    flooder
        .send_control(ControlMessage::OpenChannel {
            channel: 3,
            profile: None,
        })
        .await;

    assert_eq!(
        flooder.next().await,
        Some(Frame::Control(ControlMessage::Disconnect {
            reason: Some("protocol error: too many channels".to_string()),
        }))
    );
    let opened = fixture
        .server_events
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::ChannelOpened { .. }))
        .count();
    assert_eq!(opened, 3);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_frame_before_connect_is_rejected() {
    let fixture = TwoPeerFixture::new().await;
    let mut early = RawPeer::dial(&fixture.network, SERVER, "early").await;

    let outbound = early
        .format()
        .message(0, &"early".to_string(), Reliability::Ordered)
        .unwrap();
    early.send(&outbound).await;

    assert_eq!(
        early.next().await,
        Some(Frame::Control(ControlMessage::Disconnect {
            reason: Some("protocol error: frame before connect".to_string()),
        }))
    );
    assert_eq!(early.next().await, None);
    assert_eq!(
        fixture
            .server_events
            .count(|event| matches!(event, Event::Received { .. })),
        0
    );
    assert!(early.stats().bytes_sent > 0);

    fixture.shutdown().await;
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_tcp_end_to_end() {
    let fixture = TwoPeerFixture::with_config(secure_config()).await;
    fixture.directory.insert_secret("alice", "hunter2").unwrap();

    let host = Arc::new(TcpHost::new("127.0.0.1:0".parse().unwrap()));
    let listener: Arc<dyn Listener> = host.clone();
    fixture.server.host(listener).await.unwrap();
    let addr = host.local_addr().await.unwrap();

    let (connection, response) = fixture
        .client
        .connect(
            Arc::new(TcpLink::dial(addr)),
            None,
            Some(Credentials::login("alice", "hunter2")),
        )
        .await
        .unwrap();
    assert_eq!(response.as_deref(), Some("welcome"));
    assert!(connection.is_secure());
    assert_eq!(
        connection.request("over tcp".to_string(), None).await.unwrap(),
        "echo over tcp"
    );

    fixture.shutdown().await;
}
