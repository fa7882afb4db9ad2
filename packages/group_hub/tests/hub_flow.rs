//! End-to-end flows through connections, the dispatcher and the registry
//! using the in-memory transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use group_hub::memory::{self, MemoryPeer};
use group_hub::{
    Connection, ConnectionConfig, Frame, GroupRegistry, HubMetrics, MemberId, MessageDispatcher,
    DEFAULT_QUEUE_CAPACITY, MessageType, OutboundMessage, RegistryConfig, run_session,
};
use serde_json::{Value, json};

const LOBBY: &str = "lobby";

struct Hub {
    registry: Arc<GroupRegistry>,
    dispatcher: Arc<MessageDispatcher>,
}

impl Hub {
    fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    fn with_config(config: RegistryConfig) -> Self {
        let registry = GroupRegistry::new(config, HubMetrics::new());
        let dispatcher = Arc::new(MessageDispatcher::new(registry.clone(), LOBBY));
        Self {
            registry,
            dispatcher,
        }
    }

    fn quiet() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    /// Open a connection and serve it in the background.
    fn connect(&self) -> (Arc<Connection>, MemoryPeer) {
        self.connect_with(Self::quiet(), 64)
    }

    fn connect_with(
        &self,
        config: ConnectionConfig,
        transport_capacity: usize,
    ) -> (Arc<Connection>, MemoryPeer) {
        let (transport, peer) = memory::pair(transport_capacity);
        let conn = Connection::spawn(transport, self.registry.clone(), config);
        tokio::spawn(run_session(conn.clone(), self.dispatcher.clone()));
        (conn, peer)
    }
}

/// Raw text of the next non-heartbeat frame.
async fn next_text(peer: &mut MemoryPeer) -> String {
    loop {
        match peer.next_frame().await {
            Some(Frame::Text(text)) => {
                let msg: OutboundMessage = serde_json::from_str(&text).unwrap();
                if !msg.is_ping() {
                    return text;
                }
            }
            Some(_) => continue,
            None => panic!("connection closed before a message arrived"),
        }
    }
}

async fn wait_for_member(registry: &GroupRegistry, member_id: MemberId, present: bool) {
    for _ in 0..200 {
        if registry.contains(LOBBY, member_id).await == present {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("member {member_id} never became present={present}");
}

#[tokio::test]
async fn join_message_disconnect_scenario() {
    let hub = Hub::new();
    let (_alice_conn, mut alice) = hub.connect();

    alice.send_json(&json!({"service": "in_group", "data": {"id": 7, "username": "alice"}}));
    let notice = alice.next_application_message().await.unwrap();
    assert_eq!(notice.message_type, MessageType::Message);
    assert_eq!(notice.code, 0);
    assert_eq!(notice.data["id"], json!(7));
    assert_eq!(notice.data["username"], json!("alice"));
    assert!(hub.registry.contains(LOBBY, 7).await);

    alice.send_json(&json!({"service": "message", "data": "hi"}));
    assert_eq!(
        next_text(&mut alice).await,
        r#"{"code":0,"data":"hi","error":"","message_type":1}"#
    );

    alice.hang_up();
    wait_for_member(&hub.registry, 7, false).await;
    assert!(hub.registry.members(LOBBY).await.is_empty());
}

#[tokio::test]
async fn members_see_each_other_and_departures() {
    let hub = Hub::new();
    let (_a, mut alice) = hub.connect();
    let (bob_conn, mut bob) = hub.connect();

    alice.send_json(&json!({"service": "in_group", "data": {"id": 1, "username": "alice"}}));
    alice.next_application_message().await.unwrap();

    bob.send_json(&json!({"service": "in_group", "data": {"id": 2, "username": "bob"}}));
    let seen_by_alice = alice.next_application_message().await.unwrap();
    assert_eq!(
        seen_by_alice.data,
        json!({"event": "joined", "id": 2, "username": "bob"})
    );
    bob.next_application_message().await.unwrap();

    bob.send_json(&json!({"service": "exit_group"}));
    let seen_by_alice = alice.next_application_message().await.unwrap();
    assert_eq!(seen_by_alice.data, json!({"event": "left", "id": 2}));
    assert_eq!(hub.registry.members(LOBBY).await, vec![1]);

    // Leaving the group does not end the connection.
    bob.send_json(&json!({"service": "echo.test", "data": "still here"}));
    assert_eq!(
        bob.next_application_message().await.unwrap().data,
        json!("received text message")
    );
    assert!(bob_conn.is_open());
}

#[tokio::test]
async fn unknown_service_and_bad_frames_are_not_fatal() {
    let hub = Hub::new();
    let (conn, mut peer) = hub.connect();

    peer.send_json(&json!({"service": "nope", "data": {"x": 1}}));
    peer.send_text("{ not json");
    let reply = peer.next_application_message().await.unwrap();
    assert_eq!(reply.code, 500);
    assert_eq!(reply.error, "malformed message");
    assert_eq!(reply.message_type, MessageType::Message);

    peer.send_json(&json!({"service": "echo.test", "data": {"id": 4, "name": "d"}}));
    let reply = peer.next_application_message().await.unwrap();
    assert_eq!(reply.data, json!({"id": 4, "name": "d"}));
    assert!(conn.is_open());
    assert!(hub.registry.group_ids().await.is_empty());

    let snap = hub.registry.metrics().snapshot();
    assert_eq!(snap.messages.decode_errors, 1);
    assert_eq!(snap.messages.received, 2);
}

#[tokio::test]
async fn backpressure_preserves_order() {
    let hub = Hub::new();
    let config = ConnectionConfig {
        outbound_capacity: 4,
        ..Hub::quiet()
    };
    let (transport, mut peer) = memory::pair(1);
    let conn = Connection::spawn(transport, hub.registry.clone(), config);

    let sender = {
        let conn = conn.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                conn.send(OutboundMessage::message(i)).await.unwrap();
            }
        })
    };

    for i in 0..100 {
        let msg = peer.next_application_message().await.unwrap();
        assert_eq!(msg.data, json!(i));
    }
    sender.await.unwrap();
    assert!(conn.is_open());
}

#[tokio::test]
async fn default_queue_blocks_producer_then_drains_in_order() {
    let hub = Hub::new();
    let config = Hub::quiet();
    assert_eq!(config.outbound_capacity, DEFAULT_QUEUE_CAPACITY);
    let (transport, mut peer) = memory::pair(0);
    let conn = Connection::spawn(transport, hub.registry.clone(), config);

    let total = DEFAULT_QUEUE_CAPACITY + 500;
    let queued = Arc::new(AtomicUsize::new(0));
    let producer = {
        let conn = conn.clone();
        let queued = queued.clone();
        tokio::spawn(async move {
            for i in 0..total {
                conn.send(OutboundMessage::message(i)).await.unwrap();
                queued.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // Stalled peer: the queue fills and the producer parks.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let parked_at = queued.load(Ordering::SeqCst);
    assert!(!producer.is_finished());
    assert!(parked_at >= DEFAULT_QUEUE_CAPACITY - 2);
    assert!(parked_at <= DEFAULT_QUEUE_CAPACITY + 2);

    for i in 0..total {
        let msg = peer.next_application_message().await.unwrap();
        assert_eq!(msg.data, json!(i));
    }
    producer.await.unwrap();
    assert_eq!(queued.load(Ordering::SeqCst), total);
    assert!(conn.is_open());
}

#[tokio::test]
async fn fan_out_survives_broken_member() {
    let hub = Hub::new();
    let (_a, mut alice) = hub.connect();
    let (broken_conn, mut broken) = hub.connect();
    let (_c, mut carol) = hub.connect();

    for (peer, id) in [(&mut alice, 1), (&mut broken, 2), (&mut carol, 3)] {
        peer.send_json(&json!({"service": "in_group", "data": {"id": id, "username": "u"}}));
        wait_for_member(&hub.registry, id, true).await;
    }
    while tokio::time::timeout(Duration::from_millis(20), alice.next_application_message())
        .await
        .is_ok()
    {}
    while tokio::time::timeout(Duration::from_millis(20), carol.next_application_message())
        .await
        .is_ok()
    {}

    broken.drop_reader();
    alice.send_json(&json!({"service": "message", "data": "one"}));
    assert_eq!(alice.next_application_message().await.unwrap().data, json!("one"));
    assert_eq!(carol.next_application_message().await.unwrap().data, json!("one"));

    tokio::time::timeout(Duration::from_secs(2), broken_conn.wait_closed())
        .await
        .expect("broken member closes after its write fails");
    wait_for_member(&hub.registry, 2, false).await;

    carol.send_json(&json!({"service": "message", "data": "two"}));
    assert_eq!(alice.next_application_message().await.unwrap().data, json!("two"));
    assert_eq!(carol.next_application_message().await.unwrap().data, json!("two"));
    assert_eq!(hub.registry.members(LOBBY).await, vec![1, 3]);
}

#[tokio::test]
async fn close_is_idempotent_across_tasks() {
    let hub = Hub::new();
    let (conn, mut peer) = hub.connect();
    peer.send_json(&json!({"service": "in_group", "data": {"id": 5, "username": "e"}}));
    wait_for_member(&hub.registry, 5, true).await;

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await })
        })
        .collect();
    let mut winners = 0;
    for closer in closers {
        if closer.await.unwrap() {
            winners += 1;
        }
    }

    // The serve loop may also have raced to close; at most one call won.
    assert!(winners <= 1);
    assert!(conn.is_closed());
    assert!(!conn.close().await);
    assert!(!hub.registry.contains(LOBBY, 5).await);
    assert_eq!(hub.registry.metrics().snapshot().connections.active, 0);
    assert!(
        conn.send(OutboundMessage::message(Value::Null))
            .await
            .unwrap_err()
            .is_closed()
    );
}

#[tokio::test]
async fn shutdown_closes_every_member() {
    let hub = Hub::with_config(RegistryConfig {
        prune_empty_groups: true,
        ..Default::default()
    });
    let (a, mut pa) = hub.connect();
    let (b, mut pb) = hub.connect();
    pa.send_json(&json!({"service": "in_group", "data": {"id": 1}}));
    pb.send_json(&json!({"service": "in_group", "data": {"id": 2}}));
    wait_for_member(&hub.registry, 1, true).await;
    wait_for_member(&hub.registry, 2, true).await;

    let closed = hub.registry.close_all().await;
    assert_eq!(closed, 2);
    assert!(a.is_closed() && b.is_closed());
    assert!(hub.registry.group_ids().await.is_empty());
}
