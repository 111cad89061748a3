//! End-to-end service behaviour over the in-memory transport.
//!
//! All tests run on paused time; the runtime auto-advances to the next
//! timer whenever every task is idle, so backoff and heartbeat schedules
//! are observed exactly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_cache::{CacheCoordinator, TtlPolicy};
use courier_core::{
    ChangeRecord, ConnectionChange, ErrorSource, HandlerError, MessageRecord, PresenceEvent,
    RealtimeEvent, RealtimeHandler, TypingEvent,
};
use courier_realtime::{
    ChannelKey, ChannelSpec, ChannelState, ConnectionPhase, MemoryTransport, RealtimeConfig,
    RealtimeError, RealtimeService, SubscriptionId, Transport, TransportError,
    TransportSubscription,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast::Receiver;
use tokio_test::{assert_err, assert_ok};

fn config() -> RealtimeConfig {
    RealtimeConfig {
        heartbeat_interval_ms: 1_000,
        monitor_interval_ms: 200,
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 800,
        max_reconnect_attempts: 5,
        ..Default::default()
    }
}

async fn service_on(transport: &MemoryTransport, config: RealtimeConfig) -> Arc<RealtimeService> {
    let cache = Arc::new(CacheCoordinator::local_only(100, TtlPolicy::default()));
    let service = assert_ok!(RealtimeService::new(
        config,
        Arc::new(transport.clone()),
        Some(cache)
    ));
    assert_ok!(service.start().await);
    service
}

async fn started() -> (Arc<RealtimeService>, MemoryTransport, Receiver<RealtimeEvent>) {
    let transport = MemoryTransport::new();
    let service = service_on(&transport, config()).await;
    let rx = service.events();
    assert!(service.get_connection_status().is_connected);
    (service, transport, rx)
}

/// Next bus event matching `pred`, skipping others.
async fn next_matching(
    rx: &mut Receiver<RealtimeEvent>,
    pred: impl Fn(&RealtimeEvent) -> bool,
) -> RealtimeEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("bus closed: {e}"),
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

async fn connection_change(rx: &mut Receiver<RealtimeEvent>, change: ConnectionChange) {
    next_matching(rx, |e| *e == RealtimeEvent::ConnectionChanged(change)).await;
}

/// Paused time only advances once every task is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Memory transport whose subscribe calls take a while and can be armed
/// to lose the connection on the next one.
#[derive(Clone)]
struct SlowSubscribe {
    inner: MemoryTransport,
    lose_next: Arc<AtomicBool>,
}

impl SlowSubscribe {
    const DELAY: Duration = Duration::from_millis(50);

    fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            lose_next: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for SlowSubscribe {
    fn name(&self) -> &str {
        "slow-subscribe"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        self.inner.heartbeat().await
    }

    async fn subscribe(&self, spec: &ChannelSpec) -> Result<TransportSubscription, TransportError> {
        tokio::time::sleep(Self::DELAY).await;
        if self.lose_next.swap(false, Ordering::SeqCst) {
            self.inner.drop_connection();
            return Err(TransportError::ConnectionLost("dropped mid-subscribe".into()));
        }
        self.inner.subscribe(spec).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.inner.unsubscribe(id).await
    }

    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> Result<(), TransportError> {
        self.inner.broadcast(topic, event, payload).await
    }

    async fn track(&self, topic: &str, key: &str) -> Result<(), TransportError> {
        self.inner.track(topic, key).await
    }

    async fn untrack(&self, topic: &str, key: &str) -> Result<(), TransportError> {
        self.inner.untrack(topic, key).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }
}

async fn service_over(transport: &SlowSubscribe) -> Arc<RealtimeService> {
    let cache = Arc::new(CacheCoordinator::local_only(100, TtlPolicy::default()));
    let service = assert_ok!(RealtimeService::new(
        config(),
        Arc::new(transport.clone()),
        Some(cache)
    ));
    assert_ok!(service.start().await);
    service
}

fn message_insert(id: &str, thread_id: &str) -> ChangeRecord {
    ChangeRecord::insert("messages", json!({"id": id, "thread_id": thread_id, "content": "hi"}))
}

#[tokio::test(start_paused = true)]
async fn test_subscribing_twice_opens_one_transport_subscription() {
    let (service, transport, _rx) = started().await;

    let first = assert_ok!(service.subscribe_to_thread("t1", "u1").await);
    let second = assert_ok!(service.subscribe_to_thread("t1", "u1").await);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(transport.subscribe_calls(), 1);
    assert_eq!(service.channels(), vec![ChannelKey::thread("t1")]);
}

#[tokio::test(start_paused = true)]
async fn test_changes_reach_handlers_in_order() {
    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RealtimeHandler for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn on_new_message(&self, message: &MessageRecord) -> Result<(), HandlerError> {
            self.seen.lock().push(message.id.clone());
            Ok(())
        }
    }

    let (service, transport, mut rx) = started().await;
    let handler = Arc::new(Collect::default());
    service.set_callbacks(handler.clone()).await;
    assert_ok!(service.subscribe_to_thread("t1", "u1").await);

    for id in ["m1", "m2", "m3"] {
        transport.publish_change(message_insert(id, "t1"));
    }
    // Other threads are filtered out by the channel
    transport.publish_change(message_insert("x1", "t2"));

    for _ in 0..3 {
        next_matching(&mut rx, |e| matches!(e, RealtimeEvent::NewMessage(_))).await;
    }
    settle().await;
    assert_eq!(*handler.seen.lock(), vec!["m1", "m2", "m3"]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backs_off_then_gives_up_once() {
    let transport = MemoryTransport::new();
    transport.set_fail_connect(true);
    let cache = Arc::new(CacheCoordinator::local_only(10, TtlPolicy::default()));
    let service = assert_ok!(RealtimeService::new(
        config(),
        Arc::new(transport.clone()),
        Some(cache)
    ));
    let mut rx = service.events();
    assert_ok!(service.start().await);

    let terminal = next_matching(&mut rx, |e| e.as_error().is_some_and(|e| e.terminal)).await;
    assert_eq!(terminal.as_error().map(|e| e.source), Some(ErrorSource::Reconnect));

    // One initial connect plus five attempts
    let calls = transport.connect_calls();
    assert_eq!(calls.len(), 6);
    let gaps: Vec<u64> = calls
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![100, 200, 400, 800, 800]);

    let status = service.get_connection_status();
    assert_eq!(status.phase, ConnectionPhase::Failed);
    assert_eq!(status.reconnect_attempts, 5);
    assert!(!status.is_connected);

    // Nothing further is scheduled and the terminal error is not repeated
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connect_calls().len(), 6);
    while let Ok(event) = rx.try_recv() {
        assert!(!event.as_error().is_some_and(|e| e.terminal));
    }

    // Explicit trigger brings it back
    transport.set_fail_connect(false);
    assert_ok!(service.reconnect());
    connection_change(&mut rx, ConnectionChange::Connected).await;
    assert_eq!(service.get_connection_status().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes_every_channel() {
    let (service, transport, mut rx) = started().await;
    assert_ok!(service.subscribe_to_thread("t1", "u1").await);
    assert_ok!(service.subscribe_to_notifications("u1").await);
    assert_eq!(transport.subscribe_calls(), 2);

    transport.drop_connection();
    connection_change(&mut rx, ConnectionChange::Disconnected).await;
    connection_change(&mut rx, ConnectionChange::Connected).await;

    assert_eq!(transport.subscribe_calls(), 4);
    assert_eq!(transport.active_topics(), vec!["notifications:u1", "thread:t1"]);
    let status = service.get_connection_status();
    assert!(status.is_connected);
    assert_eq!(status.active_channel_count, 2);

    transport.publish_change(message_insert("m1", "t1"));
    let event = next_matching(&mut rx, |e| matches!(e, RealtimeEvent::NewMessage(_))).await;
    assert!(matches!(event, RealtimeEvent::NewMessage(m) if m.id == "m1"));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_while_disconnected_is_retried_after_connect() {
    let transport = MemoryTransport::new();
    transport.fail_next_connects(1);
    let service = service_on(&transport, config()).await;
    let mut rx = service.events();

    // Registered even though the transport is down
    let channel = assert_ok!(service.subscribe_to_thread("t1", "u1").await);
    assert!(!channel.is_joined());

    connection_change(&mut rx, ConnectionChange::Connected).await;
    assert!(channel.is_joined());
    assert_eq!(transport.active_topics(), vec!["thread:t1"]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_transport_is_detected_as_stale() {
    let (service, transport, mut rx) = started().await;
    assert_ok!(service.subscribe_to_thread("t1", "u1").await);
    let silenced_at = tokio::time::Instant::now();
    transport.set_silent(true);

    connection_change(&mut rx, ConnectionChange::Disconnected).await;
    // Stale only after twice the heartbeat interval
    assert!(silenced_at.elapsed() >= Duration::from_secs(2));
    transport.set_silent(false);

    connection_change(&mut rx, ConnectionChange::Connected).await;
    assert_eq!(transport.connect_calls().len(), 2);
    assert_eq!(transport.active_subscriptions(), 1);
    assert!(service.get_connection_status().last_heartbeat_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_presence_join_and_leave_notify_peers_only() {
    let transport = MemoryTransport::new();
    let me = service_on(&transport, config()).await;
    let peer = service_on(&transport, config()).await;
    let mut rx = me.events();

    assert_ok!(me.subscribe_to_presence("me").await);
    assert_ok!(peer.subscribe_to_presence("u2").await);

    let joined = next_matching(&mut rx, |e| matches!(e, RealtimeEvent::UserOnline(_))).await;
    assert_eq!(
        joined,
        RealtimeEvent::UserOnline(PresenceEvent {
            user_id: "u2".into(),
            is_online: true
        })
    );
    assert_eq!(me.get_online_users(), vec!["u2"]);
    settle().await;
    // The peer saw us through the initial sync, which is silent
    assert_eq!(peer.get_online_users(), vec!["me"]);

    assert_ok!(peer.unsubscribe(&ChannelKey::presence("online_users")).await);
    let left = next_matching(&mut rx, |e| matches!(e, RealtimeEvent::UserOnline(_))).await;
    assert_eq!(
        left,
        RealtimeEvent::UserOnline(PresenceEvent {
            user_id: "u2".into(),
            is_online: false
        })
    );
    assert!(me.get_online_users().is_empty());

    settle().await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, RealtimeEvent::UserOnline(_)), "extra {event:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_typing_between_two_clients() {
    let transport = MemoryTransport::new();
    let me = service_on(&transport, config()).await;
    let peer = service_on(&transport, config()).await;
    let mut rx = me.events();

    assert_ok!(me.subscribe_to_thread("t1", "me").await);
    assert_ok!(peer.subscribe_to_thread("t1", "u2").await);
    me.listen_to_typing("t1");

    assert!(peer.send_typing_indicator("t1", "u2", true).await);
    let started = next_matching(&mut rx, |e| matches!(e, RealtimeEvent::UserTyping(_))).await;
    assert_eq!(
        started,
        RealtimeEvent::UserTyping(TypingEvent {
            thread_id: "t1".into(),
            user_id: "u2".into(),
            is_typing: true
        })
    );
    assert_eq!(me.get_typing_users("t1"), vec!["u2"]);

    // Our own echo never shows up
    assert!(me.send_typing_indicator("t1", "me", true).await);
    settle().await;
    assert_eq!(me.get_typing_users("t1"), vec!["u2"]);

    assert!(peer.send_typing_indicator("t1", "u2", false).await);
    next_matching(&mut rx, |e| matches!(e, RealtimeEvent::UserTyping(t) if !t.is_typing)).await;
    assert!(me.get_typing_users("t1").is_empty());
    // Not listening on the peer side
    assert!(peer.get_typing_users("t1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_typing_idle_timeout_clears_silent_typist() {
    let transport = MemoryTransport::new();
    let me = service_on(
        &transport,
        RealtimeConfig {
            typing_idle_timeout_ms: Some(1_000),
            ..config()
        },
    )
    .await;
    let peer = service_on(&transport, config()).await;
    let mut rx = me.events();
    assert_ok!(me.subscribe_to_thread("t1", "me").await);
    me.listen_to_typing("t1");

    assert!(peer.send_typing_indicator("t1", "u2", true).await);
    next_matching(&mut rx, |e| matches!(e, RealtimeEvent::UserTyping(t) if t.is_typing)).await;

    let stopped = next_matching(&mut rx, |e| matches!(e, RealtimeEvent::UserTyping(t) if !t.is_typing)).await;
    assert!(matches!(stopped, RealtimeEvent::UserTyping(t) if t.user_id == "u2"));
    assert!(me.get_typing_users("t1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_typing_signal_dropped_while_disconnected() {
    let (service, transport, _rx) = started().await;
    assert_ok!(service.subscribe_to_thread("t1", "u1").await);

    transport.drop_connection();

    assert!(!service.send_typing_indicator("t1", "u1", true).await);
    assert!(transport.broadcasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_destroy_releases_everything() {
    let (service, transport, _rx) = started().await;
    assert_ok!(service.subscribe_to_thread("t1", "u1").await);
    assert_ok!(service.subscribe_to_presence("u1").await);

    service.destroy().await;

    assert!(service.is_destroyed());
    assert_eq!(transport.active_subscriptions(), 0);
    assert!(!transport.is_connected());
    assert!(transport.presence_members("presence:online_users").is_empty());
    assert_eq!(service.get_connection_status().phase, ConnectionPhase::Disconnected);

    let err = assert_err!(service.subscribe_to_notifications("u1").await);
    assert!(matches!(err, RealtimeError::Destroyed));
    assert!(!service.send_typing_indicator("t1", "u1", true).await);

    // Timers are gone: no reconnect attempts follow the disconnect
    let connects = transport.connect_calls().len();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connect_calls().len(), connects);
}

#[tokio::test(start_paused = true)]
async fn test_connection_lost_during_resubscribe_keeps_reconnecting() {
    let memory = MemoryTransport::new();
    let transport = SlowSubscribe::new(memory.clone());
    let service = service_over(&transport).await;
    let mut rx = service.events();
    assert_ok!(service.subscribe_to_thread("t1", "u1").await);
    assert_eq!(memory.connect_calls().len(), 1);

    // The first reconnect drops again while re-opening t1
    transport.lose_next.store(true, Ordering::SeqCst);
    memory.drop_connection();

    connection_change(&mut rx, ConnectionChange::Disconnected).await;
    connection_change(&mut rx, ConnectionChange::Connected).await;

    let status = service.get_connection_status();
    assert_eq!(status.phase, ConnectionPhase::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.active_channel_count, 1);
    assert_eq!(memory.connect_calls().len(), 3);
    assert_eq!(memory.active_topics(), vec!["thread:t1"]);

    // Stays up afterwards
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(service.get_connection_status().is_connected);
    assert_eq!(memory.connect_calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_while_joining_releases_the_subscription() {
    let memory = MemoryTransport::new();
    let transport = SlowSubscribe::new(memory.clone());
    let service = service_over(&transport).await;

    let pending = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.subscribe_to_notifications("u1").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(assert_ok!(service.unsubscribe(&ChannelKey::notifications("u1")).await));

    let channel = assert_ok!(assert_ok!(pending.await));
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(service.channels().is_empty());
    assert_eq!(memory.active_subscriptions(), 0);
    assert_eq!(service.get_connection_status().active_channel_count, 0);

    // A later subscribe starts fresh
    let again = assert_ok!(service.subscribe_to_notifications("u1").await);
    assert!(again.is_joined());
    assert_eq!(memory.active_topics(), vec!["notifications:u1"]);
}
