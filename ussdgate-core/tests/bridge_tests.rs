// ABOUTME: Tests for the USSD session bridge: inbound waits, fulfillment, timeouts, and sweeping.
// ABOUTME: Runs on a paused tokio clock so wait timing is asserted exactly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ussdgate_core::bridge::{BridgeSettings, FulfillOutcome, InboundOutcome, InboundTurn, SessionBridge};
use ussdgate_core::channel::{ChannelConfig, CONFIG_START_MSG, CONFIG_STRIP_PREFIX, CONFIG_TIME_OUT};
use ussdgate_core::message::{InboundMessage, MsgStatus};
use ussdgate_core::{Backend, IngestFailurePolicy, Reply, SessionKey, TelUrn};

const SENDER: &str = "+250788383383";

#[derive(Default)]
struct MockBackend {
    inbound: Mutex<Vec<InboundMessage>>,
    fail_writes: bool,
}

impl MockBackend {
    fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    fn texts(&self) -> Vec<String> {
        self.inbound
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn channel(&self, _uuid: &Uuid) -> Result<Option<ChannelConfig>> {
        Ok(None)
    }

    async fn write_inbound(&self, msg: &InboundMessage) -> Result<()> {
        self.inbound.lock().unwrap().push(msg.clone());
        if self.fail_writes {
            anyhow::bail!("database unavailable");
        }
        Ok(())
    }

    async fn write_status(&self, _status: &MsgStatus) -> Result<()> {
        Ok(())
    }
}

fn channel(timeout_secs: i64) -> ChannelConfig {
    ChannelConfig::new(Uuid::new_v4(), Some("RW")).with_config(CONFIG_TIME_OUT, timeout_secs)
}

fn turn(session_id: &str, text: &str) -> InboundTurn {
    InboundTurn {
        session_id: session_id.to_string(),
        sender: TelUrn::for_country(SENDER, None).unwrap(),
        text: text.to_string(),
        service_code: "*384#".to_string(),
        message_id: None,
    }
}

fn bridge_with(backend: Arc<MockBackend>, settings: BridgeSettings) -> Arc<SessionBridge> {
    Arc::new(SessionBridge::new(backend, settings))
}

fn key(session_id: &str) -> SessionKey {
    SessionKey::new(SENDER, session_id)
}

/// Wait on the paused clock until the bridge has registered `session_id`.
async fn until_registered(bridge: &SessionBridge, session_id: &str) {
    for _ in 0..100 {
        if bridge.registry().contains(&key(session_id)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("session {} never registered", session_id);
}

#[tokio::test(start_paused = true)]
async fn test_fulfill_answers_blocked_request() {
    let backend = Arc::new(MockBackend::default());
    let bridge = bridge_with(backend.clone(), BridgeSettings::default());
    let ch = channel(1);

    let fulfiller = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            bridge.fulfill(SENDER, "K", "Hello", true)
        })
    };

    let start = Instant::now();
    let outcome = bridge.handle_inbound(&ch, turn("K", "*384#")).await;
    assert!(start.elapsed() < Duration::from_millis(150));
    assert_eq!(
        outcome,
        InboundOutcome::Reply(Reply {
            text: "Hello".to_string(),
            expects_response: true,
        })
    );
    assert!(fulfiller.await.unwrap().delivered());

    // Continuing session stays registered for the next turn.
    assert!(bridge.registry().lookup(&key("K")).is_some());
    assert_eq!(backend.texts(), vec!["*384#"]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_returns_and_releases_session() {
    // No `time_out` on the channel, so the bridge default applies.
    let ch = ChannelConfig::new(Uuid::new_v4(), Some("RW"));
    let settings = BridgeSettings {
        default_wait_timeout: Duration::from_millis(200),
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(Arc::new(MockBackend::default()), settings);

    let start = Instant::now();
    let outcome = bridge.handle_inbound(&ch, turn("K", "*384#")).await;
    assert_eq!(outcome, InboundOutcome::TimedOut);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(250));
    assert!(bridge.registry().lookup(&key("K")).is_none());
    assert!(bridge.registry().is_empty());

    // A late reply finds nothing and is dropped without blocking.
    assert_eq!(
        bridge.fulfill(SENDER, "K", "too late", true),
        FulfillOutcome::NoSession
    );
}

#[tokio::test(start_paused = true)]
async fn test_terminal_reply_removes_session() {
    let bridge = bridge_with(Arc::new(MockBackend::default()), BridgeSettings::default());
    let ch = channel(5);

    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
    };
    until_registered(&bridge, "K").await;
    assert!(bridge.fulfill(SENDER, "K", "Goodbye", false).delivered());

    let outcome = waiter.await.unwrap();
    assert_eq!(outcome.label(), "terminal");
    assert!(!bridge.registry().contains(&key("K")));
    assert_eq!(bridge.registry().stats().scheduled, 0);
}

#[tokio::test(start_paused = true)]
async fn test_continuing_session_second_turn() {
    let backend = Arc::new(MockBackend::default());
    let bridge = bridge_with(backend.clone(), BridgeSettings::default());
    let ch = channel(5)
        .with_config(CONFIG_START_MSG, "Welcome")
        .with_config(CONFIG_STRIP_PREFIX, true);

    for (text, reply) in [("ignored", "1. Balance"), ("1*2*3", "Your balance is 0")] {
        let waiter = {
            let bridge = Arc::clone(&bridge);
            let ch = ch.clone();
            let text = text.to_string();
            tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", &text)).await })
        };
        until_registered(&bridge, "K").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bridge.fulfill(SENDER, "K", reply, true).delivered());
        match waiter.await.unwrap() {
            InboundOutcome::Reply(r) => assert_eq!(r.text, reply),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    assert_eq!(backend.texts(), vec!["Welcome", "3"]);
    let stored = backend.inbound.lock().unwrap();
    assert!(stored
        .iter()
        .all(|m| m.external_id.as_deref() == Some("K")));
}

#[tokio::test(start_paused = true)]
async fn test_continuation_extends_idle_ttl() {
    let settings = BridgeSettings {
        session_idle_ttl: Duration::from_secs(60),
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(Arc::new(MockBackend::default()), settings);
    let ch = channel(1);

    bridge.handle_inbound(&ch, turn("K", "*384#")).await;
    // Timed out, so re-open and keep it alive with a continuing reply.
    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
    };
    until_registered(&bridge, "K").await;
    let first_expiry = bridge.registry().expires_at(&key("K")).unwrap();
    bridge.fulfill(SENDER, "K", "Menu", true);
    waiter.await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "2")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second_expiry = bridge.registry().expires_at(&key("K")).unwrap();
    assert!(second_expiry > first_expiry);
    bridge.fulfill(SENDER, "K", "Menu 2", true);
    waiter.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_correlation() {
    let backend = Arc::new(MockBackend::default());
    let bridge = bridge_with(backend.clone(), BridgeSettings::default());
    let ch = channel(1).with_config(CONFIG_START_MSG, "Welcome");

    let waiters: Vec<_> = (0..20)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            let ch = ch.clone();
            tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = bridge.registry().stats();
    assert_eq!(stats.registered, 1);
    assert_eq!(stats.scheduled, 1);

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), InboundOutcome::TimedOut);
    }
    let texts = backend.texts();
    assert_eq!(texts.len(), 20);
    assert_eq!(texts.iter().filter(|t| t.as_str() == "Welcome").count(), 1);
    assert!(bridge.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_reclaims_idle_sessions() {
    let settings = BridgeSettings {
        session_idle_ttl: Duration::from_secs(2),
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(Arc::new(MockBackend::default()), settings);
    let ch = channel(1);

    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
    };
    until_registered(&bridge, "K").await;
    bridge.fulfill(SENDER, "K", "Menu", true);
    waiter.await.unwrap();
    assert!(bridge.registry().contains(&key("K")));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(bridge.sweep(), 1);
    assert!(!bridge.registry().contains(&key("K")));
    assert_eq!(
        bridge.fulfill(SENDER, "K", "late", true),
        FulfillOutcome::NoSession
    );
}

#[tokio::test(start_paused = true)]
async fn test_background_sweeper_runs_without_traffic() {
    let settings = BridgeSettings {
        session_idle_ttl: Duration::from_secs(2),
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(Arc::new(MockBackend::default()), settings);
    let ch = channel(1);

    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
    };
    until_registered(&bridge, "K").await;
    bridge.fulfill(SENDER, "K", "Menu", true);
    waiter.await.unwrap();

    let cancel = CancellationToken::new();
    let sweeper = bridge.spawn_sweeper(Duration::from_secs(1), cancel.clone());
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(bridge.registry().is_empty());

    cancel.cancel();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_spares_session_with_blocked_request() {
    // Wait timeout longer than the idle TTL.
    let settings = BridgeSettings {
        session_idle_ttl: Duration::from_secs(10),
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(Arc::new(MockBackend::default()), settings);
    let ch = channel(30);
    let cancel = CancellationToken::new();
    let sweeper = bridge.spawn_sweeper(Duration::from_secs(1), cancel.clone());

    let start = Instant::now();
    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
    };
    until_registered(&bridge, "K").await;
    let expiry = bridge.registry().expires_at(&key("K")).unwrap();
    assert!(expiry >= start + Duration::from_secs(30));

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(bridge.registry().contains(&key("K")));
    assert!(bridge.fulfill(SENDER, "K", "Menu", true).delivered());
    match waiter.await.unwrap() {
        InboundOutcome::Reply(r) => assert_eq!(r.text, "Menu"),
        other => panic!("unexpected outcome: {:?}", other),
    }

    // A continuation turn gets the same bound.
    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "1")).await })
    };
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(bridge.fulfill(SENDER, "K", "Done", false).delivered());
    assert_eq!(waiter.await.unwrap().label(), "terminal");

    cancel.cancel();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ingest_failure_keeps_waiting_by_default() {
    let backend = Arc::new(MockBackend::failing());
    let bridge = bridge_with(backend, BridgeSettings::default());
    let ch = channel(5);

    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
    };
    until_registered(&bridge, "K").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(bridge.fulfill(SENDER, "K", "Menu", true).delivered());
    assert_eq!(waiter.await.unwrap().label(), "reply");
}

#[tokio::test(start_paused = true)]
async fn test_ingest_failure_can_fail_fast() {
    let settings = BridgeSettings {
        ingest_failure: IngestFailurePolicy::Fail,
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(Arc::new(MockBackend::failing()), settings);
    let ch = channel(5);

    let start = Instant::now();
    let outcome = bridge.handle_inbound(&ch, turn("K", "*384#")).await;
    assert!(matches!(outcome, InboundOutcome::IngestFailed(ref e) if e.contains("database")));
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(bridge.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_replies_are_not_served_to_next_turn() {
    let settings = BridgeSettings {
        reply_buffer: 1,
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(Arc::new(MockBackend::default()), settings);
    let ch = channel(1);

    let waiter = {
        let bridge = Arc::clone(&bridge);
        let ch = ch.clone();
        tokio::spawn(async move { bridge.handle_inbound(&ch, turn("K", "*384#")).await })
    };
    until_registered(&bridge, "K").await;
    bridge.fulfill(SENDER, "K", "Menu", true);
    waiter.await.unwrap();

    // Duplicate reply with nobody waiting fills the buffer; the next one is dropped.
    assert!(bridge.fulfill(SENDER, "K", "duplicate", true).delivered());
    assert_eq!(
        bridge.fulfill(SENDER, "K", "overflow", true),
        FulfillOutcome::BufferFull
    );

    // The next turn discards the duplicate and times out rather than replaying it.
    let outcome = bridge.handle_inbound(&ch, turn("K", "1")).await;
    assert_eq!(outcome, InboundOutcome::TimedOut);
}

#[test]
fn test_fulfill_without_session_never_blocks() {
    let bridge = SessionBridge::new(Arc::new(MockBackend::default()), BridgeSettings::default());
    for i in 0..1000 {
        let outcome = bridge.fulfill(SENDER, &format!("missing-{}", i), "hello", i % 2 == 0);
        assert_eq!(outcome, FulfillOutcome::NoSession);
    }
}
