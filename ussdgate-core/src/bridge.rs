// ABOUTME: Synchronous USSD session bridge: answers a blocked provider request with the next prompt.
// ABOUTME: Correlates asynchronous flow-engine replies by session key, bounds waits, and sweeps idle sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::ChannelConfig;
use crate::config::{IngestFailurePolicy, UssdConfig};
use crate::message::InboundMessage;
use crate::metrics;
use crate::registry::{Correlation, CorrelationRegistry, Delivery, Reply};
use crate::session::SessionKey;
use crate::traits::Backend;
use crate::urn::TelUrn;

/// Body returned to the provider when no reply arrives in time.
pub const TIMEOUT_BODY: &str = "time out waiting for response";

/// Timing and buffering knobs for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub session_idle_ttl: Duration,
    pub default_wait_timeout: Duration,
    pub reply_buffer: usize,
    pub ingest_failure: IngestFailurePolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from(&UssdConfig::default())
    }
}

impl From<&UssdConfig> for BridgeSettings {
    fn from(config: &UssdConfig) -> Self {
        Self {
            session_idle_ttl: config.session_idle_ttl(),
            default_wait_timeout: config.default_wait_timeout(),
            reply_buffer: config.reply_buffer,
            ingest_failure: config.ingest_failure,
        }
    }
}

/// One validated inbound USSD request.
#[derive(Debug, Clone)]
pub struct InboundTurn {
    pub session_id: String,
    pub sender: TelUrn,
    pub text: String,
    pub service_code: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// The flow engine answered within the wait timeout.
    Reply(Reply),
    /// No reply arrived in time; the session was released.
    TimedOut,
    /// The backend refused the message and the policy is to fail fast.
    IngestFailed(String),
}

impl InboundOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reply(reply) if reply.expects_response => "reply",
            Self::Reply(_) => "terminal",
            Self::TimedOut => "timeout",
            Self::IngestFailed(_) => "ingest_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillOutcome {
    /// Reply queued for the waiting request.
    Delivered {
        /// Text of the request that opened the session.
        request: String,
        /// Time since the session was opened.
        elapsed: Duration,
    },
    /// No open session for this key: expired, never opened, or already closed.
    NoSession,
    /// The session's reply buffer is full and the reply was dropped.
    BufferFull,
}

impl FulfillOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Bridges provider HTTP requests and flow-engine replies for USSD sessions.
///
/// The bridge exclusively owns the correlation registry; everything else
/// reaches sessions through [`SessionBridge::handle_inbound`] and
/// [`SessionBridge::fulfill`].
pub struct SessionBridge {
    registry: CorrelationRegistry,
    backend: Arc<dyn Backend>,
    settings: BridgeSettings,
}

impl SessionBridge {
    pub fn new(backend: Arc<dyn Backend>, settings: BridgeSettings) -> Self {
        Self {
            registry: CorrelationRegistry::new(settings.reply_buffer),
            backend,
            settings,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Read access for health reporting and tests. Mutation stays inside the bridge.
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Register the turn, hand it to the backend, then wait for the reply.
    pub async fn handle_inbound(&self, channel: &ChannelConfig, turn: InboundTurn) -> InboundOutcome {
        let key = SessionKey::new(turn.sender.path(), &turn.session_id);
        let wait = channel.wait_timeout(self.settings.default_wait_timeout);
        // A session must outlive the request blocked on it.
        let expires_at = Instant::now() + self.settings.session_idle_ttl.max(wait);
        let (correlation, is_new) = self.registry.get_or_create(&key, &turn.text, expires_at);

        let text = if is_new {
            tracing::debug!(session_key = %key, channel_uuid = %channel.uuid, "USSD session opened");
            channel.start_msg().unwrap_or(turn.text)
        } else {
            let stale = correlation.discard_stale();
            if stale > 0 {
                tracing::warn!(session_key = %key, dropped = stale, "Dropped stale replies");
            }
            self.registry.reschedule(&key, expires_at);
            if channel.strip_prefix() {
                strip_navigation_prefix(&turn.text).to_string()
            } else {
                turn.text
            }
        };

        let msg = InboundMessage::new(channel.uuid, turn.sender.clone(), text)
            .with_external_id(turn.session_id.clone())
            .with_received_on(Utc::now());

        if let Err(e) = self.backend.write_inbound(&msg).await {
            tracing::error!(
                error = %e,
                session_key = %key,
                channel_uuid = %channel.uuid,
                "Failed to write inbound USSD message"
            );
            if self.settings.ingest_failure == IngestFailurePolicy::Fail {
                if is_new {
                    self.registry.remove_if_current(&correlation);
                }
                self.sweep();
                return InboundOutcome::IngestFailed(e.to_string());
            }
        }

        let started = Instant::now();
        let waited = tokio::time::timeout(wait, correlation.recv()).await;
        let outcome = match waited {
            Ok(Some(reply)) => {
                if !reply.expects_response {
                    self.registry.remove_if_current(&correlation);
                }
                InboundOutcome::Reply(reply)
            }
            Ok(None) | Err(_) => {
                self.registry.remove_if_current(&correlation);
                match recover_late_reply(&correlation) {
                    Some(reply) => InboundOutcome::Reply(reply),
                    None => {
                        tracing::info!(
                            session_key = %key,
                            wait_secs = wait.as_secs_f64(),
                            "Timed out waiting for USSD reply"
                        );
                        InboundOutcome::TimedOut
                    }
                }
            }
        };
        metrics::record_wait(started.elapsed());

        self.sweep();
        outcome
    }

    /// Deliver a flow-engine reply to whichever request is waiting on the session.
    ///
    /// Never blocks. Replies for sessions that are not open are dropped.
    pub fn fulfill(
        &self,
        sender: &str,
        session_id: &str,
        text: &str,
        expects_response: bool,
    ) -> FulfillOutcome {
        let key = SessionKey::new(sender, session_id);
        let reply = Reply {
            text: text.to_string(),
            expects_response,
        };
        let outcome = match self.registry.deliver(&key, reply) {
            Delivery::Delivered(correlation) => FulfillOutcome::Delivered {
                request: correlation.request().to_string(),
                elapsed: correlation.opened_at().elapsed(),
            },
            Delivery::NoSession => {
                tracing::debug!(session_key = %key, "No open USSD session for reply");
                FulfillOutcome::NoSession
            }
            Delivery::BufferFull => {
                tracing::warn!(session_key = %key, "USSD reply buffer full, dropping reply");
                FulfillOutcome::BufferFull
            }
        };
        metrics::record_fulfill(outcome.delivered());
        outcome
    }

    /// Unregister every session whose idle TTL has passed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let evicted = self.registry.sweep(Instant::now());
        for key in &evicted {
            tracing::debug!(session_key = %key, "Expired USSD session swept");
        }
        metrics::record_sessions_swept(evicted.len());
        metrics::set_active_sessions(self.registry.len());
        evicted.len()
    }

    /// Run [`SessionBridge::sweep`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("USSD session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let swept = bridge.sweep();
                        if swept > 0 {
                            tracing::info!(swept, "Swept expired USSD sessions");
                        }
                    }
                }
            }
        })
    }

    /// Channel uuid lookups go through the backend; exposed for the HTTP layer.
    pub async fn channel(&self, uuid: &Uuid) -> anyhow::Result<Option<ChannelConfig>> {
        self.backend.channel(uuid).await
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

/// Take a reply delivered just before the session was released. The session
/// is gone, so the reply is served as the final screen.
fn recover_late_reply(correlation: &Correlation) -> Option<Reply> {
    correlation.try_recv().map(|reply| Reply {
        expects_response: false,
        ..reply
    })
}

/// Everything after the last `*`; providers resend the whole menu path on each turn.
pub fn strip_navigation_prefix(input: &str) -> &str {
    match input.rfind('*') {
        Some(idx) => &input[idx + 1..],
        None => input,
    }
}
