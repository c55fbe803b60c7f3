// ABOUTME: Platform-agnostic core of the USSD gateway
// ABOUTME: Session bridge, correlation registry, expiry queue, message model, config, and metrics

pub mod bridge;
pub mod channel;
pub mod config;
pub mod expiry;
pub mod message;
pub mod metrics;
pub mod paths;
pub mod registry;
pub mod session;
pub mod traits;
pub mod urn;

pub use bridge::{BridgeSettings, FulfillOutcome, InboundOutcome, InboundTurn, SessionBridge};
pub use channel::ChannelConfig;
pub use config::{Config, IngestFailurePolicy};
pub use message::{ChannelLog, InboundMessage, MsgStatus, MsgStatusValue, OutboundMessage, SessionStatus};
pub use registry::{CorrelationRegistry, Reply};
pub use session::SessionKey;
pub use traits::Backend;
pub use urn::TelUrn;
