// ABOUTME: Backend capability consumed by the gateway: channel lookup and message persistence.
// ABOUTME: Implementations own storage; the session bridge only writes inbound messages.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::channel::ChannelConfig;
use crate::message::{InboundMessage, MsgStatus};

#[async_trait]
pub trait Backend: Send + Sync {
    /// Resolve the configuration of an active channel.
    async fn channel(&self, uuid: &Uuid) -> Result<Option<ChannelConfig>>;

    /// Persist an inbound message so the flow engine can pick it up.
    async fn write_inbound(&self, msg: &InboundMessage) -> Result<()>;

    /// Persist the outcome of an outbound send.
    async fn write_status(&self, status: &MsgStatus) -> Result<()>;

    /// Short health summary for the health endpoint.
    async fn health(&self) -> String {
        "ok".to_string()
    }
}
