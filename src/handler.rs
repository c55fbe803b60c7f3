// ABOUTME: USSD channel handler: turns provider requests into bridge turns and flow replies into sends.
// ABOUTME: Receive blocks on the session bridge; send either fulfills a waiting session or pushes.

use std::sync::Arc;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use ussdgate_core::bridge::{FulfillOutcome, InboundOutcome, InboundTurn, SessionBridge, TIMEOUT_BODY};
use ussdgate_core::message::{ChannelLog, MsgStatus, MsgStatusValue, OutboundMessage};
use ussdgate_core::{metrics, ChannelConfig, TelUrn};

use crate::push::PushClient;

/// Plain-text response written back to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponse {
    pub status: StatusCode,
    pub body: String,
}

impl TextResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

impl IntoResponse for TextResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "text/plain")],
            self.body,
        )
            .into_response()
    }
}

/// Form posted by the provider for every USSD turn.
///
/// Fields are optional here so that a missing one produces a 400 naming it
/// instead of a generic decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiveForm {
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(rename = "ussdString")]
    pub ussd_string: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "messageID")]
    pub message_id: Option<String>,
}

fn required(value: Option<String>, name: &str) -> Result<String, String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(format!("field '{}' is required", name)),
    }
}

impl ReceiveForm {
    /// Check required fields and normalise the sender for `country`.
    pub fn into_turn(self, country: Option<&str>) -> Result<InboundTurn, String> {
        let session_id = required(self.session_id, "sessionID")?;
        let text = required(self.ussd_string, "ussdString")?;
        let from = required(self.from, "from")?;
        let service_code = required(self.to, "to")?;
        let sender = TelUrn::for_country(&from, country).map_err(|e| e.to_string())?;
        Ok(InboundTurn {
            session_id,
            sender,
            text,
            service_code,
            message_id: self.message_id.filter(|id| !id.is_empty()),
        })
    }
}

pub struct UssdHandler {
    bridge: Arc<SessionBridge>,
    push: PushClient,
}

impl UssdHandler {
    pub fn new(bridge: Arc<SessionBridge>, push: PushClient) -> Self {
        Self { bridge, push }
    }

    pub fn bridge(&self) -> &Arc<SessionBridge> {
        &self.bridge
    }

    /// Handle one provider turn, blocking until the flow engine replies or the wait times out.
    pub async fn receive_message(&self, channel: &ChannelConfig, form: ReceiveForm) -> TextResponse {
        let turn = match form.into_turn(channel.country.as_deref()) {
            Ok(turn) => turn,
            Err(reason) => {
                tracing::warn!(channel_uuid = %channel.uuid, reason = %reason, "Rejected USSD request");
                metrics::record_inbound("bad_request");
                return TextResponse::new(StatusCode::BAD_REQUEST, reason);
            }
        };

        tracing::info!(
            channel_uuid = %channel.uuid,
            session_id = %turn.session_id,
            service_code = %turn.service_code,
            "USSD request received"
        );

        let outcome = self.bridge.handle_inbound(channel, turn).await;
        metrics::record_inbound(outcome.label());
        match outcome {
            InboundOutcome::Reply(reply) if reply.expects_response => {
                TextResponse::new(StatusCode::ACCEPTED, reply.text)
            }
            InboundOutcome::Reply(reply) => TextResponse::new(StatusCode::OK, reply.text),
            InboundOutcome::TimedOut => TextResponse::new(StatusCode::GATEWAY_TIMEOUT, TIMEOUT_BODY),
            InboundOutcome::IngestFailed(_) => {
                TextResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "error writing message")
            }
        }
    }

    /// Status callbacks carry nothing for USSD.
    pub fn receive_status(&self, channel: &ChannelConfig) -> TextResponse {
        tracing::debug!(channel_uuid = %channel.uuid, "Ignoring USSD status callback");
        TextResponse::new(StatusCode::OK, "ignored")
    }

    /// Send a flow-engine message: a reply to an open session, or a push.
    pub async fn send_msg(&self, channel: &ChannelConfig, msg: &OutboundMessage) -> MsgStatus {
        let text = msg.text_and_attachments();
        let mut status = MsgStatus::new(channel.uuid, msg.id, MsgStatusValue::Failed);

        match msg.reply_session() {
            Some(session_id) => {
                let outcome =
                    self.bridge
                        .fulfill(msg.urn.path(), session_id, &text, msg.expects_response());
                let log = match outcome {
                    FulfillOutcome::Delivered { request, elapsed } => {
                        status.set_status(MsgStatusValue::Wired);
                        let code = if msg.expects_response() {
                            StatusCode::ACCEPTED
                        } else {
                            StatusCode::OK
                        };
                        ChannelLog::new("Message Sent")
                            .with_http("GET", "", code.as_u16())
                            .with_exchange(request, text.as_str())
                            .with_elapsed(elapsed)
                    }
                    FulfillOutcome::NoSession => ChannelLog::new("Message Sent")
                        .with_http("GET", "", StatusCode::GATEWAY_TIMEOUT.as_u16())
                        .with_exchange("", text.as_str())
                        .with_error("timeout waiting for response"),
                    FulfillOutcome::BufferFull => ChannelLog::new("Message Sent")
                        .with_http("GET", "", StatusCode::SERVICE_UNAVAILABLE.as_u16())
                        .with_exchange("", text.as_str())
                        .with_error("reply buffer full for session"),
                };
                status.add_log(log);
            }
            None => self.push_msg(channel, msg, &text, &mut status).await,
        }

        if let Err(e) = self.bridge.backend().write_status(&status).await {
            tracing::error!(error = %e, msg_id = %msg.id, "Failed to write message status");
        }
        status
    }

    async fn push_msg(
        &self,
        channel: &ChannelConfig,
        msg: &OutboundMessage,
        text: &str,
        status: &mut MsgStatus,
    ) {
        let Some(push_url) = channel.push_url() else {
            metrics::record_push("unsupported");
            status.add_log(
                ChannelLog::new("Message cannot be sent, channel does not support USSD push")
                    .with_error("Please set the push URL"),
            );
            return;
        };

        let exchange = self
            .push
            .push(&push_url, msg.urn.path(), text, msg.expects_response())
            .await;
        let mut log = ChannelLog::new("Message Sent")
            .with_http("GET", &exchange.url, exchange.status_code)
            .with_exchange("", exchange.body.as_str())
            .with_elapsed(exchange.elapsed);
        if let Some(error) = &exchange.error {
            log = log.with_error(format!("Message Send Error: {}", error));
        }
        status.add_log(log);

        if exchange.is_success() {
            metrics::record_push("wired");
            status.set_status(MsgStatusValue::Wired);
        } else {
            metrics::record_push("failed");
        }
    }
}
