// ABOUTME: Canonical message model: inbound (MO) messages, outbound (MT) messages, and send statuses.
// ABOUTME: Statuses carry channel logs describing what happened on the wire for each send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::urn::TelUrn;

/// A mobile-originated message handed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub id: Uuid,
    pub channel_uuid: Uuid,
    pub urn: TelUrn,
    pub text: String,
    /// Provider session id; replies reference it as `response_to_external_id`.
    pub external_id: Option<String>,
    pub received_on: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(channel_uuid: Uuid, urn: TelUrn, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_uuid,
            urn,
            text: text.into(),
            external_id: None,
            received_on: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_received_on(mut self, received_on: DateTime<Utc>) -> Self {
        self.received_on = received_on;
        self
    }
}

/// Flow session state attached to outbound messages by the flow engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    #[serde(rename = "W")]
    Waiting,
    #[serde(rename = "C")]
    Completed,
    #[serde(rename = "I")]
    Interrupted,
    #[serde(rename = "X")]
    Expired,
    #[serde(rename = "F")]
    Failed,
}

/// A mobile-terminated message produced by the flow engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub urn: TelUrn,
    #[serde(default)]
    pub text: String,
    /// Attachments as `<content-type>:<url>`.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Session id of the inbound message this is a reply to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_status: Option<SessionStatus>,
}

impl OutboundMessage {
    pub fn new(urn: TelUrn, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            urn,
            text: text.into(),
            attachments: Vec::new(),
            response_to_external_id: None,
            session_status: None,
        }
    }

    pub fn in_reply_to(mut self, session_id: impl Into<String>) -> Self {
        self.response_to_external_id = Some(session_id.into());
        self
    }

    pub fn with_session_status(mut self, status: SessionStatus) -> Self {
        self.session_status = Some(status);
        self
    }

    /// True when the flow is waiting for the user to answer this message.
    pub fn expects_response(&self) -> bool {
        self.session_status == Some(SessionStatus::Waiting)
    }

    /// The session this message replies to, ignoring empty ids.
    pub fn reply_session(&self) -> Option<&str> {
        self.response_to_external_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Text followed by one attachment URL per line; USSD screens are text only.
    pub fn text_and_attachments(&self) -> String {
        let mut out = self.text.clone();
        for attachment in &self.attachments {
            let url = attachment
                .split_once(':')
                .map(|(_, url)| url)
                .unwrap_or(attachment);
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(url);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MsgStatusValue {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "W")]
    Wired,
    #[serde(rename = "S")]
    Sent,
    #[serde(rename = "D")]
    Delivered,
    #[serde(rename = "E")]
    Errored,
    #[serde(rename = "F")]
    Failed,
}

impl MsgStatusValue {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Pending => "P",
            Self::Wired => "W",
            Self::Sent => "S",
            Self::Delivered => "D",
            Self::Errored => "E",
            Self::Failed => "F",
        }
    }
}

/// Record of one provider interaction made while sending a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelLog {
    pub description: String,
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub request: String,
    pub response: String,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_on: DateTime<Utc>,
}

impl ChannelLog {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            method: String::new(),
            url: String::new(),
            status_code: 0,
            request: String::new(),
            response: String::new(),
            elapsed_ms: 0,
            error: None,
            created_on: Utc::now(),
        }
    }

    pub fn with_http(mut self, method: &str, url: &str, status_code: u16) -> Self {
        self.method = method.to_string();
        self.url = url.to_string();
        self.status_code = status_code;
        self
    }

    pub fn with_exchange(mut self, request: impl Into<String>, response: impl Into<String>) -> Self {
        self.request = request.into();
        self.response = response.into();
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Outcome of sending one outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MsgStatus {
    pub msg_id: Uuid,
    pub channel_uuid: Uuid,
    pub status: MsgStatusValue,
    #[serde(default)]
    pub logs: Vec<ChannelLog>,
}

impl MsgStatus {
    pub fn new(channel_uuid: Uuid, msg_id: Uuid, status: MsgStatusValue) -> Self {
        Self {
            msg_id,
            channel_uuid,
            status,
            logs: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: MsgStatusValue) {
        self.status = status;
    }

    pub fn add_log(&mut self, log: ChannelLog) {
        self.logs.push(log);
    }
}
