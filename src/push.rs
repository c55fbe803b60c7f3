// ABOUTME: USSD push client for provider-initiated sessions with no inbound request to answer.
// ABOUTME: Issues a GET to the channel's push URL with the recipient, text, and respond flag.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};

const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened on the wire for one push request.
#[derive(Debug, Clone)]
pub struct PushExchange {
    pub url: String,
    pub status_code: u16,
    pub body: String,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl PushExchange {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }
}

#[derive(Clone)]
pub struct PushClient {
    http: reqwest::Client,
}

impl PushClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context("Failed to build push HTTP client")?;
        Ok(Self { http })
    }

    /// Send `message` to `to` through `push_url`. Transport errors are
    /// reported in the exchange rather than returned.
    pub async fn push(&self, push_url: &str, to: &str, message: &str, respond: bool) -> PushExchange {
        let url = build_push_url(push_url, to, message, respond);
        let started = Instant::now();

        let result = self.http.get(&url).send().await;
        let (status_code, body, error) = match result {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = (!status.is_success())
                    .then(|| format!("push endpoint returned {}", status.as_u16()));
                (status.as_u16(), body, error)
            }
            Err(e) => (0, String::new(), Some(e.to_string())),
        };

        let exchange = PushExchange {
            url,
            status_code,
            body,
            elapsed: started.elapsed(),
            error,
        };
        if let Some(error) = &exchange.error {
            tracing::warn!(url = %exchange.url, error = %error, "USSD push failed");
        }
        exchange
    }
}

/// Append `to`, `message` and `respond` to the push URL's query string.
pub fn build_push_url(push_url: &str, to: &str, message: &str, respond: bool) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("message", message)
        .append_pair("respond", if respond { "yes" } else { "no" })
        .append_pair("to", to)
        .finish();
    let separator = if push_url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", push_url, separator, query)
}
