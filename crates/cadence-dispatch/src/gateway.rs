//! Outbound SMS gateway abstraction.
//!
//! The dispatcher and API only speak [`MessagingGateway`]; the Twilio
//! implementation is the production transport and [`MockGateway`] drives the
//! test suites.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use cadence_core::defaults::SEND_TIMEOUT_SECS;
use cadence_core::{Error, Result};

/// Acknowledgement returned by the gateway for an accepted outbound message.
#[derive(Debug, Clone)]
pub struct GatewayReceipt {
    /// Gateway-assigned id for the outbound message.
    pub message_id: String,
}

/// Transport for outbound SMS/MMS.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send `body` to the E.164 number `to`, with optional media
    /// attachments. Transient transport failures surface as
    /// `Error::Gateway` and are retried by the caller.
    async fn send(&self, to: &str, body: &str, media_urls: &[String]) -> Result<GatewayReceipt>;
}

/// Twilio configuration, read from the environment.
///
/// | Variable | Description |
/// |----------|-------------|
/// | `TWILIO_ACCOUNT_SID` | API account SID |
/// | `TWILIO_AUTH_TOKEN` | API auth token |
/// | `TWILIO_FROM_NUMBER` | E.164 sender number |
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

impl TwilioConfig {
    pub fn from_env() -> Result<Self> {
        let get = |name: &str| {
            std::env::var(name).map_err(|_| Error::Config(format!("{name} is not set")))
        };
        Ok(Self {
            account_sid: get("TWILIO_ACCOUNT_SID")?,
            auth_token: get("TWILIO_AUTH_TOKEN")?,
            from_number: get("TWILIO_FROM_NUMBER")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: String,
}

/// Twilio REST implementation of [`MessagingGateway`].
pub struct TwilioGateway {
    client: reqwest::Client,
    config: TwilioConfig,
    api_base: String,
}

impl TwilioGateway {
    pub fn new(config: TwilioConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Gateway(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            api_base: "https://api.twilio.com".to_string(),
        })
    }

    /// Override the API base URL (for tests against a local server).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }
}

#[async_trait]
impl MessagingGateway for TwilioGateway {
    #[instrument(skip(self, body, media_urls), fields(to = %to))]
    async fn send(&self, to: &str, body: &str, media_urls: &[String]) -> Result<GatewayReceipt> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.config.account_sid
        );
        let mut params = vec![
            ("From", self.config.from_number.as_str()),
            ("To", to),
            ("Body", body),
        ];
        // Twilio takes one repeated MediaUrl parameter per attachment.
        for media_url in media_urls {
            params.push(("MediaUrl", media_url.as_str()));
        }

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Gateway(format!("gateway returned {status}: {detail}")));
        }

        let parsed: TwilioMessageResponse = response
            .json()
            .await
            .map_err(|e| Error::Gateway(format!("malformed gateway response: {e}")))?;

        debug!(message_id = %parsed.sid, "Message accepted by gateway");
        Ok(GatewayReceipt {
            message_id: parsed.sid,
        })
    }
}

/// A recorded outbound send, for test assertions.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: String,
    pub body: String,
    pub media_urls: Vec<String>,
}

#[derive(Default)]
struct MockState {
    sent: Vec<SentMessage>,
    /// Number of leading send attempts that fail before sends succeed.
    failures_remaining: usize,
    attempts: usize,
}

/// In-memory gateway for tests. Records every accepted send and can be
/// scripted to fail the first N attempts.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` send attempts with a transient gateway error.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.failures_remaining = n;
    }

    /// All sends the gateway accepted, in order.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Total attempts, including failed ones.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl MessagingGateway for MockGateway {
    async fn send(&self, to: &str, body: &str, media_urls: &[String]) -> Result<GatewayReceipt> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(Error::Gateway("scripted failure".into()));
        }
        state.sent.push(SentMessage {
            to: to.to_string(),
            body: body.to_string(),
            media_urls: media_urls.to_vec(),
        });
        let n = state.sent.len();
        Ok(GatewayReceipt {
            message_id: format!("MOCK{n}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gateway_records_sends() {
        let gateway = MockGateway::new();
        let receipt = gateway.send("+15551234567", "hello", &[]).await.unwrap();
        assert_eq!(receipt.message_id, "MOCK1");

        let sent = gateway.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "+15551234567");
        assert_eq!(sent[0].body, "hello");
        assert!(sent[0].media_urls.is_empty());
    }

    #[tokio::test]
    async fn test_mock_gateway_records_media() {
        let gateway = MockGateway::new();
        let media = vec!["https://cdn.example.com/a.jpg".to_string()];
        gateway.send("+15551234567", "photo", &media).await.unwrap();

        let sent = gateway.sent().await;
        assert_eq!(sent[0].media_urls, media);
    }

    #[tokio::test]
    async fn test_mock_gateway_scripted_failures() {
        let gateway = MockGateway::new();
        gateway.fail_next(2).await;

        assert!(gateway.send("+15551234567", "a", &[]).await.is_err());
        assert!(gateway.send("+15551234567", "b", &[]).await.is_err());
        assert!(gateway.send("+15551234567", "c", &[]).await.is_ok());
        assert_eq!(gateway.attempts().await, 3);
        assert_eq!(gateway.sent().await.len(), 1);
    }

    #[test]
    fn test_twilio_config_from_env_missing() {
        std::env::remove_var("TWILIO_ACCOUNT_SID");
        let err = TwilioConfig::from_env().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
