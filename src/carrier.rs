//! Outbound call dialer
//!
//! Creates carrier-originated calls for the customer-notification leg. The
//! carrier fetches TwiML from our `/twiml` endpoint when the callee answers,
//! which opens the media stream back to this process.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::config::CarrierConfig;

/// Outbound dialing seam for the delay workflow
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboundDialer: Send + Sync {
    /// Place a call and return the carrier-assigned call sid
    async fn create_call(&self, to: &str, twiml_url: &str) -> Result<String>;
}

/// Carrier REST implementation (form-encoded Calls endpoint)
pub struct CarrierDialer {
    client: Client,
    config: CarrierConfig,
}

impl CarrierDialer {
    pub fn new(config: CarrierConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl OutboundDialer for CarrierDialer {
    async fn create_call(&self, to: &str, twiml_url: &str) -> Result<String> {
        let url = format!(
            "{}/Accounts/{}/Calls.json",
            self.config.base_url, self.config.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .form(&[
                ("To", to),
                ("From", self.config.phone_number.as_str()),
                ("Url", twiml_url),
                ("Method", "POST"),
            ])
            .send()
            .await
            .context("Outbound call request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Outbound call error ({}): {}", status, text);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse call response")?;
        body.get("sid")
            .and_then(|s| s.as_str())
            .map(String::from)
            .context("Call response missing sid")
    }
}
