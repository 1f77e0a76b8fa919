//! SMS provider client
//!
//! Sends the teammate a text describing the customer's delay choice. A
//! failure here never aborts a call; the workflow logs it and carries on.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::config::CarrierConfig;

/// Outbound SMS seam for the delay workflow
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<()>;
}

/// Carrier REST implementation (form-encoded Messages endpoint)
pub struct CarrierSms {
    client: Client,
    config: CarrierConfig,
}

impl CarrierSms {
    pub fn new(config: CarrierConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SmsSender for CarrierSms {
    async fn send(&self, to: &str, body: &str) -> Result<()> {
        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.config.base_url, self.config.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .form(&[
                ("To", to),
                ("From", self.config.phone_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await
            .context("SMS request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("SMS send error ({}): {}", status, text);
        }

        Ok(())
    }
}
