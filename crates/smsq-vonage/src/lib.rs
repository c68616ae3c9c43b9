//! Vonage SMS adapter.
//!
//! Sends through the legacy `sms/json` endpoint and points numbers' inbound
//! messages at our webhook via `number/update`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use smsq_core::{
    config::CarrierSettings,
    domain::PhoneNumber,
    errors::Error,
    messaging::{port::MessagingGateway, types::SendReceipt},
    Result,
};

#[derive(Clone, Debug)]
pub struct VonageConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub country: String,
    pub timeout: Duration,
    pub status_callback_url: String,
}

impl From<&CarrierSettings> for VonageConfig {
    fn from(s: &CarrierSettings) -> Self {
        Self {
            api_key: s.api_key.clone(),
            api_secret: s.api_secret.clone(),
            base_url: s.base_url.trim_end_matches('/').to_string(),
            country: s.country.clone(),
            timeout: s.timeout,
            status_callback_url: s.status_callback_url.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VonageGateway {
    cfg: VonageConfig,
    http: reqwest::Client,
}

impl VonageGateway {
    pub fn new(cfg: VonageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::Gateway(format!("vonage http client error: {e}")))?;
        Ok(Self { cfg, http })
    }

    fn send_form(&self, from: &PhoneNumber, to: &PhoneNumber, text: &str) -> Vec<(&'static str, String)> {
        vec![
            ("api_key", self.cfg.api_key.clone()),
            ("api_secret", self.cfg.api_secret.clone()),
            ("from", from.to_string()),
            ("to", to.to_string()),
            ("text", text.to_string()),
            ("type", message_type(text).to_string()),
            ("callback", self.cfg.status_callback_url.clone()),
        ]
    }
}

/// `unicode` when the body cannot go out as plain GSM text.
fn message_type(text: &str) -> &'static str {
    if text.is_ascii() {
        "text"
    } else {
        "unicode"
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SendResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct SendResponseMessage {
    status: String,
    #[serde(rename = "message-id")]
    message_id: Option<String>,
    #[serde(rename = "error-text")]
    error_text: Option<String>,
}

/// Map the carrier's JSON answer to a receipt. Status `"0"` is the only success.
fn parse_send_response(body: &str) -> Result<SendReceipt> {
    let resp: SendResponse = serde_json::from_str(body)?;
    let Some(first) = resp.messages.into_iter().next() else {
        return Err(Error::Gateway("vonage send returned no messages".to_string()));
    };

    if first.status == "0" {
        match first.message_id {
            Some(id) if !id.trim().is_empty() => Ok(SendReceipt::accepted(id)),
            _ => Ok(SendReceipt::rejected("0", "accepted without a message id")),
        }
    } else {
        Ok(SendReceipt {
            external_id: None,
            status_code: first.status,
            error_text: first.error_text,
        })
    }
}

#[derive(Debug, Deserialize)]
struct NumberUpdateResponse {
    #[serde(rename = "error-code")]
    error_code: Option<String>,
    #[serde(rename = "error-code-label")]
    error_code_label: Option<String>,
}

fn check_number_update(body: &str) -> Result<()> {
    let resp: NumberUpdateResponse = serde_json::from_str(body)?;
    match resp.error_code.as_deref() {
        None | Some("200") => Ok(()),
        Some(code) => Err(Error::Gateway(format!(
            "vonage number update failed: {code} {}",
            resp.error_code_label.unwrap_or_default()
        ))),
    }
}

#[async_trait]
impl MessagingGateway for VonageGateway {
    async fn send(&self, from: &PhoneNumber, to: &PhoneNumber, text: &str) -> Result<SendReceipt> {
        let resp = self
            .http
            .post(format!("{}/sms/json", self.cfg.base_url))
            .form(&self.send_form(from, to, text))
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("vonage request error: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Gateway(format!("vonage response error: {e}")))?;
        if !status.is_success() {
            return Err(Error::Gateway(format!(
                "vonage send failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let receipt = parse_send_response(&body)?;
        if !receipt.is_accepted() {
            tracing::debug!(
                to = %to,
                status_code = %receipt.status_code,
                error = receipt.error_text.as_deref().unwrap_or(""),
                "vonage refused message"
            );
        }
        Ok(receipt)
    }

    async fn register_inbound_webhook(
        &self,
        sender: &PhoneNumber,
        callback_url: &str,
    ) -> Result<()> {
        let form = [
            ("api_key", self.cfg.api_key.as_str()),
            ("api_secret", self.cfg.api_secret.as_str()),
            ("country", self.cfg.country.as_str()),
            ("msisdn", sender.as_str()),
            ("moHttpUrl", callback_url),
        ];
        let resp = self
            .http
            .post(format!("{}/number/update", self.cfg.base_url))
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("vonage request error: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Gateway(format!(
                "vonage number update failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        check_number_update(&body)?;
        tracing::debug!(sender = %sender, url = callback_url, "inbound webhook registered");
        Ok(())
    }
}
