#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use url::Url;

/// JSON body posted to a broadcaster's webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
	pub event: &'a str,
	pub broadcaster_id: &'a str,
	pub broadcaster_name: &'a str,
	pub data: &'a serde_json::Value,
}

/// Posts event payloads to user-configured webhook URLs.
#[derive(Clone, Debug)]
pub struct WebhookClient {
	http: reqwest::Client,
}

impl WebhookClient {
	pub fn new() -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("tallybot/0.x (webhook)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;
		Ok(Self { http })
	}

	pub async fn post(&self, url: &str, payload: &WebhookPayload<'_>) -> anyhow::Result<()> {
		let url = Url::parse(url.trim()).context("parse webhook url")?;
		if !matches!(url.scheme(), "http" | "https") {
			anyhow::bail!("unsupported webhook scheme: {}", url.scheme());
		}

		let resp = self
			.http
			.post(url)
			.json(payload)
			.send()
			.await
			.with_context(|| format!("webhook POST send (event={})", payload.event))?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("webhook POST failed (event={}): status={status} body={body}", payload.event);
		}
		Ok(())
	}
}
