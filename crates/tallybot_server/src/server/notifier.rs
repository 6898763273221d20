#![forbid(unsafe_code)]

use tallybot_domain::User;
use tallybot_platform::webhook::{WebhookClient, WebhookPayload};
use tracing::debug;

use crate::engine::sinks::ExternalNotifier;

/// Delivers channel notifications to the broadcaster's configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
	client: WebhookClient,
}

impl WebhookNotifier {
	pub fn new(client: WebhookClient) -> Self {
		Self { client }
	}
}

/// Configured webhook URL, if any and non-blank.
pub fn webhook_url(user: &User) -> Option<&str> {
	user.notification_settings
		.as_ref()
		.and_then(|s| s.webhook_url.as_deref())
		.map(str::trim)
		.filter(|u| !u.is_empty())
}

#[async_trait::async_trait]
impl ExternalNotifier for WebhookNotifier {
	async fn notify(&self, user: &User, event_name: &str, data: serde_json::Value) -> anyhow::Result<()> {
		let Some(url) = webhook_url(user) else {
			debug!(broadcaster_id = %user.user_id, event = %event_name, "no webhook configured");
			return Ok(());
		};

		let payload = WebhookPayload {
			event: event_name,
			broadcaster_id: &user.user_id,
			broadcaster_name: user.display(),
			data: &data,
		};
		self.client.post(url, &payload).await?;
		metrics::counter!("tallybot_webhooks_sent_total").increment(1);
		Ok(())
	}
}
