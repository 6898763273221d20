#![forbid(unsafe_code)]

//! Outbound side-effect seams used by the command and milestone paths.

use tallybot_domain::{OverlayEvent, User};

/// Posts a chat reply into a broadcaster's channel.
#[async_trait::async_trait]
pub trait ReplySender: Send + Sync {
	async fn send_reply(&self, broadcaster_id: &str, text: &str, reply_to: Option<&str>) -> anyhow::Result<()>;
}

/// Channel notifications outside chat (webhooks).
#[async_trait::async_trait]
pub trait ExternalNotifier: Send + Sync + 'static {
	async fn notify(&self, user: &User, event_name: &str, data: serde_json::Value) -> anyhow::Result<()>;
}

/// Realtime overlay fan-out.
#[async_trait::async_trait]
pub trait OverlayPublisher: Send + Sync + 'static {
	async fn publish(&self, broadcaster_id: &str, event: OverlayEvent);
}
