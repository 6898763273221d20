#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Broadcaster account record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
	/// Platform user id (tenant key).
	pub user_id: String,
	#[serde(default)]
	pub login: String,
	#[serde(default)]
	pub display_name: Option<String>,

	#[serde(default)]
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub token_expires_at: Option<SystemTime>,

	#[serde(default = "default_true")]
	pub is_active: bool,

	#[serde(default)]
	pub notification_settings: Option<NotificationSettings>,
}

fn default_true() -> bool {
	true
}

impl User {
	pub fn display(&self) -> &str {
		self.display_name
			.as_deref()
			.filter(|s| !s.trim().is_empty())
			.unwrap_or(&self.login)
	}
}

/// Milestone/notification preferences.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
	#[serde(default)]
	pub enable_chat_notifications: bool,
	#[serde(default)]
	pub enable_channel_notifications: bool,
	#[serde(default)]
	pub webhook_url: Option<String>,

	/// Counter name -> thresholds.
	#[serde(default)]
	pub milestones: BTreeMap<String, Vec<i64>>,
}

impl NotificationSettings {
	pub fn any_enabled(&self) -> bool {
		self.enable_chat_notifications || self.enable_channel_notifications
	}

	/// Thresholds configured for `counter` (matched by canonical name).
	pub fn thresholds_for(&self, counter: &str) -> Vec<i64> {
		let want = crate::canonical_counter_name(counter);
		self.milestones
			.iter()
			.filter(|(name, _)| crate::canonical_counter_name(name) == want)
			.flat_map(|(_, v)| v.iter().copied())
			.collect()
	}
}

/// Shared bot account credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotCredentials {
	pub username: String,
	#[serde(default)]
	pub user_id: String,
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_at: Option<SystemTime>,
}

/// Whether a token expiring at `expires_at` should be refreshed before use.
///
/// Unknown expiry is treated as valid.
pub fn token_needs_refresh(expires_at: Option<SystemTime>, now: SystemTime, buffer: Duration) -> bool {
	let Some(expires_at) = expires_at else {
		return false;
	};
	match now.checked_add(buffer) {
		Some(deadline) => deadline >= expires_at,
		None => true,
	}
}
