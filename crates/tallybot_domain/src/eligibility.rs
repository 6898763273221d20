#![forbid(unsafe_code)]

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Which identity replies in a broadcaster's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringState {
	pub use_bot: bool,
	pub bot_user_id: Option<String>,
	pub updated_at: SystemTime,
}

impl MonitoringState {
	pub fn new(use_bot: bool, bot_user_id: Option<String>) -> Self {
		Self {
			use_bot,
			bot_user_id,
			updated_at: SystemTime::now(),
		}
	}
}

impl From<&BotEligibilityResult> for MonitoringState {
	fn from(r: &BotEligibilityResult) -> Self {
		Self::new(r.use_bot, r.bot_user_id.clone())
	}
}

/// Outcome of a bot eligibility check. `reason` is diagnostic text only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BotEligibilityResult {
	pub use_bot: bool,
	#[serde(default)]
	pub bot_user_id: Option<String>,
	#[serde(default)]
	pub reason: String,
}

impl BotEligibilityResult {
	pub fn eligible(bot_user_id: impl Into<String>, reason: impl Into<String>) -> Self {
		Self {
			use_bot: true,
			bot_user_id: Some(bot_user_id.into()),
			reason: reason.into(),
		}
	}

	pub fn ineligible(reason: impl Into<String>) -> Self {
		Self {
			use_bot: false,
			bot_user_id: None,
			reason: reason.into(),
		}
	}
}
