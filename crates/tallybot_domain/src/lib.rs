#![forbid(unsafe_code)]

mod commands;
mod counter;
mod eligibility;
mod overlay;
mod user;

use core::fmt;

use thiserror::Error;

pub use commands::{
	ChatCommandConfiguration, ChatCommandContext, ChatCommandDefinition, CommandAction, DEFAULT_MAX_INCREMENT_AMOUNT,
	Permission, normalize_trigger,
};
pub use counter::{Counter, canonical_counter_name, counter_label, milestone_event_name};
pub use eligibility::{BotEligibilityResult, MonitoringState};
pub use overlay::OverlayEvent;
pub use user::{BotCredentials, NotificationSettings, User, token_needs_refresh};

/// Errors for parsing stored labels (permission tiers, command actions).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseLabelError {
	#[error("empty value")]
	Empty,
	#[error("unknown permission: {0}")]
	UnknownPermission(String),
	#[error("unknown command action: {0}")]
	UnknownAction(String),
}

/// Lower-cased, trimmed broadcaster key; `None` when blank.
pub fn broadcaster_key(id: &str) -> Option<String> {
	let id = id.trim();
	if id.is_empty() {
		return None;
	}
	Some(id.to_ascii_lowercase())
}

/// Display helper for optional ids in log fields.
pub struct OptId<'a>(pub Option<&'a str>);

impl fmt::Display for OptId<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.0.unwrap_or("-"))
	}
}
