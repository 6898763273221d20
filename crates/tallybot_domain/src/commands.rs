#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ParseLabelError;

/// Default cap for explicit amounts such as `!death+ 3`.
pub const DEFAULT_MAX_INCREMENT_AMOUNT: u32 = 10;

/// Chat permission tier, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Permission {
	#[default]
	Everyone,
	Subscriber,
	Moderator,
	Broadcaster,
}

impl Permission {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Permission::Everyone => "everyone",
			Permission::Subscriber => "subscriber",
			Permission::Moderator => "moderator",
			Permission::Broadcaster => "broadcaster",
		}
	}

	/// Parse a stored label, mapping anything unrecognized to `Everyone`.
	pub fn parse_lenient(s: &str) -> Self {
		s.parse().unwrap_or_default()
	}
}

impl fmt::Display for Permission {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Permission {
	type Err = ParseLabelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseLabelError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"everyone" | "all" | "viewer" | "viewers" => Ok(Permission::Everyone),
			"subscriber" | "subscribers" | "sub" | "subs" | "vip" => Ok(Permission::Subscriber),
			"moderator" | "moderators" | "mod" | "mods" => Ok(Permission::Moderator),
			"broadcaster" | "streamer" | "owner" => Ok(Permission::Broadcaster),
			other => Err(ParseLabelError::UnknownPermission(other.to_string())),
		}
	}
}

impl Serialize for Permission {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Permission {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = Option::<String>::deserialize(deserializer)?;
		Ok(raw.as_deref().map(Permission::parse_lenient).unwrap_or_default())
	}
}

/// What a chat command does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandAction {
	Increment,
	Decrement,
	Reset,
	/// Static or templated reply, no counter mutation.
	#[default]
	Text,
}

impl CommandAction {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			CommandAction::Increment => "increment",
			CommandAction::Decrement => "decrement",
			CommandAction::Reset => "reset",
			CommandAction::Text => "text",
		}
	}

	/// Parse a stored label, mapping anything unrecognized to `Text`.
	pub fn parse_lenient(s: &str) -> Self {
		s.parse().unwrap_or_default()
	}

	pub fn mutates(self) -> bool {
		!matches!(self, CommandAction::Text)
	}
}

impl fmt::Display for CommandAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CommandAction {
	type Err = ParseLabelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseLabelError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"increment" | "inc" | "add" | "+" => Ok(CommandAction::Increment),
			"decrement" | "dec" | "subtract" | "-" => Ok(CommandAction::Decrement),
			"reset" | "clear" | "zero" => Ok(CommandAction::Reset),
			"text" | "query" | "static" | "reply" => Ok(CommandAction::Text),
			other => Err(ParseLabelError::UnknownAction(other.to_string())),
		}
	}
}

impl Serialize for CommandAction {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for CommandAction {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = Option::<String>::deserialize(deserializer)?;
		Ok(raw.as_deref().map(CommandAction::parse_lenient).unwrap_or_default())
	}
}

/// One configured chat command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCommandDefinition {
	#[serde(default, alias = "Action")]
	pub action: CommandAction,

	/// Counter name the command reads or mutates.
	#[serde(default, alias = "Counter", skip_serializing_if = "Option::is_none")]
	pub counter: Option<String>,

	#[serde(default, alias = "Permission")]
	pub permission: Permission,

	/// Minimum seconds between executions per broadcaster.
	#[serde(default, alias = "Cooldown")]
	pub cooldown: u64,

	/// Reply template (`{count}`, `{counter}`, `{user}`, `{amount}`).
	#[serde(default, alias = "Response")]
	pub response: String,

	#[serde(default, alias = "IncrementBy")]
	pub increment_by: i64,

	#[serde(default, alias = "DecrementBy")]
	pub decrement_by: i64,

	/// Extra milestone thresholds for the counter.
	#[serde(default, alias = "Milestones")]
	pub milestones: Vec<i64>,
}

impl ChatCommandDefinition {
	fn counter_command(action: CommandAction, counter: &str, permission: Permission, cooldown: u64, response: &str) -> Self {
		Self {
			action,
			counter: Some(counter.to_string()),
			permission,
			cooldown,
			response: response.to_string(),
			increment_by: 1,
			decrement_by: 1,
			milestones: Vec::new(),
		}
	}
}

/// Trimmed, lower-cased trigger key.
pub fn normalize_trigger(trigger: &str) -> String {
	trigger.trim().to_lowercase()
}

fn default_max_increment_amount() -> u32 {
	DEFAULT_MAX_INCREMENT_AMOUNT
}

/// Per-broadcaster command table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCommandConfiguration {
	#[serde(default, alias = "Commands")]
	pub commands: BTreeMap<String, ChatCommandDefinition>,

	#[serde(default = "default_max_increment_amount", alias = "MaxIncrementAmount")]
	pub max_increment_amount: u32,
}

impl Default for ChatCommandConfiguration {
	fn default() -> Self {
		Self {
			commands: BTreeMap::new(),
			max_increment_amount: DEFAULT_MAX_INCREMENT_AMOUNT,
		}
	}
}

impl ChatCommandConfiguration {
	/// Built-in command table used when a broadcaster has no stored configuration.
	pub fn defaults() -> Self {
		use CommandAction::{Decrement, Increment, Reset, Text};
		use Permission::{Broadcaster, Everyone, Moderator};

		let mut cfg = Self::default();
		let table = [
			("!deaths", Text, "deaths", Everyone, 5, "Death count: {count}"),
			("!death+", Increment, "deaths", Moderator, 0, "Death count: {count}"),
			("!death-", Decrement, "deaths", Moderator, 0, "Death count: {count}"),
			("!swears", Text, "swears", Everyone, 5, "Swear count: {count}"),
			("!swear+", Increment, "swears", Moderator, 0, "Swear count: {count}"),
			("!swear-", Decrement, "swears", Moderator, 0, "Swear count: {count}"),
			("!screams", Text, "screams", Everyone, 5, "Scream count: {count}"),
			("!scream+", Increment, "screams", Moderator, 0, "Scream count: {count}"),
			("!scream-", Decrement, "screams", Moderator, 0, "Scream count: {count}"),
			("!bits", Text, "bits", Everyone, 5, "Bits this stream: {count}"),
			("!resetdeaths", Reset, "deaths", Broadcaster, 0, "Death counter reset"),
		];
		for (trigger, action, counter, permission, cooldown, response) in table {
			cfg.insert(
				trigger,
				ChatCommandDefinition::counter_command(action, counter, permission, cooldown, response),
			);
		}
		cfg
	}

	/// Parse stored JSON, falling back to `defaults()` when absent or malformed.
	pub fn from_json_or_default(raw: Option<&str>) -> Self {
		let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
			return Self::defaults();
		};

		match serde_json::from_str::<ChatCommandConfiguration>(raw) {
			Ok(parsed) => parsed.normalized(),
			Err(_) => Self::defaults(),
		}
	}

	/// Insert or replace a command under its normalized trigger.
	pub fn insert(&mut self, trigger: &str, def: ChatCommandDefinition) {
		let key = normalize_trigger(trigger);
		if key.is_empty() {
			return;
		}
		self.commands.insert(key, def);
	}

	/// Case-insensitive lookup returning the stored key and definition.
	pub fn find(&self, trigger: &str) -> Option<(&str, &ChatCommandDefinition)> {
		let key = normalize_trigger(trigger);
		if key.is_empty() {
			return None;
		}
		self.commands.get_key_value(&key).map(|(k, v)| (k.as_str(), v))
	}

	fn normalized(self) -> Self {
		let mut out = Self {
			commands: BTreeMap::new(),
			max_increment_amount: self.max_increment_amount.max(1),
		};
		for (trigger, def) in self.commands {
			out.insert(&trigger, def);
		}
		out
	}
}

/// Normalized chat-command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatCommandContext {
	/// Broadcaster (tenant) the message was sent in.
	pub user_id: String,
	pub message: String,
	pub is_moderator: bool,
	pub is_broadcaster: bool,
	pub is_subscriber: bool,

	/// Display name of the chatter, used for `{user}`.
	pub chatter_display_name: Option<String>,

	/// Platform message id of the triggering message.
	pub message_id: Option<String>,
}

impl ChatCommandContext {
	pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			message: message.into(),
			..Self::default()
		}
	}

	/// Leading whitespace-delimited token of the message.
	pub fn trigger(&self) -> &str {
		self.message.split_whitespace().next().unwrap_or_default()
	}

	/// Second token, if any.
	pub fn argument(&self) -> Option<&str> {
		self.message.split_whitespace().nth(1)
	}
}
