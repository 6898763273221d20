#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use dashmap::DashMap;
use serde::Deserialize;
use tallybot_domain::{BotCredentials, ChatCommandConfiguration, Counter, User, broadcaster_key};
use tokio::sync::RwLock;
use tracing::info;

use super::{BotCredentialStore, ConfigStore, CounterStore, UserStore};

/// JSON document used to seed a `MemoryStore` at startup.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateSeed {
	pub users: Vec<User>,
	pub counters: Vec<Counter>,

	/// Broadcaster id -> stored command configuration JSON.
	pub command_configs: BTreeMap<String, serde_json::Value>,

	pub bot: Option<BotCredentials>,
}

/// Process-local implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
	users: DashMap<String, User>,
	counters: DashMap<String, Counter>,
	command_configs: DashMap<String, String>,
	bot: RwLock<Option<BotCredentials>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_seed(seed: StateSeed) -> Self {
		let store = Self {
			bot: RwLock::new(seed.bot),
			..Self::default()
		};
		for user in seed.users {
			store.insert_user(user);
		}
		for counter in seed.counters {
			if let Some(key) = broadcaster_key(&counter.user_id) {
				store.counters.insert(key, counter);
			}
		}
		for (id, raw) in seed.command_configs {
			store.set_command_config_json(&id, raw.to_string());
		}
		store
	}

	/// Load a seed file; a missing file yields an empty store.
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let raw = match std::fs::read_to_string(path) {
			Ok(s) => s,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
			Err(e) => return Err(e).with_context(|| format!("read state file {}", path.display())),
		};
		let seed: StateSeed =
			serde_json::from_str(&raw).with_context(|| format!("parse state file {}", path.display()))?;
		info!(
			path = %path.display(),
			users = seed.users.len(),
			counters = seed.counters.len(),
			"loaded state seed"
		);
		Ok(Self::from_seed(seed))
	}

	pub fn insert_user(&self, user: User) {
		if let Some(key) = broadcaster_key(&user.user_id) {
			self.users.insert(key, user);
		}
	}

	/// Stores raw JSON as-is; parsing happens on read.
	pub fn set_command_config_json(&self, broadcaster_id: &str, raw: impl Into<String>) {
		if let Some(key) = broadcaster_key(broadcaster_id) {
			self.command_configs.insert(key, raw.into());
		}
	}
}

#[async_trait::async_trait]
impl CounterStore for MemoryStore {
	async fn get_counters(&self, broadcaster_id: &str) -> anyhow::Result<Counter> {
		let key = broadcaster_key(broadcaster_id).context("blank broadcaster id")?;
		Ok(self
			.counters
			.get(&key)
			.map(|c| c.clone())
			.unwrap_or_else(|| Counter::new(broadcaster_id.trim())))
	}

	async fn save_counters(&self, counter: &Counter) -> anyhow::Result<()> {
		let key = broadcaster_key(&counter.user_id).context("counter without broadcaster id")?;
		self.counters.insert(key, counter.clone());
		Ok(())
	}
}

#[async_trait::async_trait]
impl ConfigStore for MemoryStore {
	async fn get_chat_commands_config(&self, broadcaster_id: &str) -> anyhow::Result<ChatCommandConfiguration> {
		let raw = broadcaster_key(broadcaster_id).and_then(|k| self.command_configs.get(&k).map(|v| v.clone()));
		Ok(ChatCommandConfiguration::from_json_or_default(raw.as_deref()))
	}
}

#[async_trait::async_trait]
impl UserStore for MemoryStore {
	async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<User>> {
		Ok(broadcaster_key(user_id).and_then(|k| self.users.get(&k).map(|u| u.clone())))
	}

	async fn get_active_users(&self) -> anyhow::Result<Vec<User>> {
		let mut users: Vec<User> = self
			.users
			.iter()
			.filter(|u| u.is_active)
			.map(|u| u.value().clone())
			.collect();
		users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
		Ok(users)
	}

	async fn save_user(&self, user: &User) -> anyhow::Result<()> {
		let key = broadcaster_key(&user.user_id).context("user without id")?;
		self.users.insert(key, user.clone());
		Ok(())
	}
}

#[async_trait::async_trait]
impl BotCredentialStore for MemoryStore {
	async fn get_bot_credentials(&self) -> anyhow::Result<Option<BotCredentials>> {
		Ok(self.bot.read().await.clone())
	}

	async fn save_bot_credentials(&self, creds: &BotCredentials) -> anyhow::Result<()> {
		*self.bot.write().await = Some(creds.clone());
		Ok(())
	}
}
