#![forbid(unsafe_code)]

//! Persistence seams consumed by the engine.

pub mod memory;

use tallybot_domain::{BotCredentials, ChatCommandConfiguration, Counter, User};

pub use memory::{MemoryStore, StateSeed};

#[async_trait::async_trait]
pub trait CounterStore: Send + Sync + 'static {
	/// Missing rows read as a zeroed `Counter`.
	async fn get_counters(&self, broadcaster_id: &str) -> anyhow::Result<Counter>;
	async fn save_counters(&self, counter: &Counter) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync + 'static {
	/// Returns the built-in table when nothing (or garbage) is stored.
	async fn get_chat_commands_config(&self, broadcaster_id: &str) -> anyhow::Result<ChatCommandConfiguration>;
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync + 'static {
	async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<User>>;
	async fn get_active_users(&self) -> anyhow::Result<Vec<User>>;
	async fn save_user(&self, user: &User) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait BotCredentialStore: Send + Sync + 'static {
	async fn get_bot_credentials(&self) -> anyhow::Result<Option<BotCredentials>>;
	async fn save_bot_credentials(&self, creds: &BotCredentials) -> anyhow::Result<()>;
}
