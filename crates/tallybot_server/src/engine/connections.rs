#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tallybot_domain::{BotCredentials, BotEligibilityResult, MonitoringState, User, broadcaster_key, token_needs_refresh};
use tallybot_platform::{ChatSender, TokenRefresher};
use tracing::{debug, error, info, warn};

use super::eligibility::EligibilityResolver;
use super::monitoring::MonitoringRegistry;
use super::sinks::ReplySender;
use crate::stores::{BotCredentialStore, UserStore};

/// Snapshot of a broadcaster's outbound session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBotStatus {
	pub connected: bool,
	pub use_bot: bool,
	pub bot_user_id: Option<String>,
	pub reason: String,
	pub connected_at: Option<SystemTime>,
}

#[derive(Debug, Clone)]
struct Session {
	use_bot: bool,
	bot_user_id: Option<String>,
	reason: String,
	connected_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
	/// Tokens expiring within this window are refreshed before use.
	pub refresh_buffer: Duration,
}

impl Default for ConnectionManagerConfig {
	fn default() -> Self {
		Self {
			refresh_buffer: Duration::from_secs(5 * 60),
		}
	}
}

/// Per-broadcaster outbound chat sessions.
pub struct ConnectionManager {
	cfg: ConnectionManagerConfig,
	users: Arc<dyn UserStore>,
	bot_credentials: Arc<dyn BotCredentialStore>,
	refresher: Arc<dyn TokenRefresher>,
	resolver: Arc<EligibilityResolver>,
	registry: Arc<MonitoringRegistry>,
	chat: Arc<dyn ChatSender>,
	sessions: DashMap<String, Session>,
}

impl ConnectionManager {
	pub fn new(
		cfg: ConnectionManagerConfig,
		users: Arc<dyn UserStore>,
		bot_credentials: Arc<dyn BotCredentialStore>,
		refresher: Arc<dyn TokenRefresher>,
		resolver: Arc<EligibilityResolver>,
		registry: Arc<MonitoringRegistry>,
		chat: Arc<dyn ChatSender>,
	) -> Self {
		Self {
			cfg,
			users,
			bot_credentials,
			refresher,
			resolver,
			registry,
			chat,
			sessions: DashMap::new(),
		}
	}

	/// Establish (or re-establish) the outbound session for a broadcaster.
	///
	/// A failed token refresh abandons this attempt; the next call retries.
	pub async fn connect_user(&self, broadcaster_id: &str) {
		let Some(key) = broadcaster_key(broadcaster_id) else {
			return;
		};

		let user = match self.users.get_user(broadcaster_id).await {
			Ok(Some(user)) => user,
			Ok(None) => {
				warn!(broadcaster_id = %broadcaster_id, "connect: user not found");
				return;
			}
			Err(e) => {
				warn!(broadcaster_id = %broadcaster_id, error = ?e, "connect: failed to load user");
				return;
			}
		};

		let bot = match self.bot_credentials.get_bot_credentials().await {
			Ok(Some(creds)) => match self.fresh_bot_credentials(creds).await {
				Some(creds) => Some(creds),
				None => {
					error!(broadcaster_id = %broadcaster_id, "bot token refresh failed; abandoning connect");
					return;
				}
			},
			Ok(None) => None,
			Err(e) => {
				warn!(broadcaster_id = %broadcaster_id, error = ?e, "connect: failed to load bot credentials");
				None
			}
		};

		let Some(user) = self.fresh_user(user).await else {
			error!(broadcaster_id = %broadcaster_id, "broadcaster token refresh failed; abandoning connect");
			return;
		};

		let eligibility = match bot {
			Some(_) => self.resolver.eligibility(&user.user_id, &user.access_token).await,
			None => BotEligibilityResult::ineligible("Bot credentials are not configured"),
		};
		self.registry
			.set_state(broadcaster_id, MonitoringState::from(&eligibility));

		info!(
			broadcaster_id = %broadcaster_id,
			login = %user.login,
			use_bot = eligibility.use_bot,
			reason = %eligibility.reason,
			"broadcaster connected"
		);
		self.sessions.insert(
			key,
			Session {
				use_bot: eligibility.use_bot,
				bot_user_id: eligibility.bot_user_id,
				reason: eligibility.reason,
				connected_at: SystemTime::now(),
			},
		);
		metrics::gauge!("tallybot_connected_broadcasters").set(self.sessions.len() as f64);
	}

	pub async fn disconnect_user(&self, broadcaster_id: &str) {
		let Some(key) = broadcaster_key(broadcaster_id) else {
			return;
		};
		if self.sessions.remove(&key).is_some() {
			info!(broadcaster_id = %broadcaster_id, "broadcaster disconnected");
			metrics::gauge!("tallybot_connected_broadcasters").set(self.sessions.len() as f64);
		}
	}

	pub fn is_connected(&self, broadcaster_id: &str) -> bool {
		broadcaster_key(broadcaster_id).is_some_and(|k| self.sessions.contains_key(&k))
	}

	pub async fn send_message(&self, broadcaster_id: &str, text: &str) -> anyhow::Result<()> {
		self.send_message_reply(broadcaster_id, text, None).await
	}

	/// No-op without a session. Posts as the bot when the registry says so.
	pub async fn send_message_reply(&self, broadcaster_id: &str, text: &str, reply_to: Option<&str>) -> anyhow::Result<()> {
		if !self.is_connected(broadcaster_id) {
			debug!(broadcaster_id = %broadcaster_id, "send skipped: not connected");
			return Ok(());
		}

		let as_bot = self
			.registry
			.try_get_state(broadcaster_id)
			.filter(|s| s.use_bot)
			.and_then(|s| s.bot_user_id);

		let res = self
			.chat
			.send_message(broadcaster_id.trim(), text, reply_to, as_bot.as_deref())
			.await;
		if res.is_err() {
			metrics::counter!("tallybot_chat_send_failures_total").increment(1);
		}
		res
	}

	pub fn user_bot_status(&self, broadcaster_id: &str) -> UserBotStatus {
		let session = broadcaster_key(broadcaster_id).and_then(|k| self.sessions.get(&k).map(|s| s.clone()));
		match session {
			Some(s) => UserBotStatus {
				connected: true,
				use_bot: s.use_bot,
				bot_user_id: s.bot_user_id,
				reason: s.reason,
				connected_at: Some(s.connected_at),
			},
			None => UserBotStatus {
				connected: false,
				use_bot: false,
				bot_user_id: None,
				reason: "Not connected".to_string(),
				connected_at: None,
			},
		}
	}

	/// The user with a usable access token, refreshing and persisting it first if needed.
	pub async fn fresh_user(&self, mut user: User) -> Option<User> {
		if !token_needs_refresh(user.token_expires_at, SystemTime::now(), self.cfg.refresh_buffer) {
			return Some(user);
		}

		let refresh_token = user.refresh_token.clone().filter(|t| !t.trim().is_empty())?;
		let refreshed = self.refresh(&refresh_token, "broadcaster", &user.user_id).await?;

		user.access_token = refreshed.access_token.expose().to_string();
		if let Some(rt) = refreshed.refresh_token {
			user.refresh_token = Some(rt.expose().to_string());
		}
		user.token_expires_at = SystemTime::now().checked_add(refreshed.expires_in);
		if let Err(e) = self.users.save_user(&user).await {
			warn!(broadcaster_id = %user.user_id, error = ?e, "failed to persist refreshed broadcaster token");
		}
		Some(user)
	}

	async fn fresh_bot_credentials(&self, mut creds: BotCredentials) -> Option<BotCredentials> {
		if !token_needs_refresh(creds.expires_at, SystemTime::now(), self.cfg.refresh_buffer) {
			return Some(creds);
		}

		let refresh_token = creds.refresh_token.clone().filter(|t| !t.trim().is_empty())?;
		let refreshed = self.refresh(&refresh_token, "bot", &creds.username).await?;

		creds.access_token = refreshed.access_token.expose().to_string();
		if let Some(rt) = refreshed.refresh_token {
			creds.refresh_token = Some(rt.expose().to_string());
		}
		creds.expires_at = SystemTime::now().checked_add(refreshed.expires_in);
		if let Err(e) = self.bot_credentials.save_bot_credentials(&creds).await {
			warn!(bot = %creds.username, error = ?e, "failed to persist refreshed bot token");
		}
		Some(creds)
	}

	async fn refresh(&self, refresh_token: &str, role: &str, who: &str) -> Option<tallybot_platform::RefreshedToken> {
		match self.refresher.refresh_token(refresh_token).await {
			Ok(Some(token)) => {
				info!(role, who = %who, "token refreshed");
				Some(token)
			}
			Ok(None) => {
				warn!(role, who = %who, "token refresh rejected");
				None
			}
			Err(e) => {
				warn!(role, who = %who, error = ?e, "token refresh failed");
				None
			}
		}
	}
}

/// Replies connect the broadcaster lazily on first use.
#[async_trait::async_trait]
impl ReplySender for ConnectionManager {
	async fn send_reply(&self, broadcaster_id: &str, text: &str, reply_to: Option<&str>) -> anyhow::Result<()> {
		if !self.is_connected(broadcaster_id) {
			self.connect_user(broadcaster_id).await;
		}
		self.send_message_reply(broadcaster_id, text, reply_to).await
	}
}
