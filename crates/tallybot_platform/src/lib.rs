#![forbid(unsafe_code)]

pub mod twitch;
pub mod webhook;

use std::fmt;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

/// HTTP 401.
pub const STATUS_UNAUTHORIZED: u16 = 401;
/// HTTP 403.
pub const STATUS_FORBIDDEN: u16 = 403;

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// One entry of a channel's moderator list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moderator {
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
}

/// Moderator list lookup result. Non-success statuses carry no moderators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeratorList {
	pub status: u16,
	pub moderators: Vec<Moderator>,
}

impl ModeratorList {
	pub fn ok(moderators: Vec<Moderator>) -> Self {
		Self { status: 200, moderators }
	}

	pub fn status(status: u16) -> Self {
		Self {
			status,
			moderators: Vec::new(),
		}
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

/// "List channel moderators" capability.
#[async_trait::async_trait]
pub trait ModeratorApi: Send + Sync + 'static {
	/// Errors are transport failures; HTTP statuses are returned as data.
	async fn get_moderators(&self, broadcaster_id: &str, access_token: &str) -> anyhow::Result<ModeratorList>;
}

/// Refreshed OAuth token pair.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
	pub access_token: SecretString,
	pub refresh_token: Option<SecretString>,
	pub expires_in: Duration,
}

/// OAuth refresh capability.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
	/// `Ok(None)` when the provider rejected the refresh token.
	async fn refresh_token(&self, refresh_token: &str) -> anyhow::Result<Option<RefreshedToken>>;
}

/// Outbound chat-send capability.
#[async_trait::async_trait]
pub trait ChatSender: Send + Sync + 'static {
	async fn send_message(
		&self,
		broadcaster_id: &str,
		text: &str,
		reply_to_message_id: Option<&str>,
		as_bot_user_id: Option<&str>,
	) -> anyhow::Result<()>;
}

/// EventSub topics the engine subscribes per broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionType {
	StreamOnline,
	StreamOffline,
	ChatMessage,
	ChannelCheer,
}

impl SubscriptionType {
	pub const ALL: [SubscriptionType; 4] = [
		SubscriptionType::StreamOnline,
		SubscriptionType::StreamOffline,
		SubscriptionType::ChatMessage,
		SubscriptionType::ChannelCheer,
	];

	pub const fn as_helix_type(self) -> &'static str {
		match self {
			Self::StreamOnline => "stream.online",
			Self::StreamOffline => "stream.offline",
			Self::ChatMessage => "channel.chat.message",
			Self::ChannelCheer => "channel.cheer",
		}
	}

	pub const fn version(self) -> &'static str {
		"1"
	}
}

impl fmt::Display for SubscriptionType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_helix_type())
	}
}

/// A subscription bound to one notification session.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionRequest<'a> {
	pub kind: SubscriptionType,
	pub broadcaster_user_id: &'a str,
	pub session_id: &'a str,
	pub access_token: &'a str,
}

/// Topic subscription capability.
#[async_trait::async_trait]
pub trait SubscriptionApi: Send + Sync + 'static {
	/// An already existing subscription counts as success.
	async fn create_subscription(&self, request: SubscriptionRequest<'_>) -> anyhow::Result<()>;
}

/// Normalized `channel.chat.message` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatNotification {
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	pub chatter_user_id: String,
	pub chatter_user_login: String,
	pub chatter_user_name: String,
	pub message_id: String,
	pub text: String,
	/// Badge set ids (`moderator`, `broadcaster`, `subscriber`, ...).
	pub badges: Vec<String>,
}

impl ChatNotification {
	pub fn has_badge(&self, set_id: &str) -> bool {
		self.badges.iter().any(|b| b.eq_ignore_ascii_case(set_id))
	}
}

/// Normalized platform notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSubNotification {
	StreamOnline {
		broadcaster_user_id: String,
		broadcaster_user_login: String,
		stream_id: String,
		started_at: Option<SystemTime>,
	},
	StreamOffline {
		broadcaster_user_id: String,
		broadcaster_user_login: String,
	},
	ChatMessage(ChatNotification),
	Cheer {
		broadcaster_user_id: String,
		bits: u64,
		user_login: Option<String>,
	},
	/// Subscription type the engine does not act on.
	Other {
		subscription_type: String,
	},
}

impl EventSubNotification {
	pub fn subscription_type(&self) -> &str {
		match self {
			Self::StreamOnline { .. } => SubscriptionType::StreamOnline.as_helix_type(),
			Self::StreamOffline { .. } => SubscriptionType::StreamOffline.as_helix_type(),
			Self::ChatMessage(_) => SubscriptionType::ChatMessage.as_helix_type(),
			Self::Cheer { .. } => SubscriptionType::ChannelCheer.as_helix_type(),
			Self::Other { subscription_type } => subscription_type,
		}
	}

	pub fn broadcaster_user_id(&self) -> Option<&str> {
		match self {
			Self::StreamOnline { broadcaster_user_id, .. }
			| Self::StreamOffline { broadcaster_user_id, .. }
			| Self::Cheer { broadcaster_user_id, .. } => Some(broadcaster_user_id),
			Self::ChatMessage(m) => Some(&m.broadcaster_user_id),
			Self::Other { .. } => None,
		}
	}
}

/// Notification session lifecycle events, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	Welcome { session_id: String },
	Notification(Box<EventSubNotification>),
	Disconnected { reason: String },
}

pub type SessionEventTx = mpsc::Sender<SessionEvent>;
pub type SessionEventRx = mpsc::Receiver<SessionEvent>;

/// The single shared notification session.
#[async_trait::async_trait]
pub trait NotificationTransport: Send + Sync + 'static {
	/// Open the session. Events for it arrive on the returned receiver.
	async fn connect(&self) -> anyhow::Result<SessionEventRx>;

	/// Close the session; no-op when not connected.
	async fn disconnect(&self);

	/// Current session id, if a welcome has been received.
	fn session_id(&self) -> Option<String>;
}
