#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tallybot_domain::{BotCredentials, NotificationSettings, OverlayEvent, User};
use tallybot_platform::{
	ChatSender, Moderator, ModeratorApi, ModeratorList, NotificationTransport, RefreshedToken, SecretString,
	SessionEvent, SessionEventRx, SessionEventTx, SubscriptionApi, SubscriptionRequest, SubscriptionType,
	TokenRefresher,
};
use tokio::sync::mpsc;

use super::cache_backend::CacheBackend;
use super::commands::{CommandProcessor, CommandProcessorConfig, CommandScope};
use super::connections::{ConnectionManager, ConnectionManagerConfig};
use super::eligibility::EligibilityResolver;
use super::eligibility_cache::EligibilityCache;
use super::milestones::MilestoneNotifier;
use super::monitoring::MonitoringRegistry;
use super::sinks::{ExternalNotifier, OverlayPublisher, ReplySender};
use super::subscriptions::{EventSubscriptionService, SubscriptionServiceConfig, SubscriptionServiceDeps};
use crate::stores::{MemoryStore, StateSeed};

pub const BOT_LOGIN: &str = "tallybot";
pub const BOT_ID: &str = "900";

pub enum ModeratorResponse {
	List(ModeratorList),
	Error,
	/// Never answers.
	Hang,
}

pub struct FakeModerators {
	response: ModeratorResponse,
	calls: AtomicUsize,
}

impl FakeModerators {
	pub fn new(response: ModeratorResponse) -> Self {
		Self {
			response,
			calls: AtomicUsize::new(0),
		}
	}

	/// `(user_id, login)` pairs.
	pub fn with_logins(mods: &[(&str, &str)]) -> Self {
		let moderators = mods
			.iter()
			.map(|(id, login)| Moderator {
				user_id: id.to_string(),
				user_login: login.to_string(),
				user_name: login.to_string(),
			})
			.collect();
		Self::new(ModeratorResponse::List(ModeratorList::ok(moderators)))
	}

	pub fn with_bot() -> Self {
		Self::with_logins(&[("1", "someone"), (BOT_ID, BOT_LOGIN)])
	}

	pub fn status(code: u16) -> Self {
		Self::new(ModeratorResponse::List(ModeratorList::status(code)))
	}

	pub fn failing() -> Self {
		Self::new(ModeratorResponse::Error)
	}

	pub fn hanging() -> Self {
		Self::new(ModeratorResponse::Hang)
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl ModeratorApi for FakeModerators {
	async fn get_moderators(&self, _broadcaster_id: &str, _access_token: &str) -> anyhow::Result<ModeratorList> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		match &self.response {
			ModeratorResponse::List(list) => Ok(list.clone()),
			ModeratorResponse::Error => Err(anyhow!("connection reset by peer")),
			ModeratorResponse::Hang => std::future::pending().await,
		}
	}
}

#[derive(Default)]
pub struct RecordingCache {
	entries: Mutex<HashMap<String, String>>,
	writes: Mutex<Vec<(String, String, Duration)>>,
	fail: bool,
}

impl RecordingCache {
	pub fn failing() -> Self {
		Self {
			fail: true,
			..Self::default()
		}
	}

	pub fn seed(&self, key: &str, value: &str) {
		self.entries
			.lock()
			.expect("lock")
			.insert(key.to_string(), value.to_string());
	}

	pub fn writes(&self) -> Vec<(String, String, Duration)> {
		self.writes.lock().expect("lock").clone()
	}
}

#[async_trait::async_trait]
impl CacheBackend for RecordingCache {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		if self.fail {
			return Err(anyhow!("cache unreachable"));
		}
		Ok(self.entries.lock().expect("lock").get(key).cloned())
	}

	async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
		if self.fail {
			return Err(anyhow!("cache unreachable"));
		}
		self.writes
			.lock()
			.expect("lock")
			.push((key.to_string(), value.to_string(), ttl));
		self.seed(key, value);
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
	pub broadcaster_id: String,
	pub text: String,
	pub reply_to: Option<String>,
}

#[derive(Default)]
pub struct RecordingReplies {
	sent: Mutex<Vec<SentReply>>,
}

impl RecordingReplies {
	pub fn sent(&self) -> Vec<SentReply> {
		self.sent.lock().expect("lock").clone()
	}

	pub fn texts(&self) -> Vec<String> {
		self.sent().into_iter().map(|r| r.text).collect()
	}
}

#[async_trait::async_trait]
impl ReplySender for RecordingReplies {
	async fn send_reply(&self, broadcaster_id: &str, text: &str, reply_to: Option<&str>) -> anyhow::Result<()> {
		self.sent.lock().expect("lock").push(SentReply {
			broadcaster_id: broadcaster_id.to_string(),
			text: text.to_string(),
			reply_to: reply_to.map(str::to_string),
		});
		Ok(())
	}
}

#[derive(Default)]
pub struct RecordingExternal {
	events: Mutex<Vec<(String, String, serde_json::Value)>>,
	fail: bool,
}

impl RecordingExternal {
	pub fn failing() -> Self {
		Self {
			fail: true,
			..Self::default()
		}
	}

	/// `(broadcaster_id, event_name, data)` in delivery order.
	pub fn events(&self) -> Vec<(String, String, serde_json::Value)> {
		self.events.lock().expect("lock").clone()
	}

	pub fn event_names(&self) -> Vec<String> {
		self.events().into_iter().map(|(_, name, _)| name).collect()
	}
}

#[async_trait::async_trait]
impl ExternalNotifier for RecordingExternal {
	async fn notify(&self, user: &User, event_name: &str, data: serde_json::Value) -> anyhow::Result<()> {
		self.events
			.lock()
			.expect("lock")
			.push((user.user_id.clone(), event_name.to_string(), data));
		if self.fail {
			return Err(anyhow!("webhook returned 500"));
		}
		Ok(())
	}
}

#[derive(Default)]
pub struct RecordingOverlay {
	events: Mutex<Vec<(String, OverlayEvent)>>,
}

impl RecordingOverlay {
	pub fn events(&self) -> Vec<(String, OverlayEvent)> {
		self.events.lock().expect("lock").clone()
	}
}

#[async_trait::async_trait]
impl OverlayPublisher for RecordingOverlay {
	async fn publish(&self, broadcaster_id: &str, event: OverlayEvent) {
		self.events
			.lock()
			.expect("lock")
			.push((broadcaster_id.to_string(), event));
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSend {
	pub broadcaster_id: String,
	pub text: String,
	pub reply_to: Option<String>,
	pub as_bot: Option<String>,
}

#[derive(Default)]
pub struct RecordingChat {
	sent: Mutex<Vec<ChatSend>>,
}

impl RecordingChat {
	pub fn sent(&self) -> Vec<ChatSend> {
		self.sent.lock().expect("lock").clone()
	}
}

#[async_trait::async_trait]
impl ChatSender for RecordingChat {
	async fn send_message(
		&self,
		broadcaster_id: &str,
		text: &str,
		reply_to_message_id: Option<&str>,
		as_bot_user_id: Option<&str>,
	) -> anyhow::Result<()> {
		self.sent.lock().expect("lock").push(ChatSend {
			broadcaster_id: broadcaster_id.to_string(),
			text: text.to_string(),
			reply_to: reply_to_message_id.map(str::to_string),
			as_bot: as_bot_user_id.map(str::to_string),
		});
		Ok(())
	}
}

pub enum RefreshOutcome {
	Token(&'static str),
	Rejected,
	Error,
}

pub struct FakeRefresher {
	outcome: RefreshOutcome,
	calls: AtomicUsize,
}

impl FakeRefresher {
	pub fn new(outcome: RefreshOutcome) -> Self {
		Self {
			outcome,
			calls: AtomicUsize::new(0),
		}
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl TokenRefresher for FakeRefresher {
	async fn refresh_token(&self, _refresh_token: &str) -> anyhow::Result<Option<RefreshedToken>> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		match self.outcome {
			RefreshOutcome::Token(token) => Ok(Some(RefreshedToken {
				access_token: SecretString::new(token),
				refresh_token: Some(SecretString::new("rotated-refresh")),
				expires_in: Duration::from_secs(4 * 60 * 60),
			})),
			RefreshOutcome::Rejected => Ok(None),
			RefreshOutcome::Error => Err(anyhow!("id service unavailable")),
		}
	}
}

#[derive(Default)]
pub struct FakeSubscriptions {
	created: Mutex<Vec<(String, SubscriptionType, String)>>,
	fail_for: HashSet<String>,
}

impl FakeSubscriptions {
	pub fn failing_for(ids: &[&str]) -> Self {
		Self {
			fail_for: ids.iter().map(|s| s.to_string()).collect(),
			..Self::default()
		}
	}

	pub fn kinds_for(&self, broadcaster_id: &str) -> Vec<SubscriptionType> {
		self.created
			.lock()
			.expect("lock")
			.iter()
			.filter(|(id, _, _)| id == broadcaster_id)
			.map(|(_, kind, _)| *kind)
			.collect()
	}

	pub fn total(&self) -> usize {
		self.created.lock().expect("lock").len()
	}

	pub fn session_ids(&self) -> HashSet<String> {
		self.created
			.lock()
			.expect("lock")
			.iter()
			.map(|(_, _, session)| session.clone())
			.collect()
	}
}

#[async_trait::async_trait]
impl SubscriptionApi for FakeSubscriptions {
	async fn create_subscription(&self, request: SubscriptionRequest<'_>) -> anyhow::Result<()> {
		if self.fail_for.contains(request.broadcaster_user_id) {
			return Err(anyhow!("helix returned 500"));
		}
		self.created.lock().expect("lock").push((
			request.broadcaster_user_id.to_string(),
			request.kind,
			request.session_id.to_string(),
		));
		Ok(())
	}
}

#[derive(Default)]
pub struct FakeTransport {
	tx: Mutex<Option<SessionEventTx>>,
	connects: AtomicUsize,
	disconnects: AtomicUsize,
}

impl FakeTransport {
	pub async fn emit(&self, ev: SessionEvent) {
		let tx = self.tx.lock().expect("lock").clone().expect("transport connected");
		tx.send(ev).await.expect("dispatcher alive");
	}

	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn disconnects(&self) -> usize {
		self.disconnects.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl NotificationTransport for FakeTransport {
	async fn connect(&self) -> anyhow::Result<SessionEventRx> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = mpsc::channel(16);
		*self.tx.lock().expect("lock") = Some(tx);
		Ok(rx)
	}

	async fn disconnect(&self) {
		self.disconnects.fetch_add(1, Ordering::SeqCst);
		self.tx.lock().expect("lock").take();
	}

	fn session_id(&self) -> Option<String> {
		None
	}
}

pub fn user(id: &str, login: &str) -> User {
	User {
		user_id: id.to_string(),
		login: login.to_string(),
		display_name: Some(login.to_string()),
		access_token: format!("{login}-token"),
		refresh_token: Some(format!("{login}-refresh")),
		is_active: true,
		..User::default()
	}
}

pub fn with_milestones(mut user: User, chat: bool, channel: bool, counter: &str, thresholds: &[i64]) -> User {
	let mut milestones = BTreeMap::new();
	milestones.insert(counter.to_string(), thresholds.to_vec());
	user.notification_settings = Some(NotificationSettings {
		enable_chat_notifications: chat,
		enable_channel_notifications: channel,
		webhook_url: None,
		milestones,
	});
	user
}

pub fn bot_credentials() -> BotCredentials {
	BotCredentials {
		username: BOT_LOGIN.to_string(),
		user_id: BOT_ID.to_string(),
		access_token: "bot-token".to_string(),
		refresh_token: Some("bot-refresh".to_string()),
		expires_at: None,
	}
}

/// The engine wired to in-memory stores and recording fakes.
pub struct Harness {
	pub store: Arc<MemoryStore>,
	pub registry: Arc<MonitoringRegistry>,
	pub moderators: Arc<FakeModerators>,
	pub refresher: Arc<FakeRefresher>,
	pub chat: Arc<RecordingChat>,
	pub external: Arc<RecordingExternal>,
	pub overlay: Arc<RecordingOverlay>,
	pub replies: Arc<RecordingReplies>,
	pub commands: Arc<CommandProcessor>,
	pub connections: Arc<ConnectionManager>,
}

impl Harness {
	pub fn new(users: Vec<User>) -> Self {
		Self::build(
			users,
			Some(bot_credentials()),
			FakeModerators::with_bot(),
			FakeRefresher::new(RefreshOutcome::Token("fresh-token")),
		)
	}

	pub fn build(
		users: Vec<User>,
		bot: Option<BotCredentials>,
		moderators: FakeModerators,
		refresher: FakeRefresher,
	) -> Self {
		let store = Arc::new(MemoryStore::from_seed(StateSeed {
			users,
			bot,
			..StateSeed::default()
		}));
		let registry = Arc::new(MonitoringRegistry::new());
		let moderators = Arc::new(moderators);
		let refresher = Arc::new(refresher);
		let chat = Arc::new(RecordingChat::default());
		let external = Arc::new(RecordingExternal::default());
		let overlay = Arc::new(RecordingOverlay::default());

		let milestones = Arc::new(MilestoneNotifier::new(external.clone(), overlay.clone()));
		let commands = Arc::new(CommandProcessor::new(
			CommandProcessorConfig::default(),
			milestones,
			overlay.clone(),
		));

		let resolver = Arc::new(EligibilityResolver::new(
			moderators.clone(),
			EligibilityCache::disabled(),
			registry.clone(),
			Some(BOT_LOGIN.to_string()),
		));
		let connections = Arc::new(ConnectionManager::new(
			ConnectionManagerConfig::default(),
			store.clone(),
			store.clone(),
			refresher.clone(),
			resolver,
			registry.clone(),
			chat.clone(),
		));

		Self {
			store,
			registry,
			moderators,
			refresher,
			chat,
			external,
			overlay,
			replies: Arc::new(RecordingReplies::default()),
			commands,
			connections,
		}
	}

	/// Scope that records replies instead of sending chat.
	pub fn scope(&self) -> CommandScope<'_> {
		CommandScope {
			counters: &*self.store,
			configs: &*self.store,
			users: &*self.store,
			replies: &*self.replies,
		}
	}

	pub fn service(&self, transport: Arc<FakeTransport>, subscriptions: Arc<FakeSubscriptions>) -> EventSubscriptionService {
		EventSubscriptionService::new(
			SubscriptionServiceDeps {
				transport,
				subscriptions,
				users: self.store.clone(),
				counters: self.store.clone(),
				configs: self.store.clone(),
				connections: self.connections.clone(),
				commands: self.commands.clone(),
				registry: self.registry.clone(),
				external: self.external.clone(),
				overlay: self.overlay.clone(),
			},
			SubscriptionServiceConfig {
				bot_username: Some(BOT_LOGIN.to_string()),
			},
		)
	}
}
