#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use dashmap::DashMap;
use tallybot_domain::{ChatCommandContext, OptId, OverlayEvent, User, broadcaster_key};
use tallybot_platform::{
	ChatNotification, EventSubNotification, NotificationTransport, SessionEvent, SessionEventRx, SubscriptionApi,
	SubscriptionRequest, SubscriptionType,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::commands::{CommandProcessor, CommandScope, CounterOp};
use super::connections::ConnectionManager;
use super::monitoring::MonitoringRegistry;
use super::sinks::{ExternalNotifier, OverlayPublisher};
use crate::stores::{ConfigStore, CounterStore, UserStore};

const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Queued notifications per broadcaster before new ones are dropped.
const WORKER_QUEUE_CAPACITY: usize = 256;

/// Lifecycle of the shared notification session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Disconnected,
	Connecting,
	Connected { session_id: String },
	/// Terminal.
	Stopped,
}

/// Collaborators wired in by the composition root.
pub struct SubscriptionServiceDeps {
	pub transport: Arc<dyn NotificationTransport>,
	pub subscriptions: Arc<dyn SubscriptionApi>,
	pub users: Arc<dyn UserStore>,
	pub counters: Arc<dyn CounterStore>,
	pub configs: Arc<dyn ConfigStore>,
	pub connections: Arc<ConnectionManager>,
	pub commands: Arc<CommandProcessor>,
	pub registry: Arc<MonitoringRegistry>,
	pub external: Arc<dyn ExternalNotifier>,
	pub overlay: Arc<dyn OverlayPublisher>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionServiceConfig {
	/// Chat from this login is never treated as a command.
	pub bot_username: Option<String>,
}

/// Result of one subscribe pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeSummary {
	pub subscribed: usize,
	pub failed: usize,
	pub interrupted: bool,
}

/// Owns the notification session and routes its events to the engine.
pub struct EventSubscriptionService {
	inner: Arc<Inner>,
	dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
	deps: SubscriptionServiceDeps,
	cfg: SubscriptionServiceConfig,
	state_tx: watch::Sender<SessionState>,
	shutdown_tx: watch::Sender<bool>,
	/// One in-order worker per broadcaster key.
	workers: DashMap<String, mpsc::Sender<EventSubNotification>>,
}

impl EventSubscriptionService {
	pub fn new(deps: SubscriptionServiceDeps, cfg: SubscriptionServiceConfig) -> Self {
		let (state_tx, _) = watch::channel(SessionState::Disconnected);
		let (shutdown_tx, _) = watch::channel(false);
		Self {
			inner: Arc::new(Inner {
				deps,
				cfg,
				state_tx,
				shutdown_tx,
				workers: DashMap::new(),
			}),
			dispatcher: Mutex::new(None),
		}
	}

	pub fn state(&self) -> SessionState {
		self.inner.state_tx.borrow().clone()
	}

	pub fn watch_state(&self) -> watch::Receiver<SessionState> {
		self.inner.state_tx.subscribe()
	}

	/// Connect the transport and spawn the single dispatcher. Calling it again while running is a no-op.
	pub async fn start(&self) -> anyhow::Result<()> {
		let mut dispatcher = self.dispatcher.lock().await;
		if dispatcher.is_some() {
			return Ok(());
		}
		if self.state() == SessionState::Stopped {
			warn!("subscription service already stopped; ignoring start");
			return Ok(());
		}

		self.inner.shutdown_tx.send_replace(false);
		self.inner.state_tx.send_replace(SessionState::Connecting);

		let events = match self.inner.deps.transport.connect().await {
			Ok(rx) => rx,
			Err(e) => {
				self.inner.state_tx.send_replace(SessionState::Disconnected);
				return Err(e).context("connect notification transport");
			}
		};

		let inner = Arc::clone(&self.inner);
		*dispatcher = Some(tokio::spawn(inner.run(events)));
		info!("subscription service started");
		Ok(())
	}

	/// Signal shutdown, close the transport and join the dispatcher. Safe to call repeatedly.
	pub async fn stop(&self) {
		self.inner.shutdown_tx.send_replace(true);
		self.inner.deps.transport.disconnect().await;

		if let Some(mut handle) = self.dispatcher.lock().await.take()
			&& tokio::time::timeout(DISPATCHER_STOP_TIMEOUT, &mut handle).await.is_err()
		{
			warn!("dispatcher did not stop in time; aborting");
			handle.abort();
		}
		self.inner.workers.clear();

		self.inner.state_tx.send_replace(SessionState::Stopped);
		info!("subscription service stopped");
	}

	/// Subscribe every active broadcaster to the session's topics.
	pub async fn subscribe_all(&self, session_id: &str) -> SubscribeSummary {
		self.inner.subscribe_all(session_id).await
	}

	/// Route one notification as the dispatcher would.
	pub async fn dispatch(&self, notification: EventSubNotification) {
		self.inner.dispatch(notification).await;
	}
}

impl Inner {
	fn shutting_down(&self) -> bool {
		*self.shutdown_tx.borrow()
	}

	/// Reads session events in order. Per-broadcaster work runs on worker tasks so a slow tenant
	/// never holds up the others.
	async fn run(self: Arc<Self>, mut events: SessionEventRx) {
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		loop {
			tokio::select! {
				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						break;
					}
				}
				ev = events.recv() => {
					let Some(ev) = ev else {
						debug!("session event channel closed");
						break;
					};
					self.handle_event(ev).await;
				}
			}
		}
	}

	async fn handle_event(self: &Arc<Self>, ev: SessionEvent) {
		match ev {
			SessionEvent::Welcome { session_id } => {
				info!(session_id = %session_id, "notification session established");
				self.state_tx.send_replace(SessionState::Connected {
					session_id: session_id.clone(),
				});
				let inner = Arc::clone(self);
				tokio::spawn(async move {
					let summary = inner.subscribe_all(&session_id).await;
					info!(
						session_id = %session_id,
						subscribed = summary.subscribed,
						failed = summary.failed,
						interrupted = summary.interrupted,
						"subscribe pass finished"
					);
				});
			}
			SessionEvent::Disconnected { reason } => {
				warn!(reason = %reason, "notification session lost");
				if !self.shutting_down() {
					self.state_tx.send_replace(SessionState::Disconnected);
				}
			}
			SessionEvent::Notification(n) => self.route(*n),
		}
	}

	/// Queue a notification on its broadcaster's worker, spawning the worker on first use.
	fn route(self: &Arc<Self>, notification: EventSubNotification) {
		let Some(key) = notification.broadcaster_user_id().and_then(broadcaster_key) else {
			debug!(
				subscription_type = %notification.subscription_type(),
				"ignoring notification without broadcaster"
			);
			return;
		};

		let mut notification = notification;
		for _ in 0..2 {
			let tx = self.worker_for(&key);
			match tx.try_send(notification) {
				Ok(()) => return,
				Err(TrySendError::Full(n)) => {
					warn!(
						broadcaster_id = %key,
						subscription_type = %n.subscription_type(),
						"broadcaster queue full; dropping notification"
					);
					metrics::counter!("tallybot_notifications_dropped_total").increment(1);
					return;
				}
				Err(TrySendError::Closed(n)) => {
					self.workers.remove(&key);
					notification = n;
				}
			}
		}
		warn!(broadcaster_id = %key, "broadcaster worker unavailable; dropping notification");
	}

	fn worker_for(self: &Arc<Self>, key: &str) -> mpsc::Sender<EventSubNotification> {
		self.workers
			.entry(key.to_string())
			.or_insert_with(|| {
				let (tx, mut rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
				let inner = Arc::clone(self);
				tokio::spawn(async move {
					while let Some(n) = rx.recv().await {
						inner.dispatch(n).await;
					}
				});
				tx
			})
			.clone()
	}

	async fn subscribe_all(&self, session_id: &str) -> SubscribeSummary {
		let mut summary = SubscribeSummary::default();

		let users = match self.deps.users.get_active_users().await {
			Ok(users) => users,
			Err(e) => {
				warn!(error = ?e, "failed to list active users; nothing subscribed");
				return summary;
			}
		};

		for user in users {
			if self.shutting_down() {
				info!("shutdown requested; stopping subscribe pass");
				summary.interrupted = true;
				break;
			}

			match self.subscribe_broadcaster(&user, session_id).await {
				Ok(()) => summary.subscribed += 1,
				Err(e) => {
					summary.failed += 1;
					metrics::counter!("tallybot_eventsub_subscribe_failures_total").increment(1);
					warn!(
						broadcaster_id = %user.user_id,
						login = %user.login,
						error = ?e,
						"failed to subscribe broadcaster"
					);
				}
			}
		}

		summary
	}

	async fn subscribe_broadcaster(&self, user: &User, session_id: &str) -> anyhow::Result<()> {
		let access_token = match self.deps.connections.fresh_user(user.clone()).await {
			Some(fresh) => fresh.access_token,
			None => user.access_token.clone(),
		};

		for kind in SubscriptionType::ALL {
			let request = SubscriptionRequest {
				kind,
				broadcaster_user_id: &user.user_id,
				session_id,
				access_token: &access_token,
			};
			self.deps
				.subscriptions
				.create_subscription(request)
				.await
				.with_context(|| format!("subscribe {kind}"))?;
		}

		debug!(broadcaster_id = %user.user_id, "broadcaster subscribed");
		Ok(())
	}

	fn scope(&self) -> CommandScope<'_> {
		CommandScope {
			counters: &*self.deps.counters,
			configs: &*self.deps.configs,
			users: &*self.deps.users,
			replies: &*self.deps.connections,
		}
	}

	async fn dispatch(&self, notification: EventSubNotification) {
		debug!(
			broadcaster_id = %OptId(notification.broadcaster_user_id()),
			subscription_type = %notification.subscription_type(),
			"dispatching notification"
		);
		metrics::counter!(
			"tallybot_notifications_dispatched_total",
			"type" => notification.subscription_type().to_string()
		)
		.increment(1);

		match notification {
			EventSubNotification::StreamOnline {
				broadcaster_user_id,
				stream_id,
				started_at,
				..
			} => self.on_stream_online(&broadcaster_user_id, stream_id, started_at).await,
			EventSubNotification::StreamOffline {
				broadcaster_user_id, ..
			} => self.on_stream_offline(&broadcaster_user_id).await,
			EventSubNotification::ChatMessage(chat) => self.on_chat_message(chat).await,
			EventSubNotification::Cheer {
				broadcaster_user_id,
				bits,
				..
			} => self.on_cheer(&broadcaster_user_id, bits).await,
			EventSubNotification::Other { subscription_type } => {
				debug!(subscription_type = %subscription_type, "ignoring unhandled notification");
			}
		}
	}

	async fn on_stream_online(&self, broadcaster_id: &str, stream_id: String, started_at: Option<SystemTime>) {
		info!(broadcaster_id = %broadcaster_id, stream_id = %stream_id, "stream online");
		let started_at = started_at.unwrap_or_else(SystemTime::now);

		let first_notice = match self.deps.counters.get_counters(broadcaster_id).await {
			Ok(mut row) => {
				let first = row.last_notified_stream_id.as_deref() != Some(stream_id.as_str());
				row.stream_started = Some(started_at);
				if first {
					row.last_notified_stream_id = Some(stream_id.clone());
				}
				if let Err(e) = self.deps.counters.save_counters(&row).await {
					warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to persist stream start");
				}
				first
			}
			Err(e) => {
				warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to load counters for stream start");
				false
			}
		};

		self.deps
			.overlay
			.publish(
				broadcaster_id,
				OverlayEvent::StreamStarted {
					stream_id: Some(stream_id.clone()),
				},
			)
			.await;

		self.deps.connections.connect_user(broadcaster_id).await;

		if !first_notice {
			return;
		}
		match self.deps.users.get_user(broadcaster_id).await {
			Ok(Some(user)) => {
				let data = serde_json::json!({ "streamId": stream_id });
				if let Err(e) = self.deps.external.notify(&user, "stream_started", data).await {
					warn!(broadcaster_id = %broadcaster_id, error = ?e, "stream started notification failed");
				}
			}
			Ok(None) => {}
			Err(e) => warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to load user for stream start"),
		}
	}

	async fn on_stream_offline(&self, broadcaster_id: &str) {
		info!(broadcaster_id = %broadcaster_id, "stream offline");
		match self.deps.counters.get_counters(broadcaster_id).await {
			Ok(mut row) => {
				row.stream_started = None;
				if let Err(e) = self.deps.counters.save_counters(&row).await {
					warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to persist stream end");
				}
			}
			Err(e) => warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to load counters for stream end"),
		}
		self.deps
			.overlay
			.publish(broadcaster_id, OverlayEvent::StreamEnded {})
			.await;
	}

	fn is_own_message(&self, chat: &ChatNotification) -> bool {
		let by_login = self
			.cfg
			.bot_username
			.as_deref()
			.is_some_and(|bot| chat.chatter_user_login.trim().eq_ignore_ascii_case(bot.trim()));
		let by_id = self
			.deps
			.registry
			.try_get_state(&chat.broadcaster_user_id)
			.and_then(|s| s.bot_user_id)
			.is_some_and(|id| id == chat.chatter_user_id);
		by_login || by_id
	}

	async fn on_chat_message(&self, chat: ChatNotification) {
		if self.is_own_message(&chat) {
			return;
		}

		let ctx = chat_context(chat);
		let outcome = self.deps.commands.process(&self.scope(), &ctx).await;
		debug!(broadcaster_id = %ctx.user_id, outcome = ?outcome, "chat message processed");
	}

	async fn on_cheer(&self, broadcaster_id: &str, bits: u64) {
		let bits = i64::try_from(bits).unwrap_or(i64::MAX);
		if bits <= 0 {
			return;
		}

		let scope = self.scope();
		match self
			.deps
			.commands
			.mutate_counter(scope.counters, broadcaster_id, "bits", CounterOp::Add(bits))
			.await
		{
			Ok((old, new)) => {
				debug!(broadcaster_id = %broadcaster_id, bits, total = new, "cheer recorded");
				self.deps
					.commands
					.notify_milestones(&scope, broadcaster_id, "bits", &[], old, new)
					.await;
			}
			Err(e) => warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to record cheer"),
		}
	}
}

/// Badges map to tiers; the broadcaster chatting in their own channel counts as broadcaster.
pub fn chat_context(chat: ChatNotification) -> ChatCommandContext {
	let is_broadcaster = chat.has_badge("broadcaster") || chat.chatter_user_id == chat.broadcaster_user_id;
	let is_moderator = chat.has_badge("moderator");
	let is_subscriber = chat.has_badge("subscriber") || chat.has_badge("founder") || chat.has_badge("vip");

	let display = if chat.chatter_user_name.trim().is_empty() {
		chat.chatter_user_login
	} else {
		chat.chatter_user_name
	};

	ChatCommandContext {
		user_id: chat.broadcaster_user_id,
		message: chat.text,
		is_moderator,
		is_broadcaster,
		is_subscriber,
		chatter_display_name: Some(display).filter(|s| !s.trim().is_empty()),
		message_id: Some(chat.message_id).filter(|s| !s.trim().is_empty()),
	}
}
