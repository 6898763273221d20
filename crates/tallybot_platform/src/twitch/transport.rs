#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::eventsub::{self, EventSubFrame};
use crate::{NotificationTransport, SessionEvent, SessionEventRx, SessionEventTx};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

/// Slack added on top of the server-announced keepalive before the watchdog fires.
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);
const MIGRATION_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct EventSubTransportConfig {
	pub ws_url: Url,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Used when the welcome message carries no keepalive timeout.
	pub default_keepalive: Duration,
	pub channel_capacity: usize,

	/// Optional override for websocket connects.
	pub ws_connector: Option<WsConnector>,
}

impl EventSubTransportConfig {
	pub fn new(ws_url: Url) -> Self {
		Self {
			ws_url,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			default_keepalive: Duration::from_secs(10),
			channel_capacity: 1024,
			ws_connector: None,
		}
	}
}

impl fmt::Debug for EventSubTransportConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventSubTransportConfig")
			.field("ws_url", &self.ws_url.as_str())
			.field("reconnect_min_delay", &self.reconnect_min_delay)
			.field("reconnect_max_delay", &self.reconnect_max_delay)
			.field("default_keepalive", &self.default_keepalive)
			.field("channel_capacity", &self.channel_capacity)
			.field("ws_connector", &self.ws_connector.as_ref().map(|_| "<custom>"))
			.finish()
	}
}

struct RunningSession {
	shutdown_tx: watch::Sender<bool>,
	task: JoinHandle<()>,
}

/// The single shared EventSub websocket session.
pub struct TwitchEventSubTransport {
	cfg: EventSubTransportConfig,
	session_id: Arc<Mutex<Option<String>>>,
	running: Mutex<Option<RunningSession>>,
}

impl TwitchEventSubTransport {
	pub fn new(cfg: EventSubTransportConfig) -> Self {
		Self {
			cfg,
			session_id: Arc::new(Mutex::new(None)),
			running: Mutex::new(None),
		}
	}
}

#[async_trait::async_trait]
impl NotificationTransport for TwitchEventSubTransport {
	async fn connect(&self) -> anyhow::Result<SessionEventRx> {
		self.disconnect().await;

		let (events_tx, events_rx) = mpsc::channel(self.cfg.channel_capacity.max(1));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let task = tokio::spawn(run_loop(
			self.cfg.clone(),
			Arc::clone(&self.session_id),
			events_tx,
			shutdown_rx,
		));

		*self.running.lock() = Some(RunningSession { shutdown_tx, task });
		Ok(events_rx)
	}

	async fn disconnect(&self) {
		let Some(RunningSession { shutdown_tx, mut task }) = self.running.lock().take() else {
			return;
		};

		let _ = shutdown_tx.send(true);
		if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
			warn!("eventsub transport did not stop in time; aborting");
			task.abort();
		}
		*self.session_id.lock() = None;
	}

	fn session_id(&self) -> Option<String> {
		self.session_id.lock().clone()
	}
}

pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<TwitchWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(ws)
}

fn ws_connector(cfg: &EventSubTransportConfig) -> WsConnector {
	if let Some(c) = &cfg.ws_connector {
		return c.clone();
	}

	Arc::new(|url: Url| Box::pin(connect_eventsub_ws(url)) as BoxFuture<'static, anyhow::Result<TwitchWs>>)
}

struct Welcome {
	session_id: String,
	keepalive_timeout: Option<Duration>,
}

async fn read_until_welcome(ws: &mut TwitchWs) -> anyhow::Result<Welcome> {
	loop {
		let Some(msg) = ws.next().await else {
			anyhow::bail!("ws closed before welcome");
		};
		let msg = msg.context("ws read")?;

		match msg {
			Message::Text(t) => {
				if let EventSubFrame::Welcome {
					session_id,
					keepalive_timeout,
				} = eventsub::parse_frame(&t)?
				{
					return Ok(Welcome {
						session_id,
						keepalive_timeout,
					});
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("ws closed before welcome: close={c:?}");
			}
			_ => {}
		}
	}
}

/// Opens the server-provided reconnect URL and waits for its welcome.
async fn migrate(connector: &WsConnector, reconnect_url: &str) -> anyhow::Result<(TwitchWs, Welcome)> {
	let url = Url::parse(reconnect_url).context("parse eventsub reconnect url")?;
	tokio::time::timeout(MIGRATION_TIMEOUT, async {
		let mut ws = connector(url).await?;
		let welcome = read_until_welcome(&mut ws).await?;
		Ok((ws, welcome))
	})
	.await
	.context("eventsub migration timed out")?
}

async fn publish_welcome(
	session_slot: &Mutex<Option<String>>,
	events_tx: &SessionEventTx,
	welcome: &Welcome,
) -> Result<(), mpsc::error::SendError<SessionEvent>> {
	*session_slot.lock() = Some(welcome.session_id.clone());
	events_tx
		.send(SessionEvent::Welcome {
			session_id: welcome.session_id.clone(),
		})
		.await
}

async fn run_loop(
	cfg: EventSubTransportConfig,
	session_slot: Arc<Mutex<Option<String>>>,
	events_tx: SessionEventTx,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let connector = ws_connector(&cfg);
	let mut reconnect_attempt: u32 = 0;

	'outer: loop {
		if *shutdown_rx.borrow() {
			break;
		}

		if reconnect_attempt > 0 {
			let delay = backoff_delay(reconnect_attempt, cfg.reconnect_min_delay, cfg.reconnect_max_delay);
			debug!(attempt = reconnect_attempt, delay_ms = delay.as_millis() as u64, "eventsub reconnect backoff");
			tokio::select! {
				_ = sleep(delay) => {}
				_ = shutdown_rx.changed() => break 'outer,
			}
		}

		let mut ws = match connector(cfg.ws_url.clone()).await {
			Ok(ws) => ws,
			Err(e) => {
				reconnect_attempt = reconnect_attempt.saturating_add(1);
				warn!(error = ?e, attempt = reconnect_attempt, "failed to connect eventsub ws");
				continue;
			}
		};

		let welcome = tokio::select! {
			w = read_until_welcome(&mut ws) => Some(w),
			_ = shutdown_rx.changed() => None,
		};
		let welcome = match welcome {
			Some(Ok(w)) => w,
			Some(Err(e)) => {
				reconnect_attempt = reconnect_attempt.saturating_add(1);
				warn!(error = ?e, attempt = reconnect_attempt, "failed to read session_welcome");
				continue;
			}
			None => {
				let _ = ws.close(None).await;
				break 'outer;
			}
		};

		reconnect_attempt = 0;
		let mut keepalive_timeout = welcome.keepalive_timeout.unwrap_or(cfg.default_keepalive) + KEEPALIVE_GRACE;
		info!(session_id = %welcome.session_id, keepalive_ms = keepalive_timeout.as_millis() as u64, "eventsub connected");

		if publish_welcome(&session_slot, &events_tx, &welcome).await.is_err() {
			let _ = ws.close(None).await;
			break 'outer;
		}

		let mut last_activity = Instant::now();

		let reason: String = loop {
			tokio::select! {
				_ = shutdown_rx.changed() => {
					let _ = ws.close(None).await;
					break 'outer;
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						break "eventsub ws ended".to_string();
					};

					let msg = match msg {
						Ok(m) => m,
						Err(e) => break format!("eventsub ws read error: {e}"),
					};

					match msg {
						Message::Text(t) => {
							last_activity = Instant::now();

							match eventsub::parse_frame(&t) {
								Ok(EventSubFrame::Keepalive) => {
									debug!("eventsub keepalive");
								}
								Ok(EventSubFrame::Notification(n)) => {
									metrics::counter!("tallybot_eventsub_notifications_total").increment(1);
									if events_tx.send(SessionEvent::Notification(Box::new(n))).await.is_err() {
										let _ = ws.close(None).await;
										break 'outer;
									}
								}
								Ok(EventSubFrame::Reconnect { reconnect_url }) => {
									info!("eventsub session_reconnect received; migrating");
									match migrate(&connector, &reconnect_url).await {
										Ok((ws2, welcome2)) => {
											let _ = ws.close(None).await;
											ws = ws2;
											keepalive_timeout =
												welcome2.keepalive_timeout.unwrap_or(cfg.default_keepalive) + KEEPALIVE_GRACE;
											last_activity = Instant::now();
											info!(session_id = %welcome2.session_id, "eventsub migration complete");
											if publish_welcome(&session_slot, &events_tx, &welcome2).await.is_err() {
												let _ = ws.close(None).await;
												break 'outer;
											}
										}
										Err(e) => {
											warn!(error = ?e, "eventsub migration failed; continuing on primary");
										}
									}
								}
								Ok(EventSubFrame::Revocation { subscription_type, status }) => {
									warn!(%subscription_type, %status, "eventsub subscription revoked");
								}
								Ok(EventSubFrame::Welcome { session_id, .. }) => {
									debug!(%session_id, "unexpected session_welcome on established socket");
								}
								Ok(EventSubFrame::Unknown { message_type }) => {
									debug!(%message_type, "ignoring eventsub message");
								}
								Err(e) => {
									warn!(error = ?e, "failed to parse eventsub message");
								}
							}
						}
						Message::Ping(p) => {
							last_activity = Instant::now();
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Pong(_) => {
							last_activity = Instant::now();
						}
						Message::Close(frame) => {
							break format!("eventsub ws closed: {frame:?}");
						}
						Message::Binary(_) | Message::Frame(_) => {}
					}
				}

				_ = sleep(keepalive_timeout) => {
					if last_activity.elapsed() > keepalive_timeout {
						let _ = ws.close(None).await;
						break "keepalive watchdog triggered".to_string();
					}
				}
			}
		};

		*session_slot.lock() = None;
		metrics::counter!("tallybot_eventsub_disconnects_total").increment(1);
		warn!(%reason, "eventsub session lost; reconnecting");
		if events_tx.send(SessionEvent::Disconnected { reason }).await.is_err() {
			break 'outer;
		}
		reconnect_attempt = reconnect_attempt.saturating_add(1);
	}

	*session_slot.lock() = None;
	info!("eventsub transport stopped");
}
