#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{
	Moderator, ModeratorApi, ModeratorList, RefreshedToken, SecretString, SubscriptionApi,
	SubscriptionRequest, SubscriptionType, TokenRefresher,
};

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const CHAT_MESSAGES_PATH: &str = "/helix/chat/messages";
const MODERATION_MODERATORS_PATH: &str = "/helix/moderation/moderators";
const MODERATORS_PAGE_SIZE: u32 = 100;
/// Upper bound on followed pagination cursors for one moderator lookup.
const MODERATORS_MAX_PAGES: usize = 50;

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// Sends once, retrying a single time on 429 (honoring rate-limit headers) or 5xx.
///
/// Auth failures are returned to the caller as a normal response.
async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		debug!(label, delay_ms = delay.as_millis() as u64, "helix rate limited; retrying");
		tokio::time::sleep(delay).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	Ok(resp)
}

/// Helix REST client. Calls take the bearer token of the identity they act as.
#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
}

#[derive(Debug, Serialize)]
struct HelixBroadcasterCondition<'a> {
	broadcaster_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixChatMessageCondition<'a> {
	broadcaster_user_id: &'a str,
	user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'a str,
	session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a, TCondition> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: TCondition,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixSendChatMessage<'a> {
	broadcaster_id: &'a str,
	sender_id: &'a str,
	message: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	reply_parent_message_id: Option<&'a str>,
}

/// Outcome of a subscription create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
	Created { id: String },
	AlreadyExists,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: impl Into<String>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("tallybot/0.x (helix)")
			.timeout(Duration::from_secs(15))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {token}"))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	/// One page of `GET /helix/moderation/moderators`.
	async fn get_moderators_page(
		&self,
		broadcaster_id: &str,
		token: &str,
		after: Option<&str>,
	) -> anyhow::Result<Result<HelixModeratorsResponse, StatusCode>> {
		let mut path = format!(
			"{base}?broadcaster_id={b}&first={MODERATORS_PAGE_SIZE}",
			base = MODERATION_MODERATORS_PATH,
			b = urlencoding::encode(broadcaster_id),
		);
		if let Some(cursor) = after {
			path.push_str("&after=");
			path.push_str(&urlencoding::encode(cursor));
		}
		let url = self.url(&path)?;

		let resp = send_with_retry(self.authed(self.http.get(url), token), "GET /helix/moderation/moderators")
			.await
			.context("helix GET /helix/moderation/moderators send")?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.context("helix GET /helix/moderation/moderators read body")?;

		if !status.is_success() {
			debug!(%status, broadcaster_id, body = %body, "helix moderators lookup rejected");
			return Ok(Err(status));
		}

		let parsed = serde_json::from_str(&body).context("helix moderators parse json")?;
		Ok(Ok(parsed))
	}

	/// Full moderator list for a channel, following pagination cursors.
	pub async fn list_moderators(&self, broadcaster_id: &str, token: &str) -> anyhow::Result<ModeratorList> {
		let mut moderators = Vec::new();
		let mut cursor: Option<String> = None;

		for _ in 0..MODERATORS_MAX_PAGES {
			let page = match self.get_moderators_page(broadcaster_id, token, cursor.as_deref()).await? {
				Ok(page) => page,
				Err(status) => return Ok(ModeratorList::status(status.as_u16())),
			};

			moderators.extend(page.data.into_iter().map(|m| Moderator {
				user_id: m.user_id,
				user_login: m.user_login,
				user_name: m.user_name,
			}));

			cursor = page
				.pagination
				.and_then(|p| p.cursor)
				.filter(|c| !c.trim().is_empty());
			if cursor.is_none() {
				break;
			}
		}

		Ok(ModeratorList::ok(moderators))
	}

	async fn create_eventsub_subscription<TCondition: Serialize>(
		&self,
		token: &str,
		kind: SubscriptionType,
		session_id: &str,
		condition: TCondition,
	) -> anyhow::Result<SubscriptionOutcome> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let helix_type = kind.as_helix_type();

		let req = HelixCreateSubscriptionRequest {
			r#type: helix_type,
			version: kind.version(),
			condition,
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url), token).json(&req),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={helix_type})"))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={helix_type})"))?;

		if status == StatusCode::CONFLICT {
			return Ok(SubscriptionOutcome::AlreadyExists);
		}
		if !status.is_success() {
			anyhow::bail!("helix create subscription failed (type={helix_type}): status={status} body={body}");
		}

		let parsed: HelixCreateSubscriptionResponse =
			serde_json::from_str(&body).with_context(|| format!("helix create subscription parse json (type={helix_type})"))?;
		let id = parsed.data.into_iter().next().map(|d| d.id).unwrap_or_default();
		Ok(SubscriptionOutcome::Created { id })
	}

	/// Subscribe `kind` for one broadcaster on the given websocket session.
	pub async fn subscribe(&self, request: SubscriptionRequest<'_>) -> anyhow::Result<SubscriptionOutcome> {
		let SubscriptionRequest {
			kind,
			broadcaster_user_id,
			session_id,
			access_token,
		} = request;

		match kind {
			SubscriptionType::ChatMessage => {
				self.create_eventsub_subscription(
					access_token,
					kind,
					session_id,
					HelixChatMessageCondition {
						broadcaster_user_id,
						user_id: broadcaster_user_id,
					},
				)
				.await
			}
			SubscriptionType::StreamOnline | SubscriptionType::StreamOffline | SubscriptionType::ChannelCheer => {
				self.create_eventsub_subscription(
					access_token,
					kind,
					session_id,
					HelixBroadcasterCondition { broadcaster_user_id },
				)
				.await
			}
		}
	}

	/// `POST /helix/chat/messages` as `sender_id`.
	pub async fn send_chat_message(
		&self,
		token: &str,
		broadcaster_id: &str,
		sender_id: &str,
		message: &str,
		reply_to: Option<&str>,
	) -> anyhow::Result<()> {
		let url = self.url(CHAT_MESSAGES_PATH)?;
		let req = HelixSendChatMessage {
			broadcaster_id,
			sender_id,
			message,
			reply_parent_message_id: reply_to,
		};
		let resp = send_with_retry(self.authed(self.http.post(url), token).json(&req), "POST /helix/chat/messages")
			.await
			.context("helix POST /helix/chat/messages send")?;
		let status = resp.status();
		let body = resp.text().await.unwrap_or_default();
		if !status.is_success() {
			anyhow::bail!("helix send chat failed: status={status} body={body}");
		}

		if let Ok(parsed) = serde_json::from_str::<HelixSendChatMessageResponse>(&body)
			&& let Some(result) = parsed.data.into_iter().next()
			&& !result.is_sent
		{
			let reason = result.drop_reason.map(|d| d.message).unwrap_or_default();
			anyhow::bail!("helix send chat dropped: {reason}");
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl ModeratorApi for HelixClient {
	async fn get_moderators(&self, broadcaster_id: &str, access_token: &str) -> anyhow::Result<ModeratorList> {
		self.list_moderators(broadcaster_id, access_token).await
	}
}

#[async_trait::async_trait]
impl SubscriptionApi for HelixClient {
	async fn create_subscription(&self, request: SubscriptionRequest<'_>) -> anyhow::Result<()> {
		match self.subscribe(request).await? {
			SubscriptionOutcome::Created { id } => {
				debug!(
					kind = %request.kind,
					broadcaster_id = request.broadcaster_user_id,
					subscription_id = %id,
					"eventsub subscription created"
				);
			}
			SubscriptionOutcome::AlreadyExists => {
				debug!(
					kind = %request.kind,
					broadcaster_id = request.broadcaster_user_id,
					"eventsub subscription already exists"
				);
			}
		}
		Ok(())
	}
}

#[derive(Debug, Deserialize)]
struct TwitchTokenRefreshResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	expires_in: u64,
}

/// OAuth refresh-token grant against the Twitch id service.
#[derive(Clone, Debug)]
pub struct TwitchTokenRefresher {
	http: reqwest::Client,
	token_url: Url,
	client_id: String,
	client_secret: SecretString,
}

impl TwitchTokenRefresher {
	pub fn new(token_url: Url, client_id: impl Into<String>, client_secret: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("tallybot/0.x (oauth-refresh)")
			.timeout(Duration::from_secs(15))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			token_url,
			client_id: client_id.into(),
			client_secret,
		})
	}
}

#[async_trait::async_trait]
impl TokenRefresher for TwitchTokenRefresher {
	async fn refresh_token(&self, refresh_token: &str) -> anyhow::Result<Option<RefreshedToken>> {
		let resp = self
			.http
			.post(self.token_url.clone())
			.form(&[
				("grant_type", "refresh_token"),
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose()),
				("refresh_token", refresh_token),
			])
			.send()
			.await
			.context("twitch refresh token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch refresh token read body")?;

		if !status.is_success() {
			warn!(%status, body = %body, "twitch refresh token rejected");
			return Ok(None);
		}

		let parsed: TwitchTokenRefreshResponse =
			serde_json::from_str(&body).context("twitch refresh token parse json")?;

		Ok(Some(RefreshedToken {
			access_token: SecretString::new(parsed.access_token),
			refresh_token: parsed.refresh_token.map(SecretString::new),
			expires_in: Duration::from_secs(parsed.expires_in),
		}))
	}
}

#[derive(Debug, Deserialize)]
struct HelixModeratorsResponse {
	data: Vec<HelixModerator>,
	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
struct HelixModerator {
	user_id: String,
	#[serde(default)]
	user_login: String,
	#[serde(default)]
	user_name: String,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
	#[serde(default)]
	cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixCreateSubscriptionResponse {
	data: Vec<HelixSubscriptionData>,
}

#[derive(Debug, Deserialize)]
struct HelixSubscriptionData {
	id: String,
}

#[derive(Debug, Deserialize)]
struct HelixSendChatMessageResponse {
	data: Vec<HelixSendChatMessageResult>,
}

#[derive(Debug, Deserialize)]
struct HelixSendChatMessageResult {
	#[serde(default = "default_true")]
	is_sent: bool,
	#[serde(default)]
	drop_reason: Option<HelixDropReason>,
}

#[derive(Debug, Deserialize)]
struct HelixDropReason {
	#[serde(default)]
	message: String,
}

fn default_true() -> bool {
	true
}
