#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use anyhow::Context;
use serde::Deserialize;

use crate::{ChatNotification, EventSubNotification, SubscriptionType};

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
struct EventSubMetadataPeek {
	metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
struct EventSubMetadataPeekInner {
	message_type: String,
	#[serde(default)]
	subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventSubSessionMessage {
	payload: EventSubSessionPayload,
}

#[derive(Debug, Deserialize)]
struct EventSubSessionPayload {
	session: EventSubSession,
}

#[derive(Debug, Deserialize)]
struct EventSubSession {
	id: String,
	#[serde(default)]
	keepalive_timeout_seconds: Option<u64>,
	#[serde(default)]
	reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventSubNotificationMessage<TEvent> {
	payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
struct EventSubNotificationPayload<TEvent> {
	event: TEvent,
}

#[derive(Debug, Deserialize)]
struct EventSubRevocationMessage {
	payload: EventSubRevocationPayload,
}

#[derive(Debug, Deserialize)]
struct EventSubRevocationPayload {
	subscription: EventSubRevokedSubscription,
}

#[derive(Debug, Deserialize)]
struct EventSubRevokedSubscription {
	#[serde(rename = "type")]
	r#type: String,
	#[serde(default)]
	status: String,
}

#[derive(Debug, Deserialize)]
struct StreamOnlineEvent {
	id: String,
	broadcaster_user_id: String,
	#[serde(default)]
	broadcaster_user_login: String,
	#[serde(default)]
	started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamOfflineEvent {
	broadcaster_user_id: String,
	#[serde(default)]
	broadcaster_user_login: String,
}

#[derive(Debug, Deserialize)]
struct ChannelChatMessageEvent {
	broadcaster_user_id: String,
	#[serde(default)]
	broadcaster_user_login: String,

	chatter_user_id: String,
	#[serde(default)]
	chatter_user_login: String,
	#[serde(default)]
	chatter_user_name: String,

	message_id: String,
	message: ChannelChatMessageContent,
	#[serde(default)]
	badges: Vec<TwitchChatBadge>,
}

#[derive(Debug, Deserialize)]
struct ChannelChatMessageContent {
	#[serde(default)]
	text: String,
}

#[derive(Debug, Deserialize)]
struct TwitchChatBadge {
	set_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelCheerEvent {
	#[serde(default)]
	is_anonymous: bool,
	#[serde(default)]
	user_login: Option<String>,
	broadcaster_user_id: String,
	bits: u64,
}

/// One decoded EventSub websocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSubFrame {
	Welcome {
		session_id: String,
		keepalive_timeout: Option<Duration>,
	},
	Keepalive,
	Reconnect {
		reconnect_url: String,
	},
	Notification(EventSubNotification),
	Revocation {
		subscription_type: String,
		status: String,
	},
	Unknown {
		message_type: String,
	},
}

pub fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

pub fn parse_message_timestamp_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

/// Decode a raw websocket text frame.
pub fn parse_frame(raw_json: &str) -> anyhow::Result<EventSubFrame> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;

	match peek.metadata.message_type.as_str() {
		"session_welcome" => {
			let msg: EventSubSessionMessage = serde_json::from_str(raw_json).context("parse session_welcome")?;
			Ok(EventSubFrame::Welcome {
				session_id: msg.payload.session.id,
				keepalive_timeout: msg
					.payload
					.session
					.keepalive_timeout_seconds
					.filter(|s| *s > 0)
					.map(Duration::from_secs),
			})
		}
		"session_keepalive" => Ok(EventSubFrame::Keepalive),
		"session_reconnect" => {
			let msg: EventSubSessionMessage = serde_json::from_str(raw_json).context("parse session_reconnect")?;
			let reconnect_url = msg
				.payload
				.session
				.reconnect_url
				.filter(|u| !u.trim().is_empty())
				.context("session_reconnect missing reconnect_url")?;
			Ok(EventSubFrame::Reconnect { reconnect_url })
		}
		"revocation" => {
			let msg: EventSubRevocationMessage = serde_json::from_str(raw_json).context("parse revocation")?;
			Ok(EventSubFrame::Revocation {
				subscription_type: msg.payload.subscription.r#type,
				status: msg.payload.subscription.status,
			})
		}
		"notification" => {
			let subscription_type = peek.metadata.subscription_type.unwrap_or_default();
			parse_notification(&subscription_type, raw_json).map(EventSubFrame::Notification)
		}
		other => Ok(EventSubFrame::Unknown {
			message_type: other.to_string(),
		}),
	}
}

fn parse_event<TEvent: for<'de> Deserialize<'de>>(raw_json: &str, label: &'static str) -> anyhow::Result<TEvent> {
	let msg: EventSubNotificationMessage<TEvent> =
		serde_json::from_str(raw_json).with_context(|| format!("parse {label} notification"))?;
	Ok(msg.payload.event)
}

fn parse_notification(subscription_type: &str, raw_json: &str) -> anyhow::Result<EventSubNotification> {
	let kind = SubscriptionType::ALL
		.into_iter()
		.find(|k| k.as_helix_type() == subscription_type);

	let Some(kind) = kind else {
		return Ok(EventSubNotification::Other {
			subscription_type: subscription_type.to_string(),
		});
	};

	match kind {
		SubscriptionType::StreamOnline => {
			let ev: StreamOnlineEvent = parse_event(raw_json, "stream.online")?;
			let started_at = ev
				.started_at
				.as_deref()
				.and_then(|ts| parse_message_timestamp_system_time(ts).ok());
			Ok(EventSubNotification::StreamOnline {
				broadcaster_user_id: ev.broadcaster_user_id,
				broadcaster_user_login: ev.broadcaster_user_login,
				stream_id: ev.id,
				started_at,
			})
		}
		SubscriptionType::StreamOffline => {
			let ev: StreamOfflineEvent = parse_event(raw_json, "stream.offline")?;
			Ok(EventSubNotification::StreamOffline {
				broadcaster_user_id: ev.broadcaster_user_id,
				broadcaster_user_login: ev.broadcaster_user_login,
			})
		}
		SubscriptionType::ChatMessage => {
			let ev: ChannelChatMessageEvent = parse_event(raw_json, "channel.chat.message")?;
			Ok(EventSubNotification::ChatMessage(ChatNotification {
				broadcaster_user_id: ev.broadcaster_user_id,
				broadcaster_user_login: ev.broadcaster_user_login,
				chatter_user_id: ev.chatter_user_id,
				chatter_user_login: ev.chatter_user_login,
				chatter_user_name: ev.chatter_user_name,
				message_id: ev.message_id,
				text: ev.message.text,
				badges: ev.badges.into_iter().map(|b| b.set_id).collect(),
			}))
		}
		SubscriptionType::ChannelCheer => {
			let ev: ChannelCheerEvent = parse_event(raw_json, "channel.cheer")?;
			Ok(EventSubNotification::Cheer {
				broadcaster_user_id: ev.broadcaster_user_id,
				bits: ev.bits,
				user_login: if ev.is_anonymous { None } else { ev.user_login },
			})
		}
	}
}
