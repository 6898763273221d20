#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tallybot_domain::OverlayEvent;
use tallybot_platform::{ChatNotification, EventSubNotification, SessionEvent, SubscriptionType};
use tokio::time::{sleep, timeout};

use crate::engine::fakes::{
	BOT_ID, BOT_LOGIN, ChatSend, FakeModerators, FakeRefresher, FakeSubscriptions, FakeTransport, Harness,
	RefreshOutcome, bot_credentials, user, with_milestones,
};
use crate::engine::subscriptions::{SessionState, SubscribeSummary, chat_context};
use crate::stores::CounterStore;

async fn eventually(mut cond: impl FnMut() -> bool) {
	timeout(Duration::from_secs(2), async {
		while !cond() {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition not met in time");
}

fn chat(chatter_id: &str, login: &str, text: &str, badges: &[&str]) -> ChatNotification {
	ChatNotification {
		broadcaster_user_id: "100".to_string(),
		broadcaster_user_login: "caster".to_string(),
		chatter_user_id: chatter_id.to_string(),
		chatter_user_login: login.to_string(),
		chatter_user_name: login.to_string(),
		message_id: "m-1".to_string(),
		text: text.to_string(),
		badges: badges.iter().map(|b| b.to_string()).collect(),
	}
}

fn online(stream_id: &str) -> EventSubNotification {
	EventSubNotification::StreamOnline {
		broadcaster_user_id: "100".to_string(),
		broadcaster_user_login: "caster".to_string(),
		stream_id: stream_id.to_string(),
		started_at: None,
	}
}

#[tokio::test]
async fn failing_broadcaster_does_not_block_others() {
	let h = Harness::new(vec![user("100", "caster"), user("200", "other")]);
	let subs = Arc::new(FakeSubscriptions::failing_for(&["100"]));
	let service = h.service(Arc::new(FakeTransport::default()), subs.clone());

	let summary = service.subscribe_all("sess-1").await;
	assert_eq!(
		summary,
		SubscribeSummary {
			subscribed: 1,
			failed: 1,
			interrupted: false,
		}
	);
	assert!(subs.kinds_for("100").is_empty());
	assert_eq!(subs.kinds_for("200"), SubscriptionType::ALL.to_vec());
	assert!(subs.kinds_for("200").contains(&SubscriptionType::StreamOffline));
}

#[tokio::test]
async fn inactive_users_are_skipped() {
	let mut idle = user("200", "idle");
	idle.is_active = false;
	let h = Harness::new(vec![user("100", "caster"), idle]);
	let subs = Arc::new(FakeSubscriptions::default());
	let service = h.service(Arc::new(FakeTransport::default()), subs.clone());

	assert_eq!(service.subscribe_all("sess-1").await.subscribed, 1);
	assert!(subs.kinds_for("200").is_empty());
}

#[tokio::test]
async fn welcome_connects_and_subscribes() {
	let h = Harness::new(vec![user("100", "caster"), user("200", "other")]);
	let transport = Arc::new(FakeTransport::default());
	let subs = Arc::new(FakeSubscriptions::default());
	let service = h.service(transport.clone(), subs.clone());
	assert_eq!(service.state(), SessionState::Disconnected);

	service.start().await.expect("start");
	service.start().await.expect("second start is a no-op");
	assert_eq!(transport.connects(), 1);
	assert_eq!(service.state(), SessionState::Connecting);

	transport
		.emit(SessionEvent::Welcome {
			session_id: "sess-1".to_string(),
		})
		.await;

	let mut state = service.watch_state();
	timeout(
		Duration::from_secs(2),
		state.wait_for(|s| matches!(s, SessionState::Connected { .. })),
	)
	.await
	.expect("connected in time")
	.expect("state channel open");
	assert_eq!(
		service.state(),
		SessionState::Connected {
			session_id: "sess-1".to_string()
		}
	);

	eventually(|| subs.total() == 2 * SubscriptionType::ALL.len()).await;
	assert_eq!(subs.session_ids(), HashSet::from(["sess-1".to_string()]));

	service.stop().await;
	assert_eq!(service.state(), SessionState::Stopped);
	assert_eq!(transport.disconnects(), 1);
}

#[tokio::test]
async fn lost_session_reports_disconnected() {
	let h = Harness::new(vec![]);
	let transport = Arc::new(FakeTransport::default());
	let service = h.service(transport.clone(), Arc::new(FakeSubscriptions::default()));

	service.start().await.expect("start");
	transport
		.emit(SessionEvent::Welcome {
			session_id: "sess-1".to_string(),
		})
		.await;
	transport
		.emit(SessionEvent::Disconnected {
			reason: "keepalive timeout".to_string(),
		})
		.await;

	let mut state = service.watch_state();
	timeout(
		Duration::from_secs(2),
		state.wait_for(|s| *s == SessionState::Disconnected),
	)
	.await
	.expect("disconnected in time")
	.expect("state channel open");

	service.stop().await;
}

#[tokio::test]
async fn stalled_broadcaster_does_not_hold_up_others() {
	let h = Harness::build(
		vec![user("100", "caster"), user("200", "other")],
		Some(bot_credentials()),
		FakeModerators::hanging(),
		FakeRefresher::new(RefreshOutcome::Token("fresh-token")),
	);
	let mut row = h.store.get_counters("200").await.expect("counters");
	row.stream_started = Some(std::time::SystemTime::now());
	h.store.save_counters(&row).await.expect("save");

	let transport = Arc::new(FakeTransport::default());
	let service = h.service(transport.clone(), Arc::new(FakeSubscriptions::default()));
	service.start().await.expect("start");

	// The reply for 100 waits on a moderator lookup that never completes.
	transport
		.emit(SessionEvent::Notification(Box::new(EventSubNotification::ChatMessage(chat(
			"300",
			"helper",
			"!death+",
			&["moderator"],
		)))))
		.await;
	transport
		.emit(SessionEvent::Notification(Box::new(EventSubNotification::StreamOffline {
			broadcaster_user_id: "200".to_string(),
			broadcaster_user_login: "other".to_string(),
		})))
		.await;

	let overlay = h.overlay.clone();
	eventually(move || {
		overlay
			.events()
			.contains(&("200".to_string(), OverlayEvent::StreamEnded {}))
	})
	.await;
	let row = h.store.get_counters("200").await.expect("counters");
	assert_eq!(row.stream_started, None);
	let moderators = h.moderators.clone();
	eventually(move || moderators.calls() == 1).await;
	assert!(h.chat.sent().is_empty());

	service.stop().await;
}

#[tokio::test]
async fn stopped_service_stays_stopped() {
	let h = Harness::new(vec![user("100", "caster")]);
	let transport = Arc::new(FakeTransport::default());
	let subs = Arc::new(FakeSubscriptions::default());
	let service = h.service(transport.clone(), subs.clone());

	service.stop().await;
	assert_eq!(service.state(), SessionState::Stopped);

	let summary = service.subscribe_all("sess-1").await;
	assert!(summary.interrupted);
	assert_eq!(summary.subscribed, 0);
	assert_eq!(subs.total(), 0);

	service.start().await.expect("start after stop");
	assert_eq!(transport.connects(), 0);
	assert_eq!(service.state(), SessionState::Stopped);

	service.stop().await;
}

#[tokio::test]
async fn stream_start_notifies_once_per_stream() {
	let h = Harness::new(vec![user("100", "caster")]);
	let service = h.service(Arc::new(FakeTransport::default()), Arc::new(FakeSubscriptions::default()));

	service.dispatch(online("s-1")).await;
	service.dispatch(online("s-1")).await;
	service.dispatch(online("s-2")).await;

	let events = h.external.events();
	assert_eq!(events.len(), 2);
	assert_eq!(events[0].1, "stream_started");
	assert_eq!(events[0].2["streamId"], "s-1");
	assert_eq!(events[1].2["streamId"], "s-2");

	let row = h.store.get_counters("100").await.expect("counters");
	assert!(row.stream_started.is_some());
	assert_eq!(row.last_notified_stream_id.as_deref(), Some("s-2"));

	assert!(h.connections.is_connected("100"));
	assert!(h.overlay.events().contains(&(
		"100".to_string(),
		OverlayEvent::StreamStarted {
			stream_id: Some("s-1".to_string())
		}
	)));
}

#[tokio::test]
async fn stream_end_clears_start_time() {
	let h = Harness::new(vec![user("100", "caster")]);
	let service = h.service(Arc::new(FakeTransport::default()), Arc::new(FakeSubscriptions::default()));

	service.dispatch(online("s-1")).await;
	service
		.dispatch(EventSubNotification::StreamOffline {
			broadcaster_user_id: "100".to_string(),
			broadcaster_user_login: "caster".to_string(),
		})
		.await;

	let row = h.store.get_counters("100").await.expect("counters");
	assert_eq!(row.stream_started, None);
	assert_eq!(
		h.overlay.events().last(),
		Some(&("100".to_string(), OverlayEvent::StreamEnded {}))
	);
	assert!(h.connections.is_connected("100"));
}

#[tokio::test]
async fn moderator_chat_command_replies_as_bot() {
	let h = Harness::new(vec![user("100", "caster")]);
	let service = h.service(Arc::new(FakeTransport::default()), Arc::new(FakeSubscriptions::default()));

	service
		.dispatch(EventSubNotification::ChatMessage(chat(
			"300",
			"helper",
			"!death+",
			&["moderator"],
		)))
		.await;

	assert_eq!(h.store.get_counters("100").await.expect("counters").deaths, 1);
	assert_eq!(
		h.chat.sent(),
		vec![ChatSend {
			broadcaster_id: "100".to_string(),
			text: "Death count: 1".to_string(),
			reply_to: Some("m-1".to_string()),
			as_bot: Some(BOT_ID.to_string()),
		}]
	);
}

#[tokio::test]
async fn bot_messages_are_ignored() {
	let h = Harness::new(vec![user("100", "caster")]);
	let service = h.service(Arc::new(FakeTransport::default()), Arc::new(FakeSubscriptions::default()));
	h.connections.connect_user("100").await;

	let by_login = chat("901", &BOT_LOGIN.to_uppercase(), "!death+", &["moderator"]);
	let by_id = chat(BOT_ID, "renamed", "!death+", &["moderator"]);
	service.dispatch(EventSubNotification::ChatMessage(by_login)).await;
	service.dispatch(EventSubNotification::ChatMessage(by_id)).await;

	assert_eq!(h.store.get_counters("100").await.expect("counters").deaths, 0);
	assert!(h.chat.sent().is_empty());
}

#[tokio::test]
async fn cheer_adds_bits_and_checks_milestones() {
	let h = Harness::new(vec![with_milestones(user("100", "caster"), false, true, "bits", &[100, 500])]);
	let service = h.service(Arc::new(FakeTransport::default()), Arc::new(FakeSubscriptions::default()));

	service
		.dispatch(EventSubNotification::Cheer {
			broadcaster_user_id: "100".to_string(),
			bits: 150,
			user_login: Some("fan".to_string()),
		})
		.await;

	assert_eq!(h.store.get_counters("100").await.expect("counters").bits, 150);
	assert_eq!(h.external.event_names(), vec!["bits_milestone".to_string()]);
	let overlay = h.overlay.events();
	assert!(overlay.contains(&(
		"100".to_string(),
		OverlayEvent::CounterUpdated {
			counter: "bits".to_string(),
			value: 150,
		}
	)));
	assert!(overlay.contains(&(
		"100".to_string(),
		OverlayEvent::MilestoneReached {
			counter: "bits".to_string(),
			threshold: 100,
			new_value: 150,
			remaining_to_next: Some(350),
		}
	)));
}

#[tokio::test]
async fn unhandled_notifications_are_ignored() {
	let h = Harness::new(vec![user("100", "caster")]);
	let service = h.service(Arc::new(FakeTransport::default()), Arc::new(FakeSubscriptions::default()));

	service
		.dispatch(EventSubNotification::Other {
			subscription_type: "channel.follow".to_string(),
		})
		.await;
	assert!(h.overlay.events().is_empty());
	assert!(h.external.events().is_empty());
}

#[test]
fn badges_map_to_tiers() {
	let ctx = chat_context(chat("300", "viewer", "!deaths", &["VIP"]));
	assert!(ctx.is_subscriber);
	assert!(!ctx.is_moderator);
	assert!(!ctx.is_broadcaster);
	assert_eq!(ctx.user_id, "100");
	assert_eq!(ctx.message_id.as_deref(), Some("m-1"));

	let own_channel = chat_context(chat("100", "caster", "!resetdeaths", &[]));
	assert!(own_channel.is_broadcaster);

	let moderator = chat_context(chat("300", "helper", "!death+", &["moderator", "subscriber"]));
	assert!(moderator.is_moderator);
	assert!(moderator.is_subscriber);
}
