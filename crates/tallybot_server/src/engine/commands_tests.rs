#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tallybot_domain::{ChatCommandContext, CommandAction, Counter, OverlayEvent};
use tokio::task::JoinSet;

use crate::engine::commands::{CommandOutcome, CommandScope, CounterOp, ReplyVars, render_reply};
use crate::engine::fakes::{Harness, RecordingReplies, user, with_milestones};
use crate::stores::{CounterStore, MemoryStore};

fn viewer(message: &str) -> ChatCommandContext {
	ChatCommandContext {
		chatter_display_name: Some("Viewer".to_string()),
		message_id: Some("msg-1".to_string()),
		..ChatCommandContext::new("100", message)
	}
}

fn moderator(message: &str) -> ChatCommandContext {
	ChatCommandContext {
		is_moderator: true,
		..viewer(message)
	}
}

fn broadcaster(message: &str) -> ChatCommandContext {
	ChatCommandContext {
		is_broadcaster: true,
		..viewer(message)
	}
}

async fn deaths(h: &Harness) -> i64 {
	h.store.get_counters("100").await.expect("counters").deaths
}

fn harness() -> Harness {
	Harness::new(vec![user("100", "caster")])
}

#[tokio::test]
async fn moderator_increment_replies_once() {
	let h = harness();

	let outcome = h.commands.process(&h.scope(), &moderator("!death+")).await;
	assert_eq!(
		outcome,
		CommandOutcome::Executed {
			command: "!death+".to_string(),
			action: CommandAction::Increment,
			count: Some(1),
			reply: Some("Death count: 1".to_string()),
		}
	);
	assert_eq!(deaths(&h).await, 1);

	let sent = h.replies.sent();
	assert_eq!(sent.len(), 1);
	assert_eq!(sent[0].broadcaster_id, "100");
	assert_eq!(sent[0].text, "Death count: 1");
	assert_eq!(sent[0].reply_to.as_deref(), Some("msg-1"));
}

#[tokio::test]
async fn viewer_cannot_run_moderator_command() {
	let h = harness();

	assert_eq!(
		h.commands.process(&h.scope(), &viewer("!death+")).await,
		CommandOutcome::Denied
	);
	assert_eq!(deaths(&h).await, 0);
	assert!(h.replies.sent().is_empty());
	assert!(h.overlay.events().is_empty());
}

#[tokio::test]
async fn broadcaster_passes_moderator_gate() {
	let h = harness();
	let outcome = h.commands.process(&h.scope(), &broadcaster("!DEATH+")).await;
	assert!(matches!(outcome, CommandOutcome::Executed { count: Some(1), .. }));
}

#[tokio::test(start_paused = true)]
async fn cooldown_blocks_until_elapsed() {
	let h = harness();
	h.store.set_command_config_json(
		"100",
		r#"{"commands":{"!pog":{"action":"increment","counter":"pogs","cooldown":30,"response":"Pogs: {count}"}}}"#,
	);

	assert!(matches!(
		h.commands.process(&h.scope(), &viewer("!pog")).await,
		CommandOutcome::Executed { count: Some(1), .. }
	));
	assert_eq!(
		h.commands.process(&h.scope(), &viewer("!pog")).await,
		CommandOutcome::CoolingDown
	);

	tokio::time::advance(Duration::from_secs(29)).await;
	assert_eq!(
		h.commands.process(&h.scope(), &viewer("!POG")).await,
		CommandOutcome::CoolingDown
	);

	tokio::time::advance(Duration::from_secs(1)).await;
	assert!(matches!(
		h.commands.process(&h.scope(), &viewer("!pog")).await,
		CommandOutcome::Executed { count: Some(2), .. }
	));
	assert_eq!(h.replies.texts(), vec!["Pogs: 1".to_string(), "Pogs: 2".to_string()]);
}

#[tokio::test]
async fn cooldowns_are_per_broadcaster() {
	let h = Harness::new(vec![user("100", "caster"), user("200", "other")]);

	let first = viewer("!deaths");
	let other = ChatCommandContext {
		user_id: "200".to_string(),
		..viewer("!deaths")
	};
	assert!(matches!(
		h.commands.process(&h.scope(), &first).await,
		CommandOutcome::Executed { .. }
	));
	assert!(matches!(
		h.commands.process(&h.scope(), &other).await,
		CommandOutcome::Executed { .. }
	));
	assert_eq!(
		h.commands.process(&h.scope(), &first).await,
		CommandOutcome::CoolingDown
	);
}

#[tokio::test]
async fn explicit_amount_is_clamped() {
	let h = harness();

	h.commands.process(&h.scope(), &moderator("!death+ 3")).await;
	assert_eq!(deaths(&h).await, 3);

	h.commands.process(&h.scope(), &moderator("!death+ 500")).await;
	assert_eq!(deaths(&h).await, 13);

	h.commands.process(&h.scope(), &moderator("!death+ -4")).await;
	assert_eq!(deaths(&h).await, 14);

	h.commands.process(&h.scope(), &moderator("!death+ lots")).await;
	assert_eq!(deaths(&h).await, 15);
}

#[tokio::test]
async fn stored_cap_lowers_the_ceiling() {
	let h = harness();
	h.store.set_command_config_json(
		"100",
		r#"{"maxIncrementAmount":2,"commands":{"!death+":{"action":"increment","counter":"deaths","permission":"moderator"}}}"#,
	);

	h.commands.process(&h.scope(), &moderator("!death+ 9")).await;
	assert_eq!(deaths(&h).await, 2);
}

#[tokio::test]
async fn viewer_amount_is_ignored() {
	let h = harness();
	h.store.set_command_config_json(
		"100",
		r#"{"commands":{"!pog":{"action":"increment","counter":"pogs","incrementBy":2}}}"#,
	);

	h.commands.process(&h.scope(), &viewer("!pog 9")).await;
	let row = h.store.get_counters("100").await.expect("counters");
	assert_eq!(row.get("pogs"), 2);
}

#[tokio::test]
async fn decrement_floors_at_zero() {
	let h = harness();
	h.commands.process(&h.scope(), &moderator("!death+ 2")).await;

	let outcome = h.commands.process(&h.scope(), &moderator("!death- 5")).await;
	assert!(matches!(outcome, CommandOutcome::Executed { count: Some(0), .. }));
	assert_eq!(deaths(&h).await, 0);

	h.commands.process(&h.scope(), &moderator("!death-")).await;
	assert_eq!(deaths(&h).await, 0);
}

#[tokio::test]
async fn reset_zeroes_counter() {
	let h = harness();
	h.commands.process(&h.scope(), &moderator("!death+ 4")).await;

	assert_eq!(
		h.commands.process(&h.scope(), &moderator("!resetdeaths")).await,
		CommandOutcome::Denied
	);

	let outcome = h.commands.process(&h.scope(), &broadcaster("!resetdeaths")).await;
	assert!(matches!(
		outcome,
		CommandOutcome::Executed {
			action: CommandAction::Reset,
			count: Some(0),
			..
		}
	));
	assert_eq!(deaths(&h).await, 0);
	assert_eq!(h.replies.texts().last().map(String::as_str), Some("Death counter reset"));
}

#[tokio::test]
async fn text_command_reads_current_value() {
	let h = harness();
	h.commands.process(&h.scope(), &moderator("!death+ 2")).await;

	let outcome = h.commands.process(&h.scope(), &viewer("!deaths")).await;
	assert!(matches!(
		outcome,
		CommandOutcome::Executed {
			action: CommandAction::Text,
			count: Some(2),
			..
		}
	));
	assert_eq!(h.replies.texts().last().map(String::as_str), Some("Death count: 2"));
	assert_eq!(deaths(&h).await, 2);
}

#[tokio::test]
async fn malformed_config_uses_defaults() {
	let h = harness();
	h.store.set_command_config_json("100", "{nope");

	let outcome = h.commands.process(&h.scope(), &moderator("!death+")).await;
	assert!(matches!(outcome, CommandOutcome::Executed { count: Some(1), .. }));
}

#[tokio::test]
async fn unknown_messages_do_not_match() {
	let h = harness();
	for message in ["hello there", "!nothing", "", "   "] {
		assert_eq!(
			h.commands.process(&h.scope(), &moderator(message)).await,
			CommandOutcome::NoMatch
		);
	}
	assert!(h.replies.sent().is_empty());
}

#[tokio::test]
async fn counterless_mutation_acts_as_text() {
	let h = harness();
	h.store.set_command_config_json(
		"100",
		r#"{"commands":{"!hype":{"action":"increment","response":"Hype {user}!"}}}"#,
	);

	let outcome = h.commands.process(&h.scope(), &viewer("!hype")).await;
	assert_eq!(
		outcome,
		CommandOutcome::Executed {
			command: "!hype".to_string(),
			action: CommandAction::Text,
			count: None,
			reply: Some("Hype Viewer!".to_string()),
		}
	);
	assert!(h.overlay.events().is_empty());
}

#[tokio::test]
async fn empty_response_reports_counter_after_mutation() {
	let h = harness();
	h.store.set_command_config_json(
		"100",
		r#"{"commands":{"!pog":{"action":"increment","counter":"pogs"},"!quiet":{"action":"text"}}}"#,
	);

	h.commands.process(&h.scope(), &viewer("!pog")).await;
	h.commands.process(&h.scope(), &viewer("!quiet")).await;
	assert_eq!(h.replies.texts(), vec!["Pogs: 1".to_string()]);
}

#[tokio::test]
async fn mutation_publishes_overlay_update() {
	let h = harness();
	h.commands.process(&h.scope(), &moderator("!swear+ 2")).await;

	assert_eq!(
		h.overlay.events(),
		vec![(
			"100".to_string(),
			OverlayEvent::CounterUpdated {
				counter: "swears".to_string(),
				value: 2,
			}
		)]
	);
}

#[tokio::test]
async fn milestone_message_precedes_command_reply() {
	let h = Harness::new(vec![with_milestones(user("100", "caster"), true, false, "deaths", &[1, 5])]);

	h.commands.process(&h.scope(), &moderator("!death+")).await;
	assert_eq!(
		h.replies.texts(),
		vec![
			"🎉 MILESTONE: Deaths reached 1! 4 more to the next one.".to_string(),
			"Death count: 1".to_string(),
		]
	);
}

#[tokio::test]
async fn definition_milestones_extend_user_thresholds() {
	let h = Harness::new(vec![with_milestones(user("100", "caster"), false, true, "pogs", &[])]);
	h.store.set_command_config_json(
		"100",
		r#"{"commands":{"!pog":{"action":"increment","counter":"pogs","milestones":[2]}}}"#,
	);

	h.commands.process(&h.scope(), &viewer("!pog")).await;
	assert!(h.external.events().is_empty());
	h.commands.process(&h.scope(), &viewer("!pog")).await;
	assert_eq!(h.external.event_names(), vec!["pogs_milestone".to_string()]);
}

#[tokio::test]
async fn concurrent_increments_are_not_lost() {
	let h = Arc::new(harness());
	let mut tasks = JoinSet::new();
	for _ in 0..25 {
		let h = Arc::clone(&h);
		tasks.spawn(async move { h.commands.process(&h.scope(), &moderator("!death+")).await });
	}
	while let Some(res) = tasks.join_next().await {
		assert!(matches!(res.expect("task"), CommandOutcome::Executed { .. }));
	}
	assert_eq!(deaths(&h).await, 25);
}

struct BrokenCounters;

#[async_trait::async_trait]
impl CounterStore for BrokenCounters {
	async fn get_counters(&self, _broadcaster_id: &str) -> anyhow::Result<Counter> {
		Err(anyhow!("database unavailable"))
	}

	async fn save_counters(&self, _counter: &Counter) -> anyhow::Result<()> {
		Err(anyhow!("database unavailable"))
	}
}

#[tokio::test]
async fn storage_failure_sends_nothing() {
	let h = harness();
	let store = MemoryStore::new();
	let replies = RecordingReplies::default();
	let scope = CommandScope {
		counters: &BrokenCounters,
		configs: &store,
		users: &store,
		replies: &replies,
	};

	assert_eq!(
		h.commands.process(&scope, &moderator("!death+")).await,
		CommandOutcome::Failed
	);
	assert!(replies.sent().is_empty());

	assert!(matches!(
		h.commands.process(&h.scope(), &moderator("!death+")).await,
		CommandOutcome::Executed { .. }
	));
}

#[tokio::test(start_paused = true)]
async fn failed_command_does_not_start_cooldown() {
	let h = harness();
	let store = MemoryStore::new();
	let replies = RecordingReplies::default();
	let broken = CommandScope {
		counters: &BrokenCounters,
		configs: &store,
		users: &store,
		replies: &replies,
	};

	assert_eq!(h.commands.process(&broken, &viewer("!deaths")).await, CommandOutcome::Failed);
	assert!(matches!(
		h.commands.process(&h.scope(), &viewer("!deaths")).await,
		CommandOutcome::Executed { count: Some(0), .. }
	));
	assert_eq!(
		h.commands.process(&h.scope(), &viewer("!deaths")).await,
		CommandOutcome::CoolingDown
	);
}

/// Yields before every storage call so overlapping commands interleave.
struct YieldingCounters(Arc<MemoryStore>);

#[async_trait::async_trait]
impl CounterStore for YieldingCounters {
	async fn get_counters(&self, broadcaster_id: &str) -> anyhow::Result<Counter> {
		tokio::task::yield_now().await;
		self.0.get_counters(broadcaster_id).await
	}

	async fn save_counters(&self, counter: &Counter) -> anyhow::Result<()> {
		tokio::task::yield_now().await;
		self.0.save_counters(counter).await
	}
}

#[tokio::test]
async fn overlapping_invocations_share_one_cooldown() {
	let h = harness();
	h.store.set_command_config_json(
		"100",
		r#"{"commands":{"!pog":{"action":"increment","counter":"pogs","cooldown":30,"response":"Pogs: {count}"}}}"#,
	);
	let counters = YieldingCounters(h.store.clone());
	let scope = CommandScope {
		counters: &counters,
		configs: &*h.store,
		users: &*h.store,
		replies: &*h.replies,
	};

	let msg_a = viewer("!pog");
	let msg_b = viewer("!pog");
	let (a, b) = tokio::join!(h.commands.process(&scope, &msg_a), h.commands.process(&scope, &msg_b),);
	let outcomes = [a, b];
	let executed = outcomes
		.iter()
		.filter(|o| matches!(o, CommandOutcome::Executed { .. }))
		.count();
	let cooling = outcomes.iter().filter(|o| **o == CommandOutcome::CoolingDown).count();
	assert_eq!((executed, cooling), (1, 1));

	let row = h.store.get_counters("100").await.expect("counters");
	assert_eq!(row.get("pogs"), 1);
	assert_eq!(h.replies.texts(), vec!["Pogs: 1".to_string()]);
}

#[test]
fn counter_ops_clamp() {
	assert_eq!(CounterOp::Add(3).apply(2), 5);
	assert_eq!(CounterOp::Subtract(3).apply(2), 0);
	assert_eq!(CounterOp::Reset.apply(9), 0);
	assert_eq!(CounterOp::Add(1).apply(i64::MAX), i64::MAX);
}

#[test]
fn reply_placeholders_expand() {
	let vars = ReplyVars {
		count: Some(7),
		counter: Some("deaths"),
		user: Some("Viewer"),
		amount: 2,
	};
	assert_eq!(
		render_reply("{user} added {amount} to {counter}: {count}", &vars, true).as_deref(),
		Some("Viewer added 2 to Deaths: 7")
	);
	assert_eq!(render_reply("  ", &vars, true).as_deref(), Some("Deaths: 7"));
	assert_eq!(render_reply("", &vars, false), None);
}
