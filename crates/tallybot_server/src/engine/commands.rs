#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tallybot_domain::{
	ChatCommandConfiguration, ChatCommandContext, CommandAction, DEFAULT_MAX_INCREMENT_AMOUNT, OverlayEvent, Permission,
	broadcaster_key, canonical_counter_name, counter_label,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::milestones::MilestoneNotifier;
use super::rules::{CooldownClaim, CooldownTracker, decrement_magnitude, effective_permission, increment_magnitude, is_permitted};
use super::sinks::{OverlayPublisher, ReplySender};
use crate::stores::{ConfigStore, CounterStore, UserStore};

/// Collaborators for one unit of command work, built by the caller.
#[derive(Clone, Copy)]
pub struct CommandScope<'a> {
	pub counters: &'a dyn CounterStore,
	pub configs: &'a dyn ConfigStore,
	pub users: &'a dyn UserStore,
	pub replies: &'a dyn ReplySender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
	NoMatch,
	Denied,
	CoolingDown,
	/// Counter storage failed; nothing was sent and no cooldown was recorded.
	Failed,
	Executed {
		command: String,
		action: CommandAction,
		count: Option<i64>,
		reply: Option<String>,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
	Add(i64),
	Subtract(i64),
	Reset,
}

impl CounterOp {
	pub fn apply(self, old: i64) -> i64 {
		match self {
			CounterOp::Add(n) => old.saturating_add(n),
			CounterOp::Subtract(n) => old.saturating_sub(n).max(0),
			CounterOp::Reset => 0,
		}
	}
}

/// Placeholder values for reply templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyVars<'a> {
	pub count: Option<i64>,
	pub counter: Option<&'a str>,
	pub user: Option<&'a str>,
	pub amount: i64,
}

/// Expand `{count}`, `{counter}`, `{user}` and `{amount}`.
///
/// An empty template yields `"<Counter>: <count>"` after a mutation and nothing otherwise.
pub fn render_reply(template: &str, vars: &ReplyVars<'_>, mutated: bool) -> Option<String> {
	let label = vars.counter.map(counter_label).unwrap_or_default();
	let count = vars.count.unwrap_or(0);

	let template = template.trim();
	if template.is_empty() {
		return (mutated && vars.counter.is_some()).then(|| format!("{label}: {count}"));
	}

	Some(
		template
			.replace("{count}", &count.to_string())
			.replace("{counter}", &label)
			.replace("{user}", vars.user.unwrap_or_default())
			.replace("{amount}", &vars.amount.to_string()),
	)
}

#[derive(Debug, Clone)]
pub struct CommandProcessorConfig {
	/// Global ceiling for explicit amounts; per-broadcaster settings can only lower it.
	pub max_increment_amount: u32,
}

impl Default for CommandProcessorConfig {
	fn default() -> Self {
		Self {
			max_increment_amount: DEFAULT_MAX_INCREMENT_AMOUNT,
		}
	}
}

/// Matches chat messages against a broadcaster's command table and applies the result.
pub struct CommandProcessor {
	cfg: CommandProcessorConfig,
	cooldowns: CooldownTracker,
	counter_locks: DashMap<String, Arc<Mutex<()>>>,
	milestones: Arc<MilestoneNotifier>,
	overlay: Arc<dyn OverlayPublisher>,
}

impl CommandProcessor {
	pub fn new(cfg: CommandProcessorConfig, milestones: Arc<MilestoneNotifier>, overlay: Arc<dyn OverlayPublisher>) -> Self {
		Self {
			cfg,
			cooldowns: CooldownTracker::new(),
			counter_locks: DashMap::new(),
			milestones,
			overlay,
		}
	}

	pub async fn process(&self, scope: &CommandScope<'_>, ctx: &ChatCommandContext) -> CommandOutcome {
		let broadcaster_id = ctx.user_id.trim();
		let trigger = ctx.trigger();
		if broadcaster_id.is_empty() || trigger.is_empty() {
			return CommandOutcome::NoMatch;
		}

		let config = match scope.configs.get_chat_commands_config(broadcaster_id).await {
			Ok(cfg) => cfg,
			Err(e) => {
				warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to load command config; using defaults");
				ChatCommandConfiguration::defaults()
			}
		};

		let Some((command, def)) = config.find(trigger) else {
			return CommandOutcome::NoMatch;
		};
		let command = command.to_string();
		let def = def.clone();

		if !is_permitted(ctx, def.permission) {
			debug!(
				broadcaster_id = %broadcaster_id,
				command = %command,
				required = %def.permission,
				"command denied"
			);
			metrics::counter!("tallybot_commands_denied_total").increment(1);
			return CommandOutcome::Denied;
		}

		let now = Instant::now();
		let cooldown = Duration::from_secs(def.cooldown);
		let previous = match self.cooldowns.try_acquire(broadcaster_id, &command, cooldown, now) {
			CooldownClaim::Granted { previous } => previous,
			CooldownClaim::CoolingDown => {
				debug!(broadcaster_id = %broadcaster_id, command = %command, "command on cooldown");
				metrics::counter!("tallybot_commands_cooldown_total").increment(1);
				return CommandOutcome::CoolingDown;
			}
		};

		let counter = def
			.counter
			.as_deref()
			.map(canonical_counter_name)
			.filter(|s| !s.is_empty());
		let action = if counter.is_none() { CommandAction::Text } else { def.action };

		let max_amount = i64::from(config.max_increment_amount.min(self.cfg.max_increment_amount).max(1));
		let (op, amount) = match action {
			CommandAction::Increment => {
				let n = explicit_amount(ctx, max_amount).unwrap_or_else(|| increment_magnitude(&def));
				(Some(CounterOp::Add(n)), n)
			}
			CommandAction::Decrement => {
				let n = explicit_amount(ctx, max_amount).unwrap_or_else(|| decrement_magnitude(&def));
				(Some(CounterOp::Subtract(n)), n)
			}
			CommandAction::Reset => (Some(CounterOp::Reset), 0),
			CommandAction::Text => (None, 0),
		};

		let count = match (counter.as_deref(), op) {
			(Some(name), Some(op)) => match self.mutate_counter(scope.counters, broadcaster_id, name, op).await {
				Ok((old, new)) => {
					self.notify_milestones(scope, broadcaster_id, name, &def.milestones, old, new)
						.await;
					Some(new)
				}
				Err(e) => {
					warn!(broadcaster_id = %broadcaster_id, command = %command, error = ?e, "counter update failed");
					self.cooldowns.release(broadcaster_id, &command, now, previous);
					return CommandOutcome::Failed;
				}
			},
			(Some(name), None) => match scope.counters.get_counters(broadcaster_id).await {
				Ok(row) => Some(row.get(name)),
				Err(e) => {
					warn!(broadcaster_id = %broadcaster_id, command = %command, error = ?e, "counter read failed");
					self.cooldowns.release(broadcaster_id, &command, now, previous);
					return CommandOutcome::Failed;
				}
			},
			(None, _) => None,
		};

		let vars = ReplyVars {
			count,
			counter: counter.as_deref(),
			user: ctx.chatter_display_name.as_deref(),
			amount,
		};
		let reply = render_reply(&def.response, &vars, op.is_some());
		if let Some(text) = reply.as_deref()
			&& let Err(e) = scope
				.replies
				.send_reply(broadcaster_id, text, ctx.message_id.as_deref())
				.await
		{
			warn!(broadcaster_id = %broadcaster_id, command = %command, error = ?e, "command reply failed");
		}

		metrics::counter!("tallybot_commands_executed_total", "action" => action.as_str()).increment(1);

		CommandOutcome::Executed {
			command,
			action,
			count,
			reply,
		}
	}

	/// Serialized read-modify-write of one counter; publishes `CounterUpdated`.
	pub async fn mutate_counter(
		&self,
		counters: &dyn CounterStore,
		broadcaster_id: &str,
		counter: &str,
		op: CounterOp,
	) -> anyhow::Result<(i64, i64)> {
		let key = broadcaster_key(broadcaster_id).context("blank broadcaster id")?;
		let counter = canonical_counter_name(counter);

		let lock = Arc::clone(&self.counter_locks.entry(key).or_default());
		let guard = lock.lock().await;

		let mut row = counters.get_counters(broadcaster_id).await.context("load counters")?;
		if row.user_id.trim().is_empty() {
			row.user_id = broadcaster_id.trim().to_string();
		}
		let old = row.get(&counter);
		let new = op.apply(old);
		row.set(&counter, new);
		counters.save_counters(&row).await.context("save counters")?;
		drop(guard);

		self.overlay
			.publish(broadcaster_id, OverlayEvent::CounterUpdated { counter, value: new })
			.await;
		Ok((old, new))
	}

	/// Thresholds are the user's settings for `counter` plus `extra`.
	pub async fn notify_milestones(
		&self,
		scope: &CommandScope<'_>,
		broadcaster_id: &str,
		counter: &str,
		extra: &[i64],
		old: i64,
		new: i64,
	) -> Vec<i64> {
		if new <= old {
			return Vec::new();
		}

		let user = match scope.users.get_user(broadcaster_id).await {
			Ok(Some(user)) => user,
			Ok(None) => return Vec::new(),
			Err(e) => {
				warn!(broadcaster_id = %broadcaster_id, error = ?e, "failed to load user for milestones");
				return Vec::new();
			}
		};

		let mut thresholds = user
			.notification_settings
			.as_ref()
			.map(|s| s.thresholds_for(counter))
			.unwrap_or_default();
		thresholds.extend_from_slice(extra);

		self.milestones
			.check_and_notify_with(&user, counter, &thresholds, old, new, scope.replies)
			.await
	}
}

/// `!death+ 3` style amount, honoured for moderators and above and clamped to `1..=max`.
fn explicit_amount(ctx: &ChatCommandContext, max: i64) -> Option<i64> {
	if effective_permission(ctx) < Permission::Moderator {
		return None;
	}
	let n = ctx.argument()?.parse::<i64>().ok()?;
	Some(n.clamp(1, max))
}
