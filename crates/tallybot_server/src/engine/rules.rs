#![forbid(unsafe_code)]

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tallybot_domain::{ChatCommandContext, ChatCommandDefinition, Permission, broadcaster_key, normalize_trigger};
use tokio::time::Instant;

/// Highest tier the chatter holds.
pub fn effective_permission(ctx: &ChatCommandContext) -> Permission {
	if ctx.is_broadcaster {
		Permission::Broadcaster
	} else if ctx.is_moderator {
		Permission::Moderator
	} else if ctx.is_subscriber {
		Permission::Subscriber
	} else {
		Permission::Everyone
	}
}

pub fn is_permitted(ctx: &ChatCommandContext, required: Permission) -> bool {
	effective_permission(ctx) >= required
}

fn first_non_zero(candidates: &[i64]) -> i64 {
	candidates
		.iter()
		.copied()
		.find(|v| *v != 0)
		.map(i64::abs)
		.unwrap_or(1)
}

/// Step for an increment without an explicit amount.
pub fn increment_magnitude(def: &ChatCommandDefinition) -> i64 {
	first_non_zero(&[def.increment_by])
}

/// Step for a decrement without an explicit amount; falls back to `increment_by`, then 1.
pub fn decrement_magnitude(def: &ChatCommandDefinition) -> i64 {
	first_non_zero(&[def.decrement_by, def.increment_by])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownClaim {
	Granted { previous: Option<Instant> },
	CoolingDown,
}

/// Last successful invocation per `(broadcaster, command)`.
#[derive(Debug, Default)]
pub struct CooldownTracker {
	last: DashMap<(String, String), Instant>,
}

impl CooldownTracker {
	pub fn new() -> Self {
		Self::default()
	}

	fn key(broadcaster_id: &str, command: &str) -> Option<(String, String)> {
		Some((broadcaster_key(broadcaster_id)?, normalize_trigger(command)))
	}

	/// Claim the command for `now` unless it ran less than `cooldown` ago. A zero cooldown or
	/// blank broadcaster always grants without recording anything.
	pub fn try_acquire(&self, broadcaster_id: &str, command: &str, cooldown: Duration, now: Instant) -> CooldownClaim {
		if cooldown.is_zero() {
			return CooldownClaim::Granted { previous: None };
		}
		let Some(key) = Self::key(broadcaster_id, command) else {
			return CooldownClaim::Granted { previous: None };
		};
		match self.last.entry(key) {
			Entry::Occupied(mut e) => {
				if now.saturating_duration_since(*e.get()) < cooldown {
					return CooldownClaim::CoolingDown;
				}
				let previous = e.insert(now);
				CooldownClaim::Granted {
					previous: Some(previous),
				}
			}
			Entry::Vacant(e) => {
				e.insert(now);
				CooldownClaim::Granted { previous: None }
			}
		}
	}

	/// Undo a claim made at `claimed`. Left alone if a later claim replaced it.
	pub fn release(&self, broadcaster_id: &str, command: &str, claimed: Instant, previous: Option<Instant>) {
		let Some(key) = Self::key(broadcaster_id, command) else {
			return;
		};
		if let Entry::Occupied(mut e) = self.last.entry(key)
			&& *e.get() == claimed
		{
			match previous {
				Some(previous) => {
					e.insert(previous);
				}
				None => {
					e.remove();
				}
			}
		}
	}
}
