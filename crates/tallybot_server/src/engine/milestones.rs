#![forbid(unsafe_code)]

use std::sync::Arc;

use tallybot_domain::{OverlayEvent, User, canonical_counter_name, counter_label, milestone_event_name};
use tracing::{debug, warn};

use super::sinks::{ExternalNotifier, OverlayPublisher, ReplySender};

/// Distinct thresholds with `old < t <= new`, ascending.
pub fn crossed_thresholds(thresholds: &[i64], old: i64, new: i64) -> Vec<i64> {
	let mut out: Vec<i64> = thresholds.iter().copied().filter(|t| old < *t && *t <= new).collect();
	out.sort_unstable();
	out.dedup();
	out
}

/// Distance from `value` to the smallest threshold above it.
pub fn remaining_to_next(thresholds: &[i64], value: i64) -> Option<i64> {
	thresholds
		.iter()
		.copied()
		.filter(|t| *t > value)
		.min()
		.map(|t| t - value)
}

pub fn milestone_chat_text(counter: &str, threshold: i64, remaining: Option<i64>) -> String {
	let label = counter_label(counter);
	match remaining {
		Some(n) => format!("🎉 MILESTONE: {label} reached {threshold}! {n} more to the next one."),
		None => format!("🎉 MILESTONE: {label} reached {threshold}!"),
	}
}

/// Fans threshold crossings out to webhooks, chat and the overlay.
pub struct MilestoneNotifier {
	external: Arc<dyn ExternalNotifier>,
	overlay: Arc<dyn OverlayPublisher>,
}

impl MilestoneNotifier {
	pub fn new(external: Arc<dyn ExternalNotifier>, overlay: Arc<dyn OverlayPublisher>) -> Self {
		Self { external, overlay }
	}

	/// Uses the thresholds from the user's notification settings.
	pub async fn check_and_notify(
		&self,
		user: &User,
		counter: &str,
		old: i64,
		new: i64,
		replies: &dyn ReplySender,
	) -> Vec<i64> {
		let thresholds = user
			.notification_settings
			.as_ref()
			.map(|s| s.thresholds_for(counter))
			.unwrap_or_default();
		self.check_and_notify_with(user, counter, &thresholds, old, new, replies)
			.await
	}

	/// Returns the thresholds that fired.
	pub async fn check_and_notify_with(
		&self,
		user: &User,
		counter: &str,
		thresholds: &[i64],
		old: i64,
		new: i64,
		replies: &dyn ReplySender,
	) -> Vec<i64> {
		let Some(settings) = user.notification_settings.as_ref().filter(|s| s.any_enabled()) else {
			return Vec::new();
		};

		let crossed = crossed_thresholds(thresholds, old, new);
		if crossed.is_empty() {
			return crossed;
		}

		let counter = canonical_counter_name(counter);
		let event_name = milestone_event_name(&counter);
		let remaining = remaining_to_next(thresholds, new);

		for &threshold in &crossed {
			debug!(
				broadcaster_id = %user.user_id,
				counter = %counter,
				threshold,
				new_value = new,
				"milestone reached"
			);
			metrics::counter!("tallybot_milestones_reached_total").increment(1);

			if settings.enable_channel_notifications {
				let data = serde_json::json!({
					"counter": counter,
					"threshold": threshold,
					"value": new,
					"remainingToNext": remaining,
				});
				if let Err(e) = self.external.notify(user, &event_name, data).await {
					warn!(broadcaster_id = %user.user_id, event = %event_name, error = ?e, "milestone notification failed");
				}
			}

			if settings.enable_chat_notifications {
				let text = milestone_chat_text(&counter, threshold, remaining);
				if let Err(e) = replies.send_reply(&user.user_id, &text, None).await {
					warn!(broadcaster_id = %user.user_id, error = ?e, "milestone chat message failed");
				}
			}

			self.overlay
				.publish(
					&user.user_id,
					OverlayEvent::MilestoneReached {
						counter: counter.clone(),
						threshold,
						new_value: new,
						remaining_to_next: remaining,
					},
				)
				.await;
		}

		crossed
	}
}
