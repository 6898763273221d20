#![forbid(unsafe_code)]

use tallybot_domain::{OverlayEvent, broadcaster_key};
use tracing::{debug, warn};

use crate::engine::sinks::OverlayPublisher;

/// Records overlay events in the log and metrics. Realtime delivery to browser overlays is an
/// external concern; this is the publisher the binary wires in.
#[derive(Debug, Clone, Default)]
pub struct LoggingOverlayPublisher;

impl LoggingOverlayPublisher {
	pub fn new() -> Self {
		Self
	}
}

/// Wire tag of an event, matching its serialized `type`.
pub fn event_kind(event: &OverlayEvent) -> &'static str {
	match event {
		OverlayEvent::CounterUpdated { .. } => "counter_updated",
		OverlayEvent::MilestoneReached { .. } => "milestone_reached",
		OverlayEvent::StreamStarted { .. } => "stream_started",
		OverlayEvent::StreamEnded {} => "stream_ended",
	}
}

#[async_trait::async_trait]
impl OverlayPublisher for LoggingOverlayPublisher {
	async fn publish(&self, broadcaster_id: &str, event: OverlayEvent) {
		let Some(key) = broadcaster_key(broadcaster_id) else {
			warn!(kind = event_kind(&event), "overlay event without broadcaster");
			return;
		};
		let kind = event_kind(&event);
		match serde_json::to_string(&event) {
			Ok(payload) => debug!(broadcaster_id = %key, kind, payload = %payload, "overlay event"),
			Err(e) => warn!(broadcaster_id = %key, kind, error = ?e, "failed to encode overlay event"),
		}
		metrics::counter!("tallybot_overlay_events_total", "kind" => kind).increment(1);
	}
}
