#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Realtime overlay events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayEvent {
	CounterUpdated {
		counter: String,
		value: i64,
	},

	MilestoneReached {
		counter: String,
		threshold: i64,
		new_value: i64,
		/// Distance to the next configured threshold, if any.
		#[serde(default)]
		remaining_to_next: Option<i64>,
	},

	StreamStarted {
		#[serde(default)]
		stream_id: Option<String>,
	},

	StreamEnded {},
}
