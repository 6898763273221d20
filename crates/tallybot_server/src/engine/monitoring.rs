#![forbid(unsafe_code)]

use std::collections::HashSet;

use dashmap::DashMap;
use tallybot_domain::{MonitoringState, broadcaster_key};

/// Process-wide record of which identity replies in each broadcaster's channel.
///
/// Keys are trimmed and lower-cased; blank ids are ignored by every operation.
#[derive(Debug, Default)]
pub struct MonitoringRegistry {
	states: DashMap<String, MonitoringState>,
}

impl MonitoringRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_state(&self, broadcaster_id: &str, state: MonitoringState) {
		let Some(key) = broadcaster_key(broadcaster_id) else {
			return;
		};
		self.states.insert(key, state);
		metrics::gauge!("tallybot_monitoring_broadcasters").set(self.states.len() as f64);
	}

	pub fn try_get_state(&self, broadcaster_id: &str) -> Option<MonitoringState> {
		let key = broadcaster_key(broadcaster_id)?;
		self.states.get(&key).map(|s| s.clone())
	}

	pub fn remove(&self, broadcaster_id: &str) {
		let Some(key) = broadcaster_key(broadcaster_id) else {
			return;
		};
		self.states.remove(&key);
		metrics::gauge!("tallybot_monitoring_broadcasters").set(self.states.len() as f64);
	}

	/// Keys of broadcasters currently served by the bot identity.
	pub fn broadcasters_using_bot(&self) -> HashSet<String> {
		self.states
			.iter()
			.filter(|e| e.value().use_bot)
			.map(|e| e.key().clone())
			.collect()
	}
}
