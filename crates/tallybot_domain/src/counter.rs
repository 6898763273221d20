#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Live counters for one broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
	pub user_id: String,

	#[serde(default)]
	pub deaths: i64,
	#[serde(default)]
	pub swears: i64,
	#[serde(default)]
	pub screams: i64,
	#[serde(default)]
	pub bits: i64,

	#[serde(default)]
	pub custom_counters: BTreeMap<String, i64>,

	#[serde(default)]
	pub stream_started: Option<SystemTime>,

	/// Stream id the "stream started" notification was last sent for.
	#[serde(default)]
	pub last_notified_stream_id: Option<String>,
}

impl Counter {
	pub fn new(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			..Self::default()
		}
	}

	/// Read a counter by name; unknown custom counters read as zero.
	pub fn get(&self, name: &str) -> i64 {
		match canonical_counter_name(name).as_str() {
			"deaths" => self.deaths,
			"swears" => self.swears,
			"screams" => self.screams,
			"bits" => self.bits,
			other => self.custom_counters.get(other).copied().unwrap_or(0),
		}
	}

	/// Write a counter by name, clamping at zero.
	pub fn set(&mut self, name: &str, value: i64) {
		let value = value.max(0);
		match canonical_counter_name(name).as_str() {
			"deaths" => self.deaths = value,
			"swears" => self.swears = value,
			"screams" => self.screams = value,
			"bits" => self.bits = value,
			"" => {}
			other => {
				self.custom_counters.insert(other.to_string(), value);
			}
		}
	}

	/// Parse stored custom counters, falling back to an empty map on malformed JSON.
	pub fn custom_counters_from_json_or_default(raw: Option<&str>) -> BTreeMap<String, i64> {
		let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
			return BTreeMap::new();
		};

		match serde_json::from_str::<BTreeMap<String, i64>>(raw) {
			Ok(map) => map
				.into_iter()
				.map(|(k, v)| (canonical_counter_name(&k), v))
				.filter(|(k, _)| !k.is_empty())
				.collect(),
			Err(_) => BTreeMap::new(),
		}
	}
}

/// Canonical counter key (`deaths`, `swears`, `screams`, `bits`, or a lower-cased custom name).
pub fn canonical_counter_name(name: &str) -> String {
	let name = name.trim().to_lowercase();
	match name.as_str() {
		"death" | "deaths" => "deaths".to_string(),
		"swear" | "swears" => "swears".to_string(),
		"scream" | "screams" => "screams".to_string(),
		"bit" | "bits" => "bits".to_string(),
		_ => name,
	}
}

/// Human label for replies (`Deaths`, `Pogs`, ...).
pub fn counter_label(name: &str) -> String {
	let canonical = canonical_counter_name(name);
	let mut chars = canonical.chars();
	match chars.next() {
		Some(first) => first.to_uppercase().chain(chars).collect(),
		None => String::new(),
	}
}

/// External event name for a milestone on `name` (`death_milestone`, ...).
pub fn milestone_event_name(name: &str) -> String {
	match canonical_counter_name(name).as_str() {
		"deaths" => "death_milestone".to_string(),
		"swears" => "swear_milestone".to_string(),
		"screams" => "scream_milestone".to_string(),
		"bits" => "bits_milestone".to_string(),
		other => format!("{other}_milestone"),
	}
}
