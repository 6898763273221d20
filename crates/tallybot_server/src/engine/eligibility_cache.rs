#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tallybot_domain::BotEligibilityResult;
use tracing::{debug, warn};

use super::cache_backend::CacheBackend;

const KEY_PREFIX: &str = "botEligibility";
const KEY_VERSION: &str = "v1";

fn key_part(s: &str) -> String {
	s.trim().to_lowercase()
}

/// `botEligibility:v1:<namespace>:<broadcaster>:<bot>` with every part trimmed and lower-cased.
pub fn cache_key(namespace: &str, broadcaster_id: &str, bot_username: &str) -> String {
	format!(
		"{KEY_PREFIX}:{KEY_VERSION}:{}:{}:{}",
		key_part(namespace),
		key_part(broadcaster_id),
		key_part(bot_username)
	)
}

/// Shared TTL cache for eligibility results. Fails open: backend trouble reads as a miss.
#[derive(Clone)]
pub struct EligibilityCache {
	backend: Option<Arc<dyn CacheBackend>>,
	namespace: String,
}

impl std::fmt::Debug for EligibilityCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EligibilityCache")
			.field("enabled", &self.backend.is_some())
			.field("namespace", &self.namespace)
			.finish()
	}
}

impl EligibilityCache {
	pub fn new(backend: Option<Arc<dyn CacheBackend>>, namespace: impl Into<String>) -> Self {
		Self {
			backend,
			namespace: namespace.into(),
		}
	}

	pub fn disabled() -> Self {
		Self::new(None, "")
	}

	pub async fn try_get(&self, broadcaster_id: &str, bot_username: &str) -> Option<BotEligibilityResult> {
		let backend = self.backend.as_ref()?;
		let key = cache_key(&self.namespace, broadcaster_id, bot_username);

		let raw = match backend.get(&key).await {
			Ok(Some(raw)) => raw,
			Ok(None) => {
				metrics::counter!("tallybot_eligibility_cache_misses_total").increment(1);
				return None;
			}
			Err(e) => {
				warn!(error = ?e, key = %key, "eligibility cache read failed; treating as miss");
				metrics::counter!("tallybot_eligibility_cache_errors_total").increment(1);
				return None;
			}
		};

		let parsed = decode(&raw);
		if parsed.is_some() {
			metrics::counter!("tallybot_eligibility_cache_hits_total").increment(1);
		} else {
			debug!(key = %key, "eligibility cache entry unusable; treating as miss");
			metrics::counter!("tallybot_eligibility_cache_misses_total").increment(1);
		}
		parsed
	}

	pub async fn set(&self, broadcaster_id: &str, bot_username: &str, result: &BotEligibilityResult, ttl: Duration) {
		let Some(backend) = self.backend.as_ref() else {
			return;
		};
		let key = cache_key(&self.namespace, broadcaster_id, bot_username);

		let raw = match serde_json::to_string(result) {
			Ok(raw) => raw,
			Err(e) => {
				warn!(error = ?e, key = %key, "failed to encode eligibility result");
				return;
			}
		};

		if let Err(e) = backend.set(&key, &raw, ttl).await {
			warn!(error = ?e, key = %key, "eligibility cache write failed");
			metrics::counter!("tallybot_eligibility_cache_errors_total").increment(1);
		}
	}
}

fn decode(raw: &str) -> Option<BotEligibilityResult> {
	let raw = raw.trim();
	if raw.is_empty() {
		return None;
	}
	serde_json::from_str::<Option<BotEligibilityResult>>(raw).ok().flatten()
}
