#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tallybot_domain::{BotEligibilityResult, MonitoringState};
use tallybot_platform::{ModeratorApi, ModeratorList, STATUS_FORBIDDEN, STATUS_UNAUTHORIZED};
use tracing::{debug, warn};

use super::eligibility_cache::EligibilityCache;
use super::monitoring::MonitoringRegistry;

/// TTL for results derived from a moderator-list response.
pub const ELIGIBILITY_TTL: Duration = Duration::from_secs(3 * 60 * 60);
/// TTL after the moderator lookup itself failed.
pub const ELIGIBILITY_ERROR_TTL: Duration = Duration::from_secs(30);

/// Decides whether the shared bot account may post in a broadcaster's channel.
pub struct EligibilityResolver {
	moderators: Arc<dyn ModeratorApi>,
	cache: EligibilityCache,
	registry: Arc<MonitoringRegistry>,
	bot_username: Option<String>,
}

impl EligibilityResolver {
	pub fn new(
		moderators: Arc<dyn ModeratorApi>,
		cache: EligibilityCache,
		registry: Arc<MonitoringRegistry>,
		bot_username: Option<String>,
	) -> Self {
		Self {
			moderators,
			cache,
			registry,
			bot_username: bot_username.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
		}
	}

	/// Never fails; every problem is expressed as an ineligible result.
	pub async fn eligibility(&self, broadcaster_id: &str, access_token: &str) -> BotEligibilityResult {
		let broadcaster_id = broadcaster_id.trim();
		if broadcaster_id.is_empty() {
			return BotEligibilityResult::ineligible("Missing broadcaster user id");
		}
		if access_token.trim().is_empty() {
			return BotEligibilityResult::ineligible("Missing broadcaster access token");
		}
		let Some(bot) = self.bot_username.as_deref() else {
			return BotEligibilityResult::ineligible("BotUsername is not configured");
		};

		if let Some(cached) = self.cache.try_get(broadcaster_id, bot).await {
			debug!(broadcaster_id = %broadcaster_id, use_bot = cached.use_bot, "eligibility cache hit");
			self.registry.set_state(broadcaster_id, MonitoringState::from(&cached));
			return cached;
		}

		let (result, ttl) = match self.moderators.get_moderators(broadcaster_id, access_token).await {
			Ok(list) => (classify(&list, bot), ELIGIBILITY_TTL),
			Err(e) => {
				warn!(broadcaster_id = %broadcaster_id, error = ?e, "moderator lookup failed");
				metrics::counter!("tallybot_eligibility_lookup_errors_total").increment(1);
				(BotEligibilityResult::ineligible("Error checking moderators"), ELIGIBILITY_ERROR_TTL)
			}
		};

		debug!(
			broadcaster_id = %broadcaster_id,
			use_bot = result.use_bot,
			reason = %result.reason,
			"eligibility resolved"
		);
		self.cache.set(broadcaster_id, bot, &result, ttl).await;
		self.registry.set_state(broadcaster_id, MonitoringState::from(&result));
		result
	}
}

/// Map a moderator-list response to an eligibility decision for `bot_login`.
pub fn classify(list: &ModeratorList, bot_login: &str) -> BotEligibilityResult {
	if list.is_success() {
		let bot_login = bot_login.trim();
		return match list
			.moderators
			.iter()
			.find(|m| m.user_login.trim().eq_ignore_ascii_case(bot_login))
		{
			Some(m) => BotEligibilityResult::eligible(m.user_id.clone(), "Bot is a moderator"),
			None => BotEligibilityResult::ineligible("Bot is not a moderator in this channel"),
		};
	}

	match list.status {
		STATUS_FORBIDDEN => BotEligibilityResult::ineligible(
			"Forbidden checking moderators: broadcaster token is missing the moderation:read scope",
		),
		STATUS_UNAUTHORIZED => {
			BotEligibilityResult::ineligible("Unauthorized checking moderators: broadcaster token was rejected")
		}
		other => BotEligibilityResult::ineligible(format!("Failed to check moderators (status {other})")),
	}
}
