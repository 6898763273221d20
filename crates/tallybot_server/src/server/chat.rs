#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use tallybot_platform::ChatSender;
use tallybot_platform::twitch::HelixClient;

use crate::stores::{BotCredentialStore, UserStore};

/// Sends chat through Helix, picking the bot's or the broadcaster's token from the stores.
pub struct HelixChatSender {
	helix: HelixClient,
	users: Arc<dyn UserStore>,
	bot_credentials: Arc<dyn BotCredentialStore>,
}

impl HelixChatSender {
	pub fn new(helix: HelixClient, users: Arc<dyn UserStore>, bot_credentials: Arc<dyn BotCredentialStore>) -> Self {
		Self {
			helix,
			users,
			bot_credentials,
		}
	}
}

#[async_trait::async_trait]
impl ChatSender for HelixChatSender {
	async fn send_message(
		&self,
		broadcaster_id: &str,
		text: &str,
		reply_to_message_id: Option<&str>,
		as_bot_user_id: Option<&str>,
	) -> anyhow::Result<()> {
		let (token, sender_id) = match as_bot_user_id {
			Some(bot_id) => {
				let creds = self
					.bot_credentials
					.get_bot_credentials()
					.await
					.context("load bot credentials")?
					.context("bot credentials missing")?;
				(creds.access_token, bot_id.to_string())
			}
			None => {
				let user = self
					.users
					.get_user(broadcaster_id)
					.await
					.context("load broadcaster")?
					.with_context(|| format!("unknown broadcaster {broadcaster_id}"))?;
				(user.access_token, user.user_id)
			}
		};

		self.helix
			.send_chat_message(&token, broadcaster_id, &sender_id, text, reply_to_message_id)
			.await
	}
}
