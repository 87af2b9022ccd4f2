use teloxide::{prelude::*, types::ChatId, ApiError, RequestError};

use crate::store::{DeliveryError, DeliveryTransport};

/// Sends announcements through the Telegram bot API.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl DeliveryTransport for TelegramTransport {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError> {
        self.bot
            .send_message(chat_id, text)
            .await
            .map(|_| ())
            .map_err(classify_request_error)
    }
}

/// Sort a Telegram failure into what the broadcast should do about it.
pub fn classify_request_error(error: RequestError) -> DeliveryError {
    match error {
        RequestError::RetryAfter(secs) => DeliveryError::RateLimited(secs.duration()),
        RequestError::MigrateToChatId(new_id) => DeliveryError::Migrated(new_id),
        RequestError::Network(e) => DeliveryError::Transient(e.to_string()),
        RequestError::Io(e) => DeliveryError::Transient(e.to_string()),
        RequestError::Api(
            e @ (ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation
            | ApiError::ChatNotFound),
        ) => DeliveryError::PermanentlyBlocked(e.to_string()),
        // Plenty of "Forbidden" errors have no dedicated variant,
        // like being kicked from a channel.
        RequestError::Api(ApiError::Unknown(e)) if e.starts_with("Forbidden") => {
            DeliveryError::PermanentlyBlocked(e)
        }
        other => DeliveryError::Other(other.to_string()),
    }
}
