use teloxide::{
    types::{ChatId, UserId},
    RequestError,
};
use thiserror::Error;

/// Everything that can go wrong in this bot.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Telegram API error: {0}")]
    Telegram(#[from] RequestError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored counters break `today <= month <= total`. Never papered over.
    #[error(
        "Violation record of user {user} in chat {chat} is corrupted: \
        today={today}, month={month}, total={total}"
    )]
    CorruptedRecord {
        chat: ChatId,
        user: UserId,
        today: u32,
        month: u32,
        total: u32,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let error = Error::Unsupported("forgiving violations");
        assert_eq!(error.to_string(), "Unsupported operation: forgiving violations");

        let error = Error::CorruptedRecord {
            chat: ChatId(-100),
            user: UserId(42),
            today: 3,
            month: 2,
            total: 5,
        };
        assert_eq!(
            error.to_string(),
            "Violation record of user 42 in chat -100 is corrupted: today=3, month=2, total=5"
        );
    }
}
