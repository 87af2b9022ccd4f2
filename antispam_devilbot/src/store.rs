//! Interfaces to things that hold state for the bot: the database, the
//! announcement queue, and Telegram itself. The sqlite [`Database`] implements all the
//! storage ones; the tests implement them in memory.
//!
//! [`Database`]: crate::database::Database

use std::{future::Future, time::Duration};

use teloxide::types::{ChatId, UserId};

use crate::{error::Result, sanctions::ViolationRecord};

/// Durable violation counters and mention ban preferences.
pub trait ViolationStore: Send + Sync {
    fn get_violations(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<ViolationRecord>>> + Send;

    /// Insert the record, or overwrite the one that's there.
    fn upsert_violations(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        record: &ViolationRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Top `limit` users of the chat by total violations, most violating first.
    fn top_violators(
        &self,
        chat_id: ChatId,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<(UserId, u32)>>> + Send;

    /// Returns `false` if there's no preference stored.
    fn get_mention_ban(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn set_mention_ban(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        banned: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// All users of this chat that don't want to be mentioned.
    fn mention_banned_users(&self, chat_id: ChatId)
        -> impl Future<Output = Result<Vec<UserId>>> + Send;
}

/// Durable set of chats the bot is in.
pub trait ChatDirectory: Send + Sync {
    fn list_chats(&self) -> impl Future<Output = Result<Vec<ChatId>>> + Send;

    /// Does nothing if the chat is already there.
    fn add_chat(&self, chat_id: ChatId) -> impl Future<Output = Result<()>> + Send;

    /// Does nothing if the chat is not there.
    fn remove_chat(&self, chat_id: ChatId) -> impl Future<Output = Result<()>> + Send;

    /// A group got upgraded to a supergroup and got a new ID. Move everything
    /// known about the chat to the new ID.
    fn migrate_chat(&self, from: ChatId, to: ChatId) -> impl Future<Output = Result<()>> + Send;
}

/// An operator announcement waiting to be sent to every chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub id: i64,
    pub text: String,
}

/// Queue of announcements yet to be broadcast.
pub trait AnnouncementQueue: Send + Sync {
    /// All pending announcements, oldest first.
    fn list_pending(&self) -> impl Future<Output = Result<Vec<Announcement>>> + Send;

    /// Returns the ID of the new announcement.
    fn push_announcement(&self, text: &str) -> impl Future<Output = Result<i64>> + Send;

    fn delete_announcement(&self, id: i64) -> impl Future<Output = Result<()>> + Send;
}

/// Persistent user ID to username mapping.
pub trait UsernameStore: Send + Sync {
    fn get_username(&self, user_id: UserId) -> impl Future<Output = Result<Option<String>>> + Send;

    /// `username` is expected to be normalized, as per
    /// [`bot_commons::mentions::normalize_username`].
    fn find_user_by_username(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<UserId>>> + Send;

    /// Also makes sure no other user holds this username anymore.
    fn set_username(
        &self,
        user_id: UserId,
        username: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Somewhere to put unexpected errors for the operators to look at later.
pub trait ErrorTracker: Send + Sync {
    /// Never fails; if reporting itself fails, that is only logged.
    fn report_error(&self, name: &str, details: &str) -> impl Future<Output = ()> + Send;
}

/// Why sending a message failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Timed out. Worth trying again right away.
    Transient(String),
    /// Flood control. Try again after this long.
    RateLimited(Duration),
    /// The bot was blocked, kicked, or otherwise can't ever talk there again.
    PermanentlyBlocked(String),
    /// The chat was upgraded to a supergroup with this new ID.
    Migrated(ChatId),
    /// Anything else.
    Other(String),
}

/// Something that can send a text message to a chat.
pub trait DeliveryTransport: Send + Sync {
    fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}
