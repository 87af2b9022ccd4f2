//! Violation accounting and punishment escalation.

mod locks;
mod types;

use std::sync::Arc;

use chrono::NaiveDate;
use teloxide::types::{ChatId, UserId};

pub use locks::{KeyGuard, KeyedLocks};
pub use types::{derive_sanctions, Sanction, ViolationRecord};

use crate::{
    error::{Error, Result},
    store::ViolationStore,
};

/// Keeps track of who mentions whom where, and decides how hard to punish for it.
///
/// Calls for different users or chats run fully in parallel. Calls for the same user
/// in the same chat are serialized, so that a burst of messages can't lose updates.
pub struct SanctionEngine<S> {
    store: Arc<S>,
    violation_locks: KeyedLocks<(ChatId, UserId)>,
    mention_ban_locks: KeyedLocks<(ChatId, UserId)>,
}

impl<S: ViolationStore> SanctionEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            violation_locks: KeyedLocks::default(),
            mention_ban_locks: KeyedLocks::default(),
        }
    }

    /// Register that `user_id` mentioned `offended_mentions` in `chat_id` on `now_date` (UTC),
    /// and return the sanctions they get for it.
    ///
    /// The first returned sanction is on the mute axis, the optional second one is a media ban.
    ///
    /// # Errors
    /// Errors if the store fails, or if the stored record is corrupted.
    pub async fn register_violation(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        offended_mentions: Vec<UserId>,
        now_date: NaiveDate,
    ) -> Result<Vec<Sanction>> {
        let _guard = self.violation_locks.lock((chat_id, user_id)).await;

        let record = match self.store.get_violations(chat_id, user_id).await? {
            None => ViolationRecord::first(now_date, offended_mentions),
            Some(mut record) => {
                check_consistency(chat_id, user_id, &record)?;
                record.register(now_date, offended_mentions);
                record
            }
        };

        self.store
            .upsert_violations(chat_id, user_id, &record)
            .await?;

        let sanctions = derive_sanctions(record.violations_today, record.violations_month);
        log::info!(
            "User {user_id} violated in chat {chat_id} \
            (today: {}, month: {}, total: {}), sanctions: {sanctions:?}",
            record.violations_today,
            record.violations_month,
            record.violations_total,
        );
        Ok(sanctions)
    }

    /// Forgiving violations is not a thing. Always errors with [`Error::Unsupported`].
    ///
    /// # Errors
    /// Always.
    pub async fn forgive_violation(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        forgiven_by: UserId,
    ) -> Result<()> {
        log::info!("User {forgiven_by} tried to forgive user {user_id} in chat {chat_id}.");
        Err(Error::Unsupported("forgiving violations"))
    }

    /// Set whether `user_id` wants to not be mentioned in `chat_id`. If `value` is
    /// [`None`], flips the current preference instead. Returns the preference now in effect.
    ///
    /// # Errors
    /// Errors if the store fails.
    pub async fn set_mention_ban(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        value: Option<bool>,
    ) -> Result<bool> {
        let _guard = self.mention_ban_locks.lock((chat_id, user_id)).await;

        let new_value = match value {
            Some(value) => value,
            None => !self.store.get_mention_ban(chat_id, user_id).await?,
        };

        self.store
            .set_mention_ban(chat_id, user_id, new_value)
            .await?;

        log::info!("Mention ban of user {user_id} in chat {chat_id} is now {new_value}");
        Ok(new_value)
    }

    /// # Errors
    /// Errors if the store fails.
    pub async fn is_mention_banned(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        self.store.get_mention_ban(chat_id, user_id).await
    }

    /// Returns those of `candidates` that don't want to be mentioned in this chat,
    /// in the same order.
    ///
    /// # Errors
    /// Errors if the store fails.
    pub async fn filter_banned_mentions(
        &self,
        chat_id: ChatId,
        candidates: &[UserId],
    ) -> Result<Vec<UserId>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let banned = self.store.mention_banned_users(chat_id).await?;
        Ok(candidates
            .iter()
            .filter(|x| banned.contains(x))
            .copied()
            .collect())
    }

    /// All users of this chat that don't want to be mentioned.
    ///
    /// # Errors
    /// Errors if the store fails.
    pub async fn mention_banned_users(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        self.store.mention_banned_users(chat_id).await
    }

    /// Violation history of this user in this chat, if there is any.
    ///
    /// # Errors
    /// Errors if the store fails, or if the stored record is corrupted.
    pub async fn violations_of(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<ViolationRecord>> {
        let record = self.store.get_violations(chat_id, user_id).await?;
        if let Some(record) = &record {
            check_consistency(chat_id, user_id, record)?;
        }
        Ok(record)
    }

    /// Top `limit` violators of this chat by total violations.
    ///
    /// # Errors
    /// Errors if the store fails.
    pub async fn top_violators(&self, chat_id: ChatId, limit: u32) -> Result<Vec<(UserId, u32)>> {
        self.store.top_violators(chat_id, limit).await
    }
}

fn check_consistency(chat_id: ChatId, user_id: UserId, record: &ViolationRecord) -> Result<()> {
    if record.is_consistent() {
        return Ok(());
    }

    log::error!("Corrupted violation record of user {user_id} in chat {chat_id}: {record:?}");
    Err(Error::CorruptedRecord {
        chat: chat_id,
        user: user_id,
        today: record.violations_today,
        month: record.violations_month,
        total: record.violations_total,
    })
}
