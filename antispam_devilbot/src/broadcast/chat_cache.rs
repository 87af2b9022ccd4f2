use std::time::Duration;

use teloxide::types::ChatId;
use tokio::time::Instant;

use crate::store::ChatDirectory;

/// Local copy of the chat list, re-read from the directory once it's older than the TTL.
pub struct ChatCache {
    ttl: Duration,
    chats: Vec<ChatId>,
    fetched_at: Option<Instant>,
}

impl ChatCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            chats: Vec::new(),
            fetched_at: None,
        }
    }

    fn is_stale(&self) -> bool {
        match self.fetched_at {
            None => true,
            Some(at) => at.elapsed() > self.ttl,
        }
    }

    /// Re-read the chat list if it was never read or has gone stale.
    /// On failure the previous list stays, and will be re-read on the next call.
    pub async fn refresh_if_stale(&mut self, directory: &impl ChatDirectory) -> crate::Result<()> {
        if !self.is_stale() {
            return Ok(());
        }
        let chats = directory.list_chats().await?;
        log::debug!("Refreshed chat list, {} chats", chats.len());
        self.chats = chats;
        self.fetched_at = Some(Instant::now());
        Ok(())
    }

    pub fn chats(&self) -> &[ChatId] {
        &self.chats
    }

    /// Drop the chat from the list, without waiting for a refresh.
    pub fn forget(&mut self, chat_id: ChatId) {
        self.chats.retain(|x| *x != chat_id);
    }

    /// Swap the chat's ID for a new one, without waiting for a refresh.
    pub fn replace(&mut self, from: ChatId, to: ChatId) {
        let already_there = self.chats.contains(&to);
        if already_there {
            self.forget(from);
        } else {
            for chat in &mut self.chats {
                if *chat == from {
                    *chat = to;
                }
            }
        }
    }
}
