//! Knowing who `@someone` is.
//!
//! Telegram doesn't tell bots which user a plain `@username` mention refers to, so the bot
//! remembers the usernames of everyone it sees.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use bot_commons::mentions::normalize_username;
use teloxide::types::{User, UserId};

use crate::store::UsernameStore;

#[derive(Default)]
struct Entries {
    by_user: HashMap<UserId, String>,
    by_name: HashMap<String, UserId>,
    /// Oldest first.
    order: VecDeque<UserId>,
}

impl Entries {
    fn remove(&mut self, user_id: UserId) {
        if let Some(name) = self.by_user.remove(&user_id) {
            self.by_name.remove(&name);
            self.order.retain(|x| *x != user_id);
        }
    }

    fn insert(&mut self, user_id: UserId, name: String, capacity: usize) {
        self.remove(user_id);
        if let Some(previous_holder) = self.by_name.get(&name).copied() {
            self.remove(previous_holder);
        }

        self.by_name.insert(name.clone(), user_id);
        self.by_user.insert(user_id, name);
        self.order.push_back(user_id);

        while self.by_user.len() > capacity {
            let Some(oldest) = self.order.front().copied() else {
                break;
            };
            self.remove(oldest);
        }
    }
}

/// Bounded write-through cache of usernames in front of a [`UsernameStore`].
///
/// Usernames are stored normalized: lowercase, without the `@`.
/// Once full, the entries that were cached the earliest are dropped first.
pub struct UsernameCache<S> {
    store: Arc<S>,
    capacity: usize,
    entries: Mutex<Entries>,
}

impl<S: UsernameStore> UsernameCache<S> {
    pub fn new(store: Arc<S>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        // Nothing can panic while holding it.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Remember the username of this user, if they have one.
    /// Writes to the store only if it's new or changed.
    pub async fn observe(&self, user: &User) -> crate::Result<()> {
        let Some(username) = &user.username else {
            return Ok(());
        };
        let username = normalize_username(username);

        let known = self.entries().by_user.get(&user.id) == Some(&username);
        if known {
            return Ok(());
        }

        log::debug!("Learned username @{username} of user {}", user.id);
        self.store.set_username(user.id, &username).await?;
        self.entries().insert(user.id, username, self.capacity);
        Ok(())
    }

    /// Find who holds this username. Accepts it with or without the `@`, in any case.
    pub async fn resolve(&self, username: &str) -> crate::Result<Option<UserId>> {
        let username = normalize_username(username);

        let cached = self.entries().by_name.get(&username).copied();
        if cached.is_some() {
            return Ok(cached);
        }

        let found = self.store.find_user_by_username(&username).await?;
        if let Some(user_id) = found {
            self.entries().insert(user_id, username, self.capacity);
        }
        Ok(found)
    }

    /// Username of this user, without the `@`.
    pub async fn username_of(&self, user_id: UserId) -> crate::Result<Option<String>> {
        let cached = self.entries().by_user.get(&user_id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let found = self.store.get_username(user_id).await?;
        if let Some(username) = &found {
            self.entries()
                .insert(user_id, username.clone(), self.capacity);
        }
        Ok(found)
    }

    /// Forget the cached username of this user, so that the next lookup asks the store.
    pub fn invalidate(&self, user_id: UserId) {
        self.entries().remove(user_id);
    }

    /// Amount of users currently cached.
    pub fn len(&self) -> usize {
        self.entries().by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        names: Mutex<HashMap<UserId, String>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl UsernameStore for FakeStore {
        async fn get_username(&self, user_id: UserId) -> crate::Result<Option<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.names.lock().unwrap().get(&user_id).cloned())
        }

        async fn find_user_by_username(&self, username: &str) -> crate::Result<Option<UserId>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .names
                .lock()
                .unwrap()
                .iter()
                .find(|(_, name)| *name == username)
                .map(|(id, _)| *id))
        }

        async fn set_username(&self, user_id: UserId, username: &str) -> crate::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut names = self.names.lock().unwrap();
            names.retain(|_, name| name != username);
            names.insert(user_id, username.to_string());
            Ok(())
        }
    }

    fn user(id: u64, username: Option<&str>) -> User {
        User {
            id: UserId(id),
            is_bot: false,
            first_name: "Test".to_string(),
            last_name: None,
            username: username.map(str::to_string),
            language_code: None,
            is_premium: false,
            added_to_attachment_menu: false,
        }
    }

    #[tokio::test]
    async fn observe_writes_through_once() {
        let store = Arc::new(FakeStore::default());
        let cache = UsernameCache::new(store.clone(), 16);

        cache.observe(&user(1, Some("Amogus"))).await.unwrap();
        cache.observe(&user(1, Some("amogus"))).await.unwrap();
        cache.observe(&user(2, None)).await.unwrap();

        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.names.lock().unwrap().get(&UserId(1)).map(String::as_str),
            Some("amogus")
        );
        assert_eq!(cache.resolve("@AMOGUS").await.unwrap(), Some(UserId(1)));
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn username_moves_between_users() {
        let store = Arc::new(FakeStore::default());
        let cache = UsernameCache::new(store.clone(), 16);

        cache.observe(&user(1, Some("sus"))).await.unwrap();
        cache.observe(&user(2, Some("sus"))).await.unwrap();

        assert_eq!(cache.resolve("sus").await.unwrap(), Some(UserId(2)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.username_of(UserId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn misses_fall_through_to_store() {
        let store = Arc::new(FakeStore::default());
        store
            .names
            .lock()
            .unwrap()
            .insert(UserId(5), "impostor".to_string());
        let cache = UsernameCache::new(store.clone(), 16);

        assert_eq!(cache.resolve("impostor").await.unwrap(), Some(UserId(5)));
        assert_eq!(
            cache.username_of(UserId(5)).await.unwrap().as_deref(),
            Some("impostor")
        );
        // Second lookup was served from the cache.
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        cache.invalidate(UserId(5));
        assert!(cache.is_empty());
        cache.username_of(UserId(5)).await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);

        assert_eq!(cache.resolve("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn oldest_entries_are_evicted() {
        let store = Arc::new(FakeStore::default());
        let cache = UsernameCache::new(store.clone(), 2);

        cache.observe(&user(1, Some("one"))).await.unwrap();
        cache.observe(&user(2, Some("two"))).await.unwrap();
        cache.observe(&user(3, Some("three"))).await.unwrap();
        assert_eq!(cache.len(), 2);

        // Evicted from the cache, but still in the store.
        let reads = store.reads.load(Ordering::SeqCst);
        assert_eq!(cache.resolve("one").await.unwrap(), Some(UserId(1)));
        assert_eq!(store.reads.load(Ordering::SeqCst), reads + 1);
        assert_eq!(cache.len(), 2);
    }
}
