//! Background delivery of operator announcements to every chat the bot is in.

mod chat_cache;
mod shutdown;

use std::{fmt::Display, sync::Arc, time::Duration};

use teloxide::types::ChatId;
use tokio::sync::watch;

pub use chat_cache::ChatCache;
pub use shutdown::Shutdown;

use crate::store::{
    Announcement, AnnouncementQueue, ChatDirectory, DeliveryError, DeliveryTransport, ErrorTracker,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// How long the list of chats is reused before re-reading it.
    pub chat_cache_ttl: Duration,
    /// Pause after sending to each chat.
    pub pacing: Duration,
    /// Pause after each cycle.
    pub cycle_pause: Duration,
    /// Attempts per chat per announcement, including the first one.
    pub max_attempts: u32,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            chat_cache_ttl: Duration::from_secs(5 * 60),
            pacing: Duration::from_secs(2),
            cycle_pause: Duration::from_secs(10 * 60),
            max_attempts: 10,
        }
    }
}

/// How delivering one announcement to one chat ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// The chat is unreachable forever and was removed from the directory.
    Pruned,
    /// Failed in an unexpected way, which was reported.
    Errored,
    /// Every attempt failed.
    GaveUp,
    /// Shutdown was requested while waiting to try again.
    Interrupted,
}

/// What happened during one pass over the announcement queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Announcements that were sent out and removed from the queue.
    pub announcements: usize,
    pub delivered: usize,
    pub pruned: usize,
    pub errored: usize,
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered { .. } => self.delivered += 1,
            DeliveryOutcome::Pruned => self.pruned += 1,
            DeliveryOutcome::Errored => self.errored += 1,
            DeliveryOutcome::GaveUp => self.failed += 1,
            DeliveryOutcome::Interrupted => {}
        }
    }
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} announcements sent: {} delivered, {} pruned, {} errored, {} failed",
            self.announcements, self.delivered, self.pruned, self.errored, self.failed
        )
    }
}

/// Sends every pending announcement to every known chat, forever, until shut down.
pub struct BroadcastLoop<D, Q, T, R> {
    directory: Arc<D>,
    queue: Arc<Q>,
    transport: Arc<T>,
    tracker: Arc<R>,
    settings: BroadcastSettings,
    cache: ChatCache,
    shutdown: Shutdown,
}

impl<D, Q, T, R> BroadcastLoop<D, Q, T, R>
where
    D: ChatDirectory,
    Q: AnnouncementQueue,
    T: DeliveryTransport,
    R: ErrorTracker,
{
    /// The loop stops once every sender of `shutdown` is dropped.
    pub fn new(
        directory: Arc<D>,
        queue: Arc<Q>,
        transport: Arc<T>,
        tracker: Arc<R>,
        settings: BroadcastSettings,
        shutdown: watch::Receiver<()>,
    ) -> Self {
        Self {
            directory,
            queue,
            transport,
            tracker,
            cache: ChatCache::new(settings.chat_cache_ttl),
            settings,
            shutdown: Shutdown::new(shutdown),
        }
    }

    pub async fn run(mut self) {
        log::info!("Broadcast loop started");
        loop {
            match self.run_cycle().await {
                Ok(report) if report.announcements > 0 => log::info!("{report}"),
                Ok(report) => log::debug!("{report}"),
                Err(e) => {
                    log::error!("Broadcast cycle failed: {e}");
                    self.tracker
                        .report_error("Broadcast cycle failed", &e.to_string())
                        .await;
                }
            }

            if self.shutdown.sleep(self.settings.cycle_pause).await {
                break;
            }
        }
        log::info!("Broadcast loop shut down");
    }

    /// Send out every pending announcement once.
    ///
    /// An announcement is deleted after every chat got an attempt, however those went.
    /// If shutdown interrupts it midway, it's left in the queue, and the rest are not touched.
    pub async fn run_cycle(&mut self) -> crate::Result<CycleReport> {
        let mut report = CycleReport::default();

        self.cache.refresh_if_stale(&*self.directory).await?;

        for announcement in self.queue.list_pending().await? {
            if self.shutdown.is_triggered() {
                break;
            }
            if !self.send_to_all(&announcement, &mut report).await {
                log::info!(
                    "Shutting down in the middle of announcement {}, keeping it",
                    announcement.id
                );
                break;
            }
            self.queue.delete_announcement(announcement.id).await?;
            report.announcements += 1;
        }

        Ok(report)
    }

    /// Returns `true` if every chat got an attempt.
    async fn send_to_all(&mut self, announcement: &Announcement, report: &mut CycleReport) -> bool {
        log::info!("Broadcasting announcement {}", announcement.id);

        // Pruning and migrations edit the cache as we go.
        let chats = self.cache.chats().to_vec();
        let total = chats.len();

        for (i, chat_id) in chats.into_iter().enumerate() {
            let outcome = self.deliver(chat_id, &announcement.text).await;
            if outcome == DeliveryOutcome::Interrupted {
                return false;
            }
            report.record(outcome);

            if self.shutdown.sleep(self.settings.pacing).await {
                return i + 1 == total;
            }
        }
        true
    }

    async fn deliver(&mut self, mut chat_id: ChatId, text: &str) -> DeliveryOutcome {
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            if attempt > 1 && self.shutdown.is_triggered() {
                return DeliveryOutcome::Interrupted;
            }

            let error = match self.transport.send_text(chat_id, text).await {
                Ok(()) => return DeliveryOutcome::Delivered { attempts: attempt },
                Err(e) => e,
            };

            match error {
                DeliveryError::Transient(e) => {
                    log::warn!("Attempt {attempt}/{max_attempts} to send to {chat_id} failed: {e}");
                }
                DeliveryError::RateLimited(wait) => {
                    log::warn!(
                        "Attempt {attempt}/{max_attempts} to send to {chat_id} got rate limited, waiting {}s",
                        wait.as_secs()
                    );
                    if self.shutdown.sleep(wait).await {
                        return DeliveryOutcome::Interrupted;
                    }
                }
                DeliveryError::PermanentlyBlocked(e) => {
                    log::info!("Chat {chat_id} is unreachable ({e}), pruning it");
                    self.cache.forget(chat_id);
                    if let Err(e) = self.directory.remove_chat(chat_id).await {
                        log::error!("Failed to prune chat {chat_id}: {e}");
                        self.tracker
                            .report_error("Failed to prune a chat", &format!("{chat_id}: {e}"))
                            .await;
                    }
                    return DeliveryOutcome::Pruned;
                }
                DeliveryError::Migrated(new_id) => {
                    log::info!("Chat {chat_id} migrated to {new_id}, retrying there");
                    if let Err(e) = self.directory.migrate_chat(chat_id, new_id).await {
                        log::error!("Failed to migrate chat {chat_id} to {new_id}: {e}");
                        self.tracker
                            .report_error(
                                "Failed to migrate a chat",
                                &format!("{chat_id} -> {new_id}: {e}"),
                            )
                            .await;
                    }
                    self.cache.replace(chat_id, new_id);
                    chat_id = new_id;
                }
                DeliveryError::Other(e) => {
                    log::error!("Failed to send an announcement to {chat_id}: {e}");
                    self.tracker
                        .report_error(
                            "Failed to send an announcement",
                            &format!("Chat {chat_id}: {e}"),
                        )
                        .await;
                    return DeliveryOutcome::Errored;
                }
            }
        }

        log::error!("Giving up on sending to {chat_id} after {max_attempts} attempts");
        DeliveryOutcome::GaveUp
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    use tokio::time::Instant;

    use super::*;

    #[derive(Default)]
    struct FakeDirectory {
        chats: Mutex<Vec<ChatId>>,
    }

    impl ChatDirectory for FakeDirectory {
        async fn list_chats(&self) -> crate::Result<Vec<ChatId>> {
            Ok(self.chats.lock().unwrap().clone())
        }
        async fn add_chat(&self, chat_id: ChatId) -> crate::Result<()> {
            let mut chats = self.chats.lock().unwrap();
            if !chats.contains(&chat_id) {
                chats.push(chat_id);
            }
            Ok(())
        }
        async fn remove_chat(&self, chat_id: ChatId) -> crate::Result<()> {
            self.chats.lock().unwrap().retain(|x| *x != chat_id);
            Ok(())
        }
        async fn migrate_chat(&self, from: ChatId, to: ChatId) -> crate::Result<()> {
            for chat in self.chats.lock().unwrap().iter_mut() {
                if *chat == from {
                    *chat = to;
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeQueue {
        pending: Mutex<Vec<Announcement>>,
        deleted: Mutex<Vec<i64>>,
    }

    impl AnnouncementQueue for FakeQueue {
        async fn list_pending(&self) -> crate::Result<Vec<Announcement>> {
            Ok(self.pending.lock().unwrap().clone())
        }
        async fn push_announcement(&self, text: &str) -> crate::Result<i64> {
            let mut pending = self.pending.lock().unwrap();
            let id = pending.len() as i64 + self.deleted.lock().unwrap().len() as i64 + 1;
            pending.push(Announcement {
                id,
                text: text.to_string(),
            });
            Ok(id)
        }
        async fn delete_announcement(&self, id: i64) -> crate::Result<()> {
            self.pending.lock().unwrap().retain(|x| x.id != id);
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }
    }

    /// Succeeds unless told otherwise for a chat.
    #[derive(Default)]
    struct FakeTransport {
        failures: Mutex<HashMap<ChatId, VecDeque<DeliveryError>>>,
        attempts: Mutex<Vec<(ChatId, String)>>,
    }

    impl FakeTransport {
        fn fail(&self, chat_id: i64, errors: impl IntoIterator<Item = DeliveryError>) {
            self.failures
                .lock()
                .unwrap()
                .entry(ChatId(chat_id))
                .or_default()
                .extend(errors);
        }

        fn attempted_chats(&self) -> Vec<i64> {
            self.attempts.lock().unwrap().iter().map(|x| x.0 .0).collect()
        }
    }

    impl DeliveryTransport for FakeTransport {
        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError> {
            self.attempts
                .lock()
                .unwrap()
                .push((chat_id, text.to_string()));
            match self
                .failures
                .lock()
                .unwrap()
                .get_mut(&chat_id)
                .and_then(VecDeque::pop_front)
            {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct FakeTracker {
        reports: Mutex<Vec<String>>,
    }

    impl ErrorTracker for FakeTracker {
        async fn report_error(&self, name: &str, details: &str) {
            self.reports
                .lock()
                .unwrap()
                .push(format!("{name}: {details}"));
        }
    }

    type TestLoop = BroadcastLoop<FakeDirectory, FakeQueue, FakeTransport, FakeTracker>;

    struct Fixture {
        directory: Arc<FakeDirectory>,
        queue: Arc<FakeQueue>,
        transport: Arc<FakeTransport>,
        tracker: Arc<FakeTracker>,
        shutdown: Option<watch::Sender<()>>,
    }

    async fn setup(chats: &[i64], announcements: &[&str]) -> (TestLoop, Fixture) {
        let fixture = Fixture {
            directory: Arc::default(),
            queue: Arc::default(),
            transport: Arc::default(),
            tracker: Arc::default(),
            shutdown: None,
        };
        for chat in chats {
            fixture.directory.add_chat(ChatId(*chat)).await.unwrap();
        }
        for text in announcements {
            fixture.queue.push_announcement(text).await.unwrap();
        }

        let (sender, receiver) = watch::channel(());
        let broadcast = BroadcastLoop::new(
            fixture.directory.clone(),
            fixture.queue.clone(),
            fixture.transport.clone(),
            fixture.tracker.clone(),
            BroadcastSettings::default(),
            receiver,
        );
        let fixture = Fixture {
            shutdown: Some(sender),
            ..fixture
        };
        (broadcast, fixture)
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_prunes_and_moves_on() {
        let (mut broadcast, fixture) = setup(&[1, 2, 3], &["hello"]).await;
        fixture
            .transport
            .fail(2, [DeliveryError::PermanentlyBlocked("Forbidden".into())]);

        let report = broadcast.run_cycle().await.unwrap();

        assert_eq!(fixture.transport.attempted_chats(), [1, 2, 3]);
        assert_eq!(*fixture.directory.chats.lock().unwrap(), [ChatId(1), ChatId(3)]);
        assert_eq!(*fixture.queue.deleted.lock().unwrap(), [1]);
        assert!(fixture.queue.pending.lock().unwrap().is_empty());
        assert_eq!(
            report,
            CycleReport {
                announcements: 1,
                delivered: 2,
                pruned: 1,
                errored: 0,
                failed: 0,
            }
        );

        // Pruned from the cache too.
        fixture.queue.push_announcement("again").await.unwrap();
        broadcast.run_cycle().await.unwrap();
        assert_eq!(fixture.transport.attempted_chats(), [1, 2, 3, 1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_last_attempt() {
        let (mut broadcast, fixture) = setup(&[1], &["hello"]).await;
        fixture
            .transport
            .fail(1, (0..9).map(|_| DeliveryError::Transient("timeout".into())));

        let outcome = broadcast.deliver(ChatId(1), "hello").await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 10 });
        assert_eq!(fixture.transport.attempted_chats().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (mut broadcast, fixture) = setup(&[1, 2], &["hello"]).await;
        fixture
            .transport
            .fail(1, (0..20).map(|_| DeliveryError::Transient("timeout".into())));

        let report = broadcast.run_cycle().await.unwrap();

        let attempts = fixture.transport.attempted_chats();
        assert_eq!(attempts.iter().filter(|x| **x == 1).count(), 10);
        assert_eq!(attempts.last(), Some(&2));
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        // Still deleted, and the chat is still there.
        assert_eq!(*fixture.queue.deleted.lock().unwrap(), [1]);
        assert_eq!(fixture.directory.chats.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits() {
        let (mut broadcast, fixture) = setup(&[1], &["hello"]).await;
        fixture
            .transport
            .fail(1, [DeliveryError::RateLimited(Duration::from_secs(30))]);

        let start = Instant::now();
        let report = broadcast.run_cycle().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(report.delivered, 1);
        assert_eq!(fixture.transport.attempted_chats(), [1, 1]);
        // 30 seconds of waiting plus pacing.
        assert!(elapsed >= Duration::from_secs(32));
        assert!(elapsed < Duration::from_secs(33));
    }

    #[tokio::test(start_paused = true)]
    async fn chats_are_paced() {
        let (mut broadcast, fixture) = setup(&[1, 2, 3], &["one", "two"]).await;

        let start = Instant::now();
        broadcast.run_cycle().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert!(start.elapsed() < Duration::from_secs(13));

        let texts: Vec<String> = fixture
            .transport
            .attempts
            .lock()
            .unwrap()
            .iter()
            .map(|x| x.1.clone())
            .collect();
        assert_eq!(texts, ["one", "one", "one", "two", "two", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_errors_are_reported() {
        let (mut broadcast, fixture) = setup(&[1, 2], &["hello"]).await;
        fixture
            .transport
            .fail(1, [DeliveryError::Other("Bad Request: something".into())]);

        let report = broadcast.run_cycle().await.unwrap();

        assert_eq!(fixture.transport.attempted_chats(), [1, 2]);
        assert_eq!(report.errored, 1);
        assert_eq!(fixture.tracker.reports.lock().unwrap().len(), 1);
        assert_eq!(fixture.directory.chats.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn migration_retries_at_new_id() {
        let (mut broadcast, fixture) = setup(&[1, 2], &["hello"]).await;
        fixture.transport.fail(1, [DeliveryError::Migrated(ChatId(-100))]);

        let report = broadcast.run_cycle().await.unwrap();

        assert_eq!(fixture.transport.attempted_chats(), [1, -100, 2]);
        assert_eq!(report.delivered, 2);
        assert_eq!(
            *fixture.directory.chats.lock().unwrap(),
            [ChatId(-100), ChatId(2)]
        );
        assert_eq!(broadcast.cache.chats(), [ChatId(-100), ChatId(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_list_is_cached() {
        let (mut broadcast, fixture) = setup(&[1], &["one"]).await;
        broadcast.run_cycle().await.unwrap();

        fixture.directory.add_chat(ChatId(2)).await.unwrap();
        fixture.queue.push_announcement("two").await.unwrap();
        broadcast.run_cycle().await.unwrap();
        assert_eq!(fixture.transport.attempted_chats(), [1, 1]);

        tokio::time::advance(Duration::from_secs(301)).await;
        fixture.queue.push_announcement("three").await.unwrap();
        broadcast.run_cycle().await.unwrap();
        assert_eq!(fixture.transport.attempted_chats(), [1, 1, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_keeps_unfinished_announcement() {
        let (mut broadcast, mut fixture) = setup(&[1, 2, 3], &["hello"]).await;
        drop(fixture.shutdown.take());

        let report = broadcast.run_cycle().await.unwrap();

        assert_eq!(report.announcements, 0);
        assert!(fixture.transport.attempted_chats().is_empty());
        assert_eq!(fixture.queue.pending.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_rate_limit_wait() {
        let (mut broadcast, mut fixture) = setup(&[1, 2], &["hello"]).await;
        fixture
            .transport
            .fail(1, [DeliveryError::RateLimited(Duration::from_secs(3600))]);

        let sender = fixture.shutdown.take();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(sender);
        });

        let report = broadcast.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(fixture.transport.attempted_chats(), [1]);
        assert_eq!(fixture.queue.pending.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (broadcast, mut fixture) = setup(&[1], &["hello"]).await;
        let handle = tokio::spawn(broadcast.run());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*fixture.queue.deleted.lock().unwrap(), [1]);

        drop(fixture.shutdown.take());
        handle.await.unwrap();
    }

    #[test]
    fn report_display() {
        let report = CycleReport {
            announcements: 1,
            delivered: 5,
            pruned: 1,
            errored: 0,
            failed: 2,
        };
        assert_eq!(
            report.to_string(),
            "1 announcements sent: 5 delivered, 1 pruned, 0 errored, 2 failed"
        );
    }
}
