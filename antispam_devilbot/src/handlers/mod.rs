use std::sync::Arc;

use bot_commons::mentions::{get_mentions, Mention};
use chrono::Utc;
use futures::future::BoxFuture;
use teloxide::{
    error_handlers::ErrorHandler,
    prelude::*,
    types::{Me, UserId},
};

use crate::{
    actions::{enforce_sanctions, send_html, violation_notice},
    app::App,
    store::{ChatDirectory, ErrorTracker, UsernameStore},
    usernames::UsernameCache,
    Error,
};

pub mod commands;

pub use commands::generate_bot_commands;

pub async fn handle_message(
    bot: Bot,
    me: Me,
    message: Message,
    app: Arc<App>,
) -> Result<(), Error> {
    // Learn usernames of everyone we see, to resolve @mentions later.
    if let Some(user) = &message.from {
        if let Err(e) = app.usernames.observe(user).await {
            log::warn!("Failed to remember username of {}: {e}", user.id);
        }
    }

    if let Some(new_members) = message.new_chat_members() {
        for member in new_members {
            if member.id == me.id {
                log::info!("Added to chat {}", message.chat.id);
                app.database.add_chat(message.chat.id).await?;
                send_html(&bot, message.chat.id, &commands::help_text("Hello everyone!")).await?;
            } else if let Err(e) = app.usernames.observe(member).await {
                log::warn!("Failed to remember username of {}: {e}", member.id);
            }
        }
        return Ok(());
    }

    if let Some(new_id) = message.migrate_to_chat_id() {
        app.database.migrate_chat(message.chat.id, *new_id).await?;
        return Ok(());
    }

    if commands::handle_command(&bot, &me, &message, &app).await? {
        return Ok(());
    }

    if message.chat.is_private() {
        send_html(&bot, message.chat.id, &commands::help_text("Need help? Here!")).await?;
        return Ok(());
    }

    handle_mention_violation(&bot, &me, &message, &app).await
}

/// Users mentioned in a message who may take offense at it. Mentions nobody could
/// resolve, of the sender themself and of this bot don't count. Each user is listed once.
fn mentioned_users(
    resolved: impl IntoIterator<Item = Option<UserId>>,
    sender: UserId,
    me: UserId,
) -> Vec<UserId> {
    let mut output: Vec<UserId> = Vec::new();
    for user_id in resolved.into_iter().flatten() {
        if user_id == sender || user_id == me || output.contains(&user_id) {
            continue;
        }
        output.push(user_id);
    }
    output
}

/// Everyone the message mentions who may take offense at it.
/// Nobody, if it's from a bot.
async fn offended_candidates<S: UsernameStore>(
    message: &Message,
    me: UserId,
    usernames: &UsernameCache<S>,
) -> Result<Vec<UserId>, Error> {
    let Some(sender) = &message.from else {
        return Ok(Vec::new());
    };
    if sender.is_bot {
        return Ok(Vec::new());
    }

    let mut resolved = Vec::new();
    for mention in get_mentions(message) {
        resolved.push(match mention {
            // Never seen them, so they can't have asked for anything.
            Mention::Username(name) => usernames.resolve(name).await?,
            Mention::User(user) => Some(user.id),
        });
    }

    Ok(mentioned_users(resolved, sender.id, me))
}

/// Punish the sender if they mentioned anyone who asked not to be mentioned in this chat.
async fn handle_mention_violation(
    bot: &Bot,
    me: &Me,
    message: &Message,
    app: &App,
) -> Result<(), Error> {
    let Some(offender) = &message.from else {
        return Ok(());
    };
    let mentioned = offended_candidates(message, me.id, &app.usernames).await?;
    if mentioned.is_empty() {
        return Ok(());
    }

    let chat_id = message.chat.id;
    let offended = app.engine.filter_banned_mentions(chat_id, &mentioned).await?;
    if offended.is_empty() {
        return Ok(());
    }

    let sanctions = app
        .engine
        .register_violation(chat_id, offender.id, offended.clone(), Utc::now().date_naive())
        .await?;

    let enforced = enforce_sanctions(bot, &app.database, chat_id, offender, &sanctions).await?;

    let mut offended_names = Vec::with_capacity(offended.len());
    for user_id in offended {
        offended_names.push(commands::user_display_name(app, user_id).await?);
    }

    send_html(
        bot,
        chat_id,
        &violation_notice(offender, &offended_names, &sanctions, enforced),
    )
    .await?;
    Ok(())
}

/// Logs errors from update handlers and keeps them for operators to look at with `/errors`.
pub struct ReportingErrorHandler<R> {
    tracker: Arc<R>,
}

impl<R> ReportingErrorHandler<R> {
    pub fn new(tracker: Arc<R>) -> Arc<Self> {
        Arc::new(Self { tracker })
    }
}

impl<R: ErrorTracker + 'static> ErrorHandler<Error> for ReportingErrorHandler<R> {
    fn handle_error(self: Arc<Self>, error: Error) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            log::error!("Error while handling an update: {error}");
            self.tracker
                .report_error("Error while handling an update", &format!("{error:?}"))
                .await;
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use teloxide::types::User;

    use super::*;
    use crate::database::Database;

    const ME: UserId = UserId(1000);
    const SENDER: UserId = UserId(5);

    fn message(from: &str, text: &str, entities: &str) -> Message {
        serde_json::from_str(&format!(
            r#"{{
                "message_id": 1,
                "date": 1700000000,
                "chat": {{"id": -100123, "type": "supergroup", "title": "Amogus"}},
                "from": {from},
                "text": "{text}",
                "entities": [{entities}]
            }}"#
        ))
        .unwrap()
    }

    fn person(id: u64, username: &str) -> User {
        serde_json::from_str(&format!(
            r#"{{"id": {id}, "is_bot": false, "first_name": "P", "username": "{username}"}}"#
        ))
        .unwrap()
    }

    async fn usernames() -> UsernameCache<Database> {
        let cache = UsernameCache::new(Arc::new(Database::new_in_memory().await.unwrap()), 16);
        cache.observe(&person(7, "Bob")).await.unwrap();
        cache.observe(&person(5, "red")).await.unwrap();
        cache.observe(&person(1000, "antispam_devilbot")).await.unwrap();
        cache
    }

    #[test]
    fn mentioned_users_are_filtered() {
        let resolved = [
            Some(UserId(7)),
            None,
            Some(SENDER),
            Some(ME),
            Some(UserId(8)),
            Some(UserId(7)),
        ];
        assert_eq!(
            mentioned_users(resolved, SENDER, ME),
            [UserId(7), UserId(8)]
        );
        assert!(mentioned_users([Some(SENDER), None], SENDER, ME).is_empty());
    }

    #[tokio::test]
    async fn mentions_are_resolved() {
        let usernames = usernames().await;
        let message = message(
            r#"{"id": 5, "is_bot": false, "first_name": "Red"}"#,
            "@BOB @nobody Carl @bob",
            r#"{"type": "mention", "offset": 0, "length": 4},
            {"type": "mention", "offset": 5, "length": 7},
            {"type": "text_mention", "offset": 13, "length": 4,
                "user": {"id": 9, "is_bot": false, "first_name": "Carl"}},
            {"type": "mention", "offset": 18, "length": 4}"#,
        );

        assert_eq!(
            offended_candidates(&message, ME, &usernames).await.unwrap(),
            [UserId(7), UserId(9)]
        );
    }

    #[tokio::test]
    async fn self_and_bot_mentions_dont_count() {
        let usernames = usernames().await;
        let message = message(
            r#"{"id": 5, "is_bot": false, "first_name": "Red"}"#,
            "@red @antispam_devilbot",
            r#"{"type": "mention", "offset": 0, "length": 4},
            {"type": "mention", "offset": 5, "length": 18}"#,
        );

        assert!(offended_candidates(&message, ME, &usernames)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn bots_are_ignored() {
        let usernames = usernames().await;
        let message = message(
            r#"{"id": 6, "is_bot": true, "first_name": "Impostor"}"#,
            "@Bob",
            r#"{"type": "mention", "offset": 0, "length": 4}"#,
        );

        assert!(offended_candidates(&message, ME, &usernames)
            .await
            .unwrap()
            .is_empty());
    }

    #[derive(Default)]
    struct FakeTracker {
        reports: Mutex<Vec<(String, String)>>,
    }

    impl ErrorTracker for FakeTracker {
        async fn report_error(&self, name: &str, details: &str) {
            self.reports
                .lock()
                .unwrap()
                .push((name.to_string(), details.to_string()));
        }
    }

    #[tokio::test]
    async fn errors_get_reported() {
        let tracker = Arc::new(FakeTracker::default());
        let handler = ReportingErrorHandler::new(tracker.clone());

        handler
            .handle_error(Error::Unsupported("testing"))
            .await;

        let reports = tracker.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "Error while handling an update");
        assert!(reports[0].1.contains("testing"));
    }
}
