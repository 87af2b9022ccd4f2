use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use html_escape::encode_text;
use teloxide::{
    payloads::{RestrictChatMemberSetters, SendMessageSetters},
    prelude::Requester,
    types::{ChatId, ChatPermissions, ParseMode, User, UserId},
    ApiError, Bot, RequestError,
};

use crate::{
    broadcast::Shutdown,
    database::{Database, MediaBan},
    sanctions::Sanction,
    store::DeliveryError,
    transport::classify_request_error,
    Error,
};

/// One `restrict_chat_member` call to make at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restriction {
    pub start: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Text only if `true`, nothing at all otherwise.
    pub media_only: bool,
}

impl Restriction {
    fn permissions(&self) -> ChatPermissions {
        if self.media_only {
            ChatPermissions::SEND_MESSAGES
        } else {
            ChatPermissions::empty()
        }
    }
}

/// Turn sanctions given at `now` into restrictions, in the order they need to happen.
///
/// Telegram keeps a single set of restrictions per member, and each call replaces it.
/// So the mute goes first, and the media ban takes over for whatever's left of it after.
#[must_use]
pub fn plan_restrictions(sanctions: &[Sanction], now: DateTime<Utc>) -> Vec<Restriction> {
    let ends = |media: bool| {
        sanctions
            .iter()
            .filter(|x| x.is_media_ban() == media)
            .filter_map(|x| x.duration())
            .filter_map(|x| chrono::Duration::from_std(x).ok())
            .map(|x| now + x)
            .max()
    };
    let mute_until = ends(false);
    let media_until = ends(true);

    let mut plan = Vec::with_capacity(2);
    if let Some(until) = mute_until {
        plan.push(Restriction {
            start: now,
            until,
            media_only: false,
        });
    }
    if let Some(until) = media_until {
        let start = mute_until.unwrap_or(now);
        if until > start {
            plan.push(Restriction {
                start,
                until,
                media_only: true,
            });
        }
    }
    plan
}

/// Make a string, either a @username or full name, describing the user.
pub fn user_name_prettyprint(user: &User) -> String {
    match &user.username {
        Some(username) => format!("@{username}"),
        None => user.full_name(),
    }
}

/// Returns `false` if the bot is not allowed to restrict this user there.
async fn apply_restriction(
    bot: &Bot,
    chat_id: ChatId,
    user_id: UserId,
    restriction: &Restriction,
) -> Result<bool, RequestError> {
    match bot
        .restrict_chat_member(chat_id, user_id, restriction.permissions())
        .until_date(restriction.until)
        .await
    {
        Ok(_) => Ok(true),
        Err(RequestError::Api(ApiError::NotEnoughRightsToRestrict)) => {
            log::debug!("No rights to restrict in chat {chat_id}");
            Ok(false)
        }
        Err(RequestError::Api(ApiError::Unknown(e))) if e.contains("administrator") => {
            // Chat admins can't be restricted.
            log::debug!("Can't restrict user {user_id} in chat {chat_id}: {e}");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Restrict the user in the chat according to the sanctions. The parts that
/// come later are left in the database for [`reapply_media_bans_spinloop`].
///
/// Returns `false` if the user could not be restricted.
pub async fn enforce_sanctions(
    bot: &Bot,
    database: &Database,
    chat_id: ChatId,
    user: &User,
    sanctions: &[Sanction],
) -> Result<bool, Error> {
    let now = Utc::now();
    let plan = plan_restrictions(sanctions, now);

    for restriction in plan.iter().filter(|x| x.start <= now) {
        log::info!(
            "Restricting user {} in chat {chat_id} until {} (media only: {})",
            user.id,
            restriction.until,
            restriction.media_only
        );
        match apply_restriction(bot, chat_id, user.id, restriction).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                log::warn!("Failed to restrict user {} in chat {chat_id}: {e}", user.id);
                return Ok(false);
            }
        }
    }

    for restriction in &plan {
        if restriction.media_only {
            let ban = MediaBan {
                chat_id,
                user_id: user.id,
                start: restriction.start,
                until: restriction.until,
            };
            database
                .schedule_media_ban(&ban, restriction.start <= now)
                .await?;
        } else {
            // Whatever media ban they had is gone now, until the mute is over.
            database
                .postpone_media_ban(chat_id, user.id, restriction.until)
                .await?;
        }
    }

    Ok(true)
}

async fn reapply_due_media_bans(
    bot: &Bot,
    database: &Database,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    database.remove_expired_media_bans(now).await?;

    for ban in database.due_media_bans(now).await? {
        // Telegram takes anything under 30 seconds away as "forever".
        if ban.until - now < chrono::Duration::minutes(1) {
            database.mark_media_ban_applied(&ban).await?;
            continue;
        }

        log::info!(
            "Media ban of user {} in chat {} is back until {}",
            ban.user_id,
            ban.chat_id,
            ban.until
        );
        let restriction = Restriction {
            start: ban.start,
            until: ban.until,
            media_only: true,
        };
        if let Err(e) = apply_restriction(bot, ban.chat_id, ban.user_id, &restriction).await {
            match classify_request_error(e) {
                DeliveryError::Transient(e) => {
                    log::warn!("Will retry media ban of user {}: {e}", ban.user_id);
                    continue;
                }
                DeliveryError::RateLimited(after) => {
                    log::warn!("Will retry media ban of user {} after {after:?}", ban.user_id);
                    continue;
                }
                e => log::warn!(
                    "Giving up on media ban of user {} in chat {}: {e:?}",
                    ban.user_id,
                    ban.chat_id
                ),
            }
        }
        database.mark_media_ban_applied(&ban).await?;
    }
    Ok(())
}

/// Forever loop that puts media bans back in effect once the mutes that replaced
/// them are over. Stops on shutdown.
pub async fn reapply_media_bans_spinloop(
    bot: Bot,
    database: Arc<Database>,
    mut shutdown: Shutdown,
) {
    const MIN_SLEEP: Duration = Duration::from_secs(5);
    const MAX_SLEEP: Duration = Duration::from_secs(60);

    loop {
        if let Err(e) = reapply_due_media_bans(&bot, &database, Utc::now()).await {
            log::error!("Failed to reapply media bans: {e}");
        }

        let next = match database.next_media_ban_start().await {
            Ok(x) => x,
            Err(e) => {
                log::error!("Failed to look up the next media ban: {e}");
                None
            }
        };
        let sleep_for = next
            .map(|x| (x - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_SLEEP)
            .clamp(MIN_SLEEP, MAX_SLEEP);

        if shutdown.sleep(sleep_for).await {
            log::info!("Media ban loop stopped");
            return;
        }
    }
}

/// Text telling the chat what happened and what the offender gets for it.
pub fn violation_notice(
    offender: &User,
    offended_names: &[String],
    sanctions: &[Sanction],
    enforced: bool,
) -> String {
    let offender = encode_text(&user_name_prettyprint(offender)).into_owned();
    let offended = offended_names
        .iter()
        .map(|x| format!("<code>{}</code>", encode_text(x)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut text = format!("Oops! {offender} mentioned {offended}, who asked not to be mentioned.");

    let sanctions = sanctions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" and ");
    text.push_str(&format!(" For that, {offender} gets {sanctions}."));

    if sanctions.contains("a warning") {
        text.push_str(" Don't do that again!");
    }

    if !enforced {
        text.push_str(concat!(
            "\n\n<i>Could not restrict the user. ",
            "Is this bot an admin with the ability to restrict members?</i>"
        ));
    }

    text
}

/// Send a message with HTML formatting, replying to nothing in particular.
pub async fn send_html(bot: &Bot, chat_id: ChatId, text: &str) -> Result<(), RequestError> {
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}
