use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use teloxide::types::{ChatId, UserId};

use super::{Database, Error};

/// A media ban that should be in effect from `start` until `until`.
///
/// Telegram keeps one set of restrictions per member, so a mute given later
/// replaces the media ban. These are kept around until they run out, so that
/// the ban can be put back once the mute is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBan {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub start: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, Error> {
    let secs: i64 = row.try_get(column)?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Decode(format!("Bad timestamp in {column}: {secs}").into()))
}

fn media_ban_from_row(row: SqliteRow) -> Result<MediaBan, Error> {
    Ok(MediaBan {
        chat_id: ChatId(row.try_get("chat_id")?),
        user_id: UserId(row.try_get::<i64, _>("user_id")? as u64),
        start: timestamp(&row, "start_at")?,
        until: timestamp(&row, "until")?,
    })
}

impl Database {
    /// Remember that the user must be media banned from `start` until `until`.
    /// `applied` is whether it's already been done.
    ///
    /// If there's a ban already, it's moved to `start` and lasts until whichever ends later.
    pub async fn schedule_media_ban(
        &self,
        ban: &MediaBan,
        applied: bool,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO media_bans(chat_id, user_id, start_at, until, applied)
            VALUES (?, ?, ?, ?, ?)
        ON CONFLICT DO
            UPDATE SET
                start_at=excluded.start_at,
                until=MAX(until, excluded.until),
                applied=excluded.applied;",
        )
        .bind(ban.chat_id.0)
        .bind(ban.user_id.0 as i64)
        .bind(ban.start.timestamp())
        .bind(ban.until.timestamp())
        .bind(applied)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The user just got a mute that replaced their media ban, if any.
    /// Put the ban back once the mute is over at `mute_until`.
    pub async fn postpone_media_ban(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        mute_until: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE media_bans SET start_at=?, applied=0
            WHERE chat_id=? AND user_id=? AND until>?;",
        )
        .bind(mute_until.timestamp())
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .bind(mute_until.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Media bans that should be in effect by `now` but aren't.
    pub async fn due_media_bans(&self, now: DateTime<Utc>) -> Result<Vec<MediaBan>, Error> {
        let rows = sqlx::query(
            "SELECT chat_id, user_id, start_at, until FROM media_bans
            WHERE applied=0 AND start_at<=? AND until>?
            ORDER BY start_at;",
        )
        .bind(now.timestamp())
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(media_ban_from_row).collect()
    }

    /// When the next media ban that's not yet in effect is due.
    pub async fn next_media_ban_start(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let secs: Option<i64> =
            sqlx::query("SELECT MIN(start_at) FROM media_bans WHERE applied=0;")
                .map(|row: SqliteRow| row.get(0))
                .fetch_one(&self.pool)
                .await?;

        Ok(secs.and_then(|x| DateTime::from_timestamp(x, 0)))
    }

    pub async fn mark_media_ban_applied(&self, ban: &MediaBan) -> Result<(), Error> {
        sqlx::query("UPDATE media_bans SET applied=1 WHERE chat_id=? AND user_id=? AND start_at=?;")
            .bind(ban.chat_id.0)
            .bind(ban.user_id.0 as i64)
            .bind(ban.start.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forget media bans that are over by `now`.
    pub async fn remove_expired_media_bans(&self, now: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query("DELETE FROM media_bans WHERE until<=?;")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
