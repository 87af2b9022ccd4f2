use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row};
use teloxide::types::{ChatId, UserId};

use super::Database;
use crate::{sanctions::ViolationRecord, store::ViolationStore};

fn record_from_row(row: &SqliteRow) -> Result<ViolationRecord, sqlx::Error> {
    let mentions: String = row.try_get("last_offended_mentions")?;
    let mentions: Vec<u64> =
        serde_json::from_str(&mentions).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(ViolationRecord {
        last_active_date: row.try_get::<NaiveDate, _>("last_active_date")?,
        violations_today: row.try_get("violations_today")?,
        violations_month: row.try_get("violations_month")?,
        violations_total: row.try_get("violations_total")?,
        last_offended_mentions: mentions.into_iter().map(UserId).collect(),
    })
}

impl ViolationStore for Database {
    async fn get_violations(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> crate::Result<Option<ViolationRecord>> {
        let row = sqlx::query(
            "SELECT last_active_date, violations_today, violations_month, violations_total, last_offended_mentions
            FROM violations
            WHERE chat_id=? AND user_id=?;",
        )
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn upsert_violations(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        record: &ViolationRecord,
    ) -> crate::Result<()> {
        let mentions: Vec<u64> = record.last_offended_mentions.iter().map(|x| x.0).collect();
        let mentions = serde_json::to_string(&mentions)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query(
            "INSERT INTO violations(chat_id, user_id, last_active_date, violations_today, violations_month, violations_total, last_offended_mentions)
            VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT DO
            UPDATE SET
                last_active_date=excluded.last_active_date,
                violations_today=excluded.violations_today,
                violations_month=excluded.violations_month,
                violations_total=excluded.violations_total,
                last_offended_mentions=excluded.last_offended_mentions;",
        )
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .bind(record.last_active_date)
        .bind(record.violations_today)
        .bind(record.violations_month)
        .bind(record.violations_total)
        .bind(mentions)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn top_violators(&self, chat_id: ChatId, limit: u32) -> crate::Result<Vec<(UserId, u32)>> {
        Ok(sqlx::query(
            "SELECT user_id, violations_total FROM violations
            WHERE chat_id=?
            ORDER BY violations_total DESC, user_id ASC
            LIMIT ?;",
        )
        .bind(chat_id.0)
        .bind(limit)
        .map(|row: SqliteRow| {
            (
                UserId(row.get::<i64, _>("user_id") as u64),
                row.get::<u32, _>("violations_total"),
            )
        })
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_mention_ban(&self, chat_id: ChatId, user_id: UserId) -> crate::Result<bool> {
        let banned = sqlx::query("SELECT banned FROM mention_bans WHERE chat_id=? AND user_id=?;")
            .bind(chat_id.0)
            .bind(user_id.0 as i64)
            .map(|row: SqliteRow| row.get::<bool, _>(0))
            .fetch_optional(&self.pool)
            .await?;
        Ok(banned.unwrap_or(false))
    }

    async fn set_mention_ban(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        banned: bool,
    ) -> crate::Result<()> {
        sqlx::query(
            "INSERT INTO mention_bans(chat_id, user_id, banned)
            VALUES (?, ?, ?)
        ON CONFLICT DO
            UPDATE SET banned=excluded.banned;",
        )
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .bind(banned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mention_banned_users(&self, chat_id: ChatId) -> crate::Result<Vec<UserId>> {
        Ok(
            sqlx::query("SELECT user_id FROM mention_bans WHERE chat_id=? AND banned=1 ORDER BY user_id;")
                .bind(chat_id.0)
                .map(|row: SqliteRow| UserId(row.get::<i64, _>(0) as u64))
                .fetch_all(&self.pool)
                .await?,
        )
    }
}
