mod media_bans;
mod violations;

pub use media_bans::MediaBan;

use std::{str::FromStr, sync::Arc};

use chrono::Utc;
pub use sqlx::Error;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Executor, Row, Sqlite,
};
use teloxide::types::{ChatId, UserId};

use crate::store::{Announcement, AnnouncementQueue, ChatDirectory, ErrorTracker, UsernameStore};

type Pool = sqlx::Pool<Sqlite>;

pub struct Database {
    pool: Pool,
}

impl Database {
    /// Connect to the database at `path` (an sqlx connection string like
    /// `sqlite:antispam_devilbot.sqlite`), creating it and its tables if needed.
    pub async fn new(path: &str) -> Result<Arc<Database>, Error> {
        if !Sqlite::database_exists(path).await.unwrap_or(false) {
            Sqlite::create_database(path).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .connect_with(
                SqliteConnectOptions::from_str(path)?
                    .pragma("cache_size", "-32768")
                    .busy_timeout(std::time::Duration::from_secs(600)),
            )
            .await?;

        Self::create_tables(&pool).await?;

        Ok(Arc::new(Database { pool }))
    }

    /// Fresh database that lives only as long as this object.
    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Database, Error> {
        // Every connection to `:memory:` is its own database, so there must be exactly one,
        // and it must never be closed.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        Self::create_tables(&pool).await?;

        Ok(Database { pool })
    }

    async fn create_tables(pool: &Pool) -> Result<(), Error> {
        // VIOLATIONS:
        // chat_id, user_id (primary key together)
        // last_active_date (date in UTC, like "2024-05-01")
        // violations_today, violations_month, violations_total (counters)
        // last_offended_mentions (JSON array of user IDs)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS violations (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                last_active_date TEXT NOT NULL,
                violations_today INTEGER NOT NULL,
                violations_month INTEGER NOT NULL,
                violations_total INTEGER NOT NULL,
                last_offended_mentions TEXT NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            ) STRICT;",
        ))
        .await?;

        // MENTION_BANS:
        // chat_id, user_id (primary key together)
        // banned (0 for no, 1 for yes)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS mention_bans (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                banned INTEGER NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            ) STRICT;",
        ))
        .await?;

        // CHATS:
        // id (key, increasing in order of insertion)
        // chat_id (unique)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL UNIQUE
            ) STRICT;",
        ))
        .await?;

        // ANNOUNCEMENTS:
        // id (key, increasing in order of insertion)
        // text
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS announcements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL
            ) STRICT;",
        ))
        .await?;

        // USERNAMES:
        // user_id (unique primary key)
        // username (lowercase, without the @)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS usernames (
                user_id INTEGER PRIMARY KEY NOT NULL,
                username TEXT NOT NULL COLLATE NOCASE
            ) STRICT;",
        ))
        .await?;

        // ERRORS:
        // id (key)
        // name (short description)
        // details
        // reported_at (date+time in UTC)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                details TEXT NOT NULL,
                reported_at TEXT NOT NULL
            ) STRICT;",
        ))
        .await?;

        // MEDIA_BANS:
        // chat_id, user_id (primary key together)
        // start_at, until (unix timestamps)
        // applied (0 if it still needs to be put in effect, 1 if it's done)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS media_bans (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                start_at INTEGER NOT NULL,
                until INTEGER NOT NULL,
                applied INTEGER NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            ) STRICT;",
        ))
        .await?;

        pool.execute(sqlx::query(
            "CREATE INDEX IF NOT EXISTS usernames_username ON usernames(username);",
        ))
        .await?;

        Ok(())
    }

    /// Amount of errors reported and not yet cleared.
    pub async fn error_count(&self) -> Result<i64, Error> {
        sqlx::query("SELECT COUNT(*) FROM errors;")
            .map(|row: SqliteRow| row.get::<i64, _>(0))
            .fetch_one(&self.pool)
            .await
    }

    /// Latest reported error, if any. Returns its name and details.
    pub async fn latest_error(&self) -> Result<Option<(String, String)>, Error> {
        sqlx::query("SELECT name, details FROM errors ORDER BY id DESC LIMIT 1;")
            .map(|row: SqliteRow| (row.get("name"), row.get("details")))
            .fetch_optional(&self.pool)
            .await
    }

    /// Returns `true` if the database answers queries.
    pub async fn is_connected(&self) -> bool {
        sqlx::query("SELECT 1;").execute(&self.pool).await.is_ok()
    }

    pub async fn clear_errors(&self) -> Result<(), Error> {
        sqlx::query("DELETE FROM errors;")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl ChatDirectory for Database {
    async fn list_chats(&self) -> crate::Result<Vec<ChatId>> {
        Ok(sqlx::query("SELECT chat_id FROM chats ORDER BY id;")
            .map(|row: SqliteRow| ChatId(row.get(0)))
            .fetch_all(&self.pool)
            .await?)
    }

    async fn add_chat(&self, chat_id: ChatId) -> crate::Result<()> {
        log::info!("Adding chat {chat_id} to the database");
        sqlx::query("INSERT INTO chats(chat_id) VALUES (?) ON CONFLICT DO NOTHING;")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_chat(&self, chat_id: ChatId) -> crate::Result<()> {
        log::info!("Removing chat {chat_id} from the database");
        sqlx::query("DELETE FROM chats WHERE chat_id=?;")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn migrate_chat(&self, from: ChatId, to: ChatId) -> crate::Result<()> {
        log::info!("Migrating chat {from} to {to}");
        let mut tx = self.pool.begin().await?;

        // If there's somehow already data under the new ID, that data wins.
        for table in ["chats", "violations", "mention_bans", "media_bans"] {
            sqlx::query(&format!(
                "UPDATE OR IGNORE {table} SET chat_id=? WHERE chat_id=?;"
            ))
            .bind(to.0)
            .bind(from.0)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!("DELETE FROM {table} WHERE chat_id=?;"))
                .bind(from.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

impl AnnouncementQueue for Database {
    async fn list_pending(&self) -> crate::Result<Vec<Announcement>> {
        Ok(sqlx::query("SELECT id, text FROM announcements ORDER BY id;")
            .map(|row: SqliteRow| Announcement {
                id: row.get("id"),
                text: row.get("text"),
            })
            .fetch_all(&self.pool)
            .await?)
    }

    async fn push_announcement(&self, text: &str) -> crate::Result<i64> {
        let id = sqlx::query("INSERT INTO announcements(text) VALUES (?) RETURNING id;")
            .bind(text)
            .map(|row: SqliteRow| row.get::<i64, _>(0))
            .fetch_one(&self.pool)
            .await?;
        log::info!("Queued announcement {id}");
        Ok(id)
    }

    async fn delete_announcement(&self, id: i64) -> crate::Result<()> {
        sqlx::query("DELETE FROM announcements WHERE id=?;")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl UsernameStore for Database {
    async fn get_username(&self, user_id: UserId) -> crate::Result<Option<String>> {
        Ok(sqlx::query("SELECT username FROM usernames WHERE user_id=?;")
            .bind(user_id.0 as i64)
            .map(|row: SqliteRow| row.get::<String, _>(0))
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_username(&self, username: &str) -> crate::Result<Option<UserId>> {
        Ok(sqlx::query("SELECT user_id FROM usernames WHERE username=?;")
            .bind(username)
            .map(|row: SqliteRow| UserId(row.get::<i64, _>(0) as u64))
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_username(&self, user_id: UserId, username: &str) -> crate::Result<()> {
        let mut tx = self.pool.begin().await?;

        // Usernames are unique; whoever had it before doesn't anymore.
        sqlx::query("DELETE FROM usernames WHERE username=? AND user_id!=?;")
            .bind(username)
            .bind(user_id.0 as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO usernames(user_id, username)
            VALUES (?, ?)
        ON CONFLICT DO
            UPDATE SET username=excluded.username;",
        )
        .bind(user_id.0 as i64)
        .bind(username)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

impl ErrorTracker for Database {
    async fn report_error(&self, name: &str, details: &str) {
        log::info!("Reporting new error: {name}");
        let result = sqlx::query("INSERT INTO errors(name, details, reported_at) VALUES (?, ?, ?);")
            .bind(name)
            .bind(details)
            .bind(Utc::now())
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            log::error!("Failed to report error \"{name}\" to the database: {e}\n{details}");
        }
    }
}
