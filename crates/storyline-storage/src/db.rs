//! SQLite Story Database
//!
//! Implements the [`StoryDatabase`] trait over SQLite. For a client-side
//! cache SQLite is the natural fit: zero-configuration, embedded, ACID, and
//! the whole working set is indexed lookups.
//!
//! ## Row lifetimes
//!
//! Stories that are owned or pinned persist indefinitely (`expires_at = 0`).
//! Foreign non-pinned stories carry their wall-clock `expire_date` in
//! `expires_at`; the engine's background sweep reads them back with
//! [`StoryDatabase::get_expiring_stories`] and tears them down.
//!
//! ## List pagination
//!
//! Active-list rows mirror the packed `private_order` key, so a list page is
//! a single indexed range scan ordered by `(private_order, owner_id)`
//! descending, keyed by the cursor of the last materialised row.
//!
//! ## Thread safety
//!
//! `SqliteStoryDatabase` is `Send + Sync`; the connection pool handles
//! concurrent access. Use [`SqliteStoryDatabase::new_in_memory`] in tests.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use storyline_core::{StoryFullId, StoryId, StoryListId, UserId};

/// One stored story row.
#[derive(Debug, Clone)]
pub struct StoryRow {
    pub story_full_id: StoryFullId,
    pub data: Bytes,
}

/// One stored active-list row, with the order key it was saved under.
#[derive(Debug, Clone)]
pub struct ActiveStoriesRow {
    pub owner_id: UserId,
    pub order: i64,
    pub data: Bytes,
}

/// Async story persistence, as used by the engine. Blobs are opaque here.
#[async_trait]
pub trait StoryDatabase: Send + Sync {
    async fn get_story(&self, story_full_id: StoryFullId) -> Result<Option<Bytes>>;

    async fn add_story(
        &self,
        story_full_id: StoryFullId,
        expires_at: i64,
        notification_id: i64,
        data: &[u8],
    ) -> Result<()>;

    async fn delete_story(&self, story_full_id: StoryFullId) -> Result<()>;

    async fn get_active_stories(&self, owner_id: UserId) -> Result<Option<Bytes>>;

    async fn add_active_stories(
        &self,
        owner_id: UserId,
        list_id: Option<StoryListId>,
        order: i64,
        data: &[u8],
    ) -> Result<()>;

    async fn delete_active_stories(&self, owner_id: UserId) -> Result<()>;

    /// Reads the next page of a list, strictly after the `(order_cursor,
    /// owner_cursor)` position, in display order.
    async fn get_active_story_list(
        &self,
        list_id: StoryListId,
        order_cursor: i64,
        owner_cursor: UserId,
        limit: u32,
    ) -> Result<Vec<ActiveStoriesRow>>;

    async fn get_active_story_list_state(&self, list_id: StoryListId) -> Result<Option<Bytes>>;

    async fn add_active_story_list_state(&self, list_id: StoryListId, data: &[u8]) -> Result<()>;

    /// Story rows whose TTL elapsed before `before`, oldest first.
    async fn get_expiring_stories(&self, before: i64, limit: u32) -> Result<Vec<StoryRow>>;
}

/// SQLite-backed [`StoryDatabase`].
pub struct SqliteStoryDatabase {
    pool: SqlitePool,
}

impl SqliteStoryDatabase {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

fn list_column(list_id: Option<StoryListId>) -> i64 {
    match list_id {
        Some(list_id) => list_id.index() as i64,
        None => -1,
    }
}

#[async_trait]
impl StoryDatabase for SqliteStoryDatabase {
    async fn get_story(&self, story_full_id: StoryFullId) -> Result<Option<Bytes>> {
        let row = sqlx::query("SELECT data FROM stories WHERE owner_id = ? AND story_id = ?")
            .bind(story_full_id.owner_id.0)
            .bind(i64::from(story_full_id.story_id.0))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Bytes::from(r.get::<Vec<u8>, _>(0))))
    }

    async fn add_story(
        &self,
        story_full_id: StoryFullId,
        expires_at: i64,
        notification_id: i64,
        data: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stories (owner_id, story_id, expires_at, notification_id, data)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (owner_id, story_id) DO UPDATE SET
                expires_at = excluded.expires_at,
                notification_id = excluded.notification_id,
                data = excluded.data
            "#,
        )
        .bind(story_full_id.owner_id.0)
        .bind(i64::from(story_full_id.story_id.0))
        .bind(expires_at)
        .bind(notification_id)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_story(&self, story_full_id: StoryFullId) -> Result<()> {
        sqlx::query("DELETE FROM stories WHERE owner_id = ? AND story_id = ?")
            .bind(story_full_id.owner_id.0)
            .bind(i64::from(story_full_id.story_id.0))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_active_stories(&self, owner_id: UserId) -> Result<Option<Bytes>> {
        let row = sqlx::query("SELECT data FROM active_stories WHERE owner_id = ?")
            .bind(owner_id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Bytes::from(r.get::<Vec<u8>, _>(0))))
    }

    async fn add_active_stories(
        &self,
        owner_id: UserId,
        list_id: Option<StoryListId>,
        order: i64,
        data: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_stories (owner_id, list_id, private_order, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (owner_id) DO UPDATE SET
                list_id = excluded.list_id,
                private_order = excluded.private_order,
                data = excluded.data
            "#,
        )
        .bind(owner_id.0)
        .bind(list_column(list_id))
        .bind(order)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_active_stories(&self, owner_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM active_stories WHERE owner_id = ?")
            .bind(owner_id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_active_story_list(
        &self,
        list_id: StoryListId,
        order_cursor: i64,
        owner_cursor: UserId,
        limit: u32,
    ) -> Result<Vec<ActiveStoriesRow>> {
        let rows = sqlx::query(
            r#"
            SELECT owner_id, private_order, data
            FROM active_stories
            WHERE list_id = ?
              AND (private_order < ? OR (private_order = ? AND owner_id < ?))
            ORDER BY private_order DESC, owner_id DESC
            LIMIT ?
            "#,
        )
        .bind(list_id.index() as i64)
        .bind(order_cursor)
        .bind(order_cursor)
        .bind(owner_cursor.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ActiveStoriesRow {
                owner_id: UserId(r.get::<i64, _>(0)),
                order: r.get::<i64, _>(1),
                data: Bytes::from(r.get::<Vec<u8>, _>(2)),
            })
            .collect())
    }

    async fn get_active_story_list_state(&self, list_id: StoryListId) -> Result<Option<Bytes>> {
        let row = sqlx::query("SELECT data FROM story_list_state WHERE list_id = ?")
            .bind(list_id.index() as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Bytes::from(r.get::<Vec<u8>, _>(0))))
    }

    async fn add_active_story_list_state(&self, list_id: StoryListId, data: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO story_list_state (list_id, data)
            VALUES (?, ?)
            ON CONFLICT (list_id) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(list_id.index() as i64)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_expiring_stories(&self, before: i64, limit: u32) -> Result<Vec<StoryRow>> {
        let rows = sqlx::query(
            r#"
            SELECT owner_id, story_id, data
            FROM stories
            WHERE expires_at > 0 AND expires_at <= ?
            ORDER BY expires_at
            LIMIT ?
            "#,
        )
        .bind(before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoryRow {
                story_full_id: StoryFullId::new(
                    UserId(r.get::<i64, _>(0)),
                    StoryId(r.get::<i64, _>(1) as i32),
                ),
                data: Bytes::from(r.get::<Vec<u8>, _>(2)),
            })
            .collect())
    }
}
