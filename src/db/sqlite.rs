use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, migrate::MigrateDatabase};
use std::collections::BTreeSet;

use super::{PollStore, normalize_options};
use crate::error::StoreError;
use crate::models::{Poll, PollOption, Tier};

const POLL_COLUMNS: &str = "id, question, options, votes, voter_ips, duration_ms, created_by, \
                            user_type, created_at, expires_at, ended_at, is_active, version";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        let in_memory = db_url.contains(":memory:");

        // Create database file if it doesn't exist
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database at {}", db_url);
            Sqlite::create_database(db_url).await?;
        }

        // An in-memory database lives and dies with its single connection
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(db_url).await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                options TEXT NOT NULL,
                votes TEXT,
                voter_ips TEXT NOT NULL DEFAULT '[]',
                duration_ms INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                user_type TEXT NOT NULL DEFAULT 'default',
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                ended_at INTEGER,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                version INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_polls_created_by ON polls(created_by);")
            .execute(pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_polls_active ON polls(is_active, ended_at);")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn fetch_polls(&self, sql: &str, bind: Option<&str>) -> Result<Vec<Poll>, StoreError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(poll_from_row)
            .collect()
    }
}

fn millis_to_datetime(id: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("timestamp out of range: {millis}"),
    })
}

// The one place stored rows become canonical polls
fn poll_from_row(row: &SqliteRow) -> Result<Poll, StoreError> {
    let id: String = row.try_get("id")?;
    let options_json: String = row.try_get("options")?;
    let legacy_votes: Option<String> = row.try_get("votes")?;
    let voters_json: String = row.try_get("voter_ips")?;
    let user_type: String = row.try_get("user_type")?;
    let created_at: i64 = row.try_get("created_at")?;
    let ended_at: Option<i64> = row.try_get("ended_at")?;

    let options = normalize_options(&options_json, legacy_votes.as_deref())?;
    let voters: BTreeSet<String> = serde_json::from_str(&voters_json)?;
    let tier = user_type
        .parse::<Tier>()
        .map_err(|reason| StoreError::Corrupt { id: id.clone(), reason })?;

    Ok(Poll {
        question: row.try_get("question")?,
        options,
        created_by: row.try_get("created_by")?,
        tier,
        created_at: millis_to_datetime(&id, created_at)?,
        duration_ms: row.try_get("duration_ms")?,
        active: row.try_get("is_active")?,
        ended_at: ended_at.map(|ms| millis_to_datetime(&id, ms)).transpose()?,
        voters,
        version: row.try_get("version")?,
        id,
    })
}

#[async_trait]
impl PollStore for SqliteStore {
    async fn insert(&self, poll: &Poll) -> Result<(), StoreError> {
        let voters: Vec<&String> = poll.voters.iter().collect();
        let result = sqlx::query(
            r#"
            INSERT INTO polls (id, question, options, votes, voter_ips, duration_ms, created_by,
                               user_type, created_at, expires_at, ended_at, is_active, version)
            VALUES (?, ?, ?, '{}', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.question)
        .bind(serde_json::to_string(&poll.options)?)
        .bind(serde_json::to_string(&voters)?)
        .bind(poll.duration_ms)
        .bind(&poll.created_by)
        .bind(poll.tier.as_str())
        .bind(poll.created_at.timestamp_millis())
        .bind(poll.expires_at().timestamp_millis())
        .bind(poll.ended_at.map(|t| t.timestamp_millis()))
        .bind(poll.active)
        .bind(poll.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(poll.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Poll>, StoreError> {
        let sql = format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(poll_from_row).transpose()
    }

    async fn update_vote_state(
        &self,
        id: &str,
        expected_version: i64,
        options: &[PollOption],
        voter: &str,
    ) -> Result<Poll, StoreError> {
        // Counters are rewritten in canonical form and the legacy map cleared
        let sql = format!(
            r#"
            UPDATE polls
            SET options = ?, votes = '{{}}', voter_ips = json_insert(voter_ips, '$[#]', ?),
                version = version + 1
            WHERE id = ? AND version = ?
            RETURNING {POLL_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(serde_json::to_string(options)?)
            .bind(voter)
            .bind(id)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => poll_from_row(&row),
            None => Err(StoreError::Conflict(id.to_string())),
        }
    }

    async fn mark_ended(&self, id: &str, ended_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE polls
            SET is_active = FALSE, ended_at = ?, version = version + 1
            WHERE id = ? AND is_active = TRUE
            "#,
        )
        .bind(ended_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_active(&self) -> Result<Vec<Poll>, StoreError> {
        let sql = format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE is_active = TRUE ORDER BY created_at DESC"
        );
        self.fetch_polls(&sql, None).await
    }

    async fn list_ended(&self, limit: usize) -> Result<Vec<Poll>, StoreError> {
        let sql = format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE is_active = FALSE ORDER BY ended_at DESC LIMIT ?"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(poll_from_row)
            .collect()
    }

    async fn list_by_creator(&self, creator: &str) -> Result<Vec<Poll>, StoreError> {
        let sql = format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE created_by = ? ORDER BY created_at DESC"
        );
        self.fetch_polls(&sql, Some(creator)).await
    }

    async fn purge_ended(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut purged = 0;
        for tier in Tier::ALL {
            let cutoff = now - tier.retention();
            let result = sqlx::query(
                r#"
                DELETE FROM polls
                WHERE is_active = FALSE AND user_type = ? AND ended_at IS NOT NULL AND ended_at < ?
                "#,
            )
            .bind(tier.as_str())
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
            purged += result.rows_affected();
        }
        Ok(purged)
    }
}
