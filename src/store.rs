//! SQLite-backed message store.
//!
//! The pool is shared by the HTTP handlers, the consumer pipeline and the status
//! updater; SQLite's own locking is the only coordination between them.

use std::str::FromStr;

use chrono::Utc;
use snafu::ResultExt;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Executor, Sqlite, SqlitePool,
};

use crate::{
    config::Config,
    error::{Error, PersistenceSnafu},
    message::{DeliveryCoordinates, Message, MessageStatistics, MessageStatus, ProcessedMessage},
};

/// What a [`Store::complete_delivery`] call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Status moved to `processed` by this call
    pub status_advanced: bool,
    /// Coordinates were empty and are now set
    pub coordinates_recorded: bool,
    /// A new `processed_messages` row was written
    pub processed_row_written: bool,
}

#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let pool = match config.db_path() {
            Some(path) => {
                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true)
                    .journal_mode(SqliteJournalMode::Wal);

                SqlitePoolOptions::new().connect_with(opts).await?
            }
            None => {
                // Every connection to `:memory:` is its own database, so pin the pool to one.
                let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(opts)
                    .await?
            }
        };

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { db: pool })
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Inserts a new message. Messages always start out as `received`.
    pub async fn create(&self, content: &str, status: MessageStatus) -> Result<i64, Error> {
        if status != MessageStatus::Received {
            return Err(Error::validation(format!(
                "new messages must start as {}, got {status}",
                MessageStatus::Received
            )));
        }

        let id: i64 = sqlx::query_scalar(
            "
            INSERT INTO messages (content, created_at, status_id)
            VALUES ($1, $2, $3)
            RETURNING id
            ",
        )
        .bind(content)
        .bind(Utc::now())
        .bind(status)
        .fetch_one(&self.db)
        .await
        .context(PersistenceSnafu)?;

        Ok(id)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Message, Error> {
        sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    pub async fn list_all(&self) -> Result<Vec<Message>, Error> {
        Ok(sqlx::query_as("SELECT * FROM messages")
            .fetch_all(&self.db)
            .await?)
    }

    /// Overwrites the status unconditionally. Callers own monotonicity; the pipeline
    /// uses [`Store::advance_status`] instead.
    pub async fn update_status(&self, id: i64, status: MessageStatus) -> Result<(), Error> {
        let res = sqlx::query("UPDATE messages SET status_id = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.db)
            .await?;

        if res.rows_affected() == 0 {
            return Err(Error::message_not_found(id));
        }

        Ok(())
    }

    /// Moves the status forward only. Returns `false` when the message is already at
    /// or past `status`.
    pub async fn advance_status(&self, id: i64, status: MessageStatus) -> Result<bool, Error> {
        let res = sqlx::query("UPDATE messages SET status_id = $1 WHERE id = $2 AND status_id < $3")
            .bind(status)
            .bind(id)
            .bind(status)
            .execute(&self.db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Sets the delivery coordinates if none are recorded yet. Repeating the call, with
    /// the same or different coordinates, leaves the first ones in place.
    pub async fn record_delivery_coordinates(
        &self,
        id: i64,
        coordinates: &DeliveryCoordinates,
    ) -> Result<bool, Error> {
        let recorded = set_coordinates(&self.db, id, coordinates).await?;

        if !recorded {
            // Distinguish "already recorded" from "no such message".
            self.get_by_id(id).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Marks a message processed and records where it was delivered, in one transaction.
    ///
    /// Status only moves forward and existing coordinates are kept, so replaying the same
    /// or a duplicate record is harmless.
    pub async fn complete_delivery(
        &self,
        id: i64,
        coordinates: &DeliveryCoordinates,
        record_processed: bool,
    ) -> Result<Completion, Error> {
        // Write before any read: a deferred transaction cannot upgrade a stale WAL snapshot.
        let mut tx = self.db.begin().await?;

        let coordinates_recorded = set_coordinates(&mut *tx, id, coordinates).await?;

        let status_advanced =
            sqlx::query("UPDATE messages SET status_id = $1 WHERE id = $2 AND status_id < $3")
                .bind(MessageStatus::Processed)
                .bind(id)
                .bind(MessageStatus::Processed)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;

        if !coordinates_recorded && !status_advanced {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM messages WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(Error::message_not_found(id));
            }
        }

        let processed_row_written = if record_processed {
            insert_processed(&mut *tx, id, coordinates).await?
        } else {
            false
        };

        tx.commit().await?;

        Ok(Completion {
            status_advanced,
            coordinates_recorded,
            processed_row_written,
        })
    }

    pub async fn list_processed(&self) -> Result<Vec<ProcessedMessage>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM processed_messages ORDER BY id")
                .fetch_all(&self.db)
                .await?,
        )
    }

    /// Message counts for every known status, including statuses with no messages.
    pub async fn statistics(&self) -> Result<MessageStatistics, Error> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "
            SELECT s.status, COUNT(m.id)
            FROM message_statuses s
            LEFT JOIN messages m ON m.status_id = s.id
            GROUP BY s.id, s.status
            ORDER BY s.id
            ",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(MessageStatistics(rows.into_iter().collect()))
    }
}

/// Sets the coordinates of a message that has none yet.
async fn set_coordinates<'e, E>(
    executor: E,
    id: i64,
    coordinates: &DeliveryCoordinates,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "
        UPDATE messages
        SET kafka_topic = $1, kafka_partition = $2, kafka_offset = $3
        WHERE id = $4 AND kafka_topic IS NULL
        ",
    )
    .bind(&coordinates.topic)
    .bind(coordinates.partition)
    .bind(coordinates.offset)
    .bind(id)
    .execute(executor)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Writes the correlation row for a consumed record; an existing row wins.
async fn insert_processed<'e, E>(
    executor: E,
    id: i64,
    coordinates: &DeliveryCoordinates,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "
        INSERT OR IGNORE INTO processed_messages
            (message_id, processed_at, kafka_topic, kafka_partition, kafka_offset)
        VALUES ($1, $2, $3, $4, $5)
        ",
    )
    .bind(id)
    .bind(Utc::now())
    .bind(&coordinates.topic)
    .bind(coordinates.partition)
    .bind(coordinates.offset)
    .execute(executor)
    .await?;

    Ok(res.rows_affected() > 0)
}
