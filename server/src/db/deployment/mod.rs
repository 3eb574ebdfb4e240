// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The Deployment & Sync Store (component D, spec §4.5): upsert-by-timestamp
//! approval state plus per-client last-sync bookkeeping, backed by a second
//! `sqlx` sqlite database (`deploySync.db`).

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tracing::instrument;

use crate::db::{Decoder, Encoding};
use crate::deployment::{Action, ComputerSync, Deployment};
use crate::identity::{Index, InvalidIndex};

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);

        Self::connect(options).await
    }

    pub async fn memory() -> Result<Self, Error> {
        Self::connect(SqliteConnectOptions::new().filename(":memory:")).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, Error> {
        let pool = sqlx::SqlitePool::connect_with(options).await?;

        sqlx::migrate!("src/db/deployment/migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Upsert by `revision_index`; the new row wins iff its `last_change_time`
    /// is strictly greater than the stored one (spec §4.5).
    #[instrument(skip(self, entry))]
    pub async fn save_deployment(&self, entry: &Deployment) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO deployments (revision_index, action, deadline, last_change_time)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(revision_index) DO UPDATE SET
                action = excluded.action,
                deadline = excluded.deadline,
                last_change_time = excluded.last_change_time
            WHERE excluded.last_change_time > deployments.last_change_time;
            ",
        )
        .bind(i64::from(entry.revision_index))
        .bind(entry.action.encode())
        .bind(entry.deadline)
        .bind(entry.last_change_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_deployment(&self, revision_index: Index) -> Result<(), Error> {
        sqlx::query("DELETE FROM deployments WHERE revision_index = ?;")
            .bind(i64::from(revision_index))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_deployment(&self, revision_index: Index) -> Result<Option<Deployment>, Error> {
        let row = sqlx::query_as::<_, encoding::Deployment>(
            "
            SELECT revision_index, action, deadline, last_change_time
            FROM deployments
            WHERE revision_index = ?;
            ",
        )
        .bind(i64::from(revision_index))
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// All deployment rows whose `last_change_time` is strictly newer than
    /// `since`, used to build the changed-deployments diff (spec §4.4).
    pub async fn deployments_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<Deployment>, Error> {
        let rows = sqlx::query_as::<_, encoding::Deployment>(
            "
            SELECT revision_index, action, deadline, last_change_time
            FROM deployments
            WHERE last_change_time > ?;
            ",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Upsert by `computer_id`; the new row wins iff newer (spec §4.5).
    #[instrument(skip(self))]
    pub async fn update_computer_sync(&self, computer_id: &str, time: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO computer_sync_status (computer_id, last_sync_time)
            VALUES (?, ?)
            ON CONFLICT(computer_id) DO UPDATE SET
                last_sync_time = excluded.last_sync_time
            WHERE excluded.last_sync_time > computer_sync_status.last_sync_time;
            ",
        )
        .bind(computer_id)
        .bind(time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_computer_sync(&self, computer_id: &str) -> Result<Option<ComputerSync>, Error> {
        let row = sqlx::query_as::<_, encoding::ComputerSync>(
            "
            SELECT computer_id, last_sync_time
            FROM computer_sync_status
            WHERE computer_id = ?;
            ",
        )
        .bind(computer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ComputerSync {
            computer_id: row.computer_id,
            last_sync_time: row.last_sync_time,
        }))
    }

    pub async fn delete_computer(&self, computer_id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM computer_sync_status WHERE computer_id = ?;")
            .bind(computer_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("row not found")]
    RowNotFound,
    #[error("sqlx")]
    Sqlx(#[source] sqlx::Error),
    #[error("sqlx migration")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored revision index")]
    InvalidIndex(#[from] InvalidIndex),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Error::RowNotFound,
            error => Error::Sqlx(error),
        }
    }
}

mod encoding {
    use chrono::{DateTime, Utc};
    use sqlx::FromRow;

    use crate::db::Decoder;
    use crate::deployment::Action;
    use crate::identity::Index;

    #[derive(FromRow)]
    pub struct Deployment {
        pub revision_index: i64,
        pub action: Decoder<Action>,
        pub deadline: Option<DateTime<Utc>>,
        pub last_change_time: DateTime<Utc>,
    }

    impl TryFrom<Deployment> for crate::deployment::Deployment {
        type Error = super::Error;

        fn try_from(row: Deployment) -> Result<Self, Self::Error> {
            Ok(Self {
                revision_index: Index::try_from(row.revision_index)?,
                action: row.action.0,
                deadline: row.deadline,
                last_change_time: row.last_change_time,
            })
        }
    }

    #[derive(FromRow)]
    pub struct ComputerSync {
        pub computer_id: String,
        pub last_sync_time: DateTime<Utc>,
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;

    fn deployment(index: u32, action: Action, last_change_time: DateTime<Utc>) -> Deployment {
        Deployment {
            revision_index: Index::new(index).unwrap(),
            action,
            deadline: None,
            last_change_time,
        }
    }

    #[tokio::test]
    async fn newer_last_change_time_wins() {
        let db = Database::memory().await.unwrap();
        let now = Utc::now();

        db.save_deployment(&deployment(1, Action::Install, now)).await.unwrap();
        db.save_deployment(&deployment(1, Action::PreDeploymentCheck, now - Duration::seconds(5)))
            .await
            .unwrap();

        let stored = db.get_deployment(Index::new(1).unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.action, Action::Install);

        db.save_deployment(&deployment(1, Action::Bundle, now + Duration::seconds(5)))
            .await
            .unwrap();
        let stored = db.get_deployment(Index::new(1).unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.action, Action::Bundle);
    }

    #[tokio::test]
    async fn computer_sync_upsert_newer_wins() {
        let db = Database::memory().await.unwrap();
        let now = Utc::now();

        db.update_computer_sync("computer-a", now).await.unwrap();
        db.update_computer_sync("computer-a", now - Duration::seconds(5)).await.unwrap();

        let row = db.get_computer_sync("computer-a").await.unwrap().unwrap();
        assert_eq!(row.last_sync_time, now);
    }

    #[tokio::test]
    async fn changed_since_filters_by_timestamp() {
        let db = Database::memory().await.unwrap();
        let now = Utc::now();

        db.save_deployment(&deployment(1, Action::Install, now - Duration::days(1)))
            .await
            .unwrap();
        db.save_deployment(&deployment(2, Action::Bundle, now)).await.unwrap();

        let changed = db.deployments_changed_since(now - Duration::hours(1)).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].revision_index, Index::new(2).unwrap());
    }
}
