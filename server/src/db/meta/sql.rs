// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The embedded-SQL metadata backend (spec §4.1): one table, write-ahead
//! logging enabled for concurrent readers, explicit transactions for
//! snapshot-consistent enumeration.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Acquire, Pool, Sqlite};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use super::Error;
use crate::db::{Decoder, Encoding};
use crate::identity::{Identity, Index};
use crate::package::{FileReference, Package, PackageKind};

#[derive(Debug, Clone)]
pub struct Database {
    pool: Arc<Mutex<Pool<Sqlite>>>,
}

impl Database {
    pub async fn new(path: impl AsRef<Path>, read_only: bool) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .read_only(read_only)
            .journal_mode(SqliteJournalMode::Wal);

        Self::connect(options).await
    }

    pub async fn memory() -> Result<Self, Error> {
        Self::connect(SqliteConnectOptions::new().filename(":memory:")).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, Error> {
        let pool = sqlx::SqlitePool::connect_with(options).await?;

        sqlx::migrate!("src/db/meta/migrations").run(&pool).await?;

        Ok(Self {
            pool: Arc::new(Mutex::new(pool)),
        })
    }

    #[instrument(skip(self, package))]
    pub async fn add_package(&self, package: &Package) -> Result<Index, Error> {
        let pool = self.pool.lock().await;

        if let Some(index) = index_of(&pool, package.identity).await? {
            return Ok(index);
        }

        let prerequisites = serde_json::to_string(&package.prerequisites)?;
        let bundled_with = serde_json::to_string(&package.bundled_with)?;
        let bundled_updates = serde_json::to_string(&package.bundled_updates)?;
        let files = serde_json::to_string(&package.files)?;
        let hardware_ids = serde_json::to_string(&package.hardware_ids)?;

        let (idx,): (i64,) = sqlx::query_as(
            "
            INSERT INTO packages (
                guid, revision, kind, title, kb_article_id,
                prerequisites, bundled_with, bundled_updates, files, hardware_ids, raw_xml
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING idx;
            ",
        )
        .bind(package.identity.id)
        .bind(package.identity.revision as i64)
        .bind(package.kind.encode())
        .bind(&package.title)
        .bind(&package.kb_article_id)
        .bind(prerequisites)
        .bind(bundled_with)
        .bind(bundled_updates)
        .bind(files)
        .bind(hardware_ids)
        .bind(&package.raw_xml)
        .fetch_one(&*pool)
        .await?;

        Index::try_from(idx).map_err(Error::from)
    }

    pub async fn get_metadata(&self, index: Index) -> Result<Vec<u8>, Error> {
        let pool = self.pool.lock().await;

        let (raw_xml,): (String,) = sqlx::query_as("SELECT raw_xml FROM packages WHERE idx = ?;")
            .bind(i64::from(index))
            .fetch_one(&*pool)
            .await?;

        Ok(raw_xml.into_bytes())
    }

    pub async fn get_files(&self, index: Index) -> Result<Vec<FileReference>, Error> {
        let pool = self.pool.lock().await;

        let (files,): (String,) = sqlx::query_as("SELECT files FROM packages WHERE idx = ?;")
            .bind(i64::from(index))
            .fetch_one(&*pool)
            .await?;

        Ok(serde_json::from_str(&files)?)
    }

    pub async fn get_package_by_index(&self, index: Index) -> Result<Package, Error> {
        let pool = self.pool.lock().await;
        fetch_row(&pool, "idx", i64::from(index)).await?.try_into()
    }

    pub async fn get_package_by_identity(&self, identity: Identity) -> Result<Package, Error> {
        let pool = self.pool.lock().await;

        let row = sqlx::query_as::<_, encoding::Row>(
            "
            SELECT guid, revision, kind, title, kb_article_id,
                   prerequisites, bundled_with, bundled_updates, files, hardware_ids, raw_xml
            FROM packages
            WHERE guid = ? AND revision = ?;
            ",
        )
        .bind(identity.id)
        .bind(identity.revision as i64)
        .fetch_one(&*pool)
        .await?;

        row.try_into()
    }

    pub async fn get_package_index(&self, identity: Identity) -> Result<Option<Index>, Error> {
        let pool = self.pool.lock().await;
        index_of(&pool, identity).await
    }

    pub async fn get_package_identity(&self, index: Index) -> Result<Identity, Error> {
        let pool = self.pool.lock().await;

        let (guid, revision): (Uuid, i64) = sqlx::query_as("SELECT guid, revision FROM packages WHERE idx = ?;")
            .bind(i64::from(index))
            .fetch_one(&*pool)
            .await?;

        Ok(Identity::new(guid, revision as u32))
    }

    pub async fn contains_package(&self, identity: Identity) -> Result<bool, Error> {
        Ok(self.get_package_index(identity).await?.is_some())
    }

    /// Durably persists pending mutations. WAL checkpoint is sqlite's
    /// equivalent of an explicit flush for a pool that already commits every
    /// statement transactionally.
    pub async fn flush(&self) -> Result<(), Error> {
        let pool = self.pool.lock().await;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);").execute(&*pool).await?;
        Ok(())
    }

    /// Snapshot-consistent enumeration of every stored package (index and
    /// contents), including superseded revisions (supersedence is resolved
    /// by the caller).
    pub async fn enumerate(&self) -> Result<Vec<(Index, Package)>, Error> {
        let pool = self.pool.lock().await;
        let mut transaction = pool.begin().await?;

        let rows = sqlx::query_as::<_, encoding::IndexedRow>(
            "
            SELECT idx, guid, revision, kind, title, kb_article_id,
                   prerequisites, bundled_with, bundled_updates, files, hardware_ids, raw_xml
            FROM packages;
            ",
        )
        .fetch_all(transaction.acquire().await?)
        .await?;

        transaction.commit().await?;

        rows.into_iter()
            .map(|row| {
                let index = Index::try_from(row.idx)?;
                let package = row.row.try_into()?;
                Ok((index, package))
            })
            .collect()
    }
}

async fn index_of(pool: &Pool<Sqlite>, identity: Identity) -> Result<Option<Index>, Error> {
    let found: Option<(i64,)> = sqlx::query_as("SELECT idx FROM packages WHERE guid = ? AND revision = ?;")
        .bind(identity.id)
        .bind(identity.revision as i64)
        .fetch_optional(pool)
        .await?;

    found.map(|(idx,)| Index::try_from(idx).map_err(Error::from)).transpose()
}

async fn fetch_row(pool: &Pool<Sqlite>, column: &str, value: i64) -> Result<encoding::Row, Error> {
    let query = format!(
        "SELECT guid, revision, kind, title, kb_article_id,
                prerequisites, bundled_with, bundled_updates, files, hardware_ids, raw_xml
         FROM packages WHERE {column} = ?;"
    );

    Ok(sqlx::query_as::<_, encoding::Row>(&query).bind(value).fetch_one(pool).await?)
}

mod encoding {
    use sqlx::FromRow;
    use uuid::Uuid;

    use crate::db::Decoder;
    use crate::package::PackageKind;

    #[derive(FromRow)]
    pub struct Row {
        pub guid: Uuid,
        pub revision: i64,
        pub kind: Decoder<PackageKind>,
        pub title: String,
        pub kb_article_id: Option<String>,
        pub prerequisites: String,
        pub bundled_with: String,
        pub bundled_updates: String,
        pub files: String,
        pub hardware_ids: String,
        pub raw_xml: String,
    }

    #[derive(FromRow)]
    pub struct IndexedRow {
        pub idx: i64,
        #[sqlx(flatten)]
        pub row: Row,
    }

    impl TryFrom<Row> for crate::package::Package {
        type Error = super::Error;

        fn try_from(row: Row) -> Result<Self, Self::Error> {
            use crate::identity::Identity;

            Ok(Self {
                identity: Identity::new(row.guid, row.revision as u32),
                kind: row.kind.0,
                title: row.title,
                kb_article_id: row.kb_article_id,
                prerequisites: serde_json::from_str(&row.prerequisites)?,
                bundled_with: serde_json::from_str(&row.bundled_with)?,
                bundled_updates: serde_json::from_str(&row.bundled_updates)?,
                files: serde_json::from_str(&row.files)?,
                hardware_ids: serde_json::from_str(&row.hardware_ids)?,
                raw_xml: row.raw_xml,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::package::Prerequisite;

    fn sample_package() -> Package {
        Package {
            identity: Identity::new(Uuid::new_v4(), 1),
            kind: PackageKind::SoftwareUpdate,
            title: "Sample Update".into(),
            kb_article_id: Some("KB000001".into()),
            prerequisites: vec![Prerequisite::Simple(Uuid::new_v4())],
            bundled_with: HashSet::new(),
            bundled_updates: HashSet::new(),
            files: vec![],
            hardware_ids: vec![],
            raw_xml: "<UpdateInfo/>".into(),
        }
    }

    #[tokio::test]
    async fn add_then_round_trips_by_index_and_identity() {
        let db = Database::memory().await.unwrap();
        let package = sample_package();

        let index = db.add_package(&package).await.unwrap();

        let by_index = db.get_package_by_index(index).await.unwrap();
        assert_eq!(by_index.identity, package.identity);

        let by_identity = db.get_package_by_identity(package.identity).await.unwrap();
        assert_eq!(by_identity.title, package.title);

        assert_eq!(db.get_package_identity(index).await.unwrap(), package.identity);
        assert_eq!(db.get_package_index(package.identity).await.unwrap(), Some(index));
        assert!(db.contains_package(package.identity).await.unwrap());
    }

    #[tokio::test]
    async fn add_package_is_a_no_op_when_already_present() {
        let db = Database::memory().await.unwrap();
        let package = sample_package();

        let first = db.add_package(&package).await.unwrap();
        let second = db.add_package(&package).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(db.enumerate().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enumerate_returns_every_stored_revision() {
        let db = Database::memory().await.unwrap();
        let mut a = sample_package();
        let mut b = sample_package();
        a.identity = Identity::new(a.identity.id, 1);
        b.identity = Identity::new(a.identity.id, 2);

        db.add_package(&a).await.unwrap();
        db.add_package(&b).await.unwrap();

        assert_eq!(db.enumerate().await.unwrap().len(), 2);
    }
}
