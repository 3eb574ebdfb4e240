// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The Metadata Backing Store (component B, spec §4.1): one capability set
//! (`add_package`, `get_metadata`, `get_files`, `get_package_by_{index,identity}`,
//! `get_package_index`, `get_package_identity`, `contains_package`, `flush`,
//! `enumerate`) behind three interchangeable backends. Callers hold a
//! [`Store`] and never match on which backend is attached (spec design note
//! "backing-store polymorphism").

use std::path::Path;

use thiserror::Error;

use crate::identity::{Identity, Index, InvalidIndex};
use crate::package::{FileReference, Package};

pub mod delta;
pub mod directory;
pub mod sql;

/// Which backend a metadata root should be opened with. Replaces the
/// teacher's reflective partition registration with an explicit, closed
/// enum (spec design note "dynamic dispatch over partitions").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Delta,
    Directory,
    Sql,
}

/// A metadata root opened with one of the three interchangeable backends.
#[derive(Debug)]
pub enum Store {
    Delta(delta::Store),
    Directory(directory::Store),
    Sql(sql::Database),
}

impl Store {
    pub async fn open(backend: Backend, root: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(match backend {
            Backend::Delta => Store::Delta(delta::Store::open(root.as_ref()).await?),
            Backend::Directory => Store::Directory(directory::Store::open(root.as_ref(), "default").await?),
            Backend::Sql => Store::Sql(sql::Database::new(root.as_ref(), false).await?),
        })
    }

    pub async fn add_package(&self, package: &Package) -> Result<Index, Error> {
        match self {
            Store::Delta(store) => store.add_package(package).await,
            Store::Directory(store) => store.add_package(package).await,
            Store::Sql(db) => db.add_package(package).await,
        }
    }

    pub async fn get_metadata(&self, index: Index) -> Result<Vec<u8>, Error> {
        match self {
            Store::Delta(store) => store.get_metadata(index).await,
            Store::Directory(store) => store.get_metadata(index).await,
            Store::Sql(db) => db.get_metadata(index).await,
        }
    }

    pub async fn get_files(&self, index: Index) -> Result<Vec<FileReference>, Error> {
        match self {
            Store::Delta(store) => store.get_files(index).await,
            Store::Directory(store) => store.get_files(index).await,
            Store::Sql(db) => db.get_files(index).await,
        }
    }

    pub async fn get_package_by_index(&self, index: Index) -> Result<Package, Error> {
        match self {
            Store::Delta(store) => store.get_package_by_index(index).await,
            Store::Directory(store) => store.get_package_by_index(index).await,
            Store::Sql(db) => db.get_package_by_index(index).await,
        }
    }

    pub async fn get_package_by_identity(&self, identity: Identity) -> Result<Package, Error> {
        match self {
            Store::Delta(store) => store.get_package_by_identity(identity).await,
            Store::Directory(store) => store.get_package_by_identity(identity).await,
            Store::Sql(db) => db.get_package_by_identity(identity).await,
        }
    }

    pub async fn get_package_index(&self, identity: Identity) -> Result<Option<Index>, Error> {
        match self {
            Store::Delta(store) => store.get_package_index(identity).await,
            Store::Directory(store) => store.get_package_index(identity).await,
            Store::Sql(db) => db.get_package_index(identity).await,
        }
    }

    pub async fn get_package_identity(&self, index: Index) -> Result<Identity, Error> {
        match self {
            Store::Delta(store) => store.get_package_identity(index).await,
            Store::Directory(store) => store.get_package_identity(index).await,
            Store::Sql(db) => db.get_package_identity(index).await,
        }
    }

    pub async fn contains_package(&self, identity: Identity) -> Result<bool, Error> {
        match self {
            Store::Delta(store) => store.contains_package(identity).await,
            Store::Directory(store) => store.contains_package(identity).await,
            Store::Sql(db) => db.contains_package(identity).await,
        }
    }

    /// Durably persists pending mutations (spec §4.1).
    pub async fn flush(&self) -> Result<(), Error> {
        match self {
            Store::Delta(store) => store.flush().await,
            Store::Directory(store) => store.flush().await,
            Store::Sql(db) => db.flush().await,
        }
    }

    /// Every stored package, including superseded revisions. The caller
    /// (the update-graph engine, component E) is responsible for reducing
    /// this to the current-revision set before building the prerequisite
    /// graph (spec §9 "latest-revision selection").
    pub async fn enumerate(&self) -> Result<Vec<(Index, Package)>, Error> {
        match self {
            Store::Delta(store) => store.enumerate().await,
            Store::Directory(store) => store.enumerate().await,
            Store::Sql(db) => db.enumerate().await,
        }
    }

    /// Bulk copy of every package from `self` into `target`, e.g. migrating
    /// a mirror between backends. `token` is checked at each package
    /// boundary (spec §5 "Cancellation"); a cancellation mid-copy leaves
    /// `target` with whatever packages were already added and reports
    /// [`crate::error::Error::Cancelled`].
    #[tracing::instrument(skip(self, target, token))]
    pub async fn copy_to(&self, target: &Store, token: &tokio_util::sync::CancellationToken) -> Result<(), crate::error::Error> {
        for (_, package) in self.enumerate().await? {
            if token.is_cancelled() {
                return Err(crate::error::Error::Cancelled);
            }
            target.add_package(&package).await?;
        }
        target.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("package not found")]
    NotFound,
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("serialize metadata")]
    Json(#[from] serde_json::Error),
    #[error("zip archive")]
    Zip(#[from] zip::result::ZipError),
    #[error("sqlx")]
    Sqlx(#[source] ::sqlx::Error),
    #[error("sqlx migration")]
    Migrate(#[from] ::sqlx::migrate::MigrateError),
    #[error("stored index")]
    InvalidIndex(#[from] InvalidIndex),
}

impl From<::sqlx::Error> for Error {
    fn from(error: ::sqlx::Error) -> Self {
        match error {
            ::sqlx::Error::RowNotFound => Error::NotFound,
            error => Error::Sqlx(error),
        }
    }
}
