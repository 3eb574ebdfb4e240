// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The directory metadata backend (spec §4.1): one raw-XML file per identity
//! under `metadata/partitions/{partition}/{shard}/{hex(GUID)}.xml`, 256-way
//! sharded by the last byte of the GUID, with an `indexes.json` sidecar
//! carrying the dense index assignment and the structured fields a real
//! implementation would otherwise re-derive by parsing the upstream XML
//! schema (out of scope here, same simplification as the embedded-SQL
//! backend's columns).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Error;
use crate::identity::{Identity, Index};
use crate::package::{FileReference, HardwareIdDeclaration, Package, PackageKind, Prerequisite};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    identity: Identity,
    kind: PackageKind,
    title: String,
    kb_article_id: Option<String>,
    prerequisites: Vec<Prerequisite>,
    bundled_with: HashSet<Uuid>,
    bundled_updates: HashSet<Uuid>,
    files: Vec<FileReference>,
    hardware_ids: Vec<HardwareIdDeclaration>,
}

#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    partition: String,
    /// Position `i` (0-based) is the package at dense index `i + 1`.
    index: RwLock<Vec<Entry>>,
}

impl Store {
    pub async fn open(root: impl Into<PathBuf>, partition: impl Into<String>) -> Result<Self, Error> {
        let root = root.into();
        let partition = partition.into();

        fs_err::tokio::create_dir_all(partition_dir(&root, &partition)).await?;

        let entries = match fs_err::tokio::read(sidecar_path(&root)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            root,
            partition,
            index: RwLock::new(entries),
        })
    }

    pub async fn add_package(&self, package: &Package) -> Result<Index, Error> {
        let mut entries = self.index.write().await;

        if let Some(position) = entries.iter().position(|entry| entry.identity == package.identity) {
            return Index::new(position as u32 + 1).ok_or(Error::NotFound);
        }

        let xml_path = self.xml_path(package.identity);
        if let Some(parent) = xml_path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        fs_err::tokio::write(xml_path, &package.raw_xml).await?;

        entries.push(Entry {
            identity: package.identity,
            kind: package.kind,
            title: package.title.clone(),
            kb_article_id: package.kb_article_id.clone(),
            prerequisites: package.prerequisites.clone(),
            bundled_with: package.bundled_with.clone(),
            bundled_updates: package.bundled_updates.clone(),
            files: package.files.clone(),
            hardware_ids: package.hardware_ids.clone(),
        });

        persist(&self.root, &entries).await?;

        Index::new(entries.len() as u32).ok_or(Error::NotFound)
    }

    pub async fn get_metadata(&self, index: Index) -> Result<Vec<u8>, Error> {
        let identity = self.identity_at(index).await?;
        Ok(fs_err::tokio::read(self.xml_path(identity)).await?)
    }

    pub async fn get_files(&self, index: Index) -> Result<Vec<FileReference>, Error> {
        let entries = self.index.read().await;
        let entry = entry_at(&entries, index)?;
        Ok(entry.files.clone())
    }

    pub async fn get_package_by_index(&self, index: Index) -> Result<Package, Error> {
        let entries = self.index.read().await;
        let entry = entry_at(&entries, index)?.clone();
        drop(entries);

        let raw_xml = String::from_utf8_lossy(&fs_err::tokio::read(self.xml_path(entry.identity)).await?).into_owned();

        Ok(from_entry(entry, raw_xml))
    }

    pub async fn get_package_by_identity(&self, identity: Identity) -> Result<Package, Error> {
        let entries = self.index.read().await;
        let entry = entries
            .iter()
            .find(|entry| entry.identity == identity)
            .cloned()
            .ok_or(Error::NotFound)?;
        drop(entries);

        let raw_xml = String::from_utf8_lossy(&fs_err::tokio::read(self.xml_path(identity)).await?).into_owned();

        Ok(from_entry(entry, raw_xml))
    }

    pub async fn get_package_index(&self, identity: Identity) -> Result<Option<Index>, Error> {
        let entries = self.index.read().await;
        Ok(entries
            .iter()
            .position(|entry| entry.identity == identity)
            .and_then(|position| Index::new(position as u32 + 1)))
    }

    pub async fn get_package_identity(&self, index: Index) -> Result<Identity, Error> {
        self.identity_at(index).await
    }

    pub async fn contains_package(&self, identity: Identity) -> Result<bool, Error> {
        Ok(self.index.read().await.iter().any(|entry| entry.identity == identity))
    }

    /// Directory writes are synchronous per-call; nothing is buffered.
    pub async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    pub async fn enumerate(&self) -> Result<Vec<(Index, Package)>, Error> {
        let entries = self.index.read().await;
        let mut packages = Vec::with_capacity(entries.len());

        for (position, entry) in entries.iter().enumerate() {
            let raw_xml = String::from_utf8_lossy(&fs_err::tokio::read(self.xml_path(entry.identity)).await?).into_owned();
            let index = Index::new(position as u32 + 1).ok_or(Error::NotFound)?;
            packages.push((index, from_entry(entry.clone(), raw_xml)));
        }

        Ok(packages)
    }

    async fn identity_at(&self, index: Index) -> Result<Identity, Error> {
        let entries = self.index.read().await;
        Ok(entry_at(&entries, index)?.identity)
    }

    fn xml_path(&self, identity: Identity) -> PathBuf {
        let shard = identity.id.as_bytes()[15];
        partition_dir(&self.root, &self.partition)
            .join(shard.to_string())
            .join(format!("{}.xml", identity.id.simple()))
    }
}

fn entry_at(entries: &[Entry], index: Index) -> Result<&Entry, Error> {
    entries.get(index.get() as usize - 1).ok_or(Error::NotFound)
}

fn from_entry(entry: Entry, raw_xml: String) -> Package {
    Package {
        identity: entry.identity,
        kind: entry.kind,
        title: entry.title,
        kb_article_id: entry.kb_article_id,
        prerequisites: entry.prerequisites,
        bundled_with: entry.bundled_with,
        bundled_updates: entry.bundled_updates,
        files: entry.files,
        hardware_ids: entry.hardware_ids,
        raw_xml,
    }
}

fn partition_dir(root: &Path, partition: &str) -> PathBuf {
    root.join("metadata").join("partitions").join(partition)
}

fn sidecar_path(root: &Path) -> PathBuf {
    root.join("indexes.json")
}

async fn persist(root: &Path, entries: &[Entry]) -> Result<(), Error> {
    let serialized = serde_json::to_vec(entries)?;
    Ok(fs_err::tokio::write(sidecar_path(root), serialized).await?)
}
