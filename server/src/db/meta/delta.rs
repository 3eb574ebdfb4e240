// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The compressed-delta metadata backend (spec §4.1, §9): newly added
//! packages accumulate in memory until [`Store::flush`] seals them into a
//! new, immutable `{N}.zip` section. `toc.json` records each section's
//! package count; the running prefix sum used for index→section lookup is
//! derived from it at load time rather than stored redundantly.

use std::io::Read;
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
    bundled_with: std::collections::HashSet<Uuid>,
    bundled_updates: std::collections::HashSet<Uuid>,
    files: Vec<FileReference>,
    hardware_ids: Vec<HardwareIdDeclaration>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Toc {
    version: u32,
    sections: Vec<SectionInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SectionInfo {
    package_count: u32,
}

#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    toc: RwLock<Toc>,
    /// Committed identities, in index order (position `i` is index `i + 1`).
    committed: RwLock<Vec<Identity>>,
    pending: RwLock<Vec<(Entry, String)>>,
}

impl Store {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs_err::tokio::create_dir_all(&root).await?;

        let toc = match fs_err::tokio::read(toc_path(&root)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Toc { version: 1, sections: vec![] },
            Err(err) => return Err(err.into()),
        };

        let committed = match fs_err::tokio::read(sidecar_path(&root)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            root,
            toc: RwLock::new(toc),
            committed: RwLock::new(committed),
            pending: RwLock::new(Vec::new()),
        })
    }

    pub async fn add_package(&self, package: &Package) -> Result<Index, Error> {
        let committed = self.committed.read().await;
        let mut pending = self.pending.write().await;

        if let Some(position) = committed.iter().position(|id| *id == package.identity) {
            return Index::new(position as u32 + 1).ok_or(Error::NotFound);
        }
        if let Some(position) = pending.iter().position(|(entry, _)| entry.identity == package.identity) {
            return Index::new((committed.len() + position) as u32 + 1).ok_or(Error::NotFound);
        }

        let entry = Entry {
            identity: package.identity,
            kind: package.kind,
            title: package.title.clone(),
            kb_article_id: package.kb_article_id.clone(),
            prerequisites: package.prerequisites.clone(),
            bundled_with: package.bundled_with.clone(),
            bundled_updates: package.bundled_updates.clone(),
            files: package.files.clone(),
            hardware_ids: package.hardware_ids.clone(),
        };
        pending.push((entry, package.raw_xml.clone()));

        Index::new((committed.len() + pending.len()) as u32).ok_or(Error::NotFound)
    }

    /// Seals every pending package into a new immutable `{N}.zip` section.
    pub async fn flush(&self) -> Result<(), Error> {
        let mut pending = self.pending.write().await;
        if pending.is_empty() {
            return Ok(());
        }

        let mut toc = self.toc.write().await;
        let section = toc.sections.len();
        let sealed = std::mem::take(&mut *pending);

        write_section(&self.root, section, &sealed).await?;

        let mut committed = self.committed.write().await;
        committed.extend(sealed.iter().map(|(entry, _)| entry.identity));
        persist_sidecar(&self.root, &committed).await?;

        toc.sections.push(SectionInfo {
            package_count: sealed.len() as u32,
        });
        persist_toc(&self.root, &toc).await?;

        Ok(())
    }

    pub async fn get_metadata(&self, index: Index) -> Result<Vec<u8>, Error> {
        let (_, raw_xml) = self.locate(index).await?;
        Ok(raw_xml.into_bytes())
    }

    pub async fn get_files(&self, index: Index) -> Result<Vec<FileReference>, Error> {
        let (entry, _) = self.locate(index).await?;
        Ok(entry.files)
    }

    pub async fn get_package_by_index(&self, index: Index) -> Result<Package, Error> {
        let (entry, raw_xml) = self.locate(index).await?;
        Ok(from_entry(entry, raw_xml))
    }

    pub async fn get_package_by_identity(&self, identity: Identity) -> Result<Package, Error> {
        let index = self.get_package_index(identity).await?.ok_or(Error::NotFound)?;
        self.get_package_by_index(index).await
    }

    pub async fn get_package_index(&self, identity: Identity) -> Result<Option<Index>, Error> {
        let committed = self.committed.read().await;
        if let Some(position) = committed.iter().position(|id| *id == identity) {
            return Ok(Index::new(position as u32 + 1));
        }
        let pending = self.pending.read().await;
        Ok(pending
            .iter()
            .position(|(entry, _)| entry.identity == identity)
            .and_then(|position| Index::new((committed.len() + position) as u32 + 1)))
    }

    pub async fn get_package_identity(&self, index: Index) -> Result<Identity, Error> {
        Ok(self.locate(index).await?.0.identity)
    }

    pub async fn contains_package(&self, identity: Identity) -> Result<bool, Error> {
        Ok(self.get_package_index(identity).await?.is_some())
    }

    pub async fn enumerate(&self) -> Result<Vec<(Index, Package)>, Error> {
        let committed_count = self.committed.read().await.len() as u32;
        let pending_count = self.pending.read().await.len() as u32;

        let mut packages = Vec::new();
        for raw in 1..=(committed_count + pending_count) {
            let index = Index::new(raw).ok_or(Error::NotFound)?;
            let (entry, raw_xml) = self.locate(index).await?;
            packages.push((index, from_entry(entry, raw_xml)));
        }
        Ok(packages)
    }

    async fn locate(&self, index: Index) -> Result<(Entry, String), Error> {
        let position = index.get() as usize - 1;
        let committed_count = self.committed.read().await.len();

        if position < committed_count {
            let toc = self.toc.read().await;
            let (section, local_position) = section_for(&toc.sections, position)?;
            return read_entry(&self.root, section, local_position).await;
        }

        let pending = self.pending.read().await;
        pending
            .get(position - committed_count)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

/// Binary search over the sections' running prefix sum (spec §4.1:
/// `O(log sections)` index→section lookup): `prefix[i]` is the number of
/// packages in sections `0..i`, so the section containing `global_position`
/// is the partition point where `prefix[i] <= global_position`.
fn section_for(sections: &[SectionInfo], global_position: usize) -> Result<(usize, usize), Error> {
    let mut prefix = Vec::with_capacity(sections.len() + 1);
    let mut running = 0usize;
    prefix.push(0usize);
    for info in sections {
        running += info.package_count as usize;
        prefix.push(running);
    }

    if global_position >= running {
        return Err(Error::NotFound);
    }

    let section = prefix.partition_point(|&offset| offset <= global_position) - 1;
    Ok((section, global_position - prefix[section]))
}

async fn read_entry(root: &Path, section: usize, local_position: usize) -> Result<(Entry, String), Error> {
    let path = section_path(root, section);

    tokio::task::spawn_blocking(move || -> Result<(Entry, String), Error> {
        let file = std::fs::File::open(&path)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let manifest: Vec<Entry> = {
            let mut manifest_file = archive.by_name("manifest.json")?;
            let mut buf = String::new();
            manifest_file.read_to_string(&mut buf)?;
            serde_json::from_str(&buf)?
        };
        let entry = manifest.get(local_position).cloned().ok_or(Error::NotFound)?;

        let mut xml_file = archive.by_name(&format!("{:04}.xml", local_position + 1))?;
        let mut raw_xml = String::new();
        xml_file.read_to_string(&mut raw_xml)?;

        Ok((entry, raw_xml))
    })
    .await
    .map_err(|_| Error::NotFound)?
}

async fn write_section(root: &Path, section: usize, sealed: &[(Entry, String)]) -> Result<(), Error> {
    let path = section_path(root, section);
    let entries: Vec<Entry> = sealed.iter().map(|(entry, _)| entry.clone()).collect();
    let raws: Vec<String> = sealed.iter().map(|(_, raw)| raw.clone()).collect();

    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let file = std::fs::File::create(&path)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        writer.start_file("manifest.json", options)?;
        writer.write_all(&serde_json::to_vec(&entries)?)?;

        for (position, raw_xml) in raws.iter().enumerate() {
            writer.start_file(format!("{:04}.xml", position + 1), options)?;
            writer.write_all(raw_xml.as_bytes())?;
        }

        writer.finish()?;
        Ok(())
    })
    .await
    .map_err(|_| Error::NotFound)?
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

fn section_path(root: &Path, section: usize) -> PathBuf {
    root.join(format!("{section}.zip"))
}

fn toc_path(root: &Path) -> PathBuf {
    root.join("toc.json")
}

fn sidecar_path(root: &Path) -> PathBuf {
    root.join("indexes.json")
}

async fn persist_toc(root: &Path, toc: &Toc) -> Result<(), Error> {
    Ok(fs_err::tokio::write(toc_path(root), serde_json::to_vec(toc)?).await?)
}

async fn persist_sidecar(root: &Path, identities: &[Identity]) -> Result<(), Error> {
    Ok(fs_err::tokio::write(sidecar_path(root), serde_json::to_vec(identities)?).await?)
}

use std::io::Write as _;
