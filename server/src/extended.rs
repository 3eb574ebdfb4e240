// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `getExtendedUpdateInfo` (spec §6): file locations and handler-specific
//! data for a client-chosen set of revisions, plus the content-root URL
//! rewrite for file locations.

use std::collections::HashSet;

use tracing::instrument;
use url::Url;

use crate::engine::Engine;
use crate::error::Error;
use crate::identity::Index;
use crate::package::xml::{self, LocalizedProperties};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
    Extended,
    LocalizedProperties,
    FileLocations,
}

/// `{ fileDigest: bytes, url: string }` (spec §6). `url` is either the
/// upstream URL stored on the file reference or `{contentRoot}/{hex(digest)}`
/// when a local content root is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub file_digest: Vec<u8>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedUpdateEntry {
    pub id: Index,
    pub extended_xml: String,
    pub localized: Option<LocalizedProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedUpdateInfo {
    pub updates: Vec<ExtendedUpdateEntry>,
    pub file_locations: Vec<FileLocation>,
}

/// `geoId` is accepted for signature fidelity with spec §6 but unused: the
/// core has no region-specific content routing (that belongs to the
/// out-of-scope transport/CDN layer).
#[instrument(skip(engine, locales))]
pub async fn get_extended_update_info(
    engine: &Engine,
    revision_ids: &[Index],
    info_types: &[InfoType],
    locales: &[String],
    content_root: Option<&Url>,
) -> Result<ExtendedUpdateInfo, Error> {
    let attached = engine.read().await?;

    let mut updates = Vec::with_capacity(revision_ids.len());
    let mut file_locations = Vec::new();
    let mut seen_digests = HashSet::new();

    for &index in revision_ids {
        let package = attached.store().get_package_by_index(index).await.map_err(|err| match err {
            crate::db::meta::Error::NotFound => Error::InvalidRevisionIndex(index.get()),
            other => Error::Meta(other),
        })?;

        let extended_xml = if info_types.contains(&InfoType::Extended) {
            xml::extended_fragment(&package.raw_xml).map_err(Error::InvalidMetadataXml)?
        } else {
            String::new()
        };

        let localized = if info_types.contains(&InfoType::LocalizedProperties) {
            xml::localized_properties(&package.raw_xml, locales).ok()
        } else {
            None
        };

        if info_types.contains(&InfoType::FileLocations) {
            for file in &package.files {
                let digest = hex::decode(&file.digest).unwrap_or_else(|_| file.digest.clone().into_bytes());
                if !seen_digests.insert(digest.clone()) {
                    continue;
                }

                let url = match content_root {
                    Some(root) => root
                        .join(&hex::encode(&digest))
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| file.url.clone()),
                    None => file.url.clone(),
                };

                file_locations.push(FileLocation { file_digest: digest, url });
            }
        }

        updates.push(ExtendedUpdateEntry {
            id: index,
            extended_xml,
            localized,
        });
    }

    Ok(ExtendedUpdateInfo { updates, file_locations })
}
