// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Layered server configuration (ambient stack): every field is optional on
//! disk, loaded and merged vendor-then-admin by [`config::Manager`] exactly
//! as the rest of the workspace does, then resolved to concrete values with
//! [`ServerConfig::resolve`].

use std::path::PathBuf;

use config::Config;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::db::meta::Backend;

/// Stage-4 cap (spec §4.4 `MAX_UPDATES_IN_RESPONSE`). The spec fixes this at
/// 50; exposing it here lets an operator lower it for a constrained deployment
/// without a rebuild.
const DEFAULT_MAX_UPDATES_IN_RESPONSE: usize = 50;

const DEFAULT_METADATA_ROOT: &str = "/var/lib/wsusrv/metadata";
const DEFAULT_DEPLOYMENT_DB: &str = "/var/lib/wsusrv/deploySync.db";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub max_updates_in_response: Option<usize>,
    pub backend: Option<Backend>,
    pub metadata_root: Option<PathBuf>,
    pub deployment_db_path: Option<PathBuf>,
    /// Base URL file locations are rewritten against (spec §6
    /// `FileLocation.Url`); `None` means file locations are served as
    /// stored, with no content-delivery rewrite.
    pub content_root: Option<Url>,
}

impl Config for ServerConfig {
    fn domain() -> String {
        "server".into()
    }

    /// Admin config wins field-by-field over vendor config (spec design
    /// note: later-loaded layer is more specific).
    fn merge(self, other: Self) -> Self {
        Self {
            max_updates_in_response: other.max_updates_in_response.or(self.max_updates_in_response),
            backend: other.backend.or(self.backend),
            metadata_root: other.metadata_root.or(self.metadata_root),
            deployment_db_path: other.deployment_db_path.or(self.deployment_db_path),
            content_root: other.content_root.or(self.content_root),
        }
    }
}

/// The fully resolved configuration a running server operates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub max_updates_in_response: usize,
    pub backend: Backend,
    pub metadata_root: PathBuf,
    pub deployment_db_path: PathBuf,
    pub content_root: Option<Url>,
}

impl ServerConfig {
    pub fn resolve(self) -> Resolved {
        Resolved {
            max_updates_in_response: self.max_updates_in_response.unwrap_or(DEFAULT_MAX_UPDATES_IN_RESPONSE),
            backend: self.backend.unwrap_or(Backend::Delta),
            metadata_root: self.metadata_root.unwrap_or_else(|| PathBuf::from(DEFAULT_METADATA_ROOT)),
            deployment_db_path: self.deployment_db_path.unwrap_or_else(|| PathBuf::from(DEFAULT_DEPLOYMENT_DB)),
            content_root: self.content_root,
        }
    }
}
