// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A software/driver update metadata distribution server: the prerequisite
//! graph engine, a staged client-sync protocol, an indexed metadata backing
//! store with three interchangeable backends, a deployment/sync state
//! store, and driver hardware matching. The SOAP/HTTP transport, CLI surface
//! and content-blob download are out of scope — this crate is the core the
//! transport layer would call into.

pub use self::cookie::Cookie;
pub use self::deployment::{Action, ComputerSync, Deployment};
pub use self::engine::Engine;
pub use self::error::Error;
pub use self::graph::Graph;
pub use self::identity::{Identity, Index};
pub use self::package::{Package, PackageKind};

pub mod config;
pub mod cookie;
pub mod db;
pub mod deployment;
pub mod driver;
pub mod engine;
pub mod error;
pub mod extended;
pub mod graph;
pub mod identity;
pub mod package;
pub mod sync;

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::instrument;

use self::config::Resolved;
use self::cookie::{Cookie as CookieValue, OpaqueCodec};
use self::db::deployment::Database as DeploymentDatabase;
use self::db::meta::Store;
use self::driver::{NoopListener, UnapprovedDriverListener};
use self::extended::{ExtendedUpdateInfo, InfoType};
use self::identity::Index;
use self::sync::{SyncInfo, SyncParams};

/// A running instance of the core: the attached metadata store behind the
/// update-graph engine, the deployment/sync database, resolved
/// configuration and the cookie codec. This is the wiring a transport
/// binding constructs once at startup and calls into per request.
pub struct Server {
    engine: Engine,
    deployment_db: DeploymentDatabase,
    config: Resolved,
    cookie_codec: OpaqueCodec,
}

impl Server {
    /// Opens the metadata store at `config.metadata_root` with
    /// `config.backend`, opens the deployment database, and attaches the
    /// store to a fresh [`Engine`] (spec §4.3 point 0).
    #[instrument(skip(config))]
    pub async fn open(config: Resolved) -> Result<Self, Error> {
        let store = Store::open(config.backend, &config.metadata_root).await?;
        let deployment_db = DeploymentDatabase::new(&config.deployment_db_path).await?;

        let engine = Engine::new();
        engine.attach(store).await?;

        Ok(Self {
            engine,
            deployment_db,
            config,
            cookie_codec: OpaqueCodec,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn deployment_db(&self) -> &DeploymentDatabase {
        &self.deployment_db
    }

    /// `getConfig()` (spec §6): the subset of server configuration a
    /// client is allowed to see.
    pub fn get_config(&self) -> PublicConfig {
        PublicConfig {
            max_updates_in_response: self.config.max_updates_in_response,
            cookie_expiration: cookie::COOKIE_EXPIRATION,
        }
    }

    /// `getCookie(...)` (spec §6). `authCookies`/`oldCookie`/`protocolVersion`
    /// belong to the SOAP binding's negotiation (out of scope); the core
    /// only ever issues a fresh opaque cookie binding `computer_id`.
    pub fn get_cookie(&self, computer_id: &str, now: DateTime<Utc>) -> CookieValue {
        cookie::issue(&self.cookie_codec, computer_id, now)
    }

    /// Resolves `computerId` out of `cookie`, rejecting it if expired or
    /// undecodable. Both failures are distinct from
    /// [`Error::NoMetadataSource`] — they are request-shaped, not a
    /// property of the attached store.
    fn resolve_cookie(&self, cookie: &CookieValue, now: DateTime<Utc>) -> Result<String, Error> {
        if cookie.is_expired(now) {
            return Err(Error::CookieExpired);
        }
        cookie::computer_id(&self.cookie_codec, cookie).map_err(Error::InvalidCookie)
    }

    /// `syncUpdates(cookie, params)` (spec §6), software branch. Rejects an
    /// expired or undecodable cookie before touching the engine.
    pub async fn sync_updates(&self, cookie: &CookieValue, params: SyncParams, now: DateTime<Utc>) -> Result<SyncInfo, Error> {
        let computer_id = self.resolve_cookie(cookie, now)?;
        sync::sync_updates(
            &self.engine,
            &self.deployment_db,
            &computer_id,
            params,
            self.config.max_updates_in_response,
            now,
        )
        .await
    }

    /// `syncUpdates(cookie, params)` with `skipSoftwareSync` set (spec §6,
    /// §4.4 "driver branch"): matches against hardware ids instead of
    /// emitting the bundle/software leaf stages.
    #[allow(clippy::too_many_arguments)]
    pub async fn sync_driver_updates(
        &self,
        cookie: &CookieValue,
        hardware_ids: &[String],
        computer_hardware_ids: &[String],
        params: SyncParams,
        now: DateTime<Utc>,
        listener: &dyn UnapprovedDriverListener,
    ) -> Result<SyncInfo, Error> {
        let computer_id = self.resolve_cookie(cookie, now)?;
        driver::sync_updates(
            &self.engine,
            &self.deployment_db,
            &computer_id,
            hardware_ids,
            computer_hardware_ids,
            &params.installed_non_leaf_update_ids,
            &params.other_cached_update_ids,
            self.config.max_updates_in_response,
            now,
            listener,
        )
        .await
    }

    /// `getExtendedUpdateInfo(cookie, revisionIDs, infoTypes, locales, geoId)`
    /// (spec §6). `cookie` is accepted for signature fidelity but not
    /// otherwise consulted: extended info carries no per-client state.
    pub async fn get_extended_update_info(
        &self,
        _cookie: &CookieValue,
        revision_ids: &[Index],
        info_types: &[InfoType],
        locales: &[String],
    ) -> Result<ExtendedUpdateInfo, Error> {
        extended::get_extended_update_info(&self.engine, revision_ids, info_types, locales, self.config.content_root.as_ref()).await
    }

    /// Re-derives the prerequisite graph and driver matcher from the
    /// store's current contents, e.g. after an upstream mirror refresh
    /// (spec §4.3's "reindex").
    pub async fn refresh(&self) -> Result<(), Error> {
        self.engine.reindex().await
    }
}

/// The wire shape of `getConfig()` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicConfig {
    pub max_updates_in_response: usize,
    pub cookie_expiration: chrono::Duration,
}

/// Convenience constructor that resolves [`config::ServerConfig`] from the
/// workspace-standard vendor/admin YAML layering before opening the store
/// (spec §2 "[AMBIENT] layered YAML configuration").
pub async fn open_with_config_manager(manager: &config::Manager) -> Result<Server, Error> {
    let resolved = manager.load::<config::ServerConfig>().await.unwrap_or_default().resolve();
    Server::open(resolved).await
}

/// Opens a server rooted at a single directory, using defaults for
/// everything else. Primarily useful for tests and small deployments.
pub async fn open_at(root: impl AsRef<Path>) -> Result<Server, Error> {
    let root = root.as_ref();
    let resolved = Resolved {
        max_updates_in_response: 50,
        backend: db::meta::Backend::Delta,
        metadata_root: root.join("metadata"),
        deployment_db_path: root.join("deploySync.db"),
        content_root: None,
    };
    Server::open(resolved).await
}

#[cfg(test)]
mod test {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn open_at_attaches_an_empty_store_and_issues_a_cookie() {
        let dir = std::env::temp_dir().join(format!("server-open-test-{}", Uuid::new_v4()));
        let server = open_at(&dir).await.unwrap();

        let cookie = server.get_cookie("computer-1", Utc::now());
        assert!(!cookie.is_expired(Utc::now()));

        let result = server.sync_updates(&cookie, SyncParams::default(), Utc::now()).await.unwrap();
        assert!(result.new_updates.is_empty());
    }

    #[tokio::test]
    async fn sync_updates_rejects_an_undecodable_cookie() {
        let dir = std::env::temp_dir().join(format!("server-open-test-{}", Uuid::new_v4()));
        let server = open_at(&dir).await.unwrap();

        let broken = CookieValue {
            bytes: vec![0xff, 0xfe, 0xfd],
            expires_at: Utc::now() + cookie::COOKIE_EXPIRATION,
        };

        let err = server.sync_updates(&broken, SyncParams::default(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCookie(_)));
    }

    #[tokio::test]
    async fn sync_updates_rejects_an_expired_cookie() {
        let dir = std::env::temp_dir().join(format!("server-open-test-{}", Uuid::new_v4()));
        let server = open_at(&dir).await.unwrap();

        let issued_at = Utc::now() - cookie::COOKIE_EXPIRATION - chrono::Duration::seconds(1);
        let cookie = server.get_cookie("computer-1", issued_at);

        let err = server.sync_updates(&cookie, SyncParams::default(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::CookieExpired));
    }
}
