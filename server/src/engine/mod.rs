// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The Update-Graph Engine (component E, spec §4.3): the process-wide,
//! reader-writer-locked handle to an attached metadata source and its
//! derived maps (spec §5 "global state"). Attach/detach/reindex take the
//! write lock and rebuild everything atomically; every sync, lookup and
//! graph query takes the read lock for the duration of the request.

use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::meta::Store;
use crate::driver;
use crate::error::Error;
use crate::graph::Graph;
use crate::identity::{Identity, Index};
use crate::package::Package;

struct State {
    store: Store,
    graph: Graph,
    /// GUID -> wire index of that GUID's *current* (highest) revision.
    id_to_revision_index: HashMap<Uuid, Index>,
    /// GUID -> full identity of that GUID's current revision.
    id_to_full_identity: HashMap<Uuid, Identity>,
    /// Current-revision packages, keyed by GUID, cached so the sync and
    /// driver-matching layers don't re-hit the backing store per candidate
    /// on every request.
    current_packages: HashMap<Uuid, Package>,
    driver_matcher: driver::Matcher,
}

/// The process-wide engine handle. `Default` starts detached.
#[derive(Default)]
pub struct Engine {
    state: RwLock<Option<State>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `store` as the live metadata source, building the
    /// prerequisite graph and derived maps from its current-revision
    /// packages (spec §4.3 points 1-5). Replaces any previously attached
    /// source.
    #[instrument(skip(self, store))]
    pub async fn attach(&self, store: Store) -> Result<(), Error> {
        let state = build_state(store).await?;
        *self.state.write().await = Some(state);
        info!("metadata source attached");
        Ok(())
    }

    /// Detaches the current metadata source, if any. Sync requests
    /// observe [`Error::NoMetadataSource`] until a new source is attached.
    #[instrument(skip(self))]
    pub async fn detach(&self) {
        *self.state.write().await = None;
        info!("metadata source detached");
    }

    /// Rebuilds the derived maps from the attached source's current
    /// contents (e.g. after a bulk ingest). No-op if nothing is attached.
    #[instrument(skip(self))]
    pub async fn reindex(&self) -> Result<(), Error> {
        let mut guard = self.state.write().await;
        let Some(state) = guard.take() else {
            return Err(Error::NoMetadataSource);
        };

        *guard = Some(build_state(state.store).await?);
        info!("metadata source reindexed");
        Ok(())
    }

    /// Acquires the read lock for the duration of a request (spec §5).
    /// Fails fast with [`Error::NoMetadataSource`] if nothing is attached.
    pub async fn read(&self) -> Result<Attached<'_>, Error> {
        let guard = self.state.read().await;
        if guard.is_none() {
            return Err(Error::NoMetadataSource);
        }
        Ok(Attached { guard })
    }
}

async fn build_state(store: Store) -> Result<State, Error> {
    let stored = store.enumerate().await?;

    // Latest-revision selection (spec §9): a single linear pass building a
    // transient multi-map keyed by GUID, reduced to the max-revision entry.
    // Iteration order of the store is never relied upon.
    let mut latest: HashMap<Uuid, (Index, Package)> = HashMap::new();
    for (index, package) in stored {
        match latest.get(&package.identity.id) {
            Some((_, current)) if current.identity.revision >= package.identity.revision => {}
            _ => {
                latest.insert(package.identity.id, (index, package));
            }
        }
    }

    let id_to_revision_index = latest.iter().map(|(id, (index, _))| (*id, *index)).collect();
    let id_to_full_identity = latest.iter().map(|(id, (_, package))| (*id, package.identity)).collect();
    let current_packages: HashMap<Uuid, Package> = latest.into_iter().map(|(id, (_, package))| (id, package)).collect();

    let packages: Vec<Package> = current_packages.values().cloned().collect();
    let graph = Graph::build(&packages);
    let driver_matcher = driver::Matcher::build(&packages);

    if packages.is_empty() {
        warn!("attached metadata source has no current packages");
    }

    Ok(State {
        store,
        graph,
        id_to_revision_index,
        id_to_full_identity,
        current_packages,
        driver_matcher,
    })
}

/// A read-locked view of the attached metadata source, held for the
/// lifetime of one request.
pub struct Attached<'a> {
    guard: RwLockReadGuard<'a, Option<State>>,
}

impl Attached<'_> {
    fn state(&self) -> &State {
        self.guard.as_ref().expect("Attached is only constructed when Some")
    }

    pub fn store(&self) -> &Store {
        &self.state().store
    }

    pub fn graph(&self) -> &Graph {
        &self.state().graph
    }

    pub fn driver_matcher(&self) -> &driver::Matcher {
        &self.state().driver_matcher
    }

    pub fn current_revision_index(&self, id: &Uuid) -> Option<Index> {
        self.state().id_to_revision_index.get(id).copied()
    }

    pub fn current_identity(&self, id: &Uuid) -> Option<Identity> {
        self.state().id_to_full_identity.get(id).copied()
    }

    pub fn current_package(&self, id: &Uuid) -> Option<&Package> {
        self.state().current_packages.get(id)
    }

    /// Every GUID with a current revision, used to compute the applicable
    /// universe for the out-of-scope diff (spec §4.4).
    pub fn current_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.state().current_packages.keys()
    }

    /// Resolves a wire index to the GUID the store has it mapped to,
    /// regardless of whether that GUID's current revision is this exact
    /// index (spec §4.4 "Translation"). Fails the request with
    /// [`Error::InvalidRevisionIndex`] if the store has never seen it.
    pub async fn translate(&self, index: Index) -> Result<Uuid, Error> {
        self.store()
            .get_package_identity(index)
            .await
            .map(|identity| identity.id)
            .map_err(|err| match err {
                crate::db::meta::Error::NotFound => Error::InvalidRevisionIndex(index.get()),
                other => Error::Meta(other),
            })
    }
}
