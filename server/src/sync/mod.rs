// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The Staged Sync State Machine (component F, spec §4.4): translates a
//! client's wire indexes to GUIDs, selects exactly one of the four ordered
//! stages, caps and truncates it, computes the out-of-scope list, and
//! diffs deployments changed since the client's last sync.
//!
//! States: `Translating -> SelectingStage -> EmittingStage{1|2|3|4} ->
//! DiffingDeployments -> Finalizing -> Done`, with `InvalidIndex` and
//! `NoMetadataSourceAttached` as terminal error states — modeled here as
//! early `?`-propagated [`Error`] returns rather than an explicit state
//! enum, since every state but the stage choice is a straight pipeline.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::deployment::Database as DeploymentDatabase;
use crate::deployment::Action;
use crate::engine::{Attached, Engine};
use crate::error::Error;
use crate::identity::Index;
use crate::package::Package;

/// Legacy fallback rendered as `Deployment.LastChangeTime` when no
/// deployment row exists for an emitted update (spec §4.4).
const LEGACY_LAST_CHANGE_TIME: &str = "1970-01-01";

#[derive(Debug, Clone, Default)]
pub struct SyncParams {
    pub installed_non_leaf_update_ids: Vec<Index>,
    pub other_cached_update_ids: Vec<Index>,
    pub filter_category_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub action: Action,
    pub id: u32,
    pub last_change_time: String,
    pub deadline: Option<String>,
    pub auto_download: &'static str,
    pub auto_select: &'static str,
    pub supersedence_behavior: &'static str,
    pub is_assigned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub id: Index,
    pub is_leaf: bool,
    pub is_shared: bool,
    pub xml: String,
    pub deployment: DeploymentInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInfo {
    pub new_updates: Vec<UpdateInfo>,
    pub changed_updates: Vec<UpdateInfo>,
    pub truncated: bool,
    pub out_of_scope_revision_ids: Vec<Index>,
    /// Always `false`; a static field on the wire (spec §6).
    pub driver_sync_not_needed: bool,
}

/// `syncUpdates` (spec §6), software branch. Callers check
/// `skipSoftwareSync` themselves and call [`crate::driver::sync_updates`]
/// instead when it is set (spec §4.4 "driver branch").
#[instrument(skip(engine, deployment_db, params))]
pub async fn sync_updates(
    engine: &Engine,
    deployment_db: &DeploymentDatabase,
    computer_id: &str,
    params: SyncParams,
    max_updates_in_response: usize,
    now: DateTime<Utc>,
) -> Result<SyncInfo, Error> {
    let attached = engine.read().await?;

    let installed_non_leaf = translate_all(&attached, &params.installed_non_leaf_update_ids).await?;
    let other_cached = translate_all(&attached, &params.other_cached_update_ids).await?;
    let client_known: HashSet<Uuid> = installed_non_leaf.union(&other_cached).copied().collect();
    let category_filter: HashSet<Uuid> = params.filter_category_ids.iter().copied().collect();

    let (candidates, is_leaf) = stage_roots(&attached, &client_known)
        .map(|c| (c, false))
        .or_else(|| stage_non_leafs(&attached, &client_known, &category_filter, &installed_non_leaf).map(|c| (c, false)))
        .or_else(|| stage_bundle_leaves(&attached, &client_known, &category_filter, &installed_non_leaf).map(|c| (c, true)))
        .or_else(|| stage_software_leaves(&attached, &client_known, &category_filter, &installed_non_leaf).map(|c| (c, true)))
        .unwrap_or_default();

    let (capped, truncated) = cap_and_sort(&attached, candidates, max_updates_in_response);
    debug!(count = capped.len(), truncated, "stage emitted");

    let new_updates = try_join_all(capped.into_iter().map(|id| build_update_info(&attached, deployment_db, id, is_leaf))).await?;

    let applicable = applicable_universe(&attached, &installed_non_leaf);
    let mut out_of_scope_revision_ids: Vec<Index> = client_known
        .difference(&applicable)
        .filter_map(|id| attached.current_revision_index(id))
        .collect();
    out_of_scope_revision_ids.sort_by_key(Index::get);

    let since = deployment_db
        .get_computer_sync(computer_id)
        .await?
        .map(|row| row.last_sync_time)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let changed_updates = changed_deployments(&attached, deployment_db, &client_known, since).await?;

    deployment_db.update_computer_sync(computer_id, now).await?;

    Ok(SyncInfo {
        new_updates,
        changed_updates,
        truncated,
        out_of_scope_revision_ids,
        driver_sync_not_needed: false,
    })
}

/// Resolves each wire index to its GUID, failing the whole request on the
/// first unknown index (spec §4.4 "Translation").
pub(crate) async fn translate_all(attached: &Attached<'_>, indexes: &[Index]) -> Result<HashSet<Uuid>, Error> {
    let ids = try_join_all(indexes.iter().map(|&index| attached.translate(index))).await?;
    Ok(ids.into_iter().collect())
}

fn applicable_with_category(package: &Package, installed: &HashSet<Uuid>, category_filter: &HashSet<Uuid>) -> bool {
    if !category_filter.is_empty() && package.category_ids().is_disjoint(category_filter) {
        return false;
    }
    package.is_applicable(installed)
}

/// Stage 1: `rootUpdates \ clientKnown` (spec §4.4 table; no category
/// restriction — the table lists none for this stage).
pub(crate) fn stage_roots(attached: &Attached<'_>, client_known: &HashSet<Uuid>) -> Option<Vec<Uuid>> {
    non_empty(
        attached
            .graph()
            .roots()
            .iter()
            .filter(|id| !client_known.contains(*id))
            .copied()
            .collect(),
    )
}

/// Stage 2: `nonLeafUpdates ∩ applicable \ clientKnown`.
pub(crate) fn stage_non_leafs(
    attached: &Attached<'_>,
    client_known: &HashSet<Uuid>,
    category_filter: &HashSet<Uuid>,
    installed_non_leaf: &HashSet<Uuid>,
) -> Option<Vec<Uuid>> {
    non_empty(
        attached
            .graph()
            .non_leafs()
            .iter()
            .filter(|id| !client_known.contains(*id))
            .filter(|id| {
                attached
                    .current_package(id)
                    .is_some_and(|p| applicable_with_category(p, installed_non_leaf, category_filter))
            })
            .copied()
            .collect(),
    )
}

/// Stage 3: software leaves that are bundled into something else
/// (`bundledWith` non-empty — spec §9's "bundled-only leaves").
pub(crate) fn stage_bundle_leaves(
    attached: &Attached<'_>,
    client_known: &HashSet<Uuid>,
    category_filter: &HashSet<Uuid>,
    installed_non_leaf: &HashSet<Uuid>,
) -> Option<Vec<Uuid>> {
    non_empty(leaf_candidates(attached, client_known, category_filter, installed_non_leaf, true))
}

/// Stage 4: standalone software leaves (`bundledWith` empty).
pub(crate) fn stage_software_leaves(
    attached: &Attached<'_>,
    client_known: &HashSet<Uuid>,
    category_filter: &HashSet<Uuid>,
    installed_non_leaf: &HashSet<Uuid>,
) -> Option<Vec<Uuid>> {
    non_empty(leaf_candidates(attached, client_known, category_filter, installed_non_leaf, false))
}

fn leaf_candidates(
    attached: &Attached<'_>,
    client_known: &HashSet<Uuid>,
    category_filter: &HashSet<Uuid>,
    installed_non_leaf: &HashSet<Uuid>,
    bundled: bool,
) -> Vec<Uuid> {
    attached
        .graph()
        .software_leaf_guids()
        .iter()
        .filter(|id| !client_known.contains(*id))
        .filter_map(|id| attached.current_package(id).map(|p| (id, p)))
        .filter(|(_, p)| applicable_with_category(p, installed_non_leaf, category_filter))
        .filter(|(_, p)| p.is_bundled() == bundled)
        .map(|(id, _)| *id)
        .collect()
}

fn non_empty(candidates: Vec<Uuid>) -> Option<Vec<Uuid>> {
    (!candidates.is_empty()).then_some(candidates)
}

/// `clientKnown \ applicableUniverse` (spec §4.4 "Out-of-scope list"):
/// updates the client claims but that are no longer applicable, or no
/// longer present among current revisions.
pub(crate) fn applicable_universe(attached: &Attached<'_>, installed_non_leaf: &HashSet<Uuid>) -> HashSet<Uuid> {
    attached
        .current_ids()
        .filter(|id| attached.current_package(id).is_some_and(|p| p.is_applicable(installed_non_leaf)))
        .copied()
        .collect()
}

/// Selection order within a stage: ascending by internal index (spec §5
/// "Ordering guarantees"). Caps at `max + 1` probed, `max` kept; the
/// `(max+1)`-th existing sets `Truncated`.
pub(crate) fn cap_and_sort(attached: &Attached<'_>, mut candidates: Vec<Uuid>, max: usize) -> (Vec<Uuid>, bool) {
    candidates.sort_by_key(|id| attached.current_revision_index(id).map(Index::get).unwrap_or(u32::MAX));
    let truncated = candidates.len() > max;
    candidates.truncate(max);
    (candidates, truncated)
}

/// The deployment row's action is authoritative; absent that, `Install`
/// for standalone leaves, `Bundle` for bundled leaves, `Evaluate` for
/// non-leafs and roots (spec §9 compatibility switch, resolved).
fn resolve_action(package: &Package, is_leaf: bool, deployment: Option<&crate::deployment::Deployment>) -> Action {
    if let Some(deployment) = deployment {
        return deployment.action;
    }
    if !is_leaf {
        return Action::Evaluate;
    }
    if package.is_bundled() {
        Action::Bundle
    } else {
        Action::Install
    }
}

/// `20000` if the update is itself a bundle, `20001` if it is bundled into
/// one, `20002` if standalone, `15000` for any non-leaf/root (spec §4.4).
fn resolve_deployment_id(package: &Package, is_leaf: bool) -> u32 {
    if !is_leaf {
        return 15000;
    }
    if package.is_bundle() {
        20000
    } else if package.is_bundled() {
        20001
    } else {
        20002
    }
}

pub(crate) async fn build_update_info(
    attached: &Attached<'_>,
    deployment_db: &DeploymentDatabase,
    id: Uuid,
    is_leaf: bool,
) -> Result<UpdateInfo, Error> {
    let index = attached
        .current_revision_index(&id)
        .ok_or_else(|| Error::NotImplemented("update with no current revision index"))?;
    let package = attached
        .current_package(&id)
        .ok_or_else(|| Error::NotImplemented("update with no current package"))?;

    let raw_xml = attached.store().get_metadata(index).await?;
    let raw_xml = String::from_utf8_lossy(&raw_xml).into_owned();
    let xml = crate::package::xml::core_fragment(&raw_xml).map_err(Error::InvalidMetadataXml)?;

    let deployment = deployment_db.get_deployment(index).await?;
    let action = resolve_action(package, is_leaf, deployment.as_ref());
    let deployment_id = resolve_deployment_id(package, is_leaf);
    let last_change_time = deployment
        .as_ref()
        .map(|d| d.last_change_time.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| LEGACY_LAST_CHANGE_TIME.to_string());
    let deadline = deployment.as_ref().and_then(|d| d.deadline).map(|d| d.to_rfc3339());

    Ok(UpdateInfo {
        id: index,
        is_leaf,
        is_shared: false,
        xml,
        deployment: DeploymentInfo {
            action,
            id: deployment_id,
            last_change_time,
            deadline,
            auto_download: "0",
            auto_select: "0",
            supersedence_behavior: "0",
            is_assigned: true,
        },
    })
}

/// Independently of staging: every GUID in `clientKnown` with a deployment
/// row changed since `since` (spec §4.4 "Changed-deployments stream"). Uses
/// the store's single batched `deployments_changed_since` query rather than
/// one lookup per `clientKnown` entry, then restricts to rows whose index is
/// still a GUID's *current* revision (an older, superseded revision's
/// deployment row is not this client's concern).
pub(crate) async fn changed_deployments(
    attached: &Attached<'_>,
    deployment_db: &DeploymentDatabase,
    client_known: &HashSet<Uuid>,
    since: DateTime<Utc>,
) -> Result<Vec<UpdateInfo>, Error> {
    let current_index_to_id: HashMap<Index, Uuid> = client_known
        .iter()
        .filter_map(|id| attached.current_revision_index(id).map(|index| (index, *id)))
        .collect();

    let mut changed = Vec::new();
    for deployment in deployment_db.deployments_changed_since(since).await? {
        let Some(&id) = current_index_to_id.get(&deployment.revision_index) else {
            continue;
        };

        let is_leaf = attached.graph().is_leaf(&id);
        changed.push(build_update_info(attached, deployment_db, id, is_leaf).await?);
    }

    changed.sort_by_key(|info| info.id.get());
    Ok(changed)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use chrono::Duration;

    use super::*;
    use crate::db::meta::{delta, Store};
    use crate::deployment::Deployment;
    use crate::identity::Identity;
    use crate::package::{PackageKind, Prerequisite};

    fn package(id: Uuid, kind: PackageKind, prerequisites: Vec<Prerequisite>) -> Package {
        Package {
            identity: Identity::new(id, 1),
            kind,
            title: "title".into(),
            kb_article_id: None,
            prerequisites,
            bundled_with: HashSet::new(),
            bundled_updates: HashSet::new(),
            files: vec![],
            hardware_ids: vec![],
            raw_xml: "<UpdateInfo><Core><Id/></Core></UpdateInfo>".into(),
        }
    }

    async fn fixture() -> (Engine, DeploymentDatabase, [Uuid; 7]) {
        let dir = std::env::temp_dir().join(format!("sync-test-{}", Uuid::new_v4()));
        let store = Store::Delta(delta::Store::open(&dir).await.unwrap());

        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        let r3 = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        let l1 = Uuid::new_v4();
        let l2 = Uuid::new_v4();

        store.add_package(&package(r1, PackageKind::DetectoidCategory, vec![])).await.unwrap();
        store.add_package(&package(r2, PackageKind::DetectoidCategory, vec![])).await.unwrap();
        store.add_package(&package(r3, PackageKind::DetectoidCategory, vec![])).await.unwrap();
        store
            .add_package(&package(n1, PackageKind::DetectoidCategory, vec![Prerequisite::Simple(r1)]))
            .await
            .unwrap();
        store
            .add_package(&package(n2, PackageKind::DetectoidCategory, vec![Prerequisite::Simple(r2)]))
            .await
            .unwrap();
        store
            .add_package(&package(l1, PackageKind::SoftwareUpdate, vec![Prerequisite::Simple(n1)]))
            .await
            .unwrap();
        store
            .add_package(&package(l2, PackageKind::SoftwareUpdate, vec![Prerequisite::Simple(n2)]))
            .await
            .unwrap();
        store.flush().await.unwrap();

        let engine = Engine::new();
        engine.attach(store).await.unwrap();

        let deployment_db = DeploymentDatabase::memory().await.unwrap();

        (engine, deployment_db, [r1, r2, r3, n1, n2, l1, l2])
    }

    fn index_for(result: &SyncInfo) -> Vec<u32> {
        let mut ids: Vec<u32> = result.new_updates.iter().map(|u| u.id.get()).collect();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn scenario_1_empty_client_emits_all_roots() {
        let (engine, deployment_db, _) = fixture().await;

        let result = sync_updates(
            &engine,
            &deployment_db,
            "computer-1",
            SyncParams::default(),
            50,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.new_updates.len(), 3);
        assert!(result.new_updates.iter().all(|u| !u.is_leaf));
        assert!(result.new_updates.iter().all(|u| u.deployment.id == 15000));
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn scenario_2_after_installing_roots_non_leafs_emit() {
        let (engine, deployment_db, ids) = fixture().await;
        let attached = engine.read().await.unwrap();
        let installed: Vec<Index> = [ids[0], ids[1], ids[2]]
            .iter()
            .map(|id| attached.current_revision_index(id).unwrap())
            .collect();
        drop(attached);

        let params = SyncParams {
            installed_non_leaf_update_ids: installed,
            ..Default::default()
        };

        let result = sync_updates(&engine, &deployment_db, "computer-1", params, 50, Utc::now())
            .await
            .unwrap();

        assert_eq!(result.new_updates.len(), 2);
        assert!(result.new_updates.iter().all(|u| !u.is_leaf));
    }

    #[tokio::test]
    async fn scenario_3_after_installing_roots_and_one_non_leaf_only_its_leaf_emits() {
        let (engine, deployment_db, ids) = fixture().await;
        let [r1, r2, r3, n1, _n2, l1, l2] = ids;

        let attached = engine.read().await.unwrap();
        let installed: Vec<Index> = [r1, r2, r3, n1]
            .iter()
            .map(|id| attached.current_revision_index(id).unwrap())
            .collect();
        drop(attached);

        let params = SyncParams {
            installed_non_leaf_update_ids: installed,
            ..Default::default()
        };

        let result = sync_updates(&engine, &deployment_db, "computer-1", params, 50, Utc::now())
            .await
            .unwrap();

        assert_eq!(result.new_updates.len(), 1);
        let emitted = &result.new_updates[0];
        assert!(emitted.is_leaf);
        assert_eq!(emitted.deployment.action, Action::Install);
        assert_eq!(emitted.deployment.id, 20002);

        let attached = engine.read().await.unwrap();
        assert_eq!(emitted.id, attached.current_revision_index(&l1).unwrap());
        assert_ne!(emitted.id, attached.current_revision_index(&l2).unwrap());
    }

    #[tokio::test]
    async fn scenario_4_truncation_at_fifty() {
        let dir = std::env::temp_dir().join(format!("sync-trunc-test-{}", Uuid::new_v4()));
        let store = Store::Delta(delta::Store::open(&dir).await.unwrap());
        for _ in 0..60 {
            store
                .add_package(&package(Uuid::new_v4(), PackageKind::DetectoidCategory, vec![]))
                .await
                .unwrap();
        }
        store.flush().await.unwrap();

        let engine = Engine::new();
        engine.attach(store).await.unwrap();
        let deployment_db = DeploymentDatabase::memory().await.unwrap();

        let result = sync_updates(
            &engine,
            &deployment_db,
            "computer-1",
            SyncParams::default(),
            50,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.new_updates.len(), 50);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn scenario_5_changed_deployment_is_reported_and_new_updates_is_empty() {
        let (engine, deployment_db, ids) = fixture().await;
        let [r1, r2, r3, n1, _n2, l1, _l2] = ids;

        let attached = engine.read().await.unwrap();
        let installed: Vec<Index> = [r1, r2, r3, n1]
            .iter()
            .map(|id| attached.current_revision_index(id).unwrap())
            .collect();
        let l1_index = attached.current_revision_index(&l1).unwrap();
        drop(attached);

        let params = SyncParams {
            installed_non_leaf_update_ids: installed.clone(),
            other_cached_update_ids: vec![l1_index],
            ..Default::default()
        };

        // First sync establishes the computer-sync bookkeeping row.
        let first = sync_updates(&engine, &deployment_db, "computer-1", params.clone(), 50, Utc::now())
            .await
            .unwrap();
        assert!(first.new_updates.is_empty());

        deployment_db
            .save_deployment(&Deployment {
                revision_index: l1_index,
                action: Action::PreDeploymentCheck,
                deadline: None,
                last_change_time: Utc::now() + Duration::seconds(5),
            })
            .await
            .unwrap();

        let second = sync_updates(
            &engine,
            &deployment_db,
            "computer-1",
            params,
            50,
            Utc::now() + Duration::seconds(10),
        )
        .await
        .unwrap();

        assert!(second.new_updates.is_empty());
        assert_eq!(second.changed_updates.len(), 1);
        assert_eq!(second.changed_updates[0].deployment.action, Action::PreDeploymentCheck);
    }

    #[tokio::test]
    async fn scenario_6_out_of_scope_update_no_longer_applicable() {
        let (engine, deployment_db, ids) = fixture().await;
        let [_r1, _r2, _r3, _n1, _n2, l2, ..] = ids;

        let attached = engine.read().await.unwrap();
        let l2_index = attached.current_revision_index(&l2).unwrap();
        drop(attached);

        // Client claims it already has l2, but has installed no non-leafs,
        // so l2 is not applicable: it must show up as out-of-scope.
        let params = SyncParams {
            other_cached_update_ids: vec![l2_index],
            ..Default::default()
        };

        let result = sync_updates(&engine, &deployment_db, "computer-1", params, 50, Utc::now())
            .await
            .unwrap();

        assert_eq!(result.out_of_scope_revision_ids, vec![l2_index]);
    }

    #[tokio::test]
    async fn unknown_index_fails_the_request() {
        let (engine, deployment_db, _ids) = fixture().await;

        let params = SyncParams {
            other_cached_update_ids: vec![Index::new(9999).unwrap()],
            ..Default::default()
        };

        let err = sync_updates(&engine, &deployment_db, "computer-1", params, 50, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidRevisionIndex(9999)));
    }

    #[tokio::test]
    async fn category_filtered_sync_is_a_subset_of_unfiltered_sync() {
        let (engine, deployment_db, ids) = fixture().await;
        let [r1, r2, r3, ..] = ids;

        let attached = engine.read().await.unwrap();
        let installed: Vec<Index> = [r1, r2, r3]
            .iter()
            .map(|id| attached.current_revision_index(id).unwrap())
            .collect();
        drop(attached);

        let unfiltered = sync_updates(
            &engine,
            &deployment_db,
            "computer-1",
            SyncParams {
                installed_non_leaf_update_ids: installed.clone(),
                ..Default::default()
            },
            50,
            Utc::now(),
        )
        .await
        .unwrap();

        let filtered = sync_updates(
            &engine,
            &deployment_db,
            "computer-2",
            SyncParams {
                installed_non_leaf_update_ids: installed,
                filter_category_ids: vec![Uuid::new_v4()],
                ..Default::default()
            },
            50,
            Utc::now(),
        )
        .await
        .unwrap();

        let unfiltered_ids: HashSet<u32> = index_for(&unfiltered).into_iter().collect();
        let filtered_ids: HashSet<u32> = index_for(&filtered).into_iter().collect();
        assert!(filtered_ids.is_subset(&unfiltered_ids));
    }
}
