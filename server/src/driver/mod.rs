// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Driver matching (component G, spec §4.7): a mapping from every
//! `(hardwareId, computerHardwareId?)` tuple declared by a driver update to
//! that update's identity, plus the client-facing matching flow.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use itertools::Itertools;
use tracing::instrument;
use uuid::Uuid;

use crate::db::deployment::Database as DeploymentDatabase;
use crate::deployment::Action;
use crate::engine::Engine;
use crate::error::Error;
use crate::identity::{Identity, Index};
use crate::package::{Package, PackageKind};
use crate::sync::{self, SyncInfo};

/// `hardwareId -> [(driver update guid, declared computer-hardware-ids)]`.
/// An empty declared set means "matches any computer" (spec §4.7 point 2).
#[derive(Debug, Default)]
pub struct Matcher {
    by_hardware_id: HashMap<String, Vec<(Uuid, HashSet<String>)>>,
}

impl Matcher {
    /// Builds the mapping from every [`PackageKind::DriverUpdate`] in the
    /// corpus (spec §4.7 point 0 — the construction step before matching).
    pub fn build(packages: &[Package]) -> Self {
        let mut by_hardware_id: HashMap<String, Vec<(Uuid, HashSet<String>)>> = HashMap::new();

        for package in packages {
            if package.kind != PackageKind::DriverUpdate {
                continue;
            }

            let mut declared: HashMap<&str, HashSet<String>> = HashMap::new();
            for decl in &package.hardware_ids {
                let computer_ids = declared.entry(decl.hardware_id.as_str()).or_default();
                if let Some(computer_hardware_id) = &decl.computer_hardware_id {
                    computer_ids.insert(computer_hardware_id.clone());
                }
            }

            for (hardware_id, computer_ids) in declared {
                by_hardware_id
                    .entry(hardware_id.to_string())
                    .or_default()
                    .push((package.identity.id, computer_ids));
            }
        }

        Self { by_hardware_id }
    }

    /// Matches a client's hardware-id list (ordered specific→generic,
    /// spec §4.7 point 1) against the corpus, optionally restricted to
    /// drivers that declare at least one of the client's
    /// `computer_hardware_ids` or declare none at all (point 2). Returns
    /// candidate driver update GUIDs in specificity order, deduplicated.
    pub fn candidates(&self, hardware_ids: &[String], computer_hardware_ids: &[String]) -> Vec<Uuid> {
        hardware_ids
            .iter()
            .filter_map(|hardware_id| self.by_hardware_id.get(hardware_id))
            .flatten()
            .filter(|(_, declared_computer_ids)| {
                declared_computer_ids.is_empty()
                    || computer_hardware_ids.iter().any(|id| declared_computer_ids.contains(id))
            })
            .map(|(update, _)| *update)
            .unique()
            .collect()
    }
}

/// Unapproved drivers discovered while matching are surfaced to an external
/// observer (spec §4.7's listener pattern) but excluded from the response
/// unless a deployment row explicitly approves them.
pub trait UnapprovedDriverListener: Send + Sync {
    fn on_unapproved(&self, identity: Identity);
}

/// The default: drop the notification on the floor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl UnapprovedDriverListener for NoopListener {
    fn on_unapproved(&self, _identity: Identity) {}
}

/// The driver branch of `syncUpdates` (spec §4.4 "driver branch", §6
/// `skipSoftwareSync`): stages 1 and 2 (roots, non-leafs) are identical to
/// the software branch; stage 3/4 is replaced by hardware-id matching
/// against current driver updates, with unapproved matches excluded and
/// reported to `listener` rather than emitted.
#[instrument(skip(engine, deployment_db, listener))]
#[allow(clippy::too_many_arguments)]
pub async fn sync_updates(
    engine: &Engine,
    deployment_db: &DeploymentDatabase,
    computer_id: &str,
    hardware_ids: &[String],
    computer_hardware_ids: &[String],
    installed_non_leaf_update_ids: &[Index],
    other_cached_update_ids: &[Index],
    max_updates_in_response: usize,
    now: DateTime<Utc>,
    listener: &dyn UnapprovedDriverListener,
) -> Result<SyncInfo, Error> {
    let attached = engine.read().await?;

    let installed_non_leaf = sync::translate_all(&attached, installed_non_leaf_update_ids).await?;
    let other_cached = sync::translate_all(&attached, other_cached_update_ids).await?;
    let client_known: HashSet<Uuid> = installed_non_leaf.union(&other_cached).copied().collect();
    let no_category_filter = HashSet::new();

    let (candidates, is_leaf) = if let Some(roots) = sync::stage_roots(&attached, &client_known) {
        (roots, false)
    } else if let Some(non_leafs) = sync::stage_non_leafs(&attached, &client_known, &no_category_filter, &installed_non_leaf) {
        (non_leafs, false)
    } else {
        let mut approved = Vec::new();

        for id in attached.driver_matcher().candidates(hardware_ids, computer_hardware_ids) {
            if client_known.contains(&id) {
                continue;
            }
            let Some(package) = attached.current_package(&id) else {
                continue;
            };
            if !package.is_applicable(&installed_non_leaf) {
                continue;
            }

            let deployment = match attached.current_revision_index(&id) {
                Some(index) => deployment_db.get_deployment(index).await?,
                None => None,
            };

            let approved_by_deployment = matches!(&deployment, Some(d) if d.action != Action::PreDeploymentCheck);
            if !approved_by_deployment {
                if let Some(identity) = attached.current_identity(&id) {
                    listener.on_unapproved(identity);
                }
                continue;
            }

            approved.push(id);
        }

        (approved, true)
    };

    let (capped, truncated) = sync::cap_and_sort(&attached, candidates, max_updates_in_response);
    let new_updates =
        try_join_all(capped.into_iter().map(|id| sync::build_update_info(&attached, deployment_db, id, is_leaf))).await?;

    let applicable = sync::applicable_universe(&attached, &installed_non_leaf);
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
    let changed_updates = sync::changed_deployments(&attached, deployment_db, &client_known, since).await?;

    deployment_db.update_computer_sync(computer_id, now).await?;

    Ok(SyncInfo {
        new_updates,
        changed_updates,
        truncated,
        out_of_scope_revision_ids,
        driver_sync_not_needed: false,
    })
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::identity::Identity;
    use crate::package::HardwareIdDeclaration;

    fn driver(id: Uuid, hardware_ids: Vec<HardwareIdDeclaration>) -> Package {
        Package {
            identity: Identity::new(id, 1),
            kind: PackageKind::DriverUpdate,
            title: "Driver".into(),
            kb_article_id: None,
            prerequisites: vec![],
            bundled_with: HashSet::new(),
            bundled_updates: HashSet::new(),
            files: vec![],
            hardware_ids,
            raw_xml: String::new(),
        }
    }

    #[test]
    fn matches_on_declared_hardware_id() {
        let id = Uuid::new_v4();
        let matcher = Matcher::build(&[driver(
            id,
            vec![HardwareIdDeclaration {
                hardware_id: "PCI\\VEN_1234".into(),
                computer_hardware_id: None,
            }],
        )]);

        let candidates = matcher.candidates(&["PCI\\VEN_1234".into()], &[]);
        assert_eq!(candidates, vec![id]);
    }

    #[test]
    fn computer_restricted_declaration_requires_a_matching_computer_id() {
        let id = Uuid::new_v4();
        let matcher = Matcher::build(&[driver(
            id,
            vec![HardwareIdDeclaration {
                hardware_id: "PCI\\VEN_1234".into(),
                computer_hardware_id: Some("COMPUTER_A".into()),
            }],
        )]);

        assert!(matcher.candidates(&["PCI\\VEN_1234".into()], &[]).is_empty());
        assert_eq!(
            matcher.candidates(&["PCI\\VEN_1234".into()], &["COMPUTER_A".into()]),
            vec![id]
        );
    }

    #[test]
    fn unrestricted_declaration_matches_any_computer() {
        let id = Uuid::new_v4();
        let matcher = Matcher::build(&[driver(
            id,
            vec![HardwareIdDeclaration {
                hardware_id: "PCI\\VEN_1234".into(),
                computer_hardware_id: None,
            }],
        )]);

        assert_eq!(
            matcher.candidates(&["PCI\\VEN_1234".into()], &["ANYTHING".into()]),
            vec![id]
        );
    }

    #[test]
    fn specific_hardware_ids_are_preferred_by_request_order() {
        let specific = Uuid::new_v4();
        let generic = Uuid::new_v4();
        let matcher = Matcher::build(&[
            driver(
                specific,
                vec![HardwareIdDeclaration {
                    hardware_id: "PCI\\VEN_1234&DEV_5678".into(),
                    computer_hardware_id: None,
                }],
            ),
            driver(
                generic,
                vec![HardwareIdDeclaration {
                    hardware_id: "PCI\\VEN_1234".into(),
                    computer_hardware_id: None,
                }],
            ),
        ]);

        let candidates = matcher.candidates(&["PCI\\VEN_1234&DEV_5678".into(), "PCI\\VEN_1234".into()], &[]);
        assert_eq!(candidates, vec![specific, generic]);
    }
}
