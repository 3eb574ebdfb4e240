// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The prerequisite graph (spec §4.2): root/non-leaf/leaf partitioning and
//! the applicability oracle, built in one pass over the corpus's *current*
//! revisions (supersedence is resolved by the caller before building this).

use std::collections::{HashMap, HashSet};

use dag::Dag;
use tracing::warn;
use uuid::Uuid;

use crate::package::Package;

/// Root/non-leaf/leaf partition of a package corpus, plus the dependents
/// adjacency used to classify it. Constructed once per attached metadata
/// source (spec §4.3) and rebuilt wholesale on reindex.
#[derive(Debug, Default)]
pub struct Graph {
    /// Generic cycle-rejecting adjacency (dependency -> dependent), reused
    /// from the workspace's `dag` crate rather than hand-rolled storage.
    edges: Dag<Uuid>,
    dependents: HashMap<Uuid, HashSet<Uuid>>,
    roots: HashSet<Uuid>,
    non_leafs: HashSet<Uuid>,
    leafs: HashSet<Uuid>,
    /// leafs ∩ {software or driver payloads} (spec §3's definition, which
    /// supersedes §4.2's narrower "SoftwareUpdate only" wording — see
    /// DESIGN.md).
    software_leaf_guids: HashSet<Uuid>,
}

impl Graph {
    /// Build the graph from the current-revision package set (spec §4.2
    /// points 1-4). Unresolved prerequisite references are dropped rather
    /// than linked (spec §3 invariant: an update with an unresolved
    /// reference is simply never satisfiable, not a construction error).
    pub fn build(packages: &[Package]) -> Self {
        let known: HashSet<Uuid> = packages.iter().map(|p| p.identity.id).collect();

        let mut edges = Dag::new();
        for package in packages {
            edges.add_node_or_get_index(package.identity.id);
        }

        let mut dependents: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for package in packages {
            for dependency in package.dependency_ids() {
                if !known.contains(&dependency) {
                    continue;
                }

                dependents.entry(dependency).or_default().insert(package.identity.id);

                let from = edges.add_node_or_get_index(dependency);
                let to = edges.add_node_or_get_index(package.identity.id);
                if !edges.add_edge(from, to) {
                    warn!(dependency = %dependency, dependent = %package.identity.id, "skipping cyclic prerequisite edge");
                }
            }
        }

        let mut roots = HashSet::new();
        let mut non_leafs = HashSet::new();
        let mut leafs = HashSet::new();
        let mut software_leaf_guids = HashSet::new();

        for package in packages {
            let id = package.identity.id;

            if package.is_root() {
                roots.insert(id);
            } else if dependents.get(&id).is_some_and(|deps| !deps.is_empty()) {
                non_leafs.insert(id);
            } else {
                leafs.insert(id);
                if package.is_software_payload() {
                    software_leaf_guids.insert(id);
                }
            }
        }

        Self {
            edges,
            dependents,
            roots,
            non_leafs,
            leafs,
            software_leaf_guids,
        }
    }

    pub fn is_root(&self, id: &Uuid) -> bool {
        self.roots.contains(id)
    }

    pub fn is_non_leaf(&self, id: &Uuid) -> bool {
        self.non_leafs.contains(id)
    }

    pub fn is_leaf(&self, id: &Uuid) -> bool {
        self.leafs.contains(id)
    }

    pub fn is_software_leaf(&self, id: &Uuid) -> bool {
        self.software_leaf_guids.contains(id)
    }

    pub fn roots(&self) -> &HashSet<Uuid> {
        &self.roots
    }

    pub fn non_leafs(&self) -> &HashSet<Uuid> {
        &self.non_leafs
    }

    pub fn software_leaf_guids(&self) -> &HashSet<Uuid> {
        &self.software_leaf_guids
    }

    /// Updates that transitively depend on `id`, via the cycle-rejecting
    /// dag (a DFS starting from `id`, excluding `id` itself).
    pub fn transitive_dependents(&self, id: &Uuid) -> Vec<Uuid> {
        let Some(index) = self.edges.get_index(id) else {
            return Vec::new();
        };
        self.edges.dfs(index).filter(|&&node| node != *id).copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::Identity;
    use crate::package::{PackageKind, Prerequisite};

    fn package(id: Uuid, kind: PackageKind, prerequisites: Vec<Prerequisite>) -> Package {
        Package {
            identity: Identity::new(id, 1),
            kind,
            title: String::new(),
            kb_article_id: None,
            prerequisites,
            bundled_with: HashSet::new(),
            bundled_updates: HashSet::new(),
            files: vec![],
            hardware_ids: vec![],
            raw_xml: String::new(),
        }
    }

    #[test]
    fn classifies_root_non_leaf_leaf() {
        let root = Uuid::new_v4();
        let non_leaf = Uuid::new_v4();
        let leaf = Uuid::new_v4();

        let packages = vec![
            package(root, PackageKind::DetectoidCategory, vec![]),
            package(non_leaf, PackageKind::DetectoidCategory, vec![Prerequisite::Simple(root)]),
            package(leaf, PackageKind::SoftwareUpdate, vec![Prerequisite::Simple(non_leaf)]),
        ];

        let graph = Graph::build(&packages);

        assert!(graph.is_root(&root));
        assert!(graph.is_non_leaf(&non_leaf));
        assert!(graph.is_leaf(&leaf));
        assert!(graph.is_software_leaf(&leaf));
    }

    #[test]
    fn root_with_dependents_is_still_root() {
        // spec §4.2: root is checked before non-leaf, so a prerequisite-free
        // update stays a root even though something depends on it.
        let root = Uuid::new_v4();
        let dependent = Uuid::new_v4();

        let packages = vec![
            package(root, PackageKind::DetectoidCategory, vec![]),
            package(dependent, PackageKind::SoftwareUpdate, vec![Prerequisite::Simple(root)]),
        ];

        let graph = Graph::build(&packages);

        assert!(graph.is_root(&root));
        assert!(!graph.is_non_leaf(&root));
    }

    #[test]
    fn unresolved_prerequisite_is_dropped_not_fatal() {
        let dangling = Uuid::new_v4();
        let leaf = Uuid::new_v4();

        let packages = vec![package(leaf, PackageKind::SoftwareUpdate, vec![Prerequisite::Simple(dangling)])];

        let graph = Graph::build(&packages);

        // Has a prerequisite expression, so not a root; nothing depends on
        // it, so it's a leaf despite the dangling reference.
        assert!(!graph.is_root(&leaf));
        assert!(graph.is_leaf(&leaf));
    }

    #[test]
    fn category_leaf_is_not_a_software_leaf() {
        let non_leaf = Uuid::new_v4();
        let category_leaf = Uuid::new_v4();

        let packages = vec![
            package(non_leaf, PackageKind::DetectoidCategory, vec![]),
            package(
                category_leaf,
                PackageKind::ClassificationCategory,
                vec![Prerequisite::Simple(non_leaf)],
            ),
        ];

        let graph = Graph::build(&packages);

        assert!(graph.is_leaf(&category_leaf));
        assert!(!graph.is_software_leaf(&category_leaf));
    }
}
