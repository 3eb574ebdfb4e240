// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The update/package data model: variants, prerequisite expressions and
//! file references shared by every [`crate::PackageKind`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;

pub mod xml;

/// Which kind of payload an update carries. Deliberately a flat enum rather
/// than an inheritance hierarchy (spec design note §9): a package may be a
/// software leaf *and* bundled *and* category-tagged all at once, and those
/// are orthogonal facts recorded on [`Package`], not separate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageKind {
    SoftwareUpdate,
    DriverUpdate,
    DetectoidCategory,
    ClassificationCategory,
    ProductCategory,
}

impl PackageKind {
    /// Whether this kind can ever appear in the `softwareLeafGuids` set
    /// (spec §4.2 point 4): a software or driver update, never a pure
    /// category/detectoid.
    pub fn is_software_payload(self) -> bool {
        matches!(self, PackageKind::SoftwareUpdate | PackageKind::DriverUpdate)
    }
}

/// A prerequisite expression tree (spec §3). Each [`Package`] carries a list
/// of top-level expressions that must *all* be satisfied (an implicit AND);
/// an empty list means the package is a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prerequisite {
    /// The update identified by this GUID is required.
    Simple(Uuid),
    /// At least one of `children` must be satisfied. When `is_category` is
    /// true the children are category GUIDs used only for scope filtering;
    /// they are otherwise vacuously satisfied for applicability (spec §4.2).
    AtLeastOne { children: Vec<Uuid>, is_category: bool },
}

impl Prerequisite {
    /// Evaluate this expression against a client's installed non-leaf set.
    pub fn is_satisfied(&self, installed: &HashSet<Uuid>) -> bool {
        match self {
            Prerequisite::Simple(id) => installed.contains(id),
            Prerequisite::AtLeastOne { is_category: true, .. } => true,
            Prerequisite::AtLeastOne { children, is_category: false } => {
                children.iter().any(|child| installed.contains(child))
            }
        }
    }

    /// GUIDs this expression directly references, regardless of kind.
    /// Used to build the dependency graph (spec §4.2 point 1) and to detect
    /// unresolved references (spec §3 invariant).
    pub fn referenced_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        match self {
            Prerequisite::Simple(id) => std::slice::from_ref(id).iter().copied(),
            Prerequisite::AtLeastOne { children, .. } => children.iter().copied(),
        }
    }

    /// Category GUIDs mentioned by this expression, if it is a category
    /// `AtLeastOne` node (used by the category filter, spec §4.2).
    pub fn category_ids(&self) -> Option<&[Uuid]> {
        match self {
            Prerequisite::AtLeastOne { children, is_category: true } => Some(children),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchingType {
    Full,
    Delta,
}

/// One `(hardwareId, computerHardwareId?)` tuple declared by a
/// [`PackageKind::DriverUpdate`] (spec §4.7). Non-driver kinds carry none of
/// these. A missing `computer_hardware_id` means the declaration matches any
/// computer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareIdDeclaration {
    pub hardware_id: String,
    pub computer_hardware_id: Option<String>,
}

/// A single downloadable file referenced by an update (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub digest: String,
    pub size: u64,
    pub url: String,
    pub patching_type: PatchingType,
}

/// An update as reconstructed from the backing store: identity, index,
/// payload kind, title/KB metadata, the prerequisite/bundle relationships
/// and the raw XML blob it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub identity: Identity,
    pub kind: PackageKind,
    pub title: String,
    pub kb_article_id: Option<String>,
    /// Top-level prerequisite expressions; all must hold (AND). Empty means
    /// this package is a root.
    pub prerequisites: Vec<Prerequisite>,
    /// GUIDs of updates that bundle this one (back-reference).
    pub bundled_with: HashSet<Uuid>,
    /// GUIDs of updates this one bundles (forward-reference).
    pub bundled_updates: HashSet<Uuid>,
    pub files: Vec<FileReference>,
    /// Hardware-id declarations (spec §4.7); always empty for non-driver
    /// kinds.
    pub hardware_ids: Vec<HardwareIdDeclaration>,
    pub raw_xml: String,
}

impl Package {
    /// True if this package has no prerequisites (spec §4.2: root).
    pub fn is_root(&self) -> bool {
        self.prerequisites.is_empty()
    }

    /// True if this package's payload is eligible for the software-leaf set
    /// (spec §4.2 point 4).
    pub fn is_software_payload(&self) -> bool {
        self.kind.is_software_payload()
    }

    /// A bundle is an update that contains other updates (spec §9 bundle
    /// predicate correction).
    pub fn is_bundle(&self) -> bool {
        !self.bundled_updates.is_empty()
    }

    /// A bundled-only leaf is an update that is inside at least one bundle
    /// (spec §9 bundle predicate correction).
    pub fn is_bundled(&self) -> bool {
        !self.bundled_with.is_empty()
    }

    /// All GUIDs directly referenced by this package's prerequisite
    /// expressions, used to build the dependency graph.
    pub fn dependency_ids(&self) -> HashSet<Uuid> {
        self.prerequisites
            .iter()
            .flat_map(Prerequisite::referenced_ids)
            .collect()
    }

    /// Whether every prerequisite expression is satisfied by `installed`
    /// (spec §4.2 applicability oracle: an implicit AND over the top-level
    /// expressions).
    pub fn is_applicable(&self, installed: &HashSet<Uuid>) -> bool {
        self.prerequisites.iter().all(|p| p.is_satisfied(installed))
    }

    /// Category GUIDs mentioned anywhere in this package's prerequisite
    /// tree (spec §4.2 category filter).
    pub fn category_ids(&self) -> HashSet<Uuid> {
        self.prerequisites
            .iter()
            .filter_map(Prerequisite::category_ids)
            .flat_map(|ids| ids.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pkg(prerequisites: Vec<Prerequisite>) -> Package {
        Package {
            identity: Identity::new(Uuid::nil(), 1),
            kind: PackageKind::SoftwareUpdate,
            title: "test".into(),
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
    fn empty_prerequisites_is_root() {
        assert!(pkg(vec![]).is_root());
    }

    #[test]
    fn simple_prerequisite_requires_membership() {
        let required = Uuid::new_v4();
        let package = pkg(vec![Prerequisite::Simple(required)]);

        assert!(!package.is_applicable(&HashSet::new()));
        assert!(package.is_applicable(&HashSet::from([required])));
    }

    #[test]
    fn at_least_one_non_category_requires_any_child() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let package = pkg(vec![Prerequisite::AtLeastOne {
            children: vec![a, b],
            is_category: false,
        }]);

        assert!(!package.is_applicable(&HashSet::new()));
        assert!(package.is_applicable(&HashSet::from([b])));
    }

    #[test]
    fn at_least_one_category_is_vacuously_satisfied() {
        let category = Uuid::new_v4();
        let package = pkg(vec![Prerequisite::AtLeastOne {
            children: vec![category],
            is_category: true,
        }]);

        assert!(package.is_applicable(&HashSet::new()));
        assert_eq!(package.category_ids(), HashSet::from([category]));
    }

    #[test]
    fn conjunction_requires_all_top_level_expressions() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let package = pkg(vec![Prerequisite::Simple(a), Prerequisite::Simple(b)]);

        assert!(!package.is_applicable(&HashSet::from([a])));
        assert!(package.is_applicable(&HashSet::from([a, b])));
    }
}
