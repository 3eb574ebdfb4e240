// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The deployment and computer-sync domain types (spec §3, §4.5): an
//! operator's approval decision for a revision, and a client's bookkeeping
//! record of its last successful sync.

use chrono::{DateTime, Utc};

use crate::identity::Index;

/// An operator decision associating an action with a specific revision.
/// `PreDeploymentCheck` is the "unapproved" sentinel (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Bundle,
    Evaluate,
    PreDeploymentCheck,
}

/// A stored deployment row, keyed by [`Index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub revision_index: Index,
    pub action: Action,
    pub deadline: Option<DateTime<Utc>>,
    pub last_change_time: DateTime<Utc>,
}

/// A client's last-successful-sync bookkeeping record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputerSync {
    pub computer_id: String,
    pub last_sync_time: DateTime<Utc>,
}
