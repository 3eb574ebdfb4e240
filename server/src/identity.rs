// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Canonical update identity and the dense wire index assigned to it by the
//! backing store.

use std::fmt;
use std::num::NonZeroU32;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identity of an update: a GUID paired with a monotonically
/// increasing revision. Only the highest revision per GUID is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{id}/{revision}")]
pub struct Identity {
    pub id: Uuid,
    pub revision: u32,
}

impl Identity {
    pub fn new(id: Uuid, revision: u32) -> Self {
        Self { id, revision }
    }
}

/// Dense, 1-based integer index the wire protocol uses in place of
/// [`Identity`]. Assigned by the backing store on first insert and never
/// reused or renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Index(NonZeroU32);

impl Index {
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Index> for i64 {
    fn from(index: Index) -> Self {
        index.0.get() as i64
    }
}

impl TryFrom<i64> for Index {
    type Error = InvalidIndex;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .ok()
            .and_then(Index::new)
            .ok_or(InvalidIndex(value))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("index {0} is not a valid 1-based wire index")]
pub struct InvalidIndex(pub i64);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_is_not_a_valid_index() {
        assert!(Index::new(0).is_none());
        assert!(Index::try_from(0i64).is_err());
    }

    #[test]
    fn round_trips_through_i64() {
        let index = Index::new(42).unwrap();
        let encoded: i64 = index.into();
        assert_eq!(Index::try_from(encoded).unwrap(), index);
    }
}
