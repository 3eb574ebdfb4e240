// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The core's public error surface (spec §7). Request-scoped variants
//! propagate straight to the caller with no cleanup side effects (the
//! reader lock is released on any exit path by [`tokio::sync::RwLock`]'s
//! own drop glue); store-wide variants are expected to take the attached
//! source offline until a fresh one is attached.

use thiserror::Error;

use crate::identity::InvalidIndex;

#[derive(Debug, Error)]
pub enum Error {
    /// A sync request arrived before a metadata source was attached.
    #[error("no metadata source attached")]
    NoMetadataSource,

    /// The client supplied a wire index the attached store has never seen.
    #[error("revision index {0} is not present in the store")]
    InvalidRevisionIndex(u32),

    /// A stored package references a partition this build does not
    /// implement. Fatal at store-open time; the operator must intervene.
    #[error("partition {0:?} is not implemented by this build")]
    UnknownPartition(String),

    /// The parser rejected a metadata blob. Non-fatal to the corpus: the
    /// caller excludes just that package and continues (spec §7).
    #[error("metadata xml rejected")]
    InvalidMetadataXml(#[source] crate::package::xml::Error),

    /// A capability the core does not yet provide (e.g. a printer
    /// catalog). Callers must not retry.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// A bulk operation was cancelled via its `CancellationToken`.
    #[error("operation cancelled")]
    Cancelled,

    /// The cookie's `EncryptedData` payload could not be decoded back into
    /// a `computerId` (spec §4.6). Distinct from [`Error::NoMetadataSource`]
    /// — this is a malformed request, not an unattached store.
    #[error("cookie could not be decoded")]
    InvalidCookie(#[source] crate::cookie::Error),

    /// The cookie's 5-day validity window (spec §6 `CookieExpiration`) has
    /// passed; the caller must obtain a fresh cookie via `getCookie`.
    #[error("cookie has expired")]
    CookieExpired,

    #[error("metadata store")]
    Meta(#[from] crate::db::meta::Error),

    #[error("deployment store")]
    Deployment(#[from] crate::db::deployment::Error),
}

impl From<InvalidIndex> for Error {
    fn from(err: InvalidIndex) -> Self {
        Error::InvalidRevisionIndex(err.0 as u32)
    }
}
