// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The opaque sync cookie (spec §4.6). The core treats the cookie's
//! `EncryptedData` payload as an opaque byte string; it performs no
//! validation and carries exactly one fact, the client's `computerId`, as a
//! NUL-terminated UTF-8 string. [`CookieCodec`] is the seam a future
//! revision would use to bind the payload to a time-based MAC (spec §9 open
//! question); [`OpaqueCodec`] is the only implementation today.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use thiserror::Error;

/// Five days, per spec §6.
pub const COOKIE_EXPIRATION: Duration = Duration::days(5);

/// Bytes of random padding appended after the NUL terminator, purely so two
/// cookies issued for the same computer are not byte-identical on the wire.
/// The core never reads these bytes back.
const NONCE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub bytes: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl Cookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cookie payload is not valid utf-8")]
    InvalidUtf8,
}

/// Encodes/decodes the opaque `EncryptedData` payload. The core does not
/// validate the payload's authenticity; it only needs `computerId` back out.
pub trait CookieCodec: Send + Sync {
    fn encode(&self, computer_id: &str, nonce: &[u8]) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<String, Error>;
}

/// Today's only codec: `computerId` UTF-8 bytes, a NUL terminator, then
/// opaque padding. No binding, no integrity check (spec §9).
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueCodec;

impl CookieCodec for OpaqueCodec {
    fn encode(&self, computer_id: &str, nonce: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(computer_id.len() + 1 + nonce.len());
        bytes.extend_from_slice(computer_id.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(nonce);
        bytes
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, Error> {
        let trimmed = bytes.split(|&b| b == 0).next().unwrap_or(bytes);
        std::str::from_utf8(trimmed).map(ToOwned::to_owned).map_err(|_| Error::InvalidUtf8)
    }
}

/// Issues a fresh cookie for `computer_id`, expiring `COOKIE_EXPIRATION`
/// from `now` (spec §4.6). The `authCookies`/`protocolVersion` negotiation
/// named in the RPC surface (spec §6) belongs to the SOAP binding, out of
/// scope here; the core only ever needs the computer id back out.
pub fn issue(codec: &dyn CookieCodec, computer_id: &str, now: DateTime<Utc>) -> Cookie {
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    Cookie {
        bytes: codec.encode(computer_id, &nonce),
        expires_at: now + COOKIE_EXPIRATION,
    }
}

/// Recovers `computerId` from a cookie's opaque payload.
pub fn computer_id(codec: &dyn CookieCodec, cookie: &Cookie) -> Result<String, Error> {
    codec.decode(&cookie.bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_computer_id() {
        let codec = OpaqueCodec;
        let now = Utc::now();

        let cookie = issue(&codec, "computer-123", now);

        assert_eq!(computer_id(&codec, &cookie).unwrap(), "computer-123");
        assert_eq!(cookie.expires_at, now + Duration::days(5));
    }

    #[test]
    fn two_issuances_are_not_byte_identical() {
        let codec = OpaqueCodec;
        let now = Utc::now();

        let a = issue(&codec, "same-computer", now);
        let b = issue(&codec, "same-computer", now);

        assert_ne!(a.bytes, b.bytes);
    }

    #[test]
    fn expiration_is_checked_against_the_supplied_clock() {
        let codec = OpaqueCodec;
        let issued_at = Utc::now() - Duration::days(6);
        let cookie = issue(&codec, "computer-123", issued_at);

        assert!(cookie.is_expired(Utc::now()));
    }
}
