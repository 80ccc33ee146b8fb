// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hex-encoded SHA-1 of an object's ciphertext, including its IV prefix.
/// The primary key of the store and the transfer identifier on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// 20 digest bytes, hex encoded.
    pub const LEN: usize = 40;

    pub fn parse(text: &str) -> Result<Self> {
        if text.len() != Self::LEN
            || !text
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(Error::InvalidHash(text.to_string()));
        }
        Ok(Self(text.to_string()))
    }

    pub fn from_digest(digest: &[u8; 20]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative on-disk location: two two-character shard levels bound the
    /// fanout of any single directory at 256.
    pub fn shard_path(&self) -> PathBuf {
        PathBuf::from(&self.0[..2])
            .join(&self.0[2..4])
            .join(&self.0[4..])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

impl std::str::FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";

    #[test]
    fn parse_accepts_lowercase_hex_sha1() {
        let hash = ContentHash::parse(HASH).expect("valid hash");
        assert_eq!(hash.as_str(), HASH);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(ContentHash::parse("").is_err());
        assert!(ContentHash::parse("abc").is_err());
        // uppercase
        assert!(ContentHash::parse(&HASH.to_uppercase()).is_err());
        // right length, not hex
        assert!(ContentHash::parse(&"z".repeat(40)).is_err());
        // path traversal cannot survive the alphabet check
        assert!(ContentHash::parse("../../../../../../etc/passwd0000000000").is_err());
    }

    #[test]
    fn shard_path_splits_two_levels() {
        let hash = ContentHash::parse(HASH).expect("valid hash");
        assert_eq!(
            hash.shard_path(),
            PathBuf::from("2a")
                .join("ae")
                .join("6c35c94fcfb415dbe95f408b9ce91ee846ed")
        );
    }

    #[test]
    fn serde_roundtrip_validates() {
        let hash = ContentHash::parse(HASH).expect("valid hash");
        let json = serde_json::to_string(&hash).expect("encode");
        assert_eq!(json, format!("\"{HASH}\""));
        let back: ContentHash = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, hash);

        let bad: std::result::Result<ContentHash, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
