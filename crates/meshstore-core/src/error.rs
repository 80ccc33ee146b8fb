// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use thiserror::Error;

use crate::{ids::ContentHash, wire::MessageType};

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the node can surface.  Errors on one peer are logged and
/// isolated: they never abort the node, other peers, or other transfers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("truncated input: {0}")]
    TruncatedInput(String),

    #[error("os random source failed: {0}")]
    RandomSource(String),

    #[error("object {0} not found in store")]
    NotFound(ContentHash),

    #[error("invalid content hash {0:?}")]
    InvalidHash(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("payload does not match {msg_type} schema: {reason}")]
    PayloadMismatch {
        msg_type: MessageType,
        reason: String,
    },

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("send to peer {peer} failed: {reason}")]
    SendFailed { peer: String, reason: String },

    #[error("timed out waiting for the network key")]
    KeyNotReady,

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for failures that only concern a single transfer or
    /// peer and must not propagate past it.
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. }
                | Self::SendFailed { .. }
                | Self::PayloadMismatch { .. }
                | Self::MalformedMessage(_)
        )
    }
}
