// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Address the TCP listener binds to, e.g. `0.0.0.0:7600`.
    pub listen_addr: String,
    /// Address of an existing mesh node to join.  `None` makes this node
    /// the founder of a new mesh: it generates the network key itself.
    pub peer_addr: Option<String>,
    /// Per-node data root; `store/` and `watch/` live underneath it.
    pub data_dir: PathBuf,
    /// Where user-fetched files are decrypted to, named by content hash.
    pub downloads_dir: PathBuf,
}

impl NodeConfig {
    pub fn is_first_node(&self) -> bool {
        self.peer_addr.is_none()
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn watch_dir(&self) -> PathBuf {
        self.data_dir.join("watch")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            listen_addr: "0.0.0.0:7600".to_string(),
            peer_addr: None,
            data_dir: PathBuf::from("data/node"),
            downloads_dir: PathBuf::from("downloads"),
        }
    }
}
