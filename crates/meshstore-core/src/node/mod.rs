// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The node coordinator: key bootstrap, peer membership, and the
//! multiplexed transfer state machine.

mod files;
mod handlers;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::fs;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::crypto::NetworkKey;
use crate::error::{Error, Result};
use crate::peer::MessageHandler;
use crate::store::{FileStore, TempFile};
use crate::transport::Transport;

pub use files::Fetched;

/// How long key-dependent operations wait for the network key before
/// failing.
pub const KEY_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// The notification source fires on create, not close; give the writer a
/// moment to finish before reading the file.
pub(crate) const SETTLE_DELAY: Duration = Duration::from_millis(100);

const WATCH_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Advertised node id of the remote.
    pub id: String,
    /// Advertised listen address of the remote.
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOrigin {
    /// Reassembled ciphertext goes straight into the store.
    Watch,
    /// Reassembled ciphertext is decrypted into the downloads directory.
    Fetch,
}

/// Receive-side reassembly of one object, keyed by `(peer id, hash)`.
pub(crate) struct TransferEntry {
    pub(crate) temp: Arc<Mutex<TempFile>>,
    pub(crate) chunks: HashSet<u64>,
    pub(crate) received: u64,
    pub(crate) origin: TransferOrigin,
}

/// Everything guarded by the single node-wide lock.
pub(crate) struct SharedState {
    pub(crate) network_key: Option<NetworkKey>,
    pub(crate) peers: HashMap<String, PeerInfo>,
    pub(crate) transfers: HashMap<String, TransferEntry>,
}

pub(crate) struct NodeInner {
    pub(crate) id: String,
    pub(crate) is_first_node: bool,
    pub(crate) downloads_dir: PathBuf,
    pub(crate) store: FileStore,
    pub(crate) transport: Transport,
    pub(crate) key_latch: KeyLatch,
    pub(crate) shared: RwLock<SharedState>,
    pub(crate) stop: watch::Sender<bool>,
}

pub struct Node;

impl Node {
    /// Bring a node up: open the store, bind the listener, and start the
    /// watch loop.  Joining a mesh is a separate [`NodeHandle::connect`]
    /// call, as the founding/joining distinction is already fixed by
    /// `config.peer_addr`.
    pub async fn start(config: NodeConfig) -> Result<NodeHandle> {
        let store = FileStore::open(&config.store_dir()).await?;
        let watch_dir = config.watch_dir();
        fs::create_dir_all(&watch_dir).await?;

        let is_first_node = config.is_first_node();
        let network_key = if is_first_node {
            Some(NetworkKey::generate()?)
        } else {
            None
        };
        let (stop, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| NodeInner {
            id: config.node_id.clone(),
            is_first_node,
            downloads_dir: config.downloads_dir.clone(),
            store,
            transport: Transport::new(
                config.node_id.clone(),
                weak.clone() as Weak<dyn MessageHandler>,
            ),
            key_latch: KeyLatch::new(is_first_node),
            shared: RwLock::new(SharedState {
                network_key,
                peers: HashMap::new(),
                transfers: HashMap::new(),
            }),
            stop,
        });
        inner.transport.listen(&config.listen_addr).await?;

        let handle = NodeHandle { inner };
        handle.spawn_watch_loop(watch_dir);
        info!(
            node = %handle.inner.id,
            addr = %handle.inner.transport.address(),
            first_node = is_first_node,
            "node started"
        );
        Ok(handle)
    }
}

/// Clonable façade over a running node.
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) inner: Arc<NodeInner>,
}

impl NodeHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_first_node(&self) -> bool {
        self.inner.is_first_node
    }

    /// The actual bound listen address.
    pub fn listen_addr(&self) -> String {
        self.inner.transport.address()
    }

    pub async fn connect(&self, addr: &str) -> Result<()> {
        self.inner.transport.connect(addr).await.map(|_| ())
    }

    /// Snapshot of the known peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner.shared.read().await.peers.values().cloned().collect()
    }

    pub async fn clean_temp(&self) -> Result<()> {
        self.inner.store.clean_temp().await
    }

    /// Shut down: the watch loop exits, the listener closes, every peer
    /// closes.  In-flight transfers are abandoned; their temp files are
    /// collected by the next [`NodeHandle::clean_temp`].
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        self.inner.transport.stop().await;
        info!(node = %self.inner.id, "node stopped");
    }

    fn spawn_watch_loop(&self, watch_dir: PathBuf) {
        let (events_tx, mut events_rx) = mpsc::channel(WATCH_EVENT_BUFFER);
        crate::watch::spawn_scanner(
            watch_dir,
            crate::watch::SCAN_INTERVAL,
            events_tx,
            self.inner.stop.subscribe(),
        );

        let node = self.clone();
        tokio::spawn(async move {
            while let Some(path) = events_rx.recv().await {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(err) = node.ingest_watched_file(&path).await {
                        warn!(path = %path.display(), %err, "failed to share watched file");
                    }
                });
            }
        });
    }
}

impl NodeInner {
    /// Wait (bounded) for the network key, then hand out a copy.
    pub(crate) async fn network_key(&self) -> Result<NetworkKey> {
        self.key_latch.wait(KEY_WAIT_TIMEOUT).await?;
        self.shared
            .read()
            .await
            .network_key
            .clone()
            .ok_or(Error::KeyNotReady)
    }
}

/// One-shot latch: waitable with a timeout, settable at most once.
/// Pre-set for the founding node, which mints the key itself.
pub(crate) struct KeyLatch {
    tx: watch::Sender<bool>,
}

impl KeyLatch {
    pub(crate) fn new(pre_set: bool) -> Self {
        let (tx, _) = watch::channel(pre_set);
        Self { tx }
    }

    /// Fire the latch.  Returns `true` only for the call that actually
    /// set it.
    pub(crate) fn set(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub(crate) async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .map_err(|_| Error::KeyNotReady)?
            .map_err(|_| Error::KeyNotReady)?;
        Ok(())
    }
}

#[cfg(test)]
mod latch_tests {
    use super::*;

    #[tokio::test]
    async fn pre_set_latch_never_waits() {
        let latch = KeyLatch::new(true);
        latch.wait(Duration::from_millis(10)).await.expect("ready");
        // Setting a pre-set latch is a no-op.
        assert!(!latch.set());
    }

    #[tokio::test]
    async fn wait_times_out_when_never_set() {
        let latch = KeyLatch::new(false);
        let err = latch
            .wait(Duration::from_millis(20))
            .await
            .expect_err("must time out");
        assert!(matches!(err, Error::KeyNotReady));
    }

    #[tokio::test]
    async fn set_fires_exactly_once_and_releases_waiters() {
        let latch = Arc::new(KeyLatch::new(false));
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(latch.set());
        assert!(!latch.set());
        waiter.await.expect("join").expect("released");
    }
}
