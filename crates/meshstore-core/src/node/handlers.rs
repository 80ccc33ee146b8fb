// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Wire message handling.  Every record a peer's read loop decodes lands
//! in [`NodeInner::handle_message`] and is dispatched by payload type.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::{self, NetworkKey};
use crate::error::{Error, Result};
use crate::ids::ContentHash;
use crate::peer::{MessageHandler, Peer};
use crate::store::TempFile;
use crate::wire::{
    DataPayload, DataRequestPayload, DataTransferPayload, DiscoveryPayload, HandshakePayload,
    Message, Payload, TRANSFER_CHUNK_SIZE,
};

use super::{NodeInner, PeerInfo, TransferEntry, TransferOrigin};

#[async_trait]
impl MessageHandler for NodeInner {
    async fn handle_message(&self, peer: &Arc<Peer>, msg: Message) -> Result<()> {
        match msg.decode_typed()? {
            Payload::Handshake(payload) => self.on_handshake(peer, payload).await,
            Payload::Data(payload) => self.on_data(peer, payload).await,
            Payload::DataRequest(payload) => self.on_data_request(peer, payload).await,
            Payload::DataTransfer(payload) => self.on_data_transfer(peer, payload).await,
            Payload::Discovery(payload) => self.on_discovery(peer, payload).await,
        }
    }
}

impl NodeInner {
    /// Record the sender, adopt the network key if we are still waiting
    /// for one, and answer with our own handshake.  Each side of a
    /// connection sends exactly one handshake, so a response never
    /// triggers another response.
    async fn on_handshake(&self, peer: &Arc<Peer>, payload: HandshakePayload) -> Result<()> {
        let newly_known = {
            let mut shared = self.shared.write().await;
            let previous = shared.peers.insert(
                payload.node_id.clone(),
                PeerInfo {
                    id: payload.node_id.clone(),
                    address: payload.address.clone(),
                },
            );
            previous.is_none()
        };
        debug!(node = %self.id, from = %payload.node_id, "handshake received");

        if !self.is_first_node {
            if let Some(key_bytes) = payload.key.as_deref().filter(|k| !k.is_empty()) {
                let key = NetworkKey::from_bytes(key_bytes)?;
                // The key must be in place before the latch releases any
                // waiter; later handshake keys are ignored.
                let adopted = {
                    let mut shared = self.shared.write().await;
                    if shared.network_key.is_none() {
                        shared.network_key = Some(key);
                        true
                    } else {
                        false
                    }
                };
                if adopted {
                    self.key_latch.set();
                    info!(node = %self.id, from = %payload.node_id, "adopted network key");
                }
            }
        }

        if !peer.mark_handshake_sent() {
            let known_peers = {
                let shared = self.shared.read().await;
                shared.peers.values().map(|p| p.address.clone()).collect()
            };
            let key = if self.is_first_node {
                self.shared
                    .read()
                    .await
                    .network_key
                    .as_ref()
                    .map(NetworkKey::to_vec)
            } else {
                None
            };
            let response = Message::from_typed(
                &self.id,
                &Payload::Handshake(HandshakePayload {
                    node_id: self.id.clone(),
                    address: self.transport.address(),
                    known_peers,
                    key,
                }),
            )?;
            peer.send(&response).await?;
        }

        // Tell the rest of the mesh about a newcomer so they can dial it.
        if newly_known {
            let gossip = Message::from_typed(
                &self.id,
                &Payload::Discovery(DiscoveryPayload {
                    node_id: payload.node_id,
                    address: payload.address,
                }),
            )?;
            self.transport.broadcast(&gossip).await;
        }
        Ok(())
    }

    /// An availability announcement.  Ask the announcer for the object
    /// unless we already hold it.
    async fn on_data(&self, peer: &Arc<Peer>, payload: DataPayload) -> Result<()> {
        if self.store.exists(&payload.content_hash).await {
            debug!(node = %self.id, hash = %payload.content_hash, "already stored, ignoring announcement");
            return Ok(());
        }
        let request = Message::from_typed(
            &self.id,
            &Payload::DataRequest(DataRequestPayload {
                content_hash: payload.content_hash.clone(),
                from_watch: payload.from_watch,
            }),
        )?;
        peer.send(&request).await
    }

    /// Learn about a node seen elsewhere in the mesh and dial it,
    /// concurrently, unless it is us or already known.
    async fn on_discovery(&self, peer: &Arc<Peer>, payload: DiscoveryPayload) -> Result<()> {
        if payload.node_id == self.id {
            return Ok(());
        }
        let already_known = {
            let shared = self.shared.read().await;
            shared.peers.contains_key(&payload.node_id)
        };
        if already_known {
            return Ok(());
        }

        info!(node = %self.id, discovered = %payload.node_id, through = %peer.id(), "discovered new peer");
        let transport = self.transport.clone();
        let node_id = payload.node_id;
        let address = payload.address;
        tokio::spawn(async move {
            match transport.connect(&address).await {
                Ok(_) => info!(discovered = %node_id, %address, "connected to discovered peer"),
                Err(err) => warn!(discovered = %node_id, %address, %err, "failed to dial discovered peer"),
            }
        });
        Ok(())
    }

    /// Stream the requested object back to the requester in 1 MiB
    /// chunks.  Exactly one chunk carries `final_chunk = true`, including
    /// for empty objects and sizes that are exact chunk multiples.
    async fn on_data_request(&self, peer: &Arc<Peer>, payload: DataRequestPayload) -> Result<()> {
        let mut file = self.store.load(&payload.content_hash).await?;
        let mut index: u64 = 0;
        let mut current = read_full_chunk(&mut file).await?;
        loop {
            let final_chunk = if current.len() < TRANSFER_CHUNK_SIZE {
                true
            } else {
                // Full chunk: peek ahead so the last full chunk of an
                // exact-multiple object still gets the final marker.
                let next = read_full_chunk(&mut file).await?;
                if next.is_empty() {
                    true
                } else {
                    self.send_chunk(peer, &payload, std::mem::replace(&mut current, next), index, false)
                        .await?;
                    index += 1;
                    continue;
                }
            };
            let chunk = std::mem::take(&mut current);
            self.send_chunk(peer, &payload, chunk, index, final_chunk).await?;
            break;
        }
        debug!(node = %self.id, hash = %payload.content_hash, chunks = index + 1, to = %peer.id(), "served object");
        Ok(())
    }

    async fn send_chunk(
        &self,
        peer: &Arc<Peer>,
        request: &DataRequestPayload,
        data: Vec<u8>,
        chunk_index: u64,
        final_chunk: bool,
    ) -> Result<()> {
        let msg = Message::from_typed(
            &self.id,
            &Payload::DataTransfer(DataTransferPayload {
                content_hash: request.content_hash.clone(),
                data,
                chunk_index,
                final_chunk,
                from_watch: request.from_watch,
            }),
        )?;
        peer.send(&msg).await
    }

    /// Reassemble an incoming object chunk by chunk.  State is created
    /// lazily on the first chunk and finalized when the final chunk is
    /// processed; the temp file is unlinked whatever the outcome.
    async fn on_data_transfer(&self, peer: &Arc<Peer>, payload: DataTransferPayload) -> Result<()> {
        let transfer_key = format!("{}-{}", peer.id(), payload.content_hash);

        let temp = {
            let mut shared = self.shared.write().await;
            match shared.transfers.get(&transfer_key) {
                Some(entry) => Arc::clone(&entry.temp),
                None => {
                    let temp = Arc::new(Mutex::new(self.store.create_temp().await?));
                    let origin = if payload.from_watch {
                        TransferOrigin::Watch
                    } else {
                        TransferOrigin::Fetch
                    };
                    shared.transfers.insert(
                        transfer_key.clone(),
                        TransferEntry {
                            temp: Arc::clone(&temp),
                            chunks: HashSet::new(),
                            received: 0,
                            origin,
                        },
                    );
                    temp
                }
            }
        };

        {
            let mut file = temp.lock().await;
            file.write_at(payload.chunk_index * TRANSFER_CHUNK_SIZE as u64, &payload.data)
                .await?;
        }
        {
            let mut shared = self.shared.write().await;
            if let Some(entry) = shared.transfers.get_mut(&transfer_key) {
                entry.chunks.insert(payload.chunk_index);
                entry.received += 1;
            }
        }

        if payload.final_chunk {
            let entry = self.shared.write().await.transfers.remove(&transfer_key);
            if let Some(entry) = entry {
                self.finalize_transfer(entry, &payload.content_hash).await?;
            }
        }
        Ok(())
    }

    async fn finalize_transfer(&self, entry: TransferEntry, expected: &ContentHash) -> Result<()> {
        debug!(
            node = %self.id,
            hash = %expected,
            chunks = entry.chunks.len(),
            records = entry.received,
            "finalizing transfer"
        );
        let mut temp = entry.temp.lock().await;
        let outcome = self.commit_transfer(&mut temp, entry.origin, expected).await;
        let _ = temp.remove().await;
        outcome
    }

    async fn commit_transfer(
        &self,
        temp: &mut TempFile,
        origin: TransferOrigin,
        expected: &ContentHash,
    ) -> Result<()> {
        temp.rewind().await?;
        let actual = crypto::content_hash(temp.file()).await?;
        if actual != *expected {
            return Err(Error::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        match origin {
            TransferOrigin::Watch => {
                temp.rewind().await?;
                self.store.store(expected, temp.file()).await?;
                info!(node = %self.id, hash = %expected, "stored replicated object");
            }
            TransferOrigin::Fetch => {
                let key = self
                    .shared
                    .read()
                    .await
                    .network_key
                    .clone()
                    .ok_or(Error::KeyNotReady)?;
                fs::create_dir_all(&self.downloads_dir).await?;
                let out_path = self.downloads_dir.join(expected.as_str());
                temp.rewind().await?;
                let mut out = File::create(&out_path).await?;
                if let Err(err) = crypto::decrypt_stream(&key, temp.file(), &mut out).await {
                    drop(out);
                    let _ = fs::remove_file(&out_path).await;
                    return Err(err);
                }
                out.flush().await?;
                info!(node = %self.id, hash = %expected, path = %out_path.display(), "downloaded and decrypted object");
            }
        }
        Ok(())
    }
}

/// Read until `TRANSFER_CHUNK_SIZE` bytes are buffered or the stream
/// ends; the returned buffer is shorter only at EOF.
async fn read_full_chunk<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
