// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::{MessageHandler, Peer};
use crate::wire::{HandshakePayload, Message, Payload};

/// Listener, dialer and registry of live peers.  Cheap to clone; all
/// clones share one registry.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    node_id: String,
    handler: Weak<dyn MessageHandler>,
    local_addr: OnceLock<SocketAddr>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    pub fn new(node_id: String, handler: Weak<dyn MessageHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(TransportInner {
                node_id,
                handler,
                local_addr: OnceLock::new(),
                peers: RwLock::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// The actual bound address, advertised in handshakes and discovery.
    pub fn address(&self) -> String {
        self.inner
            .local_addr
            .get()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Bind the TCP listener and run the accept loop concurrently.  Each
    /// accepted connection is wrapped as a [`Peer`], registered, and its
    /// read loop started.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let _ = self.inner.local_addr.set(local);
        info!(node = %self.inner.node_id, %local, "listening");

        let transport = self.clone();
        tokio::spawn(async move {
            transport.accept_loop(listener).await;
        });
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = async { while shutdown.changed().await.is_ok() { if *shutdown.borrow() { break; } } } => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let peer = Peer::from_stream(
                            remote.to_string(),
                            stream,
                            self.inner.handler.clone(),
                        );
                        self.register(peer.clone()).await;
                        peer.start();
                        debug!(peer = %peer.id(), "accepted connection");
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                }
            }
        }
        debug!(node = %self.inner.node_id, "accept loop stopped");
    }

    /// Dial a remote node, register the connection, and immediately send
    /// the opening handshake: our id and address, an empty peer list, and
    /// no key.
    pub async fn connect(&self, addr: &str) -> Result<Arc<Peer>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::ConnectFailed {
                addr: addr.to_string(),
                source: err,
            })?;
        let remote = stream.peer_addr()?;
        let peer = Peer::from_stream(remote.to_string(), stream, self.inner.handler.clone());
        self.register(peer.clone()).await;
        peer.start();

        peer.mark_handshake_sent();
        let hello = Message::from_typed(
            &self.inner.node_id,
            &Payload::Handshake(HandshakePayload {
                node_id: self.inner.node_id.clone(),
                address: self.address(),
                known_peers: Vec::new(),
                key: None,
            }),
        )?;
        peer.send(&hello).await?;
        info!(peer = %peer.id(), "dialed peer");
        Ok(peer)
    }

    async fn register(&self, peer: Arc<Peer>) {
        self.inner
            .peers
            .write()
            .await
            .insert(peer.id().to_string(), peer);
    }

    /// Send to every registered peer.  A failure towards one peer is
    /// logged and does not stop delivery to the rest.
    pub async fn broadcast(&self, msg: &Message) {
        let peers = self.inner.peers.read().await;
        for peer in peers.values() {
            if let Err(err) = peer.send(msg).await {
                warn!(peer = %peer.id(), %err, "broadcast send failed");
            }
        }
    }

    pub async fn send(&self, peer_id: &str, msg: &Message) -> Result<()> {
        let peer = {
            let peers = self.inner.peers.read().await;
            peers.get(peer_id).cloned()
        };
        match peer {
            Some(peer) => peer.send(msg).await,
            None => Err(Error::UnknownPeer(peer_id.to_string())),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Close the listener, then every registered peer.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let peers: Vec<_> = self
            .inner
            .peers
            .write()
            .await
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        for peer in peers {
            peer.close().await;
        }
        info!(node = %self.inner.node_id, "transport stopped");
    }
}
