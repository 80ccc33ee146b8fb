// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::wire::{read_message, Message};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives every record a peer's read loop decodes.  Implemented by the
/// node; the peer holds it weakly so the node's ownership of the
/// transport stays acyclic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, peer: &Arc<Peer>, msg: Message) -> Result<()>;
}

/// One bidirectional connection to a remote node.
///
/// Sends are serialized by a per-peer lock so concurrent senders never
/// interleave bytes of different records.  The read loop decodes one
/// record at a time and dispatches it; a decode error or EOF closes the
/// peer, handler errors are logged and the peer stays up.
pub struct Peer {
    id: String,
    writer: Mutex<BoxedWriter>,
    reader: Mutex<Option<BufReader<BoxedReader>>>,
    handler: Weak<dyn MessageHandler>,
    handshake_sent: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish()
    }
}

impl Peer {
    /// Wrap a connected stream.  `id` is the remote endpoint string and
    /// stays stable for the connection's life.
    pub fn from_stream<S>(id: String, stream: S, handler: Weak<dyn MessageHandler>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            writer: Mutex::new(Box::new(write_half)),
            reader: Mutex::new(Some(BufReader::new(Box::new(read_half) as BoxedReader))),
            handler,
            handshake_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record that a handshake has gone out on this connection, returning
    /// the previous state.  Keeps the exchange at one handshake per side.
    pub fn mark_handshake_sent(&self) -> bool {
        self.handshake_sent.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize and write one framed record.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SendFailed {
                peer: self.id.clone(),
                reason: "peer is closed".to_string(),
            });
        }
        let encoded = msg.encode()?;
        let mut writer = self.writer.lock().await;
        let outcome = async {
            writer.write_all(&encoded).await?;
            writer.flush().await
        }
        .await;
        outcome.map_err(|err| Error::SendFailed {
            peer: self.id.clone(),
            reason: err.to_string(),
        })
    }

    /// Launch the read loop.  Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let taken = peer.reader.lock().await.take();
            let Some(reader) = taken else {
                return;
            };
            peer.run_read_loop(reader).await;
        });
    }

    async fn run_read_loop(self: Arc<Self>, mut reader: BufReader<BoxedReader>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = async { while shutdown.changed().await.is_ok() { if *shutdown.borrow() { break; } } } => break,
                next = read_message(&mut reader) => match next {
                    Ok(Some(msg)) => {
                        let Some(handler) = self.handler.upgrade() else {
                            break;
                        };
                        if let Err(err) = handler.handle_message(&self, msg).await {
                            warn!(peer = %self.id, %err, "message handler failed");
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %self.id, "connection closed by remote");
                        break;
                    }
                    Err(err) => {
                        warn!(peer = %self.id, %err, "failed to decode record");
                        break;
                    }
                }
            }
        }
        self.close().await;
    }

    /// Idempotent: signals the read loop and releases the stream.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(peer = %self.id, "peer closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::wire::{write_message, DiscoveryPayload, Payload};

    struct Recorder {
        seen: AsyncMutex<Vec<Message>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, _peer: &Arc<Peer>, msg: Message) -> Result<()> {
            self.seen.lock().await.push(msg);
            Ok(())
        }
    }

    fn discovery(node_id: &str) -> Message {
        Message::from_typed(
            node_id,
            &Payload::Discovery(DiscoveryPayload {
                node_id: node_id.to_string(),
                address: "127.0.0.1:0".to_string(),
            }),
        )
        .expect("build message")
    }

    #[tokio::test]
    async fn read_loop_dispatches_records_in_order() {
        let handler = Recorder::new();
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let peer = Peer::from_stream(
            "test:1".to_string(),
            local,
            Arc::downgrade(&handler) as Weak<dyn MessageHandler>,
        );
        peer.start();

        write_message(&mut remote, &discovery("a")).await.expect("a");
        write_message(&mut remote, &discovery("b")).await.expect("b");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = handler.seen.lock().await;
        let ids: Vec<_> = seen.iter().map(|m| m.sender_id.clone()).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn decode_error_closes_the_peer() {
        let handler = Recorder::new();
        let (local, mut remote) = tokio::io::duplex(1024);
        let peer = Peer::from_stream(
            "test:2".to_string(),
            local,
            Arc::downgrade(&handler) as Weak<dyn MessageHandler>,
        );
        peer.start();

        remote.write_all(b"this is not json\n").await.expect("write");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(peer.is_closed());
        let err = peer.send(&discovery("x")).await.expect_err("send after close");
        assert!(matches!(err, Error::SendFailed { .. }));
    }

    #[tokio::test]
    async fn remote_eof_closes_the_peer() {
        let handler = Recorder::new();
        let (local, remote) = tokio::io::duplex(1024);
        let peer = Peer::from_stream(
            "test:3".to_string(),
            local,
            Arc::downgrade(&handler) as Weak<dyn MessageHandler>,
        );
        peer.start();

        drop(remote);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(peer.is_closed());
    }

    struct Exploder;

    #[async_trait]
    impl MessageHandler for Exploder {
        async fn handle_message(&self, _peer: &Arc<Peer>, _msg: Message) -> Result<()> {
            Err(Error::MalformedMessage("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn handler_errors_do_not_close_the_peer() {
        let handler: Arc<Exploder> = Arc::new(Exploder);
        let (local, mut remote) = tokio::io::duplex(1024);
        let peer = Peer::from_stream(
            "test:4".to_string(),
            local,
            Arc::downgrade(&handler) as Weak<dyn MessageHandler>,
        );
        peer.start();

        write_message(&mut remote, &discovery("a")).await.expect("a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_handshake_flag_latches() {
        let handler = Recorder::new();
        let (local, _remote) = tokio::io::duplex(1024);
        let peer = Peer::from_stream(
            "test:5".to_string(),
            local,
            Arc::downgrade(&handler) as Weak<dyn MessageHandler>,
        );

        assert!(!peer.mark_handshake_sent());
        assert!(peer.mark_handshake_sent());

        peer.close().await;
        peer.close().await;
        assert!(peer.is_closed());
    }
}
