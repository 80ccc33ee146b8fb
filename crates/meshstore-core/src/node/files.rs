//! User- and watch-facing file operations on a running node.

use std::path::Path;

use tokio::fs::File;
use tracing::info;

use crate::crypto::{self, NetworkKey};
use crate::error::{Error, Result};
use crate::ids::ContentHash;
use crate::wire::{DataPayload, DataRequestPayload, Message, Payload};

use super::{NodeHandle, NodeInner, SETTLE_DELAY};

/// Outcome of a user fetch.
pub enum Fetched {
    /// The object is in the local store; the caller decrypts the
    /// ciphertext stream with the key.
    Local { reader: File, key: NetworkKey },
    /// Not held locally.  A request went out to every peer; fulfillment
    /// arrives asynchronously and lands in the downloads directory.
    Requested,
}

impl NodeHandle {
    /// Share a file that appeared in the watched directory: encrypt it
    /// into the store and announce its availability to the mesh.
    pub async fn ingest_watched_file(&self, path: &Path) -> Result<()> {
        let key = self.inner.network_key().await?;
        tokio::time::sleep(SETTLE_DELAY).await;

        let (hash, size) = self.inner.encrypt_into_store(&key, path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let announce = Message::from_typed(
            &self.inner.id,
            &Payload::Data(DataPayload {
                content_hash: hash.clone(),
                file_name: file_name.clone(),
                size,
                encrypted: true,
                from_watch: true,
            }),
        )?;
        self.inner.transport.broadcast(&announce).await;
        info!(node = %self.inner.id, %hash, file = %file_name, "announced watched file");
        Ok(())
    }

    /// Encrypt and store a file on the user's behalf.  Unlike the watch
    /// path this does not announce anything.
    pub async fn store_file(&self, path: &Path) -> Result<ContentHash> {
        let key = self.inner.network_key().await?;
        let (hash, _) = self.inner.encrypt_into_store(&key, path).await?;
        Ok(hash)
    }

    /// Fetch an object by hash: from the local store when present,
    /// otherwise by asking the mesh.
    pub async fn get_file(&self, hash: &ContentHash) -> Result<Fetched> {
        tokio::fs::create_dir_all(&self.inner.downloads_dir).await?;
        self.inner.key_latch.wait(super::KEY_WAIT_TIMEOUT).await?;

        match self.inner.store.load(hash).await {
            Ok(reader) => {
                let key = self
                    .inner
                    .shared
                    .read()
                    .await
                    .network_key
                    .clone()
                    .ok_or(Error::KeyNotReady)?;
                Ok(Fetched::Local { reader, key })
            }
            Err(Error::NotFound(_)) => {
                let request = Message::from_typed(
                    &self.inner.id,
                    &Payload::DataRequest(DataRequestPayload {
                        content_hash: hash.clone(),
                        from_watch: false,
                    }),
                )?;
                self.inner.transport.broadcast(&request).await;
                info!(node = %self.inner.id, %hash, "requested object from peers");
                Ok(Fetched::Requested)
            }
            Err(err) => Err(err),
        }
    }

    /// Every content hash held locally.
    pub async fn list(&self) -> Result<Vec<ContentHash>> {
        self.inner.store.list().await
    }
}

impl NodeInner {
    /// Encrypt the plaintext at `path` through a store temp file, hash
    /// the ciphertext, and install it.  The temp file is unlinked whether
    /// or not the install succeeds.
    pub(crate) async fn encrypt_into_store(
        &self,
        key: &NetworkKey,
        path: &Path,
    ) -> Result<(ContentHash, u64)> {
        let mut plaintext = File::open(path).await?;
        let size = plaintext.metadata().await?.len();

        let mut temp = self.store.create_temp().await?;
        let outcome = async {
            crypto::encrypt_stream(key, &mut plaintext, temp.file()).await?;
            temp.rewind().await?;
            let hash = crypto::content_hash(temp.file()).await?;
            temp.rewind().await?;
            self.store.store(&hash, temp.file()).await?;
            Ok::<_, Error>(hash)
        }
        .await;
        let _ = temp.remove().await;

        let hash = outcome?;
        Ok((hash, size))
    }
}
