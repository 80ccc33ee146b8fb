// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Content-addressed ciphertext store.
//!
//! Objects live at `<base>/<hh>/<hh>/<rest>` derived from their content
//! hash; a sibling `temp/` directory holds in-flight writes.  Installs go
//! through a temp file and a rename, so readers either see a complete
//! object or nothing.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ids::ContentHash;

const TEMP_DIR: &str = "temp";

/// A caller-owned scratch file under the store's `temp/` directory.
pub struct TempFile {
    file: File,
    path: PathBuf,
}

impl TempFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub async fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Unlink the file on disk.  The open handle stays usable until drop.
    pub async fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path).await?;
        Ok(())
    }
}

pub struct FileStore {
    base: PathBuf,
    temp: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    pub async fn open(base: &Path) -> Result<Self> {
        let temp = base.join(TEMP_DIR);
        fs::create_dir_all(&temp).await?;
        Ok(Self {
            base: base.to_path_buf(),
            temp,
            lock: RwLock::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.base.join(hash.shard_path())
    }

    /// Atomically install the reader's bytes under `hash`.  The bytes are
    /// first copied to a fresh temp file, then renamed onto the final
    /// path; on any failure the temp file is removed and the final path
    /// never appears.
    pub async fn store<R>(&self, hash: &ContentHash, reader: &mut R) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + ?Sized,
    {
        let _guard = self.lock.write().await;
        let temp_path = self.temp.join(format!("store-{:08x}", rand::random::<u32>()));
        let result = self.install(hash, &temp_path, reader).await;
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn install<R>(&self, hash: &ContentHash, temp_path: &Path, reader: &mut R) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + ?Sized,
    {
        let mut temp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .await?;
        tokio::io::copy(reader, &mut temp).await?;
        temp.flush().await?;
        drop(temp);

        let final_path = self.object_path(hash);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(temp_path, &final_path).await?;
        debug!(%hash, path = %final_path.display(), "installed object");
        Ok(())
    }

    /// A readable stream over the stored object.
    pub async fn load(&self, hash: &ContentHash) -> Result<File> {
        let _guard = self.lock.read().await;
        match File::open(self.object_path(hash)).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(hash.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, hash: &ContentHash) -> bool {
        let _guard = self.lock.read().await;
        fs::metadata(self.object_path(hash)).await.is_ok()
    }

    /// Remove the object, then prune every now-empty shard directory above
    /// it, stopping at the base.
    pub async fn delete(&self, hash: &ContentHash) -> Result<()> {
        let _guard = self.lock.write().await;
        let path = self.object_path(hash);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(hash.clone()));
            }
            Err(err) => return Err(err.into()),
        }

        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.base {
                break;
            }
            // Fails while non-empty, which ends the walk.
            if fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// A fresh writable handle under `temp/`, owned by the caller.
    pub async fn create_temp(&self) -> Result<TempFile> {
        let path = self
            .temp
            .join(format!("transfer-{:08x}", rand::random::<u32>()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(TempFile { file, path })
    }

    /// Remove every entry under `temp/`.
    pub async fn clean_temp(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut entries = fs::read_dir(&self.temp).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let removed = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            if let Err(err) = removed {
                warn!(path = %path.display(), %err, "failed to remove temp entry");
            }
        }
        Ok(())
    }

    /// Every stored content hash, reconstructed from the shard tree.
    /// Anything under `temp/` is skipped by prefix; order is unspecified.
    pub async fn list(&self) -> Result<Vec<ContentHash>> {
        let _guard = self.lock.read().await;
        let mut hashes = Vec::new();
        let mut stack = vec![self.base.clone()];
        while let Some(dir) = stack.pop() {
            if dir.starts_with(&self.temp) {
                continue;
            }
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let kind = entry.file_type().await?;
                if kind.is_dir() {
                    stack.push(path);
                } else if kind.is_file() {
                    let Ok(rel) = path.strip_prefix(&self.base) else {
                        continue;
                    };
                    let joined: String = rel.iter().map(|c| c.to_string_lossy()).collect();
                    match ContentHash::parse(&joined) {
                        Ok(hash) => hashes.push(hash),
                        Err(_) => {
                            debug!(path = %path.display(), "skipping foreign file in store")
                        }
                    }
                }
            }
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

    use super::*;

    async fn store_in(dir: &Path) -> FileStore {
        FileStore::open(&dir.join("store")).await.expect("open store")
    }

    fn hash_of(byte: u8) -> ContentHash {
        ContentHash::parse(&format!("{:02x}", byte).repeat(20)).expect("valid hash")
    }

    #[tokio::test]
    async fn store_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let hash = hash_of(0xab);
        let payload = b"hello world".to_vec();

        store.store(&hash, &mut payload.as_slice()).await.expect("store");
        assert!(store.exists(&hash).await);

        let mut loaded = store.load(&hash).await.expect("load");
        let mut bytes = Vec::new();
        loaded.read_to_end(&mut bytes).await.expect("read");
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn objects_land_on_sharded_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let hash = ContentHash::parse("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed").expect("hash");

        store.store(&hash, &mut &b"x"[..]).await.expect("store");
        let expected = dir
            .path()
            .join("store")
            .join("2a")
            .join("ae")
            .join("6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert!(fs::metadata(&expected).await.is_ok());

        let listed = store.list().await.expect("list");
        assert_eq!(listed, vec![hash]);
    }

    #[tokio::test]
    async fn list_reports_every_object_once_and_skips_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let a = hash_of(0x11);
        let b = hash_of(0x22);
        store.store(&a, &mut &b"a"[..]).await.expect("store a");
        store.store(&b, &mut &b"b"[..]).await.expect("store b");

        // Leave an in-flight artifact and a nested one behind.
        let _temp = store.create_temp().await.expect("temp");
        fs::create_dir_all(store.temp_dir().join("nested"))
            .await
            .expect("nested dir");
        fs::write(store.temp_dir().join("nested").join("junk"), b"junk")
            .await
            .expect("junk");

        let mut listed = store.list().await.expect("list");
        listed.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test]
    async fn load_missing_object_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let err = store.load(&hash_of(0xee)).await.expect_err("must be absent");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_prunes_empty_shard_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let hash = hash_of(0x3c);
        store.store(&hash, &mut &b"x"[..]).await.expect("store");

        store.delete(&hash).await.expect("delete");
        assert!(!store.exists(&hash).await);
        assert!(
            fs::metadata(dir.path().join("store").join("3c")).await.is_err(),
            "empty shard directory must be pruned"
        );
        // The base itself survives.
        assert!(fs::metadata(store.base_dir()).await.is_ok());

        let err = store.delete(&hash).await.expect_err("second delete");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_keeps_shared_shard_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        // Same first shard level, different objects.
        let a = ContentHash::parse(&format!("aa{}", "0".repeat(38))).expect("hash a");
        let b = ContentHash::parse(&format!("aa{}", "1".repeat(38))).expect("hash b");
        store.store(&a, &mut &b"a"[..]).await.expect("store a");
        store.store(&b, &mut &b"b"[..]).await.expect("store b");

        store.delete(&a).await.expect("delete a");
        assert!(store.exists(&b).await);
    }

    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "source went away",
                )));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![9u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_install_leaves_no_trace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let hash = hash_of(0x77);

        let mut reader = FailingReader { remaining: 4096 };
        store
            .store(&hash, &mut reader)
            .await
            .expect_err("install must fail");

        assert!(!store.exists(&hash).await);
        let mut temp_entries = fs::read_dir(store.temp_dir()).await.expect("read temp");
        assert!(
            temp_entries.next_entry().await.expect("entry").is_none(),
            "failed install must not leave temp files"
        );
    }

    #[tokio::test]
    async fn clean_temp_empties_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let mut temp = store.create_temp().await.expect("temp");
        temp.write_at(0, b"half-finished").await.expect("write");
        fs::create_dir_all(store.temp_dir().join("nested"))
            .await
            .expect("nested");

        store.clean_temp().await.expect("clean");
        let mut entries = fs::read_dir(store.temp_dir()).await.expect("read temp");
        assert!(entries.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn temp_files_support_offset_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path()).await;
        let mut temp = store.create_temp().await.expect("temp");

        temp.write_at(4, b"5678").await.expect("tail");
        temp.write_at(0, b"1234").await.expect("head");
        temp.rewind().await.expect("rewind");
        let mut bytes = Vec::new();
        temp.file().read_to_end(&mut bytes).await.expect("read");
        assert_eq!(bytes, b"12345678");

        temp.remove().await.expect("remove");
        assert!(fs::metadata(temp.path()).await.is_err());
    }
}
