// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Streaming cipher pipeline and content hashing.
//!
//! All content is encrypted under one mesh-wide AES-256 key in counter
//! mode, so encryption and decryption are symmetric streams of equal
//! length and need no padding.  The IV travels in-band as the first 16
//! bytes of ciphertext; the content hash is computed over IV + ciphertext
//! and therefore binds both.

use std::fmt;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::{rngs::OsRng, RngCore};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::ids::ContentHash;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
/// Plaintext/ciphertext is pumped through the cipher in 64 KiB slices so
/// memory use stays constant regardless of object size.
pub const CIPHER_CHUNK_SIZE: usize = 64 * 1024;

type Aes256Ctr = Ctr128BE<Aes256>;

/// The symmetric secret shared by every node in one mesh.  Established by
/// the founding node and adopted by each joiner on its first handshake
/// response; immutable after adoption.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkKey([u8; KEY_SIZE]);

impl NetworkKey {
    /// Draw a fresh key from the OS CSPRNG.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| Error::RandomSource(err.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

// Key material must never land in logs.
impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(..)")
    }
}

pub fn generate_iv() -> Result<[u8; IV_SIZE]> {
    let mut iv = [0u8; IV_SIZE];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|err| Error::RandomSource(err.to_string()))?;
    Ok(iv)
}

/// SHA-1 the full contents of `reader`, consuming it.
pub async fn content_hash<R>(reader: &mut R) -> Result<ContentHash>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CIPHER_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest: [u8; 20] = hasher.finalize().into();
    Ok(ContentHash::from_digest(&digest))
}

/// Encrypt `reader` into `writer`: a fresh random IV as the first
/// [`IV_SIZE`] bytes, then the AES-256-CTR stream of the plaintext.
pub async fn encrypt_stream<R, W>(key: &NetworkKey, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let iv = generate_iv()?;
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), &iv)
        .map_err(|err| Error::Cipher(err.to_string()))?;
    writer.write_all(&iv).await?;

    let mut buf = vec![0u8; CIPHER_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        writer.write_all(&buf[..n]).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Inverse of [`encrypt_stream`]: read the IV prefix, then decrypt the
/// remainder of `reader` into `writer`.
pub async fn decrypt_stream<R, W>(key: &NetworkKey, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    reader.read_exact(&mut iv).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TruncatedInput(format!("ciphertext shorter than the {IV_SIZE}-byte iv prefix"))
        } else {
            Error::Io(err)
        }
    })?;
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), &iv)
        .map_err(|err| Error::Cipher(err.to_string()))?;

    let mut buf = vec![0u8; CIPHER_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        writer.write_all(&buf[..n]).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(plaintext: &[u8]) -> Vec<u8> {
        let key = NetworkKey::generate().expect("generate key");
        let mut ciphertext = Vec::new();
        encrypt_stream(&key, &mut &plaintext[..], &mut ciphertext)
            .await
            .expect("encrypt");
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);

        let mut decrypted = Vec::new();
        decrypt_stream(&key, &mut ciphertext.as_slice(), &mut decrypted)
            .await
            .expect("decrypt");
        decrypted
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip_across_chunk_boundaries() {
        for size in [0, 1, 64, CIPHER_CHUNK_SIZE - 1, CIPHER_CHUNK_SIZE, 3 * CIPHER_CHUNK_SIZE] {
            let plaintext = vec![0xA5u8; size];
            assert_eq!(roundtrip(&plaintext).await, plaintext, "size {size}");
        }
    }

    #[tokio::test]
    async fn large_patterned_buffer_roundtrips() {
        let plaintext: Vec<u8> = (0..192 * 1024).map(|i| (i % 256) as u8).collect();
        assert_eq!(roundtrip(&plaintext).await, plaintext);
    }

    #[test]
    fn generated_keys_differ() {
        let a = NetworkKey::generate().expect("key a");
        let b = NetworkKey::generate().expect("key b");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn generated_ivs_differ() {
        let a = generate_iv().expect("iv a");
        let b = generate_iv().expect("iv b");
        assert_ne!(a, b);
    }

    #[test]
    fn key_size_is_enforced() {
        let err = NetworkKey::from_bytes(&[0u8; 16]).expect_err("short key must fail");
        assert!(matches!(
            err,
            Error::InvalidKeySize {
                expected: KEY_SIZE,
                actual: 16
            }
        ));
    }

    #[test]
    fn debug_output_redacts_key_material() {
        let key = NetworkKey::from_bytes(&[0x42u8; KEY_SIZE]).expect("key");
        assert_eq!(format!("{key:?}"), "NetworkKey(..)");
    }

    #[tokio::test]
    async fn content_hash_is_deterministic_and_collision_sensitive() {
        let a = content_hash(&mut &b"hello world"[..]).await.expect("hash a");
        let b = content_hash(&mut &b"hello world"[..]).await.expect("hash b");
        let c = content_hash(&mut &b"hello worle"[..]).await.expect("hash c");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Known SHA-1 of "hello world".
        assert_eq!(a.as_str(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[tokio::test]
    async fn decrypt_rejects_input_shorter_than_iv() {
        let key = NetworkKey::generate().expect("key");
        let mut out = Vec::new();
        let err = decrypt_stream(&key, &mut &[1u8, 2, 3][..], &mut out)
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::TruncatedInput(_)));
    }

    #[tokio::test]
    async fn same_plaintext_encrypts_differently_per_call() {
        let key = NetworkKey::generate().expect("key");
        let plaintext = vec![7u8; 1024];
        let mut first = Vec::new();
        let mut second = Vec::new();
        encrypt_stream(&key, &mut &plaintext[..], &mut first)
            .await
            .expect("first");
        encrypt_stream(&key, &mut &plaintext[..], &mut second)
            .await
            .expect("second");
        // Fresh IV per call; ciphertexts (and hence content hashes) differ.
        assert_ne!(first, second);
    }
}
