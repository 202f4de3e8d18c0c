//! Streaming AES-256-CTR encryption for objects at rest and in flight.
//!
//! The ciphertext layout is `[16-byte IV][keystream XOR plaintext]`, so an
//! encrypted object is exactly `IV_LEN` bytes longer than its plaintext.
//! Data moves through a fixed 32 KiB buffer; inputs of any size are handled
//! without being loaded into memory.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Length of an encryption key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the IV prefixed to every ciphertext.
pub const IV_LEN: usize = 16;

const BUFFER_SIZE: usize = 32 * 1024;

/// Errors from the stream cipher.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("ciphertext ended before the IV was complete")]
    MissingIv,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a fresh random encryption key.
pub fn new_encryption_key() -> [u8; KEY_LEN] {
    rand::random()
}

/// Hash a logical key so replicas never learn the original name.
pub fn hash_key(key: &str) -> String {
    HEXLOWER.encode(&Sha256::digest(key.as_bytes()))
}

/// Encrypt `src` into `dst` under `key`.
///
/// Returns the number of bytes written to `dst`, IV included.
pub async fn encrypt_stream<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    check_key(key)?;
    let iv: [u8; IV_LEN] = rand::random();
    let mut cipher = new_cipher(key, &iv)?;

    dst.write_all(&iv).await?;
    let n = copy_stream(&mut cipher, src, dst).await?;

    Ok(IV_LEN as u64 + n)
}

/// Decrypt `src` (IV prefix included) into `dst` under `key`.
///
/// Returns the number of plaintext bytes written to `dst`.
pub async fn decrypt_stream<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    check_key(key)?;
    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CipherError::MissingIv
        } else {
            CipherError::Io(e)
        }
    })?;
    let mut cipher = new_cipher(key, &iv)?;

    copy_stream(&mut cipher, src, dst).await
}

fn check_key(key: &[u8]) -> Result<(), CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    Ok(())
}

fn new_cipher(key: &[u8], iv: &[u8; IV_LEN]) -> Result<Aes256Ctr, CipherError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

async fn copy_stream<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;

    Ok(written)
}
