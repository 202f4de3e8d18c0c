//! Local object store: byte streams on disk, namespaced by owner.
//!
//! Objects live at `<root>/<owner>/<path_name>/<file_name>` where the path
//! comes from the configured [`PathTransform`]. There is no cache and no
//! locking; concurrent writers to the same `(owner, key)` race and the last
//! one to finish wins.
//!
//! Owners and keys arrive from remote peers, so every path is checked to stay
//! below the root: an owner is a single plain file name, and the path derived
//! from a key may only contain plain file names.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::crypto;
use crate::path::{PathKey, PathTransform};

/// Filesystem-backed object store.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    transform: PathTransform,
}

impl Storage {
    /// Create a store rooted at `root`. Nothing is created until first write.
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        let root = root.into();
        tracing::debug!(root = %root.display(), ?transform, "object store configured");
        Self { root, transform }
    }

    /// Get the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the key-to-path strategy.
    pub fn transform(&self) -> PathTransform {
        self.transform
    }

    /// Derive the relative path of `key`.
    pub fn path_key(&self, key: &str) -> PathKey {
        self.transform.apply(key)
    }

    /// Absolute path of the object `(owner, key)`.
    ///
    /// Fails if `owner` or the path derived from `key` would leave the root.
    pub fn object_path(&self, owner: &str, key: &str) -> Result<PathBuf> {
        let path_key = self.checked_path_key(key)?;
        Ok(self.owner_dir(owner)?.join(path_key.full_path()))
    }

    /// Whether `(owner, key)` exists.
    ///
    /// Only a missing path counts as absent; any other filesystem error is
    /// returned to the caller.
    pub async fn has(&self, owner: &str, key: &str) -> Result<bool> {
        let path = self.object_path(owner, key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("failed to stat object: {}", path.display()))
            }
        }
    }

    /// Copy `reader` into `(owner, key)`, replacing any previous content.
    pub async fn write<R>(&self, owner: &str, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (path, mut file) = self.open_for_writing(owner, key).await?;
        let n = tokio::io::copy(reader, &mut file)
            .await
            .with_context(|| format!("failed to write object: {}", path.display()))?;
        file.flush().await?;

        tracing::debug!(owner, key, bytes = n, "object written");
        Ok(n)
    }

    /// Encrypt `reader` under `enc_key` and store the ciphertext.
    ///
    /// Returns the stored size, IV included.
    pub async fn write_encrypted<R>(
        &self,
        enc_key: &[u8],
        owner: &str,
        key: &str,
        reader: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let (path, mut file) = self.open_for_writing(owner, key).await?;
        let n = crypto::encrypt_stream(enc_key, reader, &mut file)
            .await
            .with_context(|| format!("failed to write encrypted object: {}", path.display()))?;

        tracing::debug!(owner, key, bytes = n, "encrypted object written");
        Ok(n)
    }

    /// Decrypt `reader` (IV-prefixed ciphertext) under `enc_key` and store the
    /// plaintext.
    pub async fn write_decrypted<R>(
        &self,
        enc_key: &[u8],
        owner: &str,
        key: &str,
        reader: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let (path, mut file) = self.open_for_writing(owner, key).await?;
        let n = crypto::decrypt_stream(enc_key, reader, &mut file)
            .await
            .with_context(|| format!("failed to write decrypted object: {}", path.display()))?;

        tracing::debug!(owner, key, bytes = n, "decrypted object written");
        Ok(n)
    }

    /// Open `(owner, key)` for reading. Returns its size and the open file.
    pub async fn read(&self, owner: &str, key: &str) -> Result<(u64, File)> {
        let path = self.object_path(owner, key)?;
        let file = File::open(&path)
            .await
            .with_context(|| format!("failed to open object: {}", path.display()))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat object: {}", path.display()))?
            .len();
        Ok((size, file))
    }

    /// Remove the first path segment of `key` under `owner`.
    ///
    /// With content addressing this drops every object whose digest shares
    /// the same 5-character prefix, not only `key`.
    pub async fn delete(&self, owner: &str, key: &str) -> Result<()> {
        let path_key = self.checked_path_key(key)?;
        let prefix = self.owner_dir(owner)?.join(path_key.first_segment());

        remove_dir_all_if_exists(&prefix)
            .await
            .with_context(|| format!("failed to delete: {}", prefix.display()))?;

        tracing::info!(owner, file = %path_key.file_name, "deleted from disk");
        Ok(())
    }

    /// Remove the whole storage root.
    pub async fn clear(&self) -> Result<()> {
        remove_dir_all_if_exists(&self.root)
            .await
            .with_context(|| format!("failed to clear storage root: {}", self.root.display()))?;
        tracing::info!(root = %self.root.display(), "storage cleared");
        Ok(())
    }

    /// `<root>/<owner>`, refusing anything but a single plain file name.
    fn owner_dir(&self, owner: &str) -> Result<PathBuf> {
        let owner_path = Path::new(owner);
        if owner_path.components().count() != 1 || !is_plain_relative(owner_path) {
            bail!("invalid owner id: {owner:?}");
        }
        Ok(self.root.join(owner_path))
    }

    fn checked_path_key(&self, key: &str) -> Result<PathKey> {
        let path_key = self.path_key(key);
        if !is_plain_relative(Path::new(&path_key.path_name))
            || !is_plain_relative(Path::new(&path_key.file_name))
        {
            bail!("invalid object key: {key:?}");
        }
        Ok(path_key)
    }

    async fn open_for_writing(&self, owner: &str, key: &str) -> Result<(PathBuf, File)> {
        let path_key = self.checked_path_key(key)?;
        let dir = self.owner_dir(owner)?.join(&path_key.path_name);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;

        let path = dir.join(&path_key.file_name);
        let file = File::create(&path)
            .await
            .with_context(|| format!("failed to create object: {}", path.display()))?;
        Ok((path, file))
    }
}

/// Non-empty and made only of normal components: no root, prefix, `.` or `..`.
fn is_plain_relative(path: &Path) -> bool {
    let mut components = path.components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}

async fn remove_dir_all_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
