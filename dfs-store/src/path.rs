//! Mapping from logical keys to on-disk locations.

use std::fmt;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Width of each directory segment of a content address.
pub const SEGMENT_LEN: usize = 5;

/// Relative location of an object below its owner's directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// `/`-separated directory path.
    pub path_name: String,
    /// Leaf file name.
    pub file_name: String,
}

impl PathKey {
    /// `path_name/file_name`.
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path_name, self.file_name)
    }

    /// First directory segment of `path_name`, empty if there is none.
    pub fn first_segment(&self) -> &str {
        self.path_name.split('/').next().unwrap_or_default()
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path())
    }
}

/// Strategy turning a key into a [`PathKey`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathTransform {
    /// SHA-1 of the key split into 5-character directories, digest as leaf.
    #[default]
    Cas,
    /// The raw key as both directory and leaf.
    Flat,
}

impl PathTransform {
    pub fn apply(&self, key: &str) -> PathKey {
        match self {
            PathTransform::Cas => cas_path_key(key),
            PathTransform::Flat => flat_path_key(key),
        }
    }
}

/// Content-addressed mapping: `aaaaa/bbbbb/.../hhhhh` + 40-char digest.
pub fn cas_path_key(key: &str) -> PathKey {
    let hash = HEXLOWER.encode(&Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = (0..hash.len() / SEGMENT_LEN)
        .map(|i| &hash[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN])
        .collect();

    PathKey {
        path_name: segments.join("/"),
        file_name: hash,
    }
}

/// Identity mapping, for debugging and human-browsable roots.
pub fn flat_path_key(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}
