//! File descriptors.
//!
//! Every file in the catalog is immutable and addressed by its digest.
//! The digest is either MD5 (32 hex characters) or SHA-1 (40 hex
//! characters); see [`HashAlgorithm::from_hash`].
//!
//! ## Storage layout
//!
//! Backends keep files under a sharded tree:
//!
//! ```text
//! download/{first two hex characters}/{hash}
//! ```

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{BmclError, BmclResult};
use crate::hash::HashAlgorithm;

/// The directory all served files live under.
pub const DOWNLOAD_PREFIX: &str = "download";

/// A file in the manifest.
///
/// Two descriptors are equal if they describe the same content, that is,
/// their hash and size match. The path and modification time are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmclFile {
    /// The path to fetch the file from, relative to the control plane.
    pub path: String,

    /// Hex-encoded digest of the content.
    pub hash: String,

    /// Size of the content in bytes.
    pub size: u64,

    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
}

impl BmclFile {
    /// Returns the digest algorithm of this file.
    pub fn algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::from_hash(&self.hash)
    }

    /// Returns whether the file is a zero-byte file.
    ///
    /// Zero-byte files are never downloaded or stored.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the path of the file inside a storage backend.
    pub fn storage_path(&self) -> String {
        download_path(&self.hash)
    }
}

impl PartialEq for BmclFile {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.size == other.size
    }
}

impl Eq for BmclFile {}

impl Hash for BmclFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// Returns the shard of a hash.
///
/// Hashes shorter than two characters live in their own shard.
pub fn hash_prefix(hash: &str) -> &str {
    hash.get(..2).unwrap_or(hash)
}

/// Returns the storage path of a hash.
pub fn download_path(hash: &str) -> String {
    format!("{}/{}/{}", DOWNLOAD_PREFIX, hash_prefix(hash), hash)
}

/// Returns the name of a shard directory.
pub fn shard_name(shard: u8) -> String {
    format!("{:02x}", shard)
}

/// Returns the highest modification time of a set of files.
pub fn last_modified<'a>(files: impl IntoIterator<Item = &'a BmclFile>) -> i64 {
    files.into_iter().map(|f| f.mtime).max().unwrap_or(0)
}

/// Validates a hash received from a client.
pub fn validate_hash(hash: &str) -> BmclResult<()> {
    if hash.len() < 2 {
        return Err(BmclError::InvalidHash {
            hash: hash.to_owned(),
            reason: "Hash is too short",
        });
    }

    if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BmclError::InvalidHash {
            hash: hash.to_owned(),
            reason: "Hash must only contain hexadecimal characters",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    fn file(path: &str, hash: &str, size: u64, mtime: i64) -> BmclFile {
        BmclFile {
            path: path.to_string(),
            hash: hash.to_string(),
            size,
            mtime,
        }
    }

    #[test]
    fn test_equality_ignores_path_and_mtime() {
        let a = file("/a", "0123456789abcdef0123456789abcdef", 4, 1);
        let b = file("/b", "0123456789abcdef0123456789abcdef", 4, 2000);
        let c = file("/a", "0123456789abcdef0123456789abcdef", 5, 1);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(1, set.len());
    }

    #[test]
    fn test_download_path() {
        assert_eq!("download/ab/abcdef", download_path("abcdef"));
        assert_eq!("download/0f", format!("{}/{}", DOWNLOAD_PREFIX, shard_name(15)));
    }

    #[test]
    fn test_last_modified() {
        let files = vec![file("/a", "aa", 1, 10), file("/b", "bb", 1, 30), file("/c", "cc", 1, 20)];
        assert_eq!(30, last_modified(&files));
        assert_eq!(0, last_modified(&[]));
    }

    #[test]
    fn test_validate_hash() {
        assert!(validate_hash("ff").is_ok());
        assert!(validate_hash("f").is_err());
        assert!(validate_hash("../etc/passwd").is_err());
        assert!(validate_hash("zz00").is_err());
    }
}
