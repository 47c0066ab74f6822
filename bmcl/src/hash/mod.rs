//! Hashing utilities.
//!
//! The catalog mixes two digest widths. A 32-character hex digest is
//! MD5, anything else is SHA-1.


use digest::Digest;
use md5::Md5;
use sha1::Sha1;

/// The length of a hex-encoded MD5 digest.
const MD5_HEX_LEN: usize = 32;

/// A digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,
}

/// An incremental hasher for either algorithm.
#[derive(Clone)]
pub enum FileHasher {
    Md5(Md5),
    Sha1(Sha1),
}

impl HashAlgorithm {
    /// Infers the algorithm from a hex-encoded digest.
    pub fn from_hash(hash: &str) -> Self {
        if hash.len() == MD5_HEX_LEN {
            Self::Md5
        } else {
            Self::Sha1
        }
    }

    /// Returns a fresh hasher.
    pub fn hasher(&self) -> FileHasher {
        match self {
            Self::Md5 => FileHasher::Md5(Md5::new()),
            Self::Sha1 => FileHasher::Sha1(Sha1::new()),
        }
    }

    /// Hashes a slice, returning the hex-encoded digest.
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        hasher.finalize_hex()
    }
}

impl FileHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(d) => d.update(data),
            Self::Sha1(d) => d.update(data),
        }
    }

    /// Consumes the hasher, returning the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(d) => hex::encode(d.finalize()),
            Self::Sha1(d) => hex::encode(d.finalize()),
        }
    }
}

impl std::fmt::Debug for FileHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5(_) => f.write_str("FileHasher::Md5"),
            Self::Sha1(_) => f.write_str("FileHasher::Sha1"),
        }
    }
}

/// Returns whether `data` matches the expected hex digest.
///
/// The comparison is case-insensitive.
pub fn verify_bytes(expected: &str, data: &[u8]) -> bool {
    HashAlgorithm::from_hash(expected)
        .hash_bytes(data)
        .eq_ignore_ascii_case(expected)
}
