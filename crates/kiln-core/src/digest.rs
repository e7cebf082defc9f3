//! Digest Cache - reusable hash-algorithm instances keyed by algorithm id
//!
//! Hash primitives are stateful and single-threaded. A `DigesterCache`
//! hands out one instance per algorithm and resets it on every fetch, so
//! callers never see state left behind by a previous use. The `&mut`
//! borrow returned by `get` makes concurrent use of one id impossible;
//! give each worker its own cache.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::error::DigestError;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// BLAKE3 (fast, default)
    #[default]
    Blake3,
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn id(&self) -> &'static str {
        match self {
            DigestAlgorithm::Blake3 => "blake3",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim();
        if id.is_empty() {
            return Err(DigestError::EmptyAlgorithmId);
        }
        match id.to_ascii_lowercase().replace('-', "").as_str() {
            "blake3" => Ok(DigestAlgorithm::Blake3),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(DigestError::UnknownAlgorithm(id.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A stateful hash instance
pub enum MutableDigester {
    Blake3(Box<blake3::Hasher>),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl MutableDigester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Blake3 => MutableDigester::Blake3(Box::new(blake3::Hasher::new())),
            DigestAlgorithm::Sha1 => MutableDigester::Sha1(sha1::Sha1::new()),
            DigestAlgorithm::Sha256 => MutableDigester::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha512 => MutableDigester::Sha512(sha2::Sha512::new()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            MutableDigester::Blake3(_) => DigestAlgorithm::Blake3,
            MutableDigester::Sha1(_) => DigestAlgorithm::Sha1,
            MutableDigester::Sha256(_) => DigestAlgorithm::Sha256,
            MutableDigester::Sha512(_) => DigestAlgorithm::Sha512,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            MutableDigester::Blake3(h) => {
                h.update(bytes);
            }
            MutableDigester::Sha1(h) => Digest::update(h, bytes),
            MutableDigester::Sha256(h) => Digest::update(h, bytes),
            MutableDigester::Sha512(h) => Digest::update(h, bytes),
        }
    }

    /// Feed a length-prefixed field so adjacent fields cannot run together
    pub fn update_field(&mut self, bytes: &[u8]) {
        self.update(&(bytes.len() as u64).to_le_bytes());
        self.update(bytes);
    }

    pub fn reset(&mut self) {
        match self {
            MutableDigester::Blake3(h) => {
                h.reset();
            }
            MutableDigester::Sha1(h) => Digest::reset(h),
            MutableDigester::Sha256(h) => Digest::reset(h),
            MutableDigester::Sha512(h) => Digest::reset(h),
        }
    }

    /// Render the digest as lowercase hex and reset to the initial state
    pub fn finish_hex(&mut self) -> String {
        match self {
            MutableDigester::Blake3(h) => {
                let hex = h.finalize().to_hex().to_string();
                h.reset();
                hex
            }
            MutableDigester::Sha1(h) => hex::encode(h.finalize_reset()),
            MutableDigester::Sha256(h) => hex::encode(h.finalize_reset()),
            MutableDigester::Sha512(h) => hex::encode(h.finalize_reset()),
        }
    }
}

impl io::Write for MutableDigester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for MutableDigester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MutableDigester").field(&self.algorithm()).finish()
    }
}

/// Per-owner cache of digesters, one per algorithm
#[derive(Debug, Default)]
pub struct DigesterCache {
    digesters: HashMap<DigestAlgorithm, MutableDigester>,
    allocations: usize,
}

impl DigesterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the digester for `algorithm_id`, reset to its initial state
    pub fn get(&mut self, algorithm_id: &str) -> Result<&mut MutableDigester, DigestError> {
        let algorithm = algorithm_id.parse()?;
        Ok(self.get_algorithm(algorithm))
    }

    pub fn get_algorithm(&mut self, algorithm: DigestAlgorithm) -> &mut MutableDigester {
        let allocations = &mut self.allocations;
        let digester = self.digesters.entry(algorithm).or_insert_with(|| {
            *allocations += 1;
            MutableDigester::new(algorithm)
        });
        digester.reset();
        digester
    }

    /// Number of digesters this cache has ever allocated
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_shot(algorithm: DigestAlgorithm, data: &[u8]) -> String {
        let mut digester = MutableDigester::new(algorithm);
        digester.update(data);
        digester.finish_hex()
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            one_shot(DigestAlgorithm::Sha1, b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            one_shot(DigestAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            one_shot(DigestAlgorithm::Blake3, b"abc"),
            blake3::hash(b"abc").to_hex().to_string()
        );
    }

    #[test]
    fn test_reset_between_fetches() {
        let mut cache = DigesterCache::new();

        let first = cache.get("sha1").unwrap();
        first.update(b"a");
        let a = first.finish_hex();
        assert_eq!(a, "86f7e437faa5a7fce15d1ddcb9eaeaea377667b8");

        // Leave state behind on purpose, then refetch
        cache.get("sha1").unwrap().update(b"a");
        let second = cache.get("sha1").unwrap();
        second.update(b"b");
        assert_eq!(second.finish_hex(), one_shot(DigestAlgorithm::Sha1, b"b"));

        assert_eq!(cache.allocations(), 1);
    }

    #[test]
    fn test_one_instance_per_algorithm() {
        let mut cache = DigesterCache::new();
        cache.get("blake3").unwrap();
        cache.get("BLAKE3").unwrap();
        cache.get("sha-256").unwrap();
        cache.get_algorithm(DigestAlgorithm::Sha256);
        assert_eq!(cache.allocations(), 2);
    }

    #[test]
    fn test_rejects_bad_ids() {
        let mut cache = DigesterCache::new();
        assert_eq!(cache.get("").unwrap_err(), DigestError::EmptyAlgorithmId);
        assert_eq!(cache.get("   ").unwrap_err(), DigestError::EmptyAlgorithmId);
        assert!(matches!(
            cache.get("md4").unwrap_err(),
            DigestError::UnknownAlgorithm(id) if id == "md4"
        ));
        assert_eq!(cache.allocations(), 0);
    }

    #[test]
    fn test_update_field_separates_fields() {
        let mut left = MutableDigester::new(DigestAlgorithm::Blake3);
        left.update_field(b"ab");
        left.update_field(b"c");
        let mut right = MutableDigester::new(DigestAlgorithm::Blake3);
        right.update_field(b"a");
        right.update_field(b"bc");
        assert_ne!(left.finish_hex(), right.finish_hex());
    }
}
