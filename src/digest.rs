//! Content digests and chain identities
//!
//! Digests are always rendered in their canonical `sha256:<hex>` form. The
//! chain functions hash those canonical strings joined by a single space, so
//! identities computed in different processes compare bit-for-bit.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Algorithm prefix of every digest this crate produces
pub const SHA256: &str = "sha256";

const SHA256_HEX_LEN: usize = 64;

/// A canonical content digest (`sha256:<hex>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest of an in-memory byte slice
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut digester = Digester::new();
        digester.update(bytes);
        digester.finish()
    }

    /// Parse and validate a canonical digest string
    pub fn parse(s: &str) -> CacheResult<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| CacheError::DigestInvalid(s.to_string()))?;
        if algorithm != SHA256 {
            return Err(CacheError::DigestInvalid(format!(
                "{}: unsupported algorithm {}",
                s, algorithm
            )));
        }
        let valid_hex = encoded.len() == SHA256_HEX_LEN
            && encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid_hex {
            return Err(CacheError::DigestInvalid(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex-encoded part after the algorithm prefix
    pub fn encoded(&self) -> &str {
        &self.0[SHA256.len() + 1..]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

/// Incremental digest computation for streamed content
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> Digest {
        Digest(format!("{}:{}", SHA256, hex::encode(self.hasher.finalize())))
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Chain identity of an uncompressed layer sequence
///
/// The first layer's chain id is its diff id; every later layer hashes the
/// parent chain id and its own diff id.
pub fn chain_id(parent_chain_id: Option<&Digest>, diff_id: &Digest) -> Digest {
    match parent_chain_id {
        None => diff_id.clone(),
        Some(parent) => Digest::from_bytes(format!("{} {}", parent, diff_id).as_bytes()),
    }
}

/// Chain identity of a layer sequence including each layer's encoding
pub fn blob_chain_id(
    parent_blob_chain_id: Option<&Digest>,
    blob_digest: &Digest,
    diff_id: &Digest,
) -> Digest {
    let layer = Digest::from_bytes(format!("{} {}", blob_digest, diff_id).as_bytes());
    match parent_blob_chain_id {
        None => layer,
        Some(parent) => Digest::from_bytes(format!("{} {}", parent, layer).as_bytes()),
    }
}
