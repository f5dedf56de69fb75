//! Layer compression types
//!
//! Maps between compression types, OCI/Docker media types, and the byte
//! codecs used to decode and re-encode layer tarballs.

pub mod converter;

pub use converter::{Converter, StreamConverter};

use crate::descriptor::Descriptor;
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Media types understood by the cache
pub mod media_types {
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const OCI_LAYER_NONDISTRIBUTABLE: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar";
    pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
    pub const OCI_LAYER_NONDISTRIBUTABLE_ZSTD: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_LAYER_FOREIGN_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
}

/// Annotation present on eStargz blobs
pub const ESTARGZ_TOC_ANNOTATION: &str = "containerd.io/snapshot/stargz/toc.digest";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Default zstd level when none is configured
const ZSTD_DEFAULT_LEVEL: i32 = 3;

/// Compression applied to a layer blob
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Uncompressed,
    #[default]
    Gzip,
    Zstd,
    EStargz,
}

impl Compression {
    /// Every known compression type
    pub fn all() -> &'static [Self] {
        &[Self::Uncompressed, Self::Gzip, Self::Zstd, Self::EStargz]
    }

    /// Canonical OCI media type for this compression
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Uncompressed => media_types::OCI_LAYER,
            Self::Gzip | Self::EStargz => media_types::OCI_LAYER_GZIP,
            Self::Zstd => media_types::OCI_LAYER_ZSTD,
        }
    }

    /// Compression implied by a media type, if it is a known layer type
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        use media_types::*;
        match media_type {
            OCI_LAYER | OCI_LAYER_NONDISTRIBUTABLE | DOCKER_LAYER => Some(Self::Uncompressed),
            OCI_LAYER_GZIP
            | OCI_LAYER_NONDISTRIBUTABLE_GZIP
            | DOCKER_LAYER_GZIP
            | DOCKER_LAYER_FOREIGN_GZIP => Some(Self::Gzip),
            OCI_LAYER_ZSTD | OCI_LAYER_NONDISTRIBUTABLE_ZSTD => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Compression of a descriptor, accounting for eStargz annotations
    pub fn from_descriptor(desc: &Descriptor) -> CacheResult<Self> {
        let base = Self::from_media_type(&desc.media_type)
            .ok_or_else(|| CacheError::UnsupportedCompression(desc.media_type.clone()))?;
        if base == Self::Gzip && desc.annotations.contains_key(ESTARGZ_TOC_ANNOTATION) {
            return Ok(Self::EStargz);
        }
        Ok(base)
    }

    /// Sniff the compression of raw blob bytes
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::Uncompressed
        }
    }

    /// Wrap a reader so it yields uncompressed tar bytes
    pub fn decoder<'a, R: Read + 'a>(&self, reader: R) -> CacheResult<Box<dyn Read + 'a>> {
        match self {
            Self::Uncompressed => Ok(Box::new(reader)),
            Self::Gzip | Self::EStargz => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
            Self::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(reader)
                    .map_err(|e| CacheError::archive("opening zstd stream", e))?;
                Ok(Box::new(decoder))
            }
        }
    }

    /// Encode uncompressed bytes with this compression
    pub fn encode(&self, uncompressed: &[u8], level: Option<i32>) -> CacheResult<Vec<u8>> {
        match self {
            Self::Uncompressed => Ok(uncompressed.to_vec()),
            Self::Gzip => {
                let level = level
                    .map(|l| flate2::Compression::new(l.clamp(0, 9) as u32))
                    .unwrap_or_default();
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), level);
                encoder
                    .write_all(uncompressed)
                    .map_err(|e| CacheError::archive("gzip encoding", e))?;
                encoder
                    .finish()
                    .map_err(|e| CacheError::archive("gzip encoding", e))
            }
            Self::Zstd => zstd::stream::encode_all(uncompressed, level.unwrap_or(ZSTD_DEFAULT_LEVEL))
                .map_err(|e| CacheError::archive("zstd encoding", e)),
            Self::EStargz => Err(CacheError::UnsupportedCompression(
                "estargz encoding requires an external converter".to_string(),
            )),
        }
    }

    /// Decode a whole blob into uncompressed bytes
    pub fn decode(&self, blob: &[u8]) -> CacheResult<Vec<u8>> {
        let mut out = Vec::new();
        self.decoder(blob)?
            .read_to_end(&mut out)
            .map_err(|e| CacheError::archive(format!("decoding {} blob", self), e))?;
        Ok(out)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uncompressed => "uncompressed",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::EStargz => "estargz",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Compression {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncompressed" => Ok(Self::Uncompressed),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "estargz" => Ok(Self::EStargz),
            other => Err(CacheError::UnsupportedCompression(other.to_string())),
        }
    }
}

/// Whether a media type marks a layer as restricted from redistribution
pub fn is_non_distributable(media_type: &str) -> bool {
    use media_types::*;
    matches!(
        media_type,
        OCI_LAYER_NONDISTRIBUTABLE
            | OCI_LAYER_NONDISTRIBUTABLE_GZIP
            | OCI_LAYER_NONDISTRIBUTABLE_ZSTD
            | DOCKER_LAYER_FOREIGN_GZIP
    )
}

/// The distributable media type carrying the same compression
pub fn distributable_media_type(media_type: &str) -> String {
    use media_types::*;
    match media_type {
        OCI_LAYER_NONDISTRIBUTABLE => OCI_LAYER.to_string(),
        OCI_LAYER_NONDISTRIBUTABLE_GZIP => OCI_LAYER_GZIP.to_string(),
        OCI_LAYER_NONDISTRIBUTABLE_ZSTD => OCI_LAYER_ZSTD.to_string(),
        DOCKER_LAYER_FOREIGN_GZIP => DOCKER_LAYER_GZIP.to_string(),
        other => other.to_string(),
    }
}
