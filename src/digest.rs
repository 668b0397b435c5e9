use std::{fmt, path::PathBuf, str::FromStr};

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::{Error, Result, BLOBS_DIRECTORY};

/// A content digest algorithm usable as a blob storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    /// The algorithm used whenever the requested one is unavailable.
    pub const CANONICAL: Algorithm = Algorithm::Sha256;

    pub const fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded hash value.
    pub const fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha384 => 96,
            Algorithm::Sha512 => 128,
        }
    }

    /// Looks up an algorithm by name, substituting [`Algorithm::CANONICAL`] for anything
    /// this build can't compute.
    pub fn from_name_or_canonical(name: &str) -> Algorithm {
        name.parse().unwrap_or_else(|_| {
            log::debug!("digest algorithm {name:?} unavailable, using {}", Self::CANONICAL);
            Self::CANONICAL
        })
    }

    pub fn hasher(self) -> Hasher {
        match self {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(Error::Unsupported(format!("digest algorithm {other}"))),
        }
    }
}

/// A running digest computation for one [`Algorithm`].
#[derive(Clone)]
pub enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hasher").field(&self.algorithm()).finish()
    }
}

impl Hasher {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Hasher::Sha256(_) => Algorithm::Sha256,
            Hasher::Sha384(_) => Algorithm::Sha384,
            Hasher::Sha512(_) => Algorithm::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Consumes the hasher and produces the algorithm-tagged digest.
    pub fn finalize(self) -> Result<Digest> {
        let algorithm = self.algorithm();
        let hex = match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };
        format_digest(algorithm, &hex)
    }
}

/// Builds an OCI digest from an algorithm and a lowercase hex value.
pub fn format_digest(algorithm: Algorithm, hex: &str) -> Result<Digest> {
    parse_digest(&format!("{algorithm}:{hex}"))
}

/// Parses a `<algorithm>:<hex>` string.
pub fn parse_digest(s: &str) -> Result<Digest> {
    Digest::from_str(s).map_err(|e| Error::Corrupt(format!("invalid digest {s:?}: {e}")))
}

/// Splits a digest into its algorithm and hex value.
///
/// Fails with [`Error::Unsupported`] for algorithms this crate can't address.
pub fn split_digest(digest: &Digest) -> Result<(Algorithm, String)> {
    let text = digest.to_string();
    let Some((algorithm, hex)) = text.split_once(':') else {
        return Err(Error::Corrupt(format!("digest {text:?} has no algorithm")));
    };
    let algorithm: Algorithm = algorithm.parse()?;
    if hex.len() != algorithm.hex_len() || !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Corrupt(format!("digest {text:?} has a malformed value")));
    }
    Ok((algorithm, hex.to_ascii_lowercase()))
}

/// Returns `blobs/<algorithm>/<hex>` for a digest, relative to an image layout root.
pub fn blob_relative_path(digest: &Digest) -> Result<PathBuf> {
    let (algorithm, hex) = split_digest(digest)?;
    Ok(PathBuf::from(BLOBS_DIRECTORY).join(algorithm.name()).join(hex))
}

/// Hashes an in-memory buffer.
pub fn digest_bytes(algorithm: Algorithm, data: &[u8]) -> Result<Digest> {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_known_digest() {
        let digest = digest_bytes(Algorithm::Sha256, b"").unwrap();
        assert_eq!(digest.to_string(), format!("sha256:{EMPTY_SHA256}"));

        let (algorithm, hex) = split_digest(&digest).unwrap();
        assert_eq!(algorithm, Algorithm::Sha256);
        assert_eq!(hex, EMPTY_SHA256);
    }

    #[test]
    fn test_hex_lengths() {
        for algorithm in [Algorithm::Sha256, Algorithm::Sha384, Algorithm::Sha512] {
            let digest = digest_bytes(algorithm, b"hello").unwrap();
            let (parsed, hex) = split_digest(&digest).unwrap();
            assert_eq!(parsed, algorithm);
            assert_eq!(hex.len(), algorithm.hex_len());
        }
    }

    #[test]
    fn test_canonical_fallback() {
        assert_eq!(Algorithm::from_name_or_canonical("sha512"), Algorithm::Sha512);
        assert_eq!(Algorithm::from_name_or_canonical("md5"), Algorithm::CANONICAL);
        assert_eq!(Algorithm::from_name_or_canonical(""), Algorithm::Sha256);
        assert!("blake3".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_blob_path() {
        let digest = parse_digest(&format!("sha256:{EMPTY_SHA256}")).unwrap();
        assert_eq!(
            blob_relative_path(&digest).unwrap(),
            PathBuf::from(format!("blobs/sha256/{EMPTY_SHA256}"))
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Algorithm::Sha512.hasher();
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(
            hasher.finalize().unwrap(),
            digest_bytes(Algorithm::Sha512, b"hello").unwrap()
        );
    }

    #[test]
    fn test_invalid_digest() {
        assert!(matches!(parse_digest("nonsense"), Err(Error::Corrupt(_))));
    }
}
