//! Content digests.
//!
//! A digest is the identity of every blob and manifest: `<algorithm>:<hex>`,
//! lowercase, with equality defined as byte equality of that canonical form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;

/// Digest algorithms the core can compute and verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex encoding for this algorithm.
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start a streaming hash with this algorithm.
    pub fn digester(&self) -> Digester {
        Digester {
            state: match self {
                Algorithm::Sha256 => State::Sha256(sha2::Sha256::new()),
                Algorithm::Sha512 => State::Sha512(sha2::Sha512::new()),
            },
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(InvalidDigest::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Error parsing a digest string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDigest {
    #[error("unknown digest algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("digest is not of the form <algorithm>:<hex>: {0}")]
    MissingSeparator(String),

    #[error("digest hex is malformed for {algorithm}: {hex}")]
    MalformedHex { algorithm: Algorithm, hex: String },
}

/// The identity of a blob or manifest: an algorithm and the lowercase hex
/// encoding of the hash it produced.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Construct a digest from parts, validating the hex encoding.
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Result<Self, InvalidDigest> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(InvalidDigest::MalformedHex { algorithm, hex });
        }
        Ok(Self { algorithm, hex })
    }

    /// Compute the sha256 digest of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut digester = Algorithm::Sha256.digester();
        digester.update(bytes);
        digester.finalize()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| InvalidDigest::MissingSeparator(s.to_string()))?;
        Digest::new(algorithm.parse()?, hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

enum State {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

/// A streaming hash in progress.
pub struct Digester {
    state: State,
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.state {
            State::Sha256(_) => Algorithm::Sha256,
            State::Sha512(_) => Algorithm::Sha512,
        };
        f.debug_struct("Digester")
            .field("algorithm", &algorithm)
            .finish()
    }
}

impl Digester {
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            State::Sha256(hash) => hash.update(bytes),
            State::Sha512(hash) => hash.update(bytes),
        }
    }

    pub fn finalize(self) -> Digest {
        match self.state {
            State::Sha256(hash) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(hash.finalize()),
            },
            State::Sha512(hash) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(hash.finalize()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn from_bytes_matches_known_vector() {
        // sha256 of "hello\n"
        assert_eq!(Digest::from_bytes(b"hello\n").to_string(), HELLO);
    }

    #[test]
    fn parse_round_trips() {
        let digest: Digest = HELLO.parse().unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.to_string(), HELLO);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(Digest::from_str("sha256:xyz").is_err());
        assert!(Digest::from_str("sha256:ABCD").is_err());
        assert!(Digest::from_str("nodigest").is_err());
        assert!(Digest::from_str("md5:5891b5b5").is_err());
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut digester = Algorithm::Sha256.digester();
        digester.update(b"hel");
        digester.update(b"lo\n");
        assert_eq!(digester.finalize(), Digest::from_bytes(b"hello\n"));
    }

    #[test]
    fn serde_uses_canonical_string() {
        let digest: Digest = HELLO.parse().unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{HELLO}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
