//! Content digests.
//!
//! Every operation blob is addressed by the SHA256 of its exact serialized
//! bytes, rendered as `sha256:<hex>`. Layer stacks are addressed by rolling
//! chain digests derived from the same primitive.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A content digest in `sha256:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest of raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Parse and validate a rendered digest.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("sha256", hex))
                if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Digest(s.to_string()))
            }
            _ => Err(StrataError::InvalidDigest { digest: s.to_string() }),
        }
    }

    /// Rolling chain digest: the digest of `"<parent> <next>"`. The root of
    /// a chain is the leaf digest itself, so
    /// `chain_id(n) = chain(chain_id(n-1), diff_id(n))`.
    pub fn chain(parent: &Digest, next: &Digest) -> Digest {
        Digest::from_bytes(format!("{} {}", parent, next).as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        let d = Digest::from_bytes(b"hello");
        assert!(d.as_str().starts_with("sha256:"));
        assert_eq!(d.as_str().len(), "sha256:".len() + 64);
        // Stable for identical input
        assert_eq!(d, Digest::from_bytes(b"hello"));
        assert_ne!(d, Digest::from_bytes(b"world"));
    }

    #[test]
    fn test_parse() {
        let d = Digest::from_bytes(b"x");
        assert_eq!(Digest::parse(d.as_str()).unwrap(), d);

        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse("sha256:zzzz").is_err());
        assert!(Digest::parse("no-colon").is_err());
    }

    #[test]
    fn test_chain_law() {
        // chain(root, child) must equal the digest of "<root> <child>",
        // bit for bit.
        let d0 = Digest::from_bytes(b"layer0");
        let d1 = Digest::from_bytes(b"layer1");
        let chained = Digest::chain(&d0, &d1);
        let manual = Digest::from_bytes(format!("{} {}", d0, d1).as_bytes());
        assert_eq!(chained, manual);

        // Chaining is order sensitive.
        assert_ne!(Digest::chain(&d0, &d1), Digest::chain(&d1, &d0));
    }
}
