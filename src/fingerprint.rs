//! Content fingerprints used as deduplication keys.
//!
//! A fingerprint is the SHA-256 digest of an upload's bytes rendered as 64
//! lowercase hex characters. Filenames and arrival order play no part.

use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters in a full fingerprint.
pub const FINGERPRINT_LEN: usize = 64;

/// Number of hex characters shown in upload results.
pub const SHORT_LEN: usize = 8;

/// SHA-256 content digest, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a byte buffer. Never fails, including for empty input.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Accepts an existing digest, e.g. a ledger key read from disk.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == FINGERPRINT_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, for human-readable correlation.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_LEN]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = Fingerprint::of(b"hello world");
        let b = Fingerprint::of(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn known_digest_of_empty_input() {
        let fp = Fingerprint::of(b"");
        assert_eq!(
            fp.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(fp.short(), "e3b0c442");
    }

    #[test]
    fn different_content_different_fingerprint() {
        assert_ne!(Fingerprint::of(b"content1"), Fingerprint::of(b"content2"));
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        let fp = Fingerprint::of(b"x");
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp.clone()));
        assert_eq!(
            Fingerprint::parse(&fp.as_str().to_uppercase()),
            Some(fp.clone())
        );
        assert!(Fingerprint::parse("abc").is_none());
        assert!(Fingerprint::parse(&"z".repeat(FINGERPRINT_LEN)).is_none());
    }
}
