//! Content-addressed fingerprinting for deduplication.
//!
//! The dedup key is a 64-bit xxh3 hash over the full byte content. It is
//! chosen for throughput on large files, not for adversarial collision
//! resistance; `ContentHash` is a newtype so a stronger hash can replace
//! it without touching callers.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// 64-bit content fingerprint, rendered as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub u64);

impl ContentHash {
    /// Hash a full in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        ContentHash(xxhash_rust::xxh3::xxh3_64(data))
    }

    /// Hash a reader to EOF in fixed-size chunks, returning the hash and
    /// the total number of bytes read.
    pub fn of_reader<R: Read>(mut reader: R) -> std::io::Result<(Self, u64)> {
        let mut hasher = Xxh3::new();
        let mut buf = [0u8; HASH_BUF_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((ContentHash(hasher.digest()), total))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            anyhow::bail!("Invalid content hash length: {}", s.len());
        }
        let value = u64::from_str_radix(s, 16)
            .map_err(|e| anyhow::anyhow!("Invalid content hash '{}': {}", s, e))?;
        Ok(ContentHash(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_and_reader_agree() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(5000);
        let direct = ContentHash::of_bytes(&data);
        let (streamed, total) = ContentHash::of_reader(&data[..]).unwrap();
        assert_eq!(direct, streamed);
        assert_eq!(total, data.len() as u64);
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(ContentHash::of_bytes(b"a"), ContentHash::of_bytes(b"b"));
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = ContentHash::of_bytes(b"round trip");
        let parsed: ContentHash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_string().len(), 16);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!("zzzz".parse::<ContentHash>().is_err());
        assert!("0123456789abcdef0".parse::<ContentHash>().is_err());
    }
}
