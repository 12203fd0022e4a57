//! Content hashing for deduplication.
//!
//! The default hasher is FxHash over the raw bytes (64-bit, non-cryptographic).
//! SHA-256 is available as a fallback and produces a longer digest; callers only
//! ever compare `ContentHash` values, so switching algorithms never changes the
//! dedup contract.

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, Read};
use std::path::Path;

/// Read buffer size. Must stay a multiple of 8 so FxHash sees the same word
/// boundaries no matter how the OS splits reads.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// FxHash, 64-bit
    #[default]
    Fx,
    /// SHA-256, used when a collision-resistant digest is required
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Fx => "fx",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fx" | "fxhash" | "fx64" => Ok(HashAlgorithm::Fx),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            other => Err(format!("unknown hash algorithm '{}' (expected fx or sha256)", other)),
        }
    }
}

/// Hex digest of a file's bytes, tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    digest: String,
}

impl ContentHash {
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Short prefix for directory names and log lines.
    pub fn short(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Fill `buf` completely unless EOF is reached first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Hash everything `reader` yields. Returns the hash and the number of bytes read.
pub fn hash_reader<R: Read>(mut reader: R, algorithm: HashAlgorithm) -> io::Result<(ContentHash, u64)> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    let digest = match algorithm {
        HashAlgorithm::Fx => {
            let mut hasher = FxHasher::default();
            loop {
                let n = read_full(&mut reader, &mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.write(&buf[..n]);
                total += n as u64;
                if n < CHUNK_SIZE {
                    break;
                }
            }
            // Fold the length in so zero-padded variants of the same prefix differ
            hasher.write_u64(total);
            format!("{:016x}", hasher.finish())
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = read_full(&mut reader, &mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                total += n as u64;
                if n < CHUNK_SIZE {
                    break;
                }
            }
            hex::encode(hasher.finalize())
        }
    };

    Ok((ContentHash { algorithm, digest }, total))
}

pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<(ContentHash, u64)> {
    let file = File::open(path)?;
    hash_reader(file, algorithm)
}

/// In-memory equivalent of [`hash_reader`]; chunk boundaries match, so the
/// result is identical to hashing the same bytes from disk.
pub fn hash_bytes(bytes: &[u8], algorithm: HashAlgorithm) -> ContentHash {
    let digest = match algorithm {
        HashAlgorithm::Fx => {
            let mut hasher = FxHasher::default();
            for chunk in bytes.chunks(CHUNK_SIZE) {
                hasher.write(chunk);
            }
            hasher.write_u64(bytes.len() as u64);
            format!("{:016x}", hasher.finish())
        }
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
    };
    ContentHash { algorithm, digest }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_fx_digest_is_64_bit_hex() {
        let hash = hash_bytes(b"hello world", HashAlgorithm::Fx);
        assert_eq!(hash.digest().len(), 16);
        assert!(hash.digest().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sha256_known_vector() {
        let hash = hash_bytes(b"abc", HashAlgorithm::Sha256);
        assert_eq!(
            hash.digest(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_short_reads_do_not_change_hash() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        for algorithm in [HashAlgorithm::Fx, HashAlgorithm::Sha256] {
            let whole = hash_bytes(&data, algorithm);
            let (trickled, len) = hash_reader(Trickle { data: &data, step: 4097 }, algorithm).unwrap();
            assert_eq!(whole, trickled);
            assert_eq!(len, data.len() as u64);
        }
    }

    #[test]
    fn test_hashes_sort_by_algorithm_then_digest() {
        let sha = hash_bytes(b"a", HashAlgorithm::Sha256);
        let fx_b = hash_bytes(b"b", HashAlgorithm::Fx);
        let fx_a = hash_bytes(b"a", HashAlgorithm::Fx);
        let mut hashes = vec![sha.clone(), fx_b.clone(), fx_a.clone()];
        hashes.sort();
        assert_eq!(hashes[2], sha);
        assert!(hashes[0].digest() <= hashes[1].digest());
        assert!(HashAlgorithm::Fx < HashAlgorithm::Sha256);
    }

    #[test]
    fn test_different_content_different_hash() {
        let a = hash_bytes(b"media-one", HashAlgorithm::Fx);
        let b = hash_bytes(b"media-two", HashAlgorithm::Fx);
        assert_ne!(a, b);
    }

    #[test]
    fn test_trailing_zero_changes_hash() {
        let a = hash_bytes(&[1, 2, 3], HashAlgorithm::Fx);
        let b = hash_bytes(&[1, 2, 3, 0], HashAlgorithm::Fx);
        assert_ne!(a, b);
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("fx".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Fx);
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_serializes_as_plain_digest() {
        let hash = hash_bytes(b"abc", HashAlgorithm::Sha256);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.digest()));
    }
}
