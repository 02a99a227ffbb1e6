//! Hashing helpers for versions and fingerprints.
//!
//! - `content_version`: blake3 digest of byte content, folded to 64 bits
//! - `combine`: order-sensitive combination of several versions
//! - `compute` / `compute_reader`: fast FxHash for in-process lookups

use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::io::{self, Read};

/// Compute 64-bit FxHash from byte data.
#[inline]
pub fn compute<T: AsRef<[u8]> + ?Sized>(data: &T) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(data.as_ref());
    hasher.finish()
}

/// Content-based version number: first 8 bytes of the blake3 digest.
pub fn content_version(data: &[u8]) -> u64 {
    fold(blake3::hash(data).as_bytes())
}

/// Content-based version number computed from a reader (streaming).
pub fn content_version_reader(mut reader: impl Read) -> io::Result<u64> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buffer[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(fold(hasher.finalize().as_bytes()))
}

/// Combine versions in order. `[a, b]` and `[b, a]` give different results.
pub fn combine(versions: impl IntoIterator<Item = u64>) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for v in versions {
        hasher.update(&v.to_le_bytes());
    }
    fold(hasher.finalize().as_bytes())
}

#[inline]
fn fold(digest: &[u8; 32]) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_version_stable() {
        assert_eq!(content_version(b"var a;"), content_version(b"var a;"));
        assert_ne!(content_version(b"var a;"), content_version(b"var b;"));
    }

    #[test]
    fn test_reader_matches_slice() {
        let data = b"body { color: red; }".repeat(1000);
        let streamed = content_version_reader(&data[..]).unwrap();
        assert_eq!(streamed, content_version(&data));
    }

    #[test]
    fn test_combine_is_order_sensitive() {
        assert_eq!(combine([1, 2]), combine([1, 2]));
        assert_ne!(combine([1, 2]), combine([2, 1]));
    }

    #[test]
    fn test_fx_compute_deterministic() {
        assert_eq!(compute("abc"), compute("abc"));
        assert_ne!(compute("abc"), compute("abd"));
    }
}
