//! Module implement content hashing, used for query-cache keys and for
//! naming transfer logs.

use std::hash::{BuildHasher, Hasher};

/// Type uses google's city hash to convert [Hash]able key into ``u64``.
/// Refer [cityhash_rs] for details.
///
/// Unlike std's hashers, every `write` folds the new bytes into the
/// running 128-bit digest, so that a sequence of writes hash to a stable
/// content digest.
#[derive(Clone, Copy, Default)]
pub struct CityHasher {
    digest: u128,
}

impl CityHasher {
    pub fn new() -> CityHasher {
        CityHasher::default()
    }

    /// Return the full 128-bit digest.
    pub fn to_digest(&self) -> u128 {
        self.digest
    }
}

impl BuildHasher for CityHasher {
    type Hasher = Self;

    #[inline]
    fn build_hasher(&self) -> Self {
        *self
    }
}

impl Hasher for CityHasher {
    fn finish(&self) -> u64 {
        ((self.digest >> 64) as u64) ^ ((self.digest & 0xFFFFFFFFFFFFFFFF) as u64)
    }

    fn write(&mut self, bytes: &[u8]) {
        let digest = cityhash_rs::cityhash_110_128(bytes);
        self.digest = match self.digest {
            0 => digest,
            seed => {
                let mut scratch = seed.to_le_bytes().to_vec();
                scratch.extend_from_slice(&digest.to_le_bytes());
                cityhash_rs::cityhash_110_128(&scratch)
            }
        };
    }
}

/// Compute 128-bit content digest for `bytes`.
pub fn digest128(bytes: &[u8]) -> u128 {
    cityhash_rs::cityhash_110_128(bytes)
}

/// Hash `bytes` into a 16 character, file-name safe, hex string.
pub fn hash16(bytes: &[u8]) -> String {
    let mut hasher = CityHasher::new();
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}
