//! Seeded 32-bit key hash.
//!
//! The hash must be stable across runs for a given seed since hashes are
//! persisted in index slots; the seed itself is stored in `db.meta`.

const C1: u32 = 0xcc9e2d51;
const C2: u32 = 0x1b873593;

/// Murmur3 32-bit hash of `data` with `seed`.
pub(crate) fn sum32_with_seed(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    // Final avalanche.
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}

/// Generate a random hash seed for a fresh database.
pub(crate) fn random_seed() -> u32 {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(sum32_with_seed(b"", 0), 0);
        assert_eq!(sum32_with_seed(b"hello", 0), 0x248b_fa47);
        assert_eq!(sum32_with_seed(b"hello, world", 0), 0x149b_bb7f);
    }

    #[test]
    fn seed_changes_hash() {
        let h1 = sum32_with_seed(b"key", 1);
        let h2 = sum32_with_seed(b"key", 2);
        assert_ne!(h1, h2);
        // Stable for the same seed.
        assert_eq!(h1, sum32_with_seed(b"key", 1));
    }

    #[test]
    fn nearby_keys_diverge() {
        let h1 = sum32_with_seed(b"hello", 0xbc9f1d34);
        let h2 = sum32_with_seed(b"hellp", 0xbc9f1d34);
        assert!(hamming_distance(h1, h2) >= 10);
    }

    fn hamming_distance(n1: u32, n2: u32) -> u32 {
        (n1 ^ n2).count_ones()
    }
}
