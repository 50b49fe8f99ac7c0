//! Fingerprint generation and the cache-line probe sequence.
//!
//! A bucket word packs 20 bits of hash tag over a 44-bit data index, so a tag
//! mismatch rules a bucket out without touching the data array. Probing walks
//! one cache line at a time; only a saturated line diversifies the hash.

/// Low 44 bits of a bucket word: the data index.
pub(crate) const MASK_INDEX: u64 = 0x0000_0fff_ffff_ffff;
/// High 20 bits of a bucket word: the hash tag.
pub(crate) const MASK_HASH: u64 = 0xffff_f000_0000_0000;

/// Seed of the first hash round. Custom hashers receive the same seed.
pub(crate) const HASH_SEED: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 1_099_511_628_211;

/// Cache line size in bytes; buckets are 8 bytes, so 8 buckets per line.
const LINE_SIZE: u64 = 64;
pub(crate) const BUCKETS_PER_LINE: u64 = LINE_SIZE / 8;
const LINE_MASK: u64 = !(BUCKETS_PER_LINE - 1);
const LINE_MASK_R: u64 = BUCKETS_PER_LINE - 1;

/// The fingerprint function. Chaining it (feeding a previous hash back in as
/// the seed) yields the rehash sequence that picks fresh cache lines, so this
/// must stay bit-exact: downstream users tune cache behavior to it.
#[inline]
pub(crate) fn mix(a: u64, b: u64, seed: u64) -> u64 {
    let mut hash = seed;
    hash ^= a;
    hash = hash.rotate_left(47).wrapping_mul(PRIME);
    hash ^= b;
    hash = hash.rotate_left(31).wrapping_mul(PRIME);
    hash ^ (hash >> 32)
}

/// Next bucket on the probe sequence: advance within the cache line, wrapping
/// to the start of the line after the last position.
#[inline]
pub(crate) fn next_in_line(idx: u64) -> u64 {
    (idx & LINE_MASK) | ((idx + 1) & LINE_MASK_R)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_partition_the_bucket_word() {
        assert_eq!(MASK_INDEX & MASK_HASH, 0);
        assert_eq!(MASK_INDEX | MASK_HASH, u64::MAX);
        assert_eq!(MASK_HASH.count_ones(), 20);
        assert_eq!(MASK_INDEX.count_ones(), 44);
    }

    #[test]
    fn mix_is_deterministic_and_argument_sensitive() {
        let h = mix(1, 2, HASH_SEED);
        assert_eq!(h, mix(1, 2, HASH_SEED));
        assert_ne!(h, mix(2, 1, HASH_SEED));
        assert_ne!(h, mix(1, 3, HASH_SEED));
        assert_ne!(h, mix(1, 2, h));
    }

    #[test]
    fn rehash_chain_changes_the_tag() {
        // One diversification step must be able to move the probe to another
        // cache line; a chain that repeats its output would loop forever.
        let first = mix(7, 11, HASH_SEED);
        let second = mix(7, 11, first);
        let third = mix(7, 11, second);
        assert_ne!(first, second);
        assert_ne!(second, third);
    }

    #[test]
    fn probe_stays_inside_its_cache_line() {
        let start = 4093;
        let line = start & !(BUCKETS_PER_LINE - 1);
        let mut idx = start;
        let mut seen = Vec::new();
        for _ in 0..BUCKETS_PER_LINE {
            seen.push(idx);
            idx = next_in_line(idx);
            assert_eq!(idx & !(BUCKETS_PER_LINE - 1), line);
        }
        // all eight positions visited exactly once, then back at the start
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), BUCKETS_PER_LINE as usize);
        assert_eq!(idx, start);
    }
}
