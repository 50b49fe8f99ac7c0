//! Garbage-collection support: the operations the external mark-sweep
//! collector orchestrates while every worker is quiescent, in the order
//! `clear` -> external marking via `mark` -> `rehash` -> `notify_all`.
//!
//! The sweeps recurse over slot ranges with `rayon::join`, halving above a
//! 1024-slot leaf; the leaf size is a tuning knob, not a contract.

use crate::hash::{self, HASH_SEED, MASK_HASH};
use crate::table::{UniqueTable, NO_REGION, RESERVED_SLOTS};
use std::sync::atomic::Ordering;

const GC_LEAF: u64 = 1024;

/// Portion of a bitmap word covering slots `k..end`, slots outside cleared.
/// Bits are MSB first, so slot `k` sits `k % 64` positions below the top.
#[inline]
fn range_mask(k: u64, end: u64) -> u64 {
    let mut mask = u64::MAX >> (k & 63);
    let next_word = (k & !63) + 64;
    if end < next_word {
        mask &= !(u64::MAX >> (end & 63));
    }
    mask
}

impl UniqueTable {
    /// Empties the index table and the occupancy bitmap by remapping them to
    /// fresh zero pages, reinstates the two forbidden data slots, and resets
    /// every worker's region cache. Run while collecting; the data array is
    /// left untouched so marked slots can be re-homed by
    /// [`rehash`](UniqueTable::rehash).
    pub fn clear(&mut self) {
        self.table.reset();
        self.table.advise_random();
        self.bitmap1.reset();
        self.bitmap2.reset();

        // forbid the first two data slots again
        self.bitmap2.set(0);
        self.bitmap2.set(1);

        for cell in &self.regions {
            cell.0.store(NO_REGION, Ordering::Relaxed);
        }
    }

    /// Sets the mark bit of `index`. Returns `true` if this call flipped it,
    /// so a recursive marker can stop at already-visited nodes.
    #[inline]
    pub fn mark(&self, index: u64) -> bool {
        self.bitmap2.set_atomic(index)
    }

    #[inline]
    pub fn is_marked(&self, index: u64) -> bool {
        self.bitmap2.get(index)
    }

    /// Grows (or shrinks) the usable slot count toward `max_size`. Run while
    /// collecting, before [`rehash`](UniqueTable::rehash) re-homes the marked
    /// slots under the new geometry.
    ///
    /// # Panics
    ///
    /// Same size requirements as [`UniqueTable::create`].
    pub fn set_size(&mut self, new_size: u64) {
        self.set_geometry(new_size);
        log::debug!("unitable: table_size set to {}", new_size);
    }

    /// Writes a fresh bucket for every marked slot. The index table must have
    /// been [`clear`](UniqueTable::clear)ed first; each slot keeps its index,
    /// only the bucket positions change.
    pub fn rehash(&self) {
        let failed = self.rehash_range(0, self.table_size);
        if failed != 0 {
            log::warn!("unitable: rehash could not re-home {} marked slots", failed);
        }
    }

    /// Population of the mark bitmap, not counting the two reserved slots.
    pub fn count_marked(&self) -> u64 {
        self.count_range(0, self.table_size) - RESERVED_SLOTS
    }

    /// Runs the dead callback for every slot that has a notify request but no
    /// mark. A callback returning `true` resurrects the slot (its mark bit is
    /// set); otherwise the notify request is cleared as served.
    pub fn notify_all(&self) {
        if self.dead_cb.is_none() {
            return;
        }
        self.notify_range(0, self.table_size);
    }

    fn rehash_range(&self, first: u64, count: u64) -> u64 {
        if count > GC_LEAF {
            let split = count / 2;
            let (left, right) = rayon::join(
                || self.rehash_range(first, split),
                || self.rehash_range(first + split, count - split),
            );
            left + right
        } else {
            let mut failed = 0;
            let end = first + count;
            // the reserved slots carry permanent mark bits but no data
            let mut k = first.max(RESERVED_SLOTS);
            while k < end {
                let word_base = k & !63;
                let mut live =
                    self.bitmap2.word((k / 64) as usize).load(Ordering::Relaxed) & range_mask(k, end);
                while live != 0 {
                    let bit = live.leading_zeros() as u64;
                    live &= !(1u64 << 63 >> bit);
                    if !self.rehash_slot(word_base + bit) {
                        failed += 1;
                    }
                }
                k = (word_base + 64).min(end);
            }
            failed
        }
    }

    /// Re-inserts one marked slot. Unlike the live path there is no claim, no
    /// equality check and no custom-bit update; the bit survived `clear` as
    /// the mark and selects the hasher here.
    fn rehash_slot(&self, d_idx: u64) -> bool {
        let (a, b) = self.get_data(d_idx);
        let custom = self.hash_cb.is_some() && self.custom_slot(d_idx);
        let next_hash = |seed: u64| match (custom, self.hash_cb) {
            (true, Some(hash_cb)) => hash_cb(a, b, seed),
            _ => hash::mix(a, b, seed),
        };

        let mut hash_rehash = next_hash(HASH_SEED);
        let new_value = (hash_rehash & MASK_HASH) | d_idx;
        let table = self.table.as_slice();
        let mut idx = self.start_bucket(hash_rehash);
        let mut last = idx;
        let mut line_walks = 0;

        loop {
            // no double inserts during the rehash phase; losing the CAS just
            // means a concurrent sweep gave this bucket to another slot
            let bucket = &table[idx as usize];
            if bucket.load(Ordering::Relaxed) == 0
                && bucket
                    .compare_exchange(0, new_value, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }

            idx = hash::next_in_line(idx);
            if idx == last {
                line_walks += 1;
                if line_walks == self.threshold {
                    return false;
                }
                hash_rehash = next_hash(hash_rehash);
                idx = self.start_bucket(hash_rehash);
                last = idx;
            }
        }
    }

    fn count_range(&self, first: u64, count: u64) -> u64 {
        if count > GC_LEAF {
            let split = count / 2;
            let (left, right) = rayon::join(
                || self.count_range(first, split),
                || self.count_range(first + split, count - split),
            );
            left + right
        } else {
            let mut marked = 0;
            let end = first + count;
            let mut k = first;
            while k < end {
                let word = self.bitmap2.word((k / 64) as usize).load(Ordering::Relaxed);
                marked += (word & range_mask(k, end)).count_ones() as u64;
                k = (k & !63) + 64;
            }
            marked
        }
    }

    fn notify_range(&self, first: u64, count: u64) {
        if count > GC_LEAF {
            let split = count / 2;
            rayon::join(
                || self.notify_range(first, split),
                || self.notify_range(first + split, count - split),
            );
        } else {
            let Some(dead_cb) = self.dead_cb.as_ref() else { return };
            let end = first + count;
            let mut k = first;
            while k < end {
                let word_base = k & !63;
                let word_index = (k / 64) as usize;
                let occupied = self.bitmap2.word(word_index).load(Ordering::Relaxed);
                let notify = self.bitmap3.word(word_index).load(Ordering::Relaxed);
                let mut pending = notify & !occupied & range_mask(k, end);
                while pending != 0 {
                    let bit = pending.leading_zeros() as u64;
                    pending &= !(1u64 << 63 >> bit);
                    let slot = word_base + bit;
                    if dead_cb(slot) {
                        // resurrected
                        self.bitmap2.set_atomic(slot);
                    } else {
                        self.bitmap3.clear_atomic(slot);
                    }
                }
                k = (word_base + 64).min(end);
            }
        }
    }
}
