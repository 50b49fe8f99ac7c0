use crate::bitvec::{AtomicWords, BitVec};
use crate::hash::{self, HASH_SEED, MASK_HASH, MASK_INDEX};
use std::sync::atomic::{AtomicU64, Ordering};

/// User-supplied fingerprint: `(a, b, seed) -> hash`. Must be pure and
/// tolerate arbitrary seed values; it is chained during probe
/// diversification.
pub type HashCallback = fn(u64, u64, u64) -> u64;
/// User-supplied equality: `(a, b, stored_a, stored_b) -> bool`. Must be
/// reflexive and symmetric.
pub type EqualsCallback = fn(u64, u64, u64, u64) -> bool;
pub(crate) type DeadCallback = Box<dyn Fn(u64) -> bool + Send + Sync>;

/// Unit of allocator ownership: 512 slots, i.e. 8 words of occupancy bitmap.
pub(crate) const SLOTS_PER_REGION: u64 = 512;
const WORDS_PER_REGION: u64 = SLOTS_PER_REGION / 64;
/// Data indices 0 and 1 are never handed out; 0 doubles as the empty-bucket
/// sentinel, so every published bucket word is nonzero.
pub(crate) const RESERVED_SLOTS: u64 = 2;
pub(crate) const NO_REGION: u64 = u64::MAX;
const DEFAULT_THRESHOLD: u64 = 1024;

/// A worker's current allocation region, padded so the cells of different
/// workers never share a cache line.
#[repr(align(64))]
pub(crate) struct RegionCell(pub(crate) AtomicU64);

/// A lock-free, fixed-capacity, content-addressed set of `(u64, u64)` pairs.
///
/// Inserts go through per-worker [`Worker`] handles; garbage collection
/// (bulk deletion) goes through [`clear`]/[`mark`]/[`rehash`] on the table
/// itself while all workers are quiescent. The two phases must be mutually
/// exclusive; the table provides no latch of its own.
///
/// Virtual address space is reserved for `max_size` slots up front, but only
/// the first `table_size` slots are ever touched, so the untouched tail costs
/// nothing until [`set_size`] grows into it.
///
/// # Examples
///
/// ```
/// use unitable::UniqueTable;
///
/// let table = UniqueTable::create(512, 512, 1);
/// let worker = table.worker(0);
/// let (index, created) = worker.lookup(1, 2).unwrap();
/// assert!(created);
/// assert_eq!(worker.lookup(1, 2), Some((index, false)));
/// assert_eq!(table.get_data(index), (1, 2));
/// ```
///
/// [`clear`]: UniqueTable::clear
/// [`mark`]: UniqueTable::mark
/// [`rehash`]: UniqueTable::rehash
/// [`set_size`]: UniqueTable::set_size
pub struct UniqueTable {
    /// The index table: bucket words of 20-bit tag over 44-bit data index.
    pub(crate) table: AtomicWords,
    /// The data array: two words per slot, written once before publication.
    pub(crate) data: AtomicWords,
    /// One bit per region: set while some worker owns the region.
    pub(crate) bitmap1: BitVec,
    /// One bit per slot: occupancy during normal operation, the mark bit
    /// during GC, and the custom-hash flag for slots inserted through
    /// [`Worker::lookup_custom`] while a custom hasher is registered.
    pub(crate) bitmap2: BitVec,
    /// One bit per slot: notify the dead callback when the slot dies.
    pub(crate) bitmap3: BitVec,
    /// Reserved, kept mapped for forward compatibility.
    #[allow(dead_code)]
    pub(crate) bitmap4: BitVec,
    pub(crate) table_size: u64,
    pub(crate) max_size: u64,
    pub(crate) mask: u64,
    pub(crate) threshold: u64,
    pub(crate) regions: Vec<RegionCell>,
    pub(crate) hash_cb: Option<HashCallback>,
    pub(crate) equals_cb: Option<EqualsCallback>,
    pub(crate) dead_cb: Option<DeadCallback>,
}

impl UniqueTable {
    /// Creates a table with `initial_size` usable slots out of a `max_size`
    /// reservation, serving `workers` concurrent workers.
    ///
    /// # Panics
    ///
    /// Misconfiguration and mapping failure are fatal: sizes below 512, not
    /// multiples of 512 (powers of two with the `pow2-mask` feature), an
    /// `initial_size` above `max_size`, a `max_size` beyond the 44-bit index
    /// space, zero workers, or the kernel refusing the reservation.
    pub fn create(initial_size: u64, max_size: u64, workers: usize) -> Self {
        assert!(workers >= 1, "unitable: need at least one worker");
        assert!(
            max_size <= MASK_INDEX + 1,
            "unitable: max_size exceeds the 44-bit index space"
        );
        if cfg!(feature = "pow2-mask") {
            assert!(initial_size.is_power_of_two(), "unitable: initial_size is not a power of 2");
            assert!(max_size.is_power_of_two(), "unitable: max_size is not a power of 2");
        }

        let mut table = Self {
            table: AtomicWords::new(max_size, "index table"),
            data: AtomicWords::new(2 * max_size, "data array"),
            bitmap1: BitVec::new(max_size / SLOTS_PER_REGION, "region bitmap"),
            bitmap2: BitVec::new(max_size, "occupancy bitmap"),
            bitmap3: BitVec::new(max_size, "notify bitmap"),
            bitmap4: BitVec::new(max_size, "reserved bitmap"),
            table_size: 0,
            max_size,
            mask: 0,
            threshold: DEFAULT_THRESHOLD,
            regions: (0..workers).map(|_| RegionCell(AtomicU64::new(NO_REGION))).collect(),
            hash_cb: None,
            equals_cb: None,
            dead_cb: None,
        };
        table.set_geometry(initial_size);
        table.table.advise_random();

        // forbid the first two data slots
        table.bitmap2.set(0);
        table.bitmap2.set(1);

        log::debug!(
            "unitable: created table_size={} max_size={} workers={}",
            table.table_size,
            max_size,
            workers
        );
        table
    }

    /// Number of usable slots. Grows through [`UniqueTable::set_size`].
    #[inline]
    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    /// Size of the reservation; the hard capacity limit.
    #[inline]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// The lookup handle of worker `id`. At most one thread may drive a given
    /// id at a time; the allocator hands out slots from a region owned by
    /// that id without further synchronization.
    #[inline]
    pub fn worker(&self, id: usize) -> Worker<'_> {
        assert!(id < self.regions.len(), "unitable: worker id out of range");
        Worker { table: self, id }
    }

    /// Registers the custom fingerprint and equality used by
    /// [`Worker::lookup_custom`]. Only valid while the table is quiescent.
    pub fn set_custom(&mut self, hash_cb: HashCallback, equals_cb: EqualsCallback) {
        self.hash_cb = Some(hash_cb);
        self.equals_cb = Some(equals_cb);
    }

    /// Registers the dead-slot callback run by [`UniqueTable::notify_all`].
    /// Returning `true` resurrects the slot. Only valid while the table is
    /// quiescent.
    pub fn set_on_dead<F>(&mut self, dead_cb: F)
    where
        F: Fn(u64) -> bool + Send + Sync + 'static,
    {
        self.dead_cb = Some(Box::new(dead_cb));
    }

    /// Requests a dead notification for `index` at the next
    /// [`UniqueTable::notify_all`]. May be called from any phase.
    pub fn notify_on_dead(&self, index: u64) {
        self.bitmap3.set_atomic(index);
    }

    /// The `(a, b)` pair stored at `index`. Read-only; valid in any phase for
    /// a published index.
    #[inline]
    pub fn get_data(&self, index: u64) -> (u64, u64) {
        let data = self.data.as_slice();
        let at = (2 * index) as usize;
        (data[at].load(Ordering::Relaxed), data[at + 1].load(Ordering::Relaxed))
    }

    pub(crate) fn set_geometry(&mut self, size: u64) {
        assert!(size >= SLOTS_PER_REGION, "unitable: table size below one region (512 slots)");
        assert!(size <= self.max_size, "unitable: table size larger than max_size");
        assert!(
            size % SLOTS_PER_REGION == 0,
            "unitable: table size is not a multiple of the region size"
        );
        if cfg!(feature = "pow2-mask") {
            assert!(size.is_power_of_two(), "unitable: table size is not a power of 2");
        }
        self.table_size = size;
        self.mask = size - 1;
    }

    /// First bucket of the line selected by `hash`.
    #[inline]
    pub(crate) fn start_bucket(&self, hash: u64) -> u64 {
        if cfg!(feature = "pow2-mask") {
            hash & self.mask
        } else {
            hash % self.table_size
        }
    }

    #[inline]
    pub(crate) fn custom_slot(&self, index: u64) -> bool {
        self.bitmap2.get(index)
    }

    fn set_custom_slot(&self, index: u64, on: bool) {
        if on {
            self.bitmap2.set(index);
        } else {
            self.bitmap2.clear(index);
        }
    }

    fn write_data(&self, index: u64, a: u64, b: u64) {
        let data = self.data.as_slice();
        let at = (2 * index) as usize;
        data[at].store(a, Ordering::Relaxed);
        data[at + 1].store(b, Ordering::Relaxed);
    }

    /// Hands a free data slot to `worker`, preferring holes in the region the
    /// worker already owns. Returns `None` when every region is taken and the
    /// owned one is full: the table-full signal.
    fn claim_data_slot(&self, worker: usize) -> Option<u64> {
        let cell = &self.regions[worker].0;
        let mut region = cell.load(Ordering::Relaxed);
        loop {
            if region != NO_REGION {
                let base = (region * WORDS_PER_REGION) as usize;
                for offset in 0..WORDS_PER_REGION as usize {
                    let word = self.bitmap2.word(base + offset);
                    let value = word.load(Ordering::Relaxed);
                    if value != u64::MAX {
                        // highest-order hole; the region is ours, plain store
                        let bit = (!value).leading_zeros() as u64;
                        word.store(value | (1u64 << 63 >> bit), Ordering::Relaxed);
                        return Some((region * WORDS_PER_REGION + offset as u64) * 64 + bit);
                    }
                }
            }
            region = self.acquire_region(worker, region)?;
            cell.store(region, Ordering::Relaxed);
        }
    }

    /// Claims a fresh region via bitmap-1, scanning linearly from a
    /// per-worker seed (or from the exhausted region) and wrapping around
    /// once before giving up.
    #[cold]
    fn acquire_region(&self, worker: usize, current: u64) -> Option<u64> {
        let region_count = self.table_size / SLOTS_PER_REGION;
        let mut region = if current == NO_REGION {
            // spread the workers' first claims over the region space
            let seed = worker as u64 * region_count / self.regions.len() as u64;
            seed.wrapping_sub(1)
        } else {
            current
        };
        for _ in 0..region_count {
            region = region.wrapping_add(1);
            if region >= region_count {
                region = 0;
            }
            if self.bitmap1.set_atomic(region) {
                return Some(region);
            }
        }
        None
    }

    /// Returns the claimed slot to the allocator. Only called by the worker
    /// that claimed it, before the slot was ever published.
    fn release_data_slot(&self, index: u64) {
        self.bitmap2.clear(index);
    }

    /// The find-or-insert core. Walks cache lines along the rehash sequence;
    /// an empty bucket is taken over by CAS, a tag match is confirmed against
    /// the data array. Returns `None` when the table is full (allocator
    /// exhausted or probe threshold reached).
    pub(crate) fn find_or_insert(
        &self,
        worker: usize,
        a: u64,
        b: u64,
        custom: bool,
    ) -> Option<(u64, bool)> {
        let next_hash = |seed: u64| match (custom, self.hash_cb) {
            (true, Some(hash_cb)) => hash_cb(a, b, seed),
            _ => hash::mix(a, b, seed),
        };
        let equal = |stored_a: u64, stored_b: u64| match (custom, self.equals_cb) {
            (true, Some(equals_cb)) => equals_cb(a, b, stored_a, stored_b),
            _ => stored_a == a && stored_b == b,
        };

        let mut hash_rehash = next_hash(HASH_SEED);
        let tag = hash_rehash & MASK_HASH;
        let table = self.table.as_slice();
        let mut claimed: u64 = 0;
        let mut idx = self.start_bucket(hash_rehash);
        let mut last = idx;
        let mut line_walks = 0;

        loop {
            let bucket = &table[idx as usize];
            let mut value = bucket.load(Ordering::Acquire);

            if value == 0 {
                if claimed == 0 {
                    claimed = match self.claim_data_slot(worker) {
                        Some(slot) => slot,
                        None => return None,
                    };
                    self.write_data(claimed, a, b);
                }
                match bucket.compare_exchange(
                    0,
                    tag | claimed,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        if custom || self.hash_cb.is_some() {
                            self.set_custom_slot(claimed, custom);
                        }
                        return Some((claimed, true));
                    }
                    Err(current) => value = current,
                }
            }

            if value & MASK_HASH == tag {
                let found = value & MASK_INDEX;
                let (stored_a, stored_b) = self.get_data(found);
                if equal(stored_a, stored_b) {
                    if claimed != 0 {
                        self.release_data_slot(claimed);
                    }
                    return Some((found, false));
                }
            }

            idx = hash::next_in_line(idx);
            if idx == last {
                line_walks += 1;
                if line_walks == self.threshold {
                    if claimed != 0 {
                        self.release_data_slot(claimed);
                    }
                    return None;
                }
                hash_rehash = next_hash(hash_rehash);
                idx = self.start_bucket(hash_rehash);
                last = idx;
            }
        }
    }
}

/// A lookup handle binding the table to one worker id.
///
/// The handle is what makes slot allocation contention-free: each id owns its
/// current region exclusively, so two threads must not drive the same id
/// concurrently. Copies are cheap views of the table.
#[derive(Clone, Copy)]
pub struct Worker<'t> {
    table: &'t UniqueTable,
    id: usize,
}

impl Worker<'_> {
    /// Finds or inserts the pair `(a, b)`. Returns the stable slot index and
    /// whether this call created the entry, or `None` when the table is full
    /// (the caller is expected to run GC and retry).
    #[inline]
    pub fn lookup(&self, a: u64, b: u64) -> Option<(u64, bool)> {
        self.table.find_or_insert(self.id, a, b, false)
    }

    /// [`lookup`] under the registered custom fingerprint and equality.
    ///
    /// # Panics
    ///
    /// Panics if no custom callbacks are registered.
    ///
    /// [`lookup`]: Worker::lookup
    #[inline]
    pub fn lookup_custom(&self, a: u64, b: u64) -> Option<(u64, bool)> {
        assert!(
            self.table.hash_cb.is_some() && self.table.equals_cb.is_some(),
            "unitable: lookup_custom without set_custom"
        );
        self.table.find_or_insert(self.id, a, b, true)
    }
}
