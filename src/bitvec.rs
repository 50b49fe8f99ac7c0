use memmap2::MmapMut;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

/// An array of 64-bit words backed by an anonymous mapping.
///
/// The mapping is reserved in full but pages are only committed once touched,
/// so a table can reserve its `max_size` footprint while only the used prefix
/// costs real memory.
pub(crate) struct AtomicWords {
    map: MmapMut,
    words: usize,
}

impl AtomicWords {
    /// Maps `words` zeroed 64-bit words. Allocation failure is fatal, the
    /// table cannot operate in a degraded mode.
    pub(crate) fn new(words: u64, what: &'static str) -> Self {
        let words = words as usize;
        let bytes = words.checked_mul(8).expect("unitable: mapping size overflow");
        let map = MmapMut::map_anon(bytes)
            .unwrap_or_else(|e| panic!("unitable: cannot map {} ({} bytes): {}", what, bytes, e));
        Self { map, words }
    }

    /// Views the mapping as atomic words. Anonymous mappings are page aligned,
    /// so the cast is always in bounds and aligned.
    #[inline]
    pub(crate) fn as_slice(&self) -> &[AtomicU64] {
        unsafe { slice::from_raw_parts(self.map.as_ptr() as *const AtomicU64, self.words) }
    }

    /// Zeroes the array by swapping in a fresh anonymous mapping, so the
    /// kernel hands back zero pages instead of us writing every byte. Falls
    /// back to a byte fill if the new mapping cannot be created.
    pub(crate) fn reset(&mut self) {
        match MmapMut::map_anon(self.map.len()) {
            Ok(fresh) => self.map = fresh,
            Err(_) => self.map.fill(0),
        }
    }

    /// Tells the kernel the access pattern is random; probe walks touch one
    /// cache line per hash, far apart from each other.
    pub(crate) fn advise_random(&self) {
        #[cfg(unix)]
        let _ = self.map.advise(memmap2::Advice::Random);
    }
}

/// A fixed-size bit vector, packed MSB first: bit `k` lives in word `k / 64`
/// under mask `1 << (63 - (k % 64))`, so the first clear bit of a word is
/// found with a single count-leading-zeros of its complement.
pub(crate) struct BitVec {
    words: AtomicWords,
}

impl BitVec {
    /// At least one word is always mapped so the smallest table still has a
    /// real word to CAS on.
    pub(crate) fn new(bits: u64, what: &'static str) -> Self {
        Self { words: AtomicWords::new(bits.div_ceil(64).max(1), what) }
    }

    #[inline]
    fn location(bit: u64) -> (usize, u64) {
        ((bit / 64) as usize, 1u64 << 63 >> (bit & 63))
    }

    #[inline]
    pub(crate) fn word(&self, index: usize) -> &AtomicU64 {
        &self.words.as_slice()[index]
    }

    #[inline]
    pub(crate) fn get(&self, bit: u64) -> bool {
        let (index, mask) = Self::location(bit);
        self.word(index).load(Ordering::Relaxed) & mask != 0
    }

    /// Sets a bit without a CAS. Only valid while the caller is the sole
    /// writer of the containing word (region owner, or GC with the table
    /// quiescent).
    #[inline]
    pub(crate) fn set(&self, bit: u64) {
        let (index, mask) = Self::location(bit);
        let word = self.word(index);
        word.store(word.load(Ordering::Relaxed) | mask, Ordering::Relaxed);
    }

    /// Clears a bit without a CAS; same ownership requirement as [`set`].
    ///
    /// [`set`]: BitVec::set
    #[inline]
    pub(crate) fn clear(&self, bit: u64) {
        let (index, mask) = Self::location(bit);
        let word = self.word(index);
        word.store(word.load(Ordering::Relaxed) & !mask, Ordering::Relaxed);
    }

    /// Sets a contested bit. Returns `true` if this call flipped it, `false`
    /// if it was already set.
    #[inline]
    pub(crate) fn set_atomic(&self, bit: u64) -> bool {
        let (index, mask) = Self::location(bit);
        let word = self.word(index);
        let mut value = word.load(Ordering::Relaxed);
        loop {
            if value & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                value,
                value | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => value = current,
            }
        }
    }

    /// Clears a contested bit. Returns `true` if this call flipped it.
    #[inline]
    pub(crate) fn clear_atomic(&self, bit: u64) -> bool {
        let (index, mask) = Self::location(bit);
        let word = self.word(index);
        let mut value = word.load(Ordering::Relaxed);
        loop {
            if value & mask == 0 {
                return false;
            }
            match word.compare_exchange_weak(
                value,
                value & !mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => value = current,
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.words.reset();
    }
}
