//! CPU identifiers and runtime-sized CPU sets
//!
//! A `CpuSet` is sized once from the machine's CPU count and never grows.
//! Checkpoints own two of them for their whole life, so all operations
//! after construction work in place and never allocate.

use crate::{Error, Result};
use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// Index of a (virtual) CPU
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Create a CPU id from its index
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index of this CPU, usable for per-CPU arrays
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for CpuId {
    /// # Panics
    ///
    /// If `index` does not fit in a `u32`.
    fn from(index: usize) -> Self {
        Self(u32::try_from(index).expect("cpu index out of range"))
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Fixed-size set of CPUs
#[derive(Clone, PartialEq, Eq)]
pub struct CpuSet {
    words: Box<[u64]>,
    ncpu: usize,
}

impl CpuSet {
    /// Empty set able to hold `ncpu` CPUs
    pub fn new(ncpu: usize) -> Self {
        Self {
            words: vec![0; Self::word_count(ncpu)].into_boxed_slice(),
            ncpu,
        }
    }

    /// Empty set, reporting allocation failure instead of aborting
    pub fn try_new(ncpu: usize) -> Result<Self> {
        let mut words = Vec::new();
        words
            .try_reserve_exact(Self::word_count(ncpu))
            .map_err(|_| Error::NoMemory("cpu set"))?;
        words.resize(Self::word_count(ncpu), 0);
        Ok(Self {
            words: words.into_boxed_slice(),
            ncpu,
        })
    }

    /// Set containing every CPU in `0..ncpu`
    pub fn full(ncpu: usize) -> Self {
        let mut set = Self::new(ncpu);
        set.fill();
        set
    }

    fn word_count(ncpu: usize) -> usize {
        ncpu.div_ceil(WORD_BITS).max(1)
    }

    #[inline]
    fn locate(&self, cpu: CpuId) -> (usize, u64) {
        let index = cpu.index();
        assert!(index < self.ncpu, "{} outside cpu set of {}", cpu, self.ncpu);
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    /// Number of CPUs this set can hold
    pub fn capacity(&self) -> usize {
        self.ncpu
    }

    /// Add a CPU
    #[inline]
    pub fn set(&mut self, cpu: CpuId) {
        let (word, bit) = self.locate(cpu);
        self.words[word] |= bit;
    }

    /// Remove a CPU
    #[inline]
    pub fn clear(&mut self, cpu: CpuId) {
        let (word, bit) = self.locate(cpu);
        self.words[word] &= !bit;
    }

    /// Check membership
    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        let (word, bit) = self.locate(cpu);
        self.words[word] & bit != 0
    }

    /// Remove every CPU
    pub fn zero(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Add every CPU in `0..capacity`
    pub fn fill(&mut self) {
        for cpu in 0..self.ncpu {
            self.set(CpuId::from(cpu));
        }
    }

    /// True if no CPU is in the set
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of CPUs in the set
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Overwrite this set with `other` without reallocating
    pub fn copy_from(&mut self, other: &CpuSet) {
        assert_eq!(self.ncpu, other.ncpu, "cpu set size mismatch");
        self.words.copy_from_slice(&other.words);
    }

    /// Iterate over member CPUs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..self.ncpu)
            .map(CpuId::from)
            .filter(move |&cpu| self.contains(cpu))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.index())).finish()
    }
}
