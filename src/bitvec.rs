//! Fixed-length bit vectors with O(1)-amortized rank and select.
//!
//! `BitVector` is the primitive underneath every bloom filter in a tree:
//! rank and select are backed by a superblock index of cumulative popcounts
//! rebuilt at construction or load time, never by a linear scan. Vectors are
//! persisted in one of two encodings:
//!
//! - `Raw`: the backing words as little-endian u64s
//! - `Sparse`: a roaring bitmap over the set positions, for vectors whose
//!   population count is small relative to their length
//!
//! A serialized vector is `encoding u32 | num_bits u64 | payload_len u64 |
//! payload`; deserialization validates the payload length against the
//! declared bit count and fails with a format error on mismatch.

use roaring::RoaringBitmap;
use std::io::{Read, Write};
use std::path::Path;

use crate::constants::{MAX_BIT_VECTOR_BITS, RANK_SUPERBLOCK_BITS, RANK_SUPERBLOCK_WORDS};
use crate::error::{BloomTreeError, Result};
use crate::le_io::{read_bytes, read_u32, read_u64};

// ============================================================================
// Instrumentation
// ============================================================================

/// Process-wide instrumentation counters.
///
/// These are side-effect counters only: they feed the `--time` report and
/// debugging, and never affect correctness.
pub mod stats {
    use std::sync::atomic::{AtomicU64, Ordering};

    pub(crate) static CREATIONS: AtomicU64 = AtomicU64::new(0);
    pub(crate) static RANK_CALLS: AtomicU64 = AtomicU64::new(0);
    pub(crate) static SELECT_CALLS: AtomicU64 = AtomicU64::new(0);
    pub(crate) static FILE_BYTES_READ: AtomicU64 = AtomicU64::new(0);
    pub(crate) static LOAD_NANOS: AtomicU64 = AtomicU64::new(0);

    /// Point-in-time snapshot of the instrumentation counters.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Snapshot {
        pub creations: u64,
        pub rank_calls: u64,
        pub select_calls: u64,
        pub file_bytes_read: u64,
        /// Cumulative time spent loading filter data from disk, in seconds.
        pub load_secs: f64,
    }

    /// Read all counters at once.
    pub fn snapshot() -> Snapshot {
        Snapshot {
            creations: CREATIONS.load(Ordering::Relaxed),
            rank_calls: RANK_CALLS.load(Ordering::Relaxed),
            select_calls: SELECT_CALLS.load(Ordering::Relaxed),
            file_bytes_read: FILE_BYTES_READ.load(Ordering::Relaxed),
            load_secs: LOAD_NANOS.load(Ordering::Relaxed) as f64 / 1e9,
        }
    }

    pub(crate) fn record_load(bytes: u64, nanos: u64) {
        FILE_BYTES_READ.fetch_add(bytes, Ordering::Relaxed);
        LOAD_NANOS.fetch_add(nanos, Ordering::Relaxed);
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// On-disk encoding of a bit vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Little-endian u64 words, `ceil(num_bits / 64) * 8` payload bytes.
    Raw,
    /// Roaring bitmap over the set positions.
    Sparse,
}

impl Encoding {
    pub(crate) fn code(self) -> u32 {
        match self {
            Encoding::Raw => 0,
            Encoding::Sparse => 1,
        }
    }

    pub(crate) fn from_code(code: u32, path: &Path) -> Result<Self> {
        match code {
            0 => Ok(Encoding::Raw),
            1 => Ok(Encoding::Sparse),
            other => Err(BloomTreeError::format(
                path,
                format!("unknown bit-vector encoding {}", other),
            )),
        }
    }
}

// ============================================================================
// BitVector
// ============================================================================

/// A fixed-length bit array with rank/select support.
///
/// Built once at construction or load and immutable thereafter, except that
/// the build path may `set` bits and must call `refresh_index` before any
/// rank/select use.
#[derive(Debug, Clone)]
pub struct BitVector {
    num_bits: u64,
    words: Vec<u64>,
    encoding: Encoding,
    /// Cumulative set-bit counts before each superblock; one trailing entry
    /// holding the total population count.
    supers: Vec<u64>,
    ones: u64,
    dirty: bool,
}

fn word_count(num_bits: u64) -> usize {
    num_bits.div_ceil(64) as usize
}

impl BitVector {
    /// Create an all-zero vector of the given length.
    pub fn zeroed(num_bits: u64) -> Self {
        stats::CREATIONS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let words = vec![0u64; word_count(num_bits)];
        let mut bv = BitVector {
            num_bits,
            words,
            encoding: Encoding::Raw,
            supers: Vec::new(),
            ones: 0,
            dirty: true,
        };
        bv.refresh_index();
        bv
    }

    /// Create a vector from backing words. Bits past `num_bits` in the last
    /// word are cleared.
    pub fn from_words(num_bits: u64, mut words: Vec<u64>) -> Result<Self> {
        if words.len() != word_count(num_bits) {
            return Err(BloomTreeError::validation(format!(
                "bit vector of {} bits needs {} words, got {}",
                num_bits,
                word_count(num_bits),
                words.len()
            )));
        }
        let tail = num_bits % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        stats::CREATIONS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut bv = BitVector {
            num_bits,
            words,
            encoding: Encoding::Raw,
            supers: Vec::new(),
            ones: 0,
            dirty: true,
        };
        bv.refresh_index();
        Ok(bv)
    }

    /// Length of the vector in bits.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Population count.
    pub fn count_ones(&self) -> u64 {
        debug_assert!(!self.dirty, "refresh_index before counting");
        self.ones
    }

    /// Preferred on-disk encoding for this vector.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Choose the on-disk encoding used by `write_to`.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    /// Test a single bit.
    #[inline]
    pub fn get(&self, pos: u64) -> bool {
        debug_assert!(pos < self.num_bits);
        (self.words[(pos / 64) as usize] >> (pos % 64)) & 1 == 1
    }

    /// Set a single bit. Invalidates the rank index; callers must
    /// `refresh_index` before rank/select.
    #[inline]
    pub fn set(&mut self, pos: u64) {
        debug_assert!(pos < self.num_bits);
        self.words[(pos / 64) as usize] |= 1u64 << (pos % 64);
        self.dirty = true;
    }

    /// Rebuild the superblock rank index after mutation.
    pub fn refresh_index(&mut self) {
        let mut supers = Vec::with_capacity(self.words.len() / RANK_SUPERBLOCK_WORDS + 2);
        let mut running = 0u64;
        supers.push(0);
        for chunk in self.words.chunks(RANK_SUPERBLOCK_WORDS) {
            running += chunk.iter().map(|w| w.count_ones() as u64).sum::<u64>();
            supers.push(running);
        }
        self.supers = supers;
        self.ones = running;
        self.dirty = false;
    }

    /// Number of set bits in `[0, pos)`.
    pub fn rank1(&self, pos: u64) -> u64 {
        debug_assert!(!self.dirty, "refresh_index before rank");
        stats::RANK_CALLS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let pos = pos.min(self.num_bits);
        let sb = (pos / RANK_SUPERBLOCK_BITS) as usize;
        let mut count = self.supers[sb];
        let first_word = sb * RANK_SUPERBLOCK_WORDS;
        let last_word = (pos / 64) as usize;
        for w in &self.words[first_word..last_word] {
            count += w.count_ones() as u64;
        }
        let rem = pos % 64;
        if rem != 0 {
            count += (self.words[last_word] & ((1u64 << rem) - 1)).count_ones() as u64;
        }
        count
    }

    /// Position of the k-th set bit, 1-indexed.
    ///
    /// Fails if `k` is zero or exceeds the population count.
    pub fn select1(&self, k: u64) -> Result<u64> {
        debug_assert!(!self.dirty, "refresh_index before select");
        stats::SELECT_CALLS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if k == 0 || k > self.ones {
            return Err(BloomTreeError::validation(format!(
                "select({}) out of range, population count is {}",
                k, self.ones
            )));
        }
        let sb = self.supers.partition_point(|&c| c < k) - 1;
        let mut remaining = k - self.supers[sb];
        let mut w = sb * RANK_SUPERBLOCK_WORDS;
        loop {
            let pc = self.words[w].count_ones() as u64;
            if remaining <= pc {
                break;
            }
            remaining -= pc;
            w += 1;
        }
        let mut word = self.words[w];
        for _ in 1..remaining {
            word &= word - 1;
        }
        Ok((w as u64) * 64 + word.trailing_zeros() as u64)
    }

    /// Iterate the positions of all set bits in increasing order.
    pub fn iter_ones(&self) -> Ones<'_> {
        Ones {
            words: &self.words,
            word_ix: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    /// OR another vector of the same length into this one.
    pub fn union_with(&mut self, other: &BitVector) -> Result<()> {
        if self.num_bits != other.num_bits {
            return Err(BloomTreeError::validation(format!(
                "cannot union bit vectors of different lengths ({} vs {})",
                self.num_bits, other.num_bits
            )));
        }
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
        self.dirty = true;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    /// Serialize to `writer`. Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, writer: &mut W, path: &Path) -> Result<u64> {
        let payload = match self.encoding {
            Encoding::Raw => {
                let mut payload = Vec::with_capacity(self.words.len() * 8);
                for word in &self.words {
                    payload.extend_from_slice(&word.to_le_bytes());
                }
                payload
            }
            Encoding::Sparse => {
                if self.num_bits > u64::from(u32::MAX) {
                    return Err(BloomTreeError::validation(format!(
                        "sparse encoding limited to 2^32 bits, vector has {}",
                        self.num_bits
                    )));
                }
                let mut bitmap = RoaringBitmap::new();
                for pos in self.iter_ones() {
                    bitmap.insert(pos as u32);
                }
                let mut payload = Vec::new();
                bitmap
                    .serialize_into(&mut payload)
                    .map_err(|e| BloomTreeError::io(path, "write", e))?;
                payload
            }
        };

        writer
            .write_all(&self.encoding.code().to_le_bytes())
            .and_then(|_| writer.write_all(&self.num_bits.to_le_bytes()))
            .and_then(|_| writer.write_all(&(payload.len() as u64).to_le_bytes()))
            .and_then(|_| writer.write_all(&payload))
            .map_err(|e| BloomTreeError::io(path, "write", e))?;
        Ok(4 + 8 + 8 + payload.len() as u64)
    }

    /// Deserialize from `reader`, validating the payload length against the
    /// declared bit count.
    pub fn read_from<R: Read>(reader: &mut R, path: &Path) -> Result<BitVector> {
        let encoding = Encoding::from_code(read_u32(reader, path)?, path)?;
        let num_bits = read_u64(reader, path)?;
        if num_bits > MAX_BIT_VECTOR_BITS {
            return Err(BloomTreeError::format(
                path,
                format!("bit-vector length {} exceeds limit", num_bits),
            ));
        }
        let payload_len = read_u64(reader, path)? as usize;

        let bv = match encoding {
            Encoding::Raw => {
                let expected = word_count(num_bits) * 8;
                if payload_len != expected {
                    return Err(BloomTreeError::format(
                        path,
                        format!(
                            "raw bit-vector payload is {} bytes but {} bits declare {}",
                            payload_len, num_bits, expected
                        ),
                    ));
                }
                let bytes = read_bytes(reader, path, payload_len)?;
                let words = bytes
                    .chunks_exact(8)
                    .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                let mut bv = BitVector::from_words(num_bits, words)
                    .map_err(|e| BloomTreeError::format(path, e.to_string()))?;
                bv.encoding = Encoding::Raw;
                bv
            }
            Encoding::Sparse => {
                let bytes = read_bytes(reader, path, payload_len)?;
                let bitmap = RoaringBitmap::deserialize_from(&bytes[..]).map_err(|e| {
                    BloomTreeError::format(path, format!("sparse bit-vector payload: {}", e))
                })?;
                if let Some(max) = bitmap.max() {
                    if u64::from(max) >= num_bits {
                        return Err(BloomTreeError::format(
                            path,
                            format!(
                                "sparse bit-vector sets position {} beyond declared {} bits",
                                max, num_bits
                            ),
                        ));
                    }
                }
                let mut bv = BitVector::zeroed(num_bits);
                for pos in &bitmap {
                    bv.set(u64::from(pos));
                }
                bv.refresh_index();
                bv.encoding = Encoding::Sparse;
                bv
            }
        };

        stats::FILE_BYTES_READ.fetch_add(
            20 + payload_len as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
        Ok(bv)
    }
}

/// Iterator over set-bit positions, see [`BitVector::iter_ones`].
pub struct Ones<'a> {
    words: &'a [u64],
    word_ix: usize,
    current: u64,
}

impl Iterator for Ones<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.current == 0 {
            self.word_ix += 1;
            if self.word_ix >= self.words.len() {
                return None;
            }
            self.current = self.words[self.word_ix];
        }
        let tz = self.current.trailing_zeros() as u64;
        self.current &= self.current - 1;
        Some((self.word_ix as u64) * 64 + tz)
    }
}

// ============================================================================
// Tests
// ============================================================================
