//! Bloom filters over rank/select bit vectors.
//!
//! A filter is one bit vector (`Plain`) or two (`Determined`). Plain filters
//! answer plain membership: a k-mer is present when every one of its hash
//! positions is set. Determined filters additionally mark, per position,
//! whether membership is already fully resolved at this tree level: the
//! full-length `determined` vector flags resolved positions, and the
//! `active` vector, squeezed down to the determined positions, holds their
//! values, so the value of determined position `p` is
//! `active[rank1(determined, p)]`. A k-mer whose positions are all
//! determined never needs a descendant lookup.
//!
//! All filters in one tree must agree on bit-array length, hash count, and
//! k-mer length; the consistency check is run before a search when
//! requested, failing on the first mismatching node.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use crate::bitvec::{stats, BitVector};
use crate::constants::{
    FILTER_BLOCK_MAGIC, FILTER_BLOCK_VERSION, MAX_BIT_VECTOR_BITS, MAX_NUM_HASHES, READ_BUF_SIZE,
};
use crate::error::{BloomTreeError, Result};
use crate::hashing::KmerHasher;
use crate::le_io::{read_u32, read_u64};

/// Size of the fixed filter-block header in bytes.
const BLOCK_HEADER_BYTES: u64 = 4 + 4 + 4 + 8 + 4 + 4 + 8;

// ============================================================================
// Parameters
// ============================================================================

/// The structural parameters every filter in a tree must share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterParams {
    pub num_bits: u64,
    pub num_hashes: u32,
    pub kmer_size: u32,
    pub hash_seed: u64,
}

impl FilterParams {
    pub fn validate(&self) -> Result<()> {
        if self.num_bits == 0 || self.num_bits > MAX_BIT_VECTOR_BITS {
            return Err(BloomTreeError::validation(format!(
                "filter bit count {} out of range",
                self.num_bits
            )));
        }
        if self.num_hashes == 0 || self.num_hashes > MAX_NUM_HASHES {
            return Err(BloomTreeError::validation(format!(
                "hash count must be in 1..={}, got {}",
                MAX_NUM_HASHES, self.num_hashes
            )));
        }
        if self.kmer_size == 0 || self.kmer_size > 32 {
            return Err(BloomTreeError::validation(format!(
                "k-mer size must be in 1..=32, got {}",
                self.kmer_size
            )));
        }
        Ok(())
    }

    /// Hash configuration matching these parameters.
    pub fn hasher(&self) -> KmerHasher {
        KmerHasher {
            kmer_size: self.kmer_size,
            num_hashes: self.num_hashes,
            seed: self.hash_seed,
            num_bits: self.num_bits,
        }
    }
}

/// Filter variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Plain,
    Determined,
}

impl FilterKind {
    fn code(self) -> u32 {
        match self {
            FilterKind::Plain => 0,
            FilterKind::Determined => 1,
        }
    }

    fn from_code(code: u32, path: &Path) -> Result<Self> {
        match code {
            0 => Ok(FilterKind::Plain),
            1 => Ok(FilterKind::Determined),
            other => Err(BloomTreeError::format(
                path,
                format!("unknown filter kind {}", other),
            )),
        }
    }
}

/// Outcome of resolving one k-mer against a filter during tree pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Absent from this node, hence from every descendant.
    Absent,
    /// Fully resolved present at this node; descendants need no lookup.
    Present,
    /// Possibly below; descend to find out.
    Unknown,
}

// ============================================================================
// BloomFilter
// ============================================================================

#[derive(Debug, Clone)]
enum Vectors {
    Plain(BitVector),
    Determined {
        determined: BitVector,
        active: BitVector,
    },
}

/// One node's bloom filter.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    params: FilterParams,
    vectors: Vectors,
}

impl BloomFilter {
    /// Create an empty plain filter.
    pub fn new_plain(params: FilterParams) -> Result<Self> {
        params.validate()?;
        Ok(BloomFilter {
            params,
            vectors: Vectors::Plain(BitVector::zeroed(params.num_bits)),
        })
    }

    /// Create a determined filter from its two vectors.
    ///
    /// `determined` must span the filter's bit space; `active` must be
    /// exactly as long as `determined`'s population count.
    pub fn new_determined(
        params: FilterParams,
        determined: BitVector,
        active: BitVector,
    ) -> Result<Self> {
        params.validate()?;
        if determined.num_bits() != params.num_bits {
            return Err(BloomTreeError::validation(format!(
                "determined vector has {} bits, filter declares {}",
                determined.num_bits(),
                params.num_bits
            )));
        }
        if active.num_bits() != determined.count_ones() {
            return Err(BloomTreeError::validation(format!(
                "active vector has {} bits but {} positions are determined",
                active.num_bits(),
                determined.count_ones()
            )));
        }
        Ok(BloomFilter {
            params,
            vectors: Vectors::Determined { determined, active },
        })
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    pub fn kind(&self) -> FilterKind {
        match self.vectors {
            Vectors::Plain(_) => FilterKind::Plain,
            Vectors::Determined { .. } => FilterKind::Determined,
        }
    }

    /// Set the bits for one k-mer's hash positions (build path, plain only).
    pub fn insert_positions(&mut self, positions: &[u64]) -> Result<()> {
        match &mut self.vectors {
            Vectors::Plain(bv) => {
                for &p in positions {
                    bv.set(p);
                }
                Ok(())
            }
            Vectors::Determined { .. } => Err(BloomTreeError::validation(
                "cannot insert into a determined filter",
            )),
        }
    }

    /// Rebuild rank indexes after the build path's mutations.
    pub fn finalize(&mut self) {
        match &mut self.vectors {
            Vectors::Plain(bv) => bv.refresh_index(),
            Vectors::Determined { determined, active } => {
                determined.refresh_index();
                active.refresh_index();
            }
        }
    }

    /// OR another plain filter's bits into this one (union construction).
    pub fn union_with(&mut self, other: &BloomFilter) -> Result<()> {
        match (&mut self.vectors, &other.vectors) {
            (Vectors::Plain(a), Vectors::Plain(b)) => a.union_with(b),
            _ => Err(BloomTreeError::validation(
                "union is only defined between plain filters",
            )),
        }
    }

    /// Plain membership: every hash position of the k-mer is present.
    pub fn contains_kmer(&self, positions: &[u64]) -> bool {
        match &self.vectors {
            Vectors::Plain(bv) => positions.iter().all(|&p| bv.get(p)),
            Vectors::Determined { .. } => self.resolve_kmer(positions) == Resolution::Present,
        }
    }

    /// Resolve one k-mer for tree pruning.
    ///
    /// Plain filters can prove absence (union semantics: absent here means
    /// absent below) but never presence at an internal node. Determined
    /// filters can prove either, once every position is determined.
    pub fn resolve_kmer(&self, positions: &[u64]) -> Resolution {
        match &self.vectors {
            Vectors::Plain(bv) => {
                if positions.iter().all(|&p| bv.get(p)) {
                    Resolution::Unknown
                } else {
                    Resolution::Absent
                }
            }
            Vectors::Determined { determined, active } => {
                let mut all_determined = true;
                for &p in positions {
                    if determined.get(p) {
                        if !active.get(determined.rank1(p)) {
                            return Resolution::Absent;
                        }
                    } else {
                        all_determined = false;
                    }
                }
                if all_determined {
                    Resolution::Present
                } else {
                    Resolution::Unknown
                }
            }
        }
    }

    /// How many of the given k-mers are present (counting query mode).
    pub fn count_contained(&self, kmers: &[Vec<u64>]) -> u64 {
        kmers
            .iter()
            .filter(|positions| self.contains_kmer(positions))
            .count() as u64
    }

    /// Structural consistency: bit-array length, hash count, k-mer length.
    pub fn is_consistent_with(&self, other: &BloomFilter) -> bool {
        self.params.num_bits == other.params.num_bits
            && self.params.num_hashes == other.params.num_hashes
            && self.params.kmer_size == other.params.kmer_size
    }

    /// Consistency check that fails with the offending node's name.
    pub fn assert_consistent_with(&self, other: &BloomFilter, node: &str) -> Result<()> {
        if self.params.num_bits != other.params.num_bits {
            return Err(BloomTreeError::inconsistent(
                node,
                format!(
                    "bit-array length {} differs from {}",
                    self.params.num_bits, other.params.num_bits
                ),
            ));
        }
        if self.params.num_hashes != other.params.num_hashes {
            return Err(BloomTreeError::inconsistent(
                node,
                format!(
                    "hash count {} differs from {}",
                    self.params.num_hashes, other.params.num_hashes
                ),
            ));
        }
        if self.params.kmer_size != other.params.kmer_size {
            return Err(BloomTreeError::inconsistent(
                node,
                format!(
                    "k-mer length {} differs from {}",
                    self.params.kmer_size, other.params.kmer_size
                ),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    /// Write one filter block. Returns the number of bytes written.
    pub fn write_block<W: Write>(&self, writer: &mut W, path: &Path) -> Result<u64> {
        writer
            .write_all(FILTER_BLOCK_MAGIC)
            .and_then(|_| writer.write_all(&FILTER_BLOCK_VERSION.to_le_bytes()))
            .and_then(|_| writer.write_all(&self.kind().code().to_le_bytes()))
            .and_then(|_| writer.write_all(&self.params.num_bits.to_le_bytes()))
            .and_then(|_| writer.write_all(&self.params.num_hashes.to_le_bytes()))
            .and_then(|_| writer.write_all(&self.params.kmer_size.to_le_bytes()))
            .and_then(|_| writer.write_all(&self.params.hash_seed.to_le_bytes()))
            .map_err(|e| BloomTreeError::io(path, "write", e))?;

        let mut total = BLOCK_HEADER_BYTES;
        match &self.vectors {
            Vectors::Plain(bv) => {
                total += bv.write_to(writer, path)?;
            }
            Vectors::Determined { determined, active } => {
                total += determined.write_to(writer, path)?;
                total += active.write_to(writer, path)?;
            }
        }
        Ok(total)
    }

    /// Read one filter block.
    pub fn read_block<R: Read>(reader: &mut R, path: &Path) -> Result<Self> {
        let start = Instant::now();

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| BloomTreeError::io(path, "read", e))?;
        if &magic != FILTER_BLOCK_MAGIC {
            return Err(BloomTreeError::format(path, "not a bloom filter block"));
        }
        let version = read_u32(reader, path)?;
        if version != FILTER_BLOCK_VERSION {
            return Err(BloomTreeError::format(
                path,
                format!("unsupported filter block version {}", version),
            ));
        }
        let kind = FilterKind::from_code(read_u32(reader, path)?, path)?;
        let params = FilterParams {
            num_bits: read_u64(reader, path)?,
            num_hashes: read_u32(reader, path)?,
            kmer_size: read_u32(reader, path)?,
            hash_seed: read_u64(reader, path)?,
        };
        params
            .validate()
            .map_err(|e| BloomTreeError::format(path, e.to_string()))?;

        let vectors = match kind {
            FilterKind::Plain => {
                let bv = BitVector::read_from(reader, path)?;
                if bv.num_bits() != params.num_bits {
                    return Err(BloomTreeError::format(
                        path,
                        format!(
                            "filter declares {} bits but vector has {}",
                            params.num_bits,
                            bv.num_bits()
                        ),
                    ));
                }
                Vectors::Plain(bv)
            }
            FilterKind::Determined => {
                let determined = BitVector::read_from(reader, path)?;
                let active = BitVector::read_from(reader, path)?;
                if determined.num_bits() != params.num_bits {
                    return Err(BloomTreeError::format(
                        path,
                        format!(
                            "filter declares {} bits but determined vector has {}",
                            params.num_bits,
                            determined.num_bits()
                        ),
                    ));
                }
                if active.num_bits() != determined.count_ones() {
                    return Err(BloomTreeError::format(
                        path,
                        format!(
                            "active vector has {} bits but {} positions are determined",
                            active.num_bits(),
                            determined.count_ones()
                        ),
                    ));
                }
                Vectors::Determined { determined, active }
            }
        };

        stats::record_load(BLOCK_HEADER_BYTES, start.elapsed().as_nanos() as u64);
        Ok(BloomFilter { params, vectors })
    }

    /// Direct per-node load: open `path`, seek to `offset`, read one block.
    pub fn load_from_file(path: &Path, offset: u64) -> Result<Self> {
        let file = File::open(path).map_err(|e| BloomTreeError::io(path, "open", e))?;
        let mut reader = BufReader::with_capacity(READ_BUF_SIZE, file);
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| BloomTreeError::io(path, "seek", e))?;
        Self::read_block(&mut reader, path)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> FilterParams {
        FilterParams {
            num_bits: 4096,
            num_hashes: 2,
            kmer_size: 8,
            hash_seed: 0x5555,
        }
    }

    fn filter_over(seq: &[u8]) -> (BloomFilter, Vec<Vec<u64>>) {
        let p = params();
        let hasher = p.hasher();
        let mut bf = BloomFilter::new_plain(p).unwrap();
        let kmers = hasher.kmerize(seq, true, None);
        for positions in &kmers {
            bf.insert_positions(positions).unwrap();
        }
        bf.finalize();
        (bf, kmers)
    }

    #[test]
    fn test_inserted_kmers_are_all_contained() {
        // No false negatives: every indexed k-mer must be found.
        let (bf, kmers) = filter_over(b"ACGTTGCAGGTACCATTTACGGAT");
        assert_eq!(bf.count_contained(&kmers), kmers.len() as u64);
        for positions in &kmers {
            assert!(bf.contains_kmer(positions));
        }
    }

    #[test]
    fn test_absent_kmer_resolves_absent() {
        let (bf, _) = filter_over(b"AAAAAAAAAAAAAAAA");
        let other = params().hasher().kmerize(b"CGCGCGCGCGCGCGCG", true, None);
        // With 4096 bits and a handful of insertions, these cannot all be
        // false positives.
        assert!(other
            .iter()
            .any(|k| bf.resolve_kmer(k) == Resolution::Absent));
    }

    #[test]
    fn test_plain_filter_never_resolves_present() {
        let (bf, kmers) = filter_over(b"ACGTTGCAGGTACCAT");
        for positions in &kmers {
            assert_eq!(bf.resolve_kmer(positions), Resolution::Unknown);
        }
    }

    #[test]
    fn test_consistency_check() {
        let (a, _) = filter_over(b"ACGTTGCAGGTACCAT");
        let (b, _) = filter_over(b"TTTTGGGGCCCCAAAA");
        assert!(a.is_consistent_with(&b));
        assert!(a.assert_consistent_with(&b, "leaf").is_ok());

        let mut other_params = params();
        other_params.kmer_size = 12;
        let c = BloomFilter::new_plain(other_params).unwrap();
        assert!(!a.is_consistent_with(&c));
        let err = a.assert_consistent_with(&c, "leaf3").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("leaf3"));
        assert!(msg.contains("k-mer length"));
    }

    fn determined_filter() -> BloomFilter {
        let p = FilterParams {
            num_bits: 64,
            num_hashes: 1,
            kmer_size: 8,
            hash_seed: 0,
        };
        // Positions 3, 10, 20 are determined; their squeezed values are
        // present, absent, present.
        let mut determined = BitVector::zeroed(64);
        for pos in [3, 10, 20] {
            determined.set(pos);
        }
        determined.refresh_index();
        let mut active = BitVector::zeroed(3);
        active.set(0);
        active.set(2);
        active.refresh_index();
        BloomFilter::new_determined(p, determined, active).unwrap()
    }

    #[test]
    fn test_determined_resolution() {
        let bf = determined_filter();
        assert_eq!(bf.resolve_kmer(&[3]), Resolution::Present);
        assert_eq!(bf.resolve_kmer(&[10]), Resolution::Absent);
        assert_eq!(bf.resolve_kmer(&[20]), Resolution::Present);
        assert_eq!(bf.resolve_kmer(&[3, 20]), Resolution::Present);
        // A determined-absent position dominates.
        assert_eq!(bf.resolve_kmer(&[3, 10]), Resolution::Absent);
        // An undetermined position leaves the k-mer unresolved.
        assert_eq!(bf.resolve_kmer(&[5]), Resolution::Unknown);
        assert_eq!(bf.resolve_kmer(&[3, 5]), Resolution::Unknown);
    }

    #[test]
    fn test_determined_length_validation() {
        let p = FilterParams {
            num_bits: 64,
            num_hashes: 1,
            kmer_size: 8,
            hash_seed: 0,
        };
        let mut determined = BitVector::zeroed(64);
        determined.set(1);
        determined.refresh_index();
        let active = BitVector::zeroed(2); // wrong: only 1 determined bit
        assert!(BloomFilter::new_determined(p, determined, active).is_err());
    }

    #[test]
    fn test_block_round_trip_plain() {
        let (bf, kmers) = filter_over(b"ACGTTGCAGGTACCATTTACGGAT");
        let path = Path::new("test.bf");
        let mut buf = Vec::new();
        let written = bf.write_block(&mut buf, path).unwrap();
        assert_eq!(written as usize, buf.len());

        let loaded = BloomFilter::read_block(&mut &buf[..], path).unwrap();
        assert_eq!(loaded.params(), bf.params());
        assert_eq!(loaded.kind(), FilterKind::Plain);
        assert_eq!(loaded.count_contained(&kmers), kmers.len() as u64);
    }

    #[test]
    fn test_block_round_trip_determined() {
        let bf = determined_filter();
        let path = Path::new("test.bf");
        let mut buf = Vec::new();
        bf.write_block(&mut buf, path).unwrap();

        let loaded = BloomFilter::read_block(&mut &buf[..], path).unwrap();
        assert_eq!(loaded.kind(), FilterKind::Determined);
        assert_eq!(loaded.resolve_kmer(&[10]), Resolution::Absent);
        assert_eq!(loaded.resolve_kmer(&[20]), Resolution::Present);
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let path = Path::new("test.bf");
        let buf = b"NOPE\x01\x00\x00\x00".to_vec();
        let err = BloomFilter::read_block(&mut &buf[..], path).unwrap_err();
        assert!(matches!(err, BloomTreeError::Format { .. }));
    }

    #[test]
    fn test_truncated_block_is_io_error() {
        let (bf, _) = filter_over(b"ACGTTGCAGGTACCAT");
        let path = Path::new("test.bf");
        let mut buf = Vec::new();
        bf.write_block(&mut buf, path).unwrap();
        buf.truncate(buf.len() - 10);

        let err = BloomFilter::read_block(&mut &buf[..], path).unwrap_err();
        assert!(matches!(err, BloomTreeError::Io { .. }));
    }
}
