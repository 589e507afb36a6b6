//! K-mer hashing: canonical 2-bit k-mer codes mapped to bloom filter bit
//! positions.
//!
//! A k-mer and its reverse complement hash identically (the smaller of the
//! two 2-bit encodings is hashed). The 64-bit xxh3 digest is split into two
//! halves combined by double hashing, `h1 + i*h2 mod m`, one position per
//! hash function.
//!
//! When kmtricks-style auxiliary inputs are supplied (a minimizer
//! repartition table plus a hash window), the bit space is partitioned:
//! a k-mer's position lands at `partition(minimizer) * window + (hash mod
//! window)`.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::constants::{MAX_MINIMIZER_LENGTH, REPART_MAGIC, REPART_VERSION};
use crate::error::{BloomTreeError, Result};
use crate::le_io::{read_bytes, read_u32};

/// Encode one nucleotide as a 2-bit code. Returns `None` for anything
/// outside `ACGTacgt`; k-mers spanning such bases are skipped.
#[inline]
fn encode_base(base: u8) -> Option<u64> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Reverse complement of a 2-bit packed code of `len` bases.
fn revcomp_code(code: u64, len: u32) -> u64 {
    let mut rc = 0u64;
    for i in 0..len {
        let base = (code >> (2 * i)) & 3;
        rc = (rc << 2) | (3 - base);
    }
    rc
}

/// Canonical (strand-independent) minimizer of a k-mer code: the smallest
/// canonical m-mer among the k-mer's `k - m + 1` windows.
pub fn minimizer_of(kmer_code: u64, kmer_size: u32, minimizer_len: u32) -> u64 {
    debug_assert!(minimizer_len <= kmer_size);
    let mask = (1u64 << (2 * minimizer_len)) - 1;
    let mut best = u64::MAX;
    for i in 0..=(kmer_size - minimizer_len) {
        let shift = 2 * (kmer_size - i - minimizer_len);
        let fwd = (kmer_code >> shift) & mask;
        let canon = fwd.min(revcomp_code(fwd, minimizer_len));
        best = best.min(canon);
    }
    best
}

// ============================================================================
// Auxiliary kmtricks-style parameters
// ============================================================================

/// Minimizer-to-partition table loaded from a `--repart` file.
///
/// Format: magic "SBRP", version u32, minimizer length u32, partition count
/// u32, then `4^m` u16 entries mapping each canonical minimizer code to its
/// partition.
#[derive(Debug, Clone)]
pub struct RepartTable {
    minimizer_len: u32,
    num_partitions: u32,
    table: Vec<u16>,
}

impl RepartTable {
    pub fn minimizer_len(&self) -> u32 {
        self.minimizer_len
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Partition of a canonical minimizer code.
    pub fn partition_of(&self, minimizer: u64) -> u64 {
        u64::from(self.table[minimizer as usize])
    }

    /// Build a table directly (used by tests and table generators).
    pub fn new(minimizer_len: u32, num_partitions: u32, table: Vec<u16>) -> Result<Self> {
        if minimizer_len == 0 || minimizer_len > MAX_MINIMIZER_LENGTH {
            return Err(BloomTreeError::validation(format!(
                "minimizer length must be in 1..={}, got {}",
                MAX_MINIMIZER_LENGTH, minimizer_len
            )));
        }
        let expected = 1usize << (2 * minimizer_len);
        if table.len() != expected {
            return Err(BloomTreeError::validation(format!(
                "repartition table needs {} entries for minimizer length {}, got {}",
                expected,
                minimizer_len,
                table.len()
            )));
        }
        if num_partitions == 0 {
            return Err(BloomTreeError::validation("partition count must be nonzero"));
        }
        if let Some(bad) = table.iter().find(|&&p| u32::from(p) >= num_partitions) {
            return Err(BloomTreeError::validation(format!(
                "repartition entry {} exceeds partition count {}",
                bad, num_partitions
            )));
        }
        Ok(RepartTable {
            minimizer_len,
            num_partitions,
            table,
        })
    }

    /// Load a repartition table from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BloomTreeError::io(path, "open", e))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| BloomTreeError::io(path, "read", e))?;
        if &magic != REPART_MAGIC {
            return Err(BloomTreeError::format(path, "not a repartition table"));
        }
        let version = read_u32(&mut reader, path)?;
        if version != REPART_VERSION {
            return Err(BloomTreeError::format(
                path,
                format!("unsupported repartition table version {}", version),
            ));
        }
        let minimizer_len = read_u32(&mut reader, path)?;
        if minimizer_len == 0 || minimizer_len > MAX_MINIMIZER_LENGTH {
            return Err(BloomTreeError::format(
                path,
                format!("minimizer length {} out of range", minimizer_len),
            ));
        }
        let num_partitions = read_u32(&mut reader, path)?;
        let entries = 1usize << (2 * minimizer_len);
        let bytes = read_bytes(&mut reader, path, entries * 2)?;
        let table: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
            .collect();

        RepartTable::new(minimizer_len, num_partitions, table)
            .map_err(|e| BloomTreeError::format(path, e.to_string()))
    }

    /// Write the table to disk in the `SBRP` format.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| BloomTreeError::io(path, "create", e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(REPART_MAGIC)
            .and_then(|_| writer.write_all(&REPART_VERSION.to_le_bytes()))
            .and_then(|_| writer.write_all(&self.minimizer_len.to_le_bytes()))
            .and_then(|_| writer.write_all(&self.num_partitions.to_le_bytes()))
            .map_err(|e| BloomTreeError::io(path, "write", e))?;
        for entry in &self.table {
            writer
                .write_all(&entry.to_le_bytes())
                .map_err(|e| BloomTreeError::io(path, "write", e))?;
        }
        Ok(())
    }
}

/// Auxiliary hashing parameters from a companion k-mer counting pipeline:
/// a minimizer repartition table and a per-partition hash window.
#[derive(Debug, Clone)]
pub struct AuxParams {
    pub repart: RepartTable,
    pub window: u64,
}

impl AuxParams {
    /// Load both auxiliary files. The window file holds one integer.
    pub fn load(repart_path: &Path, win_path: &Path) -> Result<Self> {
        let repart = RepartTable::load(repart_path)?;
        let text = std::fs::read_to_string(win_path)
            .map_err(|e| BloomTreeError::io(win_path, "read", e))?;
        let window: u64 = text.trim().parse().map_err(|_| {
            BloomTreeError::format(win_path, format!("hash window '{}' is not an integer", text.trim()))
        })?;
        if window == 0 {
            return Err(BloomTreeError::format(win_path, "hash window must be nonzero"));
        }
        Ok(AuxParams { repart, window })
    }

    /// The partitioned layout must tile the filter's bit space exactly, and
    /// minimizers must fit inside the filter's k-mers.
    pub fn validate_for(&self, hasher: &KmerHasher) -> Result<()> {
        let covered = u64::from(self.repart.num_partitions()) * self.window;
        if covered != hasher.num_bits {
            return Err(BloomTreeError::validation(format!(
                "{} partitions x window {} covers {} bits, filter has {}",
                self.repart.num_partitions(),
                self.window,
                covered,
                hasher.num_bits
            )));
        }
        if self.repart.minimizer_len() > hasher.kmer_size {
            return Err(BloomTreeError::validation(format!(
                "minimizer length {} exceeds k-mer size {}",
                self.repart.minimizer_len(),
                hasher.kmer_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// KmerHasher
// ============================================================================

/// Hash configuration for one tree's filters: derives bit positions for the
/// k-mers of a query or reference sequence.
#[derive(Debug, Clone, Copy)]
pub struct KmerHasher {
    pub kmer_size: u32,
    pub num_hashes: u32,
    pub seed: u64,
    pub num_bits: u64,
}

impl KmerHasher {
    /// Canonical 2-bit codes for every valid k-mer of `seq`, in sequence
    /// order. K-mers spanning non-ACGT bases are skipped.
    pub fn canonical_kmers(&self, seq: &[u8]) -> Vec<u64> {
        let k = self.kmer_size;
        if (seq.len() as u64) < u64::from(k) {
            return Vec::new();
        }
        let mask = if k == 32 {
            u64::MAX
        } else {
            (1u64 << (2 * k)) - 1
        };
        let mut kmers = Vec::with_capacity(seq.len() - k as usize + 1);
        let mut fwd = 0u64;
        let mut rc = 0u64;
        let mut run = 0u32;
        for &base in seq {
            match encode_base(base) {
                Some(code) => {
                    fwd = ((fwd << 2) | code) & mask;
                    rc = (rc >> 2) | ((3 - code) << (2 * (k - 1)));
                    run += 1;
                    if run >= k {
                        kmers.push(fwd.min(rc));
                    }
                }
                None => {
                    run = 0;
                    fwd = 0;
                    rc = 0;
                }
            }
        }
        kmers
    }

    /// Bit positions for one canonical k-mer code, one per hash function.
    pub fn positions_for(&self, canon: u64, aux: Option<&AuxParams>) -> Vec<u64> {
        let digest = xxh3_64_with_seed(&canon.to_le_bytes(), self.seed);
        let h1 = digest & 0xFFFF_FFFF;
        let h2 = (digest >> 32) | 1;
        let (base, modulus) = match aux {
            None => (0, self.num_bits),
            Some(aux) => {
                let minimizer = minimizer_of(canon, self.kmer_size, aux.repart.minimizer_len());
                (aux.repart.partition_of(minimizer) * aux.window, aux.window)
            }
        };
        (0..u64::from(self.num_hashes))
            .map(|i| base + h1.wrapping_add(i.wrapping_mul(h2)) % modulus)
            .collect()
    }

    /// Derive the per-k-mer hash positions for a whole sequence.
    ///
    /// With `distinct`, repeated k-mers are deduplicated before hashing, so
    /// the result's length is the number of distinct k-mers.
    pub fn kmerize(&self, seq: &[u8], distinct: bool, aux: Option<&AuxParams>) -> Vec<Vec<u64>> {
        let kmers = self.canonical_kmers(seq);
        if distinct {
            let mut seen = HashSet::with_capacity(kmers.len());
            kmers
                .into_iter()
                .filter(|&k| seen.insert(k))
                .map(|k| self.positions_for(k, aux))
                .collect()
        } else {
            kmers
                .into_iter()
                .map(|k| self.positions_for(k, aux))
                .collect()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher(k: u32) -> KmerHasher {
        KmerHasher {
            kmer_size: k,
            num_hashes: 2,
            seed: 0x5555,
            num_bits: 4096,
        }
    }

    fn revcomp(seq: &[u8]) -> Vec<u8> {
        seq.iter()
            .rev()
            .map(|b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                _ => b'A',
            })
            .collect()
    }

    #[test]
    fn test_canonical_kmers_strand_independent() {
        let h = hasher(8);
        let seq = b"ACGTTGCAGGTACCAT";
        let fwd: HashSet<u64> = h.canonical_kmers(seq).into_iter().collect();
        let rc: HashSet<u64> = h.canonical_kmers(&revcomp(seq)).into_iter().collect();
        assert_eq!(fwd, rc);
    }

    #[test]
    fn test_kmers_spanning_n_are_skipped() {
        let h = hasher(4);
        // Six valid bases on each side of the N: three 4-mers per side.
        let kmers = h.canonical_kmers(b"ACGTACNGTACGT");
        assert_eq!(kmers.len(), 6);
    }

    #[test]
    fn test_sequence_shorter_than_k() {
        let h = hasher(8);
        assert!(h.canonical_kmers(b"ACGT").is_empty());
    }

    #[test]
    fn test_distinct_dedupes_repeats() {
        let h = hasher(4);
        let seq = b"AAAAAAAAAA"; // one distinct 4-mer
        assert_eq!(h.kmerize(seq, true, None).len(), 1);
        assert_eq!(h.kmerize(seq, false, None).len(), 7);
    }

    #[test]
    fn test_positions_in_range() {
        let h = hasher(8);
        for positions in h.kmerize(b"ACGTACGTACGTACGTACGT", false, None) {
            assert_eq!(positions.len(), 2);
            for p in positions {
                assert!(p < h.num_bits);
            }
        }
    }

    #[test]
    fn test_k32_mask_does_not_overflow() {
        let h = KmerHasher {
            kmer_size: 32,
            num_hashes: 1,
            seed: 0,
            num_bits: 1 << 20,
        };
        let seq = vec![b'C'; 40];
        assert_eq!(h.canonical_kmers(&seq).len(), 9);
    }

    #[test]
    fn test_minimizer_of_homopolymer() {
        // AAAA...: every window is all-A (code 0), canonical against TTTT.
        let code = 0u64;
        assert_eq!(minimizer_of(code, 8, 4), 0);
    }

    #[test]
    fn test_revcomp_code() {
        // ACG = 0b00_01_10 -> revcomp CGT = 0b01_10_11
        let acg = 0b00_01_10u64;
        assert_eq!(revcomp_code(acg, 3), 0b01_10_11);
    }

    #[test]
    fn test_repart_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minimizers.repart");
        // m=2 -> 16 entries over 4 partitions
        let table: Vec<u16> = (0..16).map(|i| i % 4).collect();
        let repart = RepartTable::new(2, 4, table.clone()).unwrap();
        repart.save(&path).unwrap();

        let loaded = RepartTable::load(&path).unwrap();
        assert_eq!(loaded.minimizer_len(), 2);
        assert_eq!(loaded.num_partitions(), 4);
        assert_eq!(loaded.partition_of(7), u64::from(table[7]));
    }

    #[test]
    fn test_repart_rejects_out_of_range_entry() {
        let table: Vec<u16> = vec![9; 16];
        assert!(RepartTable::new(2, 4, table).is_err());
    }

    #[test]
    fn test_aux_params_validation() {
        let table: Vec<u16> = (0..16).map(|i| i % 4).collect();
        let aux = AuxParams {
            repart: RepartTable::new(2, 4, table).unwrap(),
            window: 1024,
        };
        assert!(aux.validate_for(&hasher(8)).is_ok());

        let mut wrong_bits = hasher(8);
        wrong_bits.num_bits = 4000;
        assert!(aux.validate_for(&wrong_bits).is_err());

        let mut tiny_k = hasher(8);
        tiny_k.kmer_size = 1;
        assert!(aux.validate_for(&tiny_k).is_err());
    }

    #[test]
    fn test_partitioned_positions_land_in_partition() {
        let table: Vec<u16> = (0..16).map(|i| i % 4).collect();
        let aux = AuxParams {
            repart: RepartTable::new(2, 4, table).unwrap(),
            window: 1024,
        };
        let h = hasher(8);
        for kmer in h.canonical_kmers(b"ACGTTGCAGGTACCAT") {
            let minimizer = minimizer_of(kmer, 8, 2);
            let part = aux.repart.partition_of(minimizer);
            for p in h.positions_for(kmer, Some(&aux)) {
                assert!(p >= part * 1024 && p < (part + 1) * 1024);
            }
        }
    }
}
