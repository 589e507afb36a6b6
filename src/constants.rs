//! Constants used throughout the bloomtree library for binary format
//! definitions, safety limits, and performance tuning.
//!
//! Centralizing these constants ensures consistency across the codebase and
//! makes it easy to adjust values when needed.

// ============================================================================
// I/O Buffer Sizes
// ============================================================================

/// Buffer size for reading filter container files (8MB).
pub(crate) const READ_BUF_SIZE: usize = 8 * 1024 * 1024;

/// Buffer size for writing filter container files (8MB).
pub(crate) const WRITE_BUF_SIZE: usize = 8 * 1024 * 1024;

// ============================================================================
// Binary Format Magic Bytes
// ============================================================================

/// Magic bytes for serialized bloom filter blocks (.bf).
pub(crate) const FILTER_BLOCK_MAGIC: &[u8; 4] = b"SBF1";

/// Magic bytes for minimizer repartition tables (.repart).
pub(crate) const REPART_MAGIC: &[u8; 4] = b"SBRP";

// ============================================================================
// Binary Format Versions
// ============================================================================

/// Current version for serialized bloom filter blocks.
pub(crate) const FILTER_BLOCK_VERSION: u32 = 1;

/// Current version for minimizer repartition tables.
pub(crate) const REPART_VERSION: u32 = 1;

// ============================================================================
// Safety Limits for Loading Files
// ============================================================================

/// Maximum bit-vector length (64 Gbit, 8GB of raw words).
pub(crate) const MAX_BIT_VECTOR_BITS: u64 = 64_000_000_000;

/// Maximum number of hash functions per filter.
pub(crate) const MAX_NUM_HASHES: u32 = 16;

/// Maximum number of nodes in one tree topology.
pub(crate) const MAX_TREE_NODES: usize = 10_000_000;

/// Maximum length for node names in topology files (10KB).
pub(crate) const MAX_NAME_LENGTH: usize = 10_000;

/// Maximum minimizer length for repartition tables (4^12 table entries).
pub(crate) const MAX_MINIMIZER_LENGTH: u32 = 12;

// ============================================================================
// Rank/Select Index
// ============================================================================

/// Words per rank superblock (8 x 64 = 512 bits per superblock).
pub(crate) const RANK_SUPERBLOCK_WORDS: usize = 8;

/// Bits per rank superblock.
pub(crate) const RANK_SUPERBLOCK_BITS: u64 = (RANK_SUPERBLOCK_WORDS as u64) * 64;

// ============================================================================
// Query Defaults
// ============================================================================

/// Default fraction of query k-mers that must be present in a leaf for the
/// leaf to be reported as a match.
pub const DEFAULT_QUERY_THRESHOLD: f64 = 0.7;

// ============================================================================
// Tests
// ============================================================================
