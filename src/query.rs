//! One query sequence and its search state.
//!
//! A query carries the raw sequence, its pass/fail threshold, the derived
//! k-mer hash positions, and the results accumulated during traversal
//! (matched node names, per-match hit counts, nodes examined). All mutable
//! search state lives here, never on tree nodes, so one tree serves an
//! arbitrary batch of queries.
//!
//! Query sources are FASTA/FASTQ files (via needletail, gzip included) or
//! plain one-sequence-per-line text; a source's filename argument may carry
//! its own threshold as a `name=F` or `name:F` suffix.

use needletail::{parse_fastx_file, parse_fastx_reader};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use crate::error::{BloomTreeError, Result};
use crate::hashing::{AuxParams, KmerHasher};

/// One query sequence with its accumulated results.
#[derive(Debug, Clone)]
pub struct Query {
    pub name: String,
    pub seq: String,
    /// Fraction of k-mers that must be present for a leaf to match.
    pub threshold: f64,
    /// Hash positions per k-mer, one inner vector per k-mer.
    pub kmer_positions: Vec<Vec<u64>>,
    /// `ceil(threshold * num_positions)`, fixed once at kmerize time.
    pub needed_to_pass: u64,
    /// Matched node names, in traversal-discovery order until re-sorted.
    pub matches: Vec<String>,
    /// Hit counts parallel to `matches`.
    pub match_counts: Vec<u64>,
    pub nodes_examined: u64,
}

impl Query {
    pub fn new(name: impl Into<String>, seq: impl Into<String>, threshold: f64) -> Query {
        Query {
            name: name.into(),
            seq: seq.into(),
            threshold,
            kmer_positions: Vec::new(),
            needed_to_pass: 0,
            matches: Vec::new(),
            match_counts: Vec::new(),
            nodes_examined: 0,
        }
    }

    /// Number of (possibly distinct) query k-mer positions.
    pub fn num_positions(&self) -> usize {
        self.kmer_positions.len()
    }

    /// Derive the k-mer hash positions and fix `needed_to_pass`.
    ///
    /// A query with zero positions needs zero hits, so it passes trivially
    /// at every node it reaches.
    pub fn kmerize(&mut self, hasher: &KmerHasher, distinct: bool, aux: Option<&AuxParams>) {
        self.kmer_positions = hasher.kmerize(self.seq.as_bytes(), distinct, aux);
        self.needed_to_pass = (self.threshold * self.kmer_positions.len() as f64).ceil() as u64;
    }
}

// ============================================================================
// Thresholds
// ============================================================================

/// Parse a probability in [0, 1].
pub fn parse_probability(s: &str) -> Result<f64> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|_| BloomTreeError::validation(format!("'{}' is not a number", s)))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(BloomTreeError::validation(format!(
            "threshold {} is not between 0 and 1",
            value
        )));
    }
    Ok(value)
}

/// Split an optional `=F` or `:F` threshold suffix off a query filename
/// argument.
pub fn split_threshold_suffix(arg: &str) -> Result<(PathBuf, Option<f64>)> {
    if let Some((path, suffix)) = arg.split_once('=') {
        return Ok((PathBuf::from(path), Some(parse_probability(suffix)?)));
    }
    if let Some((path, suffix)) = arg.split_once(':') {
        return Ok((PathBuf::from(path), Some(parse_probability(suffix)?)));
    }
    Ok((PathBuf::from(arg), None))
}

// ============================================================================
// Query sources
// ============================================================================

/// Read one query file into `queries`, tagging each with `threshold`.
///
/// FASTA/FASTQ is detected from a leading `>`/`@` (or a `.gz` suffix) and
/// handed to needletail; anything else is treated as one sequence per line,
/// with queries named `query_<ordinal>` within the source.
pub fn read_query_file(path: &Path, threshold: f64, queries: &mut Vec<Query>) -> Result<()> {
    let data = std::fs::read(path).map_err(|e| BloomTreeError::io(path, "open", e))?;
    let gz = path.extension().is_some_and(|e| e == "gz");
    read_query_source(&data, gz, path, threshold, queries)
}

/// Read queries from standard input (used when no query files are named).
pub fn read_queries_from_stdin(threshold: f64, queries: &mut Vec<Query>) -> Result<()> {
    let path = Path::new("(stdin)");
    let mut data = Vec::new();
    std::io::stdin()
        .read_to_end(&mut data)
        .map_err(|e| BloomTreeError::io(path, "read", e))?;
    read_query_source(&data, false, path, threshold, queries)
}

fn read_query_source(
    data: &[u8],
    gz: bool,
    path: &Path,
    threshold: f64,
    queries: &mut Vec<Query>,
) -> Result<()> {
    let first = data
        .iter()
        .copied()
        .find(|b| !b.is_ascii_whitespace())
        .unwrap_or(b'\n');

    if gz || first == b'>' || first == b'@' {
        let mut reader = if gz {
            parse_fastx_file(path).map_err(|e| BloomTreeError::format(path, e.to_string()))?
        } else {
            parse_fastx_reader(Cursor::new(data.to_vec()))
                .map_err(|e| BloomTreeError::format(path, e.to_string()))?
        };
        while let Some(record) = reader.next() {
            let record = record.map_err(|e| BloomTreeError::format(path, e.to_string()))?;
            let header = String::from_utf8_lossy(record.id()).to_string();
            let name = header
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            let seq = String::from_utf8_lossy(&record.seq()).to_string();
            queries.push(Query::new(name, seq, threshold));
        }
    } else {
        let text = String::from_utf8_lossy(data);
        let mut ordinal = 0usize;
        for line in text.lines() {
            let seq = line.trim();
            if seq.is_empty() {
                continue;
            }
            ordinal += 1;
            queries.push(Query::new(format!("query_{}", ordinal), seq, threshold));
        }
    }
    log::info!("read queries from '{}'", path.display());
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
