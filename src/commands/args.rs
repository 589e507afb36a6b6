//! Command-line argument definitions for the bloomtree CLI.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::query::parse_probability;

/// Clap value parser for threshold fractions.
fn parse_threshold_arg(s: &str) -> Result<f64, String> {
    parse_probability(s).map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(name = "bloomtree")]
#[command(about = "Sequence Bloom Tree query engine for k-mer containment search")]
#[command(
    long_about = "Bloomtree: determine which sequence datasets likely contain a query
sequence, without scanning raw sequence data. Each dataset is a bloom filter
over its k-mers; filters are organized into a rooted tree so containment
queries can prune whole subtrees.

WORKFLOW:
  1. Build a tree:   bloomtree build -r ds1.fa -r ds2.fa --tree tree.sbt --container all.bf
  2. Query it:       bloomtree query --tree tree.sbt queries.fa

QUERY INPUT FORMATS:
  FASTA/FASTQ (.fa, .fq, optionally .gz) or plain text with one nucleotide
  sequence per line; queries are read from stdin when no file is named.
  A query file argument may carry its own threshold as file.fa=0.5 or
  file.fa:0.5, overriding the global --threshold for that file only.

OUTPUT FORMAT (query):
  Per query: '*<name> <num_matches>', optionally '# <n> nodes examined',
  then one line per matched dataset; with --sort, each match line carries
  '<hits>/<total> <fraction>'."
)]
#[command(after_help = "EXAMPLES:
  # Build a tree over three datasets
  bloomtree build -r ecoli.fa -r salmonella.fa -r phage.fa \\
      --tree tree.sbt --container all.bf -k 21 -b 2000000

  # Query with the default threshold
  bloomtree query --tree tree.sbt queries.fa

  # Per-file threshold override, sorted output with hit counts
  bloomtree query --tree tree.sbt strict.fa=0.9 loose.fa --threshold 0.5 --sort

  # Count query k-mers only (no tree search)
  bloomtree query --tree tree.sbt queries.fa --just-count-kmers")]
pub struct Cli {
    /// Enable verbose progress output with timestamps
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query a sequence bloom tree
    Query(QueryArgs),

    /// Build a tree from reference FASTA files
    Build(BuildArgs),
}

#[derive(Args)]
pub struct QueryArgs {
    /// Tree topology file
    #[arg(long, visible_aliases = ["intree", "topology"])]
    pub tree: PathBuf,

    /// Query files, each optionally suffixed with its own threshold
    /// (file.fa=F or file.fa:F). Reads stdin when none are given.
    #[arg(value_name = "QUERYFILE[=F]")]
    pub queries: Vec<String>,

    /// Fraction of query k-mers that must be present in a leaf for it to
    /// be reported as a match. Applies to query files without their own
    /// threshold. If given more than once, the last value wins.
    #[arg(short, long, value_parser = parse_threshold_arg, action = clap::ArgAction::Append)]
    pub threshold: Vec<f64>,

    /// Sort matched leaves by decreasing number of query k-mers present,
    /// and report the counts
    #[arg(long)]
    pub sort: bool,

    /// Report exact hit counts for every match without re-sorting
    #[arg(long)]
    pub report_kmer_counts: bool,

    /// Deduplicate repeated k-mers within each query before counting
    #[arg(long, visible_alias = "distinct")]
    pub distinct_kmers: bool,

    /// Before searching, check that bloom filter properties are consistent
    /// across the whole tree
    #[arg(long)]
    pub consistency_check: bool,

    /// Report only each query's k-mer count against the root filter's
    /// parameters; no tree search
    #[arg(long)]
    pub just_count_kmers: bool,

    /// Report how many tree nodes each query examined
    #[arg(long, visible_alias = "stat-nodes-examined")]
    pub nodes_examined: bool,

    /// Report wall time and node I/O time to stderr
    #[arg(long)]
    pub time: bool,

    /// File for query results (default: stdout)
    #[arg(short, long, visible_alias = "output")]
    pub out: Option<PathBuf>,

    /// Minimizer repartition table from a companion k-mer counting pipeline
    #[arg(long, requires = "win")]
    pub repart: Option<PathBuf>,

    /// Hash window file from a companion k-mer counting pipeline
    #[arg(long, requires = "repart")]
    pub win: Option<PathBuf>,
}

#[derive(Args)]
pub struct BuildArgs {
    /// Reference FASTA/FASTQ files, one leaf dataset per file.
    /// Can be given multiple times: -r ds1.fa -r ds2.fa
    #[arg(short, long, required = true)]
    pub reference: Vec<PathBuf>,

    /// Output topology file
    #[arg(long)]
    pub tree: PathBuf,

    /// Output container file holding every node's filter block
    #[arg(long)]
    pub container: PathBuf,

    /// Bit-array length for every filter in the tree
    #[arg(short = 'b', long, default_value_t = 2_000_000)]
    pub num_bits: u64,

    /// Number of hash functions per filter
    #[arg(long, default_value_t = 1)]
    pub num_hashes: u32,

    /// K-mer length (1..=32)
    #[arg(short = 'k', long, default_value_t = 21)]
    pub kmer_size: u32,

    /// Seed for k-mer hashing; must match between build and query tooling
    #[arg(short, long, default_value_t = 0x5555555555555555)]
    pub seed: u64,
}
