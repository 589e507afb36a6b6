//! Sequence Bloom Tree query engine.
//!
//! Indexes large collections of genomic sequence datasets so that, given a
//! query sequence, one can quickly determine which datasets likely contain
//! it. Each dataset is a bloom filter over its k-mers; filters are
//! organized into a rooted hierarchy whose internal nodes summarize their
//! subtrees, so containment queries prune whole subtrees that provably lack
//! a k-mer.
//!
//! The layers, bottom up:
//!
//! - [`bitvec`]: rank/select-backed bit vectors with raw and sparse
//!   on-disk encodings
//! - [`bloom`]: plain and determined bloom filters over those vectors
//! - [`hashing`]: canonical k-mer hashing to filter bit positions
//! - [`tree`]: the node hierarchy, topology parsing, lazy load/unload
//! - [`file_manager`]: batched reads of filters packed into shared
//!   container files
//! - [`query`] and [`search`]: per-query state and the pruning batch
//!   traversal
//! - [`builder`]: tree construction from reference datasets

pub mod bitvec;
pub mod bloom;
pub mod builder;
pub mod commands;
pub mod constants;
pub mod error;
pub mod file_manager;
pub mod hashing;
mod le_io;
pub mod logging;
pub mod query;
pub mod search;
pub mod tree;

pub use bitvec::{BitVector, Encoding};
pub use bloom::{BloomFilter, FilterKind, FilterParams, Resolution};
pub use builder::build_tree;
pub use constants::DEFAULT_QUERY_THRESHOLD;
pub use error::{BloomTreeError, Result};
pub use file_manager::FileManager;
pub use hashing::{AuxParams, KmerHasher, RepartTable};
pub use query::{parse_probability, read_query_file, split_threshold_suffix, Query};
pub use search::{batch_query, count_kmers, sort_matches_by_hit_counts, SearchOptions};
pub use tree::{BloomTree, FilterLocation, PostOrder, TreeNode};
