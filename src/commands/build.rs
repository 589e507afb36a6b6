//! The build command: construct a tree over reference datasets.

use anyhow::{Context, Result};

use crate::bloom::FilterParams;
use crate::builder::build_tree;

use super::args::BuildArgs;

pub fn run_build(args: BuildArgs) -> Result<()> {
    let params = FilterParams {
        num_bits: args.num_bits,
        num_hashes: args.num_hashes,
        kmer_size: args.kmer_size,
        hash_seed: args.seed,
    };
    let total = build_tree(&args.reference, params, &args.container, &args.tree)
        .context("failed to build tree")?;
    log::info!(
        "wrote {} node(s) to '{}', topology '{}'",
        total,
        args.container.display(),
        args.tree.display()
    );
    Ok(())
}
