//! The query command: load a tree topology, optionally verify filter
//! consistency, run a batch of queries through the pruning traversal, and
//! print the matches.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::Instant;

use crate::bitvec::stats;
use crate::constants::DEFAULT_QUERY_THRESHOLD;
use crate::file_manager::FileManager;
use crate::hashing::AuxParams;
use crate::query::{read_queries_from_stdin, read_query_file, split_threshold_suffix, Query};
use crate::search::{batch_query, count_kmers, sort_matches_by_hit_counts, SearchOptions};
use crate::tree::BloomTree;

use super::args::QueryArgs;

pub fn run_query(args: QueryArgs) -> Result<()> {
    let start = Instant::now();

    if args.just_count_kmers && args.sort {
        bail!("--sort cannot be used with --just-count-kmers");
    }
    let full_counts = args.sort || args.report_kmer_counts;
    if args.threshold.len() > 1 {
        log::warn!(
            "--threshold given more than once; only the final setting ({}) will apply",
            args.threshold[args.threshold.len() - 1]
        );
    }
    let general_threshold = args
        .threshold
        .last()
        .copied()
        .unwrap_or(DEFAULT_QUERY_THRESHOLD);

    let aux = match (&args.repart, &args.win) {
        (Some(repart), Some(win)) => Some(
            AuxParams::load(repart, win).context("failed to load repartition parameters")?,
        ),
        _ => None,
    };

    // Read the tree.
    let mut tree = BloomTree::read_topology(&args.tree)
        .with_context(|| format!("failed to read tree topology '{}'", args.tree.display()))?;

    // Set up the file manager when nodes share container files.
    let mut manager = if tree.nodes_share_files() {
        Some(FileManager::new(&tree))
    } else {
        None
    };

    // We'd rather not run for a long time and then report a parameter
    // mismatch, so the consistency check happens before any query.
    if args.consistency_check {
        match manager.as_mut() {
            Some(manager) => manager.validate_consistency(&mut tree)?,
            None => standalone_consistency_check(&mut tree)?,
        }
    }

    // Read the queries.
    let mut queries: Vec<Query> = Vec::new();
    if args.queries.is_empty() {
        read_queries_from_stdin(general_threshold, &mut queries)?;
    } else {
        for arg in &args.queries {
            let (path, threshold) = split_threshold_suffix(arg)?;
            read_query_file(&path, threshold.unwrap_or(general_threshold), &mut queries)
                .with_context(|| format!("failed to open query file '{}'", path.display()))?;
        }
    }

    let mut out: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("failed to create output file '{}'", path.display())
        })?)),
        None => Box::new(io::stdout().lock()),
    };

    if args.just_count_kmers {
        count_kmers(&mut tree, &mut queries, args.distinct_kmers, aux.as_ref())?;
        for query in &queries {
            writeln!(out, "{} {}", query.name, query.num_positions())?;
        }
    } else {
        let options = SearchOptions {
            distinct_kmers: args.distinct_kmers,
            full_counts,
        };
        batch_query(
            &mut tree,
            manager.as_mut(),
            &mut queries,
            &options,
            aux.as_ref(),
        )?;

        if args.sort {
            sort_matches_by_hit_counts(&mut queries);
        }
        if full_counts {
            write_matches_with_counts(&mut out, &queries, args.nodes_examined)?;
        } else {
            write_matches(&mut out, &queries, args.nodes_examined)?;
        }
    }
    out.flush()?;

    // Make sure the last container file we opened for read gets closed.
    if let Some(manager) = manager.as_mut() {
        manager.close_file();
    }

    if args.time {
        eprintln!("wallTime: {:.6} secs", start.elapsed().as_secs_f64());
        eprintln!("totalLoadTime: {:.6} secs", stats::snapshot().load_secs);
    }
    Ok(())
}

/// Consistency check without a file manager: preload every node in
/// post-order and compare each against a model filter.
fn standalone_consistency_check(tree: &mut BloomTree) -> Result<()> {
    let order: Vec<usize> = tree.post_order().collect();
    let mut model: Option<usize> = None;
    for ix in order {
        if tree.node(ix).location.is_none() {
            continue;
        }
        tree.preload(ix)?;
        match model {
            None => model = Some(ix),
            Some(m) => {
                let model_bf = tree.node(m).filter.as_ref().context("model filter missing")?;
                let bf = tree.node(ix).filter.as_ref().context("filter missing")?;
                bf.assert_consistent_with(model_bf, &tree.node(ix).name)?;
            }
        }
    }
    Ok(())
}

/// Plain match report: a header per query, then matched node names.
fn write_matches<W: Write>(
    out: &mut W,
    queries: &[Query],
    report_nodes_examined: bool,
) -> io::Result<()> {
    for query in queries {
        writeln!(out, "*{} {}", query.name, query.matches.len())?;
        if report_nodes_examined {
            writeln!(out, "# {} nodes examined", query.nodes_examined)?;
        }
        for name in &query.matches {
            writeln!(out, "{}", name)?;
        }
    }
    Ok(())
}

/// Match report with hit counts and fractions (6-decimal fixed point; a
/// zero-position query prints `0` instead of dividing by zero).
fn write_matches_with_counts<W: Write>(
    out: &mut W,
    queries: &[Query],
    report_nodes_examined: bool,
) -> io::Result<()> {
    for query in queries {
        writeln!(out, "*{} {}", query.name, query.matches.len())?;
        if report_nodes_examined {
            writeln!(out, "# {} nodes examined", query.nodes_examined)?;
        }
        let total = query.num_positions() as u64;
        for (name, &count) in query.matches.iter().zip(&query.match_counts) {
            if total == 0 {
                writeln!(out, "{} {}/{} 0", name, count, total)?;
            } else {
                writeln!(
                    out,
                    "{} {}/{} {:.6}",
                    name,
                    count,
                    total,
                    count as f64 / total as f64
                )?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
