//! Batch tree traversal: the query engine.
//!
//! Queries are processed strictly one after another, each via an explicit
//! worklist over the shared tree (no native recursion, so deep or wide
//! trees cannot overflow the stack). A frame carries the k-mer indices
//! still in play for that subtree plus the count of k-mers already resolved
//! present on the path; per node the engine loads the filter lazily,
//! resolves each surviving k-mer, and either records a leaf match, descends,
//! or prunes the subtree when the threshold can no longer be met.

use std::cmp::Reverse;

use crate::bloom::Resolution;
use crate::error::{BloomTreeError, Result};
use crate::file_manager::FileManager;
use crate::hashing::AuxParams;
use crate::query::Query;
use crate::tree::BloomTree;

/// Knobs for a batch search.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    /// Deduplicate repeated k-mers within each query before counting.
    pub distinct_kmers: bool,
    /// Retain exact hit counts for every reported match; without this the
    /// engine may stop counting at a leaf once the pass/fail decision is
    /// made.
    pub full_counts: bool,
}

/// One worklist entry: a node plus the query k-mers still undecided there.
struct Frame {
    node: usize,
    kmers: Vec<u32>,
    /// K-mers already proven present for this whole subtree.
    resolved_present: u64,
}

/// Run every query against the tree, populating each query's matches,
/// hit counts, and nodes-examined counter.
///
/// When `manager` is given, node loads go through its batched shared-file
/// path; otherwise each node reads its own file directly.
pub fn batch_query(
    tree: &mut BloomTree,
    mut manager: Option<&mut FileManager>,
    queries: &mut [Query],
    options: &SearchOptions,
    aux: Option<&AuxParams>,
) -> Result<()> {
    // Route the first load through the manager so it stays the sole owner
    // of the open-container state.
    if let Some(fm) = manager.as_deref_mut() {
        let first = tree
            .post_order()
            .find(|&ix| tree.node(ix).location.is_some());
        if let Some(first) = first {
            fm.load_node(tree, first)?;
        }
    }
    let hasher = tree.real_filter()?.params().hasher();
    if let Some(aux) = aux {
        aux.validate_for(&hasher)?;
    }

    for query in queries.iter_mut() {
        query.kmerize(&hasher, options.distinct_kmers, aux);
        search_one(tree, manager.as_deref_mut(), query, options)?;
        log::info!(
            "query '{}': {} match(es), {} nodes examined",
            query.name,
            query.matches.len(),
            query.nodes_examined
        );
    }
    Ok(())
}

/// Kmerize queries without searching (the just-count-k-mers mode).
pub fn count_kmers(
    tree: &mut BloomTree,
    queries: &mut [Query],
    distinct_kmers: bool,
    aux: Option<&AuxParams>,
) -> Result<()> {
    let hasher = tree.real_filter()?.params().hasher();
    if let Some(aux) = aux {
        aux.validate_for(&hasher)?;
    }
    for query in queries.iter_mut() {
        query.kmerize(&hasher, distinct_kmers, aux);
    }
    Ok(())
}

fn search_one(
    tree: &mut BloomTree,
    mut manager: Option<&mut FileManager>,
    query: &mut Query,
    options: &SearchOptions,
) -> Result<()> {
    let all_kmers: Vec<u32> = (0..query.kmer_positions.len() as u32).collect();
    let mut stack = vec![Frame {
        node: tree.root(),
        kmers: all_kmers,
        resolved_present: 0,
    }];

    while let Some(frame) = stack.pop() {
        let node_ix = frame.node;

        // A placeholder root has no filter: descend untested.
        if tree.node(node_ix).location.is_none() {
            for &child in tree.node(node_ix).children.iter().rev() {
                stack.push(Frame {
                    node: child,
                    kmers: frame.kmers.clone(),
                    resolved_present: frame.resolved_present,
                });
            }
            continue;
        }

        query.nodes_examined += 1;
        match manager.as_deref_mut() {
            Some(fm) => fm.load_node(tree, node_ix)?,
            None => tree.load(node_ix)?,
        }
        let node = tree.node(node_ix);
        let filter = node.filter.as_ref().ok_or_else(|| {
            BloomTreeError::validation(format!("filter missing after load for '{}'", node.name))
        })?;

        if node.is_leaf() {
            let needed = query.needed_to_pass;
            let mut hits = frame.resolved_present;
            if options.full_counts {
                for &k in &frame.kmers {
                    if filter.contains_kmer(&query.kmer_positions[k as usize]) {
                        hits += 1;
                    }
                }
            } else {
                for &k in &frame.kmers {
                    if hits >= needed {
                        break;
                    }
                    if filter.contains_kmer(&query.kmer_positions[k as usize]) {
                        hits += 1;
                    }
                }
            }
            if hits >= needed {
                query.matches.push(node.name.clone());
                query.match_counts.push(hits);
            }
        } else {
            let mut resolved_present = frame.resolved_present;
            let mut surviving = Vec::with_capacity(frame.kmers.len());
            for &k in &frame.kmers {
                match filter.resolve_kmer(&query.kmer_positions[k as usize]) {
                    Resolution::Absent => {}
                    Resolution::Present => resolved_present += 1,
                    Resolution::Unknown => surviving.push(k),
                }
            }
            // Even if every surviving k-mer turns out present below, the
            // threshold may already be unreachable.
            if resolved_present + surviving.len() as u64 >= query.needed_to_pass {
                for &child in node.children.iter().rev() {
                    stack.push(Frame {
                        node: child,
                        kmers: surviving.clone(),
                        resolved_present,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Re-sort every query's matches by decreasing hit count, ties broken by
/// name ascending. Changes presentation order only; idempotent.
pub fn sort_matches_by_hit_counts(queries: &mut [Query]) {
    for query in queries {
        let names = std::mem::take(&mut query.matches);
        let counts = std::mem::take(&mut query.match_counts);
        let mut pairs: Vec<(Reverse<u64>, String)> = counts
            .into_iter()
            .zip(names)
            .map(|(count, name)| (Reverse(count), name))
            .collect();
        pairs.sort();
        query.matches = pairs.iter().map(|(_, name)| name.clone()).collect();
        query.match_counts = pairs.into_iter().map(|(Reverse(count), _)| count).collect();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn query_with_matches(pairs: &[(&str, u64)]) -> Query {
        let mut q = Query::new("q", "", 0.5);
        for (name, count) in pairs {
            q.matches.push(name.to_string());
            q.match_counts.push(*count);
        }
        q
    }

    #[test]
    fn test_sort_decreasing_with_name_tiebreak() {
        let mut queries = vec![query_with_matches(&[
            ("zeta", 5),
            ("alpha", 9),
            ("mid", 5),
            ("beta", 5),
        ])];
        sort_matches_by_hit_counts(&mut queries);

        assert_eq!(queries[0].matches, vec!["alpha", "beta", "mid", "zeta"]);
        assert_eq!(queries[0].match_counts, vec![9, 5, 5, 5]);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut queries = vec![query_with_matches(&[("b", 3), ("a", 3), ("c", 7)])];
        sort_matches_by_hit_counts(&mut queries);
        let once_names = queries[0].matches.clone();
        let once_counts = queries[0].match_counts.clone();

        sort_matches_by_hit_counts(&mut queries);
        assert_eq!(queries[0].matches, once_names);
        assert_eq!(queries[0].match_counts, once_counts);
    }

    #[test]
    fn test_sort_preserves_match_set() {
        let mut queries = vec![query_with_matches(&[("x", 1), ("y", 2)])];
        sort_matches_by_hit_counts(&mut queries);
        let mut names = queries[0].matches.clone();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
    }
}
