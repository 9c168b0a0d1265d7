//! Query executor
//!
//! Combines an index's candidate set with metadata predicates and ranks the
//! survivors. The executor operates on library entries the caller has
//! already locked (LIBRARY read + INDEX read); it performs no locking and no
//! I/O of its own.
//!
//! With a filter present the index is asked for `k * multiplier` candidates
//! up front; if filtering starves the result below `k`, the request widens
//! geometrically until a total work cap of `k * 16` candidates is reached or
//! the index runs out.

#![warn(missing_docs)]
#![warn(clippy::all)]

use lodestone_core::types::validate_embedding;
use lodestone_core::{ChunkId, Error, Filter, LibraryId, MetadataMap, Result};
use lodestone_store::LibraryEntry;
use tracing::trace;

/// Total candidate work cap, as a multiple of `k`.
pub const REFILL_WORK_FACTOR: usize = 16;

/// Candidate multiplier applied when a filter is present and the caller did
/// not choose one.
pub const DEFAULT_FILTER_MULTIPLIER: usize = 4;

/// One ranked search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// The matching chunk.
    pub chunk_id: ChunkId,
    /// The chunk's text content.
    pub content: String,
    /// Distance to the query (lower is better).
    pub distance: f32,
    /// Similarity score `1 / (1 + distance)`.
    pub score: f32,
    /// The chunk's metadata.
    pub metadata: MetadataMap,
}

/// One result of a multi-library search.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiSearchHit {
    /// Library the hit came from.
    pub library_id: LibraryId,
    /// The ranked hit.
    pub hit: SearchHit,
}

/// Resolve the effective candidate multiplier for a request.
pub fn effective_multiplier(multiplier: Option<usize>, has_filter: bool) -> usize {
    match multiplier {
        Some(m) => m.max(1),
        None if has_filter => DEFAULT_FILTER_MULTIPLIER,
        None => 1,
    }
}

/// Search one library entry.
///
/// The caller holds LIBRARY read + INDEX read for the entry, so the chunk
/// table and index are a consistent pair for the duration.
pub fn search_library(
    entry: &LibraryEntry,
    query: &[f32],
    k: usize,
    filter: Option<&Filter>,
    multiplier: usize,
) -> Result<Vec<SearchHit>> {
    validate_query(entry, query)?;
    if k == 0 {
        return Ok(Vec::new());
    }

    let cap = k.saturating_mul(REFILL_WORK_FACTOR);
    let mut request = k.saturating_mul(multiplier.max(1)).min(cap);

    loop {
        let candidates = entry.index.search(query, request, request)?;
        let exhausted = candidates.len() < request;

        let mut hits = Vec::with_capacity(k);
        for (chunk_id, distance) in &candidates {
            let Some(chunk) = entry.chunks.get(chunk_id) else {
                // Index and table are locked together; a missing chunk is a bug.
                return Err(Error::internal(format!(
                    "index returned unknown chunk {}",
                    chunk_id
                )));
            };
            if filter.map_or(true, |f| f.matches(chunk)) {
                hits.push(SearchHit {
                    chunk_id: *chunk_id,
                    content: chunk.content.clone(),
                    distance: *distance,
                    score: 1.0 / (1.0 + distance),
                    metadata: chunk.metadata.clone(),
                });
                if hits.len() == k {
                    return Ok(hits);
                }
            }
        }

        if exhausted || request >= cap {
            trace!(
                found = hits.len(),
                k,
                request,
                "search finished below k"
            );
            return Ok(hits);
        }
        request = request.saturating_mul(2).min(cap);
    }
}

/// Search several libraries and merge the results.
///
/// Every library must share the query's dimension and one distance metric;
/// anything else fails with `HeterogeneousLibraries`. Merged results are
/// re-sorted by `(distance, chunk id)` and cut to `k`.
pub fn multi_search(
    entries: &[(LibraryId, &LibraryEntry)],
    query: &[f32],
    k: usize,
    filter: Option<&Filter>,
    multiplier: usize,
) -> Result<Vec<MultiSearchHit>> {
    let Some(((_, first), rest)) = entries.split_first() else {
        return Ok(Vec::new());
    };
    for (library_id, entry) in rest {
        if entry.library.dimension != first.library.dimension {
            return Err(Error::HeterogeneousLibraries {
                reason: format!(
                    "library {} has dimension {}, expected {}",
                    library_id, entry.library.dimension, first.library.dimension
                ),
            });
        }
        if entry.library.metric != first.library.metric {
            return Err(Error::HeterogeneousLibraries {
                reason: format!(
                    "library {} uses {} distance, expected {}",
                    library_id, entry.library.metric, first.library.metric
                ),
            });
        }
    }

    let mut merged = Vec::new();
    for (library_id, entry) in entries {
        for hit in search_library(entry, query, k, filter, multiplier)? {
            merged.push(MultiSearchHit {
                library_id: *library_id,
                hit,
            });
        }
    }
    merged.sort_by(|a, b| {
        a.hit
            .distance
            .total_cmp(&b.hit.distance)
            .then_with(|| a.hit.chunk_id.cmp(&b.hit.chunk_id))
    });
    merged.truncate(k);
    Ok(merged)
}

fn validate_query(entry: &LibraryEntry, query: &[f32]) -> Result<()> {
    validate_embedding(query, entry.library.dimension)
}
