//! Index rebuild behavior: tombstone cleanup, result parity, searches during
//! rebuild.

use lodestone::prelude::*;
use lodestone::{HnswParams, IndexKind, NewChunk};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Database {
    Database::open(DatabaseOptions::new(dir.path())).unwrap()
}

fn chunk(embedding: Vec<f32>) -> NewChunk {
    NewChunk {
        content: "text".into(),
        embedding,
        ..Default::default()
    }
}

/// Deterministic pseudo-random unit-ish vectors without pulling a generator
/// into the test: mixes the index through a couple of odd multipliers.
fn vector(i: usize, dimension: usize) -> Vec<f32> {
    (0..dimension)
        .map(|d| {
            let x = ((i * 31 + d * 17) % 97) as f32 / 97.0;
            x - 0.5
        })
        .collect()
}

#[test]
fn test_rebuild_after_mass_deletion() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let lib = db
        .create_library(
            "big",
            8,
            DistanceMetric::Cosine,
            IndexParams::Hnsw(HnswParams::default()),
            MetadataMap::new(),
        )
        .unwrap()
        .library
        .id;

    let mut ids = Vec::new();
    for i in 0..1000 {
        ids.push(db.insert_chunk(lib, chunk(vector(i, 8))).unwrap());
    }
    let deleted: Vec<_> = ids.iter().take(400).copied().collect();
    for id in &deleted {
        db.delete_chunk(*id).unwrap();
    }

    let len = db.rebuild_index(lib).unwrap();
    assert_eq!(len, 600);
    assert_eq!(db.get_library(lib).unwrap().index_len, 600);

    // Querying a deleted chunk's embedding returns surviving neighbors only.
    let hits = db.search(lib, &vector(0, 8), 10, None, None).unwrap();
    assert_eq!(hits.len(), 10);
    let deleted_set: std::collections::HashSet<_> = deleted.into_iter().collect();
    assert!(hits.iter().all(|h| !deleted_set.contains(&h.chunk_id)));
    db.close().unwrap();
}

#[test]
fn test_rebuild_top1_parity() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    // A beam wider than the library makes layer-0 search exhaustive, so
    // parity does not depend on graph shape.
    let lib = db
        .create_library(
            "parity",
            8,
            DistanceMetric::Cosine,
            IndexParams::Hnsw(HnswParams {
                ef_search: 256,
                ..HnswParams::default()
            }),
            MetadataMap::new(),
        )
        .unwrap()
        .library
        .id;

    for i in 0..200 {
        db.insert_chunk(lib, chunk(vector(i, 8))).unwrap();
    }
    for (i, id) in db
        .list_chunks(lib, None, 1000)
        .unwrap()
        .items
        .iter()
        .map(|c| c.id)
        .enumerate()
        .collect::<Vec<_>>()
    {
        if i % 3 == 0 {
            db.delete_chunk(id).unwrap();
        }
    }

    // Top-1 parity over a sample of queries before and after rebuild.
    let queries: Vec<Vec<f32>> = (0..100).map(|i| vector(i * 7 + 3, 8)).collect();
    let before: Vec<_> = queries
        .iter()
        .map(|q| db.search(lib, q, 1, None, None).unwrap()[0].chunk_id)
        .collect();
    db.rebuild_index(lib).unwrap();
    let after: Vec<_> = queries
        .iter()
        .map(|q| db.search(lib, q, 1, None, None).unwrap()[0].chunk_id)
        .collect();
    assert_eq!(before, after);
    db.close().unwrap();
}

#[test]
fn test_kdtree_rebuild_after_tombstones() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let lib = db
        .create_library(
            "kdt",
            8,
            DistanceMetric::Euclidean,
            IndexParams::default_for(IndexKind::KdTree),
            MetadataMap::new(),
        )
        .unwrap()
        .library
        .id;

    let mut ids = Vec::new();
    for i in 0..100 {
        ids.push(db.insert_chunk(lib, chunk(vector(i, 8))).unwrap());
    }
    for id in ids.iter().take(40) {
        db.delete_chunk(*id).unwrap();
    }

    let len = db.rebuild_index(lib).unwrap();
    assert_eq!(len, 60);

    let hits = db.search(lib, &vector(50, 8), 60, None, None).unwrap();
    assert_eq!(hits.len(), 60);
    db.close().unwrap();
}

#[test]
fn test_rebuild_survives_restart() {
    let dir = TempDir::new().unwrap();
    let lib;
    {
        let db = open_db(&dir);
        lib = db
            .create_library(
                "persist",
                8,
                DistanceMetric::Cosine,
                IndexParams::Hnsw(HnswParams::default()),
                MetadataMap::new(),
            )
            .unwrap()
            .library
            .id;
        let mut ids = Vec::new();
        for i in 0..50 {
            ids.push(db.insert_chunk(lib, chunk(vector(i, 8))).unwrap());
        }
        for id in ids.iter().take(20) {
            db.delete_chunk(*id).unwrap();
        }
        db.rebuild_index(lib).unwrap();
        db.close().unwrap();
    }

    let db = open_db(&dir);
    let info = db.get_library(lib).unwrap();
    assert_eq!(info.chunk_count, 30);
    assert_eq!(info.index_len, 30);
    db.close().unwrap();
}
