// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end scenarios with literal inputs (spec §8, E1-E5).

use annforest::database::{CreateOptions, Database};
use annforest::distance::MetricKind;
use annforest::Error;
use std::time::Duration;
use test_log::test;

#[test]
fn e1_exact_match_ranks_first_under_angular() -> annforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = CreateOptions { dim: 3, metric: MetricKind::Angular, tree_count: 1, bucket_capacity: 3 };
    let db = Database::create(dir.path(), "e1", options)?;

    db.put_online(0, vec![0.1, 0.1, 0.0])?;
    db.put_online(1, vec![0.1, 0.1, 0.1])?;
    db.put_online(2, vec![0.5, 0.5, 0.1])?;

    let result = db.search_item(0, 2, None)?;
    assert_eq!(result, vec![0, 1]);

    db.shutdown(Duration::from_secs(5));
    Ok(())
}

#[test]
fn e2_remove_preserves_invariants_and_excludes_removed_key() -> annforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = CreateOptions { dim: 3, metric: MetricKind::Angular, tree_count: 2, bucket_capacity: 3 };
    let db = Database::create(dir.path(), "e2", options)?;

    for key in 0..5 {
        let v = if key % 2 == 0 { vec![1.0, 1.0, 1.0] } else { vec![-1.0, -1.0, -1.0] };
        db.put_online(key, v)?;
    }
    db.delete_online(2)?;

    let result = db.search(&[1.0, 1.0, 1.0], 3, None)?;
    assert!(!result.contains(&2));
    for key in &result {
        assert!([0, 1, 3, 4].contains(key));
    }

    db.shutdown(Duration::from_secs(5));
    Ok(())
}

#[test]
fn e3_binlog_path_applied_then_deleted() -> annforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = CreateOptions { dim: 5, metric: MetricKind::Euclidean, tree_count: 1, bucket_capacity: 4 };
    let db = Database::create(dir.path(), "e3", options)?;

    db.put(1, vec![0.0, 0.0, 0.0, 0.0, 0.0])?;
    db.apply_once(&dir.path().join("scratch"))?;
    assert_eq!(db.search_item(1, 1, None)?, vec![1]);

    db.delete(1)?;
    db.apply_once(&dir.path().join("scratch"))?;
    assert!(matches!(db.search_item(1, 1, None), Err(Error::NotFound)));

    db.shutdown(Duration::from_secs(5));
    Ok(())
}

#[test]
fn e4_concurrent_adds_and_searches_never_corrupt_structures() -> annforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = CreateOptions { dim: 4, metric: MetricKind::Euclidean, tree_count: 4, bucket_capacity: 8 };
    let db = Database::create(dir.path(), "e4", options)?;
    db.put_online(0, vec![0.0, 0.0, 0.0, 0.0])?;

    let writer_db = db.clone();
    let writer = std::thread::spawn(move || -> annforest::Result<()> {
        for key in 1..100 {
            let seed = key as f64;
            writer_db.put_online(key, vec![seed, seed * 0.5, seed * 0.25, seed * 0.125])?;
        }
        Ok(())
    });

    let reader_db = db.clone();
    let reader = std::thread::spawn(move || -> annforest::Result<()> {
        for _ in 0..100 {
            match reader_db.search_item_with_deadline(0, 10, None, Duration::from_secs(10)) {
                Ok(_) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    });

    writer.join().expect("writer thread panicked")?;
    reader.join().expect("reader thread panicked")?;

    assert_eq!(db.len(), 100);
    db.shutdown(Duration::from_secs(5));
    Ok(())
}

#[test]
fn e5_binlog_content_invisible_until_apply_survives_reopen() -> annforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = CreateOptions { dim: 3, metric: MetricKind::Angular, tree_count: 1, bucket_capacity: 3 };

    {
        let db = Database::create(dir.path(), "e5", options)?;
        db.put(0, vec![0.1, 0.1, 0.0])?;
        db.put(1, vec![0.1, 0.1, 0.1])?;
        db.shutdown(Duration::from_secs(5));
    }

    // Restart without ever running apply: pending binlog rows stay invisible.
    let reopened = Database::open(dir.path(), "e5")?;
    assert!(matches!(reopened.search_item(0, 1, None), Err(Error::NotFound)));

    reopened.apply_once(&dir.path().join("scratch"))?;
    let result = reopened.search_item(0, 2, None)?;
    assert_eq!(result, vec![0, 1]);

    reopened.shutdown(Duration::from_secs(5));
    Ok(())
}
