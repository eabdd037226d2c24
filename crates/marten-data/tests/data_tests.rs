// Tests for marten-data: pipelines, the tree adapter and the DataLoader

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use marten_core::{DType, Error, Result};
use marten_cpu::{CpuBackend, CpuDevice};
use marten_data::{Column, DataLoader, GeneratorSource, Normalize, Pipeline, Row, TreeAdapter, VecDataset};

// Helpers

/// `n` rows with one scalar column `x` holding the row index.
fn counter(name: &'static str, n: usize) -> Pipeline {
    Pipeline::from_source(Arc::new(GeneratorSource::new(&[name], n, move |i| {
        Ok(vec![Column::scalar(name, i as f64, DType::F64)])
    })))
}

fn toy_dataset(n: usize) -> VecDataset {
    let features: Vec<f64> = (0..n).flat_map(|i| [i as f64, 2.0 * i as f64]).collect();
    let targets: Vec<f64> = (0..n).map(|i| (i % 3) as f64).collect();
    VecDataset::from_flat(&features, &[2], &targets, &[1], "toy").unwrap()
}

/// First value of column 0 for every row up to the next epoch boundary.
fn epoch_values(adapter: &mut TreeAdapter) -> Vec<f64> {
    let mut out = Vec::new();
    loop {
        let row = adapter.get_next().unwrap();
        if row.is_empty() {
            return out;
        }
        out.push(row[0].data[0]);
    }
}

fn all_rows(adapter: &mut TreeAdapter) -> Vec<Row> {
    let mut rows = Vec::new();
    for _ in 0..adapter.num_epochs() {
        loop {
            let row = adapter.get_next().unwrap();
            let end = row.is_empty();
            rows.push(row);
            if end {
                break;
            }
        }
    }
    rows
}

// Tree adapter

#[test]
fn test_batches_then_eof() {
    let mut adapter = Pipeline::from_dataset(toy_dataset(4)).batch(2, false).compile(1).unwrap();
    let first = adapter.get_next().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].shape, vec![2, 2]);
    assert_eq!(first[1].shape, vec![2, 1]);
    assert_eq!(adapter.get_next().unwrap().len(), 2);
    assert!(adapter.get_next().unwrap().is_empty());
    match adapter.get_next() {
        Err(Error::Msg(msg)) => assert_eq!(msg, "EOF buffer encountered."),
        other => panic!("expected EOF error, got {other:?}"),
    }
}

#[test]
fn test_repeat_within_one_epoch() {
    let mut adapter = counter("x", 3).repeat(2).compile(1).unwrap();
    assert_eq!(epoch_values(&mut adapter), vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
}

#[test]
fn test_drop_remainder() {
    let mut adapter = counter("x", 5).batch(2, true).compile(2).unwrap();
    assert_eq!(epoch_values(&mut adapter), vec![0.0, 2.0]);
    assert_eq!(epoch_values(&mut adapter), vec![0.0, 2.0]);
}

#[test]
fn test_skip_take_filter() {
    let mut adapter = counter("x", 10).skip(2).take(3).compile(1).unwrap();
    assert_eq!(epoch_values(&mut adapter), vec![2.0, 3.0, 4.0]);

    let mut adapter = counter("x", 10)
        .filter(|row: &Row| Ok(row[0].data[0] as usize % 3 == 0))
        .compile(1)
        .unwrap();
    assert_eq!(epoch_values(&mut adapter), vec![0.0, 3.0, 6.0, 9.0]);
}

#[test]
fn test_zip_stops_with_shortest_and_concat_chains() {
    let mut adapter = counter("a", 3).zip(vec![counter("b", 5)]).compile(1).unwrap();
    let row = adapter.get_next().unwrap();
    assert_eq!(row.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(adapter.get_next().unwrap().len(), 2);
    assert_eq!(adapter.get_next().unwrap().len(), 2);
    assert!(adapter.get_next().unwrap().is_empty());

    let mut adapter = counter("x", 2).concat(vec![counter("x", 3)]).compile(1).unwrap();
    assert_eq!(epoch_values(&mut adapter), vec![0.0, 1.0, 0.0, 1.0, 2.0]);

    assert!(counter("x", 2).concat(vec![counter("y", 2)]).compile(1).is_err());
    assert!(counter("x", 2).zip(vec![counter("x", 2)]).compile(1).is_err());
}

#[test]
fn test_rename_and_project() {
    let adapter = Pipeline::from_dataset(toy_dataset(2))
        .rename(&["features"], &["image"])
        .project(&["target", "image"])
        .compile(1)
        .unwrap();
    assert_eq!(adapter.column_names(), vec!["target", "image"]);
    assert_eq!(adapter.column_name_map()["image"], 1);
}

#[test]
fn test_map_replaces_columns_in_place() {
    let split = |cols: Vec<Column>| -> Result<Vec<Column>> {
        let c = &cols[0];
        Ok(vec![
            Column::new("lo", c.data[..1].to_vec(), vec![1], c.dtype)?,
            Column::new("hi", c.data[1..].to_vec(), vec![1], c.dtype)?,
        ])
    };
    let mut adapter = Pipeline::from_dataset(toy_dataset(3))
        .map(split, &["features"], &["lo", "hi"])
        .compile(1)
        .unwrap();
    assert_eq!(adapter.column_names(), vec!["lo", "hi", "target"]);
    let row = adapter.get_next().unwrap();
    assert_eq!(row[0].name, "lo");
    assert_eq!(row[1].name, "hi");
    assert_eq!(row[2].name, "target");
}

#[test]
fn test_batch_schema_mismatch() {
    let ragged = GeneratorSource::new(&["x"], 4, |i| Ok(vec![Column::new("x", vec![0.0; i + 1], vec![i + 1], DType::F32)?]));
    let mut adapter = Pipeline::from_source(Arc::new(ragged)).batch(2, false).compile(1).unwrap();
    match adapter.get_next() {
        Err(Error::SchemaMismatch { column, .. }) => assert_eq!(column, "x"),
        other => panic!("expected schema mismatch, got {other:?}"),
    }
}

// Shuffle and parallel map

#[test]
fn test_shuffle_is_seeded_per_epoch() {
    let run = || {
        let mut adapter = counter("x", 10).shuffle(4, 42).compile(2).unwrap();
        (epoch_values(&mut adapter), epoch_values(&mut adapter))
    };
    let (first, second) = run();
    assert_eq!(run(), (first.clone(), second.clone()));

    let mut sorted = first.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(sorted, (0..10).map(|i| i as f64).collect::<Vec<_>>());
    assert_ne!(first, second);
}

#[test]
fn test_parallel_map_keeps_order() {
    // Early rows finish last.
    let slow_early = |mut cols: Vec<Column>| -> Result<Vec<Column>> {
        let x = cols[0].data[0];
        thread::sleep(Duration::from_millis((20.0 - x) as u64));
        cols[0].data[0] = x * 10.0;
        Ok(cols)
    };
    let mut adapter = counter("x", 20).map_with(slow_early, &["x"], &[], &[], 4).compile(1).unwrap();
    let expected: Vec<f64> = (0..20).map(|i| i as f64 * 10.0).collect();
    assert_eq!(epoch_values(&mut adapter), expected);
}

#[test]
fn test_same_rows_for_any_worker_count() {
    let run = |workers: usize| {
        let pipeline = Pipeline::from_dataset(toy_dataset(11))
            .shuffle(5, 3)
            .map_with(Normalize::new(4.0), &["features"], &[], &[], workers)
            .batch(3, false)
            .repeat(2);
        let mut adapter = TreeAdapter::compile_with(pipeline.node(), 2, 2).unwrap();
        all_rows(&mut adapter)
    };
    let sequential = run(1);
    assert_eq!(run(2), sequential);
    assert_eq!(run(4), sequential);
}

#[test]
fn test_worker_error_reaches_get_next() {
    let fail_at_five = |cols: Vec<Column>| -> Result<Vec<Column>> {
        if cols[0].data[0] == 5.0 {
            return Err(Error::msg("bad row 5"));
        }
        Ok(cols)
    };
    let mut adapter = counter("x", 10).map_with(fail_at_five, &["x"], &[], &[], 3).compile(1).unwrap();
    for i in 0..5 {
        assert_eq!(adapter.get_next().unwrap()[0].data[0], i as f64);
    }
    let err = adapter.get_next().unwrap_err();
    assert!(err.to_string().contains("bad row 5"));
}

// DataLoader

#[test]
fn test_dataloader_collates_batches() {
    let pipeline = Pipeline::from_dataset(toy_dataset(5)).batch(2, true);
    let mut loader = DataLoader::<CpuBackend>::from_pipeline(&pipeline, 1, CpuDevice).unwrap();
    let batches: Vec<_> = loader.iter_epoch().collect::<Result<_>>().unwrap();
    assert_eq!(batches.len(), 2);
    let features = &batches[1]["features"];
    assert_eq!(features.dims(), &[2, 2]);
    assert_eq!(features.dtype(), DType::F32);
    assert_eq!(features.to_f64_vec().unwrap(), vec![2.0, 4.0, 3.0, 6.0]);
    assert_eq!(batches[0]["target"].to_f64_vec().unwrap(), vec![0.0, 1.0]);

    // Past the last epoch.
    let mut next = loader.iter_epoch();
    assert!(matches!(next.next(), Some(Err(_))));
    assert!(next.next().is_none());
}

#[test]
fn test_dataloader_epochs() {
    let pipeline = Pipeline::from_dataset_as(toy_dataset(4), DType::F64).batch(4, false);
    let mut loader = DataLoader::<CpuBackend>::from_pipeline(&pipeline, 3, CpuDevice).unwrap();
    for _ in 0..3 {
        let batches: Vec<_> = loader.iter_epoch().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["target"].dtype(), DType::F64);
    }
    assert!(loader.next_batch().is_err());
}
