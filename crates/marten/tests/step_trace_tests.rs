// Step-trace tests: binary trace files in, per-step rows and CSV out

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use marten::profiler::step_trace::{StepTraceRecord, BP_TAG, FP_TAG, ITER_END_TAG};
use marten::profiler::StepTraceParser;

const ALL_REDUCE: u16 = 10000;

fn rec(ts: u64, tag: u16, stream: u16) -> StepTraceRecord {
    StepTraceRecord {
        timestamp: ts,
        index_id: 1,
        model_id: 1,
        stream_id: stream,
        task_id: 0,
        tag_id: tag,
    }
}

fn encode(records: &[StepTraceRecord]) -> Vec<u8> {
    records.iter().flat_map(StepTraceRecord::encode).collect()
}

/// fp, reduce start/end, bp, end for each (fp, reduce, bp, end) tuple.
fn steps(points: &[(u64, Option<(u64, u64)>, u64, u64)]) -> Vec<StepTraceRecord> {
    let mut out = Vec::new();
    for &(fp, reduce, bp, end) in points {
        out.push(rec(fp, FP_TAG, 0));
        if let Some((s, e)) = reduce {
            out.push(rec(s, ALL_REDUCE, 1));
            out.push(rec(e, ALL_REDUCE + 1, 1));
        }
        out.push(rec(bp, BP_TAG, 0));
        out.push(rec(end, ITER_END_TAG, 0));
    }
    out
}

fn three_steps_with_reduce() -> Vec<StepTraceRecord> {
    steps(&[
        (100, Some((120, 130)), 150, 200),
        (210, Some((220, 240)), 260, 300),
        (310, Some((320, 331)), 350, 405),
    ])
}

fn write_file(dir: &Path, name: &str, records: &[StepTraceRecord]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, encode(records)).unwrap();
    path
}

fn read_csv(path: &Path) -> Vec<Vec<String>> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect()
}

#[test]
fn test_training_csv_with_reduce_and_average() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "ts_track.data.slice_0", &three_steps_with_reduce());

    let mut parser = StepTraceParser::new();
    parser.set_point_info(&HashMap::from([(ALL_REDUCE, "Default/network/AllReduce-op3".to_string())]));
    assert_eq!(parser.parse_dir(dir.path()).unwrap(), 3);

    let out = dir.path().join("steps.csv");
    parser.write_csv(&out).unwrap();
    let csv = read_csv(&out);
    assert_eq!(
        csv[0],
        vec![
            "step_num",
            "start_point",
            "end_point",
            "total",
            "fp_point",
            "bp_point",
            "iteration_interval",
            "fp_and_bp",
            "tail",
            "stream_1_0_AllReduce-op3",
            "stream_1_0_AllReduce-op3_start_point",
            "stream_1_0_AllReduce-op3_end_point",
        ]
    );
    assert_eq!(csv[1], vec!["1", "100", "200", "100", "100", "150", "0", "50", "50", "10", "120", "130"]);
    assert_eq!(csv[2], vec!["2", "200", "300", "100", "210", "260", "10", "50", "40", "20", "220", "240"]);
    assert_eq!(csv[3], vec!["3", "300", "405", "105", "310", "350", "10", "40", "55", "11", "320", "331"]);
    // Mean of steps 2 and 3, ties to even.
    assert_eq!(csv[4], vec!["-", "250", "352", "102", "260", "305", "10", "45", "48", "16", "270", "286"]);
    assert_eq!(csv.len(), 5);
}

#[test]
fn test_unknown_reduce_tag_is_parallel() {
    let mut parser = StepTraceParser::new();
    parser.parse_contents(&[&encode(&three_steps_with_reduce())]);
    assert_eq!(parser.header()[9], "stream_1_0_parallel");
    assert_eq!(parser.steps()[0].reduce[0], ("stream_1_0_parallel".to_string(), 10));
}

#[test]
fn test_inference_folds_tail_into_fp() {
    let dir = tempfile::tempdir().unwrap();
    let records = steps(&[(100, None, 150, 200), (210, None, 260, 300)]);
    let path = write_file(dir.path(), "ts_track.data", &records);

    let mut parser = StepTraceParser::new().inference(true);
    parser.parse_files(&[path]).unwrap();
    let out = dir.path().join("inference.csv");
    parser.write_csv(&out).unwrap();

    let csv = read_csv(&out);
    assert_eq!(csv[0], vec!["step_num", "start_point", "end_point", "total", "fp_point", "iteration_interval", "fp"]);
    assert_eq!(csv[1], vec!["1", "100", "200", "100", "100", "0", "100"]);
    assert_eq!(csv[2], vec!["2", "200", "300", "100", "210", "10", "90"]);
    assert_eq!(csv[3], vec!["-", "200", "300", "100", "210", "10", "90"]);
}

#[test]
fn test_single_step_average_is_zero() {
    let mut parser = StepTraceParser::new();
    parser.parse_contents(&[&encode(&steps(&[(100, None, 150, 200)]))]);
    let (_, rows) = parser.table();
    assert_eq!(rows.len(), 2);
    assert!(rows[1].iter().all(|v| v == "0"));
}

#[test]
fn test_skip_first_step_keeps_numbering() {
    let mut parser = StepTraceParser::new().skip_first_step(true);
    parser.parse_contents(&[&encode(&three_steps_with_reduce())]);
    let steps = parser.steps();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_num, 1);
    assert_eq!(steps[0].start_point, 200);
}

#[test]
fn test_step_without_bp_consumes_a_number() {
    let records = vec![
        rec(100, FP_TAG, 0),
        rec(200, ITER_END_TAG, 0),
        rec(210, FP_TAG, 0),
        rec(260, BP_TAG, 0),
        rec(300, ITER_END_TAG, 0),
    ];
    let mut parser = StepTraceParser::new();
    parser.parse_contents(&[&encode(&records)]);
    assert_eq!(parser.steps().len(), 1);
    assert_eq!(parser.steps()[0].step_num, 2);
    assert_eq!(parser.steps()[0].start_point, 200);
}

#[test]
fn test_odd_and_unmatched_reduce_events_are_dropped() {
    let records = vec![
        rec(100, FP_TAG, 0),
        rec(110, ALL_REDUCE, 1),
        rec(120, ALL_REDUCE, 2),
        rec(125, ALL_REDUCE + 3, 2),
        rec(150, BP_TAG, 0),
        rec(200, ITER_END_TAG, 0),
    ];
    let mut parser = StepTraceParser::new();
    parser.parse_contents(&[&encode(&records)]);
    assert!(parser.steps()[0].reduce.is_empty());
    assert_eq!(parser.header().len(), 9);
}

#[test]
fn test_new_file_starts_at_its_fp_point() {
    let first = encode(&steps(&[(100, None, 150, 200)]));
    let second = encode(&steps(&[(1000, None, 1050, 1100)]));
    let mut parser = StepTraceParser::new();
    parser.parse_contents(&[&first, &second]);
    let steps = parser.steps();
    assert_eq!(steps[1].step_num, 2);
    assert_eq!(steps[1].start_point, 1000);
    assert_eq!(steps[1].total(), 100);
}

#[test]
fn test_find_files_orders_slices_and_falls_back_to_data() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    write_file(&data, "ts_track.data.slice_10", &steps(&[(1000, None, 1050, 1100)]));
    write_file(&data, "ts_track.data.slice_2", &steps(&[(100, None, 150, 200)]));
    fs::write(data.join("ts_track.data.slice_2.done"), b"").unwrap();
    fs::write(data.join("other.bin"), b"").unwrap();

    let files = StepTraceParser::find_files(dir.path()).unwrap();
    let names: Vec<_> = files.iter().map(|f| f.file_name().unwrap().to_string_lossy().into_owned()).collect();
    assert_eq!(names, vec!["ts_track.data.slice_2", "ts_track.data.slice_10"]);

    let mut parser = StepTraceParser::new();
    assert_eq!(parser.parse_files(&files).unwrap(), 2);
    assert_eq!(parser.steps()[0].fp_point, 100);
}

#[test]
fn test_missing_trace_files() {
    let dir = tempfile::tempdir().unwrap();
    assert!(StepTraceParser::find_files(dir.path()).is_err());
    assert!(StepTraceParser::find_files(dir.path().join("nope")).is_err());

    // Unorderable names are dropped.
    fs::write(dir.path().join("ts_track.data.a"), b"").unwrap();
    fs::write(dir.path().join("ts_track.data.b"), b"").unwrap();
    assert!(StepTraceParser::find_files(dir.path()).is_err());
}

#[test]
fn test_point_info_json() {
    let dir = tempfile::tempdir().unwrap();
    let mut parser = StepTraceParser::new();
    parser.set_point_info(&HashMap::from([
        (FP_TAG, "Default/Conv2D-op1".to_string()),
        (BP_TAG, "Gradients/Conv2D-op9".to_string()),
    ]));
    assert_eq!(parser.point_info()[&FP_TAG], "Default/Conv2D-op1");

    let path = dir.path().join("point.json");
    let points = parser.record_point_info(&path).unwrap();
    assert_eq!(points.bp_end.as_deref(), Some("Gradients/Conv2D-op9"));
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["fp_start"], "Default/Conv2D-op1");
}
