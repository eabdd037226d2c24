// Step trace — per-iteration timing from device trace files
//
// The device writes `ts_track.data*` files made of variable-length reports:
//
//   +------+----------+----------+---------+----------------------------------+
//   | mode | rpt_type | buf_size | padding | step-trace record (30 bytes)     |
//   |  u8  |    u8    |  u16 LE  | 4 bytes | u64 timestamp, u64 index_id,     |
//   |      |          |          |         | u64 model_id, u16 stream_id,     |
//   |      |          |          |         | u16 task_id, u16 tag_id          |
//   +------+----------+----------+---------+----------------------------------+
//
// Reports are `buf_size` bytes apart; only `rpt_type == 10` carries a
// step-trace record. Tags mark points inside an iteration:
//
//   2            forward pass starts          (fp_point)
//   3            backward pass ends           (bp_point)
//   4            iteration ends               (end_point)
//   10000..20000 collective start/end pairs   (even tag starts, tag + 1 ends)
//
// Each iteration end closes a step. A step starts where the previous one
// ended; the first step of a file starts at its forward point.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use marten_core::{Error, Result};

pub const STEP_TRACE_RPT_TYPE: u8 = 10;
pub const FP_TAG: u16 = 2;
pub const BP_TAG: u16 = 3;
pub const ITER_END_TAG: u16 = 4;
pub const REDUCE_MIN_TAG: u16 = 10000;
pub const REDUCE_MAX_TAG: u16 = 20000;

const HEAD_LEN: usize = 4;
const HEAD_PAD_LEN: usize = 4;
const RECORD_LEN: usize = 8 + 8 + 8 + 2 + 2 + 2;

/// Default CSV name written next to the trace files.
pub const DEFAULT_OUTPUT_FILE: &str = "step_trace_raw_0_detail_time.csv";

/// One decoded step-trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTraceRecord {
    pub timestamp: u64,
    pub index_id: u64,
    pub model_id: u64,
    pub stream_id: u16,
    pub task_id: u16,
    pub tag_id: u16,
}

impl StepTraceRecord {
    fn decode(b: &[u8]) -> Self {
        let u64_at = |o: usize| u64::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3], b[o + 4], b[o + 5], b[o + 6], b[o + 7]]);
        let u16_at = |o: usize| u16::from_le_bytes([b[o], b[o + 1]]);
        Self {
            timestamp: u64_at(0),
            index_id: u64_at(8),
            model_id: u64_at(16),
            stream_id: u16_at(24),
            task_id: u16_at(26),
            tag_id: u16_at(28),
        }
    }

    /// Bytes of one complete report carrying this record.
    pub fn encode(&self) -> Vec<u8> {
        let buf_size = (HEAD_LEN + HEAD_PAD_LEN + RECORD_LEN) as u16;
        let mut out = Vec::with_capacity(buf_size as usize);
        out.extend_from_slice(&[0, STEP_TRACE_RPT_TYPE]);
        out.extend_from_slice(&buf_size.to_le_bytes());
        out.extend_from_slice(&[0; HEAD_PAD_LEN]);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.index_id.to_le_bytes());
        out.extend_from_slice(&self.model_id.to_le_bytes());
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        out.extend_from_slice(&self.task_id.to_le_bytes());
        out.extend_from_slice(&self.tag_id.to_le_bytes());
        out
    }
}

/// Step-trace records in `content`, in file order.
pub fn decode_records(content: &[u8]) -> Vec<StepTraceRecord> {
    let mut records = Vec::new();
    let mut i = 0;
    while i + HEAD_LEN <= content.len() {
        let rpt_type = content[i + 1];
        let buf_size = u16::from_le_bytes([content[i + 2], content[i + 3]]) as usize;
        if rpt_type == STEP_TRACE_RPT_TYPE {
            let start = i + HEAD_LEN + HEAD_PAD_LEN;
            let Some(body) = content.get(start..start + RECORD_LEN) else {
                tracing::warn!(offset = i, "truncated step trace record");
                break;
            };
            records.push(StepTraceRecord::decode(body));
        }
        if buf_size == 0 {
            tracing::warn!(offset = i, "zero-sized step trace report, stopping");
            break;
        }
        i += buf_size;
    }
    records
}

// Steps

/// Timing of one iteration, in device timestamp units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRow {
    pub step_num: usize,
    pub start_point: u64,
    pub end_point: u64,
    pub fp_point: u64,
    pub bp_point: u64,
    /// `stream_{sid}_{i}_{op}` columns with their `_start_point` and
    /// `_end_point` companions.
    pub reduce: Vec<(String, i64)>,
}

fn diff(a: u64, b: u64) -> i64 {
    a as i64 - b as i64
}

impl StepRow {
    pub fn total(&self) -> i64 {
        diff(self.end_point, self.start_point)
    }

    pub fn iteration_interval(&self) -> i64 {
        diff(self.fp_point, self.start_point)
    }

    pub fn fp_and_bp(&self) -> i64 {
        diff(self.bp_point, self.fp_point)
    }

    pub fn tail(&self) -> i64 {
        diff(self.end_point, self.bp_point)
    }

    /// Every column of this row in output order.
    pub fn fields(&self) -> Vec<(String, i64)> {
        let mut fields = vec![
            ("step_num".to_string(), self.step_num as i64),
            ("start_point".to_string(), self.start_point as i64),
            ("end_point".to_string(), self.end_point as i64),
            ("total".to_string(), self.total()),
            ("fp_point".to_string(), self.fp_point as i64),
            ("bp_point".to_string(), self.bp_point as i64),
            ("iteration_interval".to_string(), self.iteration_interval()),
            ("fp_and_bp".to_string(), self.fp_and_bp()),
            ("tail".to_string(), self.tail()),
        ];
        fields.extend(self.reduce.iter().cloned());
        fields
    }
}

/// Points gathered for the iteration in progress.
#[derive(Debug, Default)]
struct EventInfo {
    start: Option<u64>,
    fp: Option<u64>,
    bp: Option<u64>,
    /// (stream id, [(tag, timestamp)]) in arrival order.
    reduce: Vec<(u16, Vec<(u16, u64)>)>,
}

impl EventInfo {
    fn on_reduce(&mut self, stream_id: u16, tag: u16, timestamp: u64) {
        match self.reduce.iter_mut().find(|(sid, _)| *sid == stream_id) {
            Some((_, points)) => points.push((tag, timestamp)),
            None => self.reduce.push((stream_id, vec![(tag, timestamp)])),
        }
    }
}

/// A closed iteration before it is numbered.
struct RawStep {
    start: Option<u64>,
    end: u64,
    fp: Option<u64>,
    bp: Option<u64>,
    reduce: Vec<(u16, Vec<(u16, u64)>)>,
}

/// Label used in the CSV for the op behind a point tag.
fn op_type(tag: u16, name: &str) -> String {
    match tag {
        FP_TAG => "fp".to_string(),
        BP_TAG => "bp".to_string(),
        ITER_END_TAG => "end".to_string(),
        0 => "start".to_string(),
        _ => {
            let op = name.rsplit('/').next().unwrap_or_default();
            if op.is_empty() {
                tracing::warn!(name, "unexpected op name");
            }
            op.to_string()
        }
    }
}

/// Round `sum / n` to the nearest integer, ties to even.
fn div_round_half_even(sum: i128, n: i128) -> i128 {
    let q = sum.div_euclid(n);
    let r = sum.rem_euclid(n);
    match (2 * r).cmp(&n) {
        std::cmp::Ordering::Greater => q + 1,
        std::cmp::Ordering::Equal if q % 2 != 0 => q + 1,
        _ => q,
    }
}

/// The `fp_start` / `bp_end` op names saved alongside a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointInfo {
    pub fp_start: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bp_end: Option<String>,
}

// Parser

#[derive(Debug, Default)]
pub struct StepTraceParser {
    skip_first_step: bool,
    inference: bool,
    /// Point tag → op name as registered.
    point_info: BTreeMap<u16, String>,
    /// Point tag → op label used in reduce column names.
    tag_map: HashMap<u16, String>,
    header: Vec<String>,
    steps: Vec<StepRow>,
    rows: Vec<Vec<i64>>,
    step_num: usize,
}

impl StepTraceParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the first step of the trace (warm-up iteration).
    pub fn skip_first_step(mut self, skip: bool) -> Self {
        self.skip_first_step = skip;
        self
    }

    /// Inference traces have no backward pass; see [`write_csv`](Self::write_csv).
    pub fn inference(mut self, inference: bool) -> Self {
        self.inference = inference;
        self
    }

    /// Register the op name behind each point tag.
    pub fn set_point_info(&mut self, point_info: &HashMap<u16, String>) {
        self.point_info = point_info.iter().map(|(&t, n)| (t, n.clone())).collect();
        self.tag_map = point_info.iter().map(|(&t, n)| (t, op_type(t, n))).collect();
        tracing::info!(tags = ?self.tag_map, "step trace tag types");
    }

    pub fn point_info(&self) -> &BTreeMap<u16, String> {
        &self.point_info
    }

    /// Forward/backward point names; written as JSON to `path` unless it exists.
    pub fn record_point_info(&self, path: impl AsRef<Path>) -> Result<PointInfo> {
        let name = |tag| self.point_info.get(&tag).cloned().unwrap_or_default();
        let points = PointInfo {
            fp_start: name(FP_TAG),
            bp_end: (!self.inference).then(|| name(BP_TAG)),
        };
        let path = path.as_ref();
        if !path.exists() {
            let json = serde_json::to_string(&points).map_err(|e| Error::msg(format!("point info: {e}")))?;
            fs::write(path, json)?;
        }
        Ok(points)
    }

    /// Step-trace files under `dir`, falling back to `dir/data`.
    pub fn find_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let mut files = search_dir(dir)?;
        if files.is_empty() {
            let data = dir.join("data");
            if data.is_dir() {
                files = search_dir(&data)?;
            }
        }
        if files.is_empty() {
            return Err(Error::msg(format!("no step trace files under {}", dir.display())));
        }
        Ok(files)
    }

    /// Find and parse every trace file under `dir`. Returns the step count.
    pub fn parse_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let files = Self::find_files(dir)?;
        self.parse_files(&files)
    }

    /// Parse `files` in order. Returns the number of steps recorded so far.
    pub fn parse_files(&mut self, files: &[PathBuf]) -> Result<usize> {
        let mut contents = Vec::with_capacity(files.len());
        for file in files {
            contents.push(fs::read(file)?);
        }
        let slices: Vec<&[u8]> = contents.iter().map(Vec::as_slice).collect();
        self.parse_contents(&slices);
        Ok(self.steps.len())
    }

    /// Parse already loaded trace files, one slice per file.
    pub fn parse_contents(&mut self, contents: &[&[u8]]) {
        let mut info = EventInfo::default();
        for content in contents {
            // A new file never continues the previous file's last step.
            info.start = None;
            for record in decode_records(content) {
                if let Some(step) = Self::on_record(&mut info, record) {
                    if self.skip_first_step {
                        self.skip_first_step = false;
                        continue;
                    }
                    self.record_step(step);
                }
            }
        }
        tracing::info!(steps = self.steps.len(), "step trace parsed");
    }

    fn on_record(info: &mut EventInfo, record: StepTraceRecord) -> Option<RawStep> {
        let ts = record.timestamp;
        match record.tag_id {
            ITER_END_TAG => {
                let step = RawStep {
                    start: info.start,
                    end: ts,
                    fp: info.fp.take(),
                    bp: info.bp.take(),
                    reduce: std::mem::take(&mut info.reduce),
                };
                info.start = Some(ts);
                Some(step)
            }
            FP_TAG => {
                info.fp = Some(ts);
                None
            }
            BP_TAG => {
                info.bp = Some(ts);
                None
            }
            tag if (REDUCE_MIN_TAG..REDUCE_MAX_TAG).contains(&tag) => {
                info.on_reduce(record.stream_id, tag, ts);
                None
            }
            _ => None,
        }
    }

    fn record_step(&mut self, step: RawStep) {
        self.step_num += 1;
        let (Some(fp), Some(bp)) = (step.fp, step.bp) else {
            tracing::warn!(step = self.step_num, "step lacks basic time points, skipped");
            return;
        };
        let row = StepRow {
            step_num: self.step_num,
            start_point: step.start.unwrap_or(fp),
            end_point: step.end,
            fp_point: fp,
            bp_point: bp,
            reduce: self.reduce_fields(&step.reduce),
        };

        let fields = row.fields();
        if self.header.is_empty() {
            self.header = fields.iter().map(|(name, _)| name.clone()).collect();
        }
        let values: HashMap<&str, i64> = fields.iter().map(|(n, v)| (n.as_str(), *v)).collect();
        self.rows.push(self.header.iter().map(|h| values.get(h.as_str()).copied().unwrap_or(0)).collect());
        self.steps.push(row);
    }

    fn reduce_fields(&self, reduce: &[(u16, Vec<(u16, u64)>)]) -> Vec<(String, i64)> {
        let mut fields = Vec::new();
        for (stream_id, points) in reduce {
            if points.len() % 2 != 0 {
                tracing::warn!(stream = stream_id, points = points.len(), "odd number of reduce time points");
                continue;
            }
            for (index, pair) in points.chunks_exact(2).enumerate() {
                let ((start_tag, start_ts), (end_tag, end_ts)) = (pair[0], pair[1]);
                if end_tag.wrapping_sub(start_tag) != 1 || start_tag % 2 != 0 {
                    tracing::warn!(start = ?pair[0], end = ?pair[1], "unmatched reduce event");
                    continue;
                }
                let op = match self.tag_map.get(&start_tag) {
                    Some(op) => op.clone(),
                    None => {
                        tracing::warn!(tag = start_tag, "unknown op type for reduce tag");
                        "parallel".to_string()
                    }
                };
                let name = format!("stream_{stream_id}_{index}_{op}");
                fields.push((name.clone(), diff(end_ts, start_ts)));
                fields.extend([
                    (format!("{name}_start_point"), start_ts as i64),
                    (format!("{name}_end_point"), end_ts as i64),
                ]);
            }
        }
        fields
    }

    pub fn steps(&self) -> &[StepRow] {
        &self.steps
    }

    /// Column names taken from the first recorded step.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Column means over every step but the first, ties rounded to even.
    /// All zeros when fewer than two steps were recorded.
    pub fn average(&self) -> Vec<i64> {
        let mut avg = vec![0i64; self.header.len()];
        if self.rows.len() < 2 {
            return avg;
        }
        let n = (self.rows.len() - 1) as i128;
        for (col, slot) in avg.iter_mut().enumerate() {
            let sum: i128 = self.rows[1..].iter().map(|r| r[col] as i128).sum();
            *slot = div_round_half_even(sum, n) as i64;
        }
        avg
    }

    /// Header and rows as written to the CSV, average row last.
    pub fn table(&self) -> (Vec<String>, Vec<Vec<String>>) {
        let mut header = self.header.clone();
        let mut rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(i64::to_string).collect())
            .collect();

        let avg = self.average();
        let mut avg_row: Vec<String> = avg.iter().map(i64::to_string).collect();
        if self.rows.len() >= 2 {
            avg_row[0] = "-".to_string();
        }

        if self.inference && header.len() > 6 {
            // Forward time absorbs the last column; bp_point and the last
            // column go.
            let n = header.len();
            header[n - 2] = "fp".to_string();
            header = drop_bp_and_last(header);
            let fold = |row: &[i64]| -> Vec<String> {
                let mut row = row.to_vec();
                row[n - 2] += row[n - 1];
                drop_bp_and_last(row.iter().map(i64::to_string).collect())
            };
            rows = self.rows.iter().map(|r| fold(r.as_slice())).collect();
            let mut folded = fold(avg.as_slice());
            if self.rows.len() >= 2 {
                folded[0] = "-".to_string();
            }
            avg_row = folded;
        }
        rows.push(avg_row);
        (header, rows)
    }

    /// Write the CSV. Nothing is written when no step was recorded.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.header.is_empty() {
            tracing::warn!(path = %path.display(), "no steps recorded, step trace csv not written");
            return Ok(());
        }
        let (header, rows) = self.table();
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "{}", header.join(","))?;
        for row in rows {
            writeln!(w, "{}", row.join(","))?;
        }
        w.flush()?;
        tracing::info!(path = %path.display(), steps = self.steps.len(), "step trace csv saved");
        Ok(())
    }
}

const BP_POINT_COLUMN: usize = 5;

fn drop_bp_and_last<T>(mut row: Vec<T>) -> Vec<T> {
    row.pop();
    row.remove(BP_POINT_COLUMN);
    row
}

/// `ts_track.data*` files in `dir`, ordered by the number after the last `_`.
fn search_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::msg(format!("{} does not exist or is not a directory", dir.display())));
    }
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ts_track.data") && !name.ends_with(".done"))
        .collect();

    if names.len() > 1 {
        let keys: std::result::Result<Vec<u64>, _> = names
            .iter()
            .map(|n| n.rsplit('_').next().unwrap_or_default().parse::<u64>())
            .collect();
        match keys {
            Ok(keys) => {
                let mut keyed: Vec<(u64, String)> = keys.into_iter().zip(names).collect();
                keyed.sort();
                names = keyed.into_iter().map(|(_, n)| n).collect();
            }
            Err(e) => {
                tracing::warn!(files = ?names, error = %e, "unable to order step trace files");
                names.clear();
            }
        }
    }
    tracing::info!(count = names.len(), dir = %dir.display(), "step trace files found");
    Ok(names.into_iter().map(|n| dir.join(n)).collect())
}
