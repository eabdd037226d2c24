// Profiling — timed events, memory snapshots and the step-trace parser
//
// A `Profiler` records named events as (start, end) offsets from its own
// creation time, so events from different scopes line up on one timeline.
// `report()` folds them into count/total/mean/min/max per name.
//
//   let mut prof = Profiler::new();
//   prof.start_event("forward", "compute");
//   ...
//   prof.end_event("forward")?;
//   prof.record_memory("after forward", &pool)?;
//   println!("{}", prof.report());
//
// The step-trace parser for device iteration traces lives in `step_trace`.

pub mod step_trace;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use marten_core::{Error, Result};
use marten_cpu::{DynamicMemPool, PoolStats};

pub use step_trace::{StepRow, StepTraceParser};

// ProfileEvent

/// One timed event; `start` and `end` are offsets from the profiler origin.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEvent {
    pub name: String,
    /// e.g. "forward", "backward", "data", "optimizer".
    pub category: String,
    pub start: Duration,
    pub end: Duration,
}

impl ProfileEvent {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

// MemorySnapshot

/// Pool accounting captured at a point on the profiler timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySnapshot {
    pub label: String,
    pub at: Duration,
    pub stats: PoolStats,
}

impl fmt::Display for MemorySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {:.2?}: used={}, peak={}, total={}, blocks={}, idle bufs={}",
            self.label,
            self.at,
            format_bytes(self.stats.used_mem),
            format_bytes(self.stats.peak_mem),
            format_bytes(self.stats.total_mem),
            self.stats.block_count,
            self.stats.idle_buf_count,
        )
    }
}

// Profiler

pub struct Profiler {
    origin: Instant,
    events: Vec<ProfileEvent>,
    pending: HashMap<String, (String, Duration)>,
    memory: Vec<MemorySnapshot>,
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            events: Vec::new(),
            pending: HashMap::new(),
            memory: Vec::new(),
        }
    }

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Open an event. Starting a name that is already open restarts it.
    pub fn start_event(&mut self, name: &str, category: &str) {
        let now = self.now();
        self.pending.insert(name.to_string(), (category.to_string(), now));
    }

    /// Close the open event `name` and return its duration.
    pub fn end_event(&mut self, name: &str) -> Result<Duration> {
        let end = self.now();
        let (category, start) = self
            .pending
            .remove(name)
            .ok_or_else(|| Error::msg(format!("profiler event '{name}' was never started")))?;
        self.push(name, &category, start, end);
        Ok(end.saturating_sub(start))
    }

    /// Time a closure as one event.
    pub fn measure<F, R>(&mut self, name: &str, category: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = self.now();
        let result = f();
        let end = self.now();
        self.push(name, category, start, end);
        result
    }

    fn push(&mut self, name: &str, category: &str, start: Duration, end: Duration) {
        tracing::trace!(name, category, elapsed = ?end.saturating_sub(start), "profile event");
        self.events.push(ProfileEvent {
            name: name.to_string(),
            category: category.to_string(),
            start,
            end,
        });
    }

    /// Snapshot the pool's accounting under `label`.
    pub fn record_memory(&mut self, label: &str, pool: &DynamicMemPool) -> Result<MemorySnapshot> {
        let snapshot = MemorySnapshot {
            label: label.to_string(),
            at: self.now(),
            stats: pool.stats()?,
        };
        self.memory.push(snapshot.clone());
        Ok(snapshot)
    }

    pub fn events(&self) -> &[ProfileEvent] {
        &self.events
    }

    pub fn memory_snapshots(&self) -> &[MemorySnapshot] {
        &self.memory
    }

    /// Highest `peak_mem` over all snapshots.
    pub fn peak_memory(&self) -> usize {
        self.memory.iter().map(|s| s.stats.peak_mem).max().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.pending.clear();
        self.memory.clear();
    }

    /// Sum of all event durations.
    pub fn total_time(&self) -> Duration {
        self.events.iter().map(ProfileEvent::duration).sum()
    }

    /// Events grouped by name, sorted by total time, longest first.
    pub fn report(&self) -> ProfileReport {
        let mut by_name: HashMap<&str, Vec<Duration>> = HashMap::new();
        for ev in &self.events {
            by_name.entry(ev.name.as_str()).or_default().push(ev.duration());
        }

        let mut entries: Vec<ProfileEntry> = by_name
            .into_iter()
            .map(|(name, durations)| {
                let count = durations.len();
                let total: Duration = durations.iter().sum();
                ProfileEntry {
                    name: name.to_string(),
                    count,
                    total,
                    mean: total / count as u32,
                    min: durations.iter().min().copied().unwrap_or_default(),
                    max: durations.iter().max().copied().unwrap_or_default(),
                }
            })
            .collect();
        entries.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));

        ProfileReport {
            entries,
            total: self.total_time(),
        }
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

// ProfileReport

/// Aggregated statistics for one event name.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub name: String,
    pub count: usize,
    pub total: Duration,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub entries: Vec<ProfileEntry>,
    pub total: Duration,
}

impl ProfileReport {
    pub fn get(&self, name: &str) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "═".repeat(78);
        writeln!(f, "╔{rule}╗")?;
        writeln!(f, "║{:^78}║", "Marten Profile Report")?;
        writeln!(f, "╠{rule}╣")?;
        writeln!(
            f,
            "║ {:<20} {:>6} {:>12} {:>12} {:>14} {:>7} ║",
            "Event", "Count", "Total", "Mean", "Min/Max", "%"
        )?;
        writeln!(f, "╠{rule}╣")?;
        for entry in &self.entries {
            let pct = if self.total.as_nanos() > 0 {
                entry.total.as_nanos() as f64 / self.total.as_nanos() as f64 * 100.0
            } else {
                0.0
            };
            let min_max = format!("{:.1?}/{:.1?}", entry.min, entry.max);
            writeln!(
                f,
                "║ {:<20} {:>6} {:>12.2?} {:>12.2?} {:>14} {:>6.1}% ║",
                truncate_str(&entry.name, 20),
                entry.count,
                entry.total,
                entry.mean,
                min_max,
                pct
            )?;
        }
        writeln!(f, "╠{rule}╣")?;
        writeln!(f, "║ {:<76} ║", format!("Total: {:.2?}", self.total))?;
        writeln!(f, "╚{rule}╝")
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}…")
    } else {
        s.to_string()
    }
}

/// Human-readable byte count (B, KB, MB, GB).
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

// ScopedTimer

/// Records an event into a shared profiler when dropped.
///
/// ```
/// use marten::profiler::{Profiler, ScopedTimer};
/// use std::sync::{Arc, Mutex};
///
/// let profiler = Arc::new(Mutex::new(Profiler::new()));
/// {
///     let _t = ScopedTimer::new(profiler.clone(), "step", "train");
/// }
/// assert_eq!(profiler.lock().unwrap().events().len(), 1);
/// ```
pub struct ScopedTimer {
    profiler: Arc<Mutex<Profiler>>,
    name: String,
    category: String,
    start: Duration,
}

impl ScopedTimer {
    pub fn new(profiler: Arc<Mutex<Profiler>>, name: &str, category: &str) -> Self {
        let start = match profiler.lock() {
            Ok(prof) => prof.now(),
            Err(poisoned) => poisoned.into_inner().now(),
        };
        Self {
            profiler,
            name: name.to_string(),
            category: category.to_string(),
            start,
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        if let Ok(mut prof) = self.profiler.lock() {
            let end = prof.now();
            prof.push(&self.name, &self.category, self.start, end);
        }
    }
}

// Stopwatch

/// Manual timer with lap splits.
#[derive(Debug, Default)]
pub struct Stopwatch {
    start: Option<Instant>,
    laps: Vec<Duration>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start or restart; clears laps.
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.laps.clear();
    }

    /// Elapsed time since `start`, recorded as a lap.
    pub fn lap(&mut self) -> Duration {
        let elapsed = self.start.map(|s| s.elapsed()).unwrap_or_default();
        self.laps.push(elapsed);
        elapsed
    }

    pub fn stop(&mut self) -> Duration {
        let elapsed = self.start.map(|s| s.elapsed()).unwrap_or_default();
        self.start = None;
        elapsed
    }

    pub fn is_running(&self) -> bool {
        self.start.is_some()
    }

    pub fn laps(&self) -> &[Duration] {
        &self.laps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_measure_records_start_and_end() {
        let mut prof = Profiler::new();
        let result = prof.measure("op_a", "compute", || {
            thread::sleep(Duration::from_millis(5));
            42
        });
        assert_eq!(result, 42);
        let ev = &prof.events()[0];
        assert_eq!(ev.name, "op_a");
        assert!(ev.end > ev.start);
        assert!(ev.duration() >= Duration::from_millis(4));
    }

    #[test]
    fn test_start_end_by_name() {
        let mut prof = Profiler::new();
        prof.start_event("forward", "model");
        thread::sleep(Duration::from_millis(2));
        let d = prof.end_event("forward").unwrap();
        assert!(d >= Duration::from_millis(1));
        assert_eq!(prof.events()[0].category, "model");
        assert!(prof.end_event("forward").is_err());
    }

    #[test]
    fn test_report_aggregates_per_name() {
        let mut prof = Profiler::new();
        for _ in 0..3 {
            prof.measure("matmul", "compute", || thread::sleep(Duration::from_millis(2)));
        }
        prof.measure("relu", "compute", || {});

        let report = prof.report();
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].name, "matmul");
        let matmul = report.get("matmul").unwrap();
        assert_eq!(matmul.count, 3);
        assert!(matmul.min <= matmul.mean && matmul.mean <= matmul.max);
        assert_eq!(matmul.mean, matmul.total / 3);
        assert_eq!(report.get("relu").unwrap().count, 1);

        let s = report.to_string();
        assert!(s.contains("matmul"));
        assert!(s.contains("relu"));
    }

    #[test]
    fn test_memory_snapshot_from_pool() {
        let pool = DynamicMemPool::new(1 << 20, 4096);
        let mut prof = Profiler::new();
        let addr = pool.alloc(1000, false).unwrap();
        let snap = prof.record_memory("after alloc", &pool).unwrap();
        assert_eq!(snap.stats.used_mem, 1024);
        pool.free(addr).unwrap();
        prof.record_memory("after free", &pool).unwrap();
        assert_eq!(prof.memory_snapshots()[1].stats.used_mem, 0);
        assert_eq!(prof.peak_memory(), 1024);
        assert!(prof.memory_snapshots()[0].to_string().contains("1.00 KB"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_scoped_timer_and_stopwatch() {
        let prof = Arc::new(Mutex::new(Profiler::new()));
        {
            let _t = ScopedTimer::new(prof.clone(), "scope", "test");
        }
        assert_eq!(prof.lock().unwrap().events()[0].name, "scope");

        let mut sw = Stopwatch::new();
        sw.start();
        sw.lap();
        assert!(sw.is_running());
        sw.stop();
        assert!(!sw.is_running());
        assert_eq!(sw.laps().len(), 1);
    }
}
