// Execution operators — the pull iterators a compiled pipeline runs
//
// Every operator yields rows until its input is exhausted, then `None`.
// `reset(generation)` rewinds an operator for another pass; the generation
// seeds shuffles so each pass sees a fresh but reproducible order.
//
// Parallel maps pull child rows on the consumer thread and hand
// (sequence, row) pairs to workers over a bounded crossbeam channel. Results
// come back tagged with their sequence and are emitted strictly in order, so
// the worker count never changes what a pipeline produces.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use marten_core::{Error, Result};

use crate::dataset::{Column, Row};
use crate::pipeline::{positions, MapColumns, PipelineNode, Predicate};
use crate::source::RowSource;
use crate::transform::Transform;

pub(crate) trait ExecOp: Send {
    fn next_row(&mut self) -> Result<Option<Row>>;

    fn reset(&mut self, generation: u64) -> Result<()>;
}

type BoxedOp = Box<dyn ExecOp>;

/// Build the operator tree for an already validated pipeline.
pub(crate) fn build(node: &PipelineNode, prefetch_size: usize) -> Result<BoxedOp> {
    Ok(match node {
        PipelineNode::Source(source) => Box::new(SourceOp {
            source: source.clone(),
            next: 0,
        }),
        PipelineNode::Map {
            child,
            op,
            input_columns,
            output_columns,
            project_columns,
            num_workers,
        } => {
            let names = child.output_columns()?;
            let plan = Arc::new(MapColumns::resolve(&names, input_columns, output_columns, project_columns)?);
            let child = build(child, prefetch_size)?;
            if *num_workers > 1 {
                Box::new(ParallelMapOp::new(child, op.clone(), plan, *num_workers, prefetch_size))
            } else {
                Box::new(MapOp {
                    child,
                    op: op.clone(),
                    plan,
                })
            }
        }
        PipelineNode::Filter { child, predicate } => Box::new(FilterOp {
            child: build(child, prefetch_size)?,
            predicate: predicate.clone(),
        }),
        PipelineNode::Shuffle {
            child,
            buffer_size,
            seed,
        } => Box::new(ShuffleOp {
            child: build(child, prefetch_size)?,
            buffer: Vec::with_capacity(*buffer_size),
            buffer_size: *buffer_size,
            seed: *seed,
            rng: StdRng::seed_from_u64(*seed),
            filled: false,
            child_done: false,
        }),
        PipelineNode::Batch {
            child,
            batch_size,
            drop_remainder,
        } => Box::new(BatchOp {
            child: build(child, prefetch_size)?,
            batch_size: *batch_size,
            drop_remainder: *drop_remainder,
        }),
        PipelineNode::Repeat { child, count } => Box::new(RepeatOp {
            child: build(child, prefetch_size)?,
            count: *count as u64,
            pass: 0,
            generation: 0,
        }),
        PipelineNode::Take { child, count } => Box::new(TakeOp {
            child: build(child, prefetch_size)?,
            count: *count,
            taken: 0,
        }),
        PipelineNode::Skip { child, count } => Box::new(SkipOp {
            child: build(child, prefetch_size)?,
            count: *count,
            skipped: false,
        }),
        PipelineNode::Zip(children) => Box::new(ZipOp {
            children: children.iter().map(|c| build(c, prefetch_size)).collect::<Result<_>>()?,
        }),
        PipelineNode::Concat(children) => Box::new(ConcatOp {
            children: children.iter().map(|c| build(c, prefetch_size)).collect::<Result<_>>()?,
            current: 0,
        }),
        PipelineNode::Project { child, columns } => {
            let indices = positions(&child.output_columns()?, columns, "Project")?;
            Box::new(ProjectOp {
                child: build(child, prefetch_size)?,
                indices,
            })
        }
        PipelineNode::Rename {
            child,
            input_columns,
            output_columns,
        } => {
            let indices = positions(&child.output_columns()?, input_columns, "Rename")?;
            Box::new(RenameOp {
                child: build(child, prefetch_size)?,
                renames: indices.into_iter().zip(output_columns.iter().cloned()).collect(),
            })
        }
    })
}

// Source

struct SourceOp {
    source: Arc<dyn RowSource>,
    next: usize,
}

impl ExecOp for SourceOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.next >= self.source.len() {
            return Ok(None);
        }
        let row = self.source.row(self.next)?;
        self.next += 1;
        Ok(Some(row))
    }

    fn reset(&mut self, _generation: u64) -> Result<()> {
        self.next = 0;
        Ok(())
    }
}

// Map

/// Run `op` on one row and lay out the result columns.
fn apply_map(op: &dyn Transform, plan: &MapColumns, row: Row) -> Result<Row> {
    let mut slots: Vec<Option<Column>> = row.into_iter().map(Some).collect();
    let inputs = plan
        .inputs
        .iter()
        .map(|&i| slots.get_mut(i).and_then(Option::take))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| Error::msg("Map: row is missing an input column"))?;
    let outputs = op.apply(inputs)?;
    if outputs.len() != plan.outputs.len() {
        return Err(Error::msg(format!(
            "Map: {} returned {} columns, expected {} ({:?})",
            op.name(),
            outputs.len(),
            plan.outputs.len(),
            plan.outputs
        )));
    }

    let mut mapped: Row = slots.into_iter().flatten().collect();
    for (k, (col, name)) in outputs.into_iter().zip(&plan.outputs).enumerate() {
        mapped.insert(plan.insert_at + k, col.renamed(name.clone()));
    }
    match &plan.project {
        None => Ok(mapped),
        Some(indices) => Ok(indices.iter().map(|&i| mapped[i].clone()).collect()),
    }
}

struct MapOp {
    child: BoxedOp,
    op: Arc<dyn Transform>,
    plan: Arc<MapColumns>,
}

impl ExecOp for MapOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        match self.child.next_row()? {
            Some(row) => apply_map(self.op.as_ref(), &self.plan, row).map(Some),
            None => Ok(None),
        }
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.child.reset(generation)
    }
}

struct ParallelMapOp {
    child: BoxedOp,
    jobs: Option<Sender<(u64, Row)>>,
    results: Receiver<(u64, Result<Row>)>,
    handles: Vec<thread::JoinHandle<()>>,
    capacity: u64,
    /// Sequence number of the next row handed to the workers.
    sent: u64,
    /// Sequence number of the next row to emit.
    emitted: u64,
    pending: BTreeMap<u64, Result<Row>>,
    child_done: bool,
}

impl ParallelMapOp {
    fn new(
        child: BoxedOp,
        op: Arc<dyn Transform>,
        plan: Arc<MapColumns>,
        num_workers: usize,
        prefetch_size: usize,
    ) -> Self {
        let capacity = prefetch_size.max(num_workers);
        let (jobs_tx, jobs_rx) = channel::bounded::<(u64, Row)>(capacity);
        let (results_tx, results_rx) = channel::unbounded();

        let handles = (0..num_workers)
            .map(|_| {
                let jobs = jobs_rx.clone();
                let results = results_tx.clone();
                let op = op.clone();
                let plan = plan.clone();
                thread::spawn(move || {
                    for (seq, row) in jobs.iter() {
                        let out = apply_map(op.as_ref(), &plan, row);
                        // Consumer gone, stop
                        if results.send((seq, out)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        tracing::debug!(num_workers, capacity, "parallel map started");

        Self {
            child,
            jobs: Some(jobs_tx),
            results: results_rx,
            handles,
            capacity: capacity as u64,
            sent: 0,
            emitted: 0,
            pending: BTreeMap::new(),
            child_done: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::msg("Map: workers already stopped"))?;
        while !self.child_done && self.sent - self.emitted < self.capacity {
            match self.child.next_row()? {
                Some(row) => {
                    jobs.send((self.sent, row))
                        .map_err(|_| Error::msg("Map: all workers stopped"))?;
                    self.sent += 1;
                }
                None => self.child_done = true,
            }
        }
        Ok(())
    }
}

impl ExecOp for ParallelMapOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        self.fill()?;
        loop {
            if self.emitted == self.sent {
                return Ok(None);
            }
            if let Some(result) = self.pending.remove(&self.emitted) {
                self.emitted += 1;
                return result.map(Some);
            }
            let (seq, result) = self
                .results
                .recv()
                .map_err(|_| Error::msg("Map: all workers stopped"))?;
            // Rows from before a reset are dropped.
            if seq >= self.emitted {
                self.pending.insert(seq, result);
            }
        }
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.emitted = self.sent;
        self.pending.clear();
        self.child_done = false;
        self.child.reset(generation)
    }
}

impl Drop for ParallelMapOp {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loops.
        self.jobs.take();
        while self.results.try_recv().is_ok() {}
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

// Filter

struct FilterOp {
    child: BoxedOp,
    predicate: Predicate,
}

impl ExecOp for FilterOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        while let Some(row) = self.child.next_row()? {
            if (self.predicate)(&row)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.child.reset(generation)
    }
}

// Shuffle

/// Keeps a buffer of `buffer_size` rows; each output is a random buffer
/// slot, refilled from the child until the child runs dry.
struct ShuffleOp {
    child: BoxedOp,
    buffer: Vec<Row>,
    buffer_size: usize,
    seed: u64,
    rng: StdRng,
    filled: bool,
    child_done: bool,
}

impl ExecOp for ShuffleOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        if !self.filled {
            while self.buffer.len() < self.buffer_size {
                match self.child.next_row()? {
                    Some(row) => self.buffer.push(row),
                    None => {
                        self.child_done = true;
                        break;
                    }
                }
            }
            self.filled = true;
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let slot = self.rng.gen_range(0..self.buffer.len());
        if !self.child_done {
            if let Some(row) = self.child.next_row()? {
                return Ok(Some(std::mem::replace(&mut self.buffer[slot], row)));
            }
            self.child_done = true;
        }
        Ok(Some(self.buffer.swap_remove(slot)))
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(generation));
        self.buffer.clear();
        self.filled = false;
        self.child_done = false;
        self.child.reset(generation)
    }
}

// Batch

/// Stack rows column by column along a new leading axis.
pub(crate) fn stack_rows(rows: Vec<Row>) -> Result<Row> {
    let n = rows.len();
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let mut out: Row = first
        .iter()
        .map(|c| {
            let mut shape = Vec::with_capacity(c.shape.len() + 1);
            shape.push(n);
            shape.extend_from_slice(&c.shape);
            Column {
                name: c.name.clone(),
                data: Vec::with_capacity(n * c.elem_count()),
                shape,
                dtype: c.dtype,
            }
        })
        .collect();

    for row in rows {
        if row.len() != out.len() {
            return Err(Error::msg(format!(
                "Batch: row has {} columns, expected {}",
                row.len(),
                out.len()
            )));
        }
        for (dst, col) in out.iter_mut().zip(row) {
            if col.shape[..] != dst.shape[1..] || col.dtype != dst.dtype {
                return Err(Error::SchemaMismatch {
                    column: dst.name.clone(),
                    expected: format!("{}{:?}", dst.dtype, &dst.shape[1..]),
                    got: format!("{}{:?}", col.dtype, col.shape),
                });
            }
            dst.data.extend(col.data);
        }
    }
    Ok(out)
}

struct BatchOp {
    child: BoxedOp,
    batch_size: usize,
    drop_remainder: bool,
}

impl ExecOp for BatchOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        let mut rows = Vec::with_capacity(self.batch_size);
        while rows.len() < self.batch_size {
            match self.child.next_row()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        if rows.is_empty() || (self.drop_remainder && rows.len() < self.batch_size) {
            return Ok(None);
        }
        stack_rows(rows).map(Some)
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.child.reset(generation)
    }
}

// Repeat

/// Replays its child `count` times. Pass `p` of generation `g` resets the
/// child with generation `g * count + p`.
struct RepeatOp {
    child: BoxedOp,
    count: u64,
    pass: u64,
    generation: u64,
}

impl ExecOp for RepeatOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        while self.pass < self.count {
            if let Some(row) = self.child.next_row()? {
                return Ok(Some(row));
            }
            self.pass += 1;
            if self.pass < self.count {
                self.child.reset(self.generation * self.count + self.pass)?;
            }
        }
        Ok(None)
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.generation = generation;
        self.pass = 0;
        self.child.reset(generation * self.count)
    }
}

// Take / Skip

struct TakeOp {
    child: BoxedOp,
    count: usize,
    taken: usize,
}

impl ExecOp for TakeOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.taken >= self.count {
            return Ok(None);
        }
        let row = self.child.next_row()?;
        if row.is_some() {
            self.taken += 1;
        }
        Ok(row)
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.taken = 0;
        self.child.reset(generation)
    }
}

struct SkipOp {
    child: BoxedOp,
    count: usize,
    skipped: bool,
}

impl ExecOp for SkipOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        if !self.skipped {
            self.skipped = true;
            for _ in 0..self.count {
                if self.child.next_row()?.is_none() {
                    return Ok(None);
                }
            }
        }
        self.child.next_row()
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.skipped = false;
        self.child.reset(generation)
    }
}

// Zip / Concat

/// Joins the columns of its children row by row; stops with the shortest.
struct ZipOp {
    children: Vec<BoxedOp>,
}

impl ExecOp for ZipOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        let mut joined = Vec::new();
        for child in &mut self.children {
            match child.next_row()? {
                Some(row) => joined.extend(row),
                None => return Ok(None),
            }
        }
        Ok(Some(joined))
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.children.iter_mut().try_for_each(|c| c.reset(generation))
    }
}

struct ConcatOp {
    children: Vec<BoxedOp>,
    current: usize,
}

impl ExecOp for ConcatOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        while let Some(child) = self.children.get_mut(self.current) {
            if let Some(row) = child.next_row()? {
                return Ok(Some(row));
            }
            self.current += 1;
        }
        Ok(None)
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.current = 0;
        self.children.iter_mut().try_for_each(|c| c.reset(generation))
    }
}

// Project / Rename

struct ProjectOp {
    child: BoxedOp,
    indices: Vec<usize>,
}

impl ExecOp for ProjectOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(row) = self.child.next_row()? else {
            return Ok(None);
        };
        self.indices
            .iter()
            .map(|&i| {
                row.get(i)
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("Project: row has no column {i}")))
            })
            .collect::<Result<Row>>()
            .map(Some)
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.child.reset(generation)
    }
}

struct RenameOp {
    child: BoxedOp,
    renames: Vec<(usize, String)>,
}

impl ExecOp for RenameOp {
    fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(mut row) = self.child.next_row()? else {
            return Ok(None);
        };
        for (i, name) in &self.renames {
            if let Some(col) = row.get_mut(*i) {
                col.name = name.clone();
            }
        }
        Ok(Some(row))
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.child.reset(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::DType;

    fn row(x: f64, shape: Vec<usize>) -> Row {
        let n = shape.iter().product();
        vec![Column::new("x", vec![x; n], shape, DType::F32).unwrap()]
    }

    #[test]
    fn test_stack_rows_adds_leading_axis() {
        let out = stack_rows(vec![row(1.0, vec![2]), row(2.0, vec![2])]).unwrap();
        assert_eq!(out[0].shape, vec![2, 2]);
        assert_eq!(out[0].data, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_stack_rows_rejects_ragged_columns() {
        let err = stack_rows(vec![row(1.0, vec![2]), row(2.0, vec![3])]).unwrap_err();
        match err {
            Error::SchemaMismatch { column, .. } => assert_eq!(column, "x"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
