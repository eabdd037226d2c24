// TreeAdapter — compiles a pipeline tree and drives it epoch by epoch
//
// get_next() hands out rows of the current epoch, then one empty row to mark
// the epoch boundary. Once `num_epochs` boundaries have been returned the
// adapter is spent and every further call is an error.

use std::collections::HashMap;

use marten_core::{Error, Result};

use crate::dataset::Row;
use crate::exec::{self, ExecOp};
use crate::pipeline::PipelineNode;

/// Rows a parallel map may hold in flight.
pub const DEFAULT_PREFETCH_SIZE: usize = 16;

pub struct TreeAdapter {
    root: Box<dyn ExecOp>,
    column_map: HashMap<String, usize>,
    num_epochs: u64,
    prefetch_size: usize,
    epoch: u64,
}

impl TreeAdapter {
    pub fn compile(node: &PipelineNode, num_epochs: u64) -> Result<Self> {
        Self::compile_with(node, num_epochs, DEFAULT_PREFETCH_SIZE)
    }

    pub fn compile_with(node: &PipelineNode, num_epochs: u64, prefetch_size: usize) -> Result<Self> {
        if num_epochs == 0 {
            return Err(Error::msg("num_epochs must be at least 1"));
        }
        if prefetch_size == 0 {
            return Err(Error::msg("prefetch_size must be greater than 0"));
        }
        let columns = node.output_columns()?;
        if columns.is_empty() {
            return Err(Error::msg("pipeline produces no columns"));
        }
        let column_map = columns.into_iter().enumerate().map(|(i, name)| (name, i)).collect();
        let root = exec::build(node, prefetch_size)?;
        tracing::debug!(nodes = node.size(), num_epochs, "compiled pipeline {node:?}");
        Ok(Self {
            root,
            column_map,
            num_epochs,
            prefetch_size,
            epoch: 0,
        })
    }

    /// Column name to its index in every row.
    pub fn column_name_map(&self) -> &HashMap<String, usize> {
        &self.column_map
    }

    /// Column names in row order.
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<(&String, &usize)> = self.column_map.iter().collect();
        names.sort_by_key(|(_, &i)| i);
        names.into_iter().map(|(n, _)| n.clone()).collect()
    }

    /// Epochs completed so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn num_epochs(&self) -> u64 {
        self.num_epochs
    }

    pub fn prefetch_size(&self) -> usize {
        self.prefetch_size
    }

    /// The next row, or an empty row at the end of an epoch.
    pub fn get_next(&mut self) -> Result<Row> {
        if self.epoch >= self.num_epochs {
            return Err(Error::msg("EOF buffer encountered."));
        }
        if let Some(row) = self.root.next_row()? {
            return Ok(row);
        }
        self.epoch += 1;
        tracing::debug!(epoch = self.epoch, "pipeline epoch finished");
        if self.epoch < self.num_epochs {
            self.root.reset(self.epoch)?;
        }
        Ok(Vec::new())
    }
}

impl std::fmt::Debug for TreeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeAdapter")
            .field("columns", &self.column_names())
            .field("num_epochs", &self.num_epochs)
            .field("epoch", &self.epoch)
            .finish()
    }
}
