// DataLoader — compiled pipeline rows as batches of tensors
//
// Usage:
//
//   let pipeline = Pipeline::from_dataset(ds).shuffle(256, 7).batch(32, true);
//   let mut loader = DataLoader::<CpuBackend>::from_pipeline(&pipeline, epochs, CpuDevice)?;
//   for _ in 0..epochs {
//       for batch in loader.iter_epoch() {
//           let batch = batch?;
//           // batch["features"], batch["target"] ...
//       }
//   }

use std::collections::HashMap;

use marten_core::backend::Backend;
use marten_core::tensor::Tensor;
use marten_core::Result;

use crate::dataset::Row;
use crate::pipeline::Pipeline;
use crate::tree_adapter::TreeAdapter;

/// A single batch: maps column names to tensors.
pub type Batch<B> = HashMap<String, Tensor<B>>;

pub struct DataLoader<B: Backend> {
    adapter: TreeAdapter,
    device: B::Device,
}

impl<B: Backend> DataLoader<B> {
    pub fn new(adapter: TreeAdapter, device: B::Device) -> Self {
        Self { adapter, device }
    }

    pub fn from_pipeline(pipeline: &Pipeline, num_epochs: u64, device: B::Device) -> Result<Self> {
        Ok(Self::new(pipeline.compile(num_epochs)?, device))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.adapter.column_names()
    }

    pub fn adapter(&self) -> &TreeAdapter {
        &self.adapter
    }

    /// The next batch, or `None` at the end of an epoch.
    ///
    /// Calling past the last epoch is an error.
    pub fn next_batch(&mut self) -> Result<Option<Batch<B>>> {
        let row = self.adapter.get_next()?;
        if row.is_empty() {
            return Ok(None);
        }
        collate(row, &self.device).map(Some)
    }

    /// Batches up to the end of the current epoch.
    pub fn iter_epoch(&mut self) -> EpochIter<'_, B> {
        EpochIter {
            loader: self,
            done: false,
        }
    }
}

fn collate<B: Backend>(row: Row, device: &B::Device) -> Result<Batch<B>> {
    row.into_iter()
        .map(|col| {
            let tensor = Tensor::<B>::from_f64_slice(&col.data, col.shape, col.dtype, device)?;
            Ok((col.name, tensor))
        })
        .collect()
}

pub struct EpochIter<'a, B: Backend> {
    loader: &'a mut DataLoader<B>,
    done: bool,
}

impl<B: Backend> Iterator for EpochIter<'_, B> {
    type Item = Result<Batch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.loader.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
