// Distributed training — data-parallel gradient synchronisation
//
// Every rank holds a full replica of the parameters and runs forward and
// backward on its own shard of the batch. Before the optimizer step the
// gradients are averaged over the ranks, so every replica applies the same
// update and the parameters never drift apart.
//
//   let dp = DataParallel::new(comm);
//   dp.broadcast_parameters(&params, 0)?;        // identical starting point
//   loop {
//       let grads = loss.backward()?;
//       let grads = dp.sync_gradients(&params, &grads)?;
//       optimizer.step(&params, &grads)?;
//   }
//
// Gradients are flattened into buckets of at most `bucket_size` values, one
// all-reduce per bucket. A parameter larger than a bucket gets a bucket of
// its own. Ranks without a gradient for a parameter contribute zeros, so
// every rank issues the same collectives.

use marten_core::backend::Backend;
use marten_core::backprop::GradStore;
use marten_core::tensor::Tensor;
use marten_core::{Error, Result};
use marten_parallel::{Collective, ReduceKind};

/// Values per all-reduce bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 1 << 20;

pub struct DataParallel<C: Collective> {
    comm: C,
    bucket_size: usize,
}

impl<C: Collective> DataParallel<C> {
    pub fn new(comm: C) -> Self {
        Self {
            comm,
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }

    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size.max(1);
        self
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Gradients of `params` averaged over all ranks.
    pub fn sync_gradients<B: Backend>(&self, params: &[Tensor<B>], grads: &GradStore<B>) -> Result<GradStore<B>> {
        let world = self.world_size() as f64;
        let mut synced = GradStore::new();

        for bucket in self.buckets(params) {
            let mut flat = Vec::with_capacity(bucket.iter().map(|p| p.elem_count()).sum());
            for param in &bucket {
                match grads.get(param) {
                    Some(g) => {
                        if g.elem_count() != param.elem_count() {
                            return Err(Error::ShapeMismatch {
                                expected: param.shape().clone(),
                                got: g.shape().clone(),
                            });
                        }
                        flat.extend(g.to_f64_vec()?);
                    }
                    None => flat.extend(std::iter::repeat(0.0).take(param.elem_count())),
                }
            }
            self.comm.all_reduce(&mut flat, ReduceKind::Sum)?;

            let mut offset = 0;
            for param in bucket {
                let n = param.elem_count();
                let avg: Vec<f64> = flat[offset..offset + n].iter().map(|v| v / world).collect();
                let g = Tensor::<B>::from_f64_slice(&avg, param.shape().clone(), param.dtype(), param.device())?;
                synced.insert(param.id(), g);
                offset += n;
            }
        }
        tracing::debug!(rank = self.rank(), params = params.len(), "gradients synchronised");
        Ok(synced)
    }

    /// Overwrite every rank's `params` with the values held by `root`.
    pub fn broadcast_parameters<B: Backend>(&self, params: &[Tensor<B>], root: usize) -> Result<()> {
        for param in params {
            let mut data = param.to_f64_vec()?;
            self.comm.broadcast(&mut data, root)?;
            param.update_data_inplace(&data)?;
        }
        Ok(())
    }

    /// Mean of `loss` over all ranks.
    pub fn average_loss(&self, loss: f64) -> Result<f64> {
        let mut buf = [loss];
        self.comm.all_reduce(&mut buf, ReduceKind::Sum)?;
        Ok(buf[0] / self.world_size() as f64)
    }

    fn buckets<'a, B: Backend>(&self, params: &'a [Tensor<B>]) -> Vec<Vec<&'a Tensor<B>>> {
        let mut buckets: Vec<Vec<&Tensor<B>>> = Vec::new();
        let mut filled = 0;
        for param in params {
            let n = param.elem_count();
            match buckets.last_mut() {
                Some(bucket) if filled + n <= self.bucket_size => {
                    bucket.push(param);
                    filled += n;
                }
                _ => {
                    buckets.push(vec![param]);
                    filled = n;
                }
            }
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::DType;
    use marten_cpu::{CpuBackend, CpuDevice};
    use marten_parallel::LocalCommunicator;
    use std::time::Duration;

    fn param(n: usize) -> Tensor<CpuBackend> {
        Tensor::zeros(vec![n], DType::F32, &CpuDevice).unwrap()
    }

    #[test]
    fn test_bucketing() {
        let comm = LocalCommunicator::create_world(1, Duration::from_secs(1)).unwrap().remove(0);
        let dp = DataParallel::new(comm).with_bucket_size(4);
        let params = vec![param(3), param(1), param(6), param(2)];
        let sizes: Vec<usize> = dp.buckets(&params).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }
}
