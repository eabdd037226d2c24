// Data-parallel tests: sharded ranks match one process on the full batch

use std::thread;
use std::time::Duration;

use marten::distributed::DataParallel;
use marten::prelude::*;

const X: [f64; 8] = [1.0, 2.0, 0.5, -1.0, 3.0, 0.0, -2.0, 1.5];
const Y: [f64; 4] = [1.0, -0.5, 2.0, 0.25];
const W0: [f64; 2] = [0.3, -0.7];

fn tensor(data: &[f64], dims: &[usize]) -> CpuTensor {
    CpuTensor::from_f64_slice(data, dims.to_vec(), DType::F64, &CpuDevice).unwrap()
}

/// mean((x·w - y)^2) over `rows` of the toy regression problem.
fn loss(w: &CpuTensor, rows: std::ops::Range<usize>) -> CpuTensor {
    let n = rows.len();
    let x = tensor(&X[rows.start * 2..rows.end * 2], &[n, 2]);
    let y = tensor(&Y[rows], &[n, 1]);
    x.matmul(w).unwrap().sub(&y).unwrap().square().unwrap().mean_all().unwrap()
}

fn full_batch_step(lr: f64) -> Vec<f64> {
    let w = tensor(&W0, &[2, 1]).set_variable();
    let grads = loss(&w, 0..4).backward().unwrap();
    Sgd::new(lr).step(&[w.clone()], &grads).unwrap();
    w.to_f64_vec().unwrap()
}

#[test]
fn test_sharded_step_matches_full_batch() {
    let lr = 0.1;
    let expected = full_batch_step(lr);

    let comms = LocalCommunicator::create_world(2, Duration::from_secs(5)).unwrap();
    let results: Vec<(Vec<f64>, f64)> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let dp = DataParallel::new(comm).with_bucket_size(1);
                    let rank = dp.rank();
                    // Rank 1 starts from other values; the broadcast fixes that.
                    let init = if rank == 0 { W0.to_vec() } else { vec![9.0, 9.0] };
                    let w = tensor(&init, &[2, 1]).set_variable();
                    dp.broadcast_parameters(&[w.clone()], 0).unwrap();

                    let shard = loss(&w, rank * 2..rank * 2 + 2);
                    let local_loss = shard.to_scalar_f64().unwrap();
                    let grads = shard.backward().unwrap();
                    let grads = dp.sync_gradients(&[w.clone()], &grads).unwrap();
                    Sgd::new(lr).step(&[w.clone()], &grads).unwrap();
                    (w.to_f64_vec().unwrap(), dp.average_loss(local_loss).unwrap())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let full_loss = loss(&tensor(&W0, &[2, 1]), 0..4).to_scalar_f64().unwrap();
    for (w, avg_loss) in &results {
        for (a, b) in w.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-9, "{w:?} vs {expected:?}");
        }
        assert!((avg_loss - full_loss).abs() < 1e-9);
    }
}

#[test]
fn test_missing_gradient_counts_as_zero() {
    let comms = LocalCommunicator::create_world(2, Duration::from_secs(5)).unwrap();
    let synced: Vec<Vec<f64>> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let dp = DataParallel::new(comm);
                    let p = tensor(&[0.0, 0.0], &[2]).set_variable();
                    let mut grads = GradStore::new();
                    if dp.rank() == 0 {
                        grads.insert(p.id(), tensor(&[4.0, -2.0], &[2]));
                    }
                    let synced = dp.sync_gradients(&[p.clone()], &grads).unwrap();
                    synced.get(&p).unwrap().to_f64_vec().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(synced, vec![vec![2.0, -1.0], vec![2.0, -1.0]]);
}
