use std::collections::HashMap;
use std::time::Duration;

use marten_core::{DType, Error, Tensor};
use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};
use marten_ir::{Graph, GraphBuilder, Interpreter, NodeId};
use marten_ops::{prim, KernelRegistry};
use marten_parallel::{
    execute_sharded, execute_sharded_with_timeout, DeviceMesh, ParallelConfig, ShardedProgram, Strategy,
};

const DEV: CpuDevice = CpuDevice;

fn t(data: &[f64], shape: &[usize]) -> CpuTensor {
    Tensor::from_f64_slice(data, shape, DType::F64, &DEV).unwrap()
}

fn idx(data: &[i64], shape: &[usize]) -> CpuTensor {
    Tensor::from_slice(data, shape, &DEV).unwrap()
}

/// Deterministic pseudo-random values in [-1, 1).
fn values(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
        })
        .collect()
}

fn random(shape: &[usize], seed: u64) -> CpuTensor {
    let n = shape.iter().product();
    t(&values(n, seed), shape)
}

fn inputs(pairs: Vec<(&str, CpuTensor)>) -> HashMap<String, CpuTensor> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "index {}: {} vs {}", i, x, y);
    }
}

/// Run sharded and unsharded and compare every output.
fn check_sharded(
    graph: &Graph,
    strategies: &HashMap<NodeId, Strategy>,
    mesh: &DeviceMesh,
    inputs: &HashMap<String, CpuTensor>,
) {
    let expected = Interpreter::new(KernelRegistry::<CpuBackend>::with_defaults(), DEV)
        .run(graph, inputs)
        .unwrap();
    let got = execute_sharded(graph, strategies, mesh, inputs).unwrap();
    assert_eq!(expected.len(), got.len());
    for (e, g) in expected.iter().zip(&got) {
        assert_eq!(e.dims(), g.dims());
        assert_close(&g.to_f64_vec().unwrap(), &e.to_f64_vec().unwrap(), 1e-6);
    }
}

fn count_prim(graph: &Graph, name: &str) -> usize {
    graph.nodes().filter(|n| n.kind.is_apply_of(name)).count()
}

#[test]
fn test_feed_forward_dp_mp_matches_single_device() {
    let cfg = ParallelConfig::new(2, 2);
    let mesh = cfg.mesh().unwrap();
    let ffn = cfg.feed_forward_strategies();

    let mut b = GraphBuilder::new("ffn");
    let x = b.parameter("x", &[4, 6], DType::F64);
    let w1 = b.parameter("w1", &[6, 8], DType::F64);
    let b1 = b.parameter("b1", &[8], DType::F64);
    let w2 = b.parameter("w2", &[8, 6], DType::F64);
    let h = b.matmul(x, w1, false, false);
    let hb = b.bias_add(h, b1);
    let a = b.gelu(hb);
    let y = b.matmul(a, w2, false, false);
    let graph = b.finish(&[y]);

    let mut strategies = HashMap::new();
    strategies.insert(h, ffn.mapping);
    strategies.insert(hb, ffn.bias_add);
    strategies.insert(y, ffn.projection);

    let program = ShardedProgram::shard(&graph, &strategies, &mesh).unwrap();
    // the projection contracts a split dim, so its partial sum is reduced
    assert_eq!(count_prim(&program.graph, prim::ALL_REDUCE), 1);
    assert_eq!(program.layouts[&w1].tensor_map, vec![-1, 0]);
    assert_eq!(program.local_graph().unwrap().abstract_of(w1).unwrap().dims(), &[6, 4]);

    let feeds = inputs(vec![
        ("x", random(&[4, 6], 1)),
        ("w1", random(&[6, 8], 2)),
        ("b1", random(&[8], 3)),
        ("w2", random(&[8, 6], 4)),
    ]);
    check_sharded(&graph, &strategies, &mesh, &feeds);
}

#[test]
fn test_unannotated_graph_runs_data_parallel() {
    let mesh = DeviceMesh::line(4).unwrap();
    let mut b = GraphBuilder::new("dp");
    let x = b.parameter("x", &[8, 3], DType::F64);
    let w = b.parameter("w", &[3, 5], DType::F64);
    let y = b.matmul(x, w, false, false);
    let s = b.softmax(y, -1);
    let loss = b.reduce_mean(s, &[], false);
    let m = b.reduce_max(y, &[1], false);
    let graph = b.finish(&[loss, m, s]);

    let feeds = inputs(vec![("x", random(&[8, 3], 5)), ("w", random(&[3, 5], 6))]);
    check_sharded(&graph, &HashMap::new(), &mesh, &feeds);

    let program = ShardedProgram::shard(&graph, &HashMap::new(), &mesh).unwrap();
    assert_eq!(program.layouts[&x].tensor_map, vec![0, -1]);
    assert!(program.layouts[&w].is_replicated());
}

#[test]
fn test_vocab_split_embedding_lookup() {
    let cfg = ParallelConfig {
        vocab_emb_dp: false,
        ..ParallelConfig::new(1, 2)
    };
    let mesh = cfg.mesh().unwrap();

    let mut b = GraphBuilder::new("embedding");
    let table = b.parameter("table", &[8, 4], DType::F64);
    let ids = b.parameter("ids", &[2, 3], DType::I64);
    let e = b.gather(table, ids, 0);
    let out = b.tanh(e);
    let graph = b.finish(&[out]);

    let mut strategies = HashMap::new();
    strategies.insert(e, cfg.embedding_strategy());

    let program = ShardedProgram::shard(&graph, &strategies, &mesh).unwrap();
    assert_eq!(program.layouts[&table].tensor_map, vec![0, -1]);
    assert!(program.layouts[&e].is_partial());

    let feeds = inputs(vec![
        ("table", random(&[8, 4], 7)),
        ("ids", idx(&[0, 7, 3, 4, 4, 1], &[2, 3])),
    ]);
    check_sharded(&graph, &strategies, &mesh, &feeds);
}

#[test]
fn test_moved_split_goes_through_all_to_all() {
    let mesh = DeviceMesh::line(2).unwrap();
    let mut b = GraphBuilder::new("a2a");
    let x = b.parameter("x", &[4, 6], DType::F64);
    let z = b.parameter("z", &[6, 4], DType::F64);
    let a = b.exp(x);
    let zt = b.transpose(z, &[1, 0]);
    let c = b.add(a, zt);
    let graph = b.finish(&[c]);

    let mut strategies = HashMap::new();
    strategies.insert(a, vec![vec![2, 1]]);
    strategies.insert(zt, vec![vec![2, 1]]);

    let program = ShardedProgram::shard(&graph, &strategies, &mesh).unwrap();
    assert_eq!(count_prim(&program.graph, prim::ALL_TO_ALL), 1);

    let feeds = inputs(vec![("x", random(&[4, 6], 8)), ("z", random(&[6, 4], 9))]);
    check_sharded(&graph, &strategies, &mesh, &feeds);
}

#[test]
fn test_partial_sum_into_split_consumer_reduce_scatters() {
    let mesh = DeviceMesh::line(2).unwrap();
    let mut b = GraphBuilder::new("rs");
    let x = b.parameter("x", &[4, 6], DType::F64);
    let w = b.parameter("w", &[6, 4], DType::F64);
    let y = b.matmul(x, w, false, false);
    let r = b.relu(y);
    let graph = b.finish(&[r]);

    let mut strategies = HashMap::new();
    strategies.insert(y, vec![vec![1, 2], vec![2, 1]]);
    strategies.insert(r, vec![vec![1, 2]]);

    let program = ShardedProgram::shard(&graph, &strategies, &mesh).unwrap();
    assert_eq!(count_prim(&program.graph, prim::REDUCE_SCATTER), 1);
    assert_eq!(count_prim(&program.graph, prim::ALL_REDUCE), 0);

    let feeds = inputs(vec![("x", random(&[4, 6], 10)), ("w", random(&[6, 4], 11))]);
    check_sharded(&graph, &strategies, &mesh, &feeds);
}

#[test]
fn test_missing_input_fails_instead_of_hanging() {
    let mesh = DeviceMesh::line(2).unwrap();
    let mut b = GraphBuilder::new("g");
    let x = b.parameter("x", &[4, 2], DType::F64);
    let s = b.reduce_sum(x, &[], false);
    let graph = b.finish(&[s]);

    let err = execute_sharded_with_timeout(
        &graph,
        &HashMap::new(),
        &mesh,
        &HashMap::new(),
        Duration::from_millis(100),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Msg(ref m) if m.contains("no value bound")));
}

#[test]
fn test_indivisible_strategy_is_rejected() {
    let mesh = DeviceMesh::line(2).unwrap();
    let mut b = GraphBuilder::new("g");
    let x = b.parameter("x", &[3, 4], DType::F64);
    let e = b.exp(x);
    let graph = b.finish(&[e]);

    let mut strategies = HashMap::new();
    strategies.insert(x, vec![vec![2, 1]]);
    let err = ShardedProgram::shard(&graph, &strategies, &mesh).unwrap_err();
    assert!(matches!(err, Error::InvalidStrategy(_)));
}
