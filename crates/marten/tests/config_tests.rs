// Runtime config tests: JSON loading, env overrides, and the Context's
// pipelines and execution modes

use std::collections::HashMap;
use std::sync::Arc;

use marten::config::{Context, ExecutionMode, RuntimeConfig, DEVICE_TARGET_ENV};
use marten::data::{GeneratorSource, Normalize, PipelineNode};
use marten::ir::{BuiltinArg, HostValue};
use marten::prelude::*;
use marten::Error;

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marten.json");
    std::fs::write(
        &path,
        r#"{
            "mode": "eager",
            "memory": { "pool_size_bytes": 1048576, "unit_size_bytes": 4096 },
            "parallel": { "data_parallel": 2, "model_parallel": 4 },
            "fallback": { "runtime_fallback": true },
            "log_level": "debug"
        }"#,
    )
    .unwrap();

    let config = RuntimeConfig::from_file(&path).unwrap();
    assert_eq!(config.mode, ExecutionMode::Eager);
    assert_eq!(config.memory.pool_size_bytes, 1 << 20);
    assert_eq!(config.parallel.data_parallel, 2);
    assert_eq!(config.parallel.model_parallel, 4);
    assert_eq!(config.parallel.pipeline_stage, 1);
    assert!(config.fallback.runtime_fallback);
    assert_eq!(config.log_level, "debug");

    let back = RuntimeConfig::from_json_str(&config.to_json_string().unwrap()).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_bad_json_and_invalid_values() {
    assert!(RuntimeConfig::from_json_str("{ not json").is_err());
    assert!(RuntimeConfig::from_json_str(r#"{ "mode": "turbo" }"#).is_err());

    let mut config = RuntimeConfig::default();
    config.parallel = ParallelConfig::new(0, 1);
    assert!(config.validate().is_err());

    let mut config = RuntimeConfig::default();
    config.device_target = "tpu".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_env_overrides_device_target() {
    std::env::set_var(DEVICE_TARGET_ENV, "gpu");
    let config = RuntimeConfig::default().apply_env();
    std::env::remove_var(DEVICE_TARGET_ENV);
    assert_eq!(config.device_target, "gpu");
    assert!(config.validate().is_err());
}

#[test]
fn test_context_builds_pool_and_registry() {
    let mut config = RuntimeConfig::default();
    config.memory.pool_size_bytes = 1 << 16;
    config.memory.unit_size_bytes = 4096;
    let ctx = Context::new(config).unwrap();
    assert_eq!(ctx.pool().capacity(), 1 << 16);
    assert!(!ctx.registry().is_empty());
    assert_eq!(ctx.pool().stats().unwrap().used_mem, 0);
    let _interp = ctx.interpreter();
}

#[test]
fn test_context_configures_pipelines() {
    let mut config = RuntimeConfig::default();
    config.data.num_workers = 3;
    config.data.prefetch_size = 2;
    config.data.seed = 7;
    let ctx = Context::new(config).unwrap();

    let source = Pipeline::from_source(Arc::new(GeneratorSource::new(&["x"], 6, |i| {
        Ok(vec![Column::scalar("x", i as f64, DType::F64)])
    })));
    let pipeline = ctx.map(source, Normalize::new(2.0), &["x"], &[]);
    assert!(matches!(pipeline.node(), PipelineNode::Map { num_workers: 3, .. }));
    let shuffled = ctx.shuffle(pipeline.clone(), 4);
    assert!(matches!(
        shuffled.node(),
        PipelineNode::Shuffle { buffer_size: 4, seed: 7, .. }
    ));

    let mut adapter = ctx.compile_pipeline(&pipeline, 1).unwrap();
    assert_eq!(adapter.prefetch_size(), 2);
    let mut seen = Vec::new();
    loop {
        let row = adapter.get_next().unwrap();
        if row.is_empty() {
            break;
        }
        seen.push(row[0].data[0]);
    }
    assert_eq!(seen, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);

    let loader = ctx.data_loader(&pipeline, 2).unwrap();
    assert_eq!(loader.adapter().prefetch_size(), 2);
    assert_eq!(loader.column_names(), vec!["x".to_string()]);
}

/// `x * len(str(42))`
fn scaled_by_builtin() -> Graph {
    let mut b = GraphBuilder::new("scaled");
    let x = b.parameter("x", &[3], DType::F64);
    let text = b.builtin("str", vec![BuiltinArg::Value(HostValue::Int(42))]);
    let n = b.builtin("len", vec![BuiltinArg::Node(text)]);
    let nf = b.cast(n, DType::F64);
    let out = b.mul(x, nf);
    b.finish(&[out])
}

#[test]
fn test_execution_mode_decides_builtin_handling() {
    let graph = scaled_by_builtin();
    let mut params = HashMap::new();
    params.insert(
        "x".to_string(),
        CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64, &CpuDevice).unwrap(),
    );

    // Graph mode folds the builtins before running.
    let ctx = Context::new(RuntimeConfig::default()).unwrap();
    let out = ctx.run_graph(&graph, &params).unwrap();
    assert_eq!(out[0].to_f64_vec().unwrap(), vec![2.0, 4.0, 6.0]);

    let mut config = RuntimeConfig::default();
    config.mode = ExecutionMode::Eager;
    let eager = Context::new(config.clone()).unwrap();
    let err = eager.run_graph(&graph, &params).unwrap_err();
    assert!(matches!(err, Error::Untranslatable { .. }));

    config.fallback.runtime_fallback = true;
    let eager = Context::new(config).unwrap();
    let out = eager.run_graph(&graph, &params).unwrap();
    assert_eq!(out[0].to_f64_vec().unwrap(), vec![2.0, 4.0, 6.0]);
}
