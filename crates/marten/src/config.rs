// Runtime configuration
//
// Loaded from JSON; every field is optional and falls back to its default.
//
//   {
//     "device_target": "cpu",
//     "mode": "graph",
//     "memory": { "pool_size_bytes": 1073741824 },
//     "parallel": { "data_parallel": 2, "model_parallel": 4 },
//     "data": { "num_workers": 8 },
//     "fallback": { "runtime_fallback": true },
//     "log_level": "debug"
//   }
//
// `MARTEN_DEVICE_TARGET` and `MARTEN_LOG` override the file.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use marten_core::{Error, Result, Tensor};
use marten_cpu::{CpuBackend, CpuDevice, DynamicMemPool};
use marten_data::{DataLoader, Pipeline, Transform, TreeAdapter, DEFAULT_PREFETCH_SIZE};
use marten_ir::{canonicalize, resolve_builtins, Graph, Interpreter};
use marten_ops::KernelRegistry;
use marten_parallel::ParallelConfig;

pub const DEVICE_TARGET_ENV: &str = "MARTEN_DEVICE_TARGET";
pub const LOG_ENV: &str = "MARTEN_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Build a graph, run passes, then execute.
    #[default]
    Graph,
    /// Run ops as they are called.
    Eager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub pool_size_bytes: usize,
    pub unit_size_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pool_size_bytes: 1 << 30,
            unit_size_bytes: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Workers for maps built through [`Context::map`].
    pub num_workers: usize,
    /// Rows a parallel map keeps in flight.
    pub prefetch_size: usize,
    /// Seed for [`Context::shuffle`].
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            prefetch_size: DEFAULT_PREFETCH_SIZE,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Evaluate untranslatable builtins on the host at run time instead of
    /// rejecting the graph.
    pub runtime_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device_target: String,
    pub mode: ExecutionMode,
    pub memory: MemoryConfig,
    pub parallel: ParallelConfig,
    pub data: DataConfig,
    pub fallback: FallbackConfig,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_target: "cpu".to_string(),
            mode: ExecutionMode::default(),
            memory: MemoryConfig::default(),
            parallel: ParallelConfig::default(),
            data: DataConfig::default(),
            fallback: FallbackConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::msg(format!("invalid runtime config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::msg(format!("runtime config: {e}")))
    }

    /// Override fields from `MARTEN_DEVICE_TARGET` and `MARTEN_LOG`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(target) = std::env::var(DEVICE_TARGET_ENV) {
            self.device_target = target;
        }
        if let Ok(level) = std::env::var(LOG_ENV) {
            self.log_level = level;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_target != "cpu" {
            return Err(Error::msg(format!(
                "unsupported device target '{}' (expected 'cpu')",
                self.device_target
            )));
        }
        if self.memory.pool_size_bytes == 0 || self.memory.unit_size_bytes == 0 {
            return Err(Error::msg(format!(
                "memory pool sizes must be non-zero, got pool {} unit {}",
                self.memory.pool_size_bytes, self.memory.unit_size_bytes
            )));
        }
        if self.data.num_workers == 0 || self.data.prefetch_size == 0 {
            return Err(Error::msg(format!(
                "data num_workers and prefetch_size must be non-zero, got {} and {}",
                self.data.num_workers, self.data.prefetch_size
            )));
        }
        self.parallel.validate()
    }
}

/// A validated config with the runtime objects it describes.
#[derive(Debug)]
pub struct Context {
    config: RuntimeConfig,
    pool: DynamicMemPool,
    registry: KernelRegistry<CpuBackend>,
}

impl Context {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let pool = DynamicMemPool::new(config.memory.pool_size_bytes, config.memory.unit_size_bytes);
        let registry = KernelRegistry::with_defaults();
        tracing::info!(
            device = %config.device_target,
            mode = ?config.mode,
            pool = %crate::profiler::format_bytes(config.memory.pool_size_bytes),
            kernels = registry.len(),
            "context ready"
        );
        Ok(Self { config, pool, registry })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &DynamicMemPool {
        &self.pool
    }

    pub fn registry(&self) -> &KernelRegistry<CpuBackend> {
        &self.registry
    }

    pub fn device(&self) -> CpuDevice {
        CpuDevice
    }

    /// Graph interpreter over this context's kernels and fallback setting.
    pub fn interpreter(&self) -> Interpreter<CpuBackend> {
        Interpreter::new(self.registry.clone(), CpuDevice).with_runtime_fallback(self.config.fallback.runtime_fallback)
    }

    /// Execute `graph` according to the configured mode.
    ///
    /// Graph mode folds builtins and canonicalizes a copy before running it.
    /// Eager mode evaluates the nodes exactly as written, so leftover
    /// builtins need runtime fallback.
    pub fn run_graph(
        &self,
        graph: &Graph,
        params: &HashMap<String, Tensor<CpuBackend>>,
    ) -> Result<Vec<Tensor<CpuBackend>>> {
        match self.config.mode {
            ExecutionMode::Graph => {
                let mut compiled = graph.clone();
                resolve_builtins(&mut compiled, self.config.fallback.runtime_fallback)?;
                canonicalize(&mut compiled)?;
                tracing::debug!(
                    graph = %graph.name,
                    before = graph.len(),
                    after = compiled.len(),
                    "graph compiled"
                );
                self.interpreter().run(&compiled, params)
            }
            ExecutionMode::Eager => self.interpreter().run(graph, params),
        }
    }

    /// Append a map of `op` run by `data.num_workers` workers.
    pub fn map<T: Transform + 'static>(
        &self,
        pipeline: Pipeline,
        op: T,
        input_columns: &[&str],
        output_columns: &[&str],
    ) -> Pipeline {
        pipeline.map_with(op, input_columns, output_columns, &[], self.config.data.num_workers)
    }

    /// Append a shuffle seeded with `data.seed`.
    pub fn shuffle(&self, pipeline: Pipeline, buffer_size: usize) -> Pipeline {
        pipeline.shuffle(buffer_size, self.config.data.seed)
    }

    pub fn compile_pipeline(&self, pipeline: &Pipeline, num_epochs: u64) -> Result<TreeAdapter> {
        pipeline.compile_with(num_epochs, self.config.data.prefetch_size)
    }

    pub fn data_loader(&self, pipeline: &Pipeline, num_epochs: u64) -> Result<DataLoader<CpuBackend>> {
        Ok(DataLoader::new(self.compile_pipeline(pipeline, num_epochs)?, CpuDevice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = RuntimeConfig::from_json_str(r#"{ "mode": "eager", "data": { "num_workers": 2 } }"#).unwrap();
        assert_eq!(config.mode, ExecutionMode::Eager);
        assert_eq!(config.data.num_workers, 2);
        assert_eq!(config.data.prefetch_size, DEFAULT_PREFETCH_SIZE);
        assert_eq!(config.device_target, "cpu");
        assert_eq!(config.parallel, ParallelConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = RuntimeConfig::default();
        config.memory.pool_size_bytes = 0;
        assert!(config.validate().is_err());
        assert!(Context::new(config).is_err());
    }
}
