// ParallelConfig — data/model/pipeline parallel degrees for transformer
// layers, and the shard strategies those layers use.
//
// The strategies assume a mesh of shape [data_parallel, model_parallel]
// (see `mesh`), so a split of `dp` lands on mesh axis 0 and a split of `mp`
// on mesh axis 1 whenever the two differ.

use marten_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::layout::Strategy;
use crate::mesh::DeviceMesh;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub data_parallel: usize,
    pub model_parallel: usize,
    pub pipeline_stage: usize,
    pub micro_batch_num: usize,
    /// Keep the embedding table whole and split its lookups by batch;
    /// otherwise the vocabulary is split by `model_parallel`.
    pub vocab_emb_dp: bool,
    pub recompute: bool,
    pub optimizer_shard: bool,
    pub gradient_aggregation_group: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            data_parallel: 1,
            model_parallel: 1,
            pipeline_stage: 1,
            micro_batch_num: 1,
            vocab_emb_dp: true,
            recompute: false,
            optimizer_shard: false,
            gradient_aggregation_group: 4,
        }
    }
}

/// Strategies of a feed-forward block: `x·W1 + b1` then `h·W2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardStrategies {
    pub mapping: Strategy,
    pub bias_add: Strategy,
    pub projection: Strategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionStrategies {
    pub qkv_projection: Strategy,
    /// Scores laid out as [batch, heads, query, key].
    pub softmax: Strategy,
    pub output_projection: Strategy,
}

impl ParallelConfig {
    pub fn new(data_parallel: usize, model_parallel: usize) -> Self {
        Self {
            data_parallel,
            model_parallel,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("data_parallel", self.data_parallel),
            ("model_parallel", self.model_parallel),
            ("pipeline_stage", self.pipeline_stage),
            ("micro_batch_num", self.micro_batch_num),
            ("gradient_aggregation_group", self.gradient_aggregation_group),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(Error::strategy(format!("{name} must be at least 1")));
            }
        }
        if self.micro_batch_num < self.pipeline_stage {
            return Err(Error::strategy(format!(
                "micro_batch_num {} must be at least pipeline_stage {}",
                self.micro_batch_num, self.pipeline_stage
            )));
        }
        Ok(())
    }

    /// Ranks one pipeline stage occupies.
    pub fn stage_device_num(&self) -> usize {
        self.data_parallel * self.model_parallel
    }

    pub fn check_device_num(&self, device_num: usize) -> Result<()> {
        self.validate()?;
        let needed = self.stage_device_num() * self.pipeline_stage;
        if device_num % needed != 0 {
            return Err(Error::strategy(format!(
                "device_num {device_num} is not a multiple of data_parallel {} * model_parallel {} * pipeline_stage {}",
                self.data_parallel, self.model_parallel, self.pipeline_stage
            )));
        }
        Ok(())
    }

    /// The mesh of one pipeline stage.
    pub fn mesh(&self) -> Result<DeviceMesh> {
        self.validate()?;
        DeviceMesh::new(vec![self.data_parallel, self.model_parallel])
    }

    pub fn feed_forward_strategies(&self) -> FeedForwardStrategies {
        let (dp, mp) = (self.data_parallel, self.model_parallel);
        FeedForwardStrategies {
            mapping: vec![vec![dp, 1], vec![1, mp]],
            bias_add: vec![vec![dp, mp], vec![mp]],
            projection: vec![vec![dp, mp], vec![mp, 1]],
        }
    }

    pub fn attention_strategies(&self) -> AttentionStrategies {
        let (dp, mp) = (self.data_parallel, self.model_parallel);
        AttentionStrategies {
            qkv_projection: vec![vec![dp, 1], vec![1, mp]],
            softmax: vec![vec![dp, mp, 1, 1]],
            output_projection: vec![vec![dp, mp], vec![mp, 1]],
        }
    }

    /// Strategy of the embedding Gather: (table, indices).
    pub fn embedding_strategy(&self) -> Strategy {
        if self.vocab_emb_dp {
            vec![vec![1, 1], vec![self.data_parallel, 1]]
        } else {
            vec![vec![self.model_parallel, 1], vec![1, 1]]
        }
    }

    pub fn layer_norm_strategy(&self) -> Strategy {
        vec![vec![self.data_parallel, 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_partial_json() {
        let cfg: ParallelConfig = serde_json::from_str(r#"{"data_parallel": 2, "model_parallel": 4}"#).unwrap();
        assert_eq!(cfg.pipeline_stage, 1);
        assert_eq!(cfg.gradient_aggregation_group, 4);
        assert!(cfg.vocab_emb_dp);
        assert_eq!(cfg.mesh().unwrap().shape(), &[2, 4]);
    }

    #[test]
    fn test_validation() {
        assert!(ParallelConfig::new(0, 1).validate().is_err());
        let cfg = ParallelConfig {
            pipeline_stage: 2,
            micro_batch_num: 1,
            ..ParallelConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ParallelConfig::new(2, 2);
        assert!(cfg.check_device_num(8).is_ok());
        let err = cfg.check_device_num(6).unwrap_err();
        assert!(matches!(err, Error::InvalidStrategy(_)));
    }

    #[test]
    fn test_strategies_follow_degrees() {
        let cfg = ParallelConfig::new(2, 4);
        let ffn = cfg.feed_forward_strategies();
        assert_eq!(ffn.mapping, vec![vec![2, 1], vec![1, 4]]);
        assert_eq!(ffn.bias_add, vec![vec![2, 4], vec![4]]);
        assert_eq!(cfg.attention_strategies().softmax, vec![vec![2, 4, 1, 1]]);
        assert_eq!(cfg.embedding_strategy(), vec![vec![1, 1], vec![2, 1]]);
        let row_split = ParallelConfig {
            vocab_emb_dp: false,
            ..cfg
        };
        assert_eq!(row_split.embedding_strategy(), vec![vec![4, 1], vec![1, 1]]);
        assert_eq!(row_split.layer_norm_strategy(), vec![vec![2, 1]]);
    }
}
