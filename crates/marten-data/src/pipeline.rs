// Pipeline — the dataset IR tree and its fluent builder
//
// A pipeline is a tree of `PipelineNode`s whose leaves are row sources.
// Building one does no work; `TreeAdapter::compile` validates the tree and
// turns it into an execution iterator.
//
// USAGE:
//   let adapter = Pipeline::from_dataset(ds)
//       .map(OneHot::new(10), &["target"], &["target"])
//       .shuffle(64, 7)
//       .batch(32, true)
//       .compile(1)?;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use marten_core::{DType, Error, Result};

use crate::dataset::{Dataset, Row};
use crate::source::{DatasetSource, RowSource};
use crate::transform::Transform;
use crate::tree_adapter::TreeAdapter;

pub type Predicate = Arc<dyn Fn(&Row) -> Result<bool> + Send + Sync>;

#[derive(Clone)]
pub enum PipelineNode {
    Source(Arc<dyn RowSource>),
    /// Runs `op` on `input_columns` (the first column when empty) and puts
    /// its results, named `output_columns`, where the first input was.
    /// A non-empty `project_columns` then selects and orders the columns.
    Map {
        child: Box<PipelineNode>,
        op: Arc<dyn Transform>,
        input_columns: Vec<String>,
        output_columns: Vec<String>,
        project_columns: Vec<String>,
        num_workers: usize,
    },
    Filter {
        child: Box<PipelineNode>,
        predicate: Predicate,
    },
    Shuffle {
        child: Box<PipelineNode>,
        buffer_size: usize,
        seed: u64,
    },
    Batch {
        child: Box<PipelineNode>,
        batch_size: usize,
        drop_remainder: bool,
    },
    Repeat {
        child: Box<PipelineNode>,
        count: usize,
    },
    Take {
        child: Box<PipelineNode>,
        count: usize,
    },
    Skip {
        child: Box<PipelineNode>,
        count: usize,
    },
    Zip(Vec<PipelineNode>),
    Concat(Vec<PipelineNode>),
    Project {
        child: Box<PipelineNode>,
        columns: Vec<String>,
    },
    Rename {
        child: Box<PipelineNode>,
        input_columns: Vec<String>,
        output_columns: Vec<String>,
    },
}

impl PipelineNode {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineNode::Source(_) => "Source",
            PipelineNode::Map { .. } => "Map",
            PipelineNode::Filter { .. } => "Filter",
            PipelineNode::Shuffle { .. } => "Shuffle",
            PipelineNode::Batch { .. } => "Batch",
            PipelineNode::Repeat { .. } => "Repeat",
            PipelineNode::Take { .. } => "Take",
            PipelineNode::Skip { .. } => "Skip",
            PipelineNode::Zip(_) => "Zip",
            PipelineNode::Concat(_) => "Concat",
            PipelineNode::Project { .. } => "Project",
            PipelineNode::Rename { .. } => "Rename",
        }
    }

    pub fn children(&self) -> Vec<&PipelineNode> {
        match self {
            PipelineNode::Source(_) => Vec::new(),
            PipelineNode::Zip(children) | PipelineNode::Concat(children) => children.iter().collect(),
            PipelineNode::Map { child, .. }
            | PipelineNode::Filter { child, .. }
            | PipelineNode::Shuffle { child, .. }
            | PipelineNode::Batch { child, .. }
            | PipelineNode::Repeat { child, .. }
            | PipelineNode::Take { child, .. }
            | PipelineNode::Skip { child, .. }
            | PipelineNode::Project { child, .. }
            | PipelineNode::Rename { child, .. } => vec![child.as_ref()],
        }
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        1 + self.children().iter().map(|c| c.size()).sum::<usize>()
    }

    /// Check the tree and return the column names its rows carry.
    pub fn output_columns(&self) -> Result<Vec<String>> {
        match self {
            PipelineNode::Source(source) => {
                let names = source.column_names();
                check_unique(&names, "Source")?;
                Ok(names)
            }
            PipelineNode::Map {
                child,
                input_columns,
                output_columns,
                project_columns,
                num_workers,
                ..
            } => {
                if *num_workers == 0 {
                    return Err(Error::msg("Map: num_workers must be at least 1"));
                }
                let plan = MapColumns::resolve(&child.output_columns()?, input_columns, output_columns, project_columns)?;
                Ok(plan.output_names)
            }
            PipelineNode::Shuffle { child, buffer_size, .. } => {
                if *buffer_size == 0 {
                    return Err(Error::msg("Shuffle: buffer_size must be greater than 0"));
                }
                child.output_columns()
            }
            PipelineNode::Batch { child, batch_size, .. } => {
                if *batch_size == 0 {
                    return Err(Error::msg("Batch: batch_size must be greater than 0"));
                }
                child.output_columns()
            }
            PipelineNode::Repeat { child, count } => {
                if *count == 0 {
                    return Err(Error::msg("Repeat: count must be at least 1"));
                }
                child.output_columns()
            }
            PipelineNode::Filter { child, .. } | PipelineNode::Take { child, .. } | PipelineNode::Skip { child, .. } => {
                child.output_columns()
            }
            PipelineNode::Zip(children) => {
                if children.is_empty() {
                    return Err(Error::msg("Zip: needs at least one child"));
                }
                let mut names = Vec::new();
                for child in children {
                    names.extend(child.output_columns()?);
                }
                check_unique(&names, "Zip")?;
                Ok(names)
            }
            PipelineNode::Concat(children) => {
                let first = children
                    .first()
                    .ok_or_else(|| Error::msg("Concat: needs at least one child"))?
                    .output_columns()?;
                for child in &children[1..] {
                    let names = child.output_columns()?;
                    if names != first {
                        return Err(Error::SchemaMismatch {
                            column: "*".to_string(),
                            expected: format!("{first:?}"),
                            got: format!("{names:?}"),
                        });
                    }
                }
                Ok(first)
            }
            PipelineNode::Project { child, columns } => {
                let names = child.output_columns()?;
                positions(&names, columns, "Project")?;
                check_unique(columns, "Project")?;
                Ok(columns.clone())
            }
            PipelineNode::Rename {
                child,
                input_columns,
                output_columns,
            } => {
                if input_columns.len() != output_columns.len() {
                    return Err(Error::msg(format!(
                        "Rename: {} input columns but {} output columns",
                        input_columns.len(),
                        output_columns.len()
                    )));
                }
                let mut names = child.output_columns()?;
                for (i, to) in positions(&names, input_columns, "Rename")?.into_iter().zip(output_columns) {
                    names[i] = to.clone();
                }
                check_unique(&names, "Rename")?;
                Ok(names)
            }
        }
    }
}

impl fmt::Debug for PipelineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let children = self.children();
        if children.is_empty() {
            return write!(f, "{}", self.name());
        }
        f.debug_tuple(self.name()).field(&children).finish()
    }
}

fn check_unique(names: &[String], op: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for n in names {
        if !seen.insert(n) {
            return Err(Error::msg(format!("{op}: duplicate column '{n}'")));
        }
    }
    Ok(())
}

/// Index of each of `wanted` in `names`.
pub(crate) fn positions(names: &[String], wanted: &[String], op: &str) -> Result<Vec<usize>> {
    wanted
        .iter()
        .map(|w| {
            names
                .iter()
                .position(|n| n == w)
                .ok_or_else(|| Error::msg(format!("{op}: column '{w}' does not exist in {names:?}")))
        })
        .collect()
}

/// Where a Map reads and writes columns.
#[derive(Debug, Clone)]
pub(crate) struct MapColumns {
    pub inputs: Vec<usize>,
    pub outputs: Vec<String>,
    /// Position of the outputs among the columns the map does not read.
    pub insert_at: usize,
    pub project: Option<Vec<usize>>,
    pub output_names: Vec<String>,
}

impl MapColumns {
    pub fn resolve(
        names: &[String],
        input_columns: &[String],
        output_columns: &[String],
        project_columns: &[String],
    ) -> Result<Self> {
        let input_columns = if input_columns.is_empty() {
            names.first().cloned().into_iter().collect()
        } else {
            input_columns.to_vec()
        };
        let outputs = if output_columns.is_empty() {
            input_columns.clone()
        } else {
            output_columns.to_vec()
        };
        let inputs = positions(names, &input_columns, "Map")?;
        check_unique(&input_columns, "Map")?;
        let first = inputs.iter().copied().min().unwrap_or(names.len());
        let insert_at = (0..first).filter(|i| !inputs.contains(i)).count();

        let mut mapped: Vec<String> = names
            .iter()
            .enumerate()
            .filter(|(i, _)| !inputs.contains(i))
            .map(|(_, n)| n.clone())
            .collect();
        for (k, o) in outputs.iter().enumerate() {
            mapped.insert(insert_at + k, o.clone());
        }
        check_unique(&mapped, "Map")?;

        let (project, output_names) = if project_columns.is_empty() {
            (None, mapped)
        } else {
            check_unique(project_columns, "Map")?;
            (Some(positions(&mapped, project_columns, "Map")?), project_columns.to_vec())
        };
        Ok(Self {
            inputs,
            outputs,
            insert_at,
            project,
            output_names,
        })
    }
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// Fluent construction of a [`PipelineNode`] tree.
#[derive(Clone, Debug)]
pub struct Pipeline {
    node: PipelineNode,
}

impl Pipeline {
    pub fn from_source(source: Arc<dyn RowSource>) -> Self {
        Self {
            node: PipelineNode::Source(source),
        }
    }

    /// `features`, `target` rows in f32.
    pub fn from_dataset<D: Dataset + 'static>(dataset: D) -> Self {
        Self::from_dataset_as(dataset, DType::F32)
    }

    pub fn from_dataset_as<D: Dataset + 'static>(dataset: D, dtype: DType) -> Self {
        Self::from_source(Arc::new(DatasetSource::new(Arc::new(dataset), dtype)))
    }

    fn wrap(self, f: impl FnOnce(Box<PipelineNode>) -> PipelineNode) -> Self {
        Self {
            node: f(Box::new(self.node)),
        }
    }

    pub fn map<T: Transform + 'static>(self, op: T, input_columns: &[&str], output_columns: &[&str]) -> Self {
        self.map_with(op, input_columns, output_columns, &[], 1)
    }

    pub fn map_with<T: Transform + 'static>(
        self,
        op: T,
        input_columns: &[&str],
        output_columns: &[&str],
        project_columns: &[&str],
        num_workers: usize,
    ) -> Self {
        self.wrap(|child| PipelineNode::Map {
            child,
            op: Arc::new(op),
            input_columns: strings(input_columns),
            output_columns: strings(output_columns),
            project_columns: strings(project_columns),
            num_workers,
        })
    }

    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&Row) -> Result<bool> + Send + Sync + 'static,
    {
        self.wrap(|child| PipelineNode::Filter {
            child,
            predicate: Arc::new(predicate),
        })
    }

    pub fn shuffle(self, buffer_size: usize, seed: u64) -> Self {
        self.wrap(|child| PipelineNode::Shuffle {
            child,
            buffer_size,
            seed,
        })
    }

    pub fn batch(self, batch_size: usize, drop_remainder: bool) -> Self {
        self.wrap(|child| PipelineNode::Batch {
            child,
            batch_size,
            drop_remainder,
        })
    }

    pub fn repeat(self, count: usize) -> Self {
        self.wrap(|child| PipelineNode::Repeat { child, count })
    }

    pub fn take(self, count: usize) -> Self {
        self.wrap(|child| PipelineNode::Take { child, count })
    }

    pub fn skip(self, count: usize) -> Self {
        self.wrap(|child| PipelineNode::Skip { child, count })
    }

    pub fn zip(self, others: Vec<Pipeline>) -> Self {
        let mut children = vec![self.node];
        children.extend(others.into_iter().map(|p| p.node));
        Self {
            node: PipelineNode::Zip(children),
        }
    }

    pub fn concat(self, others: Vec<Pipeline>) -> Self {
        let mut children = vec![self.node];
        children.extend(others.into_iter().map(|p| p.node));
        Self {
            node: PipelineNode::Concat(children),
        }
    }

    pub fn project(self, columns: &[&str]) -> Self {
        self.wrap(|child| PipelineNode::Project {
            child,
            columns: strings(columns),
        })
    }

    pub fn rename(self, input_columns: &[&str], output_columns: &[&str]) -> Self {
        self.wrap(|child| PipelineNode::Rename {
            child,
            input_columns: strings(input_columns),
            output_columns: strings(output_columns),
        })
    }

    pub fn node(&self) -> &PipelineNode {
        &self.node
    }

    pub fn into_node(self) -> PipelineNode {
        self.node
    }

    pub fn compile(&self, num_epochs: u64) -> Result<TreeAdapter> {
        TreeAdapter::compile(&self.node, num_epochs)
    }

    pub fn compile_with(&self, num_epochs: u64, prefetch_size: usize) -> Result<TreeAdapter> {
        TreeAdapter::compile_with(&self.node, num_epochs, prefetch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;
    use crate::source::GeneratorSource;

    fn source(columns: &[&str]) -> Pipeline {
        let names: Vec<String> = strings(columns);
        Pipeline::from_source(Arc::new(GeneratorSource::new(columns, 2, move |i| {
            Ok(names.iter().map(|n| Column::scalar(n.clone(), i as f64, DType::F64)).collect())
        })))
    }

    fn identity(cols: Vec<Column>) -> Result<Vec<Column>> {
        Ok(cols)
    }

    #[test]
    fn test_map_output_replaces_first_input() {
        let names = strings(&["a", "b", "c"]);
        let plan = MapColumns::resolve(&names, &strings(&["b", "c"]), &strings(&["x"]), &[]).unwrap();
        assert_eq!(plan.output_names, strings(&["a", "x"]));
        assert_eq!(plan.insert_at, 1);
        let plan = MapColumns::resolve(&names, &[], &[], &strings(&["c", "a"])).unwrap();
        assert_eq!(plan.inputs, vec![0]);
        assert_eq!(plan.output_names, strings(&["c", "a"]));
    }

    #[test]
    fn test_validation_errors() {
        assert!(source(&["a"]).batch(0, false).node().output_columns().is_err());
        assert!(source(&["a"]).shuffle(0, 1).node().output_columns().is_err());
        assert!(source(&["a"]).project(&["b"]).node().output_columns().is_err());
        let zipped = source(&["a"]).zip(vec![source(&["a"])]);
        assert!(zipped.node().output_columns().is_err());
        let zipped = source(&["a"]).zip(vec![source(&["b"])]);
        assert_eq!(zipped.node().output_columns().unwrap(), strings(&["a", "b"]));
        assert!(source(&["a"]).map(identity, &["a"], &["a", "a"]).node().output_columns().is_err());
    }

    #[test]
    fn test_rename_and_tree_shape() {
        let p = source(&["a", "b"]).rename(&["a"], &["z"]).take(1);
        assert_eq!(p.node().output_columns().unwrap(), strings(&["z", "b"]));
        assert_eq!(p.node().size(), 3);
        assert_eq!(format!("{:?}", p.node()), "Take([Rename([Source])])");
    }
}
