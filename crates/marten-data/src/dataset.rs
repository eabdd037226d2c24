// Dataset trait and the row values that flow through a pipeline

use std::fmt;

use marten_core::{DType, Error, Result};

/// One named tensor value of a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl Column {
    pub fn new(name: impl Into<String>, data: Vec<f64>, shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: shape.into(),
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            data,
            shape,
            dtype,
        })
    }

    /// A 0-d column.
    pub fn scalar(name: impl Into<String>, value: f64, dtype: DType) -> Self {
        Self {
            name: name.into(),
            data: vec![value],
            shape: Vec::new(),
            dtype,
        }
    }

    /// The same values under another name.
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn elem_count(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{:?}", self.name, self.dtype, self.shape)
    }
}

/// The columns of one row. An empty row marks the end of an epoch.
pub type Row = Vec<Column>;

/// A single sample: a pair of (input features, label/target).
///
/// Both are stored flattened with their shapes so they can be batched into
/// tensors later.
#[derive(Debug, Clone)]
pub struct Sample {
    pub features: Vec<f64>,
    /// e.g. `[784]` for a flat image, `[3, 32, 32]` for a colour one.
    pub feature_shape: Vec<usize>,
    /// For classification, a single-element vec holding the class index.
    pub target: Vec<f64>,
    pub target_shape: Vec<usize>,
}

impl Sample {
    /// The sample as a `features`, `target` row.
    pub fn into_row(self, dtype: DType) -> Result<Row> {
        Ok(vec![
            Column::new("features", self.features, self.feature_shape, dtype)?,
            Column::new("target", self.target, self.target_shape, dtype)?,
        ])
    }
}

/// A dataset is an indexed collection of samples.
///
/// Implementations must be `Send + Sync` so pipelines can read from worker
/// threads.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sample at `index`; out-of-range indices are an error.
    fn get(&self, index: usize) -> Result<Sample>;

    /// Shape of one feature sample, without the batch dim.
    fn feature_shape(&self) -> &[usize];

    fn target_shape(&self) -> &[usize];

    fn name(&self) -> &str {
        "dataset"
    }
}

pub(crate) fn out_of_range(what: &str, index: usize, len: usize) -> Error {
    Error::msg(format!("{what}: index {index} out of range for {len} samples"))
}
