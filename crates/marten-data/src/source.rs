// Row sources — the leaves of a pipeline

use std::sync::Arc;

use marten_core::{DType, Error, Result};

use crate::dataset::{Dataset, Row};

/// Random-access rows with a fixed column list.
pub trait RowSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn column_names(&self) -> Vec<String>;

    fn row(&self, index: usize) -> Result<Row>;
}

/// A [`Dataset`] read as `features`, `target` rows.
pub struct DatasetSource {
    dataset: Arc<dyn Dataset>,
    dtype: DType,
}

impl DatasetSource {
    pub fn new(dataset: Arc<dyn Dataset>, dtype: DType) -> Self {
        Self { dataset, dtype }
    }
}

impl RowSource for DatasetSource {
    fn len(&self) -> usize {
        self.dataset.len()
    }

    fn column_names(&self) -> Vec<String> {
        vec!["features".to_string(), "target".to_string()]
    }

    fn row(&self, index: usize) -> Result<Row> {
        self.dataset.get(index)?.into_row(self.dtype)
    }
}

type RowFn = Arc<dyn Fn(usize) -> Result<Row> + Send + Sync>;

/// Rows computed by a closure over the row index.
///
/// ```ignore
/// let squares = GeneratorSource::new(&["x"], 4, |i| {
///     Ok(vec![Column::scalar("x", (i * i) as f64, DType::F64)])
/// });
/// ```
pub struct GeneratorSource {
    columns: Vec<String>,
    len: usize,
    func: RowFn,
}

impl GeneratorSource {
    pub fn new<F>(columns: &[&str], len: usize, func: F) -> Self
    where
        F: Fn(usize) -> Result<Row> + Send + Sync + 'static,
    {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            len,
            func: Arc::new(func),
        }
    }
}

impl RowSource for GeneratorSource {
    fn len(&self) -> usize {
        self.len
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn row(&self, index: usize) -> Result<Row> {
        let row = (self.func)(index)?;
        let names: Vec<&str> = row.iter().map(|c| c.name.as_str()).collect();
        if names.len() != self.columns.len() || names.iter().zip(&self.columns).any(|(a, b)| a != b) {
            return Err(Error::msg(format!(
                "generator row {index} has columns {names:?}, expected {:?}",
                self.columns
            )));
        }
        Ok(row)
    }
}
