// Transform — column operations run by Map nodes
//
// A transform takes the map's input columns, in the order the map names
// them, and returns its output columns. Any closure of the right shape is a
// transform, so ad-hoc maps need no new type.

use marten_core::{DType, Error, Result};

use crate::dataset::Column;

pub trait Transform: Send + Sync {
    fn apply(&self, columns: Vec<Column>) -> Result<Vec<Column>>;

    fn name(&self) -> &str {
        "transform"
    }
}

impl<F> Transform for F
where
    F: Fn(Vec<Column>) -> Result<Vec<Column>> + Send + Sync,
{
    fn apply(&self, columns: Vec<Column>) -> Result<Vec<Column>> {
        self(columns)
    }
}

fn expect_one(columns: Vec<Column>, op: &str) -> Result<Column> {
    let n = columns.len();
    let mut it = columns.into_iter();
    match (it.next(), it.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(Error::msg(format!("{op} takes exactly one column, got {n}"))),
    }
}

/// Divide every value by `scale` (pixels: `Normalize::new(255.0)`).
#[derive(Debug, Clone)]
pub struct Normalize {
    scale: f64,
}

impl Normalize {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }
}

impl Transform for Normalize {
    fn apply(&self, mut columns: Vec<Column>) -> Result<Vec<Column>> {
        for c in &mut columns {
            c.data.iter_mut().for_each(|v| *v /= self.scale);
        }
        Ok(columns)
    }

    fn name(&self) -> &str {
        "Normalize"
    }
}

/// Encode a class index column as a one-hot vector of `num_classes`.
///
/// A `[n]` column of indices becomes `[n, num_classes]`; out-of-range
/// indices are an error.
#[derive(Debug, Clone)]
pub struct OneHot {
    pub num_classes: usize,
}

impl OneHot {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl Transform for OneHot {
    fn apply(&self, columns: Vec<Column>) -> Result<Vec<Column>> {
        let col = expect_one(columns, "OneHot")?;
        let mut data = vec![0.0; col.data.len() * self.num_classes];
        for (i, &v) in col.data.iter().enumerate() {
            if v < 0.0 || v as usize >= self.num_classes || v.fract() != 0.0 {
                return Err(Error::msg(format!(
                    "OneHot: class {v} in column '{}' out of range for {} classes",
                    col.name, self.num_classes
                )));
            }
            data[i * self.num_classes + v as usize] = 1.0;
        }
        let mut shape = col.shape.clone();
        if shape.last() == Some(&1) {
            shape.pop();
        }
        shape.push(self.num_classes);
        Ok(vec![Column::new(col.name, data, shape, col.dtype)?])
    }

    fn name(&self) -> &str {
        "OneHot"
    }
}

/// Change the dtype of every column, rounding toward zero for integer
/// targets.
#[derive(Debug, Clone)]
pub struct TypeCast {
    pub dtype: DType,
}

impl TypeCast {
    pub fn new(dtype: DType) -> Self {
        Self { dtype }
    }
}

impl Transform for TypeCast {
    fn apply(&self, mut columns: Vec<Column>) -> Result<Vec<Column>> {
        for c in &mut columns {
            if !self.dtype.is_float() {
                c.data.iter_mut().for_each(|v| *v = v.trunc());
            }
            c.dtype = self.dtype;
        }
        Ok(columns)
    }

    fn name(&self) -> &str {
        "TypeCast"
    }
}

/// Give a column a new shape with the same element count.
#[derive(Debug, Clone)]
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl Reshape {
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape }
    }
}

impl Transform for Reshape {
    fn apply(&self, columns: Vec<Column>) -> Result<Vec<Column>> {
        let col = expect_one(columns, "Reshape")?;
        let count: usize = self.shape.iter().product();
        if count != col.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: col.elem_count(),
                dst: count,
                dst_shape: self.shape.clone().into(),
            });
        }
        Ok(vec![Column {
            shape: self.shape.clone(),
            ..col
        }])
    }

    fn name(&self) -> &str {
        "Reshape"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data: &[f64], shape: &[usize]) -> Column {
        Column::new(name, data.to_vec(), shape.to_vec(), DType::F64).unwrap()
    }

    #[test]
    fn test_one_hot_replaces_trailing_unit_dim() {
        let out = OneHot::new(3).apply(vec![col("label", &[2.0], &[1])]).unwrap();
        assert_eq!(out[0].shape, vec![3]);
        assert_eq!(out[0].data, vec![0.0, 0.0, 1.0]);
        assert!(OneHot::new(3).apply(vec![col("label", &[3.0], &[1])]).is_err());
        assert!(OneHot::new(3).apply(Vec::new()).is_err());
    }

    #[test]
    fn test_closures_are_transforms() {
        let double = |cols: Vec<Column>| -> Result<Vec<Column>> {
            Ok(cols
                .into_iter()
                .map(|mut c| {
                    c.data.iter_mut().for_each(|v| *v *= 2.0);
                    c
                })
                .collect())
        };
        let out = double.apply(vec![col("x", &[1.0, 2.0], &[2])]).unwrap();
        assert_eq!(out[0].data, vec![2.0, 4.0]);
    }

    #[test]
    fn test_cast_and_reshape() {
        let out = TypeCast::new(DType::I64).apply(vec![col("x", &[1.7, -2.2], &[2])]).unwrap();
        assert_eq!(out[0].data, vec![1.0, -2.0]);
        assert_eq!(out[0].dtype, DType::I64);
        let out = Reshape::new(vec![2, 1]).apply(vec![col("x", &[1.0, 2.0], &[2])]).unwrap();
        assert_eq!(out[0].shape, vec![2, 1]);
        assert!(Reshape::new(vec![3]).apply(vec![col("x", &[1.0, 2.0], &[2])]).is_err());
    }
}
