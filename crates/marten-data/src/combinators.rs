// Dataset combinators: subset, concatenate, map, in-memory

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use marten_core::{Error, Result};

use crate::dataset::{out_of_range, Dataset, Sample};

/// A view of `inner` that exposes only the samples at `indices`.
pub struct SubsetDataset<D: Dataset> {
    inner: D,
    indices: Vec<usize>,
}

impl<D: Dataset> SubsetDataset<D> {
    pub fn new(inner: D, indices: Vec<usize>) -> Self {
        Self { inner, indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D: Dataset> Dataset for SubsetDataset<D> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let &inner = self
            .indices
            .get(index)
            .ok_or_else(|| out_of_range("subset", index, self.indices.len()))?;
        self.inner.get(inner)
    }

    fn feature_shape(&self) -> &[usize] {
        self.inner.feature_shape()
    }

    fn target_shape(&self) -> &[usize] {
        self.inner.target_shape()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Datasets end to end. All parts share the feature and target shapes.
pub struct ConcatDataset {
    datasets: Vec<Box<dyn Dataset>>,
    cumulative_sizes: Vec<usize>,
}

impl ConcatDataset {
    pub fn new(datasets: Vec<Box<dyn Dataset>>) -> Result<Self> {
        let first = datasets
            .first()
            .ok_or_else(|| Error::msg("ConcatDataset needs at least one dataset"))?;
        for ds in &datasets[1..] {
            if ds.feature_shape() != first.feature_shape() || ds.target_shape() != first.target_shape() {
                return Err(Error::SchemaMismatch {
                    column: "features".to_string(),
                    expected: format!("{:?} / {:?}", first.feature_shape(), first.target_shape()),
                    got: format!("{:?} / {:?}", ds.feature_shape(), ds.target_shape()),
                });
            }
        }
        let cumulative_sizes = datasets
            .iter()
            .scan(0, |total, ds| {
                *total += ds.len();
                Some(*total)
            })
            .collect();
        Ok(Self {
            datasets,
            cumulative_sizes,
        })
    }

    /// Which dataset a global index falls in, and the index inside it.
    fn locate(&self, index: usize) -> Option<(usize, usize)> {
        let ds_idx = self.cumulative_sizes.iter().position(|&cum| index < cum)?;
        let offset = if ds_idx == 0 { 0 } else { self.cumulative_sizes[ds_idx - 1] };
        Some((ds_idx, index - offset))
    }
}

impl Dataset for ConcatDataset {
    fn len(&self) -> usize {
        self.cumulative_sizes.last().copied().unwrap_or(0)
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let (ds_idx, local) = self
            .locate(index)
            .ok_or_else(|| out_of_range("concat", index, self.len()))?;
        self.datasets[ds_idx].get(local)
    }

    fn feature_shape(&self) -> &[usize] {
        self.datasets[0].feature_shape()
    }

    fn target_shape(&self) -> &[usize] {
        self.datasets[0].target_shape()
    }

    fn name(&self) -> &str {
        "concat"
    }
}

type SampleFn = Arc<dyn Fn(Sample) -> Result<Sample> + Send + Sync>;

/// Applies a function lazily on each `get()`.
pub struct MapDataset<D: Dataset> {
    inner: D,
    func: SampleFn,
    feature_shape: Vec<usize>,
    target_shape: Vec<usize>,
}

impl<D: Dataset> MapDataset<D> {
    /// `feature_shape` and `target_shape` describe samples after `func`.
    pub fn new<F>(inner: D, func: F, feature_shape: Vec<usize>, target_shape: Vec<usize>) -> Self
    where
        F: Fn(Sample) -> Result<Sample> + Send + Sync + 'static,
    {
        Self {
            inner,
            func: Arc::new(func),
            feature_shape,
            target_shape,
        }
    }

    /// A MapDataset whose function keeps the shapes.
    pub fn same_shape<F>(inner: D, func: F) -> Self
    where
        F: Fn(Sample) -> Result<Sample> + Send + Sync + 'static,
    {
        let feature_shape = inner.feature_shape().to_vec();
        let target_shape = inner.target_shape().to_vec();
        Self::new(inner, func, feature_shape, target_shape)
    }
}

impl<D: Dataset> Dataset for MapDataset<D> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        (self.func)(self.inner.get(index)?)
    }

    fn feature_shape(&self) -> &[usize] {
        &self.feature_shape
    }

    fn target_shape(&self) -> &[usize] {
        &self.target_shape
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// An in-memory dataset.
#[derive(Debug, Clone)]
pub struct VecDataset {
    samples: Vec<Sample>,
    feature_shape: Vec<usize>,
    target_shape: Vec<usize>,
    dataset_name: String,
}

impl VecDataset {
    pub fn new(samples: Vec<Sample>, name: &str) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| Error::msg("VecDataset needs at least one sample"))?;
        let feature_shape = first.feature_shape.clone();
        let target_shape = first.target_shape.clone();
        Ok(Self {
            samples,
            feature_shape,
            target_shape,
            dataset_name: name.to_string(),
        })
    }

    /// Build from row-major `[n, features...]` and `[n, targets...]` data.
    pub fn from_flat(
        features: &[f64],
        feature_shape: &[usize],
        targets: &[f64],
        target_shape: &[usize],
        name: &str,
    ) -> Result<Self> {
        let feat_per_sample: usize = feature_shape.iter().product();
        let tgt_per_sample: usize = target_shape.iter().product();
        if feat_per_sample == 0 || features.len() % feat_per_sample != 0 {
            return Err(Error::msg(format!(
                "VecDataset: {} feature values do not split into samples of {feature_shape:?}",
                features.len()
            )));
        }
        let n = features.len() / feat_per_sample;
        if targets.len() != n * tgt_per_sample {
            return Err(Error::msg(format!(
                "VecDataset: {n} samples need {} target values, got {}",
                n * tgt_per_sample,
                targets.len()
            )));
        }
        let samples = features
            .chunks(feat_per_sample)
            .zip(targets.chunks(tgt_per_sample.max(1)))
            .map(|(f, t)| Sample {
                features: f.to_vec(),
                feature_shape: feature_shape.to_vec(),
                target: t.to_vec(),
                target_shape: target_shape.to_vec(),
            })
            .collect();
        Ok(Self {
            samples,
            feature_shape: feature_shape.to_vec(),
            target_shape: target_shape.to_vec(),
            dataset_name: name.to_string(),
        })
    }
}

impl Dataset for VecDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| out_of_range(&self.dataset_name, index, self.samples.len()))
    }

    fn feature_shape(&self) -> &[usize] {
        &self.feature_shape
    }

    fn target_shape(&self) -> &[usize] {
        &self.target_shape
    }

    fn name(&self) -> &str {
        &self.dataset_name
    }
}

/// Split a dataset into (train, val) or (train, val, test) views.
///
/// `ratios` holds 2 or 3 fractions summing to 1; the last split takes the
/// remainder. Indices are shuffled with `seed`, so the split is
/// reproducible.
pub fn train_test_split<D>(dataset: D, ratios: &[f64], seed: u64) -> Result<Vec<SubsetDataset<D>>>
where
    D: Dataset + Clone,
{
    if !(2..=3).contains(&ratios.len()) {
        return Err(Error::msg(format!(
            "train_test_split: ratios must have 2 or 3 elements, got {}",
            ratios.len()
        )));
    }
    let sum: f64 = ratios.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(Error::msg(format!("train_test_split: ratios must sum to 1.0, got {sum}")));
    }

    let n = dataset.len();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut splits = Vec::with_capacity(ratios.len());
    let mut offset = 0;
    for (i, &ratio) in ratios.iter().enumerate() {
        let count = if i == ratios.len() - 1 {
            n - offset
        } else {
            (n as f64 * ratio).round() as usize
        };
        let end = (offset + count).min(n);
        splits.push(SubsetDataset::new(dataset.clone(), indices[offset..end].to_vec()));
        offset = end;
    }
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct TinyDataset {
        n: usize,
    }

    impl Dataset for TinyDataset {
        fn len(&self) -> usize {
            self.n
        }
        fn get(&self, idx: usize) -> Result<Sample> {
            if idx >= self.n {
                return Err(out_of_range("tiny", idx, self.n));
            }
            Ok(Sample {
                features: vec![idx as f64],
                feature_shape: vec![1],
                target: vec![(idx % 3) as f64],
                target_shape: vec![1],
            })
        }
        fn feature_shape(&self) -> &[usize] {
            &[1]
        }
        fn target_shape(&self) -> &[usize] {
            &[1]
        }
    }

    #[test]
    fn subset_dataset() {
        let sub = SubsetDataset::new(TinyDataset { n: 10 }, vec![2, 5, 7]);
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.get(1).unwrap().features[0], 5.0);
        assert!(sub.get(3).is_err());
    }

    #[test]
    fn concat_dataset() {
        let concat = ConcatDataset::new(vec![Box::new(TinyDataset { n: 5 }), Box::new(TinyDataset { n: 3 })]).unwrap();
        assert_eq!(concat.len(), 8);
        assert_eq!(concat.get(4).unwrap().features[0], 4.0);
        assert_eq!(concat.get(5).unwrap().features[0], 0.0);
        assert_eq!(concat.get(7).unwrap().features[0], 2.0);
        assert!(concat.get(8).is_err());
        assert!(ConcatDataset::new(Vec::new()).is_err());
    }

    #[test]
    fn map_dataset() {
        let mapped = MapDataset::same_shape(TinyDataset { n: 4 }, |mut s: Sample| {
            s.features.iter_mut().for_each(|v| *v /= 10.0);
            Ok(s)
        });
        assert!((mapped.get(2).unwrap().features[0] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn vec_dataset_from_flat() {
        let ds = VecDataset::from_flat(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2], &[0.0, 1.0, 0.0], &[1], "t").unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.get(1).unwrap().features, vec![3.0, 4.0]);
        assert!(VecDataset::from_flat(&[1.0, 2.0, 3.0], &[2], &[0.0], &[1], "t").is_err());
    }

    #[test]
    fn train_test_split_is_reproducible() {
        let a = train_test_split(TinyDataset { n: 50 }, &[0.8, 0.2], 123).unwrap();
        let b = train_test_split(TinyDataset { n: 50 }, &[0.8, 0.2], 123).unwrap();
        assert_eq!(a[0].len(), 40);
        assert_eq!(a[1].len(), 10);
        assert_eq!(a[0].indices(), b[0].indices());
        assert!(train_test_split(TinyDataset { n: 5 }, &[0.5, 0.6], 0).is_err());
    }
}
