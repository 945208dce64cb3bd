//! Dataset abstractions and train/validation splitting
//!
//! A [`Dataset`] is a finite, indexable collection of `(image, label)` pairs.
//! Images are CPU tensors in `[C, H, W]` layout with f32 values in `[0, 1]`;
//! batch loaders move them to the training device when stacking.

pub mod image_folder;
pub mod loader;

pub use image_folder::ImageFolderDataset;
pub use loader::{Batch, BatchLoader};

use std::sync::Arc;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use crate::error::{Error, Result};

/// A finite, indexable collection of labeled images
pub trait Dataset: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Whether the dataset holds no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct classes.
    fn num_classes(&self) -> usize;

    /// Fetch one sample: `[C, H, W]` f32 image tensor on the CPU plus label.
    fn get(&self, index: usize) -> Result<(Tensor, u32)>;
}

/// An index view over another dataset, used for train/validation splits
pub struct Subset {
    inner: Arc<dyn Dataset>,
    indices: Vec<usize>,
}

impl Subset {
    /// Create a view over `inner` restricted to `indices`.
    pub fn new(inner: Arc<dyn Dataset>, indices: Vec<usize>) -> Self {
        Self { inner, indices }
    }
}

impl Dataset for Subset {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn get(&self, index: usize) -> Result<(Tensor, u32)> {
        let mapped = *self.indices.get(index).ok_or_else(|| {
            Error::dataset(format!("subset index {index} out of range ({})", self.indices.len()))
        })?;
        self.inner.get(mapped)
    }
}

/// Split a dataset into disjoint train and validation subsets.
///
/// The split is a seeded shuffle followed by a cut at `floor(len * ratio)`,
/// so the same seed always reproduces the same membership.
pub fn random_split(
    dataset: Arc<dyn Dataset>,
    train_ratio: f64,
    seed: u64,
) -> (Subset, Subset) {
    let len = dataset.len();
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let train_len = ((len as f64) * train_ratio) as usize;
    let val_indices = indices.split_off(train_len);

    info!(
        total = len,
        train = indices.len(),
        validation = val_indices.len(),
        "dataset split"
    );

    (
        Subset::new(dataset.clone(), indices),
        Subset::new(dataset, val_indices),
    )
}

/// A dataset of pre-built tensors, for synthetic data and tests
pub struct InMemoryDataset {
    images: Vec<Tensor>,
    labels: Vec<u32>,
    num_classes: usize,
}

impl InMemoryDataset {
    /// Create a dataset from parallel image and label vectors.
    pub fn new(images: Vec<Tensor>, labels: Vec<u32>, num_classes: usize) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(Error::dataset(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        if let Some(label) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(Error::dataset(format!(
                "label {label} out of range for {num_classes} classes"
            )));
        }
        Ok(Self {
            images,
            labels,
            num_classes,
        })
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn get(&self, index: usize) -> Result<(Tensor, u32)> {
        let image = self.images.get(index).ok_or_else(|| {
            Error::dataset(format!("index {index} out of range ({})", self.images.len()))
        })?;
        Ok((image.clone(), self.labels[index]))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use candle_core::Device;

    /// Build a deterministic synthetic dataset of `len` samples.
    pub fn synthetic_dataset(len: usize, img_size: usize, num_classes: usize) -> InMemoryDataset {
        let mut images = Vec::with_capacity(len);
        let mut labels = Vec::with_capacity(len);
        for i in 0..len {
            let fill = i as f32 / len.max(1) as f32;
            let image = Tensor::full(fill, (3, img_size, img_size), &Device::Cpu).unwrap();
            images.push(image);
            labels.push((i % num_classes) as u32);
        }
        InMemoryDataset::new(images, labels, num_classes).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::synthetic_dataset;
    use super::*;

    #[test]
    fn test_split_is_disjoint_and_exhaustive() {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_dataset(10, 4, 2));
        let (train, val) = random_split(dataset, 0.8, 7);

        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);

        let mut seen: Vec<usize> = train
            .indices
            .iter()
            .chain(val.indices.iter())
            .copied()
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_reproducible() {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_dataset(20, 4, 2));
        let (a, _) = random_split(dataset.clone(), 0.5, 99);
        let (b, _) = random_split(dataset, 0.5, 99);
        assert_eq!(a.indices, b.indices);
    }

    #[test]
    fn test_subset_out_of_range() {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_dataset(4, 4, 2));
        let subset = Subset::new(dataset, vec![0, 1]);
        assert!(subset.get(2).is_err());
    }

    #[test]
    fn test_in_memory_dataset_validation() {
        let img = Tensor::zeros((3, 4, 4), candle_core::DType::F32, &candle_core::Device::Cpu)
            .unwrap();
        assert!(InMemoryDataset::new(vec![img.clone()], vec![0, 1], 2).is_err());
        assert!(InMemoryDataset::new(vec![img], vec![5], 2).is_err());
    }

    #[test]
    fn test_empty_split() {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_dataset(0, 4, 2));
        let (train, val) = random_split(dataset, 0.8, 1);
        assert!(train.is_empty());
        assert!(val.is_empty());
    }
}
