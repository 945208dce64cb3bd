//! Batch loading
//!
//! A [`BatchLoader`] yields one shuffled pass over its dataset as fixed-size
//! batches, then returns `None`. Exhausted loaders must be explicitly
//! restarted by the caller; the trainer owns that decision, the loader never
//! self-renews.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::Dataset;
use crate::error::{Error, Result};

/// One stacked batch of samples
pub struct Batch {
    /// `[B, C, H, W]` f32 images on the loader's device
    pub images: Tensor,
    /// `[B]` u32 labels on the loader's device
    pub labels: Tensor,
    /// Number of samples in this batch
    pub batch_size: usize,
}

/// Restartable producer of shuffled fixed-size batches
pub struct BatchLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    device: Device,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl BatchLoader {
    /// Create a loader over `dataset`. The first pass is already shuffled.
    pub fn new(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        shuffle: bool,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::invalid_input("batch size must be positive"));
        }
        let mut loader = Self {
            order: (0..dataset.len()).collect(),
            dataset,
            batch_size,
            shuffle,
            device,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        loader.restart();
        Ok(loader)
    }

    /// Number of samples behind this loader.
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Number of batches in one full pass (final partial batch included).
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Begin a fresh pass: reshuffle the visit order and rewind.
    pub fn restart(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
        debug!(samples = self.order.len(), "loader restarted");
    }

    /// Stack the next batch, or `None` once the pass is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let mut images = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            let (image, label) = self.dataset.get(index)?;
            images.push(image);
            labels.push(label);
        }

        let batch_size = images.len();
        let images = Tensor::stack(&images, 0)?.to_device(&self.device)?;
        let labels = Tensor::from_vec(labels, batch_size, &self.device)?;

        Ok(Some(Batch {
            images,
            labels,
            batch_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::synthetic_dataset;

    fn loader(len: usize, batch_size: usize) -> BatchLoader {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_dataset(len, 4, 2));
        BatchLoader::new(dataset, batch_size, true, Device::Cpu, 13).unwrap()
    }

    fn drain_labels(loader: &mut BatchLoader) -> Vec<u32> {
        let mut labels = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            labels.extend(batch.labels.to_vec1::<u32>().unwrap());
        }
        labels
    }

    #[test]
    fn test_full_pass_visits_each_sample_once() {
        let mut loader = loader(8, 5);
        let mut labels = drain_labels(&mut loader);
        assert_eq!(labels.len(), 8);
        labels.sort_unstable();
        // 8 samples over 2 classes: four of each.
        assert_eq!(labels, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_final_partial_batch_is_yielded() {
        let mut loader = loader(8, 5);
        let first = loader.next_batch().unwrap().unwrap();
        assert_eq!(first.batch_size, 5);
        assert_eq!(first.images.dims(), &[5, 3, 4, 4]);

        let second = loader.next_batch().unwrap().unwrap();
        assert_eq!(second.batch_size, 3);

        assert!(loader.next_batch().unwrap().is_none());
        // Exhausted loaders stay exhausted until restarted.
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_restart_yields_fresh_full_pass() {
        let mut loader = loader(16, 4);
        let first_pass = drain_labels(&mut loader);
        assert!(loader.next_batch().unwrap().is_none());

        loader.restart();
        let second_pass = drain_labels(&mut loader);
        assert_eq!(second_pass.len(), first_pass.len());
    }

    #[test]
    fn test_restart_reshuffles_order() {
        let mut loader = loader(64, 64);
        let first = loader.order.clone();
        loader.restart();
        // A 64-element reshuffle matching exactly is vanishingly unlikely.
        assert_ne!(loader.order, first);
    }

    #[test]
    fn test_empty_dataset_yields_nothing() {
        let mut loader = loader(0, 4);
        assert_eq!(loader.num_batches(), 0);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_dataset(4, 4, 2));
        assert!(BatchLoader::new(dataset, 0, true, Device::Cpu, 1).is_err());
    }
}
