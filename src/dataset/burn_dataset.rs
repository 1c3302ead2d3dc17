//! Burn Dataset Integration for segmentation samples
//!
//! Items are loaded once (in parallel) and shared behind `Arc`, so the
//! partitions the pipeline builds (fold subsets, reliable / remaining splits,
//! combined sets) never copy image data.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use crate::dataset::colormap::ColorMap;
use crate::dataset::loader::{DatasetStats, SampleEntry, SegmentationItem};
use crate::utils::error::{Result, SslError};

/// In-memory segmentation dataset
#[derive(Debug, Clone)]
pub struct SegmentationDataset {
    items: Vec<Arc<SegmentationItem>>,
    image_size: usize,
}

impl SegmentationDataset {
    /// Load every entry into memory using rayon
    ///
    /// A single unreadable image or mask fails the whole load.
    pub fn load(entries: &[SampleEntry], image_size: usize, colormap: &ColorMap) -> Result<Self> {
        let total = entries.len();
        tracing::info!("Loading {} samples at {}x{}", total, image_size, image_size);

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let loaded = AtomicUsize::new(0);

        let items: Result<Vec<_>> = entries
            .par_iter()
            .map(|entry| {
                let item = SegmentationItem::load(entry, image_size, colormap);
                let count = loaded.fetch_add(1, Ordering::Relaxed);
                if count % 16 == 0 {
                    pb.set_position(count as u64);
                }
                item.map(Arc::new)
            })
            .collect();

        let items = items?;
        pb.finish_with_message(format!("Loaded {} samples", items.len()));

        Ok(Self { items, image_size })
    }

    pub fn from_items(items: Vec<SegmentationItem>, image_size: usize) -> Self {
        Self {
            items: items.into_iter().map(Arc::new).collect(),
            image_size,
        }
    }

    pub fn empty(image_size: usize) -> Self {
        Self {
            items: Vec::new(),
            image_size,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn item(&self, index: usize) -> Option<&SegmentationItem> {
        self.items.get(index).map(|i| i.as_ref())
    }

    pub fn items(&self) -> impl Iterator<Item = &SegmentationItem> {
        self.items.iter().map(|i| i.as_ref())
    }

    /// Items at the given indices, in that order
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let items = indices
            .iter()
            .map(|&i| {
                self.items.get(i).cloned().ok_or_else(|| {
                    SslError::InvalidInput(format!(
                        "index {} out of range for dataset of {}",
                        i,
                        self.items.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            items,
            image_size: self.image_size,
        })
    }

    /// Concatenate datasets of the same image size
    pub fn concat(parts: &[&Self]) -> Result<Self> {
        let image_size = parts.first().map(|p| p.image_size).unwrap_or(0);
        if parts.iter().any(|p| p.image_size != image_size) {
            return Err(SslError::Dataset(
                "cannot concatenate datasets with different image sizes".to_string(),
            ));
        }
        Ok(Self {
            items: parts.iter().flat_map(|p| p.items.iter().cloned()).collect(),
            image_size,
        })
    }

    /// Same images paired with new masks, one per item
    pub fn with_masks(&self, masks: Vec<Option<Vec<u8>>>) -> Result<Self> {
        if masks.len() != self.items.len() {
            return Err(SslError::InvalidInput(format!(
                "{} masks for {} items",
                masks.len(),
                self.items.len()
            )));
        }
        let items = self
            .items
            .iter()
            .zip(masks)
            .map(|(item, mask)| Arc::new(item.with_mask(mask)))
            .collect();
        Ok(Self {
            items,
            image_size: self.image_size,
        })
    }

    pub fn stats(&self, num_classes: usize) -> DatasetStats {
        DatasetStats::from_items(self.items(), num_classes)
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        self.items.get(index).map(|i| i.as_ref().clone())
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A batch of images with optional masks
#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width], values in [0, 1]
    pub images: Tensor<B, 4>,
    /// Class-id masks with shape [batch_size, height, width]; `None` unless
    /// every item of the batch is labeled
    pub masks: Option<Tensor<B, 3, Int>>,
}

/// Batcher for segmentation items
#[derive(Clone, Debug)]
pub struct SegmentationBatcher {
    image_size: usize,
    channels: usize,
}

impl SegmentationBatcher {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            channels: 3,
        }
    }

    /// Batch borrowed items without cloning them first
    pub fn batch_refs<B: Backend>(
        &self,
        items: &[&SegmentationItem],
        device: &B::Device,
    ) -> SegmentationBatch<B> {
        let batch_size = items.len();
        let (h, w) = (self.image_size, self.image_size);

        let images_data: Vec<f32> = items
            .iter()
            .flat_map(|item| item.image.iter().copied())
            .collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, self.channels, h, w]),
            device,
        );

        let masks = if !items.is_empty() && items.iter().all(|i| i.is_labeled()) {
            let masks_data: Vec<i64> = items
                .iter()
                .flat_map(|item| item.mask.iter().flatten().map(|&c| c as i64))
                .collect();
            Some(Tensor::<B, 3, Int>::from_data(
                TensorData::new(masks_data, [batch_size, h, w]),
                device,
            ))
        } else {
            None
        };

        SegmentationBatch { images, masks }
    }
}

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let refs: Vec<&SegmentationItem> = items.iter().collect();
        self.batch_refs(&refs, device)
    }
}

/// Index order of one pass over a dataset, chunked into batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    batches: Vec<Vec<usize>>,
}

impl BatchPlan {
    /// Indices `0..len` in order
    pub fn sequential(len: usize, batch_size: usize, drop_last: bool) -> Self {
        Self::from_order((0..len).collect(), batch_size, drop_last)
    }

    /// Indices `0..len` in a random order
    pub fn shuffled<R: Rng>(len: usize, batch_size: usize, drop_last: bool, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(rng);
        Self::from_order(order, batch_size, drop_last)
    }

    fn from_order(order: Vec<usize>, batch_size: usize, drop_last: bool) -> Self {
        let batch_size = batch_size.max(1);
        let batches = order
            .chunks(batch_size)
            .filter(|chunk| !drop_last || chunk.len() == batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Self { batches }
    }

    /// Number of batches a plan over `len` items would have
    pub fn num_batches(len: usize, batch_size: usize, drop_last: bool) -> usize {
        let batch_size = batch_size.max(1);
        if drop_last {
            len / batch_size
        } else {
            len.div_ceil(batch_size)
        }
    }

    pub fn batches(&self) -> &[Vec<usize>] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray;

    fn synthetic(n: usize, labeled: bool) -> SegmentationDataset {
        let items = (0..n)
            .map(|i| {
                let mask = labeled.then(|| vec![(i % 2) as u8; 16]);
                SegmentationItem::from_data(format!("img{}", i), vec![i as f32 / n as f32; 48], mask, 4)
            })
            .collect();
        SegmentationDataset::from_items(items, 4)
    }

    #[test]
    fn test_subset_and_concat() {
        let ds = synthetic(6, true);
        let a = ds.subset(&[0, 2]).unwrap();
        let b = ds.subset(&[5]).unwrap();
        let joined = SegmentationDataset::concat(&[&a, &b]).unwrap();
        assert_eq!(joined.len(), 3);
        assert_eq!(joined.item(2).unwrap().id, "img5");
        assert!(ds.subset(&[6]).is_err());
    }

    #[test]
    fn test_with_masks() {
        let ds = synthetic(2, false);
        let labeled = ds.with_masks(vec![Some(vec![1; 16]), Some(vec![0; 16])]).unwrap();
        assert!(labeled.items().all(|i| i.is_labeled()));
        assert_eq!(labeled.item(0).unwrap().image, ds.item(0).unwrap().image);
        assert!(ds.with_masks(vec![None]).is_err());
    }

    #[test]
    fn test_batcher_shapes() {
        let device = Default::default();
        let ds = synthetic(3, true);
        let refs: Vec<&SegmentationItem> = ds.items().collect();
        let batch: SegmentationBatch<TestBackend> =
            SegmentationBatcher::new(4).batch_refs(&refs, &device);
        assert_eq!(batch.images.dims(), [3, 3, 4, 4]);
        assert_eq!(batch.masks.unwrap().dims(), [3, 4, 4]);

        let unlabeled = synthetic(2, false);
        let refs: Vec<&SegmentationItem> = unlabeled.items().collect();
        let batch: SegmentationBatch<TestBackend> =
            SegmentationBatcher::new(4).batch_refs(&refs, &device);
        assert!(batch.masks.is_none());
    }

    #[test]
    fn test_batch_plan_drop_last() {
        let plan = BatchPlan::sequential(10, 4, true);
        assert_eq!(plan.len(), 2);
        assert_eq!(BatchPlan::num_batches(10, 4, true), 2);

        let plan = BatchPlan::sequential(10, 4, false);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.batches()[2], vec![8, 9]);
        assert_eq!(BatchPlan::num_batches(10, 4, false), 3);
    }

    #[test]
    fn test_shuffled_plan_is_permutation() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let plan = BatchPlan::shuffled(9, 3, false, &mut rng);
        let mut all: Vec<usize> = plan.batches().iter().flatten().copied().collect();
        all.sort();
        assert_eq!(all, (0..9).collect::<Vec<_>>());
    }
}
