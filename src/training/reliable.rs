//! Reliable selection and pseudo-labeling of unlabeled images
//!
//! ## Algorithm Overview
//!
//! 1. Student and teacher both segment every unlabeled image
//! 2. Each image is scored by the mean IoU between the two argmax masks
//! 3. The best-agreeing fraction becomes "reliable" and keeps the student's
//!    mask as its pseudo-label; the rest is "remaining"
//! 4. After the first SSL stage the remaining images get pseudo-labels from
//!    the retrained model

use std::cmp::Ordering;
use std::path::Path;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::ExecutionContext;
use crate::dataset::{BatchPlan, ColorMap, SegmentationBatcher, SegmentationDataset, SegmentationItem};
use crate::model::network::SegmentationNet;
use crate::training::trainer::argmax_classes;
use crate::utils::error::{Result, SslError};
use crate::utils::metrics::mask_iou;

/// Unlabeled images partitioned by student/teacher agreement
#[derive(Debug, Clone)]
pub struct ReliableSplit {
    /// Best-agreeing images, paired with the student's masks
    pub reliable: SegmentationDataset,
    /// All other images, without masks
    pub remaining: SegmentationDataset,
    /// Agreement score per input image, in input order
    pub scores: Vec<f64>,
}

/// Summary of a reliable split, for logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableStats {
    pub reliable: usize,
    pub remaining: usize,
    pub mean_score: f64,
    pub min_reliable_score: Option<f64>,
}

impl ReliableSplit {
    pub fn stats(&self) -> ReliableStats {
        let mean_score = if self.scores.is_empty() {
            0.0
        } else {
            self.scores.iter().sum::<f64>() / self.scores.len() as f64
        };
        let mut sorted = self.scores.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let min_reliable_score = self
            .reliable
            .len()
            .checked_sub(1)
            .and_then(|i| sorted.get(i).copied());

        ReliableStats {
            reliable: self.reliable.len(),
            remaining: self.remaining.len(),
            mean_score,
            min_reliable_score,
        }
    }
}

/// Argmax mask of every item, `H * W` class ids each, in dataset order
pub fn predict_masks<B: Backend>(
    model: &SegmentationNet<B>,
    dataset: &SegmentationDataset,
    batch_size: usize,
    ctx: &ExecutionContext<B>,
) -> Result<Vec<Vec<u8>>> {
    let batcher = SegmentationBatcher::new(dataset.image_size());
    let plane = dataset.image_size() * dataset.image_size();
    let mut masks = Vec::with_capacity(dataset.len());

    for indices in BatchPlan::sequential(dataset.len(), batch_size, false).batches() {
        let items: Vec<&SegmentationItem> =
            indices.iter().filter_map(|&i| dataset.item(i)).collect();
        let batch = batcher.batch_refs::<B>(&items, ctx.device());
        let classes = argmax_classes(model.forward_probabilities(batch.images))?;
        if classes.len() != items.len() * plane {
            return Err(SslError::Model(format!(
                "expected {} predicted pixels, got {}",
                items.len() * plane,
                classes.len()
            )));
        }
        masks.extend(
            classes
                .chunks(plane)
                .map(|mask| mask.iter().map(|&c| c as u8).collect::<Vec<u8>>()),
        );
    }

    Ok(masks)
}

/// Split unlabeled images into reliable and remaining sets
///
/// The top `ceil(fraction * N)` images by score are reliable. Ties keep the
/// input order, so the split is deterministic for fixed models.
#[allow(clippy::too_many_arguments)]
pub fn select_reliable<B: Backend>(
    student: &SegmentationNet<B>,
    teacher: &SegmentationNet<B>,
    unlabeled: &SegmentationDataset,
    num_classes: usize,
    fraction: f64,
    batch_size: usize,
    ctx: &ExecutionContext<B>,
) -> Result<ReliableSplit> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(SslError::InvalidInput(format!(
            "reliable fraction must be in [0, 1], got {}",
            fraction
        )));
    }

    let student_masks = predict_masks(student, unlabeled, batch_size, ctx)?;
    let teacher_masks = predict_masks(teacher, unlabeled, batch_size, ctx)?;

    let scores: Vec<f64> = student_masks
        .iter()
        .zip(&teacher_masks)
        .map(|(s, t)| {
            let s: Vec<i64> = s.iter().map(|&c| c as i64).collect();
            let t: Vec<i64> = t.iter().map(|&c| c as i64).collect();
            mask_iou(&s, &t, num_classes)
        })
        .collect();

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

    let n_reliable = ((fraction * scores.len() as f64).ceil() as usize).min(scores.len());
    let (reliable_idx, remaining_idx) = order.split_at(n_reliable);

    let reliable_masks = reliable_idx
        .iter()
        .map(|&i| Some(student_masks[i].clone()))
        .collect();
    let reliable = unlabeled.subset(reliable_idx)?.with_masks(reliable_masks)?;
    let remaining = unlabeled
        .subset(remaining_idx)?
        .with_masks(vec![None; remaining_idx.len()])?;

    info!(
        "Reliable split: {} reliable, {} remaining of {} unlabeled images",
        reliable.len(),
        remaining.len(),
        unlabeled.len()
    );

    Ok(ReliableSplit {
        reliable,
        remaining,
        scores,
    })
}

/// Pair every image with the model's argmax mask
pub fn generate_pseudo_labels<B: Backend>(
    model: &SegmentationNet<B>,
    dataset: &SegmentationDataset,
    batch_size: usize,
    ctx: &ExecutionContext<B>,
) -> Result<SegmentationDataset> {
    let masks = predict_masks(model, dataset, batch_size, ctx)?;
    let labeled = dataset.with_masks(masks.into_iter().map(Some).collect())?;
    info!("Generated pseudo-labels for {} images", labeled.len());
    Ok(labeled)
}

/// Write pseudo-label masks as colour-map PNGs; returns the number written
pub fn write_pseudo_masks(dataset: &SegmentationDataset, dir: &Path, colormap: &ColorMap) -> Result<usize> {
    std::fs::create_dir_all(dir)?;
    let mut written = 0;

    for (index, item) in dataset.items().enumerate() {
        let Some(mask) = &item.mask else {
            continue;
        };
        let stem = Path::new(&item.id)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("sample_{}", index));
        let path = dir.join(format!("{}.png", stem));

        let size = item.size as u32;
        colormap.encode(mask, size, size).save(&path)?;
        debug!("Wrote pseudo mask {:?}", path);
        written += 1;
    }

    Ok(written)
}
