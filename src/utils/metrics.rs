//! Metrics Module for Segmentation Evaluation
//!
//! Pixel-level metrics accumulated over batches of hard masks:
//! - Pixel accuracy
//! - Mean intersection-over-union (mIoU)
//! - Mean Dice coefficient
//!
//! Classes that appear neither in the prediction nor in the target are left
//! out of the means.

use serde::{Deserialize, Serialize};

/// Pixel confusion matrix for semantic segmentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationMetrics {
    /// Number of classes
    pub num_classes: usize,

    /// Matrix data (row = target, column = predicted), row-major
    pub matrix: Vec<u64>,
}

impl SegmentationMetrics {
    /// Create an empty accumulator
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Accumulate one batch of flattened class-id masks
    ///
    /// Pixels whose class id is out of range are ignored.
    pub fn add_batch(&mut self, predictions: &[i64], targets: &[i64]) {
        let n = self.num_classes as i64;
        for (&pred, &target) in predictions.iter().zip(targets.iter()) {
            if pred < 0 || target < 0 || pred >= n || target >= n {
                continue;
            }
            self.matrix[target as usize * self.num_classes + pred as usize] += 1;
        }
    }

    /// Get a cell
    pub fn get(&self, target: usize, predicted: usize) -> u64 {
        if target < self.num_classes && predicted < self.num_classes {
            self.matrix[target * self.num_classes + predicted]
        } else {
            0
        }
    }

    /// Total number of pixels counted
    pub fn total(&self) -> u64 {
        self.matrix.iter().sum()
    }

    /// Fraction of correctly classified pixels
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: u64 = (0..self.num_classes).map(|c| self.get(c, c)).sum();
        correct as f64 / total as f64
    }

    /// (true positives, false positives, false negatives) for a class
    fn class_counts(&self, class: usize) -> (u64, u64, u64) {
        let tp = self.get(class, class);
        let fp: u64 = (0..self.num_classes)
            .filter(|&i| i != class)
            .map(|i| self.get(i, class))
            .sum();
        let fn_: u64 = (0..self.num_classes)
            .filter(|&i| i != class)
            .map(|i| self.get(class, i))
            .sum();
        (tp, fp, fn_)
    }

    /// IoU per class, `None` for classes absent from both prediction and target
    pub fn per_class_iou(&self) -> Vec<Option<f64>> {
        (0..self.num_classes)
            .map(|c| {
                let (tp, fp, fn_) = self.class_counts(c);
                let union = tp + fp + fn_;
                (union > 0).then(|| tp as f64 / union as f64)
            })
            .collect()
    }

    /// Dice per class, `None` for classes absent from both prediction and target
    pub fn per_class_dice(&self) -> Vec<Option<f64>> {
        (0..self.num_classes)
            .map(|c| {
                let (tp, fp, fn_) = self.class_counts(c);
                let denom = 2 * tp + fp + fn_;
                (denom > 0).then(|| 2.0 * tp as f64 / denom as f64)
            })
            .collect()
    }

    /// Mean IoU over present classes
    pub fn mean_iou(&self) -> f64 {
        mean_present(&self.per_class_iou())
    }

    /// Mean Dice over present classes
    pub fn dice(&self) -> f64 {
        mean_present(&self.per_class_dice())
    }

    /// Add the counts of another accumulator with the same class count
    pub fn merge(&mut self, other: &SegmentationMetrics) {
        if other.num_classes != self.num_classes {
            tracing::warn!(
                "Ignoring metrics merge with {} classes into {} classes",
                other.num_classes,
                self.num_classes
            );
            return;
        }
        for (a, b) in self.matrix.iter_mut().zip(other.matrix.iter()) {
            *a += b;
        }
    }
}

fn mean_present(values: &[Option<f64>]) -> f64 {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    }
}

/// Mean IoU between two hard masks of one image
///
/// Averaged over the classes present in either mask; two masks that contain
/// no class at all agree perfectly.
pub fn mask_iou(a: &[i64], b: &[i64], num_classes: usize) -> f64 {
    let mut metrics = SegmentationMetrics::new(num_classes);
    metrics.add_batch(a, b);
    if metrics.total() == 0 {
        return 1.0;
    }
    metrics.mean_iou()
}

impl std::fmt::Display for SegmentationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acc {:.2}% | mIoU {:.4} | Dice {:.4}",
            self.accuracy() * 100.0,
            self.mean_iou(),
            self.dice()
        )
    }
}

/// Running average for tracking losses during training
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Current average, 0 when nothing has been added
    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
