//! Dataset module for segmentation data handling
//!
//! This module provides functionality for:
//! - Reading `labeled.txt` / `unlabeled.txt` split files
//! - Decoding colour-map masks into class ids (and back)
//! - Burn dataset and batcher types, plus epoch batch plans
//! - K-fold splitting of the labeled set
//! - Patch augmentation for the teacher view

pub mod augmentation;
pub mod burn_dataset;
pub mod colormap;
pub mod loader;
pub mod split;

// Re-export main types for convenience
pub use augmentation::{PatchAugmentationConfig, PatchAugmenter};
pub use burn_dataset::{BatchPlan, SegmentationBatch, SegmentationBatcher, SegmentationDataset};
pub use colormap::ColorMap;
pub use loader::{read_split_file, DatasetStats, SampleEntry, SegmentationItem};
pub use split::{FoldIndices, KFold};

/// Number of classes of the kidney dataset (background + kidney)
pub const NUM_CLASSES: usize = 2;
