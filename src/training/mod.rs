//! Training module for semi-supervised segmentation
//!
//! This module provides:
//! - Stage kinds and their contrastive-weight policy
//! - The per-stage training loop with EMA teacher and memory bank
//! - Reliable selection and pseudo-labeling of unlabeled images
//! - Checkpoint layout, saving and restoring
//! - Learning rate decay
//! - The k-fold stage orchestrator
//!
//! ## Semi-Supervised Learning Approach
//!
//! Per fold:
//! 1. Pretrain on labeled data (pixel cross-entropy + patch contrastive loss)
//! 2. Score unlabeled images by student/teacher agreement
//! 3. Train on labeled + reliable pseudo-labeled images
//! 4. Pseudo-label the remaining images and train on them

pub mod checkpoint;
pub mod pipeline;
pub mod reliable;
pub mod scheduler;
pub mod stage;
pub mod trainer;

// Re-export main types for convenience
pub use checkpoint::{restore_stage_models, CheckpointLayout};
pub use pipeline::{PipelineData, PipelineOutcome, SslPipeline};
pub use reliable::{generate_pseudo_labels, select_reliable, write_pseudo_masks, ReliableSplit};
pub use scheduler::PolynomialDecay;
pub use stage::{dynamic_weight, StageKind, WeightPolicy};
pub use trainer::{validate, StageModels, StageReport, StageRunner, ValidationReport};
