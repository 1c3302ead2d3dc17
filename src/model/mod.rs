//! Model module for the segmentation network using the Burn framework
//!
//! This module provides:
//! - A small U-Net style encoder/decoder with a projection head for patch embeddings
//! - The exponential-moving-average teacher update
//! - The pipeline configuration
//!
//! ## Architecture
//!
//! One network serves two purposes:
//! - Per-pixel class logits (`ForwardMode::Segmentation`)
//! - L2-normalised patch embeddings for the contrastive loss (`ForwardMode::Embedding`)

pub mod config;
pub mod ema;
pub mod network;

// Re-export main types for convenience
pub use config::{CombineBase, PipelineConfig, StageEpochs, StageSchedule};
pub use ema::{ema_update, DEFAULT_EMA_ALPHA};
pub use network::{ForwardMode, NetworkOutput, SegmentationNet, SegmentationNetConfig};
