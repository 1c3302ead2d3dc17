//! # PatchCL SSL
//!
//! Semi-supervised medical image segmentation with patch-level contrastive
//! learning, built on the Burn framework.
//!
//! ## Features
//!
//! - **Patch-group contrastive loss** (PCGJCL) between student patch embeddings
//!   and a per-class memory bank of teacher embeddings
//! - **EMA teacher** that follows the student after every optimizer step
//! - **Reliable pseudo-labeling**: unlabeled images are ranked by student/teacher
//!   agreement and absorbed into training in two stages
//! - **K-fold orchestration** of the three training stages per fold
//!
//! ## Modules
//!
//! - `dataset`: split lists, colour-map masks, Burn dataset/batcher, k-fold, patch augmentation
//! - `contrastive`: patch extraction, embeddings, memory bank and the contrastive loss
//! - `model`: segmentation network, EMA update and pipeline configuration
//! - `training`: stage loop, reliable selection, checkpoints and the fold orchestrator
//! - `utils`: errors, logging, metrics and the CSV loss log
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use patchcl_ssl::backend::{ExecutionContext, TrainingBackend};
//! use patchcl_ssl::model::config::PipelineConfig;
//! use patchcl_ssl::training::SslPipeline;
//!
//! let config = PipelineConfig::load_toml("run.toml".as_ref())?;
//! let ctx = ExecutionContext::<TrainingBackend>::default_training();
//! let outcome = SslPipeline::new(config)?.run(&ctx)?;
//! ```

pub mod backend;
pub mod contrastive;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use backend::ExecutionContext;
pub use contrastive::{pcgjcl_loss, ContrastiveConfig, EmbeddingQueues, PatchExtractor};
pub use dataset::{SegmentationBatcher, SegmentationDataset, SegmentationItem};
pub use model::config::PipelineConfig;
pub use model::network::{ForwardMode, SegmentationNet, SegmentationNetConfig};
pub use training::{PipelineOutcome, SslPipeline, StageKind};
pub use utils::error::{Result, SslError};
pub use utils::metrics::SegmentationMetrics;

/// Default training image side length
pub const IMAGE_SIZE: usize = 224;

/// Default patch side length
pub const PATCH_SIZE: usize = 14;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
