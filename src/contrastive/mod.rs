//! Contrastive learning module
//!
//! This module provides:
//! - Per-class patch extraction from labeled masks
//! - Patch embedding through the network's projection head
//! - The per-class memory bank of teacher embeddings
//! - The patch-group contrastive loss (PCGJCL)

pub mod embeddings;
pub mod loss;
pub mod patches;
pub mod queue;

// Re-export main types for convenience
pub use embeddings::{extract_embeddings, ClassEmbeddings, GradientMode};
pub use loss::{pcgjcl_loss, ContrastiveConfig};
pub use patches::{ClassAligned, Patch, PatchExtractor};
pub use queue::{EmbeddingQueues, DEFAULT_QUEUE_CAPACITY};
