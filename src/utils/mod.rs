//! Utilities module for logging, metrics, and helper functions
//!
//! This module provides:
//! - Structured logging with tracing
//! - Segmentation metrics (pixel accuracy, mIoU, Dice)
//! - The per-epoch CSV loss log
//! - Error handling types

pub mod error;
pub mod logging;
pub mod loss_log;
pub mod metrics;

// Re-export main types for convenience
pub use error::{Result, SslError};
pub use logging::init_logging;
pub use loss_log::{EpochRecord, LossLog};
pub use metrics::SegmentationMetrics;

/// Directory/file tag of one run: `<patch_size>-<contrastive_weight>`
///
/// Whole-number weights print without a fractional part (`14-0`, `14-0.5`, `14-2`).
pub fn run_tag(patch_size: usize, contrastive_weight: f64) -> String {
    format!("{}-{}", patch_size, contrastive_weight)
}

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_tag() {
        assert_eq!(run_tag(14, 0.0), "14-0");
        assert_eq!(run_tag(14, 2.0), "14-2");
        assert_eq!(run_tag(28, 0.5), "28-0.5");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.5), "30.5s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m");
    }
}
