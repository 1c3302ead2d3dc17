//! Logging Module
//!
//! Structured logging through the `tracing` crate, plus a small stage logger
//! that reports per-epoch progress and timing for a training stage.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Subscriber settings for a training run
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: Level,
    /// Show module paths and thread ids on every line
    pub detailed: bool,
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            detailed: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Debug level with module paths, for `--verbose`
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            detailed: true,
            ..Self::default()
        }
    }

    /// Errors only, for `--quiet`
    pub fn quiet() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Filter directive for this config; burn and cubecl internals stay at warn
    fn directive(&self) -> String {
        let level = self.level.to_string().to_lowercase();
        format!("{level},burn=warn,cubecl=warn,patchcl_ssl={level}")
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level when it is set.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_ansi(config.ansi_colors)
                .with_target(config.detailed)
                .with_thread_ids(config.detailed),
        )
        .with(filter)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}

/// Per-stage progress logger
pub struct StageLogger {
    stage: String,
    fold: usize,
    end_epoch: usize,
    epochs_done: usize,
    epoch_start: Instant,
    stage_start: Instant,
}

impl StageLogger {
    pub fn new(stage: &str, fold: usize, end_epoch: usize) -> Self {
        Self {
            stage: stage.to_string(),
            fold,
            end_epoch,
            epochs_done: 0,
            epoch_start: Instant::now(),
            stage_start: Instant::now(),
        }
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch_start = Instant::now();
        tracing::debug!(
            "[{} fold {}] epoch {}/{} started",
            self.stage,
            self.fold,
            epoch,
            self.end_epoch
        );
    }

    /// Log end of an epoch with the headline numbers
    pub fn end_epoch(
        &mut self,
        epoch: usize,
        train_loss: f64,
        val_loss: f64,
        val_miou: f64,
        weight: f64,
    ) {
        self.epochs_done += 1;
        let remaining = self.end_epoch.saturating_sub(epoch);
        let avg = self.stage_start.elapsed().as_secs_f64() / self.epochs_done as f64;

        tracing::info!(
            "[{} fold {}] epoch {}/{} in {:.1}s | loss {:.4} | val loss {:.4} | val mIoU {:.4} | w {:.3} | ETA {:.0}s",
            self.stage,
            self.fold,
            epoch,
            self.end_epoch,
            self.epoch_start.elapsed().as_secs_f64(),
            train_loss,
            val_loss,
            val_miou,
            weight,
            remaining as f64 * avg
        );
    }

    pub fn finish(&self) {
        tracing::info!(
            "[{} fold {}] finished {} epochs in {:.1}s",
            self.stage,
            self.fold,
            self.epochs_done,
            self.stage_start.elapsed().as_secs_f64()
        );
    }
}
