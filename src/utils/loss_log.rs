//! Per-epoch loss log
//!
//! One CSV file per (patch size, contrastive weight, stage, fold), one row per
//! epoch. The header is written when the file is first created so a resumed
//! stage keeps appending to the same table.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::error::Result;

/// CSV column names, in row order
pub const LOSS_LOG_COLUMNS: [&str; 14] = [
    "epoch",
    "t_total_loss",
    "t_supervised_loss",
    "t_contrastive_loss",
    "t_miou",
    "t_accuracy",
    "t_dice",
    "t_consistency_loss",
    "v_total_loss",
    "v_supervised_loss",
    "v_miou",
    "v_accuracy",
    "v_dice",
    "PatchCL_weight",
];

/// Train and validation statistics for one epoch of one stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub stage: String,
    pub fold: usize,
    pub train_total_loss: f64,
    pub train_supervised_loss: f64,
    pub train_contrastive_loss: f64,
    pub train_miou: f64,
    pub train_accuracy: f64,
    pub train_dice: f64,
    /// Kept as a column for compatibility with existing loss tables; always 0
    pub consistency_loss: f64,
    pub val_total_loss: f64,
    pub val_supervised_loss: f64,
    pub val_miou: f64,
    pub val_accuracy: f64,
    pub val_dice: f64,
    pub contrastive_weight: f64,
}

impl EpochRecord {
    /// Format as one CSV row (without trailing newline)
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{},{:.4},{:.4},{:.4},{:.4},{:.4},{}",
            self.epoch,
            self.train_total_loss,
            self.train_supervised_loss,
            self.train_contrastive_loss,
            self.train_miou,
            self.train_accuracy,
            self.train_dice,
            self.consistency_loss,
            self.val_total_loss,
            self.val_supervised_loss,
            self.val_miou,
            self.val_accuracy,
            self.val_dice,
            self.contrastive_weight,
        )
    }
}

/// Append-only CSV loss table
#[derive(Debug, Clone)]
pub struct LossLog {
    path: PathBuf,
}

impl LossLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<output_root>/loss_<run_tag>_<stage>-fold<fold>.csv`
    pub fn for_stage(
        output_root: &Path,
        patch_size: usize,
        contrastive_weight: f64,
        stage: &str,
        fold: usize,
    ) -> Self {
        let tag = super::run_tag(patch_size, contrastive_weight);
        Self::new(output_root.join(format!("loss_{}_{}-fold{}.csv", tag, stage, fold)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, creating the file (and its header) if needed
    pub fn append(&self, record: &EpochRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let is_new = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if is_new {
            writeln!(file, "{}", LOSS_LOG_COLUMNS.join(","))?;
        }
        writeln!(file, "{}", record.to_csv_row())?;
        Ok(())
    }

    /// Number of data rows currently in the file
    pub fn row_count(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content.lines().skip(1).filter(|l| !l.trim().is_empty()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(epoch: usize) -> EpochRecord {
        EpochRecord {
            epoch,
            stage: "supervised-Pretraining".to_string(),
            train_total_loss: 1.23456,
            contrastive_weight: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn test_file_name() {
        let log = LossLog::for_stage(Path::new("output"), 14, 0.0, "SSL-reliable-st1", 3);
        assert_eq!(
            log.path(),
            Path::new("output/loss_14-0_SSL-reliable-st1-fold3.csv")
        );
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let log = LossLog::new(dir.path().join("nested/loss.csv"));
        log.append(&record(1)).unwrap();
        log.append(&record(2)).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,t_total_loss"));
        assert!(lines[1].starts_with("1,1.2346,"));
        assert!(lines[2].ends_with(",0.1"));
        assert_eq!(log.row_count().unwrap(), 2);
    }

    #[test]
    fn test_row_has_every_column() {
        let row = record(5).to_csv_row();
        assert_eq!(row.split(',').count(), LOSS_LOG_COLUMNS.len());
    }
}
