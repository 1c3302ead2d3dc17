//! Pipeline Configuration Module
//!
//! Every knob of a training run: data locations, image and patch geometry,
//! contrastive-loss hyper-parameters, stage epoch ranges, optimizer settings
//! and the fold policy. Loadable from and savable to TOML; the CLI flags
//! override individual fields.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::contrastive::loss::ContrastiveConfig;
use crate::dataset::augmentation::PatchAugmentationConfig;
use crate::model::network::SegmentationNetConfig;
use crate::training::scheduler::PolynomialDecay;
use crate::utils::error::{Result, SslError};

/// Epoch range of one stage; epochs `start + 1 ..= end` are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEpochs {
    pub start: usize,
    pub end: usize,
}

impl StageEpochs {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn count(&self) -> usize {
        self.end.saturating_sub(self.start)
    }
}

impl Default for StageEpochs {
    fn default() -> Self {
        Self::new(0, 100)
    }
}

/// Epoch ranges of the three training stages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSchedule {
    pub pretraining: StageEpochs,
    pub reliable_st1: StageEpochs,
    pub reliable_st2: StageEpochs,
}

impl StageSchedule {
    /// Same `0..epochs` range for every stage
    pub fn uniform(epochs: usize) -> Self {
        let range = StageEpochs::new(0, epochs);
        Self {
            pretraining: range,
            reliable_st1: range,
            reliable_st2: range,
        }
    }
}

/// Labeled set that the reliable pseudo-labeled images are merged into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineBase {
    /// Training subset of the current fold
    #[default]
    FoldTrain,
    /// The whole labeled list
    AllLabeled,
}

/// Adam settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    pub weight_decay: f32,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 1e-5,
        }
    }
}

/// Optional polynomial learning-rate decay, stepped once per epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LrDecaySettings {
    pub enabled: bool,
    pub end_lr: f64,
    pub max_decay_steps: usize,
    pub power: f64,
}

impl Default for LrDecaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            end_lr: 1e-4,
            max_decay_steps: 200,
            power: 2.0,
        }
    }
}

/// Complete configuration of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root that split-file paths are resolved against
    pub dataset_path: PathBuf,
    /// Directory holding `<split>/labeled.txt` and `<split>/unlabeled.txt`
    pub output_dir: PathBuf,
    /// Split sub-directory name
    pub split: String,
    /// Where checkpoints and loss tables are written
    pub output_root: PathBuf,

    pub num_classes: usize,
    /// Whether class 0 takes part in the contrastive loss
    pub include_background: bool,
    pub img_size: usize,
    pub patch_size: usize,
    pub embedding_size: usize,
    pub base_filters: usize,

    pub batch_size: usize,
    /// Fixed contrastive weight for pretraining; 0 selects the dynamic schedule
    pub contrastive_weight: f64,
    /// Checkpoint every this many epochs
    pub save_interval: usize,
    /// Sub-batch size used when embedding patches
    pub embedding_chunk_size: usize,

    pub folds: usize,
    pub seed: u64,

    pub temperature: f64,
    pub lambda: f64,
    pub psi: usize,
    pub queue_capacity: usize,

    pub ema_alpha: f64,
    pub reliable_fraction: f64,
    /// Epochs between the restored student and the restored teacher
    pub teacher_lag: usize,

    /// Re-initialise student, teacher and optimizer at every fold after the first
    pub reset_between_folds: bool,
    pub combine_base: CombineBase,
    /// Write pseudo-label masks as PNGs next to the checkpoints
    pub save_pseudo_masks: bool,

    pub epochs: StageSchedule,
    pub augmentation: PatchAugmentationConfig,
    pub optimizer: OptimizerSettings,
    pub lr_decay: LrDecaySettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("dataset"),
            output_dir: PathBuf::from("dataset/splits/kidney"),
            split: "1-3".to_string(),
            output_root: PathBuf::from("output"),

            num_classes: 2,
            include_background: true,
            img_size: 224,
            patch_size: 14,
            embedding_size: 128,
            base_filters: 16,

            batch_size: 16,
            contrastive_weight: 0.0,
            save_interval: 2,
            embedding_chunk_size: 16,

            folds: 5,
            seed: 42,

            temperature: 0.2,
            lambda: 4.0,
            psi: 4096,
            queue_capacity: 10_000,

            ema_alpha: 0.001,
            reliable_fraction: 0.5,
            teacher_lag: 10,

            reset_between_folds: false,
            combine_base: CombineBase::FoldTrain,
            save_pseudo_masks: false,

            epochs: StageSchedule::default(),
            augmentation: PatchAugmentationConfig::default(),
            optimizer: OptimizerSettings::default(),
            lr_decay: LrDecaySettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file; missing fields take their defaults
    pub fn load_toml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SslError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            SslError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    pub fn save_toml(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject settings that cannot produce a run
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SslError::Config(msg));

        if self.num_classes < 2 {
            return fail("num_classes must be at least 2".to_string());
        }
        if self.img_size == 0 || self.img_size % 4 != 0 {
            return fail(format!("img_size must be a positive multiple of 4, got {}", self.img_size));
        }
        if self.patch_size < 4 || self.patch_size > self.img_size {
            return fail(format!(
                "patch_size must be in 4..={}, got {}",
                self.img_size, self.patch_size
            ));
        }
        if self.embedding_size == 0 || self.base_filters == 0 {
            return fail("embedding_size and base_filters must be positive".to_string());
        }
        if self.batch_size == 0 || self.embedding_chunk_size == 0 {
            return fail("batch_size and embedding_chunk_size must be positive".to_string());
        }
        if self.save_interval == 0 {
            return fail("save_interval must be positive".to_string());
        }
        if self.contrastive_weight < 0.0 {
            return fail("contrastive_weight must not be negative".to_string());
        }
        if self.folds < 2 {
            return fail("folds must be at least 2".to_string());
        }
        for (name, range) in [
            ("pretraining", self.epochs.pretraining),
            ("reliable_st1", self.epochs.reliable_st1),
            ("reliable_st2", self.epochs.reliable_st2),
        ] {
            if range.end < range.start {
                return fail(format!("{} epochs end before they start", name));
            }
        }
        if self.temperature <= 0.0 {
            return fail("temperature must be positive".to_string());
        }
        if self.psi == 0 || self.queue_capacity == 0 {
            return fail("psi and queue_capacity must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.ema_alpha) {
            return fail("ema_alpha must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.reliable_fraction) {
            return fail("reliable_fraction must be in [0, 1]".to_string());
        }
        if self.optimizer.learning_rate <= 0.0 {
            return fail("learning_rate must be positive".to_string());
        }
        Ok(())
    }

    pub fn labeled_list(&self) -> PathBuf {
        self.output_dir.join(&self.split).join("labeled.txt")
    }

    pub fn unlabeled_list(&self) -> PathBuf {
        self.output_dir.join(&self.split).join("unlabeled.txt")
    }

    pub fn network(&self) -> SegmentationNetConfig {
        SegmentationNetConfig::new()
            .with_num_classes(self.num_classes)
            .with_embedding_size(self.embedding_size)
            .with_base_filters(self.base_filters)
    }

    pub fn contrastive(&self) -> ContrastiveConfig {
        ContrastiveConfig {
            embedding_size: self.embedding_size,
            temperature: self.temperature,
            lambda: self.lambda,
            psi: self.psi,
        }
    }

    /// Per-epoch LR schedule; constant at the optimizer rate unless decay is enabled
    pub fn lr_schedule(&self) -> PolynomialDecay {
        if !self.lr_decay.enabled {
            return PolynomialDecay::constant(self.optimizer.learning_rate);
        }
        PolynomialDecay::new(
            self.optimizer.learning_rate,
            self.lr_decay.end_lr,
            self.lr_decay.max_decay_steps,
            self.lr_decay.power,
        )
    }
}
