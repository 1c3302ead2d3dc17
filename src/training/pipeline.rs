//! K-fold stage orchestration
//!
//! Per fold of the labeled set:
//!
//! 1. `supervised-Pretraining` on the fold's training subset
//! 2. restore the stage's final student and lagged teacher, split the
//!    unlabeled set into reliable and remaining images
//! 3. merge the reliable images (with pseudo-labels) into the labeled base
//! 4. `SSL-reliable-st1` on the merged set
//! 5. restore again and pseudo-label the remaining images; stop the whole run
//!    if they cannot fill two full batches
//! 6. `SSL-reliable-st2` on the pseudo-labeled remaining images
//!
//! Student, teacher and optimizer carry over from fold to fold unless
//! `reset_between_folds` is set.

use burn::{
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, AdamConfig, Optimizer},
    tensor::backend::AutodiffBackend,
};
use chrono::Local;
use colored::Colorize;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::ExecutionContext;
use crate::dataset::{read_split_file, BatchPlan, ColorMap, KFold, SegmentationDataset};
use crate::model::config::{CombineBase, PipelineConfig};
use crate::model::network::SegmentationNet;
use crate::training::checkpoint::{restore_stage_models, CheckpointLayout};
use crate::training::reliable::{generate_pseudo_labels, select_reliable, write_pseudo_masks};
use crate::training::stage::StageKind;
use crate::training::trainer::{StageModels, StageReport, StageRunner};
use crate::utils::error::Result;

/// Minimum number of full batches the pseudo-labeled set must provide
pub const MIN_PSEUDO_BATCHES: usize = 2;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { folds: usize },
    StoppedEarly { fold: usize, reason: String },
}

/// Written to `<run_dir>/summary.json` when a run ends
#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    started_at: String,
    finished_at: String,
    outcome: String,
    reports: &'a [StageReport],
}

/// Labeled and unlabeled images of a run
#[derive(Debug, Clone)]
pub struct PipelineData {
    pub labeled: SegmentationDataset,
    pub unlabeled: SegmentationDataset,
}

impl PipelineData {
    /// Read the split lists and load every image and mask
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let colormap = ColorMap::kidney();
        let labeled_entries = read_split_file(&config.labeled_list(), &config.dataset_path, true)?;
        let unlabeled_entries =
            read_split_file(&config.unlabeled_list(), &config.dataset_path, false)?;
        info!(
            "Split {}: {} labeled, {} unlabeled entries",
            config.split,
            labeled_entries.len(),
            unlabeled_entries.len()
        );

        Ok(Self {
            labeled: SegmentationDataset::load(&labeled_entries, config.img_size, &colormap)?,
            unlabeled: SegmentationDataset::load(&unlabeled_entries, config.img_size, &colormap)?,
        })
    }
}

fn build_optimizer<B: AutodiffBackend>(config: &PipelineConfig) -> impl Optimizer<SegmentationNet<B>, B> {
    AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(config.optimizer.weight_decay)))
        .init()
}

/// Runs every fold of the semi-supervised schedule
pub struct SslPipeline {
    config: PipelineConfig,
    reports: Vec<StageReport>,
}

impl SslPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            reports: Vec::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reports of every stage run so far
    pub fn reports(&self) -> &[StageReport] {
        &self.reports
    }

    /// Load the configured splits and run
    pub fn run<B: AutodiffBackend>(&mut self, ctx: &ExecutionContext<B>) -> Result<PipelineOutcome> {
        let data = PipelineData::load(&self.config)?;
        self.run_with_data(&data, ctx)
    }

    /// Run on already loaded data
    pub fn run_with_data<B: AutodiffBackend>(
        &mut self,
        data: &PipelineData,
        ctx: &ExecutionContext<B>,
    ) -> Result<PipelineOutcome> {
        let started_at = Local::now().to_rfc3339();
        let outcome = self.run_folds(data, ctx)?;

        let layout = CheckpointLayout::new(
            &self.config.output_root,
            self.config.patch_size,
            self.config.contrastive_weight,
        );
        let summary = RunSummary {
            started_at,
            finished_at: Local::now().to_rfc3339(),
            outcome: match &outcome {
                PipelineOutcome::Completed { folds } => format!("completed {} folds", folds),
                PipelineOutcome::StoppedEarly { fold, reason } => {
                    format!("stopped at fold {}: {}", fold, reason)
                }
            },
            reports: &self.reports,
        };
        let path = layout.run_dir().join("summary.json");
        std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
        info!("Run summary saved to {:?}", path);

        Ok(outcome)
    }

    fn run_folds<B: AutodiffBackend>(
        &mut self,
        data: &PipelineData,
        ctx: &ExecutionContext<B>,
    ) -> Result<PipelineOutcome> {
        let config = self.config.clone();
        let inner_ctx = ExecutionContext::<B::InnerBackend>::new(ctx.device().clone());
        let layout = CheckpointLayout::new(&config.output_root, config.patch_size, config.contrastive_weight);
        config.save_toml(&layout.run_dir().join("config.toml"))?;

        let folds = KFold::new(config.folds, true, config.seed).split(data.labeled.len())?;
        let mut runner = StageRunner::new(&config)?;

        let mut models = StageModels::from_student(config.network().init::<B>(ctx.device()));
        let mut optimizer = build_optimizer::<B>(&config);

        println!("{}", "Semi-supervised patch-contrastive training".green().bold());
        println!("  📂 Run directory:   {:?}", layout.run_dir());
        println!("  🏷️  Labeled images:  {}", data.labeled.len());
        println!("  ❓ Unlabeled images: {}", data.unlabeled.len());
        println!("  🔁 Folds:           {}", folds.len());
        println!();

        for (fold, indices) in folds.iter().enumerate() {
            println!("{}", format!("══ Fold {}/{} ══", fold + 1, folds.len()).yellow().bold());

            if config.reset_between_folds && fold > 0 {
                info!("Re-initialising student, teacher and optimizer for fold {}", fold);
                models = StageModels::from_student(config.network().init::<B>(ctx.device()));
                optimizer = build_optimizer::<B>(&config);
            }

            let fold_train = data.labeled.subset(&indices.train)?;
            let fold_valid = data.labeled.subset(&indices.valid)?;

            // 1. supervised pretraining
            let stage = StageKind::SupervisedPretraining;
            let epochs = config.epochs.pretraining;
            let (trained, report) = runner.run_stage(
                models,
                &mut optimizer,
                &fold_train,
                &fold_valid,
                stage,
                fold,
                epochs,
                ctx,
            )?;
            self.reports.push(report);

            // 2. reliable split with the restored models
            let (student, teacher) = restore_stage_models(
                &layout,
                stage,
                fold,
                epochs.end,
                config.teacher_lag,
                trained.student,
                trained.teacher,
                ctx.device(),
                inner_ctx.device(),
            )?;
            let split = select_reliable(
                &student.valid(),
                &teacher,
                &data.unlabeled,
                config.num_classes,
                config.reliable_fraction,
                config.batch_size,
                &inner_ctx,
            )?;
            let stats = split.stats();
            println!(
                "  🔍 Reliable: {} | Remaining: {} | mean agreement {:.4}",
                stats.reliable, stats.remaining, stats.mean_score
            );

            // 3. merge reliable images into the labeled base
            let base = match config.combine_base {
                CombineBase::FoldTrain => &fold_train,
                CombineBase::AllLabeled => &data.labeled,
            };
            let combined = SegmentationDataset::concat(&[base, &split.reliable])?;

            // 4. first SSL stage
            let stage = StageKind::SslReliableSt1;
            let epochs = config.epochs.reliable_st1;
            let (trained, report) = runner.run_stage(
                StageModels { student, teacher },
                &mut optimizer,
                &combined,
                &fold_valid,
                stage,
                fold,
                epochs,
                ctx,
            )?;
            self.reports.push(report);

            // 5. pseudo-label the remaining images
            if split.remaining.len() < config.batch_size {
                warn!(
                    "Remaining set ({}) is smaller than the batch size ({})",
                    split.remaining.len(),
                    config.batch_size
                );
            }
            let (student, teacher) = restore_stage_models(
                &layout,
                stage,
                fold,
                epochs.end,
                config.teacher_lag,
                trained.student,
                trained.teacher,
                ctx.device(),
                inner_ctx.device(),
            )?;
            let pseudo = generate_pseudo_labels(
                &student.valid(),
                &split.remaining,
                config.batch_size,
                &inner_ctx,
            )?;
            if config.save_pseudo_masks {
                let dir = layout.fold_dir(fold).join("pseudo_masks");
                let written = write_pseudo_masks(&pseudo, &dir, &ColorMap::kidney())?;
                info!("Wrote {} pseudo masks to {:?}", written, dir);
            }

            let batches = BatchPlan::num_batches(pseudo.len(), config.batch_size, true);
            if batches < MIN_PSEUDO_BATCHES {
                let reason = format!(
                    "pseudo-labeled set of {} images gives {} full batches of {}, need {}",
                    pseudo.len(),
                    batches,
                    config.batch_size,
                    MIN_PSEUDO_BATCHES
                );
                warn!("Stopping at fold {}: {}", fold, reason);
                println!("{} {}", "Stopping early:".red().bold(), reason);
                return Ok(PipelineOutcome::StoppedEarly { fold, reason });
            }

            // 6. second SSL stage
            let (trained, report) = runner.run_stage(
                StageModels { student, teacher },
                &mut optimizer,
                &pseudo,
                &fold_valid,
                StageKind::SslReliableSt2,
                fold,
                config.epochs.reliable_st2,
                ctx,
            )?;
            self.reports.push(report);
            models = trained;
            println!();
        }

        println!("{}", "Training Complete!".green().bold());
        Ok(PipelineOutcome::Completed { folds: folds.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SegmentationItem;
    use crate::model::config::StageSchedule;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestAutodiffBackend = Autodiff<NdArray>;

    const SIZE: usize = 16;

    fn item(i: usize, labeled: bool) -> SegmentationItem {
        let mut mask = vec![0u8; SIZE * SIZE];
        let mut image = vec![0.2f32; 3 * SIZE * SIZE];
        let offset = i % 3;
        for y in 3 + offset..11 + offset {
            for x in 4..12 {
                mask[y * SIZE + x] = 1;
                for c in 0..3 {
                    image[(c * SIZE + y) * SIZE + x] = 0.9;
                }
            }
        }
        SegmentationItem::from_data(format!("s{}", i), image, labeled.then_some(mask), SIZE)
    }

    fn data(labeled: usize, unlabeled: usize) -> PipelineData {
        PipelineData {
            labeled: SegmentationDataset::from_items((0..labeled).map(|i| item(i, true)).collect(), SIZE),
            unlabeled: SegmentationDataset::from_items(
                (0..unlabeled).map(|i| item(100 + i, false)).collect(),
                SIZE,
            ),
        }
    }

    fn config(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            output_root: root.to_path_buf(),
            img_size: SIZE,
            patch_size: 4,
            embedding_size: 8,
            base_filters: 2,
            batch_size: 2,
            folds: 2,
            psi: 8,
            queue_capacity: 16,
            save_interval: 1,
            teacher_lag: 1,
            epochs: StageSchedule::uniform(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_full_run_completes() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = SslPipeline::new(config(dir.path())).unwrap();
        let ctx = ExecutionContext::<TestAutodiffBackend>::new(Default::default());

        let outcome = pipeline.run_with_data(&data(8, 8), &ctx).unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed { folds: 2 });
        assert_eq!(pipeline.reports().len(), 6);
        assert!(dir.path().join("4-0").join("config.toml").exists());

        let summary = std::fs::read_to_string(dir.path().join("4-0").join("summary.json")).unwrap();
        let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(summary["reports"].as_array().map(|r| r.len()), Some(6));
        assert_eq!(summary["outcome"], "completed 2 folds");

        let layout = CheckpointLayout::new(dir.path(), 4, 0.0);
        for fold in 0..2 {
            for stage in StageKind::ALL {
                assert!(layout.exists(stage, 1, fold), "{} fold {}", stage, fold);
            }
        }
    }

    #[test]
    fn test_stops_when_remaining_too_small() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = SslPipeline::new(config(dir.path())).unwrap();
        let ctx = ExecutionContext::<TestAutodiffBackend>::new(Default::default());

        // 4 unlabeled: 2 reliable, 2 remaining, one batch only
        let outcome = pipeline.run_with_data(&data(8, 4), &ctx).unwrap();
        match outcome {
            PipelineOutcome::StoppedEarly { fold, .. } => assert_eq!(fold, 0),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(pipeline.reports().len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.folds = 1;
        assert!(SslPipeline::new(cfg).is_err());
    }
}
