//! Stage training loop
//!
//! One call to [`StageRunner::run_stage`] trains the student for the epochs
//! of one stage. Per step the labeled batch yields class patches, the
//! teacher embeds an augmented view of them into the memory bank, and the
//! student is optimised on pixel cross-entropy plus the weighted
//! patch-group contrastive loss. The teacher then follows the student by EMA.

use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::ExecutionContext;
use crate::contrastive::{
    extract_embeddings, pcgjcl_loss, ContrastiveConfig, EmbeddingQueues, GradientMode,
    PatchExtractor,
};
use crate::dataset::{
    BatchPlan, PatchAugmenter, SegmentationBatcher, SegmentationDataset, SegmentationItem,
};
use crate::model::config::{PipelineConfig, StageEpochs};
use crate::model::ema::ema_update;
use crate::model::network::SegmentationNet;
use crate::training::checkpoint::CheckpointLayout;
use crate::training::stage::{StageKind, WeightPolicy};
use crate::utils::error::{Result, SslError};
use crate::utils::logging::StageLogger;
use crate::utils::loss_log::{EpochRecord, LossLog};
use crate::utils::metrics::{RunningAverage, SegmentationMetrics};

/// Student and EMA teacher; the teacher lives on the inner backend and never
/// sees gradients
#[derive(Debug, Clone)]
pub struct StageModels<B: AutodiffBackend> {
    pub student: SegmentationNet<B>,
    pub teacher: SegmentationNet<B::InnerBackend>,
}

impl<B: AutodiffBackend> StageModels<B> {
    /// Teacher starts as an exact copy of the student
    pub fn from_student(student: SegmentationNet<B>) -> Self {
        let teacher = student.valid();
        Self { student, teacher }
    }
}

/// Validation summary of one pass over a dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Per-sample average cross-entropy
    pub loss: f64,
    pub miou: f64,
    pub accuracy: f64,
    pub dice: f64,
    pub samples: usize,
}

/// Outcome of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageKind,
    pub fold: usize,
    pub epochs_run: usize,
    pub last_train_loss: f64,
    pub last_validation: Option<ValidationReport>,
}

impl StageReport {
    fn skipped(stage: StageKind, fold: usize) -> Self {
        Self {
            stage,
            fold,
            epochs_run: 0,
            last_train_loss: 0.0,
            last_validation: None,
        }
    }
}

/// Pixel-wise cross-entropy of `[N, C, H, W]` logits against `[N, H, W]` class ids
pub fn pixel_cross_entropy<B: Backend>(logits: Tensor<B, 4>, masks: Tensor<B, 3, Int>) -> Tensor<B, 1> {
    let [n, c, h, w] = logits.dims();
    let flat_logits = logits.swap_dims(1, 2).swap_dims(2, 3).reshape([n * h * w, c]);
    let flat_targets = masks.reshape([n * h * w]);
    CrossEntropyLossConfig::new()
        .init(&flat_logits.device())
        .forward(flat_logits, flat_targets)
}

/// Host copy of an integer tensor
pub(crate) fn int_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| SslError::TensorData(format!("{:?}", e)))
}

/// Argmax class ids `[N * H * W]` of segmentation logits
pub(crate) fn argmax_classes<B: Backend>(logits: Tensor<B, 4>) -> Result<Vec<i64>> {
    int_values(logits.argmax(1))
}

/// Run a model over a dataset without gradients and measure it
///
/// Batches keep the partial last batch so every sample is scored.
pub fn validate<B: Backend>(
    model: &SegmentationNet<B>,
    dataset: &SegmentationDataset,
    batch_size: usize,
    ctx: &ExecutionContext<B>,
) -> Result<ValidationReport> {
    let batcher = SegmentationBatcher::new(dataset.image_size());
    let mut metrics = SegmentationMetrics::new(model.num_classes());
    let mut loss_sum = 0.0;
    let mut samples = 0usize;

    for indices in BatchPlan::sequential(dataset.len(), batch_size, false).batches() {
        let items: Vec<&SegmentationItem> =
            indices.iter().filter_map(|&i| dataset.item(i)).collect();
        let batch = batcher.batch_refs::<B>(&items, ctx.device());
        let Some(masks) = batch.masks else {
            return Err(SslError::Training(
                "validation data must carry masks".to_string(),
            ));
        };

        let logits = model.forward_segmentation(batch.images);
        let loss: f64 = pixel_cross_entropy(logits.clone(), masks.clone())
            .into_scalar()
            .elem();

        metrics.add_batch(&argmax_classes(logits)?, &int_values(masks)?);
        loss_sum += loss * items.len() as f64;
        samples += items.len();
    }

    if samples == 0 {
        return Ok(ValidationReport::default());
    }

    Ok(ValidationReport {
        loss: loss_sum / samples as f64,
        miou: metrics.mean_iou(),
        accuracy: metrics.accuracy(),
        dice: metrics.dice(),
        samples,
    })
}

/// Runs the epochs of a stage: training, validation, loss log and checkpoints
pub struct StageRunner {
    config: PipelineConfig,
    contrastive: ContrastiveConfig,
    layout: CheckpointLayout,
    extractor: PatchExtractor,
    augmenter: PatchAugmenter,
    rng: ChaCha8Rng,
}

impl StageRunner {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let extractor = PatchExtractor::new(
            config.num_classes,
            config.include_background,
            config.img_size,
            config.patch_size,
        )?;
        Ok(Self {
            contrastive: config.contrastive(),
            layout: CheckpointLayout::new(
                &config.output_root,
                config.patch_size,
                config.contrastive_weight,
            ),
            extractor,
            augmenter: PatchAugmenter::new(config.augmentation.clone()),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config: config.clone(),
        })
    }

    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Train one stage over epochs `start + 1 ..= end`
    ///
    /// The memory bank starts empty for every stage. A training set too small
    /// for one full batch skips the stage.
    #[allow(clippy::too_many_arguments)]
    pub fn run_stage<B, O>(
        &mut self,
        models: StageModels<B>,
        optimizer: &mut O,
        train: &SegmentationDataset,
        valid: &SegmentationDataset,
        stage: StageKind,
        fold: usize,
        epochs: StageEpochs,
        ctx: &ExecutionContext<B>,
    ) -> Result<(StageModels<B>, StageReport)>
    where
        B: AutodiffBackend,
        O: Optimizer<SegmentationNet<B>, B>,
    {
        let batch_size = self.config.batch_size;
        let steps_per_epoch = BatchPlan::num_batches(train.len(), batch_size, true);
        if steps_per_epoch == 0 {
            warn!(
                "Skipping {} (fold {}): {} training samples is less than one batch of {}",
                stage,
                fold,
                train.len(),
                batch_size
            );
            return Ok((models, StageReport::skipped(stage, fold)));
        }

        println!(
            "{}",
            format!(
                "▶ {} | fold {} | epochs {}..={} | {} train / {} valid",
                stage,
                fold,
                epochs.start + 1,
                epochs.end,
                train.len(),
                valid.len()
            )
            .cyan()
            .bold()
        );

        let StageModels {
            mut student,
            mut teacher,
        } = models;
        let inner_ctx = ExecutionContext::<B::InnerBackend>::new(ctx.device().clone());
        let policy = WeightPolicy::for_stage(stage, self.config.contrastive_weight);
        let schedule = self.config.lr_schedule();
        debug!("[{} fold {}] {}", stage, fold, schedule.description());
        let log = LossLog::for_stage(
            &self.config.output_root,
            self.config.patch_size,
            self.config.contrastive_weight,
            stage.name(),
            fold,
        );
        let mut queues = EmbeddingQueues::new(self.config.num_classes, self.config.queue_capacity);
        let mut logger = StageLogger::new(stage.name(), fold, epochs.end);
        let mut report = StageReport::skipped(stage, fold);

        for epoch in epochs.start + 1..=epochs.end {
            logger.start_epoch(epoch);
            let weight = policy.weight(epoch, epochs.end);
            let lr = schedule.get_lr(epoch - epochs.start - 1);

            let plan = BatchPlan::shuffled(train.len(), batch_size, true, &mut self.rng);
            let pb = epoch_progress(plan.len(), epoch, epochs.end);

            let mut total_avg = RunningAverage::new();
            let mut sup_avg = RunningAverage::new();
            let mut con_avg = RunningAverage::new();
            let mut train_metrics = SegmentationMetrics::new(self.config.num_classes);

            for indices in plan.batches() {
                let items: Vec<&SegmentationItem> =
                    indices.iter().filter_map(|&i| train.item(i)).collect();
                let step = self.train_step(
                    student,
                    teacher,
                    optimizer,
                    &mut queues,
                    &items,
                    weight,
                    lr,
                    ctx,
                    &inner_ctx,
                )?;
                student = step.student;
                teacher = step.teacher;

                total_avg.add(step.total);
                sup_avg.add(step.supervised);
                con_avg.add(step.contrastive);
                train_metrics.merge(&step.metrics);

                pb.set_message(format!("loss {:.4}", step.total));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let validation = validate(&student.valid(), valid, batch_size, &inner_ctx)?;

            log.append(&EpochRecord {
                epoch,
                stage: stage.name().to_string(),
                fold,
                train_total_loss: total_avg.average(),
                train_supervised_loss: sup_avg.average(),
                train_contrastive_loss: con_avg.average(),
                train_miou: train_metrics.mean_iou(),
                train_accuracy: train_metrics.accuracy(),
                train_dice: train_metrics.dice(),
                consistency_loss: 0.0,
                val_total_loss: validation.loss,
                val_supervised_loss: validation.loss,
                val_miou: validation.miou,
                val_accuracy: validation.accuracy,
                val_dice: validation.dice,
                contrastive_weight: weight,
            })?;

            if epoch % self.config.save_interval == 0 {
                self.layout.save_model(&student, stage, epoch, fold)?;
            }

            logger.end_epoch(epoch, total_avg.average(), validation.loss, validation.miou, weight);
            debug!(
                "queue sizes: {:?}",
                (0..queues.num_classes()).map(|c| queues.len(c)).collect::<Vec<_>>()
            );

            report.epochs_run += 1;
            report.last_train_loss = total_avg.average();
            report.last_validation = Some(validation);
        }

        logger.finish();
        debug!("{} rows in {:?}", log.row_count()?, log.path());
        if let Some(v) = &report.last_validation {
            println!(
                "  {} {} done | loss {:.4} | val mIoU {:.4} | val Dice {:.4}",
                "✓".green(),
                stage,
                report.last_train_loss,
                v.miou,
                v.dice
            );
        }

        Ok((StageModels { student, teacher }, report))
    }

    #[allow(clippy::too_many_arguments)]
    fn train_step<B, O>(
        &mut self,
        student: SegmentationNet<B>,
        teacher: SegmentationNet<B::InnerBackend>,
        optimizer: &mut O,
        queues: &mut EmbeddingQueues,
        items: &[&SegmentationItem],
        weight: f64,
        lr: f64,
        ctx: &ExecutionContext<B>,
        inner_ctx: &ExecutionContext<B::InnerBackend>,
    ) -> Result<StepOutput<B>>
    where
        B: AutodiffBackend,
        O: Optimizer<SegmentationNet<B>, B>,
    {
        let chunk = self.config.embedding_chunk_size;

        // patch-level contrastive term
        let patches = self.extractor.extract(items);
        debug!("{} class patches from {} images", patches.total_present(), items.len());
        let teacher_patches = self.augmenter.augment_all(&patches, &mut self.rng);
        let student_emb = extract_embeddings(&student, &patches, GradientMode::Track, chunk, ctx)?;
        // Teacher runs on the inner backend: its BatchNorm layers normalise
        // with running statistics, not the statistics of this patch batch.
        let teacher_emb = extract_embeddings(
            &teacher,
            &teacher_patches,
            GradientMode::Detached,
            chunk,
            inner_ctx,
        )?;
        queues.enqueue(&teacher_emb.to_host()?);
        let contrastive = pcgjcl_loss(
            &student_emb,
            queues,
            &self.contrastive,
            &mut self.rng,
            ctx.device(),
        );

        // supervised term
        let batch = SegmentationBatcher::new(self.config.img_size).batch_refs::<B>(items, ctx.device());
        let masks = batch.masks.ok_or_else(|| {
            SslError::Training("every training sample needs a mask or pseudo-label".to_string())
        })?;
        let logits = student.forward_segmentation(batch.images);
        let supervised = pixel_cross_entropy(logits.clone(), masks.clone());

        let total = supervised.clone() + contrastive.clone().mul_scalar(weight);

        let mut metrics = SegmentationMetrics::new(self.config.num_classes);
        metrics.add_batch(&argmax_classes(logits.detach())?, &int_values(masks)?);

        let total_value: f64 = total.clone().into_scalar().elem();
        let supervised_value: f64 = supervised.into_scalar().elem();
        let contrastive_value: f64 = contrastive.into_scalar().elem();

        let grads = total.backward();
        let grads = GradientsParams::from_grads(grads, &student);
        let student = optimizer.step(lr, student, grads);

        let teacher = ema_update(&student.valid(), teacher, self.config.ema_alpha)?;

        Ok(StepOutput {
            student,
            teacher,
            total: total_value,
            supervised: supervised_value,
            contrastive: contrastive_value,
            metrics,
        })
    }
}

struct StepOutput<B: AutodiffBackend> {
    student: SegmentationNet<B>,
    teacher: SegmentationNet<B::InnerBackend>,
    total: f64,
    supervised: f64,
    contrastive: f64,
    metrics: SegmentationMetrics,
}

fn epoch_progress(steps: usize, epoch: usize, end_epoch: usize) -> ProgressBar {
    let pb = ProgressBar::new(steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_prefix(format!("epoch {}/{}", epoch, end_epoch));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::network::SegmentationNetConfig;
    use burn::backend::Autodiff;
    use burn::optim::AdamConfig;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    const SIZE: usize = 16;

    /// Left half background, a square of class 1 whose position varies
    fn synthetic_item(i: usize) -> SegmentationItem {
        let offset = i % 4;
        let mut mask = vec![0u8; SIZE * SIZE];
        let mut image = vec![0.1f32; 3 * SIZE * SIZE];
        for y in 4 + offset..10 + offset {
            for x in 6..12 {
                mask[y * SIZE + x] = 1;
                for c in 0..3 {
                    image[(c * SIZE + y) * SIZE + x] = 0.8;
                }
            }
        }
        SegmentationItem::from_data(format!("img{}", i), image, Some(mask), SIZE)
    }

    fn dataset(n: usize) -> SegmentationDataset {
        SegmentationDataset::from_items((0..n).map(synthetic_item).collect(), SIZE)
    }

    fn config(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            output_root: root.to_path_buf(),
            img_size: SIZE,
            patch_size: 4,
            embedding_size: 8,
            base_filters: 4,
            batch_size: 4,
            psi: 16,
            queue_capacity: 32,
            ..Default::default()
        }
    }

    #[test]
    fn test_pixel_cross_entropy_prefers_correct_logits() {
        let device = Default::default();
        let masks = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![0i64, 1, 1, 0], [1, 2, 2]),
            &device,
        );
        let good = Tensor::<TestBackend, 4>::from_floats(
            TensorData::new(vec![5.0f32, -5.0, -5.0, 5.0, -5.0, 5.0, 5.0, -5.0], [1, 2, 2, 2]),
            &device,
        );
        let bad = good.clone().neg();
        let good: f64 = pixel_cross_entropy(good, masks.clone()).into_scalar().elem();
        let bad: f64 = pixel_cross_entropy(bad, masks).into_scalar().elem();
        assert!(good < 0.01);
        assert!(bad > good);
    }

    #[test]
    fn test_validate_scores_every_sample() {
        let ctx = ExecutionContext::<TestBackend>::new(Default::default());
        let model = SegmentationNetConfig::new()
            .with_embedding_size(8)
            .with_base_filters(4)
            .init(ctx.device());
        let report = validate(&model, &dataset(5), 2, &ctx).unwrap();
        assert_eq!(report.samples, 5);
        assert!(report.loss.is_finite());
        assert!((0.0..=1.0).contains(&report.accuracy));

        let empty = validate(&model, &SegmentationDataset::empty(SIZE), 2, &ctx).unwrap();
        assert_eq!(empty.samples, 0);
    }

    #[test]
    fn test_run_stage_writes_log_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.save_interval = 1;
        let ctx = ExecutionContext::<TestAutodiffBackend>::new(Default::default());
        let models = StageModels::from_student(cfg.network().init::<TestAutodiffBackend>(ctx.device()));
        let mut optimizer = AdamConfig::new().init();
        let mut runner = StageRunner::new(&cfg).unwrap();

        let (_models, report) = runner
            .run_stage(
                models,
                &mut optimizer,
                &dataset(8),
                &dataset(3),
                StageKind::SupervisedPretraining,
                0,
                StageEpochs::new(0, 2),
                &ctx,
            )
            .unwrap();

        assert_eq!(report.epochs_run, 2);
        assert!(report.last_train_loss.is_finite());
        let log = LossLog::for_stage(dir.path(), 4, 0.0, "supervised-Pretraining", 0);
        assert_eq!(log.row_count().unwrap(), 2);
        let layout = runner.layout();
        assert!(layout.exists(StageKind::SupervisedPretraining, 1, 0));
        assert!(layout.exists(StageKind::SupervisedPretraining, 2, 0));
    }

    #[test]
    fn test_teacher_moves_towards_student() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.ema_alpha = 0.5;
        cfg.save_interval = 100;
        let ctx = ExecutionContext::<TestAutodiffBackend>::new(Default::default());
        let student = cfg.network().init::<TestAutodiffBackend>(ctx.device());
        // teacher starts from different weights than the student
        let teacher = cfg.network().init::<TestBackend>(ctx.device());
        let before = teacher.classifier.weight.val().into_data().to_vec::<f32>().unwrap();
        let models = StageModels { student, teacher };

        let mut optimizer = AdamConfig::new().init();
        let mut runner = StageRunner::new(&cfg).unwrap();
        let (models, _) = runner
            .run_stage(
                models,
                &mut optimizer,
                &dataset(4),
                &dataset(2),
                StageKind::SslReliableSt1,
                0,
                StageEpochs::new(0, 1),
                &ctx,
            )
            .unwrap();

        let after = models.teacher.classifier.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_small_dataset_skips_stage() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let ctx = ExecutionContext::<TestAutodiffBackend>::new(Default::default());
        let models = StageModels::from_student(cfg.network().init::<TestAutodiffBackend>(ctx.device()));
        let mut optimizer = AdamConfig::new().init();
        let mut runner = StageRunner::new(&cfg).unwrap();

        let (_, report) = runner
            .run_stage(
                models,
                &mut optimizer,
                &dataset(3),
                &dataset(2),
                StageKind::SslReliableSt2,
                1,
                StageEpochs::new(0, 3),
                &ctx,
            )
            .unwrap();
        assert_eq!(report.epochs_run, 0);
        assert!(report.last_validation.is_none());
        let log = LossLog::for_stage(dir.path(), 4, 0.0, "SSL-reliable-st2", 1);
        assert_eq!(log.row_count().unwrap(), 0);
    }
}
