//! Checkpoint layout and model persistence
//!
//! ```text
//! <output_root>/<patch>-<weight>/
//!     config.toml
//!     fold/<fold>/model_<stage>_<epoch>-s.mpk
//! ```
//!
//! Burn's `CompactRecorder` appends the `.mpk` extension itself, so the
//! paths handed around here never carry it.

use std::path::{Path, PathBuf};

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use tracing::{info, warn};

use crate::model::network::SegmentationNet;
use crate::training::stage::StageKind;
use crate::utils::error::{Result, SslError};
use crate::utils::run_tag;

/// Extension added by `CompactRecorder`
pub const CHECKPOINT_EXTENSION: &str = "mpk";

#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    run_dir: PathBuf,
}

impl CheckpointLayout {
    pub fn new(output_root: &Path, patch_size: usize, contrastive_weight: f64) -> Self {
        Self {
            run_dir: output_root.join(run_tag(patch_size, contrastive_weight)),
        }
    }

    /// `<output_root>/<patch>-<weight>`
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn fold_dir(&self, fold: usize) -> PathBuf {
        self.run_dir.join("fold").join(fold.to_string())
    }

    /// Checkpoint path without the recorder's extension
    pub fn model_path(&self, stage: StageKind, epoch: usize, fold: usize) -> PathBuf {
        self.fold_dir(fold)
            .join(format!("model_{}_{}-s", stage.name(), epoch))
    }

    /// Path of the file the recorder actually writes
    pub fn file_path(&self, stage: StageKind, epoch: usize, fold: usize) -> PathBuf {
        self.model_path(stage, epoch, fold)
            .with_extension(CHECKPOINT_EXTENSION)
    }

    pub fn exists(&self, stage: StageKind, epoch: usize, fold: usize) -> bool {
        self.file_path(stage, epoch, fold).exists()
    }

    pub fn save_model<B: Backend>(
        &self,
        model: &SegmentationNet<B>,
        stage: StageKind,
        epoch: usize,
        fold: usize,
    ) -> Result<PathBuf> {
        let path = self.model_path(stage, epoch, fold);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let recorder = CompactRecorder::new();
        model
            .clone()
            .save_file(&path, &recorder)
            .map_err(|e| SslError::Model(format!("Failed to save model {:?}: {:?}", path, e)))?;

        info!("Checkpoint saved to {:?}", path);
        Ok(path)
    }

    pub fn load_model<B: Backend>(
        &self,
        model: SegmentationNet<B>,
        stage: StageKind,
        epoch: usize,
        fold: usize,
        device: &B::Device,
    ) -> Result<SegmentationNet<B>> {
        let path = self.model_path(stage, epoch, fold);
        let recorder = CompactRecorder::new();
        model
            .load_file(&path, &recorder, device)
            .map_err(|e| SslError::Model(format!("Failed to load model {:?}: {:?}", path, e)))
    }

    /// Load a checkpoint if it exists, otherwise keep the in-memory model
    fn load_or_keep<B: Backend>(
        &self,
        model: SegmentationNet<B>,
        role: &str,
        stage: StageKind,
        epoch: usize,
        fold: usize,
        device: &B::Device,
    ) -> Result<SegmentationNet<B>> {
        if !self.exists(stage, epoch, fold) {
            warn!(
                "No {} checkpoint at {:?}, keeping the current weights",
                role,
                self.file_path(stage, epoch, fold)
            );
            return Ok(model);
        }
        info!("Restoring {} from {:?}", role, self.model_path(stage, epoch, fold));
        self.load_model(model, stage, epoch, fold, device)
    }
}

/// Restore the models that finished a stage
///
/// The student comes from the checkpoint at `end_epoch`, the teacher from
/// `end_epoch - teacher_lag`. Missing checkpoints (an interval that skipped
/// the epoch, or a stage shorter than the lag) keep the in-memory model.
#[allow(clippy::too_many_arguments)]
pub fn restore_stage_models<SB: Backend, TB: Backend>(
    layout: &CheckpointLayout,
    stage: StageKind,
    fold: usize,
    end_epoch: usize,
    teacher_lag: usize,
    student: SegmentationNet<SB>,
    teacher: SegmentationNet<TB>,
    student_device: &SB::Device,
    teacher_device: &TB::Device,
) -> Result<(SegmentationNet<SB>, SegmentationNet<TB>)> {
    let student = layout.load_or_keep(student, "student", stage, end_epoch, fold, student_device)?;

    let teacher = match end_epoch.checked_sub(teacher_lag) {
        Some(epoch) => layout.load_or_keep(teacher, "teacher", stage, epoch, fold, teacher_device)?,
        None => {
            warn!(
                "Stage {} ended at epoch {}, before the teacher lag of {}; keeping the current teacher",
                stage, end_epoch, teacher_lag
            );
            teacher
        }
    };

    Ok((student, teacher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::network::SegmentationNetConfig;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn small_net() -> SegmentationNet<TestBackend> {
        SegmentationNetConfig::new()
            .with_embedding_size(4)
            .with_base_filters(2)
            .init(&Default::default())
    }

    fn first_weight(model: &SegmentationNet<TestBackend>) -> Vec<f32> {
        model.classifier.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    /// The compact recorder stores half precision
    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= 1e-2 * y.abs().max(1.0), "{} vs {}", x, y);
        }
    }

    fn shift(mut model: SegmentationNet<TestBackend>, by: f32) -> SegmentationNet<TestBackend> {
        model.classifier.weight = model
            .classifier
            .weight
            .map(|w: Tensor<TestBackend, 4>| w.add_scalar(by));
        model
    }

    #[test]
    fn test_paths() {
        let layout = CheckpointLayout::new(Path::new("out"), 14, 0.0);
        assert_eq!(layout.run_dir(), Path::new("out/14-0"));
        assert_eq!(
            layout.model_path(StageKind::SslReliableSt1, 40, 2),
            PathBuf::from("out/14-0/fold/2/model_SSL-reliable-st1_40-s")
        );
        assert_eq!(
            layout.file_path(StageKind::SupervisedPretraining, 2, 0),
            PathBuf::from("out/14-0/fold/0/model_supervised-Pretraining_2-s.mpk")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(dir.path(), 14, 0.5);
        let model = small_net();
        let stage = StageKind::SupervisedPretraining;

        assert!(!layout.exists(stage, 2, 0));
        layout.save_model(&model, stage, 2, 0).unwrap();
        assert!(layout.exists(stage, 2, 0));

        let fresh = shift(small_net(), 1.0);
        let loaded = layout
            .load_model(fresh, stage, 2, 0, &Default::default())
            .unwrap();
        assert_close(&first_weight(&loaded), &first_weight(&model));
    }

    #[test]
    fn test_restore_uses_teacher_lag() {
        let dir = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(dir.path(), 14, 0.0);
        let stage = StageKind::SupervisedPretraining;

        let at_10 = shift(small_net(), 10.0);
        let at_20 = shift(small_net(), 20.0);
        layout.save_model(&at_10, stage, 10, 1).unwrap();
        layout.save_model(&at_20, stage, 20, 1).unwrap();

        let device = Default::default();
        let (student, teacher) = restore_stage_models(
            &layout,
            stage,
            1,
            20,
            10,
            small_net(),
            small_net(),
            &device,
            &device,
        )
        .unwrap();
        assert_close(&first_weight(&student), &first_weight(&at_20));
        assert_close(&first_weight(&teacher), &first_weight(&at_10));
    }

    #[test]
    fn test_restore_missing_keeps_models() {
        let dir = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(dir.path(), 14, 0.0);
        let student = small_net();
        let teacher = small_net();
        let (s_before, t_before) = (first_weight(&student), first_weight(&teacher));

        let device = Default::default();
        let (student, teacher) = restore_stage_models(
            &layout,
            StageKind::SslReliableSt2,
            0,
            5,
            10,
            student,
            teacher,
            &device,
            &device,
        )
        .unwrap();
        assert_eq!(first_weight(&student), s_before);
        assert_eq!(first_weight(&teacher), t_before);
    }

}
