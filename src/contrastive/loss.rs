//! Patch-group contrastive loss (PCGJCL)
//!
//! Every student embedding `z` of class `c` is scored against each class `k`
//! that has entries in the memory bank. With `μ_k` the mean and `C_k` the
//! centred rows of (at most `psi` sampled) queue entries of class `k`:
//!
//! ```text
//! logit_k(z) = z·μ_k / τ + λ / (2τ²) · mean_j((C_k,j · z)²)
//! ```
//!
//! The second term is the Jensen bound of the contrast against the class
//! distribution, so the loss compares `z` to a whole group of embeddings
//! rather than to single samples. The loss is the cross-entropy of these
//! logits with target `c`, averaged over the anchors of each class and then
//! over the classes present in the batch.

use burn::tensor::{activation::log_softmax, backend::Backend, Tensor, TensorData};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::contrastive::embeddings::ClassEmbeddings;
use crate::contrastive::queue::EmbeddingQueues;

/// Hyper-parameters of the contrastive loss
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContrastiveConfig {
    pub embedding_size: usize,
    /// Softmax temperature τ
    pub temperature: f64,
    /// Weight λ of the covariance term
    pub lambda: f64,
    /// Maximum queue entries used per class and step
    pub psi: usize,
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            embedding_size: 128,
            temperature: 0.2,
            lambda: 4.0,
            psi: 4096,
        }
    }
}

/// Mean and centred rows of a sampled queue, as device tensors
struct ClassGroup<B: Backend> {
    class: usize,
    /// `[D, 1]`
    mean: Tensor<B, 2>,
    /// `[D, m]`, centred rows transposed
    centred_t: Tensor<B, 2>,
}

fn class_group<B: Backend, R: Rng>(
    queues: &EmbeddingQueues,
    class: usize,
    cfg: &ContrastiveConfig,
    rng: &mut R,
    device: &B::Device,
) -> Option<ClassGroup<B>> {
    let d = cfg.embedding_size;
    let sampled: Vec<&[f32]> = queues
        .sample(class, cfg.psi, rng)
        .into_iter()
        .filter(|e| e.len() == d)
        .collect();
    if sampled.is_empty() {
        return None;
    }
    let m = sampled.len();

    let mut mean = vec![0.0f64; d];
    for entry in &sampled {
        for (acc, v) in mean.iter_mut().zip(entry.iter()) {
            *acc += *v as f64;
        }
    }
    let mean: Vec<f32> = mean.iter().map(|v| (v / m as f64) as f32).collect();

    // transposed layout: centred_t[i][j] = entry_j[i] - mean[i]
    let mut centred_t = vec![0.0f32; d * m];
    for (j, entry) in sampled.iter().enumerate() {
        for i in 0..d {
            centred_t[i * m + j] = entry[i] - mean[i];
        }
    }

    Some(ClassGroup {
        class,
        mean: Tensor::from_floats(TensorData::new(mean, [d, 1]), device),
        centred_t: Tensor::from_floats(TensorData::new(centred_t, [d, m]), device),
    })
}

/// Contrastive loss of the student embeddings against the memory bank
///
/// Classes without student embeddings, and classes whose own queue is empty,
/// contribute nothing. With no anchors at all the loss is exactly zero.
pub fn pcgjcl_loss<B: Backend, R: Rng>(
    student: &ClassEmbeddings<B>,
    queues: &EmbeddingQueues,
    cfg: &ContrastiveConfig,
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, 1> {
    let num_classes = student.num_classes().min(queues.num_classes());
    let has_anchor = (0..num_classes).any(|c| student.rows(c).is_some() && !queues.is_empty(c));
    if !has_anchor {
        return Tensor::zeros([1], device);
    }

    let groups: Vec<ClassGroup<B>> = (0..queues.num_classes())
        .filter_map(|k| class_group(queues, k, cfg, rng, device))
        .collect();

    let tau = cfg.temperature;
    let cov_weight = cfg.lambda / (2.0 * tau * tau);

    let mut total: Option<Tensor<B, 1>> = None;
    let mut classes = 0usize;

    for c in 0..num_classes {
        let Some(z) = student.rows(c) else {
            continue;
        };
        let Some(target) = groups.iter().position(|g| g.class == c) else {
            continue;
        };

        let logits: Vec<Tensor<B, 2>> = groups
            .iter()
            .map(|g| {
                let mean_term = z.clone().matmul(g.mean.clone()).div_scalar(tau);
                let cov_term = z
                    .clone()
                    .matmul(g.centred_t.clone())
                    .powf_scalar(2.0)
                    .mean_dim(1)
                    .mul_scalar(cov_weight);
                mean_term + cov_term
            })
            .collect();
        let logits = Tensor::cat(logits, 1);

        let class_nll = log_softmax(logits, 1)
            .narrow(1, target, 1)
            .mean()
            .neg();

        total = Some(match total {
            Some(t) => t + class_nll,
            None => class_nll,
        });
        classes += 1;
    }

    match total {
        Some(t) if classes > 0 => t.div_scalar(classes as f64),
        _ => Tensor::zeros([1], device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionContext;
    use crate::contrastive::embeddings::{extract_embeddings, GradientMode};
    use crate::contrastive::patches::{ClassAligned, Patch};
    use crate::model::network::SegmentationNetConfig;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray;

    fn cfg(d: usize) -> ContrastiveConfig {
        ContrastiveConfig {
            embedding_size: d,
            ..Default::default()
        }
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_no_student_embeddings_is_zero() {
        let device = Default::default();
        let student = ClassEmbeddings::<TestBackend>::empty(2, 4, 2);
        let mut queues = EmbeddingQueues::new(2, 10);
        queues.push(0, vec![1.0, 0.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let loss = pcgjcl_loss(&student, &queues, &cfg(2), &mut rng, &device);
        assert_eq!(loss.dims(), [1]);
        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn test_empty_queues_is_zero() {
        let ctx = ExecutionContext::<TestBackend>::new(Default::default());
        let model = SegmentationNetConfig::new()
            .with_embedding_size(4)
            .with_base_filters(4)
            .init(ctx.device());
        let mut patches = ClassAligned::new(2, 2);
        patches.set(1, 0, Some(Patch::new(vec![0.5; 3 * 8 * 8], 3, 8)));
        let student = extract_embeddings(&model, &patches, GradientMode::Track, 4, &ctx).unwrap();

        let queues = EmbeddingQueues::new(2, 10);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let loss = pcgjcl_loss(&student, &queues, &cfg(4), &mut rng, ctx.device());
        let value = scalar(loss);
        assert!(value.is_finite());
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_two_class_value() {
        let device = Default::default();
        let mut host = ClassAligned::new(2, 1);
        host.set(0, 0, Some(vec![1.0f32, 0.0]));
        let student = student_from_host(&host, &device);

        let mut queues = EmbeddingQueues::new(2, 10);
        queues.push(0, vec![1.0, 0.0]);
        queues.push(1, vec![0.0, 1.0]);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let loss = scalar(pcgjcl_loss(&student, &queues, &cfg(2), &mut rng, &device));
        // single-entry queues have zero covariance: logits [5, 0]
        let expected = (1.0f32 + (-5.0f32).exp()).ln();
        assert!((loss - expected).abs() < 1e-4, "{} vs {}", loss, expected);
    }

    #[test]
    fn test_classes_weigh_equally_regardless_of_anchor_count() {
        let device = Default::default();
        let mut queues = EmbeddingQueues::new(2, 10);
        queues.push(0, vec![1.0, 0.0]);
        queues.push(1, vec![0.0, 1.0]);

        // one misaligned class-0 anchor, three aligned class-1 anchors
        let mut host = ClassAligned::new(2, 3);
        host.set(0, 0, Some(vec![0.0f32, 1.0]));
        for image in 0..3 {
            host.set(1, image, Some(vec![0.0f32, 1.0]));
        }
        let student = student_from_host(&host, &device);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let loss = scalar(pcgjcl_loss(&student, &queues, &cfg(2), &mut rng, &device));
        let misaligned = (1.0f32 + 5.0f32.exp()).ln();
        let aligned = (1.0f32 + (-5.0f32).exp()).ln();
        let expected = (misaligned + aligned) / 2.0;
        assert!((loss - expected).abs() < 1e-3, "{} vs {}", loss, expected);
    }

    #[test]
    fn test_aligned_lower_than_misaligned() {
        let device = Default::default();
        let mut queues = EmbeddingQueues::new(2, 10);
        queues.push(0, vec![1.0, 0.0]);
        queues.push(0, vec![0.9, 0.1]);
        queues.push(1, vec![0.0, 1.0]);
        queues.push(1, vec![0.1, 0.9]);

        let mut aligned = ClassAligned::new(2, 1);
        aligned.set(0, 0, Some(vec![1.0f32, 0.0]));
        let mut misaligned = ClassAligned::new(2, 1);
        misaligned.set(0, 0, Some(vec![0.0f32, 1.0]));

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let aligned = student_from_host(&aligned, &device);
        let misaligned = student_from_host(&misaligned, &device);
        let good = scalar(pcgjcl_loss(&aligned, &queues, &cfg(2), &mut rng, &device));
        let bad = scalar(pcgjcl_loss(&misaligned, &queues, &cfg(2), &mut rng, &device));
        assert!(good < bad);
    }

    fn student_from_host(
        host: &ClassAligned<Vec<f32>>,
        device: &<TestBackend as Backend>::Device,
    ) -> ClassEmbeddings<TestBackend> {
        ClassEmbeddings::from_host(host, 2, device)
    }
}
