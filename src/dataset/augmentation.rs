//! Patch Augmentation Module
//!
//! Random geometric and photometric transforms applied to extracted patches
//! before they go through the teacher. Each call draws fresh randomness, so
//! the teacher sees a different view of the same region than the student.
//!
//! # Transforms
//!
//! - Horizontal / vertical flip
//! - Rotation by a multiple of 90 degrees (patches are square)
//! - Brightness shift and contrast scaling around the patch mean
//! - Additive Gaussian noise
//!
//! All outputs are clamped back to [0, 1].

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::contrastive::patches::{ClassAligned, Patch};

/// Configuration for patch augmentation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchAugmentationConfig {
    /// Probability of applying horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f32,
    /// Probability of applying vertical flip (0.0 - 1.0)
    pub vertical_flip_prob: f32,
    /// Probability of rotating by 90, 180 or 270 degrees
    pub rotation_prob: f32,
    /// Brightness adjustment range (±brightness_delta)
    pub brightness_delta: f32,
    /// Probability of applying brightness adjustment
    pub brightness_prob: f32,
    /// Contrast adjustment range (1.0 ± contrast_delta)
    pub contrast_delta: f32,
    /// Probability of applying contrast adjustment
    pub contrast_prob: f32,
    /// Gaussian noise standard deviation (0.0 = disabled)
    pub noise_std: f32,
    /// Probability of applying noise
    pub noise_prob: f32,
}

impl Default for PatchAugmentationConfig {
    fn default() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            vertical_flip_prob: 0.5,
            rotation_prob: 0.5,
            brightness_delta: 0.2,
            brightness_prob: 0.8,
            contrast_delta: 0.2,
            contrast_prob: 0.8,
            noise_std: 0.02,
            noise_prob: 0.3,
        }
    }
}

impl PatchAugmentationConfig {
    /// Create a "light" augmentation preset (photometric only, mild)
    pub fn light() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            vertical_flip_prob: 0.0,
            rotation_prob: 0.0,
            brightness_delta: 0.1,
            brightness_prob: 0.5,
            contrast_delta: 0.1,
            contrast_prob: 0.5,
            noise_std: 0.0,
            noise_prob: 0.0,
        }
    }

    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            horizontal_flip_prob: 0.0,
            vertical_flip_prob: 0.0,
            rotation_prob: 0.0,
            brightness_delta: 0.0,
            brightness_prob: 0.0,
            contrast_delta: 0.0,
            contrast_prob: 0.0,
            noise_std: 0.0,
            noise_prob: 0.0,
        }
    }
}

/// Patch augmenter that applies random transformations
#[derive(Clone, Debug, Default)]
pub struct PatchAugmenter {
    config: PatchAugmentationConfig,
}

impl PatchAugmenter {
    pub fn new(config: PatchAugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatchAugmentationConfig {
        &self.config
    }

    /// Augment every present patch independently; `None` stays `None`
    pub fn augment_all<R: Rng>(
        &self,
        patches: &ClassAligned<Patch>,
        rng: &mut R,
    ) -> ClassAligned<Patch> {
        patches.map(|p| self.augment(p, rng))
    }

    /// Apply all configured augmentations randomly to one patch
    pub fn augment<R: Rng>(&self, patch: &Patch, rng: &mut R) -> Patch {
        let mut result = patch.clone();

        if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            result = flip_horizontal(&result);
        }

        if rng.gen::<f32>() < self.config.vertical_flip_prob {
            result = flip_vertical(&result);
        }

        if self.config.rotation_prob > 0.0 && rng.gen::<f32>() < self.config.rotation_prob {
            let quarter_turns = rng.gen_range(1..=3);
            for _ in 0..quarter_turns {
                result = rotate_90(&result);
            }
        }

        if self.config.brightness_prob > 0.0 && rng.gen::<f32>() < self.config.brightness_prob {
            let delta = rng.gen_range(-self.config.brightness_delta..=self.config.brightness_delta);
            result.data.iter_mut().for_each(|v| *v += delta);
        }

        if self.config.contrast_prob > 0.0 && rng.gen::<f32>() < self.config.contrast_prob {
            let factor =
                1.0 + rng.gen_range(-self.config.contrast_delta..=self.config.contrast_delta);
            let mean = result.data.iter().sum::<f32>() / result.data.len().max(1) as f32;
            result
                .data
                .iter_mut()
                .for_each(|v| *v = mean + factor * (*v - mean));
        }

        if self.config.noise_std > 0.0 && rng.gen::<f32>() < self.config.noise_prob {
            let std = self.config.noise_std;
            for v in result.data.iter_mut() {
                // Box-Muller transform for Gaussian noise
                let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
                let u2: f32 = rng.gen();
                *v += std * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            }
        }

        result.data.iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0));
        result
    }
}

fn remap(patch: &Patch, source: impl Fn(usize, usize) -> (usize, usize)) -> Patch {
    let s = patch.size;
    let mut data = vec![0.0f32; patch.data.len()];
    for c in 0..patch.channels {
        for y in 0..s {
            for x in 0..s {
                let (sy, sx) = source(y, x);
                data[(c * s + y) * s + x] = patch.at(c, sy, sx);
            }
        }
    }
    Patch::new(data, patch.channels, s)
}

fn flip_horizontal(patch: &Patch) -> Patch {
    let last = patch.size - 1;
    remap(patch, |y, x| (y, last - x))
}

fn flip_vertical(patch: &Patch) -> Patch {
    let last = patch.size - 1;
    remap(patch, |y, x| (last - y, x))
}

/// Clockwise quarter turn
fn rotate_90(patch: &Patch) -> Patch {
    let last = patch.size - 1;
    remap(patch, |y, x| (last - x, y))
}
