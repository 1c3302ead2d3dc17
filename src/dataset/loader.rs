//! Split-file reading and sample loading
//!
//! A split file lists one sample per line:
//!
//! ```text
//! images/case_001.png masks/case_001.png
//! images/case_002.png
//! ```
//!
//! Paths are relative to the dataset root. Labeled lists must carry the mask
//! column; unlabeled lists ignore it.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::ImageReader;
use serde::{Deserialize, Serialize};

use crate::dataset::colormap::ColorMap;
use crate::utils::error::{Result, SslError};

/// One line of a split file, resolved against the dataset root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    pub image: PathBuf,
    pub mask: Option<PathBuf>,
}

/// Read a split file
pub fn read_split_file(path: &Path, root: &Path, labeled: bool) -> Result<Vec<SampleEntry>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SslError::Dataset(format!("Cannot read split file {:?}: {}", path, e))
    })?;

    let mut entries = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let mut columns = line.split_whitespace();
        let Some(image) = columns.next() else {
            continue;
        };
        let mask = columns.next();

        let mask = if labeled {
            match mask {
                Some(m) => Some(root.join(m)),
                None => {
                    return Err(SslError::Dataset(format!(
                        "{:?} line {}: labeled entry '{}' has no mask column",
                        path,
                        line_no + 1,
                        image
                    )))
                }
            }
        } else {
            None
        };

        entries.push(SampleEntry {
            image: root.join(image),
            mask,
        });
    }

    tracing::debug!("Read {} entries from {:?}", entries.len(), path);
    Ok(entries)
}

/// A loaded sample: normalised CHW image plus optional class-id mask
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationItem {
    /// Source image path, used as the sample identity
    pub id: String,
    /// Image as flattened CHW floats in [0, 1], `3 * size * size`
    pub image: Vec<f32>,
    /// Row-major class ids, `size * size`
    pub mask: Option<Vec<u8>>,
    /// Side length of the square image
    pub size: usize,
}

impl SegmentationItem {
    /// Load and resize an entry; the mask is decoded through the colour map
    pub fn load(entry: &SampleEntry, image_size: usize, colormap: &ColorMap) -> Result<Self> {
        let side = image_size as u32;
        let img = open_image(&entry.image)?
            .resize_exact(side, side, FilterType::Triangle)
            .to_rgb8();

        let plane = image_size * image_size;
        let mut image = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in img.enumerate_pixels() {
            let idx = y as usize * image_size + x as usize;
            for c in 0..3 {
                image[c * plane + idx] = pixel[c] as f32 / 255.0;
            }
        }

        let mask = match &entry.mask {
            Some(path) => {
                let mask_img = open_image(path)?
                    .resize_exact(side, side, FilterType::Nearest)
                    .to_rgb8();
                Some(colormap.decode(&mask_img))
            }
            None => None,
        };

        Ok(Self {
            id: entry.image.to_string_lossy().to_string(),
            image,
            mask,
            size: image_size,
        })
    }

    /// Create from pre-loaded data
    pub fn from_data(id: impl Into<String>, image: Vec<f32>, mask: Option<Vec<u8>>, size: usize) -> Self {
        Self {
            id: id.into(),
            image,
            mask,
            size,
        }
    }

    /// Same image paired with another mask
    pub fn with_mask(&self, mask: Option<Vec<u8>>) -> Self {
        Self {
            id: self.id.clone(),
            image: self.image.clone(),
            mask,
            size: self.size,
        }
    }

    pub fn is_labeled(&self) -> bool {
        self.mask.is_some()
    }
}

fn open_image(path: &Path) -> Result<image::DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| SslError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| SslError::ImageLoad(path.to_path_buf(), e.to_string()))
}

/// Statistics about a loaded split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub labeled_samples: usize,
    pub num_classes: usize,
    /// Fraction of labeled pixels per class
    pub class_pixel_fractions: Vec<f64>,
}

impl DatasetStats {
    pub fn from_items<'a>(
        items: impl IntoIterator<Item = &'a SegmentationItem>,
        num_classes: usize,
    ) -> Self {
        let mut total_samples = 0;
        let mut labeled_samples = 0;
        let mut counts = vec![0u64; num_classes];

        for item in items {
            total_samples += 1;
            if let Some(mask) = &item.mask {
                labeled_samples += 1;
                for &class in mask {
                    if let Some(c) = counts.get_mut(class as usize) {
                        *c += 1;
                    }
                }
            }
        }

        let pixels: u64 = counts.iter().sum();
        let class_pixel_fractions = counts
            .iter()
            .map(|&c| if pixels > 0 { c as f64 / pixels as f64 } else { 0.0 })
            .collect();

        Self {
            total_samples,
            labeled_samples,
            num_classes,
            class_pixel_fractions,
        }
    }

    /// Print statistics to console
    pub fn print(&self, title: &str) {
        println!("\n📊 {}:", title);
        println!("  Total samples:   {}", self.total_samples);
        println!("  Labeled samples: {}", self.labeled_samples);
        if self.labeled_samples > 0 {
            println!("  Pixel share per class:");
            for (idx, fraction) in self.class_pixel_fractions.iter().enumerate() {
                let bar = "█".repeat((fraction * 40.0) as usize);
                println!("    {:3}. {:6.2}% {}", idx, fraction * 100.0, bar);
            }
        }
    }
}
