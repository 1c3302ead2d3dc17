//! Patch extraction
//!
//! For every image of a labeled batch and every class, the largest
//! 4-connected region of that class is located in the ground-truth mask and a
//! fixed-size patch is cropped around it. Positions without a qualifying
//! region hold `None`, so student and teacher patch lists stay aligned on the
//! image index.

use serde::{Deserialize, Serialize};

use crate::dataset::loader::SegmentationItem;
use crate::utils::error::{Result, SslError};

/// A square crop of an image, flattened CHW floats in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub data: Vec<f32>,
    pub channels: usize,
    pub size: usize,
}

impl Patch {
    pub fn new(data: Vec<f32>, channels: usize, size: usize) -> Self {
        Self {
            data,
            channels,
            size,
        }
    }

    /// Value at (channel, y, x)
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.size + y) * self.size + x]
    }
}

/// Per-class columns of per-image entries
///
/// `columns[class][image]` is `Some` when that image contributed a value for
/// that class. Every column has the batch length.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassAligned<T> {
    columns: Vec<Vec<Option<T>>>,
    batch_size: usize,
}

impl<T> ClassAligned<T> {
    /// All-`None` table
    pub fn new(num_classes: usize, batch_size: usize) -> Self {
        let columns = (0..num_classes)
            .map(|_| (0..batch_size).map(|_| None).collect())
            .collect();
        Self {
            columns,
            batch_size,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.columns.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn column(&self, class: usize) -> &[Option<T>] {
        &self.columns[class]
    }

    pub fn get(&self, class: usize, image: usize) -> Option<&T> {
        self.columns.get(class)?.get(image)?.as_ref()
    }

    pub fn set(&mut self, class: usize, image: usize, value: Option<T>) {
        self.columns[class][image] = value;
    }

    /// Number of `Some` entries in a class column
    pub fn count_present(&self, class: usize) -> usize {
        self.columns[class].iter().filter(|v| v.is_some()).count()
    }

    pub fn total_present(&self) -> usize {
        (0..self.num_classes()).map(|c| self.count_present(c)).sum()
    }

    /// Apply `f` to every present entry, keeping positions
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> ClassAligned<U> {
        ClassAligned {
            columns: self
                .columns
                .iter()
                .map(|col| col.iter().map(|v| v.as_ref().map(&mut f)).collect())
                .collect(),
            batch_size: self.batch_size,
        }
    }

    /// Present entries as `(class, image, value)` in class-major order
    pub fn iter_present(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        self.columns.iter().enumerate().flat_map(|(class, col)| {
            col.iter()
                .enumerate()
                .filter_map(move |(image, v)| v.as_ref().map(|v| (class, image, v)))
        })
    }
}

/// Extracts one patch per (image, class) from labeled batches
#[derive(Debug, Clone)]
pub struct PatchExtractor {
    pub num_classes: usize,
    pub include_background: bool,
    pub img_size: usize,
    pub patch_size: usize,
    /// Smallest region area (pixels) that yields a patch
    pub min_region_area: usize,
}

impl PatchExtractor {
    pub fn new(
        num_classes: usize,
        include_background: bool,
        img_size: usize,
        patch_size: usize,
    ) -> Result<Self> {
        if patch_size == 0 || patch_size > img_size {
            return Err(SslError::InvalidInput(format!(
                "patch size {} must be in 1..={}",
                patch_size, img_size
            )));
        }
        Ok(Self {
            num_classes,
            include_background,
            img_size,
            patch_size,
            min_region_area: (patch_size * patch_size / 4).max(1),
        })
    }

    /// Extract patches for a batch of items
    pub fn extract(&self, items: &[&SegmentationItem]) -> ClassAligned<Patch> {
        let mut patches = ClassAligned::new(self.num_classes, items.len());

        for (image_idx, item) in items.iter().enumerate() {
            let Some(mask) = &item.mask else {
                continue;
            };
            let size = item.size;
            if size < self.patch_size || mask.len() != size * size || item.image.len() % (size * size) != 0 {
                tracing::debug!("Skipping patch extraction for {} (size mismatch)", item.id);
                continue;
            }

            for class in 0..self.num_classes {
                if class == 0 && !self.include_background {
                    continue;
                }
                let Some(region) = largest_component(mask, size, class as u8) else {
                    continue;
                };
                if region.area < self.min_region_area {
                    continue;
                }
                let patch = self.crop_around(item, &region);
                patches.set(class, image_idx, Some(patch));
            }
        }

        patches
    }

    fn crop_around(&self, item: &SegmentationItem, region: &Region) -> Patch {
        let size = item.size;
        let p = self.patch_size;
        let channels = item.image.len() / (size * size);

        let box_w = region.x1 - region.x0 + 1;
        let box_h = region.y1 - region.y0 + 1;
        let crop_w = box_w.max(p);
        let crop_h = box_h.max(p);

        let origin_x = centred_origin(region.x0, region.x1, crop_w, size);
        let origin_y = centred_origin(region.y0, region.y1, crop_h, size);

        let plane = size * size;
        let mut data = vec![0.0f32; channels * p * p];

        if crop_w == p && crop_h == p {
            for c in 0..channels {
                for y in 0..p {
                    let src = c * plane + (origin_y + y) * size + origin_x;
                    let dst = (c * p + y) * p;
                    data[dst..dst + p].copy_from_slice(&item.image[src..src + p]);
                }
            }
        } else {
            let scale_x = crop_w as f32 / p as f32;
            let scale_y = crop_h as f32 / p as f32;
            for c in 0..channels {
                let channel = &item.image[c * plane..(c + 1) * plane];
                for y in 0..p {
                    let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (crop_h - 1) as f32);
                    for x in 0..p {
                        let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (crop_w - 1) as f32);
                        data[(c * p + y) * p + x] = bilinear_sample(
                            channel,
                            size,
                            origin_x as f32 + sx,
                            origin_y as f32 + sy,
                        );
                    }
                }
            }
        }

        Patch::new(data, channels, p)
    }
}

/// Origin of a `len`-wide window centred on `[lo, hi]`, kept inside `0..size`
fn centred_origin(lo: usize, hi: usize, len: usize, size: usize) -> usize {
    let centre = (lo + hi + 1) / 2;
    centre.saturating_sub(len / 2).min(size - len)
}

fn bilinear_sample(channel: &[f32], size: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(size - 1);
    let y1 = (y0 + 1).min(size - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let top = channel[y0 * size + x0] * (1.0 - fx) + channel[y0 * size + x1] * fx;
    let bottom = channel[y1 * size + x0] * (1.0 - fx) + channel[y1 * size + x1] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Connected region with inclusive bounding box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    area: usize,
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
}

/// Largest 4-connected region of `class` in a square mask; ties keep the
/// region found first in row-major order
fn largest_component(mask: &[u8], size: usize, class: u8) -> Option<Region> {
    let mut visited = vec![false; mask.len()];
    let mut stack = Vec::new();
    let mut best: Option<Region> = None;

    for start in 0..mask.len() {
        if visited[start] || mask[start] != class {
            continue;
        }

        let mut region = Region {
            area: 0,
            x0: usize::MAX,
            y0: usize::MAX,
            x1: 0,
            y1: 0,
        };
        visited[start] = true;
        stack.push(start);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % size, idx / size);
            region.area += 1;
            region.x0 = region.x0.min(x);
            region.y0 = region.y0.min(y);
            region.x1 = region.x1.max(x);
            region.y1 = region.y1.max(y);

            let mut visit = |n: usize| {
                if !visited[n] && mask[n] == class {
                    visited[n] = true;
                    stack.push(n);
                }
            };
            if x > 0 {
                visit(idx - 1);
            }
            if x + 1 < size {
                visit(idx + 1);
            }
            if y > 0 {
                visit(idx - size);
            }
            if y + 1 < size {
                visit(idx + size);
            }
        }

        if best.map_or(true, |b| region.area > b.area) {
            best = Some(region);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16x16 item; image value encodes the pixel position in channel 0
    fn item_with_mask(mask: Vec<u8>) -> SegmentationItem {
        let size = 16;
        let plane = size * size;
        let mut image = vec![0.5f32; 3 * plane];
        for i in 0..plane {
            image[i] = i as f32 / plane as f32;
        }
        SegmentationItem::from_data("synthetic", image, Some(mask), size)
    }

    fn square_mask(x0: usize, y0: usize, side: usize) -> Vec<u8> {
        let mut mask = vec![0u8; 16 * 16];
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                mask[y * 16 + x] = 1;
            }
        }
        mask
    }

    #[test]
    fn test_output_shape_and_alignment() {
        let extractor = PatchExtractor::new(2, false, 16, 4).unwrap();
        let labeled = item_with_mask(square_mask(2, 2, 4));
        let empty = item_with_mask(vec![0u8; 256]);
        let unlabeled = SegmentationItem::from_data("u", vec![0.0; 3 * 256], None, 16);

        let patches = extractor.extract(&[&labeled, &empty, &unlabeled]);
        assert_eq!(patches.num_classes(), 2);
        assert_eq!(patches.batch_size(), 3);
        for class in 0..2 {
            assert_eq!(patches.column(class).len(), 3);
        }
        // background disabled
        assert_eq!(patches.count_present(0), 0);
        assert!(patches.get(1, 0).is_some());
        assert!(patches.get(1, 1).is_none());
        assert!(patches.get(1, 2).is_none());

        let patch = patches.get(1, 0).unwrap();
        assert_eq!(patch.size, 4);
        assert_eq!(patch.channels, 3);
        assert_eq!(patch.data.len(), 3 * 16);
    }

    #[test]
    fn test_crop_is_centred_on_region() {
        let extractor = PatchExtractor::new(2, false, 16, 4).unwrap();
        let item = item_with_mask(square_mask(6, 8, 4));
        let patches = extractor.extract(&[&item]);
        let patch = patches.get(1, 0).unwrap();
        // top-left of the crop is pixel (6, 8)
        let expected = (8 * 16 + 6) as f32 / 256.0;
        assert!((patch.at(0, 0, 0) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_crop_clamped_at_border() {
        let extractor = PatchExtractor::new(2, false, 16, 6).unwrap();
        let item = item_with_mask(square_mask(13, 13, 3));
        let patches = extractor.extract(&[&item]);
        let patch = patches.get(1, 0).unwrap();
        let expected = (10 * 16 + 10) as f32 / 256.0;
        assert!((patch.at(0, 0, 0) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_small_region_rejected() {
        let extractor = PatchExtractor::new(2, false, 16, 4).unwrap();
        // 1 pixel < 16/4
        let item = item_with_mask(square_mask(5, 5, 1));
        assert_eq!(extractor.extract(&[&item]).count_present(1), 0);
    }

    #[test]
    fn test_large_region_resized() {
        let extractor = PatchExtractor::new(2, false, 16, 4).unwrap();
        let item = item_with_mask(square_mask(0, 0, 12));
        let patches = extractor.extract(&[&item]);
        let patch = patches.get(1, 0).unwrap();
        assert_eq!(patch.data.len(), 3 * 16);
        assert!(patch.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_background_included() {
        let extractor = PatchExtractor::new(2, true, 16, 4).unwrap();
        let item = item_with_mask(square_mask(0, 0, 4));
        let patches = extractor.extract(&[&item]);
        assert!(patches.get(0, 0).is_some());
        assert!(patches.get(1, 0).is_some());
    }

    #[test]
    fn test_largest_component_selected() {
        let mut mask = square_mask(0, 0, 2);
        for y in 8..13 {
            for x in 8..13 {
                mask[y * 16 + x] = 1;
            }
        }
        let region = largest_component(&mask, 16, 1).unwrap();
        assert_eq!(region.area, 25);
        assert_eq!((region.x0, region.y0, region.x1, region.y1), (8, 8, 12, 12));
    }

    #[test]
    fn test_patch_larger_than_image_rejected() {
        assert!(PatchExtractor::new(2, false, 8, 16).is_err());
    }

    #[test]
    fn test_class_aligned_map_keeps_positions() {
        let mut table: ClassAligned<u32> = ClassAligned::new(2, 3);
        table.set(1, 2, Some(7));
        let doubled = table.map(|v| v * 2);
        assert_eq!(doubled.get(1, 2), Some(&14));
        assert_eq!(doubled.total_present(), 1);
        let present: Vec<_> = doubled.iter_present().collect();
        assert_eq!(present, vec![(1, 2, &14)]);
    }
}
