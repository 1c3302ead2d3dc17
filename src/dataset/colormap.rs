//! Colour-map mask encoding
//!
//! Ground-truth and pseudo-label masks are stored as RGB images where every
//! class has one colour. Index in the map = class id.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Ordered list of class colours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorMap {
    colors: Vec<[u8; 3]>,
}

impl ColorMap {
    pub fn new(colors: Vec<[u8; 3]>) -> Self {
        Self { colors }
    }

    /// Background (black) and kidney (dark red)
    pub fn kidney() -> Self {
        Self::new(vec![[0, 0, 0], [128, 0, 0]])
    }

    pub fn num_classes(&self) -> usize {
        self.colors.len()
    }

    pub fn color(&self, class: usize) -> Option<[u8; 3]> {
        self.colors.get(class).copied()
    }

    /// Class id of one pixel; colours outside the map decode to background
    pub fn class_of(&self, pixel: [u8; 3]) -> u8 {
        self.colors
            .iter()
            .position(|c| *c == pixel)
            .map(|i| i as u8)
            .unwrap_or(0)
    }

    /// Decode a colour mask into row-major class ids
    pub fn decode(&self, mask: &RgbImage) -> Vec<u8> {
        mask.pixels().map(|p| self.class_of(p.0)).collect()
    }

    /// Encode row-major class ids as a colour mask
    pub fn encode(&self, classes: &[u8], width: u32, height: u32) -> RgbImage {
        let background = self.color(0).unwrap_or([0, 0, 0]);
        RgbImage::from_fn(width, height, |x, y| {
            let idx = (y * width + x) as usize;
            let class = classes.get(idx).copied().unwrap_or(0) as usize;
            Rgb(self.color(class).unwrap_or(background))
        })
    }
}

impl Default for ColorMap {
    fn default() -> Self {
        Self::kidney()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_and_unknown_colors() {
        let cmap = ColorMap::kidney();
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([128, 0, 0]));
        img.put_pixel(2, 0, Rgb([10, 200, 30]));
        assert_eq!(cmap.decode(&img), vec![0, 1, 0]);
    }

    #[test]
    fn test_encode_inverts_decode() {
        let cmap = ColorMap::kidney();
        let classes = vec![0, 1, 1, 0];
        let img = cmap.encode(&classes, 2, 2);
        assert_eq!(img.get_pixel(1, 0).0, [128, 0, 0]);
        assert_eq!(cmap.decode(&img), classes);
    }
}
