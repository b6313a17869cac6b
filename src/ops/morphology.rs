// ============================================================================
// MORPHOLOGY - erosion, dilation, opening, closing on 8-bit masks
// ============================================================================
//
// Grayscale min/max filters; on {0, 255} masks they are the usual binary
// operators. Structuring-element taps that fall outside the image are
// skipped, so erosion never eats in from the image border and dilation
// never grows out of it.

use image::GrayImage;
use rayon::prelude::*;

/// A flat structuring element, stored as one horizontal run per row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructuringElement {
    width: usize,
    height: usize,
    /// `(dy, dx_start, dx_end)` relative to the anchor, inclusive.
    runs: Vec<(isize, isize, isize)>,
}

impl StructuringElement {
    /// Disk of the given radius: every `(x, y)` with `x² + y² <= r²`.
    pub fn disk(radius: usize) -> Self {
        let r = radius as isize;
        let runs = (-r..=r)
            .map(|dy| {
                let mut half = 0;
                while (half + 1) * (half + 1) + dy * dy <= r * r {
                    half += 1;
                }
                (dy, -half, half)
            })
            .collect();
        Self {
            width: 2 * radius + 1,
            height: 2 * radius + 1,
            runs,
        }
    }

    /// Ellipse inscribed in a `width × height` box. A 3×3 ellipse is a
    /// cross; a 5×5 one is the full box minus all but the centre of the
    /// top and bottom rows.
    pub fn ellipse(width: usize, height: usize) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let r = (height / 2) as isize;
        let c = (width / 2) as isize;
        let inv_r2 = if r > 0 { 1.0 / (r * r) as f64 } else { 0.0 };

        let mut runs = Vec::with_capacity(height);
        for i in 0..height as isize {
            let dy = i - r;
            if dy.abs() > r {
                continue;
            }
            let dx = (c as f64 * (((r * r - dy * dy) as f64) * inv_r2).sqrt()).round() as isize;
            let j1 = (c - dx).max(0);
            let j2 = (c + dx + 1).min(width as isize);
            if j2 > j1 {
                runs.push((dy, j1 - c, j2 - 1 - c));
            }
        }
        Self { width, height, runs }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Whether the tap at `(dx, dy)` relative to the anchor is set.
    pub fn contains(&self, dx: isize, dy: isize) -> bool {
        self.runs
            .iter()
            .any(|&(ry, x0, x1)| ry == dy && dx >= x0 && dx <= x1)
    }
}

fn rank_filter(img: &GrayImage, se: &StructuringElement, take_max: bool) -> GrayImage {
    let (w, h) = (img.width() as usize, img.height() as usize);
    if w == 0 || h == 0 {
        return img.clone();
    }
    let src = img.as_raw();
    let identity = if take_max { u8::MIN } else { u8::MAX };

    let mut dst = vec![0u8; w * h];
    dst.par_chunks_mut(w).enumerate().for_each(|(y, row_out)| {
        for (x, out) in row_out.iter_mut().enumerate() {
            let mut acc = identity;
            for &(dy, x0, x1) in &se.runs {
                let sy = y as isize + dy;
                if sy < 0 || sy >= h as isize {
                    continue;
                }
                let lo = (x as isize + x0).max(0) as usize;
                let hi = (x as isize + x1).min(w as isize - 1);
                if hi < lo as isize {
                    continue;
                }
                let row = &src[sy as usize * w..(sy as usize + 1) * w];
                for &v in &row[lo..=hi as usize] {
                    acc = if take_max { acc.max(v) } else { acc.min(v) };
                }
            }
            *out = acc;
        }
    });

    GrayImage::from_raw(w as u32, h as u32, dst).unwrap_or_else(|| img.clone())
}

pub fn erode(img: &GrayImage, se: &StructuringElement) -> GrayImage {
    rank_filter(img, se, false)
}

pub fn dilate(img: &GrayImage, se: &StructuringElement) -> GrayImage {
    rank_filter(img, se, true)
}

/// Erode then dilate: removes foreground specks smaller than `se`.
pub fn open(img: &GrayImage, se: &StructuringElement) -> GrayImage {
    dilate(&erode(img, se), se)
}

/// Dilate then erode: fills background holes smaller than `se`.
pub fn close(img: &GrayImage, se: &StructuringElement) -> GrayImage {
    erode(&dilate(img, se), se)
}

/// Per-pixel `a - b`, clamped at zero. Both images must share dimensions.
pub fn subtract_saturating(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let (w, h) = a.dimensions();
    let raw: Vec<u8> = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| x.saturating_sub(y))
        .collect();
    GrayImage::from_raw(w, h, raw).unwrap_or_else(|| a.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn render(se: &StructuringElement) -> Vec<String> {
        let (w, h) = se.dimensions();
        let (cx, cy) = ((w / 2) as isize, (h / 2) as isize);
        (0..h as isize)
            .map(|y| {
                (0..w as isize)
                    .map(|x| if se.contains(x - cx, y - cy) { '#' } else { '.' })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn ellipse_shapes() {
        assert_eq!(render(&StructuringElement::ellipse(3, 3)), vec![".#.", "###", ".#."]);
        assert_eq!(
            render(&StructuringElement::ellipse(5, 5)),
            vec!["..#..", "#####", "#####", "#####", "..#.."]
        );
    }

    #[test]
    fn disk_radius_two() {
        assert_eq!(
            render(&StructuringElement::disk(2)),
            vec!["..#..", ".###.", "#####", ".###.", "..#.."]
        );
        let d5 = StructuringElement::disk(5);
        assert_eq!(d5.dimensions(), (11, 11));
        assert!(d5.contains(3, 4));
        assert!(!d5.contains(4, 4));
    }

    #[test]
    fn opening_removes_small_specks() {
        let mut img = GrayImage::new(40, 40);
        img.put_pixel(5, 5, Luma([255]));
        for y in 15..35 {
            for x in 15..35 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let out = open(&img, &StructuringElement::disk(2));
        assert_eq!(out.get_pixel(5, 5)[0], 0);
        assert_eq!(out.get_pixel(25, 25)[0], 255);
    }

    #[test]
    fn closing_fills_small_holes() {
        let mut img = GrayImage::from_pixel(30, 30, Luma([255]));
        img.put_pixel(15, 15, Luma([0]));
        img.put_pixel(16, 15, Luma([0]));
        let out = close(&img, &StructuringElement::disk(2));
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn border_does_not_erode() {
        let img = GrayImage::from_pixel(10, 10, Luma([255]));
        let out = erode(&img, &StructuringElement::ellipse(3, 3));
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn edge_band_from_dilate_minus_erode() {
        let mut img = GrayImage::new(11, 11);
        for y in 3..8 {
            for x in 3..8 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let se = StructuringElement::ellipse(3, 3);
        let band = subtract_saturating(&dilate(&img, &se), &erode(&img, &se));
        assert_eq!(band.get_pixel(5, 5)[0], 0);
        assert_eq!(band.get_pixel(3, 5)[0], 255);
        assert_eq!(band.get_pixel(2, 5)[0], 255);
        assert_eq!(band.get_pixel(0, 0)[0], 0);
    }
}
