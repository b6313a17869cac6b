// ============================================================================
// CLAHE - Contrast Limited Adaptive Histogram Equalization
// ============================================================================
//
// The image is split into a fixed grid of tiles (not a fixed tile size).
// Each tile gets its own clipped-histogram lookup table, and every pixel is
// bilinearly interpolated between the tables of the four nearest tile
// centres. When the image does not divide evenly into the grid it is padded
// on the bottom/right by reflection before the tile histograms are taken.

use image::GrayImage;
use rayon::prelude::*;

use crate::ops::filters::reflect_101;

#[derive(Clone, Debug)]
pub struct Clahe {
    /// Clip limit relative to a uniform histogram (tile_area / 256).
    pub clip_limit: f64,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tiles_x: 8,
            tiles_y: 8,
        }
    }
}

impl Clahe {
    pub fn new(clip_limit: f64, tiles_x: usize, tiles_y: usize) -> Self {
        Self {
            clip_limit,
            tiles_x: tiles_x.max(1),
            tiles_y: tiles_y.max(1),
        }
    }

    pub fn apply(&self, img: &GrayImage) -> GrayImage {
        let (w, h) = (img.width() as usize, img.height() as usize);
        if w == 0 || h == 0 {
            return img.clone();
        }
        let (tx, ty) = (self.tiles_x, self.tiles_y);

        // Both axes get padded as soon as either one is uneven.
        let (ext_w, ext_h) = if w % tx == 0 && h % ty == 0 {
            (w, h)
        } else {
            (w + tx - w % tx, h + ty - h % ty)
        };
        let tile_w = ext_w / tx;
        let tile_h = ext_h / ty;
        let tile_area = tile_w * tile_h;
        let src = img.as_raw();

        let clip = if self.clip_limit > 0.0 {
            Some(((self.clip_limit * tile_area as f64 / 256.0) as u32).max(1))
        } else {
            None
        };
        let lut_scale = 255.0f32 / tile_area as f32;

        let luts: Vec<[u8; 256]> = (0..tx * ty)
            .into_par_iter()
            .map(|t| {
                let (col, row) = (t % tx, t / tx);
                let mut hist = [0u32; 256];
                for ey in row * tile_h..(row + 1) * tile_h {
                    let sy = reflect_101(ey as isize, h);
                    let src_row = &src[sy * w..(sy + 1) * w];
                    for ex in col * tile_w..(col + 1) * tile_w {
                        hist[src_row[reflect_101(ex as isize, w)] as usize] += 1;
                    }
                }
                if let Some(limit) = clip {
                    clip_histogram(&mut hist, limit);
                }
                let mut lut = [0u8; 256];
                let mut sum = 0u32;
                for (entry, &count) in lut.iter_mut().zip(hist.iter()) {
                    sum += count;
                    *entry = (sum as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
                }
                lut
            })
            .collect();

        let inv_tw = 1.0f32 / tile_w as f32;
        let inv_th = 1.0f32 / tile_h as f32;

        // Horizontal neighbours and weights are the same for every row.
        let x_taps: Vec<(usize, usize, f32)> = (0..w)
            .map(|x| {
                let txf = x as f32 * inv_tw - 0.5;
                let tx1 = txf.floor();
                let xa = txf - tx1;
                let tx1 = tx1 as isize;
                ((tx1.max(0)) as usize, ((tx1 + 1) as usize).min(tx - 1), xa)
            })
            .collect();

        let mut dst = vec![0u8; w * h];
        dst.par_chunks_mut(w).enumerate().for_each(|(y, row_out)| {
            let tyf = y as f32 * inv_th - 0.5;
            let ty1 = tyf.floor();
            let ya = tyf - ty1;
            let ty1 = ty1 as isize;
            let top = (ty1.max(0)) as usize * tx;
            let bottom = ((ty1 + 1) as usize).min(ty - 1) * tx;
            let row_in = &src[y * w..(y + 1) * w];

            for (x, out) in row_out.iter_mut().enumerate() {
                let v = row_in[x] as usize;
                let (tx1, tx2, xa) = x_taps[x];
                let upper = luts[top + tx1][v] as f32 * (1.0 - xa) + luts[top + tx2][v] as f32 * xa;
                let lower =
                    luts[bottom + tx1][v] as f32 * (1.0 - xa) + luts[bottom + tx2][v] as f32 * xa;
                let res = upper * (1.0 - ya) + lower * ya;
                *out = res.round().clamp(0.0, 255.0) as u8;
            }
        });

        GrayImage::from_raw(w as u32, h as u32, dst).unwrap_or_else(|| img.clone())
    }
}

/// Clip bins at `limit`, spread the excess evenly, then hand out the
/// remainder one count at a time with a fixed stride.
fn clip_histogram(hist: &mut [u32; 256], limit: u32) {
    let mut clipped = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            clipped += *bin - limit;
            *bin = limit;
        }
    }

    let redist_batch = clipped / 256;
    let mut residual = clipped - redist_batch * 256;
    for bin in hist.iter_mut() {
        *bin += redist_batch;
    }
    if residual != 0 {
        let step = (256 / residual).max(1) as usize;
        let mut i = 0usize;
        while i < 256 && residual > 0 {
            hist[i] += 1;
            i += step;
            residual -= 1;
        }
    }
}
