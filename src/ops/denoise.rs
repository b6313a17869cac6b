// ============================================================================
// NON-LOCAL MEANS DENOISING (grayscale)
// ============================================================================
//
// Every output pixel is a weighted mean of the pixels in its search window,
// weighted by how similar their surrounding template patches are:
//
//   w(p, q) = exp(-SSD(patch_p, patch_q) / (T² · h²))
//
// with T the template width. Weights under 0.001 are dropped. Patch SSDs are
// maintained as running column sums per search offset, so each output row
// costs O(offsets × width) regardless of template size. Rows are processed
// in parallel bands.

use image::GrayImage;
use rayon::prelude::*;

use crate::ops::filters::reflect_101;

const WEIGHT_THRESHOLD: f64 = 0.001;
const BAND_ROWS: usize = 16;

#[derive(Clone, Debug)]
pub struct NlMeans {
    /// Filter strength. Larger values remove more noise and more detail.
    pub h: f32,
    pub template_window: usize,
    pub search_window: usize,
}

impl Default for NlMeans {
    fn default() -> Self {
        Self {
            h: 3.0,
            template_window: 7,
            search_window: 21,
        }
    }
}

impl NlMeans {
    /// Weight for every integer patch SSD that still clears the threshold.
    fn weight_table(&self, template: usize) -> Vec<f32> {
        let denom = (template * template) as f64 * (self.h as f64) * (self.h as f64);
        let max_ssd = (-(WEIGHT_THRESHOLD.ln()) * denom).floor() as usize;
        (0..=max_ssd)
            .map(|ssd| (-(ssd as f64) / denom).exp() as f32)
            .collect()
    }

    pub fn denoise(&self, img: &GrayImage) -> GrayImage {
        let (w, h) = (img.width() as usize, img.height() as usize);
        if w == 0 || h == 0 || self.h <= 0.0 {
            return img.clone();
        }
        let tr = self.template_window.max(1) / 2;
        let sr = self.search_window.max(1) / 2;
        let template = 2 * tr + 1;
        let pad = tr + sr;
        let pw = w + 2 * pad;
        let ph = h + 2 * pad;

        let src = img.as_raw();
        let padded: Vec<i32> = (0..ph)
            .flat_map(|py| {
                let sy = reflect_101(py as isize - pad as isize, h);
                (0..pw).map(move |px| {
                    src[sy * w + reflect_101(px as isize - pad as isize, w)] as i32
                })
            })
            .collect();
        // Image coordinates, possibly negative, into the padded buffer.
        let at = |y: isize, x: isize| -> i32 {
            padded[(y + pad as isize) as usize * pw + (x + pad as isize) as usize]
        };

        let weights = self.weight_table(template);
        let sr_i = sr as isize;
        let offsets: Vec<(isize, isize)> = (-sr_i..=sr_i)
            .flat_map(|dy| (-sr_i..=sr_i).map(move |dx| (dx, dy)))
            .collect();

        let cols = w + 2 * tr;
        let tr_i = tr as isize;

        // Squared difference summed down one template column.
        let column_ssd = |y: isize, c: usize, dx: isize, dy: isize| -> i32 {
            let x = c as isize - tr_i;
            (y - tr_i..=y + tr_i)
                .map(|yy| {
                    let d = at(yy, x) - at(yy + dy, x + dx);
                    d * d
                })
                .sum()
        };

        let mut dst = vec![0u8; w * h];
        dst.par_chunks_mut(w * BAND_ROWS)
            .enumerate()
            .for_each(|(band, chunk)| {
                let y0 = band * BAND_ROWS;
                let rows = chunk.len() / w;
                let mut colsum = vec![0i32; offsets.len() * cols];
                let mut acc = vec![0.0f32; w];
                let mut wsum = vec![0.0f32; w];

                for r in 0..rows {
                    let y = (y0 + r) as isize;

                    for (o, &(dx, dy)) in offsets.iter().enumerate() {
                        let cs = &mut colsum[o * cols..(o + 1) * cols];
                        if r == 0 {
                            for (c, v) in cs.iter_mut().enumerate() {
                                *v = column_ssd(y, c, dx, dy);
                            }
                        } else {
                            let (gone, new) = (y - 1 - tr_i, y + tr_i);
                            for (c, v) in cs.iter_mut().enumerate() {
                                let x = c as isize - tr_i;
                                let a = at(gone, x) - at(gone + dy, x + dx);
                                let b = at(new, x) - at(new + dy, x + dx);
                                *v += b * b - a * a;
                            }
                        }
                    }

                    acc.iter_mut().for_each(|v| *v = 0.0);
                    wsum.iter_mut().for_each(|v| *v = 0.0);
                    for (o, &(dx, dy)) in offsets.iter().enumerate() {
                        let cs = &colsum[o * cols..(o + 1) * cols];
                        let mut window: i32 = cs[..template].iter().sum();
                        for x in 0..w {
                            if x > 0 {
                                window += cs[x + template - 1] - cs[x - 1];
                            }
                            let Some(&wt) = weights.get(window as usize) else {
                                continue;
                            };
                            acc[x] += wt * at(y + dy, x as isize + dx) as f32;
                            wsum[x] += wt;
                        }
                    }

                    let row_out = &mut chunk[r * w..(r + 1) * w];
                    for (x, out) in row_out.iter_mut().enumerate() {
                        // The zero offset always contributes weight 1.
                        *out = (acc[x] / wsum[x]).round().clamp(0.0, 255.0) as u8;
                    }
                }
            });

        GrayImage::from_raw(w as u32, h as u32, dst).unwrap_or_else(|| img.clone())
    }
}
