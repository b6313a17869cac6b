// ============================================================================
// SEGMENTATION - Otsu thresholding and connected-region selection
// ============================================================================

use std::collections::VecDeque;

use image::GrayImage;

/// Otsu's method: the threshold `t` that maximises between-class variance
/// when pixels `<= t` are background and pixels `> t` are foreground.
/// Returns 0 when the histogram cannot be split (constant or empty image).
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in gray.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let total_pixels = gray.width() as u64 * gray.height() as u64;
    if total_pixels == 0 {
        return 0;
    }

    let sum_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut sum_background = 0.0f64;
    let mut weight_background = 0u64;
    let mut max_variance = 0.0f64;
    let mut best_threshold = 0u8;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count;
        if weight_background == 0 {
            continue;
        }
        let weight_foreground = total_pixels - weight_background;
        if weight_foreground == 0 {
            break;
        }

        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background as f64;
        let mean_foreground = (sum_total - sum_background) / weight_foreground as f64;

        let between_variance = weight_background as f64
            * weight_foreground as f64
            * (mean_background - mean_foreground).powi(2);

        if between_variance > max_variance {
            max_variance = between_variance;
            best_threshold = t as u8;
        }
    }

    best_threshold
}

/// Pixels strictly above `threshold` become 255, the rest 0.
pub fn threshold_binary(gray: &GrayImage, threshold: u8) -> GrayImage {
    let (w, h) = gray.dimensions();
    let raw = gray
        .as_raw()
        .iter()
        .map(|&v| if v > threshold { 255 } else { 0 })
        .collect();
    GrayImage::from_raw(w, h, raw).unwrap_or_else(|| GrayImage::new(w, h))
}

const NEIGHBOURS_4: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const NEIGHBOURS_8: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Breadth-first fill from `seed` over pixels where `member` is true and
/// `label` is still 0. Returns the number of pixels labelled.
fn flood(
    seed: usize,
    w: usize,
    h: usize,
    neighbours: &[(isize, isize)],
    member: &dyn Fn(usize) -> bool,
    labels: &mut [u32],
    id: u32,
) -> usize {
    let mut queue = VecDeque::new();
    labels[seed] = id;
    queue.push_back(seed);
    let mut count = 0usize;

    while let Some(idx) = queue.pop_front() {
        count += 1;
        let (x, y) = ((idx % w) as isize, (idx / w) as isize);
        for &(dx, dy) in neighbours {
            let (nx, ny) = (x + dx, y + dy);
            if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                continue;
            }
            let n = ny as usize * w + nx as usize;
            if labels[n] == 0 && member(n) {
                labels[n] = id;
                queue.push_back(n);
            }
        }
    }
    count
}

/// Number of 8-connected foreground (non-zero) regions.
pub fn count_regions(mask: &GrayImage) -> usize {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let raw = mask.as_raw();
    let mut labels = vec![0u32; w * h];
    let mut regions = 0u32;
    for idx in 0..w * h {
        if raw[idx] != 0 && labels[idx] == 0 {
            regions += 1;
            flood(idx, w, h, &NEIGHBOURS_8, &|i: usize| raw[i] != 0, &mut labels, regions);
        }
    }
    regions as usize
}

/// Keep the largest outer region of a binary mask and fill it solid.
///
/// Background reachable from the image border (4-connected) is "outside";
/// everything else belongs to the filled interior of some outer region,
/// holes and nested islands included. The biggest such interior, measured
/// in pixels, is returned as a {0, 255} mask. `None` when the mask has no
/// foreground at all.
pub fn largest_region_filled(mask: &GrayImage) -> Option<GrayImage> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let raw = mask.as_raw();
    if !raw.iter().any(|&v| v != 0) {
        return None;
    }

    // Label 1 marks the outside background.
    const OUTSIDE: u32 = 1;
    let mut labels = vec![0u32; w * h];
    let border = (0..w)
        .flat_map(|x| [x, (h - 1) * w + x])
        .chain((0..h).flat_map(|y| [y * w, y * w + w - 1]));
    for idx in border.collect::<Vec<_>>() {
        if raw[idx] == 0 && labels[idx] == 0 {
            flood(idx, w, h, &NEIGHBOURS_4, &|i: usize| raw[i] == 0, &mut labels, OUTSIDE);
        }
    }

    let mut next = OUTSIDE;
    let mut best: Option<(u32, usize)> = None;
    for idx in 0..w * h {
        if labels[idx] != 0 {
            continue;
        }
        next += 1;
        // Unlabelled pixels are foreground or enclosed background.
        let area = flood(idx, w, h, &NEIGHBOURS_8, &|_: usize| true, &mut labels, next);
        if best.is_none_or(|(_, a)| area > a) {
            best = Some((next, area));
        }
    }

    let (winner, _) = best?;
    let out: Vec<u8> = labels
        .iter()
        .map(|&l| if l == winner { 255 } else { 0 })
        .collect();
    GrayImage::from_raw(w as u32, h as u32, out)
}
