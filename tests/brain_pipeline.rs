use image::{DynamicImage, GrayImage, Luma};
use medscan::Fallback;
use medscan::ops::adjustments::{adjust_gamma, correct_bias};
use medscan::ops::brain::{BrainPipeline, apply_mask, enhance, segment};
use medscan::ops::segmentation::count_regions;

/// Dark background with one bright disc, like an axial slice.
fn synthetic_mri(size: u32, radius: f32, fg: u8, bg: u8) -> GrayImage {
    let c = size as f32 / 2.0;
    GrayImage::from_fn(size, size, |x, y| {
        let (dx, dy) = (x as f32 + 0.5 - c, y as f32 + 0.5 - c);
        Luma([if dx * dx + dy * dy <= radius * radius { fg } else { bg }])
    })
}

/// Cheap deterministic pseudo-noise.
fn speckled(w: u32, h: u32) -> GrayImage {
    let mut state: u32 = 0x2545_f491;
    GrayImage::from_fn(w, h, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        Luma([(state >> 24) as u8])
    })
}

#[test]
fn bright_disc_is_segmented_and_kept() {
    let radius = 150.0;
    let img = synthetic_mri(512, radius, 200, 20);
    let enhanced = enhance(&img);
    let mask = segment(&enhanced);

    let area = mask.pixels().filter(|p| p[0] != 0).count() as f32;
    let disc = std::f32::consts::PI * radius * radius;
    assert!(area > 0.5 * disc && area < 1.3 * disc, "mask area {}", area);
    assert!(area < (512 * 512) as f32);
    assert_eq!(count_regions(&mask), 1);

    let masked = apply_mask(&enhanced, &mask);
    assert_eq!(masked.dimensions(), (512, 512));
    assert!(masked.pixels().any(|p| p[0] > 0));
    // Centre survives, far corner is cut.
    assert!(masked.get_pixel(256, 256)[0] > 0);
    assert_eq!(masked.get_pixel(2, 2)[0], 0);
}

#[test]
fn segmentation_never_returns_more_than_one_region() {
    for (w, h) in [(64, 48), (97, 131)] {
        let mask = segment(&speckled(w, h));
        assert!(count_regions(&mask) <= 1);
        assert_eq!(mask.dimensions(), (w, h));
    }
}

#[test]
fn gamma_one_is_identity() {
    let img = speckled(37, 23);
    assert_eq!(adjust_gamma(&img, 1.0), img);
}

#[test]
fn bias_correction_keeps_dimensions() {
    let img = speckled(41, 29);
    assert_eq!(correct_bias(&img).dimensions(), (41, 29));
}

#[test]
fn black_scan_degrades_gracefully() {
    let img = DynamicImage::ImageLuma8(GrayImage::new(64, 64));
    let pre = BrainPipeline::default().run(&img);
    assert!(pre.mask.pixels().all(|p| p[0] == 0));
    assert!(pre.fallbacks.contains(&Fallback::EmptySegmentation));
    assert!(
        pre.fallbacks
            .iter()
            .any(|f| matches!(f, Fallback::DegenerateImage { .. }))
    );
    assert_eq!(pre.image.dimensions(), (64, 64));
}
