use frame_sentinel_common::frame::Frame;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::debug;

/// Reference resolution both frames are reduced to before comparison.
const REFERENCE_WIDTH: u32 = 320;
const REFERENCE_HEIGHT: u32 = 240;

/// Pixel-difference scene change gate.
///
/// Downsamples both frames to 320x240, takes the absolute per-channel
/// difference, converts it to luma and counts the pixels whose luma
/// difference is above `noise_floor`. A frame is significant when that
/// fraction of the image exceeds `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct ChangeGate {
    threshold: f64,
    noise_floor: u8,
}

impl ChangeGate {
    pub fn new(threshold: f64, noise_floor: u8) -> Self {
        Self {
            threshold,
            noise_floor,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Returns `true` if `current` should be analyzed.
    ///
    /// With no previous frame the answer is always `true`.
    pub fn is_significant(&self, previous: Option<&Frame>, current: &Frame) -> bool {
        let Some(previous) = previous else {
            debug!(seq = current.seq, "first frame, significant unconditionally");
            return true;
        };

        let fraction = changed_fraction(&previous.image, &current.image, self.noise_floor);
        let significant = fraction > self.threshold;
        debug!(
            changed = format!("{:.4}", fraction),
            threshold = format!("{:.4}", self.threshold),
            significant,
            "pixel difference comparison"
        );
        significant
    }
}

/// Fraction of pixels (0.0..=1.0) whose luma difference exceeds `noise_floor`
/// after both images are reduced to the reference resolution.
pub fn changed_fraction(previous: &RgbImage, current: &RgbImage, noise_floor: u8) -> f64 {
    let a = downsample(previous);
    let b = downsample(current);

    let changed = a
        .pixels()
        .zip(b.pixels())
        .filter(|(pa, pb)| {
            let [r, g, bl] = [
                pa.0[0].abs_diff(pb.0[0]),
                pa.0[1].abs_diff(pb.0[1]),
                pa.0[2].abs_diff(pb.0[2]),
            ];
            luma(r, g, bl) > noise_floor
        })
        .count();

    let total = (REFERENCE_WIDTH * REFERENCE_HEIGHT) as f64;
    changed as f64 / total
}

fn downsample(img: &RgbImage) -> RgbImage {
    if img.dimensions() == (REFERENCE_WIDTH, REFERENCE_HEIGHT) {
        return img.clone();
    }
    imageops::resize(img, REFERENCE_WIDTH, REFERENCE_HEIGHT, FilterType::Triangle)
}

/// Rec. 601 luma, rounded.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
    y.round().min(255.0) as u8
}
