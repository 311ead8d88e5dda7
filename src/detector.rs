//! Region detection algorithms
//!
//! Every detection mode reduces the grayscale pixels of a trigger region to a
//! single scalar. Binary modes compare that scalar against a threshold, while
//! continuous modes normalize it into a 0-127 controller value.

use image::GrayImage;
use serde::Serialize;

use crate::mapping::RangeMapping;
use crate::region::PixelRect;

/// Detection algorithm together with the parameters its math needs
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum DetectionMode {
    /// Mean intensity at or above the threshold
    Brightness { threshold: f64 },
    /// Mean intensity at or below the threshold
    Darkness { threshold: f64 },
    /// Frame-to-frame mean absolute difference at or above the threshold
    Motion { threshold: f64 },
    /// Mean absolute difference from a fixed baseline at or above the threshold
    Difference { threshold: f64 },
    /// Mean intensity mapped onto a controller value
    Range(RangeMapping),
    /// Difference from the baseline mapped onto a controller value
    DifferenceRange(RangeMapping),
}

impl DetectionMode {
    /// Configuration name of the mode
    pub fn name(&self) -> &'static str {
        match self {
            DetectionMode::Brightness { .. } => "brightness",
            DetectionMode::Darkness { .. } => "darkness",
            DetectionMode::Motion { .. } => "motion",
            DetectionMode::Difference { .. } => "difference",
            DetectionMode::Range(_) => "range",
            DetectionMode::DifferenceRange(_) => "difference-range",
        }
    }

    /// Whether the mode produces a controller value instead of a note
    pub fn is_continuous(&self) -> bool {
        matches!(
            self,
            DetectionMode::Range(_) | DetectionMode::DifferenceRange(_)
        )
    }
}

/// Outcome of running a detector over one region sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Detection {
    Binary { value: f64, triggered: bool },
    Continuous { value: f64, level: f64, output: u8 },
}

impl Detection {
    /// The raw detected scalar
    pub fn value(&self) -> f64 {
        match *self {
            Detection::Binary { value, .. } | Detection::Continuous { value, .. } => value,
        }
    }

    fn idle(mode: &DetectionMode) -> Self {
        if mode.is_continuous() {
            Detection::Continuous {
                value: 0.0,
                level: 0.0,
                output: 0,
            }
        } else {
            Detection::Binary {
                value: 0.0,
                triggered: false,
            }
        }
    }
}

/// Reference samples kept between frames for the difference-based modes
#[derive(Debug, Clone, Default)]
pub struct ReferenceSamples {
    /// Sample from the previous frame (motion)
    pub previous: Option<GrayImage>,
    /// Fixed baseline (difference, difference-range)
    pub baseline: Option<GrayImage>,
}

impl ReferenceSamples {
    /// Drop every stored sample
    pub fn clear(&mut self) {
        self.previous = None;
        self.baseline = None;
    }

    /// Drop only the difference baseline
    pub fn clear_baseline(&mut self) {
        self.baseline = None;
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }
}

/// Copy the pixels of `rect` out of a frame
pub fn extract_sample(frame: &GrayImage, rect: PixelRect) -> GrayImage {
    GrayImage::from_fn(rect.width, rect.height, |x, y| {
        *frame.get_pixel(rect.x + x, rect.y + y)
    })
}

/// Mean pixel intensity, 0.0 for an empty sample
pub fn mean_intensity(sample: &GrayImage) -> f64 {
    let pixels = sample.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    let sum: u64 = pixels.iter().map(|&p| p as u64).sum();
    sum as f64 / pixels.len() as f64
}

/// Mean absolute per-pixel difference of two samples of the same size
pub fn mean_abs_difference(a: &GrayImage, b: &GrayImage) -> f64 {
    let (a, b) = (a.as_raw(), b.as_raw());
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let sum: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&p, &q)| (p as i16 - q as i16).unsigned_abs() as u64)
        .sum();
    sum as f64 / a.len() as f64
}

fn same_shape(a: &GrayImage, b: &GrayImage) -> bool {
    a.dimensions() == b.dimensions()
}

/// Run `mode` over a region sample, updating the reference samples.
///
/// Motion warms up for one frame: with no previous sample, or one of a
/// different size, it stores the sample and reports nothing. The difference
/// modes capture their baseline the same way and then never update it until
/// it is cleared.
pub fn detect(mode: &DetectionMode, sample: GrayImage, refs: &mut ReferenceSamples) -> Detection {
    match mode {
        DetectionMode::Brightness { threshold } => {
            let value = mean_intensity(&sample);
            Detection::Binary {
                value,
                triggered: value >= *threshold,
            }
        }
        DetectionMode::Darkness { threshold } => {
            let value = mean_intensity(&sample);
            Detection::Binary {
                value,
                triggered: value <= *threshold,
            }
        }
        DetectionMode::Motion { threshold } => {
            let detection = match refs.previous.as_ref() {
                Some(previous) if same_shape(previous, &sample) => {
                    let value = mean_abs_difference(&sample, previous);
                    Detection::Binary {
                        value,
                        triggered: value >= *threshold,
                    }
                }
                _ => Detection::idle(mode),
            };
            refs.previous = Some(sample);
            detection
        }
        DetectionMode::Difference { threshold } => match baseline_difference(&sample, refs) {
            Some(value) => Detection::Binary {
                value,
                triggered: value >= *threshold,
            },
            None => Detection::idle(mode),
        },
        DetectionMode::Range(range) => {
            let value = mean_intensity(&sample);
            Detection::Continuous {
                value,
                level: range.level(value),
                output: range.value(value),
            }
        }
        DetectionMode::DifferenceRange(range) => match baseline_difference(&sample, refs) {
            Some(value) => Detection::Continuous {
                value,
                level: range.level(value),
                output: range.value(value),
            },
            None => Detection::idle(mode),
        },
    }
}

/// Difference from the stored baseline, or `None` when this sample became the baseline
fn baseline_difference(sample: &GrayImage, refs: &mut ReferenceSamples) -> Option<f64> {
    match refs.baseline.as_ref() {
        Some(baseline) if same_shape(baseline, sample) => {
            Some(mean_abs_difference(sample, baseline))
        }
        _ => {
            refs.baseline = Some(sample.clone());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn flat(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([value]))
    }

    #[test]
    fn test_extract_sample() {
        let frame = GrayImage::from_fn(10, 10, |x, y| Luma([(x + 10 * y) as u8]));
        let rect = PixelRect { x: 2, y: 3, width: 4, height: 2 };
        let sample = extract_sample(&frame, rect);
        assert_eq!(sample.dimensions(), (4, 2));
        assert_eq!(sample.get_pixel(0, 0)[0], 32);
        assert_eq!(sample.get_pixel(3, 1)[0], 45);
    }

    #[test]
    fn test_mean_intensity() {
        let mut sample = flat(2, 2, 0);
        sample.put_pixel(0, 0, Luma([200]));
        sample.put_pixel(1, 1, Luma([100]));
        assert_eq!(mean_intensity(&sample), 75.0);
    }

    #[test]
    fn test_brightness_and_darkness() {
        let mut refs = ReferenceSamples::default();
        let bright = DetectionMode::Brightness { threshold: 150.0 };
        let dark = DetectionMode::Darkness { threshold: 150.0 };

        assert_eq!(
            detect(&bright, flat(4, 4, 150), &mut refs),
            Detection::Binary { value: 150.0, triggered: true }
        );
        assert_eq!(
            detect(&bright, flat(4, 4, 149), &mut refs),
            Detection::Binary { value: 149.0, triggered: false }
        );
        assert_eq!(
            detect(&dark, flat(4, 4, 150), &mut refs),
            Detection::Binary { value: 150.0, triggered: true }
        );
        assert_eq!(
            detect(&dark, flat(4, 4, 151), &mut refs),
            Detection::Binary { value: 151.0, triggered: false }
        );
        assert!(refs.previous.is_none());
        assert!(refs.baseline.is_none());
    }

    #[test]
    fn test_motion_warm_up() {
        let mut refs = ReferenceSamples::default();
        let mode = DetectionMode::Motion { threshold: 0.0 };

        // Threshold 0 would trigger on any comparison, but the first call has nothing to compare
        let first = detect(&mode, flat(4, 4, 255), &mut refs);
        assert_eq!(first, Detection::Binary { value: 0.0, triggered: false });

        let second = detect(&mode, flat(4, 4, 55), &mut refs);
        assert_eq!(second, Detection::Binary { value: 200.0, triggered: true });
    }

    #[test]
    fn test_motion_resets_on_resize() {
        let mut refs = ReferenceSamples::default();
        let mode = DetectionMode::Motion { threshold: 1.0 };

        detect(&mode, flat(4, 4, 0), &mut refs);
        let resized = detect(&mode, flat(6, 4, 255), &mut refs);
        assert_eq!(resized, Detection::Binary { value: 0.0, triggered: false });
        assert_eq!(refs.previous.as_ref().map(|p| p.dimensions()), Some((6, 4)));
    }

    #[test]
    fn test_motion_compares_consecutive_frames() {
        let mut refs = ReferenceSamples::default();
        let mode = DetectionMode::Motion { threshold: 10.0 };

        detect(&mode, flat(2, 2, 0), &mut refs);
        assert!(matches!(
            detect(&mode, flat(2, 2, 100), &mut refs),
            Detection::Binary { triggered: true, .. }
        ));
        // Same as the previous frame now, so no motion
        assert_eq!(
            detect(&mode, flat(2, 2, 100), &mut refs),
            Detection::Binary { value: 0.0, triggered: false }
        );
    }

    #[test]
    fn test_difference_baseline_is_fixed() {
        let mut refs = ReferenceSamples::default();
        let mode = DetectionMode::Difference { threshold: 20.0 };

        let first = detect(&mode, flat(3, 3, 40), &mut refs);
        assert_eq!(first, Detection::Binary { value: 0.0, triggered: false });

        for i in 0..1000u32 {
            detect(&mode, flat(3, 3, (i % 256) as u8), &mut refs);
        }

        let same = detect(&mode, flat(3, 3, 40), &mut refs);
        assert_eq!(same, Detection::Binary { value: 0.0, triggered: false });

        let drifted = detect(&mode, flat(3, 3, 90), &mut refs);
        assert_eq!(drifted, Detection::Binary { value: 50.0, triggered: true });
    }

    #[test]
    fn test_difference_recaptures_after_clear() {
        let mut refs = ReferenceSamples::default();
        let mode = DetectionMode::Difference { threshold: 20.0 };

        detect(&mode, flat(3, 3, 0), &mut refs);
        refs.clear_baseline();
        detect(&mode, flat(3, 3, 200), &mut refs);
        assert_eq!(
            detect(&mode, flat(3, 3, 200), &mut refs),
            Detection::Binary { value: 0.0, triggered: false }
        );
    }

    #[test]
    fn test_range_detection() {
        let mut refs = ReferenceSamples::default();
        let mode = DetectionMode::Range(RangeMapping::new(50.0, 200.0));

        assert_eq!(
            detect(&mode, flat(2, 2, 125), &mut refs),
            Detection::Continuous { value: 125.0, level: 0.5, output: 64 }
        );
        assert!(matches!(
            detect(&mode, flat(2, 2, 250), &mut refs),
            Detection::Continuous { output: 127, .. }
        ));
    }

    #[test]
    fn test_difference_range_before_baseline() {
        let mut refs = ReferenceSamples::default();
        // Inverted window would map a zero difference to 127
        let mode = DetectionMode::DifferenceRange(RangeMapping::new(100.0, 0.0));

        let first = detect(&mode, flat(2, 2, 10), &mut refs);
        assert_eq!(first, Detection::Continuous { value: 0.0, level: 0.0, output: 0 });
        assert!(refs.has_baseline());

        let next = detect(&mode, flat(2, 2, 60), &mut refs);
        assert_eq!(next, Detection::Continuous { value: 50.0, level: 0.5, output: 64 });
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(DetectionMode::Motion { threshold: 1.0 }.name(), "motion");
        assert_eq!(
            DetectionMode::DifferenceRange(RangeMapping::new(0.0, 1.0)).name(),
            "difference-range"
        );
        assert!(DetectionMode::Range(RangeMapping::new(0.0, 1.0)).is_continuous());
        assert!(!DetectionMode::Darkness { threshold: 1.0 }.is_continuous());
    }
}
