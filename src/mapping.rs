//! Mapping detected values onto MIDI values

use serde::Serialize;

/// Largest value a MIDI data byte can carry
pub const MIDI_MAX: u8 = 127;

/// How a binary trigger chooses its note-on velocity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum VelocityMapping {
    /// Always send the same velocity
    Fixed(u8),
    /// Interpolate between two calibration points
    Variable {
        detected_min: f64,
        detected_max: f64,
        velocity_min: u8,
        velocity_max: u8,
    },
}

impl VelocityMapping {
    /// Velocity for a detected value, always within 0-127
    pub fn velocity(&self, detected: f64) -> u8 {
        match *self {
            VelocityMapping::Fixed(velocity) => velocity.min(MIDI_MAX),
            VelocityMapping::Variable {
                detected_min,
                detected_max,
                velocity_min,
                velocity_max,
            } => {
                if detected_min == detected_max {
                    return velocity_min.min(MIDI_MAX);
                }
                let lo = detected_min.min(detected_max);
                let hi = detected_min.max(detected_max);
                let clamped = detected.clamp(lo, hi);
                let t = (clamped - detected_min) / (detected_max - detected_min);
                let v = velocity_min as f64 + t * (velocity_max as f64 - velocity_min as f64);
                v.round().clamp(0.0, MIDI_MAX as f64) as u8
            }
        }
    }
}

/// Normalization window for continuous triggers
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RangeMapping {
    pub min: f64,
    pub max: f64,
}

impl RangeMapping {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Normalized level in 0.0-1.0.
    ///
    /// `min` maps to 0 and `max` to 1 even when `min > max`, which inverts the
    /// response. An empty window yields 0.
    pub fn level(&self, detected: f64) -> f64 {
        if self.min == self.max {
            return 0.0;
        }
        let lo = self.min.min(self.max);
        let hi = self.min.max(self.max);
        let clamped = detected.clamp(lo, hi);
        (clamped - self.min) / (self.max - self.min)
    }

    /// Level quantized onto 0-127
    pub fn value(&self, detected: f64) -> u8 {
        quantize(self.level(detected))
    }
}

/// Quantize a 0.0-1.0 level onto 0-127
pub fn quantize(level: f64) -> u8 {
    (level.clamp(0.0, 1.0) * MIDI_MAX as f64).round() as u8
}
