//! Trigger regions
//!
//! Regions are configured as percentages of the frame so that one configuration
//! works for any resolution. They are mapped onto pixel bounds whenever the
//! frame size becomes known or changes.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TriggerError};

/// A rectangle expressed as percentages (0-100) of the frame width and height
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Absolute pixel bounds inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Create a new region
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Check that every component is a percentage and the extent is non-zero
    pub fn validate(&self, trigger: &str) -> Result<()> {
        let fields = [
            ("x", self.x),
            ("y", self.y),
            ("width", self.width),
            ("height", self.height),
        ];
        for (field, value) in fields {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(TriggerError::config(
                    trigger,
                    format!("position.{} must be between 0 and 100, got {}", field, value),
                ));
            }
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(TriggerError::config(
                trigger,
                "position width and height must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Map the region onto a frame of the given size.
    ///
    /// Width and height are clipped at the frame edge. A region whose origin
    /// falls outside the frame, or that collapses to zero pixels, is an error.
    pub fn resolve(&self, trigger: &str, frame_width: u32, frame_height: u32) -> Result<PixelRect> {
        let x = (frame_width as f64 * self.x / 100.0) as u32;
        let y = (frame_height as f64 * self.y / 100.0) as u32;
        let w = (frame_width as f64 * self.width / 100.0) as u32;
        let h = (frame_height as f64 * self.height / 100.0) as u32;

        if x >= frame_width || y >= frame_height {
            return Err(TriggerError::region(
                trigger,
                format!(
                    "origin ({}, {}) lies outside the {}x{} frame",
                    x, y, frame_width, frame_height
                ),
            ));
        }

        let width = w.min(frame_width - x);
        let height = h.min(frame_height - y);
        if width == 0 || height == 0 {
            return Err(TriggerError::region(
                trigger,
                format!(
                    "resolves to {}x{} pixels on a {}x{} frame",
                    width, height, frame_width, frame_height
                ),
            ));
        }

        Ok(PixelRect { x, y, width, height })
    }
}
