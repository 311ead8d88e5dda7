//! Video MIDI Trigger
//!
//! Watches rectangular regions of a video stream and turns what happens in
//! them into MIDI messages. Binary triggers (brightness, darkness, motion,
//! difference) send note-on/note-off pairs with debounce and throttle.
//! Continuous triggers (range, difference-range) send control change values.
//!
//! The trigger configuration is reloaded while running without losing the
//! state of triggers that survive the edit.
//!
//! Frames come from the caller through [`runner::FrameSource`]; MIDI leaves
//! through an [`output::OutputConnector`]. Enable the `midi` feature for
//! system MIDI ports.

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod output;
pub mod region;
pub mod runner;
pub mod trigger;

// Re-export commonly used types
pub use config::{ConfigFormat, ConfigSource, EngineConfig, FileConfigSource, MemoryConfigSource};
pub use detector::{Detection, DetectionMode};
pub use engine::{Engine, EngineStatus, TriggerEvent};
pub use error::{Result, TriggerError};
pub use mapping::{RangeMapping, VelocityMapping};
pub use output::{MidiMessage, OutputConnector, TargetKey, VirtualConnector};
pub use region::{PixelRect, Region};
pub use runner::{FrameSequence, FrameSource, Runner, RunStats};
pub use trigger::{OutputBinding, Trigger, TriggerStatus};

#[cfg(feature = "midi")]
pub use output::MidirConnector;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
