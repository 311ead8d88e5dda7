//! MIDI output
//!
//! Triggers address their output by target name. The [`OutputRouter`] turns
//! those names into connections, opening each one the first time it is
//! needed, and every message is written through a lock so that a connection
//! only ever has one writer at a time.
//!
//! Connections are produced by an [`OutputConnector`]:
//! - [`VirtualConnector`] records messages in memory (headless runs and tests)
//! - [`MidirConnector`] talks to system MIDI ports (feature `midi`)

mod router;
mod sinks;

#[cfg(feature = "midi")]
mod midi;

use std::fmt;

use serde::Serialize;

use crate::error::Result;

pub use router::{OutputHandle, OutputRouter};
pub use sinks::{NullSink, VirtualConnector, VirtualSink};

#[cfg(feature = "midi")]
pub use midi::MidirConnector;

/// A channel voice message understood by the output connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, control: u8, value: u8 },
}

impl MidiMessage {
    /// Encode as a three byte MIDI message
    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiMessage::NoteOff { channel, note } => [0x80 | (channel & 0x0F), note & 0x7F, 0],
            MidiMessage::ControlChange {
                channel,
                control,
                value,
            } => [0xB0 | (channel & 0x0F), control & 0x7F, value & 0x7F],
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => write!(f, "note on {} velocity {} ch {}", note, velocity, channel),
            MidiMessage::NoteOff { channel, note } => write!(f, "note off {} ch {}", note, channel),
            MidiMessage::ControlChange {
                channel,
                control,
                value,
            } => write!(f, "cc {} = {} ch {}", control, value, channel),
        }
    }
}

/// Address of an output target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TargetKey {
    /// The process-wide default output
    Default,
    /// An explicitly named output port
    Named(String),
}

impl TargetKey {
    /// Key for an optional target name, `None` meaning the default target
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) => TargetKey::Named(name.to_string()),
            None => TargetKey::Default,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Default => write!(f, "default"),
            TargetKey::Named(name) => write!(f, "{}", name),
        }
    }
}

/// An open output connection
pub trait OutputConnection: Send {
    /// Write one message. Delivery is best effort.
    fn send(&mut self, message: &MidiMessage) -> Result<()>;

    /// Release the connection
    fn close(&mut self) {}
}

/// Opens output connections by port name
pub trait OutputConnector: Send {
    /// Open a port. `None` asks for the default port.
    fn connect(&mut self, port: Option<&str>) -> Result<Box<dyn OutputConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_bytes() {
        let msg = MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 };
        assert_eq!(msg.to_bytes(), [0x90, 60, 100]);
    }

    #[test]
    fn test_note_off_bytes() {
        let msg = MidiMessage::NoteOff { channel: 9, note: 36 };
        assert_eq!(msg.to_bytes(), [0x89, 36, 0]);
    }

    #[test]
    fn test_control_change_bytes() {
        let msg = MidiMessage::ControlChange { channel: 15, control: 7, value: 127 };
        assert_eq!(msg.to_bytes(), [0xBF, 7, 127]);
    }

    #[test]
    fn test_bytes_are_masked() {
        let msg = MidiMessage::NoteOn { channel: 17, note: 200, velocity: 255 };
        assert_eq!(msg.to_bytes(), [0x91, 200 & 0x7F, 0x7F]);
    }

    #[test]
    fn test_target_key() {
        assert_eq!(TargetKey::from_name(None), TargetKey::Default);
        assert_eq!(
            TargetKey::from_name(Some("Synth")),
            TargetKey::Named("Synth".to_string())
        );
        assert_eq!(TargetKey::Default.to_string(), "default");
    }
}
