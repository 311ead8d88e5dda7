//! Trigger state machine
//!
//! A [`Trigger`] pairs one validated configuration entry with the runtime state
//! the engine keeps for it between frames.
//!
//! Binary triggers move between inactive and active:
//! - activation happens as soon as the condition holds, unless the trigger was
//!   deactivated less than `throttle` ago, in which case it is dropped
//! - deactivation waits until the condition has been false for `debounce`
//!
//! Continuous triggers have no activity state. They report their quantized
//! value whenever it differs from the last value they sent.

use std::time::Instant;

use image::GrayImage;
use serde::Serialize;

use crate::config::TriggerSpec;
use crate::detector::{detect, extract_sample, Detection, DetectionMode, ReferenceSamples};
use crate::error::Result;
use crate::mapping::VelocityMapping;
use crate::output::{MidiMessage, TargetKey};
use crate::region::PixelRect;

/// What a trigger sends when it fires
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum OutputBinding {
    /// Note on/off pair for binary modes
    Note {
        note: u8,
        channel: u8,
        velocity: VelocityMapping,
    },
    /// Controller value for continuous modes
    Control { control: u8, channel: u8 },
}

impl OutputBinding {
    /// Whether both bindings address the same note or controller
    pub fn same_address(&self, other: &OutputBinding) -> bool {
        match (self, other) {
            (
                OutputBinding::Note { note: a, channel: ca, .. },
                OutputBinding::Note { note: b, channel: cb, .. },
            ) => a == b && ca == cb,
            (
                OutputBinding::Control { control: a, channel: ca },
                OutputBinding::Control { control: b, channel: cb },
            ) => a == b && ca == cb,
            _ => false,
        }
    }
}

/// Binary state change produced by [`Trigger::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Activated,
    Deactivated,
}

/// Mutable per-trigger state
#[derive(Debug, Clone, Default)]
pub struct TriggerState {
    pub active: bool,
    pub detected_value: f64,
    pub range_level: f64,
    pub last_continuous_value: Option<u8>,
    /// When the condition last turned false while active
    pub became_invalid_at: Option<Instant>,
    pub last_deactivated_at: Option<Instant>,
    pub references: ReferenceSamples,
}

/// State carried from an old trigger to its replacement across a reload
#[derive(Debug, Clone)]
pub struct TriggerSnapshot {
    binding: OutputBinding,
    target: TargetKey,
    active: bool,
    became_invalid_at: Option<Instant>,
    last_deactivated_at: Option<Instant>,
    last_continuous_value: Option<u8>,
    references: ReferenceSamples,
}

impl TriggerSnapshot {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Note-off for the note this snapshot holds, if any
    pub fn release(&self) -> Option<(TargetKey, MidiMessage)> {
        match self.binding {
            OutputBinding::Note { note, channel, .. } if self.active => {
                Some((self.target.clone(), MidiMessage::NoteOff { channel, note }))
            }
            _ => None,
        }
    }

    /// Whether `trigger` sends to the same place this snapshot did
    fn same_output(&self, trigger: &Trigger) -> bool {
        self.target == trigger.spec.target && self.binding.same_address(&trigger.spec.binding)
    }
}

/// A configured trigger region with its runtime state
#[derive(Debug, Clone)]
pub struct Trigger {
    spec: TriggerSpec,
    rect: Option<PixelRect>,
    state: TriggerState,
}

impl Trigger {
    /// Create an inactive trigger from a validated definition
    pub fn new(spec: TriggerSpec) -> Self {
        Self {
            spec,
            rect: None,
            state: TriggerState::default(),
        }
    }

    /// Identity used to match triggers across reloads
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TriggerSpec {
        &self.spec
    }

    pub fn mode(&self) -> &DetectionMode {
        &self.spec.mode
    }

    pub fn target(&self) -> &TargetKey {
        &self.spec.target
    }

    pub fn state(&self) -> &TriggerState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// Pixel bounds for the current frame size
    pub fn rect(&self) -> Option<PixelRect> {
        self.rect
    }

    /// Map the region onto a frame of the given size
    pub fn resolve_region(&mut self, frame_width: u32, frame_height: u32) -> Result<PixelRect> {
        let rect = self
            .spec
            .region
            .resolve(&self.spec.name, frame_width, frame_height)?;
        self.rect = Some(rect);
        Ok(rect)
    }

    pub(crate) fn set_rect(&mut self, rect: PixelRect) {
        self.rect = Some(rect);
    }

    /// Run detection on a frame and return the message to send, if any
    pub fn evaluate(&mut self, frame: &GrayImage, now: Instant) -> Option<MidiMessage> {
        let rect = self.rect?;
        if rect.x + rect.width > frame.width() || rect.y + rect.height > frame.height() {
            log::debug!(
                "Trigger '{}': region {:?} does not fit the {}x{} frame",
                self.spec.name,
                rect,
                frame.width(),
                frame.height()
            );
            return None;
        }

        let sample = extract_sample(frame, rect);
        let detection = detect(&self.spec.mode, sample, &mut self.state.references);
        self.state.detected_value = detection.value();

        match detection {
            Detection::Continuous { level, output, .. } => {
                self.state.range_level = level;
                self.update_continuous(output)
                    .map(|value| self.control_message(value))
            }
            Detection::Binary { triggered, .. } => match self.step(triggered, now)? {
                Transition::Activated => Some(self.note_on_message()),
                Transition::Deactivated => self.note_off_message(),
            },
        }
    }

    /// Apply one frame's condition to the binary state machine
    pub fn step(&mut self, triggered: bool, now: Instant) -> Option<Transition> {
        let state = &mut self.state;

        if triggered {
            state.became_invalid_at = None;
            if state.active {
                return None;
            }
            let throttled = match state.last_deactivated_at {
                Some(at) if !self.spec.throttle.is_zero() => {
                    now.saturating_duration_since(at) < self.spec.throttle
                }
                _ => false,
            };
            if throttled {
                return None;
            }
            state.active = true;
            return Some(Transition::Activated);
        }

        if !state.active {
            return None;
        }
        let since = *state.became_invalid_at.get_or_insert(now);
        if self.spec.debounce.is_zero() || now.saturating_duration_since(since) >= self.spec.debounce
        {
            state.active = false;
            state.became_invalid_at = None;
            state.last_deactivated_at = Some(now);
            Some(Transition::Deactivated)
        } else {
            None
        }
    }

    /// Record a continuous output value, returning it only when it changed
    pub fn update_continuous(&mut self, value: u8) -> Option<u8> {
        if self.state.last_continuous_value == Some(value) {
            return None;
        }
        self.state.last_continuous_value = Some(value);
        Some(value)
    }

    /// Note-on velocity for the current detected value.
    ///
    /// # Panics
    ///
    /// Panics for continuous triggers, which have no velocity.
    pub fn velocity(&self) -> u8 {
        match self.spec.binding {
            OutputBinding::Note { velocity, .. } => velocity.velocity(self.state.detected_value),
            OutputBinding::Control { .. } => panic!(
                "velocity requested for continuous trigger '{}'",
                self.spec.name
            ),
        }
    }

    fn note_on_message(&self) -> MidiMessage {
        match self.spec.binding {
            OutputBinding::Note { note, channel, .. } => MidiMessage::NoteOn {
                channel,
                note,
                velocity: self.velocity(),
            },
            OutputBinding::Control { .. } => panic!(
                "note requested for continuous trigger '{}'",
                self.spec.name
            ),
        }
    }

    fn note_off_message(&self) -> Option<MidiMessage> {
        match self.spec.binding {
            OutputBinding::Note { note, channel, .. } => {
                Some(MidiMessage::NoteOff { channel, note })
            }
            OutputBinding::Control { .. } => None,
        }
    }

    fn control_message(&self, value: u8) -> MidiMessage {
        match self.spec.binding {
            OutputBinding::Control { control, channel } => MidiMessage::ControlChange {
                channel,
                control,
                value,
            },
            // Validation pairs continuous modes with controllers
            OutputBinding::Note { .. } => panic!(
                "controller value requested for note trigger '{}'",
                self.spec.name
            ),
        }
    }

    /// Return to the initial state, releasing the note if the trigger is active
    pub fn reset(&mut self) -> Option<MidiMessage> {
        let release = if self.state.active {
            self.state.active = false;
            self.note_off_message()
        } else {
            None
        };
        self.state.references.clear();
        self.state.became_invalid_at = None;
        self.state.last_deactivated_at = None;
        release
    }

    /// Forget the difference baseline so the next frame captures a new one
    pub fn reset_baseline(&mut self) {
        self.state.references.clear_baseline();
    }

    /// Note-off for an active trigger, leaving it inactive
    pub fn release(&mut self) -> Option<MidiMessage> {
        if !self.state.active {
            return None;
        }
        self.state.active = false;
        self.note_off_message()
    }

    /// Capture the state that survives a reload
    pub fn snapshot(&self) -> TriggerSnapshot {
        TriggerSnapshot {
            binding: self.spec.binding,
            target: self.spec.target.clone(),
            active: self.state.active,
            became_invalid_at: self.state.became_invalid_at,
            last_deactivated_at: self.state.last_deactivated_at,
            last_continuous_value: self.state.last_continuous_value,
            references: self.state.references.clone(),
        }
    }

    /// Take over the state of the trigger this one replaces.
    ///
    /// Timing and reference samples always carry over. Activity and the last
    /// controller value only carry over when the output address is unchanged;
    /// the caller is expected to release a note the old binding still holds.
    pub fn restore(&mut self, snapshot: TriggerSnapshot) {
        let same_output = snapshot.same_output(self);
        self.state.became_invalid_at = snapshot.became_invalid_at;
        self.state.last_deactivated_at = snapshot.last_deactivated_at;
        self.state.references = snapshot.references;
        if same_output {
            self.state.active = snapshot.active;
            self.state.last_continuous_value = snapshot.last_continuous_value;
        }
    }
}

/// Serializable view of a trigger for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct TriggerStatus {
    pub name: String,
    pub mode: &'static str,
    pub target: String,
    pub active: bool,
    pub detected_value: f64,
    pub range_level: f64,
    pub last_continuous_value: Option<u8>,
    pub region: Option<PixelRect>,
}

impl From<&Trigger> for TriggerStatus {
    fn from(trigger: &Trigger) -> Self {
        Self {
            name: trigger.spec.name.clone(),
            mode: trigger.spec.mode.name(),
            target: trigger.spec.target.to_string(),
            active: trigger.state.active,
            detected_value: trigger.state.detected_value,
            range_level: trigger.state.range_level,
            last_continuous_value: trigger.state.last_continuous_value,
            region: trigger.rect,
        }
    }
}
