//! Trigger evaluation engine
//!
//! The [`Engine`] owns the configured triggers and the output router. It is
//! driven synchronously, one frame at a time:
//!
//! ```ignore
//! use video_midi_trigger::{Engine, FileConfigSource, VirtualConnector};
//!
//! let mut engine = Engine::new(
//!     Box::new(FileConfigSource::new("road")),
//!     Box::new(VirtualConnector::new()),
//! )?;
//! loop {
//!     let frame = next_grayscale_frame();
//!     engine.maybe_reload();
//!     engine.evaluate_frame(&frame, Instant::now())?;
//! }
//! ```
//!
//! Reloading is all-or-nothing: the new configuration is parsed, validated,
//! mapped onto the current frame size and its named outputs opened before
//! anything is replaced. Triggers keep their timing state across a reload when
//! their name is unchanged.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Instant, SystemTime};

use image::GrayImage;
use serde::Serialize;

use crate::config::{ConfigSource, EngineConfig, FileConfigSource};
use crate::error::Result;
use crate::output::{MidiMessage, OutputConnector, OutputRouter, TargetKey};
use crate::region::PixelRect;
use crate::trigger::{Trigger, TriggerSnapshot, TriggerStatus};

/// A message the engine sent on behalf of a trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerEvent {
    pub trigger: String,
    pub target: TargetKey,
    pub message: MidiMessage,
}

/// Serializable snapshot of the engine for status displays
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub frame_size: Option<(u32, u32)>,
    pub active_count: usize,
    pub triggers: Vec<TriggerStatus>,
}

/// Runs the configured triggers over incoming frames
pub struct Engine {
    source: Box<dyn ConfigSource>,
    /// Revision of the configuration last loaded (or last rejected)
    revision: SystemTime,
    config: EngineConfig,
    triggers: Vec<Trigger>,
    router: OutputRouter,
    frame_size: Option<(u32, u32)>,
    /// Set while the configuration source cannot report its revision
    source_unreadable: bool,
}

impl Engine {
    /// Load the configuration from `source` and open its named outputs.
    ///
    /// Any configuration or output error here is returned to the caller.
    pub fn new(source: Box<dyn ConfigSource>, connector: Box<dyn OutputConnector>) -> Result<Self> {
        let revision = source.revision()?;
        let config = source.load()?;
        let triggers = build_triggers(&config)?;

        let mut router = OutputRouter::new(connector, config.output.clone());
        let opened = router.open_pending(triggers.iter().map(Trigger::target))?;
        router.adopt(opened);

        log::info!("Loaded configuration with {} triggers", triggers.len());

        Ok(Self {
            source,
            revision,
            config,
            triggers,
            router,
            frame_size: None,
            source_unreadable: false,
        })
    }

    /// Load a configuration file, appending `.toml` when `path` has no extension
    pub fn open(path: impl AsRef<Path>, connector: Box<dyn OutputConnector>) -> Result<Self> {
        Self::new(
            Box::new(FileConfigSource::new(path.as_ref())),
            connector,
        )
    }

    /// Configuration currently in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Look up a trigger by name
    pub fn trigger(&self, name: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.name() == name)
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frame_size
    }

    /// Map every region onto frames of the given size.
    ///
    /// Either all regions resolve or none is changed.
    pub fn set_frame_size(&mut self, width: u32, height: u32) -> Result<()> {
        let rects = self
            .triggers
            .iter()
            .map(|t| t.spec().region.resolve(t.name(), width, height))
            .collect::<Result<Vec<PixelRect>>>()?;

        log::debug!(
            "Resolved {} regions for {}x{} frames",
            rects.len(),
            width,
            height
        );
        for (trigger, rect) in self.triggers.iter_mut().zip(rects) {
            trigger.set_rect(rect);
        }
        self.frame_size = Some((width, height));
        Ok(())
    }

    /// Reload the configuration if its revision changed.
    ///
    /// Returns `true` when a new configuration was applied. A configuration
    /// that fails to load or validate is logged and ignored until it changes
    /// again; the engine keeps running the previous one.
    pub fn maybe_reload(&mut self) -> bool {
        let revision = match self.source.revision() {
            Ok(revision) => {
                if self.source_unreadable {
                    log::info!("Configuration readable again");
                    self.source_unreadable = false;
                }
                revision
            }
            Err(e) => {
                // Editors often replace the file in several steps; report once
                if self.source_unreadable {
                    log::debug!("Configuration still unreadable: {}", e);
                } else {
                    log::warn!("Cannot check configuration for changes: {}", e);
                    self.source_unreadable = true;
                }
                return false;
            }
        };
        if revision == self.revision {
            return false;
        }

        match self.reload() {
            Ok(()) => {
                self.revision = revision;
                true
            }
            Err(e) => {
                log::error!("Configuration reload rejected, keeping previous configuration: {}", e);
                self.revision = revision;
                false
            }
        }
    }

    fn reload(&mut self) -> Result<()> {
        let config = self.source.load()?;
        let mut triggers = build_triggers(&config)?;
        if let Some((width, height)) = self.frame_size {
            for trigger in &mut triggers {
                trigger.resolve_region(width, height)?;
            }
        }
        let opened = self.router.open_pending(triggers.iter().map(Trigger::target))?;

        // Nothing below can fail, so the swap is atomic
        if config.output != self.config.output {
            log::warn!(
                "Default output changed from {:?} to {:?}; restart to apply",
                self.config.output,
                config.output
            );
        }
        if config.video_path != self.config.video_path {
            log::warn!(
                "Video source changed from {:?} to {:?}; restart to apply",
                self.config.video_path,
                config.video_path
            );
        }

        let mut snapshots: HashMap<String, TriggerSnapshot> = self
            .triggers
            .iter()
            .map(|t| (t.name().to_string(), t.snapshot()))
            .collect();

        let mut releases = Vec::new();
        for trigger in &mut triggers {
            if let Some(snapshot) = snapshots.remove(trigger.name()) {
                let release = snapshot.release();
                trigger.restore(snapshot);
                if !trigger.is_active() {
                    releases.extend(release.map(|r| (trigger.name().to_string(), r)));
                }
            }
        }
        for old in &self.triggers {
            if let Some(snapshot) = snapshots.remove(old.name()) {
                releases.extend(snapshot.release().map(|r| (old.name().to_string(), r)));
            }
        }

        self.router.adopt(opened);
        for (name, (target, message)) in releases {
            log::info!("Trigger '{}': releasing {} after reload", name, message);
            if let Ok(handle) = self.router.resolve(&target) {
                dispatch(&self.router, &handle, message);
            }
        }
        let in_use: HashSet<TargetKey> = triggers.iter().map(|t| t.target().clone()).collect();
        self.router.retain_targets(&in_use);

        log::info!("Reloaded configuration with {} triggers", triggers.len());
        self.triggers = triggers;
        self.config = config;
        Ok(())
    }

    /// Evaluate every trigger against one frame and send the resulting messages.
    ///
    /// Triggers run in configuration order. Regions are re-resolved first when
    /// the frame size differs from the previous frame.
    pub fn evaluate_frame(&mut self, frame: &GrayImage, now: Instant) -> Result<Vec<TriggerEvent>> {
        let size = frame.dimensions();
        if self.frame_size != Some(size) {
            self.set_frame_size(size.0, size.1)?;
        }

        let mut events = Vec::new();
        for trigger in &mut self.triggers {
            let Some(message) = trigger.evaluate(frame, now) else {
                continue;
            };
            let handle = self.router.resolve(trigger.target())?;
            log_message(trigger.name(), &message);
            dispatch(&self.router, &handle, message);
            events.push(TriggerEvent {
                trigger: trigger.name().to_string(),
                target: trigger.target().clone(),
                message,
            });
        }
        Ok(events)
    }

    /// Restart every trigger from scratch, releasing active notes
    pub fn reset(&mut self) -> Vec<TriggerEvent> {
        let events = self.release_with(Trigger::reset);
        log::info!("Triggers reset ({} notes released)", events.len());
        events
    }

    /// Recapture the baseline of the difference modes on the next frame
    pub fn reset_baselines(&mut self) {
        for trigger in &mut self.triggers {
            trigger.reset_baseline();
        }
        log::info!("Difference baselines cleared");
    }

    /// Release every active note and close all outputs
    pub fn shutdown(&mut self) -> Vec<TriggerEvent> {
        let events = self.release_with(Trigger::release);
        self.router.close_all();
        log::info!("Engine shut down ({} notes released)", events.len());
        events
    }

    fn release_with(&mut self, release: fn(&mut Trigger) -> Option<MidiMessage>) -> Vec<TriggerEvent> {
        let mut events = Vec::new();
        for trigger in &mut self.triggers {
            let Some(message) = release(trigger) else {
                continue;
            };
            match self.router.resolve(trigger.target()) {
                Ok(handle) => dispatch(&self.router, &handle, message),
                Err(e) => log::warn!("Trigger '{}': cannot release note: {}", trigger.name(), e),
            }
            events.push(TriggerEvent {
                trigger: trigger.name().to_string(),
                target: trigger.target().clone(),
                message,
            });
        }
        events
    }

    /// Current state of every trigger
    pub fn status(&self) -> EngineStatus {
        let triggers: Vec<TriggerStatus> = self.triggers.iter().map(TriggerStatus::from).collect();
        EngineStatus {
            frame_size: self.frame_size,
            active_count: triggers.iter().filter(|t| t.active).count(),
            triggers,
        }
    }

    /// [`Self::status`] rendered as JSON
    pub fn status_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.status())?)
    }
}

fn build_triggers(config: &EngineConfig) -> Result<Vec<Trigger>> {
    Ok(config.validate()?.into_iter().map(Trigger::new).collect())
}

fn dispatch(router: &OutputRouter, handle: &crate::output::OutputHandle, message: MidiMessage) {
    match message {
        MidiMessage::NoteOn {
            channel,
            note,
            velocity,
        } => router.emit_on(handle, note, velocity, channel),
        MidiMessage::NoteOff { channel, note } => router.emit_off(handle, note, channel),
        MidiMessage::ControlChange {
            channel,
            control,
            value,
        } => router.emit_value(handle, control, value, channel),
    }
}

fn log_message(trigger: &str, message: &MidiMessage) {
    match message {
        MidiMessage::NoteOn { .. } => log::info!("Trigger '{}' activated: {}", trigger, message),
        MidiMessage::NoteOff { .. } => log::info!("Trigger '{}' deactivated: {}", trigger, message),
        MidiMessage::ControlChange { .. } => log::debug!("Trigger '{}': {}", trigger, message),
    }
}
