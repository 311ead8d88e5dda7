//! Configuration for the trigger engine
//!
//! Configurations are loaded from TOML (or JSON) files:
//!
//! ```toml
//! video_path = "road.mp4"
//! output = "IAC Driver Bus 1"   # default MIDI port
//! debounce = 0.2                # seconds, default for every trigger
//!
//! [[triggers]]
//! name = "Door"
//! type = "brightness"
//! threshold = 150
//! position = { x = 25, y = 25, width = 20, height = 20 }
//! midi = { note = 60, velocity = 100, channel = 0 }
//!
//! [[triggers]]
//! name = "Sky"
//! type = "range"
//! min = 50
//! max = 200
//! output = "Synth"
//! position = { x = 0, y = 0, width = 100, height = 10 }
//! midi = { control = 7 }
//! ```
//!
//! The raw serde types mirror the file. [`EngineConfig::validate`] checks them
//! and produces one [`TriggerSpec`] per trigger, which is what the engine
//! builds triggers from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::detector::DetectionMode;
use crate::error::{Result, TriggerError};
use crate::mapping::{RangeMapping, VelocityMapping, MIDI_MAX};
use crate::output::TargetKey;
use crate::region::Region;
use crate::trigger::OutputBinding;

/// Velocity used when neither the trigger nor the file sets one
pub const DEFAULT_VELOCITY: u8 = 100;

/// Highest MIDI channel number (channels are 0-based)
pub const MAX_CHANNEL: i64 = 15;

/// Largest value a grayscale detection can produce
const MAX_DETECTED: f64 = 255.0;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Video source handed to the frame collaborator. Changes need a restart.
    pub video_path: Option<String>,
    /// Port of the default output target. Changes need a restart.
    pub output: Option<String>,
    /// Default debounce in seconds
    pub debounce: Option<f64>,
    /// Default throttle in seconds
    pub throttle: Option<f64>,
    /// Default MIDI channel
    pub channel: Option<i64>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

/// Detection mode names as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeName {
    Brightness,
    Darkness,
    Motion,
    Difference,
    Range,
    DifferenceRange,
}

impl ModeName {
    fn is_continuous(self) -> bool {
        matches!(self, ModeName::Range | ModeName::DifferenceRange)
    }
}

/// One trigger as written in a configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub mode: ModeName,
    pub position: Region,
    /// Threshold for binary modes
    pub threshold: Option<f64>,
    /// Lower end of the window for continuous modes
    pub min: Option<f64>,
    /// Upper end of the window for continuous modes
    pub max: Option<f64>,
    /// Output target name, the default target when absent
    pub output: Option<String>,
    pub debounce: Option<f64>,
    pub throttle: Option<f64>,
    pub midi: MidiConfig,
}

/// MIDI section of a trigger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MidiConfig {
    /// Note for binary modes
    pub note: Option<i64>,
    /// Controller number for continuous modes
    pub control: Option<i64>,
    pub channel: Option<i64>,
    pub velocity: Option<VelocityConfig>,
}

/// Either a constant velocity or two calibration points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VelocityConfig {
    Fixed(i64),
    Variable {
        detected_min: f64,
        detected_max: f64,
        velocity_min: i64,
        velocity_max: i64,
    },
}

/// A validated trigger definition
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    pub name: String,
    pub region: Region,
    pub mode: DetectionMode,
    pub binding: OutputBinding,
    pub target: TargetKey,
    pub debounce: Duration,
    pub throttle: Duration,
}

/// Pick a trigger's own setting, else the file-wide default, else `fallback`
pub fn resolve_setting<T>(own: Option<T>, global: Option<T>, fallback: T) -> T {
    own.or(global).unwrap_or(fallback)
}

impl EngineConfig {
    /// Parse a TOML configuration
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Parse a JSON configuration
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a configuration file, choosing the format by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        ConfigFormat::from_path(path).parse(&text)
    }

    /// Validate every trigger and resolve defaults
    pub fn validate(&self) -> Result<Vec<TriggerSpec>> {
        if let Some(channel) = self.channel {
            check_channel("<global>", channel)?;
        }
        check_seconds("<global>", "debounce", self.debounce)?;
        check_seconds("<global>", "throttle", self.throttle)?;

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.triggers.len());
        for trigger in &self.triggers {
            if !seen.insert(trigger.name.as_str()) {
                return Err(TriggerError::config(
                    &trigger.name,
                    "trigger names must be unique",
                ));
            }
            specs.push(trigger.validate(self)?);
        }
        Ok(specs)
    }
}

impl TriggerConfig {
    fn validate(&self, global: &EngineConfig) -> Result<TriggerSpec> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(TriggerError::config(name, "name must not be empty"));
        }
        self.position.validate(name)?;

        let mode = self.detection_mode()?;
        let binding = self.output_binding(global)?;

        check_seconds(name, "debounce", self.debounce)?;
        check_seconds(name, "throttle", self.throttle)?;
        let debounce = seconds(
            name,
            "debounce",
            resolve_setting(self.debounce, global.debounce, 0.0),
        )?;
        let throttle = seconds(
            name,
            "throttle",
            resolve_setting(self.throttle, global.throttle, 0.0),
        )?;

        Ok(TriggerSpec {
            name: self.name.clone(),
            region: self.position,
            mode,
            binding,
            target: TargetKey::from_name(self.output.as_deref()),
            debounce,
            throttle,
        })
    }

    fn detection_mode(&self) -> Result<DetectionMode> {
        let name = self.name.as_str();
        if self.mode.is_continuous() {
            if self.threshold.is_some() {
                return Err(TriggerError::config(
                    name,
                    "continuous modes take min/max, not threshold",
                ));
            }
            let (Some(min), Some(max)) = (self.min, self.max) else {
                return Err(TriggerError::config(name, "continuous modes require min and max"));
            };
            check_detected(name, "min", min)?;
            check_detected(name, "max", max)?;
            let range = RangeMapping::new(min, max);
            Ok(match self.mode {
                ModeName::Range => DetectionMode::Range(range),
                _ => DetectionMode::DifferenceRange(range),
            })
        } else {
            if self.min.is_some() || self.max.is_some() {
                return Err(TriggerError::config(
                    name,
                    "binary modes take threshold, not min/max",
                ));
            }
            let Some(threshold) = self.threshold else {
                return Err(TriggerError::config(name, "threshold is required"));
            };
            check_detected(name, "threshold", threshold)?;
            Ok(match self.mode {
                ModeName::Brightness => DetectionMode::Brightness { threshold },
                ModeName::Darkness => DetectionMode::Darkness { threshold },
                ModeName::Motion => DetectionMode::Motion { threshold },
                _ => DetectionMode::Difference { threshold },
            })
        }
    }

    fn output_binding(&self, global: &EngineConfig) -> Result<OutputBinding> {
        let name = self.name.as_str();
        let midi = &self.midi;
        let channel = resolve_setting(midi.channel, global.channel, 0);
        let channel = check_channel(name, channel)?;

        if self.mode.is_continuous() {
            if midi.note.is_some() || midi.velocity.is_some() {
                return Err(TriggerError::config(
                    name,
                    "continuous modes send midi.control, not notes",
                ));
            }
            let Some(control) = midi.control else {
                return Err(TriggerError::config(name, "midi.control is required"));
            };
            Ok(OutputBinding::Control {
                control: check_data_byte(name, "midi.control", control)?,
                channel,
            })
        } else {
            if midi.control.is_some() {
                return Err(TriggerError::config(
                    name,
                    "binary modes send midi.note, not controllers",
                ));
            }
            let Some(note) = midi.note else {
                return Err(TriggerError::config(name, "midi.note is required"));
            };
            let velocity = match &midi.velocity {
                None => VelocityMapping::Fixed(DEFAULT_VELOCITY),
                Some(velocity) => velocity.validate(name)?,
            };
            Ok(OutputBinding::Note {
                note: check_data_byte(name, "midi.note", note)?,
                channel,
                velocity,
            })
        }
    }
}

impl VelocityConfig {
    fn validate(&self, trigger: &str) -> Result<VelocityMapping> {
        match *self {
            VelocityConfig::Fixed(velocity) => Ok(VelocityMapping::Fixed(check_data_byte(
                trigger,
                "midi.velocity",
                velocity,
            )?)),
            VelocityConfig::Variable {
                detected_min,
                detected_max,
                velocity_min,
                velocity_max,
            } => {
                if !detected_min.is_finite() || !detected_max.is_finite() {
                    return Err(TriggerError::config(
                        trigger,
                        "velocity detected_min and detected_max must be numbers",
                    ));
                }
                if detected_min > detected_max {
                    log::warn!(
                        "Trigger '{}': velocity detected_min {} is above detected_max {}",
                        trigger,
                        detected_min,
                        detected_max
                    );
                }
                Ok(VelocityMapping::Variable {
                    detected_min,
                    detected_max,
                    velocity_min: check_data_byte(trigger, "velocity_min", velocity_min)?,
                    velocity_max: check_data_byte(trigger, "velocity_max", velocity_max)?,
                })
            }
        }
    }
}

fn check_data_byte(trigger: &str, field: &str, value: i64) -> Result<u8> {
    if (0..=MIDI_MAX as i64).contains(&value) {
        Ok(value as u8)
    } else {
        Err(TriggerError::config(
            trigger,
            format!("{} must be between 0 and 127, got {}", field, value),
        ))
    }
}

fn check_channel(trigger: &str, value: i64) -> Result<u8> {
    if (0..=MAX_CHANNEL).contains(&value) {
        Ok(value as u8)
    } else {
        Err(TriggerError::config(
            trigger,
            format!("midi channel must be between 0 and 15, got {}", value),
        ))
    }
}

fn check_detected(trigger: &str, field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=MAX_DETECTED).contains(&value) {
        Ok(())
    } else {
        Err(TriggerError::config(
            trigger,
            format!("{} must be between 0 and 255, got {}", field, value),
        ))
    }
}

fn check_seconds(trigger: &str, field: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) => seconds(trigger, field, v).map(|_| ()),
        None => Ok(()),
    }
}

/// Convert seconds to a `Duration`, rejecting negative, non-finite and
/// out-of-range values
fn seconds(trigger: &str, field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        TriggerError::config(
            trigger,
            format!("{} must be a non-negative number of seconds, got {}", field, value),
        )
    })
}

/// Serialization format of a configuration source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Json,
}

impl ConfigFormat {
    /// JSON for `.json` files, TOML for everything else
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }

    pub fn parse(self, text: &str) -> Result<EngineConfig> {
        match self {
            ConfigFormat::Toml => EngineConfig::from_toml_str(text),
            ConfigFormat::Json => EngineConfig::from_json_str(text),
        }
    }
}

/// Where the engine reads its configuration from
pub trait ConfigSource: Send {
    /// Modification marker; a different value means the configuration changed
    fn revision(&self) -> Result<SystemTime>;

    /// Read and parse the current configuration
    fn load(&self) -> Result<EngineConfig>;
}

/// Configuration file on disk, revisioned by its modification time
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Use `name` as a path, appending `.toml` when it has no extension
    pub fn new(name: impl Into<PathBuf>) -> Self {
        let mut path = name.into();
        if path.extension().is_none() {
            path.set_extension("toml");
        }
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn revision(&self) -> Result<SystemTime> {
        Ok(std::fs::metadata(&self.path)?.modified()?)
    }

    fn load(&self) -> Result<EngineConfig> {
        EngineConfig::load(&self.path)
    }
}

/// Configuration text held in memory.
///
/// Clones share the same text, so a caller can edit the configuration an
/// engine is watching. Every [`Self::set`] advances the revision.
#[derive(Debug, Clone)]
pub struct MemoryConfigSource {
    inner: Arc<Mutex<MemoryConfig>>,
    format: ConfigFormat,
}

#[derive(Debug)]
struct MemoryConfig {
    text: String,
    revision: SystemTime,
}

impl MemoryConfigSource {
    pub fn new(text: impl Into<String>, format: ConfigFormat) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryConfig {
                text: text.into(),
                revision: SystemTime::UNIX_EPOCH,
            })),
            format,
        }
    }

    pub fn toml(text: impl Into<String>) -> Self {
        Self::new(text, ConfigFormat::Toml)
    }

    /// Replace the text and advance the revision
    pub fn set(&self, text: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.text = text.into();
        inner.revision += Duration::from_secs(1);
    }

    /// Advance the revision without changing the text
    pub fn touch(&self) {
        self.inner.lock().revision += Duration::from_secs(1);
    }
}

impl ConfigSource for MemoryConfigSource {
    fn revision(&self) -> Result<SystemTime> {
        Ok(self.inner.lock().revision)
    }

    fn load(&self) -> Result<EngineConfig> {
        self.format.parse(&self.inner.lock().text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        video_path = "road.mp4"
        debounce = 0.25

        [[triggers]]
        name = "Door"
        type = "brightness"
        threshold = 150
        position = { x = 25, y = 25, width = 20, height = 20 }
        midi = { note = 60, velocity = 100, channel = 0 }

        [[triggers]]
        name = "Sky"
        type = "range"
        min = 50
        max = 200
        output = "Synth"
        throttle = 1.5
        position = { x = 0, y = 0, width = 100, height = 10 }
        midi = { control = 7, channel = 3 }

        [[triggers]]
        name = "Car"
        type = "motion"
        threshold = 12.5
        debounce = 0
        position = { x = 10, y = 60, width = 30, height = 30 }

        [triggers.midi]
        note = 62

        [triggers.midi.velocity]
        detected_min = 10
        detected_max = 100
        velocity_min = 20
        velocity_max = 120
    "#;

    fn sample_config() -> EngineConfig {
        EngineConfig::from_toml_str(SAMPLE).unwrap()
    }

    fn trigger_toml(body: &str) -> String {
        format!(
            "[[triggers]]\nname = \"T\"\nposition = {{ x = 0, y = 0, width = 50, height = 50 }}\n{}",
            body
        )
    }

    #[test]
    fn test_parse_sample() {
        let config = sample_config();
        assert_eq!(config.video_path.as_deref(), Some("road.mp4"));
        assert_eq!(config.triggers.len(), 3);
        assert_eq!(config.triggers[1].mode, ModeName::Range);
        assert_eq!(config.triggers[1].output.as_deref(), Some("Synth"));
    }

    #[test]
    fn test_validate_sample() {
        let specs = sample_config().validate().unwrap();

        let door = &specs[0];
        assert_eq!(door.mode, DetectionMode::Brightness { threshold: 150.0 });
        assert_eq!(
            door.binding,
            OutputBinding::Note { note: 60, channel: 0, velocity: VelocityMapping::Fixed(100) }
        );
        assert_eq!(door.target, TargetKey::Default);
        assert_eq!(door.debounce, Duration::from_millis(250));
        assert_eq!(door.throttle, Duration::ZERO);

        let sky = &specs[1];
        assert_eq!(sky.mode, DetectionMode::Range(RangeMapping::new(50.0, 200.0)));
        assert_eq!(sky.binding, OutputBinding::Control { control: 7, channel: 3 });
        assert_eq!(sky.target, TargetKey::Named("Synth".to_string()));
        assert_eq!(sky.throttle, Duration::from_millis(1500));

        let car = &specs[2];
        assert_eq!(car.debounce, Duration::ZERO);
        assert!(matches!(
            car.binding,
            OutputBinding::Note { note: 62, velocity: VelocityMapping::Variable { .. }, .. }
        ));
    }

    #[test]
    fn test_resolve_setting_precedence() {
        assert_eq!(resolve_setting(Some(1), Some(2), 3), 1);
        assert_eq!(resolve_setting(None, Some(2), 3), 2);
        assert_eq!(resolve_setting(None, None, 3), 3);
    }

    #[test]
    fn test_global_channel_default() {
        let text = format!(
            "channel = 9\n{}",
            trigger_toml("type = \"darkness\"\nthreshold = 10\nmidi = { note = 36 }")
        );
        let specs = EngineConfig::from_toml_str(&text).unwrap().validate().unwrap();
        assert_eq!(
            specs[0].binding,
            OutputBinding::Note { note: 36, channel: 9, velocity: VelocityMapping::Fixed(100) }
        );
    }

    #[test]
    fn test_unknown_mode_is_parse_error() {
        let text = trigger_toml("type = \"sparkle\"\nthreshold = 10\nmidi = { note = 36 }");
        assert!(matches!(
            EngineConfig::from_toml_str(&text),
            Err(TriggerError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let text = trigger_toml("type = \"brightness\"\nthreshold = 999\nmidi = { note = 60 }");
        let config = EngineConfig::from_toml_str(&text).unwrap();
        assert!(matches!(config.validate(), Err(TriggerError::Config { .. })));
    }

    #[test]
    fn test_rejects_mismatched_parameters() {
        let cases = [
            "type = \"brightness\"\nmidi = { note = 60 }",
            "type = \"brightness\"\nthreshold = 10\nmin = 0\nmax = 10\nmidi = { note = 60 }",
            "type = \"range\"\nmin = 0\nmidi = { control = 1 }",
            "type = \"range\"\nthreshold = 10\nmin = 0\nmax = 10\nmidi = { control = 1 }",
            "type = \"range\"\nmin = 0\nmax = 10\nmidi = { note = 60 }",
            "type = \"motion\"\nthreshold = 10\nmidi = { control = 1 }",
        ];
        for body in cases {
            let config = EngineConfig::from_toml_str(&trigger_toml(body)).unwrap();
            assert!(config.validate().is_err(), "accepted: {}", body);
        }
    }

    #[test]
    fn test_rejects_out_of_range_midi_values() {
        let cases = [
            "type = \"brightness\"\nthreshold = 10\nmidi = { note = 128 }",
            "type = \"brightness\"\nthreshold = 10\nmidi = { note = 60, channel = 16 }",
            "type = \"brightness\"\nthreshold = 10\nmidi = { note = 60, velocity = -1 }",
            "type = \"range\"\nmin = 0\nmax = 10\nmidi = { control = 200 }",
        ];
        for body in cases {
            let config = EngineConfig::from_toml_str(&trigger_toml(body)).unwrap();
            assert!(config.validate().is_err(), "accepted: {}", body);
        }
    }

    #[test]
    fn test_rejects_negative_timing() {
        let text = trigger_toml("type = \"brightness\"\nthreshold = 10\ndebounce = -0.5\nmidi = { note = 60 }");
        let config = EngineConfig::from_toml_str(&text).unwrap();
        assert!(config.validate().is_err());

        let text = format!(
            "throttle = -1\n{}",
            trigger_toml("type = \"brightness\"\nthreshold = 10\nmidi = { note = 60 }")
        );
        assert!(EngineConfig::from_toml_str(&text).unwrap().validate().is_err());
    }

    #[test]
    fn test_rejects_timing_too_large_for_duration() {
        let text = trigger_toml("type = \"brightness\"\nthreshold = 10\nthrottle = 1e20\nmidi = { note = 60 }");
        let err = EngineConfig::from_toml_str(&text).unwrap().validate().unwrap_err();
        assert!(matches!(err, TriggerError::Config { ref trigger, .. } if trigger == "T"));

        let text = format!(
            "debounce = 1e300\n{}",
            trigger_toml("type = \"brightness\"\nthreshold = 10\nmidi = { note = 60 }")
        );
        let err = EngineConfig::from_toml_str(&text).unwrap().validate().unwrap_err();
        assert!(matches!(err, TriggerError::Config { ref trigger, .. } if trigger == "<global>"));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut config = sample_config();
        let mut copy = config.triggers[0].clone();
        copy.position = Region::new(1.0, 1.0, 5.0, 5.0);
        config.triggers.push(copy);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn test_rejects_bad_region() {
        let mut config = sample_config();
        config.triggers[0].position = Region::new(50.0, 50.0, 0.0, 10.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_format() {
        let json = r#"{
            "triggers": [{
                "name": "Lamp",
                "type": "darkness",
                "threshold": 40,
                "position": {"x": 0, "y": 0, "width": 10, "height": 10},
                "midi": {"note": 48}
            }]
        }"#;
        let source = MemoryConfigSource::new(json, ConfigFormat::Json);
        let config = source.load().unwrap();
        assert_eq!(config.triggers[0].mode, ModeName::Darkness);
        assert_eq!(
            ConfigFormat::from_path(Path::new("road.JSON")),
            ConfigFormat::Json
        );
        assert_eq!(ConfigFormat::from_path(Path::new("road.toml")), ConfigFormat::Toml);
    }

    #[test]
    fn test_memory_source_revision() {
        let source = MemoryConfigSource::toml(SAMPLE);
        let first = source.revision().unwrap();
        source.touch();
        let second = source.revision().unwrap();
        assert!(second > first);
        source.set("");
        assert!(source.revision().unwrap() > second);
        assert!(source.load().unwrap().triggers.is_empty());
    }

    #[test]
    fn test_file_source_appends_extension() {
        assert_eq!(FileConfigSource::new("road").path(), Path::new("road.toml"));
        assert_eq!(FileConfigSource::new("road.json").path(), Path::new("road.json"));
    }

    #[test]
    fn test_file_source_roundtrip() {
        let dir = std::env::temp_dir().join(format!("vmt-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scene.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let source = FileConfigSource::new(&path);
        assert!(source.revision().is_ok());
        assert_eq!(source.load().unwrap().triggers.len(), 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
