//! In-memory output connections

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{MidiMessage, OutputConnection, OutputConnector};
use crate::error::{Result, TriggerError};

/// Connection that drops every message
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputConnection for NullSink {
    fn send(&mut self, _message: &MidiMessage) -> Result<()> {
        Ok(())
    }
}

/// Connection that records every message it is given
#[derive(Debug, Clone, Default)]
pub struct VirtualSink {
    messages: Arc<Mutex<Vec<MidiMessage>>>,
    closed: Arc<Mutex<bool>>,
}

impl VirtualSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far
    pub fn messages(&self) -> Vec<MidiMessage> {
        self.messages.lock().clone()
    }

    /// Remove and return the messages received so far
    pub fn take(&self) -> Vec<MidiMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl OutputConnection for VirtualSink {
    fn send(&mut self, message: &MidiMessage) -> Result<()> {
        log::trace!("virtual output: {}", message);
        self.messages.lock().push(*message);
        Ok(())
    }

    fn close(&mut self) {
        *self.closed.lock() = true;
    }
}

/// Connector that hands out [`VirtualSink`]s.
///
/// Clones share the same sinks, so a caller can keep one clone to inspect what
/// the engine sent through another. Ports listed with [`Self::unavailable`]
/// fail to connect.
#[derive(Debug, Clone, Default)]
pub struct VirtualConnector {
    sinks: Arc<Mutex<HashMap<String, VirtualSink>>>,
    unavailable: Arc<Mutex<Vec<String>>>,
}

/// Sink name used for the default port
const DEFAULT_PORT: &str = "default";

impl VirtualConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connecting to `port` fail
    pub fn unavailable(self, port: impl Into<String>) -> Self {
        self.unavailable.lock().push(port.into());
        self
    }

    /// Sink created for `port`, if it was ever connected
    pub fn sink(&self, port: &str) -> Option<VirtualSink> {
        self.sinks.lock().get(port).cloned()
    }

    /// Sink created for the default port
    pub fn default_sink(&self) -> Option<VirtualSink> {
        self.sink(DEFAULT_PORT)
    }

    /// Messages sent to `port`
    pub fn messages(&self, port: &str) -> Vec<MidiMessage> {
        self.sink(port).map(|s| s.messages()).unwrap_or_default()
    }

    /// Number of ports connected so far
    pub fn connection_count(&self) -> usize {
        self.sinks.lock().len()
    }
}

impl OutputConnector for VirtualConnector {
    fn connect(&mut self, port: Option<&str>) -> Result<Box<dyn OutputConnection>> {
        let name = port.unwrap_or(DEFAULT_PORT);
        if self.unavailable.lock().iter().any(|p| p == name) {
            return Err(TriggerError::target(name, "port is not available"));
        }
        let sink = self
            .sinks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(sink))
    }
}
