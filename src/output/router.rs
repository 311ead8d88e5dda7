//! Target name to connection routing

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{MidiMessage, NullSink, OutputConnection, OutputConnector, TargetKey};
use crate::error::Result;

/// Shared handle to an open connection.
///
/// Writes go through the mutex, so one connection never sees interleaved messages.
#[derive(Clone)]
pub struct OutputHandle {
    target: TargetKey,
    connection: Arc<Mutex<Box<dyn OutputConnection>>>,
}

impl OutputHandle {
    fn new(target: TargetKey, connection: Box<dyn OutputConnection>) -> Self {
        Self {
            target,
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    /// Send a message, ignoring delivery failures
    pub fn send(&self, message: MidiMessage) {
        if let Err(e) = self.connection.lock().send(&message) {
            log::debug!("Dropped {} on '{}': {}", message, self.target, e);
        }
    }
}

impl std::fmt::Debug for OutputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHandle")
            .field("target", &self.target)
            .finish()
    }
}

/// Lazily opened connections keyed by target
pub struct OutputRouter {
    connector: Box<dyn OutputConnector>,
    /// Port the default target connects to; `None` lets the connector choose
    default_port: Option<String>,
    connections: HashMap<TargetKey, OutputHandle>,
}

impl OutputRouter {
    /// Create a router that opens connections through `connector`
    pub fn new(connector: Box<dyn OutputConnector>, default_port: Option<String>) -> Self {
        Self {
            connector,
            default_port,
            connections: HashMap::new(),
        }
    }

    /// Port name used for the default target
    pub fn default_port(&self) -> Option<&str> {
        self.default_port.as_deref()
    }

    /// Return the connection for `target`, opening it on first use.
    ///
    /// A named target that cannot be opened is an error. The default target
    /// falls back to a [`NullSink`] so the engine can run without any output.
    pub fn resolve(&mut self, target: &TargetKey) -> Result<OutputHandle> {
        if let Some(handle) = self.connections.get(target) {
            return Ok(handle.clone());
        }

        let connection: Box<dyn OutputConnection> = match target {
            TargetKey::Named(name) => self.connector.connect(Some(name))?,
            TargetKey::Default => match self.connector.connect(self.default_port.as_deref()) {
                Ok(connection) => connection,
                Err(e) => {
                    log::warn!("Default output unavailable ({}), sending to a null sink", e);
                    Box::new(NullSink)
                }
            },
        };

        log::info!("Opened output '{}'", target);
        let handle = OutputHandle::new(target.clone(), connection);
        self.connections.insert(target.clone(), handle.clone());
        Ok(handle)
    }

    /// Open every named target in `targets` that is not open yet, without
    /// caching the new connections.
    ///
    /// Either all of them open or none stays open. Pass the result to
    /// [`Self::adopt`] once the caller commits to using them.
    pub fn open_pending<'a, I>(&mut self, targets: I) -> Result<Vec<OutputHandle>>
    where
        I: IntoIterator<Item = &'a TargetKey>,
    {
        let mut pending: Vec<OutputHandle> = Vec::new();
        for target in targets {
            let TargetKey::Named(name) = target else {
                continue;
            };
            if self.connections.contains_key(target) || pending.iter().any(|h| &h.target == target) {
                continue;
            }
            match self.connector.connect(Some(name.as_str())) {
                Ok(connection) => pending.push(OutputHandle::new(target.clone(), connection)),
                Err(e) => {
                    for handle in pending {
                        handle.connection.lock().close();
                    }
                    return Err(e);
                }
            }
        }
        Ok(pending)
    }

    /// Cache connections opened by [`Self::open_pending`]
    pub fn adopt(&mut self, handles: Vec<OutputHandle>) {
        for handle in handles {
            log::info!("Opened output '{}'", handle.target);
            self.connections.insert(handle.target.clone(), handle);
        }
    }

    /// Close named connections whose target is not in `keep`.
    ///
    /// The default target stays open.
    pub fn retain_targets(&mut self, keep: &HashSet<TargetKey>) {
        self.connections.retain(|target, handle| {
            if *target == TargetKey::Default || keep.contains(target) {
                return true;
            }
            handle.connection.lock().close();
            log::info!("Closed unused output '{}'", target);
            false
        });
    }

    /// Whether a connection for `target` is already open
    pub fn is_open(&self, target: &TargetKey) -> bool {
        self.connections.contains_key(target)
    }

    pub fn emit_on(&self, handle: &OutputHandle, note: u8, velocity: u8, channel: u8) {
        handle.send(MidiMessage::NoteOn {
            channel,
            note,
            velocity,
        });
    }

    pub fn emit_off(&self, handle: &OutputHandle, note: u8, channel: u8) {
        handle.send(MidiMessage::NoteOff { channel, note });
    }

    pub fn emit_value(&self, handle: &OutputHandle, control: u8, value: u8, channel: u8) {
        handle.send(MidiMessage::ControlChange {
            channel,
            control,
            value,
        });
    }

    /// Close every open connection
    pub fn close_all(&mut self) {
        for (target, handle) in self.connections.drain() {
            handle.connection.lock().close();
            log::debug!("Closed output '{}'", target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TriggerError;
    use crate::output::VirtualConnector;

    #[test]
    fn test_resolve_caches_connections() {
        let connector = VirtualConnector::new();
        let mut router = OutputRouter::new(Box::new(connector.clone()), None);
        let key = TargetKey::Named("Synth".to_string());

        assert!(!router.is_open(&key));
        let first = router.resolve(&key).unwrap();
        let second = router.resolve(&key).unwrap();
        assert!(router.is_open(&key));
        assert_eq!(connector.connection_count(), 1);

        router.emit_on(&first, 60, 100, 0);
        router.emit_off(&second, 60, 0);
        assert_eq!(
            connector.messages("Synth"),
            vec![
                MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 },
                MidiMessage::NoteOff { channel: 0, note: 60 },
            ]
        );
    }

    #[test]
    fn test_named_target_failure_is_fatal() {
        let connector = VirtualConnector::new().unavailable("Missing");
        let mut router = OutputRouter::new(Box::new(connector), None);
        let result = router.resolve(&TargetKey::Named("Missing".to_string()));
        assert!(matches!(result, Err(TriggerError::Target { .. })));
        assert!(!router.is_open(&TargetKey::Named("Missing".to_string())));
    }

    #[test]
    fn test_default_target_falls_back_to_null_sink() {
        let connector = VirtualConnector::new().unavailable("Absent");
        let mut router = OutputRouter::new(Box::new(connector.clone()), Some("Absent".to_string()));
        let handle = router.resolve(&TargetKey::Default).unwrap();
        router.emit_value(&handle, 7, 64, 0);
        assert!(router.is_open(&TargetKey::Default));
        assert_eq!(connector.connection_count(), 0);
    }

    #[test]
    fn test_default_target_uses_default_port() {
        let connector = VirtualConnector::new();
        let mut router = OutputRouter::new(Box::new(connector.clone()), Some("IAC Bus".to_string()));
        let handle = router.resolve(&TargetKey::Default).unwrap();
        router.emit_value(&handle, 7, 64, 2);
        assert_eq!(
            connector.messages("IAC Bus"),
            vec![MidiMessage::ControlChange { channel: 2, control: 7, value: 64 }]
        );
    }

    #[test]
    fn test_close_all() {
        let connector = VirtualConnector::new();
        let mut router = OutputRouter::new(Box::new(connector.clone()), None);
        router.resolve(&TargetKey::Default).unwrap();
        router.close_all();
        assert!(connector.default_sink().unwrap().is_closed());
        assert!(!router.is_open(&TargetKey::Default));
    }

    #[test]
    fn test_open_pending_is_all_or_nothing() {
        let connector = VirtualConnector::new().unavailable("Missing");
        let mut router = OutputRouter::new(Box::new(connector.clone()), None);
        let synth = TargetKey::Named("Synth".to_string());
        let missing = TargetKey::Named("Missing".to_string());

        assert!(router.open_pending([&synth, &missing]).is_err());
        assert!(!router.is_open(&synth));
        assert!(connector.sink("Synth").unwrap().is_closed());

        let pending = router.open_pending([&synth, &synth, &TargetKey::Default]).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!router.is_open(&synth));
        router.adopt(pending);
        assert!(router.is_open(&synth));
        assert!(router.open_pending([&synth]).unwrap().is_empty());
    }

    #[test]
    fn test_retain_targets_closes_unused() {
        let connector = VirtualConnector::new();
        let mut router = OutputRouter::new(Box::new(connector.clone()), None);
        let synth = TargetKey::Named("Synth".to_string());
        let drums = TargetKey::Named("Drums".to_string());
        router.resolve(&synth).unwrap();
        router.resolve(&drums).unwrap();
        router.resolve(&TargetKey::Default).unwrap();

        router.retain_targets(&HashSet::from([synth.clone()]));

        assert!(router.is_open(&synth));
        assert!(router.is_open(&TargetKey::Default));
        assert!(!router.is_open(&drums));
        assert!(connector.sink("Drums").unwrap().is_closed());
    }
}
