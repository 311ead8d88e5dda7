//! System MIDI output through `midir`

use midir::{MidiOutput, MidiOutputConnection};

use super::{MidiMessage, OutputConnection, OutputConnector};
use crate::error::{Result, TriggerError};

/// Client and virtual port name announced to the MIDI system
const CLIENT_NAME: &str = "Video-MIDI-Trigger";

/// Opens system MIDI output ports.
///
/// The default port is the first port the system reports, or a virtual port
/// on Unix when there is none. Named ports match by case-insensitive substring.
#[derive(Debug, Default)]
pub struct MidirConnector;

impl MidirConnector {
    pub fn new() -> Self {
        Self
    }

    /// Names of the output ports currently available
    pub fn port_names() -> Result<Vec<String>> {
        let output = MidiOutput::new(CLIENT_NAME)
            .map_err(|e| TriggerError::Output(e.to_string()))?;
        Ok(output
            .ports()
            .iter()
            .filter_map(|p| output.port_name(p).ok())
            .collect())
    }
}

impl OutputConnector for MidirConnector {
    fn connect(&mut self, port: Option<&str>) -> Result<Box<dyn OutputConnection>> {
        let label = port.unwrap_or("default").to_string();
        let output = MidiOutput::new(CLIENT_NAME)
            .map_err(|e| TriggerError::target(label.as_str(), e.to_string()))?;

        let ports = output.ports();
        let selected = match port {
            Some(wanted) => {
                let wanted = wanted.to_lowercase();
                ports.iter().find(|p| {
                    output
                        .port_name(p)
                        .map(|n| n.to_lowercase().contains(&wanted))
                        .unwrap_or(false)
                })
            }
            None => ports.first(),
        };

        let connection = match selected {
            Some(p) => {
                let name = output.port_name(p).unwrap_or_else(|_| label.clone());
                let connection = output
                    .connect(p, CLIENT_NAME)
                    .map_err(|e| TriggerError::target(label.as_str(), e.to_string()))?;
                log::info!("MIDI: connected to {}", name);
                connection
            }
            None if port.is_none() => open_virtual(output, &label)?,
            None => return Err(TriggerError::target(label, "no matching MIDI output port")),
        };

        Ok(Box::new(MidirConnection {
            connection: Some(connection),
        }))
    }
}

#[cfg(unix)]
fn open_virtual(output: MidiOutput, label: &str) -> Result<MidiOutputConnection> {
    use midir::os::unix::VirtualOutput;

    let connection = output
        .create_virtual(CLIENT_NAME)
        .map_err(|e| TriggerError::target(label, e.to_string()))?;
    log::info!("MIDI: created virtual port '{}'", CLIENT_NAME);
    Ok(connection)
}

#[cfg(not(unix))]
fn open_virtual(_output: MidiOutput, label: &str) -> Result<MidiOutputConnection> {
    Err(TriggerError::target(label, "no MIDI output ports available"))
}

struct MidirConnection {
    connection: Option<MidiOutputConnection>,
}

impl OutputConnection for MidirConnection {
    fn send(&mut self, message: &MidiMessage) -> Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(TriggerError::Output("connection closed".to_string()));
        };
        connection
            .send(&message.to_bytes())
            .map_err(|e| TriggerError::Output(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}
