use midir::{MidiOutput, MidiOutputConnection};
use tracing::info;

use crate::error::{PlaybackError, Result};
use crate::events::MidiEvent;

/// Fire-and-forget destination for scheduled events.
pub trait OutputSink: Send {
    fn send_event(&mut self, event: &MidiEvent) -> Result<()>;

    /// Called before a burst of events, e.g. when playback (re)starts.
    fn prepare(&mut self) {}
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn send_event(&mut self, _event: &MidiEvent) -> Result<()> {
        Ok(())
    }
}

/// A hardware or virtual MIDI output port.
pub struct MidiPortSink {
    connection: MidiOutputConnection,
    port_name: String,
}

impl MidiPortSink {
    pub fn list_ports() -> Result<Vec<String>> {
        let output = MidiOutput::new("notelane").map_err(|e| PlaybackError::Output(e.to_string()))?;
        Ok(output
            .ports()
            .iter()
            .map(|p| output.port_name(p).unwrap_or_default())
            .collect())
    }

    /// Connects to the first port whose name contains `name_hint`, or the
    /// first port when no hint is given.
    pub fn connect(name_hint: Option<&str>) -> Result<Self> {
        let output = MidiOutput::new("notelane").map_err(|e| PlaybackError::Output(e.to_string()))?;
        let ports = output.ports();
        let port = match name_hint {
            Some(hint) => ports
                .iter()
                .find(|p| output.port_name(p).unwrap_or_default().contains(hint)),
            None => ports.first(),
        }
        .ok_or_else(|| {
            PlaybackError::Output(match name_hint {
                Some(hint) => format!("no MIDI output matching {hint:?}"),
                None => "no MIDI output found".into(),
            })
        })?;

        let port_name = output.port_name(port).unwrap_or_default();
        let connection = output
            .connect(port, "notelane-output")
            .map_err(|e| PlaybackError::Output(e.to_string()))?;
        info!(port = %port_name, "connected MIDI output");

        Ok(Self {
            connection,
            port_name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl OutputSink for MidiPortSink {
    fn send_event(&mut self, event: &MidiEvent) -> Result<()> {
        match event.to_bytes() {
            Some(bytes) => self
                .connection
                .send(&bytes)
                .map_err(|e| PlaybackError::Output(e.to_string())),
            None => Ok(()),
        }
    }
}
