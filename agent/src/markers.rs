use std::fmt::Write as _;

use thiserror::Error;
use tracing::debug;

use crate::config::AutoProbe;

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("no marker registered at {channel}/{name}")]
    NotFound { channel: String, name: String },
}

/// One named instrumentation point and its probe-connection state.
pub struct Marker {
    channel: String,
    name: String,
    format: String,
    connected: bool,
}

impl Marker {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn connected(&self) -> bool {
        self.connected
    }
}

/// Every instrumentation point the process has declared, with the
/// auto-probe policy applied to new registrations.
pub struct MarkerRegistry {
    markers: Vec<Marker>,
    auto_probe: AutoProbe,
}

impl MarkerRegistry {
    pub fn new() -> Self {
        MarkerRegistry {
            markers: Vec::new(),
            auto_probe: AutoProbe::Disabled,
        }
    }

    /// Install the auto-probe policy and connect the already-registered
    /// markers it selects. Later registrations are matched as they arrive.
    pub fn set_auto_probe(&mut self, policy: AutoProbe) {
        self.auto_probe = policy;
        for marker in &mut self.markers {
            if self.auto_probe.matches(&marker.channel, &marker.name) && !marker.connected {
                marker.connected = true;
                debug!(channel = %marker.channel, name = %marker.name, "auto-connected marker");
            }
        }
    }

    /// Declare an instrumentation point. Registering an existing
    /// `channel/name` pair keeps the first declaration.
    pub fn register(&mut self, channel: &str, name: &str, format: &str) {
        if self.position(channel, name).is_some() {
            return;
        }

        let connected = self.auto_probe.matches(channel, name);
        if connected {
            debug!(channel, name, "auto-connected marker");
        }

        self.markers.push(Marker {
            channel: channel.to_string(),
            name: name.to_string(),
            format: format.to_string(),
            connected,
        });
    }

    fn position(&self, channel: &str, name: &str) -> Option<usize> {
        self.markers
            .iter()
            .position(|m| m.channel == channel && m.name == name)
    }

    fn find_mut(&mut self, channel: &str, name: &str) -> Result<&mut Marker, MarkerError> {
        let index = self.position(channel, name).ok_or_else(|| MarkerError::NotFound {
            channel: channel.to_string(),
            name: name.to_string(),
        })?;
        Ok(&mut self.markers[index])
    }

    /// Connect the probe. Connecting an already-connected marker is fine.
    pub fn connect(&mut self, channel: &str, name: &str) -> Result<(), MarkerError> {
        let marker = self.find_mut(channel, name)?;
        marker.connected = true;
        debug!(channel, name, "marker connected");
        Ok(())
    }

    pub fn disconnect(&mut self, channel: &str, name: &str) -> Result<(), MarkerError> {
        let marker = self.find_mut(channel, name)?;
        marker.connected = false;
        debug!(channel, name, "marker disconnected");
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter()
    }

    /// The dump served for `list_markers` and printed for `print_markers`:
    /// one line per marker.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for marker in &self.markers {
            let _ = writeln!(
                out,
                "marker: {}/{} {} \"{}\"",
                marker.channel, marker.name, marker.connected as i32, marker.format
            );
        }
        out
    }
}

impl Default for MarkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
