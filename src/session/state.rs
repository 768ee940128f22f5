//! Port state of an imported device.
//!
//! ```text
//! Unplugged -> Connecting -> Connected -> Plugged -> Disconnected -> Unplugging -> Unplugged
//!                  |             |                        |   ^
//!                  +-------------+--> Disconnected        +---+ (reconnect to Plugged)
//!                  +-------------+--> Unplugged
//! ```
//!
//! Only `Plugged` and `Disconnected` carry a port number.

use core::num::NonZeroU16;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumIter,
    serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceState {
    Unplugged,
    Connecting,
    Connected,
    Plugged,
    Disconnected,
    Unplugging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid port state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: DeviceState,
    pub to: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PortState {
    state: DeviceState,
    port: Option<NonZeroU16>,
}

impl Default for PortState {
    fn default() -> Self {
        Self::unplugged()
    }
}

impl PortState {
    pub const fn unplugged() -> Self {
        Self {
            state: DeviceState::Unplugged,
            port: None,
        }
    }

    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Zero unless plugged or disconnected
    pub fn port(&self) -> u16 {
        self.port.map_or(0, NonZeroU16::get)
    }

    /// New submits are only accepted while the remote side is reachable
    pub const fn accepts_submits(&self) -> bool {
        matches!(self.state, DeviceState::Connected | DeviceState::Plugged)
    }

    fn to(self, state: DeviceState, port: Option<NonZeroU16>) -> Result<Self, TransitionError> {
        let allowed = match (self.state, state) {
            (DeviceState::Unplugged, DeviceState::Connecting)
            | (DeviceState::Connecting, DeviceState::Connected)
            | (DeviceState::Connected, DeviceState::Plugged)
            | (DeviceState::Plugged, DeviceState::Disconnected)
            | (DeviceState::Disconnected, DeviceState::Plugged)
            | (DeviceState::Plugged | DeviceState::Disconnected, DeviceState::Unplugging)
            | (DeviceState::Unplugging, DeviceState::Unplugged) => true,
            // attempts that never got a port
            (DeviceState::Connecting | DeviceState::Connected, DeviceState::Disconnected)
            | (
                DeviceState::Connecting | DeviceState::Connected | DeviceState::Disconnected,
                DeviceState::Unplugged,
            ) => true,
            _ => false,
        };

        if !allowed {
            return Err(TransitionError {
                from: self.state,
                to: state,
            });
        }

        tracing::debug!(from = %self.state, to = %state, "port state");

        let port = match state {
            DeviceState::Plugged | DeviceState::Disconnected => port,
            _ => None,
        };

        Ok(Self { state, port })
    }

    /// Remote handshake started
    pub fn connecting(self) -> Result<Self, TransitionError> {
        self.to(DeviceState::Connecting, None)
    }

    /// Remote side accepted the import
    pub fn connected(self) -> Result<Self, TransitionError> {
        self.to(DeviceState::Connected, None)
    }

    /// Device exposed on `port`, either the first time or after a reconnect
    pub fn plugged(self, port: NonZeroU16) -> Result<Self, TransitionError> {
        if self.state == DeviceState::Disconnected && self.port.is_some_and(|p| p != port) {
            tracing::debug!(old = self.port(), new = port.get(), "reconnected on another port");
        }

        self.to(DeviceState::Plugged, Some(port))
    }

    /// Link lost. A plugged device keeps its port, an attempt that never
    /// got one stays at zero.
    pub fn disconnected(self) -> Result<Self, TransitionError> {
        self.to(DeviceState::Disconnected, self.port)
    }

    pub fn unplugging(self) -> Result<Self, TransitionError> {
        self.to(DeviceState::Unplugging, None)
    }

    pub fn unplugged(self) -> Result<Self, TransitionError> {
        self.to(DeviceState::Unplugged, None)
    }
}
