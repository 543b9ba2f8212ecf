//! Connection states and the events the engine reports.

use serde::Serialize;

/// Coarse connection state exposed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No sockets, no timers
    #[default]
    Disconnected,
    /// Opening sockets
    Connecting,
    /// Handshake in progress
    Handshaking,
    /// Handshake complete, heartbeats running
    Connected,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
}

impl ConnectionState {
    /// Name as shown in logs and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command a [`CommandResult`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Macro recall
    Macro,
    /// AUX bus routing
    AuxRoute,
    /// Suite selection
    SuiteSwitch,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Macro => "macro",
            Self::AuxRoute => "aux_route",
            Self::SuiteSwitch => "suite_switch",
        };
        f.write_str(name)
    }
}

/// Outcome of a command, reported once per command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Whether the datagram was handed to the socket
    pub success: bool,
    /// Which command
    pub command: CommandKind,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// Successful result.
    pub fn ok(command: CommandKind) -> Self {
        Self {
            success: true,
            command,
            error: None,
        }
    }

    /// Failed result with a reason.
    pub fn failed(command: CommandKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            command,
            error: Some(error.into()),
        }
    }
}

/// Notification emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The coarse state changed (never repeated for the same state)
    StateChanged(ConnectionState),
    /// A command finished
    CommandCompleted(CommandResult),
    /// The device acknowledged the macro with this correlation id
    MacroAcknowledged(u8),
    /// A socket or resource error
    Error(String),
}
