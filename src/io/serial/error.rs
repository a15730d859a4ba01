// src/io/serial/error.rs
//
// Error kinds recorded in a session's error slot.

use std::fmt;

/// Something that went wrong on a session operation.
///
/// Port-bound kinds render with a header naming the port; the guard kinds
/// render as short fixed messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// Line settings were rejected while configuring the handle
    Configuration { port: String, message: String },
    /// The device could not be opened
    Open { port: String, message: String },
    /// Closing the device failed (the session is still considered closed)
    Close { port: String, message: String },
    /// A write failed part-way or could not start
    Send { port: String, message: String },
    /// Draining the receive buffer failed
    Receive { port: String, message: String },
    /// The handle was already released
    PortNull,
    /// A send was attempted while the port is closed
    PortNotOpen,
    /// A send was attempted with nothing to write
    EmptyPayload,
}

impl SessionError {
    /// Port name carried by the port-bound kinds
    pub fn port(&self) -> Option<&str> {
        match self {
            SessionError::Configuration { port, .. }
            | SessionError::Open { port, .. }
            | SessionError::Close { port, .. }
            | SessionError::Send { port, .. }
            | SessionError::Receive { port, .. } => Some(port.as_str()),
            SessionError::PortNull | SessionError::PortNotOpen | SessionError::EmptyPayload => None,
        }
    }

    /// Short name of the kind, used in log tags
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Configuration { .. } => "configuration",
            SessionError::Open { .. } => "open",
            SessionError::Close { .. } => "close",
            SessionError::Send { .. } => "send",
            SessionError::Receive { .. } => "receive",
            SessionError::PortNull => "port-null",
            SessionError::PortNotOpen => "port-not-open",
            SessionError::EmptyPayload => "empty-payload",
        }
    }
}

fn write_with_header(f: &mut fmt::Formatter<'_>, port: &str, message: &str) -> fmt::Result {
    write!(
        f,
        "Serial port {} error, please check the port settings: {}",
        port, message
    )
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Configuration { port, message }
            | SessionError::Open { port, message }
            | SessionError::Close { port, message }
            | SessionError::Send { port, message }
            | SessionError::Receive { port, message } => write_with_header(f, port, message),
            SessionError::PortNull => write!(f, "Port Null"),
            SessionError::PortNotOpen => write!(f, "Port not open"),
            SessionError::EmptyPayload => write!(f, "No data to send"),
        }
    }
}

impl std::error::Error for SessionError {}
