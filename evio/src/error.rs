use std::io;
use thiserror::Error;

/// Errors surfaced by the reactor runtime's fallible constructors.
///
/// Steady-state I/O failures (peer resets, `EAGAIN`, poll interruptions) are
/// handled inside the loop and never bubble up through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or descriptor setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An address string could not be parsed as an IPv4 endpoint.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Hostname resolution returned no usable IPv4 address.
    #[error("failed to resolve {0}")]
    Resolve(String),
}
