//! Error types for the in-situ pull subsystem.

use insitu_env::ChannelError;
use thiserror::Error;

/// Errors surfaced by the rendezvous, grid and pull layers.
#[derive(Debug, Error)]
pub enum InSituError {
    /// Bad dims, ports or layout. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resolution or connection failure while reaching the rendezvous socket.
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Short read, length mismatch or an out-of-range value on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Group-channel handshake or collective failure.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The first pull delivered no particles to any consumer worker.
    #[error("Initial dataset is empty on every consumer worker")]
    EmptyDataset,
}

impl InSituError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        InSituError::Config(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        InSituError::Protocol(msg.into())
    }

    /// Creates a connect error for `target`.
    pub fn connect(target: impl Into<String>, source: std::io::Error) -> Self {
        InSituError::Connect {
            target: target.into(),
            source,
        }
    }

    /// True for errors that should stop the program rather than one attachment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InSituError::Config(_) | InSituError::EmptyDataset)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, InSituError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(InSituError::config("dims").is_fatal());
        assert!(InSituError::EmptyDataset.is_fatal());
        assert!(!InSituError::protocol("short read").is_fatal());
        assert!(!InSituError::from(ChannelError::disconnected("peer gone")).is_fatal());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!InSituError::connect("localhost:28230", io).is_fatal());
    }

    #[test]
    fn test_connect_message_names_target() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let msg = InSituError::connect("sim-host:28230", io).to_string();
        assert!(msg.contains("sim-host:28230"));
    }
}
