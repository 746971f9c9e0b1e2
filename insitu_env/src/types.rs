//! Common types for the in-situ environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a worker inside its own process group.
pub type Rank = usize;

/// Address of an opened group-channel port.
///
/// A consumer publishes this over the rendezvous socket. The producer uses it
/// twice: as the address to connect the group channel to, and as the
/// consumer's identity on every later request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortName(String);

impl PortName {
    /// Creates a port name from an address string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a unique port name under the given fabric tag.
    pub fn generate(tag: &str) -> Self {
        Self(format!("{}://{}", tag, Uuid::new_v4()))
    }

    /// Returns the address text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the address length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the placeholder name non-root workers carry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the name and returns the address text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for PortName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for PortName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for PortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
