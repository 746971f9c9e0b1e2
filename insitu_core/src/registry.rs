//! Producer-side client identity and channel cache.
//!
//! Only the producer leader knows which port names it has seen; every
//! producer worker holds the channel list. The leader resolves a name and
//! broadcasts the result so all workers index the same channel slot.

use crate::error::{InSituError, Result};
use insitu_env::PortName;
use std::collections::HashMap;

/// Index of a client's channel slot. Identical on every producer worker.
pub type ClientId = usize;

/// Wire sentinel for a client seen for the first time.
pub const NEW_CLIENT: i32 = -1;

/// Outcome of looking up a port name on the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientResolution {
    /// Never seen (or abandoned): every worker must connect.
    New,
    /// Reuse this slot without a handshake.
    Existing(ClientId),
}

impl ClientResolution {
    pub fn to_wire(self) -> i32 {
        match self {
            ClientResolution::New => NEW_CLIENT,
            ClientResolution::Existing(id) => id as i32,
        }
    }

    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            NEW_CLIENT => Ok(ClientResolution::New),
            id if id >= 0 => Ok(ClientResolution::Existing(id as ClientId)),
            other => Err(InSituError::protocol(format!("invalid client id {}", other))),
        }
    }
}

/// Established group channels, keyed by client id.
#[derive(Debug)]
pub struct ClientRegistry<C> {
    /// Leader only.
    ids: HashMap<PortName, ClientId>,
    channels: Vec<Option<C>>,
    handshakes: u64,
}

impl<C> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            channels: Vec::new(),
            handshakes: 0,
        }
    }

    /// Leader-side lookup.
    pub fn resolve(&self, name: &PortName) -> ClientResolution {
        match self.ids.get(name) {
            Some(&id) => ClientResolution::Existing(id),
            None => ClientResolution::New,
        }
    }

    /// Stores a freshly connected channel and returns its id.
    ///
    /// Every worker calls this in the same order so slots line up; only the
    /// leader passes the port name.
    pub fn attach(&mut self, name: Option<&PortName>, channel: C) -> ClientId {
        let id = self.channels.len();
        self.channels.push(Some(channel));
        if let Some(name) = name {
            self.ids.insert(name.clone(), id);
        }
        self.handshakes += 1;
        id
    }

    pub fn channel(&self, id: ClientId) -> Option<&C> {
        self.channels.get(id).and_then(Option::as_ref)
    }

    pub fn client_id(&self, name: &PortName) -> Option<ClientId> {
        self.ids.get(name).copied()
    }

    /// Forgets a client. Its slot is never reused, and a later request with
    /// the same port name resolves as new.
    pub fn abandon(&mut self, id: ClientId) -> Option<C> {
        self.ids.retain(|_, v| *v != id);
        self.channels.get_mut(id).and_then(Option::take)
    }

    /// Channels established so far, including abandoned ones.
    pub fn handshakes(&self) -> u64 {
        self.handshakes
    }

    /// Clients with a live channel.
    pub fn len(&self) -> usize {
        self.channels.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
