//! Thread-safe registry of the multiplexed connections of one tunnel
//!
//! All operations take the registry lock around the underlying map; none of
//! them calls back into the registry while holding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use tunnelmux_proto::{ChannelId, MAX_CHANNEL};
use tunnelmux_stream::TunnelStream;

use crate::connection::{Connection, TunnelSender};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("max tunnel limit of {0} reached")]
    AtCapacity(usize),

    #[error("illegal channel id {0:#x}")]
    ChannelTooHigh(ChannelId),

    #[error("connection id {0} already existing")]
    ChannelInUse(ChannelId),

    #[error("cannot generate a new channel id")]
    ChannelSpaceExhausted,
}

struct Inner {
    map: HashMap<ChannelId, Arc<Connection>>,
    next_id: ChannelId,
}

/// Holds all multiplexed connections through the tunnel, thread safe
pub struct Connections {
    inner: Mutex<Inner>,
    max_connections: usize,
}

impl Connections {
    /// ctor, takes the max connection count
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                next_id: 0,
            }),
            max_connections,
        }
    }

    /// Create and store a new connection. An `id` of 0 (the normal case)
    /// allocates the next free channel id, wrapping inside the 24-bit space
    /// and skipping ids in use. A non-zero `id` is taken as given and must
    /// be free. When the registry is full and a direct stream is supplied,
    /// the refusal is written to that stream so the requester sees why.
    pub fn create(
        &self,
        id: ChannelId,
        tunnel: TunnelSender,
        direct: Option<Arc<dyn TunnelStream>>,
    ) -> Result<Arc<Connection>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        if inner.map.len() >= self.max_connections {
            debug!(
                "max tunnel limit of {} reached - refusing new forward connection",
                self.max_connections
            );
            if let Some(direct) = &direct {
                let _ = direct.write_all(b"max tunnel limit reached\n");
            }
            return Err(RegistryError::AtCapacity(self.max_connections));
        }

        let id = if id == 0 {
            let mut iterations: u32 = 0;
            loop {
                iterations += 1;
                if iterations >= MAX_CHANNEL {
                    return Err(RegistryError::ChannelSpaceExhausted);
                }

                inner.next_id += 1;
                // overflow? channel 0 stays reserved
                if inner.next_id > MAX_CHANNEL {
                    inner.next_id = 1;
                }

                if !inner.map.contains_key(&inner.next_id) {
                    break inner.next_id;
                }
            }
        } else {
            if id > MAX_CHANNEL {
                debug!("illegal channel id {}", id);
                return Err(RegistryError::ChannelTooHigh(id));
            }
            if inner.map.contains_key(&id) {
                debug!("connection id {} already existing", id);
                return Err(RegistryError::ChannelInUse(id));
            }
            id
        };

        let connection = Arc::new(Connection::new(id, tunnel, direct));
        inner.map.insert(id, connection.clone());
        Ok(connection)
    }

    /// look for an existing connection
    pub fn get(&self, id: ChannelId) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().map.get(&id).cloned()
    }

    /// Look up and remove in one locked operation, so a concurrent lookup
    /// cannot race with the removal.
    pub fn take(&self, id: ChannelId) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().map.remove(&id)
    }

    /// remove one connection, true if it existed
    pub fn remove(&self, id: ChannelId) -> bool {
        self.inner.lock().unwrap().map.remove(&id).is_some()
    }

    /// checks for existence of a connection by its channel id
    pub fn exists(&self, id: ChannelId) -> bool {
        self.inner.lock().unwrap().map.contains_key(&id)
    }

    /// current count of connections
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().map.is_empty()
    }

    /// Remove and return every connection, for shutdown
    pub(crate) fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock().unwrap();
        inner.map.drain().map(|(_, connection)| connection).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelmux_stream::memory;

    fn null_sender() -> TunnelSender {
        Arc::new(|_message| Ok(()))
    }

    #[test]
    fn test_auto_allocated_ids_are_distinct() {
        let connections = Connections::new(10);

        let a = connections.create(0, null_sender(), None).unwrap();
        let b = connections.create(0, null_sender(), None).unwrap();
        let c = connections.create(0, null_sender(), None).unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(c.id(), 3);
        assert_eq!(connections.len(), 3);
    }

    #[test]
    fn test_allocation_keeps_counting_past_freed_ids() {
        let connections = Connections::new(10);

        let a = connections.create(0, null_sender(), None).unwrap();
        let _b = connections.create(0, null_sender(), None).unwrap();

        // freeing id 1 does not hand it out again before the counter wraps
        assert!(connections.remove(a.id()));
        let c = connections.create(0, null_sender(), None).unwrap();
        assert_eq!(c.id(), 3);

        assert!(connections.exists(2));
        assert!(connections.exists(3));
    }

    #[test]
    fn test_explicit_id_conflicts_are_refused() {
        let connections = Connections::new(10);

        connections.create(42, null_sender(), None).unwrap();

        let result = connections.create(42, null_sender(), None);
        assert!(matches!(result, Err(RegistryError::ChannelInUse(42))));
    }

    #[test]
    fn test_oversized_explicit_id_is_refused() {
        let connections = Connections::new(10);

        let result = connections.create(MAX_CHANNEL + 1, null_sender(), None);
        assert!(matches!(result, Err(RegistryError::ChannelTooHigh(_))));
        assert!(connections.is_empty());
    }

    #[test]
    fn test_capacity_refusal_notifies_the_direct_stream() {
        let connections = Connections::new(2);

        connections.create(0, null_sender(), None).unwrap();
        connections.create(0, null_sender(), None).unwrap();

        let (direct, requester) = memory::duplex();
        let result = connections.create(
            0,
            null_sender(),
            Some(Arc::new(direct) as Arc<dyn TunnelStream>),
        );
        assert!(matches!(result, Err(RegistryError::AtCapacity(2))));
        assert_eq!(connections.len(), 2);

        // the would-be requester gets a readable one-line notice
        let mut buf = [0u8; 64];
        let n = requester.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"max tunnel limit reached\n");
    }

    #[test]
    fn test_take_is_get_and_remove() {
        let connections = Connections::new(10);

        let a = connections.create(0, null_sender(), None).unwrap();
        let taken = connections.take(a.id()).unwrap();
        assert_eq!(taken.id(), a.id());

        assert!(connections.take(a.id()).is_none());
        assert!(!connections.exists(a.id()));
    }
}
