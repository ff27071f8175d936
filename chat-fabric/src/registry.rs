use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::SocketAddr,
};

use crate::protocol::display_name;

/// Stable identity of a relay client. Starts at 1 and is never reused.
pub type ClientId = u64;

/// Opaque token for one accepted socket, assigned by whoever owns the I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ClientRecord<C> {
    pub id: ClientId,
    pub connection: ConnectionId,
    pub name: String,
    pub peer: SocketAddr,
    /// Whatever the owner uses to talk to this client.
    pub handle: C,
}

/// Connected relay clients.
///
/// Records are hashed by connection for lookup; a side index keeps identity
/// order, which is also join order, so `all` doubles as a roster listing.
/// `C` is the per-client connection handle.
#[derive(Debug)]
pub struct ClientRegistry<C> {
    clients: HashMap<ConnectionId, ClientRecord<C>>,
    join_order: BTreeMap<ClientId, ConnectionId>,
    next_id: ClientId,
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            join_order: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Allocates the next identity for `connection` and stores its record.
    /// A connection that is already registered loses its old record first.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        handle: C,
        peer: SocketAddr,
    ) -> &ClientRecord<C> {
        self.unregister(connection);

        let id = self.next_id;
        self.next_id += 1;

        self.join_order.insert(id, connection);
        self.clients.entry(connection).or_insert(ClientRecord {
            id,
            connection,
            name: display_name(id),
            peer,
            handle,
        })
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<&ClientRecord<C>> {
        self.clients.get(&connection)
    }

    /// Removes and returns the record for `connection`, if any.
    pub fn unregister(&mut self, connection: ConnectionId) -> Option<ClientRecord<C>> {
        let record = self.clients.remove(&connection)?;
        self.join_order.remove(&record.id);
        Some(record)
    }

    pub fn all(&self) -> impl Iterator<Item = &ClientRecord<C>> {
        self.join_order
            .values()
            .filter_map(|connection| self.clients.get(connection))
    }

    /// Snapshot of the registered connections, for callers that need to
    /// mutate the registry while walking it.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.join_order.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
