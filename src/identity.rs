use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::models::Identity;

/// Identifies one live WebSocket connection, independent of whatever
/// identity (or lack of one) it currently holds.
pub type ConnectionId = Uuid;

/// Tracks the identity bound to each live connection and enforces the
/// server-wide uniqueness of screen names (§3 Identity, §4.2).
///
/// Name reservation and identity assignment happen as a single atomic
/// compare-and-insert against `names`, so two connections racing to claim
/// the same screen name can never both succeed.
pub struct IdentityRegistry {
    identities: DashMap<ConnectionId, Identity>,
    names: DashMap<String, ConnectionId>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self {
            identities: DashMap::new(),
            names: DashMap::new(),
        }
    }

    pub fn is_name_in_use(&self, screen_name: &str) -> bool {
        self.names.contains_key(&screen_name.to_ascii_lowercase())
    }

    pub fn bind_authenticated(
        &self,
        conn_id: ConnectionId,
        user_id: Uuid,
        screen_name: String,
    ) -> Result<(), ProtocolError> {
        self.bind(
            conn_id,
            Identity::Authenticated {
                user_id,
                screen_name,
            },
        )
    }

    pub fn bind_anonymous(
        &self,
        conn_id: ConnectionId,
        screen_name: String,
    ) -> Result<(), ProtocolError> {
        self.bind(conn_id, Identity::Anonymous { screen_name })
    }

    fn bind(&self, conn_id: ConnectionId, identity: Identity) -> Result<(), ProtocolError> {
        let screen_name = identity
            .screen_name()
            .expect("bind is only called with a named identity")
            .to_string();
        let key = screen_name.to_ascii_lowercase();

        match self.names.entry(key) {
            Entry::Occupied(_) => Err(ProtocolError::NameTaken),
            Entry::Vacant(entry) => {
                entry.insert(conn_id);
                self.identities.insert(conn_id, identity);
                Ok(())
            }
        }
    }

    /// Remove a connection's identity and free its screen name, if any
    /// (§5 cleanup-on-disconnect).
    pub fn release(&self, conn_id: ConnectionId) {
        if let Some((_, identity)) = self.identities.remove(&conn_id) {
            if let Some(screen_name) = identity.screen_name() {
                self.names.remove(&screen_name.to_ascii_lowercase());
            }
        }
    }

    pub fn identity_of(&self, conn_id: ConnectionId) -> Identity {
        self.identities
            .get(&conn_id)
            .map(|entry| entry.clone())
            .unwrap_or(Identity::Unnamed)
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
