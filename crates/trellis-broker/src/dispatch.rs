// Fan-out target: one downstream connection plus the id it asked with.
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use trellis_wire::Response;

use crate::client::Client;

/// Identifies exactly one downstream waiter.
///
/// Holds only a weak reference: a stream must never keep a requester's
/// connection alive. Equality is connection identity plus id.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    client: Weak<Client>,
    id: u64,
}

impl DispatchRecord {
    pub fn new(client: &Arc<Client>, id: u64) -> Self {
        Self {
            client: Arc::downgrade(client),
            id,
        }
    }

    /// The requester's own rid (list) or sid (subscribe).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> Option<Arc<Client>> {
        self.client.upgrade()
    }

    pub fn belongs_to(&self, client: &Arc<Client>) -> bool {
        std::ptr::eq(self.client.as_ptr(), Arc::as_ptr(client))
    }

    /// Hand a response to the requester's outbound pipeline. A connection
    /// that is already gone is skipped.
    pub(crate) fn post(&self, response: Response) {
        match self.client.upgrade() {
            Some(client) => client.post_response(response),
            None => tracing::trace!(id = self.id, "dispatch target dropped"),
        }
    }
}

impl PartialEq for DispatchRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.client, &other.client)
    }
}

impl Eq for DispatchRecord {}

impl Hash for DispatchRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.client.as_ptr() as *const () as usize).hash(state);
        self.id.hash(state);
    }
}
