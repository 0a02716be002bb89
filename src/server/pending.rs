//! Rendezvous table for requests that arrived before their object.
//!
//! A GET (or a DUPLICATE whose source is missing) parks here under the
//! identifier it is waiting for; the SET that registers the identifier
//! drains the queue. Queues are strictly FIFO in arrival order.

use std::collections::HashMap;
use std::rc::Rc;

use crate::protocol::{ObjectId, RequestHeader};

use super::connection::Client;

/// A parked request: the connection that issued it plus the original header
/// (the header keeps the request id to echo and, for GET, the read cap).
pub(crate) struct PendingRequest {
    pub(crate) client: Rc<Client>,
    pub(crate) header: RequestHeader,
}

/// Identifier -> FIFO queue of parked requests.
#[derive(Default)]
pub(crate) struct PendingTable {
    waiters: HashMap<ObjectId, Vec<PendingRequest>>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a request to the identifier's queue.
    pub(crate) fn park(&mut self, id: ObjectId, request: PendingRequest) {
        self.waiters.entry(id).or_default().push(request);
    }

    /// Remove and return the identifier's whole queue.
    ///
    /// The key must be gone before the caller starts emitting responses;
    /// a concurrent SET for the same identifier would otherwise process the
    /// same entries again.
    pub(crate) fn take(&mut self, id: &ObjectId) -> Option<Vec<PendingRequest>> {
        self.waiters.remove(id)
    }

    #[cfg(test)]
    pub(crate) fn waiting_on(&self, id: &ObjectId) -> usize {
        self.waiters.get(id).map_or(0, Vec::len)
    }
}
