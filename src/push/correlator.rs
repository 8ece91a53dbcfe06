//! Request/acknowledgement correlation.
//!
//! Ids come from a monotonically increasing counter, so an id can never be
//! handed out twice while its request is still pending.

use std::collections::HashMap;

use crate::push::proto::RequestId;

/// Table of requests that are waiting for their acknowledgement.
///
/// `R` is whatever the owner needs to act on the acknowledgement, usually a
/// reply channel.
#[derive(Debug)]
pub struct Correlator<R> {
    next_id: RequestId,
    pending: HashMap<RequestId, R>,
}

impl<R> Correlator<R> {
    /// Empty table; the first id handed out is 1.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocates a fresh id and parks `responder` under it.
    pub fn register(&mut self, responder: R) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, responder);
        id
    }

    /// Removes and returns the responder for `id`.
    ///
    /// Returns `None` for ids that were never issued or were already
    /// resolved, which makes resolution at-most-once.
    pub fn resolve(&mut self, id: RequestId) -> Option<R> {
        self.pending.remove(&id)
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drains every pending responder, e.g. when the session shuts down.
    pub fn drain(&mut self) -> impl Iterator<Item = R> + '_ {
        self.pending.drain().map(|(_, responder)| responder)
    }
}

impl<R> Default for Correlator<R> {
    fn default() -> Self {
        Self::new()
    }
}
