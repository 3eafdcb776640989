//! Per-connection response coalescing.
//!
//! While a connection can take writes and nothing is buffered, responses go
//! out immediately. Otherwise they are merged by rid into a pending batch and
//! a single timer flushes the batch once the connection is writable again.
//! Once anything is pending, every later response for the connection is
//! merged behind it, so per-rid update order is never reordered.
//!
//! The batch is bounded: once more than `max_pending` responses and updates
//! are buffered the batch is dropped and `post` reports
//! [`FlowError::QueueOverflow`], so the caller can fail the connection.
use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use trellis_wire::Response;

use crate::client::Client;
use crate::flow::FlowError;

pub const DEFAULT_DISPATCH_DELAY: Duration = Duration::from_millis(75);

#[derive(Debug)]
struct PendingBatch {
    // First-posted order.
    responses: Vec<Response>,
    // rid -> position of the open response for that rid.
    index: HashMap<u64, usize, RandomState>,
    // Responses plus their updates currently held.
    buffered: usize,
    scheduled: bool,
}

impl PendingBatch {
    fn merge(&mut self, response: Response) {
        self.buffered += response.updates.len().max(1);
        let rid = response.rid;
        match self.index.get(&rid).copied() {
            // A closed rid may be reused by the requester; start a new entry.
            Some(position) if !self.responses[position].is_closed() => {
                self.responses[position].merge(response);
            }
            _ => {
                self.index.insert(rid, self.responses.len());
                self.responses.push(response);
            }
        }
    }

    fn take(&mut self) -> Vec<Response> {
        self.index.clear();
        self.buffered = 0;
        std::mem::take(&mut self.responses)
    }
}

#[derive(Debug)]
pub struct QueuedWriteManager {
    delay: Duration,
    max_pending: usize,
    state: Mutex<PendingBatch>,
}

impl QueuedWriteManager {
    pub fn new(delay: Duration, max_pending: usize) -> Self {
        Self {
            delay,
            max_pending,
            state: Mutex::new(PendingBatch {
                responses: Vec::new(),
                index: HashMap::with_hasher(RandomState::new()),
                buffered: 0,
                scheduled: false,
            }),
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().responses.len()
    }

    /// Responses and updates currently buffered.
    pub fn buffered(&self) -> usize {
        self.state.lock().buffered
    }

    pub(crate) fn post(&self, client: &Arc<Client>, response: Response) -> Result<(), FlowError> {
        let mut state = self.state.lock();
        if state.responses.is_empty() && client.is_writable() {
            return client.write_responses(vec![response]);
        }
        metrics::counter!("trellis_coalesced_updates_total").increment(response.updates.len() as u64);
        state.merge(response);
        if state.buffered > self.max_pending {
            let dropped = state.take();
            metrics::counter!("trellis_flow_overflow_total").increment(1);
            tracing::debug!(link = %client.link(), responses = dropped.len(), "coalescing buffer overflowed");
            return Err(FlowError::QueueOverflow {
                limit: self.max_pending,
            });
        }
        if !state.scheduled {
            state.scheduled = self.schedule(Arc::downgrade(client));
        }
        Ok(())
    }

    /// Timer body: write the whole batch as one envelope, or wait another
    /// delay if the connection still cannot take it.
    pub(crate) fn flush(&self, client: &Arc<Client>) -> Result<(), FlowError> {
        let mut state = self.state.lock();
        state.scheduled = false;
        if client.is_closed() {
            state.take();
            return Ok(());
        }
        if state.responses.is_empty() {
            return Ok(());
        }
        if !client.is_writable() {
            state.scheduled = self.schedule(Arc::downgrade(client));
            return Ok(());
        }
        let responses = state.take();
        tracing::trace!(link = %client.link(), count = responses.len(), "flushing coalesced responses");
        client.write_responses(responses)
    }

    fn schedule(&self, client: Weak<Client>) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime to flush coalesced responses");
            return false;
        };
        let delay = self.delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(client) = client.upgrade() {
                client.flush_pending();
            }
        });
        true
    }
}
