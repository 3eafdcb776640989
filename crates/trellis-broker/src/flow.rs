//! Per-connection flow control.
//!
//! Every outbound envelope that carries requests or responses is stamped with a
//! message id when it is written. The peer acknowledges the highest id it has
//! processed. At most `window` envelopes may be unacknowledged at once; anything
//! written while the window is full waits in a FIFO and is released as acks
//! arrive, oldest first.
//!
//! Ack-only envelopes bypass the window entirely; otherwise two peers with full
//! windows could never acknowledge each other.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use trellis_wire::Envelope;

use crate::client::{Transport, TransportError};

pub const DEFAULT_MAX_MISSING_ACKS: u64 = 8;
pub const DEFAULT_MAX_PENDING_ENVELOPES: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    #[error("outbound queue exceeded {limit} envelopes")]
    QueueOverflow { limit: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent { msg: u64 },
    Queued { depth: usize },
}

#[derive(Debug)]
struct FlowState {
    // Id the next written envelope receives.
    next_msg: u64,
    // Highest ack seen; never moves backward.
    last_ack: u64,
    // Envelopes waiting for window credit, in write order.
    pending: VecDeque<Envelope>,
}

impl FlowState {
    fn in_flight(&self) -> u64 {
        (self.next_msg - 1).saturating_sub(self.last_ack)
    }
}

pub struct DataHandler {
    transport: Arc<dyn Transport>,
    window: u64,
    max_pending: usize,
    state: Mutex<FlowState>,
}

impl std::fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandler")
            .field("window", &self.window)
            .field("max_pending", &self.max_pending)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl DataHandler {
    pub fn new(transport: Arc<dyn Transport>, window: u64, max_pending: usize) -> Self {
        Self {
            transport,
            window: window.max(1),
            max_pending,
            state: Mutex::new(FlowState {
                next_msg: 1,
                last_ack: 0,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Send `envelope` now if the window admits it and nothing older is
    /// waiting, otherwise queue it behind the older envelopes.
    pub fn write_envelope(&self, envelope: Envelope) -> Result<WriteOutcome, FlowError> {
        let mut state = self.state.lock();
        if state.pending.is_empty() && state.in_flight() < self.window {
            let msg = self.send_locked(&mut state, envelope)?;
            return Ok(WriteOutcome::Sent { msg });
        }
        if state.pending.len() >= self.max_pending {
            metrics::counter!("trellis_flow_overflow_total").increment(1);
            return Err(FlowError::QueueOverflow {
                limit: self.max_pending,
            });
        }
        state.pending.push_back(envelope);
        metrics::counter!("trellis_flow_envelopes_queued_total").increment(1);
        Ok(WriteOutcome::Queued {
            depth: state.pending.len(),
        })
    }

    /// Record an inbound ack and release queued envelopes the reopened window
    /// admits. Returns how many were sent.
    pub fn process_ack(&self, ack: u64) -> Result<usize, FlowError> {
        let mut state = self.state.lock();
        // Acks for ids never sent are clamped; stale acks are ignored.
        let ack = ack.min(state.next_msg - 1);
        if ack <= state.last_ack {
            return Ok(0);
        }
        state.last_ack = ack;
        let mut flushed = 0;
        while state.in_flight() < self.window {
            let Some(envelope) = state.pending.pop_front() else {
                break;
            };
            self.send_locked(&mut state, envelope)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Acks travel outside the window.
    pub fn acknowledge(&self, msg: u64) -> Result<(), FlowError> {
        self.transport.send(Envelope::ack_only(msg))?;
        Ok(())
    }

    /// True when a write right now would go straight to the transport.
    pub fn has_credit(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight() < self.window
    }

    pub fn in_flight(&self) -> u64 {
        self.state.lock().in_flight()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn last_ack(&self) -> u64 {
        self.state.lock().last_ack
    }

    fn send_locked(&self, state: &mut FlowState, mut envelope: Envelope) -> Result<u64, FlowError> {
        let msg = state.next_msg;
        envelope.msg = Some(msg);
        // Transport sends never block, so holding the flow lock keeps ids and
        // wire order identical.
        self.transport.send(envelope)?;
        state.next_msg += 1;
        metrics::counter!("trellis_flow_envelopes_sent_total").increment(1);
        Ok(msg)
    }
}
