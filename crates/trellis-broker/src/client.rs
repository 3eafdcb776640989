// One connected peer: its outbound pipeline plus the streams it listens to.
use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use trellis_wire::{Envelope, Request, Response};

use crate::BrokerSettings;
use crate::coalesce::QueuedWriteManager;
use crate::flow::{DataHandler, FlowError};
use crate::manager::StreamManager;
use crate::stream::Stream;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport outbound queue full")]
    Full,
}

/// Outbound half of a connection.
///
/// `send` must not block: implementations hand the envelope to a writer task
/// and report `Full` instead of waiting.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
    fn is_writable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roles {
    pub responder: bool,
    pub requester: bool,
}

/// A stream this connection listens to, with the manager that owns it.
#[derive(Clone)]
pub struct Registration {
    pub manager: Arc<StreamManager>,
    pub stream: Arc<Stream>,
}

/// Which requester-side registry a registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequesterId {
    List(u64),
    Subscription(u64),
}

impl RequesterId {
    pub fn value(self) -> u64 {
        match self {
            RequesterId::List(id) | RequesterId::Subscription(id) => id,
        }
    }
}

pub struct Client {
    link: String,
    roles: Roles,
    transport: Arc<dyn Transport>,
    flow: DataHandler,
    writer: QueuedWriteManager,
    lists: Mutex<HashMap<u64, Registration, RandomState>>,
    subscriptions: Mutex<HashMap<u64, Registration, RandomState>>,
    closed: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("link", &self.link)
            .field("roles", &self.roles)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    pub fn new(
        link: impl Into<String>,
        roles: Roles,
        transport: Arc<dyn Transport>,
        settings: &BrokerSettings,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            link: link.into(),
            roles,
            flow: DataHandler::new(
                transport.clone(),
                settings.max_missing_acks,
                settings.max_pending_envelopes,
            ),
            transport,
            writer: QueuedWriteManager::new(settings.dispatch_delay, settings.max_pending_envelopes),
            lists: Mutex::new(HashMap::with_hasher(RandomState::new())),
            subscriptions: Mutex::new(HashMap::with_hasher(RandomState::new())),
            closed: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn is_responder(&self) -> bool {
        self.roles.responder
    }

    pub fn is_requester(&self) -> bool {
        self.roles.requester
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been failed or shut down.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Transport accepts frames and the flow window has credit with nothing
    /// queued ahead.
    pub fn is_writable(&self) -> bool {
        !self.is_closed() && self.transport.is_writable() && self.flow.has_credit()
    }

    pub fn flow(&self) -> &DataHandler {
        &self.flow
    }

    pub fn writer(&self) -> &QueuedWriteManager {
        &self.writer
    }

    /// Queue a downstream response through the coalescer.
    pub fn post_response(self: &Arc<Self>, response: Response) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.writer.post(self, response) {
            self.fail(&err);
        }
    }

    pub(crate) fn flush_pending(self: &Arc<Self>) {
        if let Err(err) = self.writer.flush(self) {
            self.fail(&err);
        }
    }

    pub(crate) fn write_responses(&self, responses: Vec<Response>) -> Result<(), FlowError> {
        self.flow
            .write_envelope(Envelope::with_responses(responses))
            .map(|_| ())
    }

    /// Send requests upstream as a single envelope.
    pub fn send_requests(&self, requests: Vec<Request>) {
        if requests.is_empty() || self.is_closed() {
            return;
        }
        for request in &requests {
            metrics::counter!("trellis_upstream_requests_total", "method" => request.method())
                .increment(1);
        }
        if let Err(err) = self.flow.write_envelope(Envelope::with_requests(requests)) {
            self.fail(&err);
        }
    }

    pub fn process_ack(&self, ack: u64) {
        match self.flow.process_ack(ack) {
            Ok(0) => {}
            Ok(flushed) => tracing::trace!(link = %self.link, ack, flushed, "ack released queued envelopes"),
            Err(err) => self.fail(&err),
        }
    }

    pub fn acknowledge(&self, msg: u64) {
        if let Err(err) = self.flow.acknowledge(msg) {
            self.fail(&err);
        }
    }

    /// Mark the connection failed; the transport loop observes the signal
    /// and runs broker cleanup.
    pub fn fail(&self, err: &FlowError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::warn!(link = %self.link, error = %err, "closing connection");
            metrics::counter!("trellis_connections_failed_total").increment(1);
        }
        let _ = self.cancel.send(true);
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.cancel.send(true);
    }

    pub fn list(&self, rid: u64) -> Option<Registration> {
        self.lists.lock().get(&rid).cloned()
    }

    pub fn has_list(&self, rid: u64) -> bool {
        self.lists.lock().contains_key(&rid)
    }

    /// Returns false if `rid` already names a list on this connection.
    pub fn register_list(&self, rid: u64, registration: Registration) -> bool {
        let mut lists = self.lists.lock();
        if lists.contains_key(&rid) {
            return false;
        }
        lists.insert(rid, registration);
        true
    }

    pub fn take_list(&self, rid: u64) -> Option<Registration> {
        self.lists.lock().remove(&rid)
    }

    /// Drop the list entry for `rid` only if it still points at `stream`.
    pub(crate) fn forget_list(&self, rid: u64, stream: &Arc<Stream>) {
        let mut lists = self.lists.lock();
        if lists
            .get(&rid)
            .is_some_and(|registration| Arc::ptr_eq(&registration.stream, stream))
        {
            lists.remove(&rid);
        }
    }

    pub fn subscription(&self, sid: u64) -> Option<Registration> {
        self.subscriptions.lock().get(&sid).cloned()
    }

    /// Returns the registration `sid` pointed at before, if any.
    pub fn register_subscription(&self, sid: u64, registration: Registration) -> Option<Registration> {
        self.subscriptions.lock().insert(sid, registration)
    }

    pub fn take_subscription(&self, sid: u64) -> Option<Registration> {
        self.subscriptions.lock().remove(&sid)
    }

    pub fn drain_registrations(&self) -> Vec<(RequesterId, Registration)> {
        let mut drained = self
            .lists
            .lock()
            .drain()
            .map(|(rid, registration)| (RequesterId::List(rid), registration))
            .collect::<Vec<_>>();
        drained.extend(
            self.subscriptions
                .lock()
                .drain()
                .map(|(sid, registration)| (RequesterId::Subscription(sid), registration)),
        );
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingTransport, requester};
    use trellis_wire::StreamStatus;

    #[test]
    fn transport_full_fails_the_connection() {
        let transport = Arc::new(RecordingTransport::default());
        let client = Client::new(
            "a",
            Roles {
                requester: true,
                responder: false,
            },
            transport.clone(),
            &BrokerSettings::default(),
        );
        let mut closed = client.closed_signal();
        transport.fail_with(TransportError::Full);
        client.post_response(Response::closed(1));
        assert!(client.is_closed());
        assert!(*closed.borrow_and_update());

        // Nothing is written after failure.
        transport.clear_failure();
        client.post_response(Response::closed(2));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn writable_response_goes_straight_out() {
        let (client, transport) = requester("a");
        client.post_response(Response::new(
            4,
            Some(StreamStatus::Open),
            vec![serde_json::json!(["$is", "node"])],
        ));
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg, Some(1));
        assert_eq!(sent[0].responses[0].rid, 4);
    }

    #[test]
    fn empty_request_batch_is_not_sent() {
        let (client, transport) = requester("a");
        client.send_requests(Vec::new());
        assert!(transport.sent().is_empty());
    }
}
