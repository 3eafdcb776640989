//! Broker core: routes downstream `list` and `subscribe` requests onto shared
//! upstream streams and pushes responses back through per-connection flow
//! control.
//!
//! ```
//! use std::sync::Arc;
//! use trellis_broker::{Broker, BrokerSettings};
//!
//! let broker = Arc::new(Broker::new(BrokerSettings::default()));
//! assert!(broker.links().is_empty());
//! ```
pub mod client;
pub mod coalesce;
pub mod dispatch;
pub mod flow;
pub mod manager;
pub mod stream;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde_json::json;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use trellis_common::ParsedPath;
use trellis_common::path::DOWNSTREAM;
use trellis_wire::{
    Decoded, ErrorBody, Hello, RejectKind, Request, Response, StreamStatus, SubscribePath,
};

pub use client::{Client, Registration, RequesterId, Roles, Transport, TransportError};
pub use manager::{StreamManager, UpstreamId};
pub use stream::{Stream, StreamKind, StreamPhase};

pub const INVALID_PATH: &str = "invalidPath";
pub const INVALID_METHOD: &str = "invalidMethod";
pub const INVALID_REQUEST: &str = "invalidRequest";
pub const PERMISSION_DENIED: &str = "permissionDenied";
pub const NOT_FOUND: &str = "notFound";

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Path(#[from] trellis_common::Error),
    #[error("link {0} already has a responder")]
    LinkInUse(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// How long the coalescer waits before flushing buffered responses.
    pub dispatch_delay: Duration,
    /// Flow-control window: unacknowledged envelopes allowed per connection.
    pub max_missing_acks: u64,
    /// Envelopes a connection may queue behind a full window before it is
    /// dropped.
    pub max_pending_envelopes: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            dispatch_delay: coalesce::DEFAULT_DISPATCH_DELAY,
            max_missing_acks: flow::DEFAULT_MAX_MISSING_ACKS,
            max_pending_envelopes: flow::DEFAULT_MAX_PENDING_ENVELOPES,
        }
    }
}

/// Connection registry and request router.
#[derive(Debug)]
pub struct Broker {
    settings: BrokerSettings,
    // Link slots outlive responder connections so requesters can wait.
    links: RwLock<HashMap<String, Arc<StreamManager>, RandomState>>,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            links: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Names of every link a responder has connected as, sorted.
    pub fn links(&self) -> Vec<String> {
        let mut links = self
            .links
            .read()
            .iter()
            .filter(|(_, manager)| manager.has_responded())
            .map(|(link, _)| link.clone())
            .collect::<Vec<_>>();
        links.sort();
        links
    }

    pub fn manager(&self, link: &str) -> Option<Arc<StreamManager>> {
        self.links.read().get(link).cloned()
    }

    fn manager_or_create(&self, link: &str) -> Arc<StreamManager> {
        if let Some(manager) = self.manager(link) {
            return manager;
        }
        let mut links = self.links.write();
        links
            .entry(link.to_string())
            .or_insert_with(|| StreamManager::new(link))
            .clone()
    }

    /// Register a connection from its hello. A responder takes over its
    /// link slot and receives every request still open against it.
    pub fn connect(&self, hello: Hello, transport: Arc<dyn Transport>) -> Result<Arc<Client>> {
        ParsedPath::link_root(&hello.link)?;
        let roles = Roles {
            responder: hello.responder,
            requester: hello.requester,
        };
        let client = Client::new(hello.link.clone(), roles, transport, &self.settings);
        if roles.responder {
            let manager = self.manager_or_create(&hello.link);
            manager.responder_connected(&client, hello.link_data)?;
        }
        metrics::counter!("trellis_connections_total").increment(1);
        tracing::info!(
            link = %hello.link,
            responder = roles.responder,
            requester = roles.requester,
            "client connected"
        );
        Ok(client)
    }

    /// Process one inbound envelope from `client`.
    pub fn handle(&self, client: &Arc<Client>, decoded: Decoded) {
        let Decoded { envelope, rejected } = decoded;
        if let Some(ack) = envelope.ack {
            client.process_ack(ack);
        }
        if let Some(msg) = envelope.msg {
            client.acknowledge(msg);
        }
        for rejected in rejected {
            let kind = match rejected.kind {
                RejectKind::UnknownMethod => INVALID_METHOD,
                RejectKind::Malformed => INVALID_REQUEST,
            };
            match rejected.rid {
                Some(rid) => client.post_response(Response::error(rid, ErrorBody::new(kind, rejected.reason))),
                None => tracing::debug!(link = %client.link(), reason = %rejected.reason, "request without rid ignored"),
            }
        }
        for request in envelope.requests {
            self.handle_request(client, request);
        }
        if envelope.responses.is_empty() {
            return;
        }
        let manager = if client.is_responder() {
            self.manager(client.link())
        } else {
            None
        };
        let Some(manager) = manager else {
            tracing::debug!(link = %client.link(), "responses from non-responder ignored");
            return;
        };
        for response in envelope.responses {
            if response.rid == 0 {
                manager.dispatch_subscriptions(response.updates);
            } else {
                manager.dispatch_response(response);
            }
        }
    }

    fn handle_request(&self, client: &Arc<Client>, request: Request) {
        if !client.is_requester() {
            client.post_response(Response::error(
                request.rid(),
                ErrorBody::new(PERMISSION_DENIED, "connection is not a requester"),
            ));
            return;
        }
        match request {
            Request::List { rid, path } => self.list(client, rid, &path),
            Request::Subscribe { rid, paths } => {
                let mut failure = None;
                for entry in paths {
                    if let Err(error) = self.subscribe(client, entry) {
                        failure = Some(error);
                    }
                }
                client.post_response(match failure {
                    Some(error) => Response::error(rid, error),
                    None => Response::closed(rid),
                });
            }
            Request::Unsubscribe { rid, sids } => {
                let registrations = sids
                    .into_iter()
                    .filter_map(|sid| {
                        client
                            .take_subscription(sid)
                            .map(|registration| (RequesterId::Subscription(sid), registration))
                    })
                    .collect();
                self.release(client, registrations);
                client.post_response(Response::closed(rid));
            }
            Request::Close { rid } => match client.take_list(rid) {
                Some(registration) => self.release(client, vec![(RequesterId::List(rid), registration)]),
                None => tracing::trace!(link = %client.link(), rid, "close for unknown rid"),
            },
        }
    }

    fn list(&self, client: &Arc<Client>, rid: u64, raw: &str) {
        if client.has_list(rid) {
            client.post_response(Response::error(
                rid,
                ErrorBody::new(INVALID_REQUEST, format!("rid {rid} is already in use")),
            ));
            return;
        }
        let path = match ParsedPath::parse(raw) {
            Ok(path) => path,
            Err(err) => {
                client.post_response(Response::error(rid, ErrorBody::new(INVALID_PATH, err.to_string())));
                return;
            }
        };
        let Some(link) = path.link() else {
            self.list_local(client, rid, &path);
            return;
        };
        // Unknown links get a slot so the request is served once a responder
        // connects under that name.
        self.manager_or_create(link).list(client, &path, rid);
    }

    // The broker's own nodes: the root and the downstream folder.
    fn list_local(&self, client: &Arc<Client>, rid: u64, path: &ParsedPath) {
        let mut updates = vec![json!(["$is", "node"])];
        match path.as_str() {
            "/" => updates.push(json!(["downstream", {"$is": "node"}])),
            DOWNSTREAM => updates.extend(
                self.links()
                    .into_iter()
                    .map(|link| json!([link, {"$is": "node"}])),
            ),
            _ => {
                client.post_response(Response::error(
                    rid,
                    ErrorBody::new(NOT_FOUND, format!("no node at {path}")),
                ));
                return;
            }
        }
        client.post_response(Response::new(rid, Some(StreamStatus::Open), updates));
    }

    fn subscribe(&self, client: &Arc<Client>, entry: SubscribePath) -> std::result::Result<(), ErrorBody> {
        let SubscribePath { path, sid, qos } = entry;
        let path = ParsedPath::parse(&path).map_err(|err| ErrorBody::new(INVALID_PATH, err.to_string()))?;
        let Some(link) = path.link() else {
            return Err(ErrorBody::new(INVALID_PATH, format!("{path} has no value")));
        };
        let manager = self.manager_or_create(link);
        if let Some(previous) = client.subscription(sid) {
            if Arc::ptr_eq(&previous.manager, &manager) && previous.stream.path() == &path {
                return Ok(());
            }
            // The sid moves to a new path: leave the old stream first.
            if let Some(previous) = client.take_subscription(sid) {
                previous.manager.unsubscribe(client, &previous.stream, sid);
            }
        }
        manager.subscribe(client, &path, sid, qos);
        Ok(())
    }

    // Group by manager so each link gets one batched envelope.
    fn release(&self, client: &Arc<Client>, registrations: Vec<(RequesterId, Registration)>) {
        let mut groups: SmallVec<[(Arc<StreamManager>, Vec<(u64, Arc<Stream>)>); 4]> = SmallVec::new();
        for (id, Registration { manager, stream }) in registrations {
            match groups
                .iter_mut()
                .find(|(existing, _)| Arc::ptr_eq(existing, &manager))
            {
                Some((_, entries)) => entries.push((id.value(), stream)),
                None => groups.push((manager, vec![(id.value(), stream)])),
            }
        }
        for (manager, entries) in groups {
            manager.close(client, entries);
        }
    }

    /// Tear down everything `client` owns. Safe to call more than once.
    pub fn disconnect(&self, client: &Arc<Client>) {
        client.shutdown();
        let registrations = client.drain_registrations();
        let released = registrations.len();
        self.release(client, registrations);
        if client.is_responder()
            && let Some(manager) = self.manager(client.link())
        {
            manager.responder_disconnected(client);
        }
        tracing::info!(link = %client.link(), released, "client disconnected");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Outbox, RecordingTransport, settings};
    use trellis_wire::{Envelope, Frame};

    fn hello(link: &str, responder: bool, requester: bool) -> Hello {
        Hello {
            link: link.to_string(),
            responder,
            requester,
            link_data: None,
        }
    }

    fn join(broker: &Broker, hello: Hello) -> (Arc<Client>, Outbox) {
        let transport = Arc::new(RecordingTransport::default());
        let client = broker.connect(hello, transport.clone()).expect("connect");
        (client, transport)
    }

    fn requests(broker: &Broker, client: &Arc<Client>, requests: Vec<Request>) {
        broker.handle(
            client,
            Decoded {
                envelope: Envelope::with_requests(requests),
                rejected: Vec::new(),
            },
        );
    }

    fn responses(broker: &Broker, client: &Arc<Client>, responses: Vec<Response>) {
        broker.handle(
            client,
            Decoded {
                envelope: Envelope::with_responses(responses),
                rejected: Vec::new(),
            },
        );
    }

    fn list(rid: u64, path: &str) -> Request {
        Request::List {
            rid,
            path: path.to_string(),
        }
    }

    fn subscribe(rid: u64, path: &str, sid: u64) -> Request {
        Request::Subscribe {
            rid,
            paths: vec![SubscribePath {
                path: path.to_string(),
                sid,
                qos: None,
            }],
        }
    }

    #[test]
    fn two_requesters_share_one_upstream_list() {
        let broker = Broker::new(settings());
        let (plc, plc_out) = join(&broker, hello("plc", true, false));
        let (a, a_out) = join(&broker, hello("a", false, true));
        let (b, b_out) = join(&broker, hello("b", false, true));

        requests(&broker, &a, vec![list(10, "/downstream/plc/foo")]);
        requests(&broker, &b, vec![list(20, "/downstream/plc/foo")]);

        let upstream = plc_out.requests();
        assert_eq!(upstream, vec![list(1, "/foo")]);

        responses(
            &broker,
            &plc,
            vec![Response::new(1, Some(StreamStatus::Open), vec![json!(["$is", "node"])])],
        );
        let a_resp = a_out.responses();
        let b_resp = b_out.responses();
        assert_eq!(a_resp.len(), 1);
        assert_eq!(a_resp[0].rid, 10);
        assert_eq!(a_resp[0].updates, vec![json!(["$is", "node"])]);
        assert_eq!(b_resp.len(), 1);
        assert_eq!(b_resp[0].rid, 20);

        // Neither leaving early nor twice tears the stream down prematurely.
        requests(&broker, &a, vec![Request::Close { rid: 10 }]);
        requests(&broker, &a, vec![Request::Close { rid: 10 }]);
        assert_eq!(plc_out.requests().len(), 1);
        requests(&broker, &b, vec![Request::Close { rid: 20 }]);
        assert_eq!(plc_out.requests().last(), Some(&Request::Close { rid: 1 }));
    }

    #[test]
    fn responder_only_connection_cannot_request() {
        let broker = Broker::new(settings());
        let (plc, plc_out) = join(&broker, hello("plc", true, false));
        requests(&broker, &plc, vec![list(3, "/downstream/plc")]);
        let response = &plc_out.responses()[0];
        assert_eq!(response.rid, 3);
        assert_eq!(response.error.as_ref().expect("error").kind, PERMISSION_DENIED);
    }

    #[test]
    fn local_nodes_are_listed_once() {
        let broker = Broker::new(settings());
        let _plc = join(&broker, hello("plc", true, false));
        let _hvac = join(&broker, hello("hvac", true, false));
        let (a, a_out) = join(&broker, hello("a", false, true));

        requests(&broker, &a, vec![list(1, "/"), list(2, "/downstream")]);
        let out = a_out.responses();
        assert_eq!(out[0].updates[1], json!(["downstream", {"$is": "node"}]));
        assert_eq!(out[1].stream, Some(StreamStatus::Open));
        assert_eq!(
            out[1].updates[1..],
            [json!(["hvac", {"$is": "node"}]), json!(["plc", {"$is": "node"}])]
        );
    }

    #[test]
    fn bad_requests_get_typed_errors() {
        let broker = Broker::new(settings());
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(
            &broker,
            &a,
            vec![
                list(1, "relative"),
                subscribe(3, "/sys", 1),
                list(4, "/nothing"),
            ],
        );
        let frame = Frame::new(
            trellis_wire::FLAG_JSON_ENVELOPE,
            bytes_of(json!({"requests": [{"method": "invoke", "rid": 5}]})),
        )
        .expect("frame");
        broker.handle(&a, Envelope::decode(frame).expect("decode"));

        let kinds = a_out
            .responses()
            .into_iter()
            .map(|response| {
                (
                    response.rid,
                    response.error.expect("error").kind,
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                (1, INVALID_PATH.to_string()),
                (3, INVALID_PATH.to_string()),
                (4, NOT_FOUND.to_string()),
                (5, INVALID_METHOD.to_string()),
            ]
        );
    }

    fn bytes_of(value: serde_json::Value) -> bytes::Bytes {
        bytes::Bytes::from(serde_json::to_vec(&value).expect("json"))
    }

    #[test]
    fn duplicate_list_rid_is_rejected() {
        let broker = Broker::new(settings());
        let _plc = join(&broker, hello("plc", true, false));
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(&broker, &a, vec![list(7, "/downstream/plc/x"), list(7, "/downstream/plc/y")]);
        let errors = a_out
            .responses()
            .into_iter()
            .filter_map(|response| response.error)
            .collect::<Vec<_>>();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, INVALID_REQUEST);
    }

    #[test]
    fn moving_a_sid_unsubscribes_the_old_path() {
        let broker = Broker::new(settings());
        let (_plc, plc_out) = join(&broker, hello("plc", true, false));
        let (a, _) = join(&broker, hello("a", false, true));

        requests(&broker, &a, vec![subscribe(1, "/downstream/plc/temp", 5)]);
        requests(&broker, &a, vec![subscribe(2, "/downstream/plc/temp", 5)]);
        requests(&broker, &a, vec![subscribe(3, "/downstream/plc/rpm", 5)]);

        let upstream = plc_out.requests();
        assert_eq!(upstream.len(), 3);
        assert!(matches!(&upstream[0], Request::Subscribe { paths, .. } if paths[0].path == "/temp"));
        assert!(matches!(&upstream[1], Request::Unsubscribe { sids, .. } if sids.len() == 1));
        assert!(matches!(&upstream[2], Request::Subscribe { paths, .. } if paths[0].path == "/rpm"));
    }

    #[test]
    fn subscribe_and_unsubscribe_are_answered_closed() {
        let broker = Broker::new(settings());
        let _plc = join(&broker, hello("plc", true, false));
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(&broker, &a, vec![subscribe(1, "/downstream/plc/temp", 5)]);
        requests(&broker, &a, vec![Request::Unsubscribe { rid: 2, sids: vec![5] }]);
        let out = a_out.responses();
        assert!(out.iter().all(Response::is_closed));
        assert_eq!(out.iter().map(|response| response.rid).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn requester_disconnect_releases_everything_in_one_batch() {
        let broker = Broker::new(settings());
        let (_plc, plc_out) = join(&broker, hello("plc", true, false));
        let (a, _) = join(&broker, hello("a", false, true));
        requests(
            &broker,
            &a,
            vec![
                list(1, "/downstream/plc/x"),
                list(2, "/downstream/plc/y"),
                subscribe(3, "/downstream/plc/temp", 9),
            ],
        );
        let before = plc_out.sent().len();
        broker.disconnect(&a);
        broker.disconnect(&a);

        let sent = plc_out.sent();
        assert_eq!(sent.len(), before + 1);
        let batch = &sent[before].requests;
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.iter().filter(|request| matches!(request, Request::Close { .. })).count(),
            2
        );
        assert!(matches!(batch.last(), Some(Request::Unsubscribe { .. })));
        assert_eq!(broker.manager("plc").expect("manager").live_count(), 0);
    }

    #[test]
    fn responder_reconnect_resumes_waiting_requesters() {
        let broker = Broker::new(settings());
        let (plc, _) = join(&broker, hello("plc", true, false));
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(&broker, &a, vec![subscribe(1, "/downstream/plc/temp", 5)]);

        broker.disconnect(&plc);
        let disconnected = a_out.responses().pop().expect("disconnect update");
        assert_eq!(disconnected.updates[0]["status"], "disconnected");
        assert_eq!(disconnected.updates[0]["sid"], 5);

        let (plc, plc_out) = join(&broker, hello("plc", true, false));
        let Request::Subscribe { paths, .. } = &plc_out.requests()[0] else {
            panic!("expected resubscribe");
        };
        let sid = paths[0].sid;
        responses(&broker, &plc, vec![Response::new(0, None, vec![json!([sid, 42, "t"])])]);
        let value = a_out.responses().pop().expect("value");
        assert_eq!(value.updates, vec![json!([5, 42, "t"])]);
    }

    #[test]
    fn second_responder_for_link_is_refused() {
        let broker = Broker::new(settings());
        let _plc = join(&broker, hello("plc", true, false));
        let err = broker
            .connect(hello("plc", true, false), Arc::new(RecordingTransport::default()))
            .expect_err("in use");
        assert!(matches!(err, BrokerError::LinkInUse(_)));
        let err = broker
            .connect(hello("a/b", false, true), Arc::new(RecordingTransport::default()))
            .expect_err("bad link");
        assert!(matches!(err, BrokerError::Path(_)));
    }

    #[test]
    fn inbound_msg_is_acknowledged_outside_the_window() {
        let broker = Broker::new(BrokerSettings {
            max_missing_acks: 1,
            ..settings()
        });
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(&broker, &a, vec![list(1, "/")]);
        broker.handle(
            &a,
            Decoded {
                envelope: Envelope {
                    msg: Some(77),
                    ..Envelope::default()
                },
                rejected: Vec::new(),
            },
        );
        let sent = a_out.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].ack, Some(77));
        assert_eq!(a.flow().in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_reach_a_throttled_requester_in_order() {
        let broker = Broker::new(BrokerSettings {
            max_missing_acks: 2,
            ..settings()
        });
        let (plc, _) = join(&broker, hello("plc", true, false));
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(&broker, &a, vec![subscribe(1, "/downstream/plc/temp", 5)]);
        // The subscribe answer used one slot; fill the other.
        requests(&broker, &a, vec![list(2, "/")]);

        let sid = broker
            .manager("plc")
            .expect("manager")
            .subscriptions()
            .sid_for(&ParsedPath::parse("/downstream/plc/temp").expect("path"))
            .expect("sid");
        for n in 0..20 {
            responses(&broker, &plc, vec![Response::new(0, None, vec![json!([sid, n, "t"])])]);
        }
        assert_eq!(a_out.sent().len(), 2);

        a.process_ack(2);
        tokio::time::sleep(broker.settings().dispatch_delay * 2).await;

        let values = a_out
            .responses()
            .into_iter()
            .filter(|response| response.rid == 0)
            .flat_map(|response| response.updates)
            .map(|update| update[1].as_u64().expect("n"))
            .collect::<Vec<_>>();
        assert_eq!(values, (0..20).collect::<Vec<_>>());
        assert_eq!(a_out.sent().len(), 3);
    }

    #[test]
    fn requester_that_never_acks_is_failed_once_its_buffer_overflows() {
        let broker = Broker::new(BrokerSettings {
            max_missing_acks: 1,
            max_pending_envelopes: 4,
            ..settings()
        });
        let (plc, plc_out) = join(&broker, hello("plc", true, false));
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(&broker, &a, vec![subscribe(1, "/downstream/plc/t", 5)]);
        let sid = broker
            .manager("plc")
            .expect("manager")
            .subscriptions()
            .sid_for(&ParsedPath::parse("/downstream/plc/t").expect("path"))
            .expect("sid");

        for n in 0..1_000 {
            responses(&broker, &plc, vec![Response::new(0, None, vec![json!([sid, n, "t"])])]);
        }
        assert!(a.is_closed());
        assert_eq!(a.flow().queued(), 0);
        assert_eq!(a.writer().buffered(), 0);
        assert_eq!(a_out.sent().len(), 1);

        broker.disconnect(&a);
        plc.process_ack(1);
        assert!(plc_out.requests().iter().any(
            |request| matches!(request, Request::Unsubscribe { sids, .. } if sids == &vec![sid])
        ));
    }

    #[test]
    fn list_on_unseen_link_waits_for_its_responder() {
        let broker = Broker::new(settings());
        let (a, a_out) = join(&broker, hello("a", false, true));
        requests(&broker, &a, vec![list(1, "/downstream/plc/foo"), list(2, "/downstream")]);

        let out = a_out.responses();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rid, 2);
        assert_eq!(out[0].updates, vec![json!(["$is", "node"])]);
        assert!(broker.links().is_empty());

        let (plc, plc_out) = join(&broker, hello("plc", true, false));
        assert_eq!(broker.links(), vec!["plc".to_string()]);
        let upstream_rid = plc_out
            .requests()
            .into_iter()
            .find_map(|request| match request {
                Request::List { rid, path } if path == "/foo" => Some(rid),
                _ => None,
            })
            .expect("relisted");
        responses(
            &broker,
            &plc,
            vec![Response::new(
                upstream_rid,
                Some(StreamStatus::Open),
                vec![json!(["bar", {"$is": "node"}])],
            )],
        );
        let last = a_out.responses().pop().expect("response");
        assert_eq!(last.rid, 1);
        assert_eq!(last.updates, vec![json!(["bar", {"$is": "node"}])]);
    }
}
