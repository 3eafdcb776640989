//! Per-link stream registry.
//!
//! One [`StreamManager`] exists for every link a responder has ever connected
//! as. It owns the upstream id space for that link and maps upstream ids to
//! shared [`Stream`]s, while [`ListStreamManager`] and [`SubStreamManager`]
//! map downstream paths onto those ids.
//!
//! Lock order, outermost first: list path registry, subscription path
//! registry, the id map, a stream's own lock. The id map and a path registry
//! are only ever mutated together, under both write locks.
pub mod list;
pub mod sub;

use ahash::RandomState;
use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use trellis_common::ParsedPath;
use trellis_common::ids::IdAllocator;
use trellis_wire::{Request, Response, StreamStatus};

use crate::client::Client;
use crate::stream::{Stream, StreamKind, timestamp};
use crate::{BrokerError, Result};
pub use list::ListStreamManager;
pub use sub::SubStreamManager;

pub(crate) type PathMap = HashMap<ParsedPath, u64, RandomState>;

/// Key of the id map: list streams by upstream rid, subscriptions by
/// upstream sid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamId {
    Request(u64),
    Subscription(u64),
}

fn stream_key(stream: &Arc<Stream>) -> usize {
    Arc::as_ptr(stream) as usize
}

pub struct StreamManager {
    link: String,
    ids: IdAllocator,
    streams: RwLock<HashMap<UpstreamId, Arc<Stream>, RandomState>>,
    live: DashMap<usize, Arc<Stream>, RandomState>,
    responder: RwLock<Option<Weak<Client>>>,
    // Set once any responder has connected; slots opened by requesters alone
    // stay hidden from listings.
    seen: AtomicBool,
    link_data: RwLock<Option<Value>>,
    disconnected_ts: RwLock<String>,
    lists: ListStreamManager,
    subs: SubStreamManager,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("link", &self.link)
            .field("live", &self.live.len())
            .field("online", &self.is_online())
            .finish()
    }
}

impl StreamManager {
    pub fn new(link: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            link: link.into(),
            ids: IdAllocator::default(),
            streams: RwLock::new(HashMap::with_hasher(RandomState::new())),
            live: DashMap::with_hasher(RandomState::new()),
            responder: RwLock::new(None),
            seen: AtomicBool::new(false),
            link_data: RwLock::new(None),
            disconnected_ts: RwLock::new(timestamp()),
            lists: ListStreamManager::default(),
            subs: SubStreamManager::default(),
        })
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub(crate) fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn lists(&self) -> &ListStreamManager {
        &self.lists
    }

    pub fn subscriptions(&self) -> &SubStreamManager {
        &self.subs
    }

    /// The live responder for this link, if one is connected.
    pub fn responder(&self) -> Option<Arc<Client>> {
        self.responder
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|client| !client.is_closed())
    }

    pub fn is_online(&self) -> bool {
        self.responder().is_some()
    }

    /// True once a responder has connected as this link at least once.
    pub fn has_responded(&self) -> bool {
        self.seen.load(Ordering::Acquire)
    }

    pub fn get(&self, id: UpstreamId) -> Option<Arc<Stream>> {
        self.streams.read().get(&id).cloned()
    }

    /// Look up a stream a path registry points at. A missing entry means the
    /// registries disagree, which is unrecoverable.
    pub(crate) fn expect_stream(&self, id: UpstreamId, path: &ParsedPath) -> Arc<Stream> {
        match self.get(id) {
            Some(stream) => stream,
            None => panic!(
                "link {}: path {path} is registered as {id:?} but no stream exists",
                self.link
            ),
        }
    }

    /// Install `stream` under `id` unless one is already there; returns the
    /// stream that ends up registered.
    pub fn add_if_absent(&self, id: UpstreamId, stream: Arc<Stream>) -> Arc<Stream> {
        let mut streams = self.streams.write();
        if let Some(existing) = streams.get(&id) {
            return existing.clone();
        }
        streams.insert(id, stream.clone());
        self.live.insert(stream_key(&stream), stream.clone());
        self.record_live();
        stream
    }

    /// Drop `id` from the id map, the live set and its path registry.
    pub fn remove(&self, id: UpstreamId) -> Option<Arc<Stream>> {
        let stream = self.get(id)?;
        let removed = match stream.kind() {
            StreamKind::List => self.lists.remove(self, &stream),
            StreamKind::Sub => self.subs.remove(self, &stream),
        };
        removed.map(|_| stream)
    }

    // Caller holds the write lock of the registry `paths` belongs to.
    pub(crate) fn remove_locked(&self, paths: &mut PathMap, id: UpstreamId) -> Option<Arc<Stream>> {
        let stream = self.streams.write().remove(&id)?;
        if paths.get(stream.path()) == Some(&stream.upstream_id()) {
            paths.remove(stream.path());
        }
        self.live.remove(&stream_key(&stream));
        self.record_live();
        tracing::debug!(link = %self.link, path = %stream.path(), ?id, "stream deregistered");
        Some(stream)
    }

    pub fn live_streams(&self) -> Vec<Arc<Stream>> {
        self.live.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn record_live(&self) {
        metrics::gauge!("trellis_streams_live", "link" => self.link.clone()).set(self.live.len() as f64);
    }

    /// Attach `requester` (under its own `rid`) to the list stream for
    /// `path`, creating the upstream list if this is the first listener.
    pub fn list(self: &Arc<Self>, requester: &Arc<Client>, path: &ParsedPath, rid: u64) -> Arc<Stream> {
        self.lists.add(self, path, requester, rid)
    }

    pub fn subscribe(
        self: &Arc<Self>,
        requester: &Arc<Client>,
        path: &ParsedPath,
        sid: u64,
        qos: Option<u8>,
    ) -> Arc<Stream> {
        self.subs.subscribe(self, path, requester, sid, qos)
    }

    pub fn unsubscribe(&self, requester: &Arc<Client>, stream: &Arc<Stream>, sid: u64) {
        self.subs.unsubscribe(self, stream, requester, sid);
    }

    /// Detach `requester` from each `(requester id, stream)` entry and send
    /// the upstream closes and unsubscribes this frees in one envelope.
    pub fn close(&self, requester: &Arc<Client>, entries: Vec<(u64, Arc<Stream>)>) {
        let mut requests = Vec::new();
        let mut sids = Vec::new();
        for (id, stream) in entries {
            match stream.kind() {
                StreamKind::List => {
                    if let Some(rid) = self.lists.release(self, &stream, requester, id) {
                        requests.push(Request::Close { rid });
                    }
                }
                StreamKind::Sub => {
                    if let Some(sid) = self.subs.release(self, &stream, requester, id) {
                        sids.push(sid);
                    }
                }
            }
        }
        if !sids.is_empty() {
            requests.push(Request::Unsubscribe {
                rid: self.ids.next_rid(),
                sids,
            });
        }
        self.send_upstream(requests);
    }

    /// Requests are dropped while the link is offline; everything still
    /// registered is re-requested when a responder connects.
    pub(crate) fn send_upstream(&self, requests: Vec<Request>) {
        if requests.is_empty() {
            return;
        }
        match self.responder() {
            Some(responder) => responder.send_requests(requests),
            None => tracing::trace!(link = %self.link, count = requests.len(), "link offline; upstream requests deferred"),
        }
    }

    /// Install `client` as this link's responder and re-issue every open
    /// list and subscription against it.
    pub fn responder_connected(&self, client: &Arc<Client>, link_data: Option<Value>) -> Result<()> {
        let mut lists = self.lists.paths.write();
        let subs = self.subs.paths.write();
        {
            let mut responder = self.responder.write();
            if let Some(current) = responder.as_ref().and_then(Weak::upgrade)
                && !current.is_closed()
            {
                return Err(BrokerError::LinkInUse(self.link.clone()));
            }
            *responder = Some(Arc::downgrade(client));
        }
        self.seen.store(true, Ordering::Release);
        *self.link_data.write() = link_data;

        let mut requests = self.lists.relist_locked(self, &mut lists);
        let listed = requests.len();
        let paths = self.subs.resubscribe_locked(self, &subs);
        let subscribed = paths.len();
        if !paths.is_empty() {
            requests.push(Request::Subscribe {
                rid: self.ids.next_rid(),
                paths,
            });
        }
        tracing::info!(link = %self.link, lists = listed, subscriptions = subscribed, "responder connected");
        client.send_requests(requests);
        Ok(())
    }

    /// Detach `client` if it is this link's responder and tell every live
    /// stream. Streams stay registered so requesters keep waiting.
    pub fn responder_disconnected(&self, client: &Arc<Client>) {
        let _lists = self.lists.paths.write();
        let _subs = self.subs.paths.write();
        {
            let mut responder = self.responder.write();
            let is_current = responder
                .as_ref()
                .is_some_and(|current| std::ptr::eq(current.as_ptr(), Arc::as_ptr(client)));
            if !is_current {
                return;
            }
            *responder = None;
        }
        let ts = timestamp();
        *self.disconnected_ts.write() = ts.clone();
        let streams = self.live_streams();
        for stream in &streams {
            stream.responder_disconnected(&ts);
        }
        tracing::info!(link = %self.link, streams = streams.len(), "responder disconnected");
    }

    /// Route a responder's response (rid != 0) to the list stream it belongs
    /// to.
    pub fn dispatch_response(&self, response: Response) {
        let rid = response.rid;
        let Some(stream) = self.get(UpstreamId::Request(rid)) else {
            tracing::trace!(link = %self.link, rid, "response for unknown rid dropped");
            return;
        };
        if !stream.dispatch_response(response) {
            return;
        }
        let records = {
            let mut paths = self.lists.paths.write();
            if self.remove_locked(&mut paths, UpstreamId::Request(rid)).is_none() {
                return;
            }
            stream.close()
        };
        for record in records {
            if let Some(client) = record.client() {
                client.forget_list(record.id(), &stream);
            }
        }
    }

    /// Route subscription value updates (responses on rid 0).
    pub fn dispatch_subscriptions(&self, updates: Vec<Value>) {
        self.subs.dispatch(self, updates);
    }

    /// Listing of the link root while no responder is connected.
    pub(crate) fn root_response(&self, rid: u64) -> Response {
        let mut updates = vec![
            json!(["$is", "node"]),
            json!(["$disconnectedTs", *self.disconnected_ts.read()]),
        ];
        if let Some(data) = self.link_data.read().clone() {
            updates.push(json!(["$linkData", data]));
        }
        Response::new(rid, Some(StreamStatus::Open), updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{requester, responder};
    use trellis_wire::Request;

    fn path(raw: &str) -> ParsedPath {
        ParsedPath::parse(raw).expect("path")
    }

    #[test]
    fn add_if_absent_keeps_first_writer() {
        let manager = StreamManager::new("plc");
        let first = Arc::new(Stream::list(path("/downstream/plc/a"), 1));
        let second = Arc::new(Stream::list(path("/downstream/plc/a"), 1));
        let installed = manager.add_if_absent(UpstreamId::Request(1), first.clone());
        assert!(Arc::ptr_eq(&installed, &first));
        let installed = manager.add_if_absent(UpstreamId::Request(1), second);
        assert!(Arc::ptr_eq(&installed, &first));
        assert_eq!(manager.live_count(), 1);
    }

    #[test]
    fn remove_clears_id_live_and_path_entries() {
        let manager = StreamManager::new("plc");
        let (a, _) = requester("a");
        let stream = manager.list(&a, &path("/downstream/plc/a"), 10);
        let id = UpstreamId::Request(stream.upstream_id());

        let removed = manager.remove(id).expect("removed");
        assert!(Arc::ptr_eq(&removed, &stream));
        assert!(manager.get(id).is_none());
        assert_eq!(manager.live_count(), 0);
        assert!(manager.lists().rid_for(&path("/downstream/plc/a")).is_none());
        assert!(manager.remove(id).is_none());
    }

    #[test]
    fn second_live_responder_is_rejected() {
        let manager = StreamManager::new("plc");
        let (first, _) = responder("plc");
        let (second, _) = responder("plc");
        manager.responder_connected(&first, None).expect("first");
        let err = manager.responder_connected(&second, None).expect_err("in use");
        assert!(matches!(err, BrokerError::LinkInUse(link) if link == "plc"));

        // A stale responder does not detach the current one.
        manager.responder_disconnected(&second);
        assert!(manager.is_online());
        manager.responder_disconnected(&first);
        assert!(!manager.is_online());
        manager.responder_connected(&second, None).expect("reconnect");
    }

    #[test]
    fn reconnect_relists_under_fresh_rids_in_one_envelope() {
        let manager = StreamManager::new("plc");
        let (a, _) = requester("a");
        let foo = manager.list(&a, &path("/downstream/plc/foo"), 10);
        manager.subscribe(&a, &path("/downstream/plc/foo/temp"), 3, Some(1));
        manager.subscribe(&a, &path("/downstream/plc/foo/rpm"), 4, None);
        let reserved = foo.upstream_id();

        let (upstream, upstream_out) = responder("plc");
        manager.responder_connected(&upstream, None).expect("connect");

        let sent = upstream_out.sent();
        assert_eq!(sent.len(), 1);
        let requests = &sent[0].requests;
        assert_eq!(requests.len(), 2);
        let Request::List { rid, path: listed } = &requests[0] else {
            panic!("expected list, got {:?}", requests[0]);
        };
        assert_ne!(*rid, reserved);
        assert_eq!(listed, "/foo");
        assert_eq!(foo.upstream_id(), *rid);
        assert!(manager.get(UpstreamId::Request(reserved)).is_none());
        let Request::Subscribe { paths, .. } = &requests[1] else {
            panic!("expected subscribe, got {:?}", requests[1]);
        };
        assert_eq!(paths.len(), 2);
        let temp = paths.iter().find(|entry| entry.path == "/foo/temp").expect("temp");
        assert_eq!(temp.qos, Some(1));
    }

    #[test]
    fn offline_link_root_gets_synthetic_listing() {
        let manager = StreamManager::new("plc");
        let (upstream, _) = responder("plc");
        manager
            .responder_connected(&upstream, Some(serde_json::json!({"site": 4})))
            .expect("connect");
        manager.responder_disconnected(&upstream);

        let (a, a_out) = requester("a");
        manager.list(&a, &path("/downstream/plc"), 10);
        let responses = a_out.responses();
        let root = responses.last().expect("root");
        assert_eq!(root.rid, 10);
        assert_eq!(root.stream, Some(StreamStatus::Open));
        assert_eq!(root.updates[0], json!(["$is", "node"]));
        assert_eq!(root.updates[1][0], "$disconnectedTs");
        assert_eq!(root.updates[2], json!(["$linkData", {"site": 4}]));
    }

    #[test]
    fn upstream_close_deregisters_and_forgets_listeners() {
        let manager = StreamManager::new("plc");
        let (upstream, _) = responder("plc");
        manager.responder_connected(&upstream, None).expect("connect");
        let (a, a_out) = requester("a");
        let stream = manager.list(&a, &path("/downstream/plc/foo"), 10);
        assert!(a.has_list(10));

        manager.dispatch_response(Response::closed(stream.upstream_id()));
        assert!(a_out.responses()[0].is_closed());
        assert_eq!(manager.live_count(), 0);
        assert!(!a.has_list(10));
    }

    #[test]
    fn response_for_unknown_rid_is_dropped() {
        let manager = StreamManager::new("plc");
        manager.dispatch_response(Response::closed(999));
        manager.dispatch_subscriptions(vec![json!([999, 1, "t"])]);
        assert_eq!(manager.live_count(), 0);
    }
}
