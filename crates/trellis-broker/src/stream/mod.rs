//! Shared upstream streams.
//!
//! A [`Stream`] is one upstream `list` or `subscribe` shared by every
//! downstream listener that asked for the same path. Listeners are
//! [`DispatchRecord`]s; each receives updates under its own id.
pub mod list;
pub mod sub;

use ahash::RandomState;
use hashbrown::HashSet;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use trellis_common::ParsedPath;
use trellis_wire::{Response, StreamStatus};

use crate::client::Client;
use crate::dispatch::DispatchRecord;
pub use list::ListStream;
pub use sub::SubStream;
use sub::with_sid;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    List,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Waiting for the first upstream response.
    Pending,
    Open,
    /// Terminal; the stream has left every registry.
    Closed,
}

/// Outcome of removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    NotMember,
    Remaining(usize),
    /// Last listener left; the stream is now closed.
    Emptied,
}

#[derive(Debug)]
enum Cache {
    List(ListStream),
    Sub(SubStream),
}

#[derive(Debug)]
struct StreamInner {
    phase: StreamPhase,
    listeners: HashSet<DispatchRecord, RandomState>,
    cache: Cache,
}

#[derive(Debug)]
pub struct Stream {
    path: ParsedPath,
    kind: StreamKind,
    // Upstream rid (list) or sid (subscribe). Only changes for list streams
    // re-keyed on responder reconnect.
    upstream_id: AtomicU64,
    inner: Mutex<StreamInner>,
}

pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false)
}

impl Stream {
    pub fn list(path: ParsedPath, rid: u64) -> Self {
        Self::new(path, StreamKind::List, rid, Cache::List(ListStream::default()))
    }

    pub fn sub(path: ParsedPath, sid: u64, qos: Option<u8>) -> Self {
        Self::new(path, StreamKind::Sub, sid, Cache::Sub(SubStream::new(qos)))
    }

    fn new(path: ParsedPath, kind: StreamKind, id: u64, cache: Cache) -> Self {
        Self {
            path,
            kind,
            upstream_id: AtomicU64::new(id),
            inner: Mutex::new(StreamInner {
                phase: StreamPhase::Pending,
                listeners: HashSet::with_hasher(RandomState::new()),
                cache,
            }),
        }
    }

    pub fn path(&self) -> &ParsedPath {
        &self.path
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn upstream_id(&self) -> u64 {
        self.upstream_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_upstream_id(&self, id: u64) {
        self.upstream_id.store(id, Ordering::Release);
    }

    pub fn phase(&self) -> StreamPhase {
        self.inner.lock().phase
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().listeners.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn qos(&self) -> Option<u8> {
        match &self.inner.lock().cache {
            Cache::Sub(sub) => sub.qos(),
            Cache::List(_) => None,
        }
    }

    /// Attach a listener and replay cached state to it. Returns false if the
    /// record was already attached.
    pub fn add(&self, record: DispatchRecord) -> Result<bool, StreamError> {
        let mut inner = self.inner.lock();
        if inner.phase == StreamPhase::Closed {
            return Err(StreamError::Closed);
        }
        if !inner.listeners.insert(record.clone()) {
            return Ok(false);
        }
        match &inner.cache {
            Cache::List(list) => {
                if let Some((status, updates)) = list.replay() {
                    record.post(Response::new(record.id(), status, updates));
                }
            }
            Cache::Sub(sub) => {
                if let Some(last) = sub.last() {
                    record.post(Response::new(0, None, vec![with_sid(last, record.id())]));
                }
            }
        }
        Ok(true)
    }

    /// Detach the listener `(client, id)`. Callers hold the registry write
    /// locks so an emptied stream can be deregistered atomically.
    pub fn remove(&self, client: &Arc<Client>, id: u64) -> Removal {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner
            .listeners
            .retain(|record| !(record.id() == id && record.belongs_to(client)));
        if inner.listeners.len() == before {
            return Removal::NotMember;
        }
        if inner.listeners.is_empty() {
            inner.phase = StreamPhase::Closed;
            return Removal::Emptied;
        }
        Removal::Remaining(inner.listeners.len())
    }

    /// Close the stream and hand back every listener still attached.
    pub(crate) fn close(&self) -> Vec<DispatchRecord> {
        let mut inner = self.inner.lock();
        inner.phase = StreamPhase::Closed;
        inner.listeners.drain().collect()
    }

    /// Route an upstream list response to every listener under its own rid.
    /// Returns true when upstream closed the stream.
    pub fn dispatch_response(&self, response: Response) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.phase == StreamPhase::Closed {
            tracing::trace!(path = %self.path, "response for closed stream dropped");
            return false;
        }
        let Cache::List(list) = &mut inner.cache else {
            tracing::trace!(path = %self.path, "list response for subscription dropped");
            return false;
        };
        let updates = list.apply(&response);
        let closed = response.is_closed();
        if !closed {
            inner.phase = StreamPhase::Open;
        }
        for record in &inner.listeners {
            record.post(Response {
                rid: record.id(),
                stream: response.stream,
                updates: updates.clone(),
                error: response.error.clone(),
            });
        }
        closed
    }

    /// Route a subscription value to every listener under its own sid.
    pub fn dispatch_update(&self, update: Value) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.phase == StreamPhase::Closed {
            return;
        }
        inner.phase = StreamPhase::Open;
        let Cache::Sub(sub) = &mut inner.cache else {
            tracing::trace!(path = %self.path, "value update for list stream dropped");
            return;
        };
        sub.apply(update.clone());
        for record in &inner.listeners {
            record.post(Response::new(0, None, vec![with_sid(&update, record.id())]));
        }
    }

    pub fn responder_connected(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == StreamPhase::Open {
            inner.phase = StreamPhase::Pending;
        }
    }

    pub fn responder_disconnected(&self, ts: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.phase == StreamPhase::Closed {
            return;
        }
        let sid = self.upstream_id();
        match &mut inner.cache {
            Cache::List(list) => {
                let marker = list.disconnect(ts);
                let status = list.status();
                for record in &inner.listeners {
                    record.post(Response::new(record.id(), status, vec![marker.clone()]));
                }
            }
            Cache::Sub(sub) => {
                let update = sub.disconnect(sid, ts);
                for record in &inner.listeners {
                    record.post(Response::new(0, None, vec![with_sid(&update, record.id())]));
                }
            }
        }
    }
}
