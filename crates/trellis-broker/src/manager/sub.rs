// Downstream subscription paths -> shared upstream subscriptions.
use ahash::RandomState;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use trellis_common::ParsedPath;
use trellis_wire::{Request, SubscribePath};

use super::{PathMap, StreamManager, UpstreamId};
use crate::client::{Client, Registration};
use crate::dispatch::DispatchRecord;
use crate::stream::sub::update_sid;
use crate::stream::{Removal, Stream, StreamError};

#[derive(Debug)]
pub struct SubStreamManager {
    pub(super) paths: RwLock<PathMap>,
}

impl Default for SubStreamManager {
    fn default() -> Self {
        Self {
            paths: RwLock::new(PathMap::with_hasher(RandomState::new())),
        }
    }
}

impl SubStreamManager {
    pub fn sid_for(&self, path: &ParsedPath) -> Option<u64> {
        self.paths.read().get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.paths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.read().is_empty()
    }

    /// Attach `requester`'s `sid` to the upstream subscription for `path`.
    /// The first subscriber allocates the upstream sid; later ones receive
    /// the cached value.
    pub(crate) fn subscribe(
        &self,
        owner: &Arc<StreamManager>,
        path: &ParsedPath,
        requester: &Arc<Client>,
        sid: u64,
        qos: Option<u8>,
    ) -> Arc<Stream> {
        let record = DispatchRecord::new(requester, sid);
        let stream = loop {
            {
                let paths = self.paths.read();
                if let Some(&upstream) = paths.get(path) {
                    let stream = owner.expect_stream(UpstreamId::Subscription(upstream), path);
                    if attach(&stream, path, &record) {
                        break stream;
                    }
                    continue;
                }
            }

            let mut paths = self.paths.write();
            let stream = match paths.get(path) {
                Some(&upstream) => owner.expect_stream(UpstreamId::Subscription(upstream), path),
                None => {
                    let upstream = owner.ids().next_sid();
                    paths.insert(path.clone(), upstream);
                    let stream = owner.add_if_absent(
                        UpstreamId::Subscription(upstream),
                        Arc::new(Stream::sub(path.clone(), upstream, qos)),
                    );
                    tracing::debug!(link = %owner.link(), %path, sid = upstream, "upstream subscription opened");
                    owner.send_upstream(vec![Request::Subscribe {
                        rid: owner.ids().next_rid(),
                        paths: vec![SubscribePath {
                            path: path.base_path().to_string(),
                            sid: upstream,
                            qos,
                        }],
                    }]);
                    stream
                }
            };
            if attach(&stream, path, &record) {
                break stream;
            }
        };

        requester.register_subscription(
            sid,
            Registration {
                manager: owner.clone(),
                stream: stream.clone(),
            },
        );
        stream
    }

    /// Detach one subscriber and unsubscribe upstream if it was the last.
    pub(crate) fn unsubscribe(
        &self,
        owner: &StreamManager,
        stream: &Arc<Stream>,
        requester: &Arc<Client>,
        sid: u64,
    ) {
        if let Some(upstream) = self.release(owner, stream, requester, sid) {
            owner.send_upstream(vec![Request::Unsubscribe {
                rid: owner.ids().next_rid(),
                sids: vec![upstream],
            }]);
        }
    }

    /// Detach one subscriber; returns the upstream sid to unsubscribe if the
    /// stream emptied.
    pub(crate) fn release(
        &self,
        owner: &StreamManager,
        stream: &Arc<Stream>,
        requester: &Arc<Client>,
        sid: u64,
    ) -> Option<u64> {
        let mut paths = self.paths.write();
        match stream.remove(requester, sid) {
            Removal::Emptied => {
                let upstream = stream.upstream_id();
                owner.remove_locked(&mut paths, UpstreamId::Subscription(upstream))?;
                Some(upstream)
            }
            Removal::Remaining(_) | Removal::NotMember => None,
        }
    }

    pub fn remove(&self, owner: &StreamManager, stream: &Arc<Stream>) -> Option<u64> {
        let mut paths = self.paths.write();
        let sid = stream.upstream_id();
        owner
            .remove_locked(&mut paths, UpstreamId::Subscription(sid))
            .map(|_| sid)
    }

    /// Forward value updates to the stream their sid names.
    pub(crate) fn dispatch(&self, owner: &StreamManager, updates: Vec<Value>) {
        for update in updates {
            let Some(sid) = update_sid(&update) else {
                tracing::trace!(link = %owner.link(), "value update without sid dropped");
                continue;
            };
            match owner.get(UpstreamId::Subscription(sid)) {
                Some(stream) => stream.dispatch_update(update),
                None => tracing::trace!(link = %owner.link(), sid, "value update for unknown sid dropped"),
            }
        }
    }

    /// Every registered subscription, for one batched resubscribe.
    pub(super) fn resubscribe_locked(&self, owner: &StreamManager, paths: &PathMap) -> Vec<SubscribePath> {
        paths
            .iter()
            .map(|(path, sid)| {
                let stream = owner.expect_stream(UpstreamId::Subscription(*sid), path);
                stream.responder_connected();
                SubscribePath {
                    path: path.base_path().to_string(),
                    sid: *sid,
                    qos: stream.qos(),
                }
            })
            .collect()
    }
}

fn attach(stream: &Arc<Stream>, path: &ParsedPath, record: &DispatchRecord) -> bool {
    match stream.add(record.clone()) {
        Ok(_) => true,
        Err(StreamError::Closed) => {
            tracing::trace!(%path, "subscription closed while attaching; retrying");
            false
        }
    }
}
