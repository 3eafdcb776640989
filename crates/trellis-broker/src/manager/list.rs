// Downstream list paths -> shared upstream list streams.
use ahash::RandomState;
use parking_lot::RwLock;
use std::sync::Arc;
use trellis_common::ParsedPath;
use trellis_wire::Request;

use super::{PathMap, StreamManager, UpstreamId};
use crate::client::{Client, Registration};
use crate::dispatch::DispatchRecord;
use crate::stream::{Removal, Stream, StreamError};

#[derive(Debug)]
pub struct ListStreamManager {
    pub(super) paths: RwLock<PathMap>,
}

impl Default for ListStreamManager {
    fn default() -> Self {
        Self {
            paths: RwLock::new(PathMap::with_hasher(RandomState::new())),
        }
    }
}

impl ListStreamManager {
    pub fn rid_for(&self, path: &ParsedPath) -> Option<u64> {
        self.paths.read().get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.paths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.read().is_empty()
    }

    pub(crate) fn add(
        &self,
        owner: &Arc<StreamManager>,
        path: &ParsedPath,
        requester: &Arc<Client>,
        rid: u64,
    ) -> Arc<Stream> {
        let record = DispatchRecord::new(requester, rid);
        let stream = loop {
            {
                // Attach under the read lock so the stream cannot be torn
                // down between lookup and attach.
                let paths = self.paths.read();
                if let Some(&upstream) = paths.get(path) {
                    let stream = owner.expect_stream(UpstreamId::Request(upstream), path);
                    if attach(owner, &stream, path, &record) {
                        break stream;
                    }
                    continue;
                }
            }

            let mut paths = self.paths.write();
            let stream = match paths.get(path) {
                Some(&upstream) => owner.expect_stream(UpstreamId::Request(upstream), path),
                None => {
                    let upstream = owner.ids().next_rid();
                    paths.insert(path.clone(), upstream);
                    let stream = owner.add_if_absent(
                        UpstreamId::Request(upstream),
                        Arc::new(Stream::list(path.clone(), upstream)),
                    );
                    tracing::debug!(link = %owner.link(), %path, rid = upstream, "upstream list opened");
                    owner.send_upstream(vec![Request::List {
                        rid: upstream,
                        path: path.base_path().to_string(),
                    }]);
                    stream
                }
            };
            if attach(owner, &stream, path, &record) {
                break stream;
            }
        };

        let registered = requester.register_list(
            rid,
            Registration {
                manager: owner.clone(),
                stream: stream.clone(),
            },
        );
        if !registered {
            let same_stream = requester
                .list(rid)
                .is_some_and(|existing| Arc::ptr_eq(&existing.stream, &stream));
            if !same_stream {
                // The record would be unreachable from the requester; detach it.
                tracing::warn!(link = %requester.link(), rid, %path, "requester rid already registered");
                if let Some(upstream) = self.release(owner, &stream, requester, rid) {
                    owner.send_upstream(vec![Request::Close { rid: upstream }]);
                }
            }
        }
        stream
    }

    /// Re-key `stream` to `new_rid`. The old id entry is gone before the new
    /// one appears.
    pub fn move_stream(&self, owner: &StreamManager, stream: &Arc<Stream>, new_rid: u64) {
        let mut paths = self.paths.write();
        move_locked(owner, &mut paths, stream, new_rid);
    }

    /// Drop the path entry for `stream` (and its id entry); returns the rid
    /// it was registered under.
    pub fn remove(&self, owner: &StreamManager, stream: &Arc<Stream>) -> Option<u64> {
        let mut paths = self.paths.write();
        let rid = stream.upstream_id();
        owner
            .remove_locked(&mut paths, UpstreamId::Request(rid))
            .map(|_| rid)
    }

    /// Detach one listener; returns the upstream rid to close if it was the
    /// last.
    pub(crate) fn release(
        &self,
        owner: &StreamManager,
        stream: &Arc<Stream>,
        requester: &Arc<Client>,
        rid: u64,
    ) -> Option<u64> {
        let mut paths = self.paths.write();
        match stream.remove(requester, rid) {
            Removal::Emptied => {
                let upstream = stream.upstream_id();
                owner.remove_locked(&mut paths, UpstreamId::Request(upstream))?;
                Some(upstream)
            }
            Removal::Remaining(_) | Removal::NotMember => None,
        }
    }

    /// Move every registered list to a fresh rid and build the list requests
    /// for a newly connected responder.
    pub(super) fn relist_locked(&self, owner: &StreamManager, paths: &mut PathMap) -> Vec<Request> {
        let current = paths
            .iter()
            .map(|(path, rid)| (path.clone(), *rid))
            .collect::<Vec<_>>();
        let mut requests = Vec::with_capacity(current.len());
        for (path, old) in current {
            let stream = owner.expect_stream(UpstreamId::Request(old), &path);
            let rid = owner.ids().next_rid();
            move_locked(owner, paths, &stream, rid);
            stream.responder_connected();
            requests.push(Request::List {
                rid,
                path: path.base_path().to_string(),
            });
        }
        requests
    }
}

fn move_locked(owner: &StreamManager, paths: &mut PathMap, stream: &Arc<Stream>, new_rid: u64) {
    let mut streams = owner.streams.write();
    streams.remove(&UpstreamId::Request(stream.upstream_id()));
    stream.set_upstream_id(new_rid);
    streams.insert(UpstreamId::Request(new_rid), stream.clone());
    paths.insert(stream.path().clone(), new_rid);
}

fn attach(owner: &StreamManager, stream: &Arc<Stream>, path: &ParsedPath, record: &DispatchRecord) -> bool {
    match stream.add(record.clone()) {
        Ok(_) => {
            if path.is_link_root() && !owner.is_online() {
                record.post(owner.root_response(record.id()));
            }
            true
        }
        Err(StreamError::Closed) => {
            tracing::trace!(%path, "list stream closed while attaching; retrying");
            false
        }
    }
}
