// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::session::Session;

/// Stable identity of a session inside a registry.
///
/// Stream sessions are keyed by an opaque per-process id; datagram
/// sessions by the peer endpoint (the server) or the local endpoint (a
/// client), which is what the UDP dispatcher demultiplexes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Local(u64),
    Peer(SocketAddr),
}

/// Concurrent map of live sessions.
///
/// A session appears here exactly while it is `Started`. Insertion is
/// insert-if-absent so key collisions (e.g. a UDP endpoint reappearing
/// before the old session drained) surface to the caller. Iteration holds
/// shard read locks and must not mutate the registry.
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::with_capacity(64),
        }
    }

    /// Insert-if-absent; false reports a key collision.
    pub fn insert(&self, session: Arc<Session>) -> bool {
        match self.sessions.entry(session.key()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            },
        }
    }

    /// Remove by key; false when the key was already gone.
    pub fn remove(&self, key: &SessionKey) -> bool {
        self.sessions.remove(key).is_some()
    }

    /// Strong reference lookup.
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Visit every session under the shared lock. `f` must not insert or
    /// erase.
    pub fn for_each<F>(&self, mut f: F)
    where F: FnMut(&Arc<Session>) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }

    /// First session matching the predicate.
    pub fn find_if<F>(&self, mut pred: F) -> Option<Arc<Session>>
    where F: FnMut(&Arc<Session>) -> bool {
        self.sessions
            .iter()
            .find(|entry| pred(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all sessions; safe to mutate the registry afterwards.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
