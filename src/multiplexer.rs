//! Binds downstream sessions to upstream pools (C6): owns the session id
//! space and the live upstream table, and carries the fan-out/forwarding
//! rules between them.

use crate::session_id::{AllocError, FreeError, SessionId, SessionIdAllocator};
use crate::upstream::UpstreamHandle;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default number of upstream pool slots when none is given explicitly.
/// A `Supervisor` constructor parameter rather than a config key.
pub const DEFAULT_UPSTREAM_COUNT: usize = 5;

/// Owns the session id allocator and the set of upstream slots, and binds
/// new sessions to the least-loaded upstream at authorize time (not at
/// accept time). Slots are keyed by
/// index in a `DashMap`, since this table is touched concurrently by
/// independent tasks, so the Supervisor can
/// hot-swap a dead upstream's handle on reconnect without disturbing the
/// others.
pub struct Multiplexer {
    session_ids: Mutex<SessionIdAllocator>,
    upstreams: DashMap<u8, Arc<UpstreamHandle>>,
}

impl Multiplexer {
    pub fn new(upstreams: Vec<Arc<UpstreamHandle>>) -> Self {
        let table = DashMap::new();
        for handle in upstreams {
            table.insert(handle.idx, handle);
        }
        Multiplexer {
            session_ids: Mutex::new(SessionIdAllocator::new()),
            upstreams: table,
        }
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    pub async fn allocate_session(&self) -> Result<SessionId, AllocError> {
        self.session_ids.lock().await.alloc()
    }

    pub async fn free_session(&self, id: SessionId) -> Result<(), FreeError> {
        self.session_ids.lock().await.free(id)
    }

    /// Picks the upstream with the fewest bound authenticated sessions,
    /// breaking ties by lowest index. Returns `None` if no
    /// upstream is currently available (`UpstreamHandle::is_available`).
    pub async fn pick_upstream(&self) -> Option<Arc<UpstreamHandle>> {
        let mut best: Option<Arc<UpstreamHandle>> = None;
        for entry in self.upstreams.iter() {
            let handle = entry.value();
            if !handle.is_available().await {
                continue;
            }
            best = match best {
                None => Some(handle.clone()),
                Some(ref current) if handle.authenticated_count() < current.authenticated_count() => {
                    Some(handle.clone())
                }
                Some(current) => Some(current),
            };
        }
        best
    }

    /// Replaces the handle for `idx`, used by the Supervisor's steady-state
    /// reconnect tick to swap a dead upstream slot in place.
    pub fn replace_upstream(&self, idx: u8, handle: Arc<UpstreamHandle>) {
        self.upstreams.insert(idx, handle);
    }

    pub fn all_handles(&self) -> Vec<Arc<UpstreamHandle>> {
        self.upstreams.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(idx: u8) -> Arc<UpstreamHandle> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(UpstreamHandle::new(idx, "pool".to_string(), 3333, "user".to_string(), tx))
    }

    #[tokio::test]
    async fn picks_least_loaded_then_lowest_index() {
        let a = handle(0);
        let b = handle(1);
        a.set_state(crate::upstream::UpstreamState::Authenticated);
        b.set_state(crate::upstream::UpstreamState::Authenticated);
        a.cache.write().await.latest_notify = Some("{}\n".to_string());
        b.cache.write().await.latest_notify = Some("{}\n".to_string());

        let mux = Multiplexer::new(vec![a.clone(), b.clone()]);

        // Both equally loaded (0 sessions): lowest index wins.
        let picked = mux.pick_upstream().await.unwrap();
        assert_eq!(picked.idx, 0);

        // Load up `a` so `b` becomes strictly less loaded.
        let session = mux.allocate_session().await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        a.downstream_outboxes
            .insert(session, crate::upstream::DownstreamOutbox::new(tx));
        let picked = mux.pick_upstream().await.unwrap();
        assert_eq!(picked.idx, 1);
    }

    #[tokio::test]
    async fn unavailable_upstreams_are_skipped() {
        let a = handle(0);
        let mux = Multiplexer::new(vec![a]);
        assert!(mux.pick_upstream().await.is_none());
    }

    #[tokio::test]
    async fn session_allocation_round_trips_through_multiplexer() {
        let mux = Multiplexer::new(vec![]);
        let id = mux.allocate_session().await.unwrap();
        assert_eq!(id.value(), 0);
        mux.free_session(id).await.unwrap();
    }

    #[tokio::test]
    async fn replace_upstream_swaps_the_slot() {
        let a = handle(0);
        let mux = Multiplexer::new(vec![a]);
        let replacement = handle(0);
        replacement.set_state(crate::upstream::UpstreamState::Authenticated);
        replacement.cache.write().await.latest_notify = Some("{}\n".to_string());
        mux.replace_upstream(0, replacement);
        assert!(mux.pick_upstream().await.is_some());
    }
}
