//! State shared between an `UpstreamClient`'s connection task and every
//! `DownstreamSession` bound to it: the job/difficulty cache, the
//! 3-entry job window, and the per-session outboxes used to fan notify
//! and set_difficulty events out to miners.

use crate::codec::ExFrame;
use crate::session_id::SessionId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, watch, RwLock};

const JOB_WINDOW_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpstreamState {
    Init = 0,
    Connected = 1,
    Subscribed = 2,
    Authenticated = 3,
}

#[derive(Debug, Clone, Copy)]
pub struct JobWindowEntry {
    pub job_id: u8,
    pub gbt_time: u32,
}

/// Everything a newly authenticated `DownstreamSession` needs to replay
/// immediately, plus what a fresh `mining.submit` needs to classify as
/// `SUBMIT_SHARE` vs `SUBMIT_SHARE_WITH_TIME`.
#[derive(Debug, Default)]
pub struct UpstreamCache {
    pub latest_notify: Option<String>,
    pub latest_diff: Option<u64>,
    job_window: VecDeque<JobWindowEntry>,
}

impl UpstreamCache {
    /// FIFO-evicting push into the 3-slot job window.
    pub fn push_job(&mut self, job_id: u8, gbt_time: u32) {
        if self.job_window.len() == JOB_WINDOW_SIZE {
            self.job_window.pop_front();
        }
        self.job_window.push_back(JobWindowEntry { job_id, gbt_time });
    }

    /// `gbtTime` recorded for `job_id`, if it's still in the window.
    pub fn gbt_time_for(&self, job_id: u8) -> Option<u32> {
        self.job_window
            .iter()
            .rev()
            .find(|e| e.job_id == job_id)
            .map(|e| e.gbt_time)
    }
}

/// A downstream session's outbound line channel plus the last
/// difficulty sent to it, for per-session coalescing (send only if the
/// session's last-sent diff differs).
pub struct DownstreamOutbox {
    pub sender: mpsc::Sender<String>,
    last_sent_diff: StdMutex<Option<u64>>,
}

impl DownstreamOutbox {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        DownstreamOutbox {
            sender,
            last_sent_diff: StdMutex::new(None),
        }
    }

    /// Returns `true` if `diff` differs from the last value sent to this
    /// session (and records it), i.e. whether the caller should send.
    pub fn should_send_diff(&self, diff: u64) -> bool {
        let mut last = self.last_sent_diff.lock().expect("lock not poisoned");
        if *last == Some(diff) {
            false
        } else {
            *last = Some(diff);
            true
        }
    }
}

/// Shared handle to one upstream pool connection. Cloned (via `Arc`)
/// into every bound `DownstreamSession` and into the Multiplexer's
/// per-slot table; the connection task itself owns the TCP link.
pub struct UpstreamHandle {
    pub idx: u8,
    pub host: String,
    pub port: u16,
    pub user_name: String,
    pub cache: RwLock<UpstreamCache>,
    state: std::sync::atomic::AtomicU8,
    /// Sessions currently bound to this upstream and authenticated,
    /// keyed by session id, used to fan out notify/set_difficulty.
    pub downstream_outboxes: DashMap<SessionId, DownstreamOutbox>,
    /// Ex-frames queued by bound downstream sessions for this upstream's
    /// connection task to write out.
    pub ex_tx: mpsc::Sender<ExFrame>,
    /// Flips to `false` once this upstream's connection task exits for
    /// any reason. Every `DownstreamSession` bound to this handle
    /// subscribes to it so that losing the upstream destroys its bound
    /// sessions promptly rather than waiting out the 15-minute read
    /// timeout. `watch` (unlike
    /// `Notify`) remembers its last value, so a session that binds after
    /// the upstream has already died still observes the death instead of
    /// racing a one-shot wakeup.
    alive_tx: watch::Sender<bool>,
}

impl UpstreamHandle {
    pub fn new(idx: u8, host: String, port: u16, user_name: String, ex_tx: mpsc::Sender<ExFrame>) -> Self {
        UpstreamHandle {
            idx,
            host,
            port,
            user_name,
            cache: RwLock::new(UpstreamCache::default()),
            state: std::sync::atomic::AtomicU8::new(UpstreamState::Init as u8),
            downstream_outboxes: DashMap::new(),
            ex_tx,
            alive_tx: watch::channel(true).0,
        }
    }

    /// Marks this handle dead. Idempotent; every current
    /// and future `subscribe_alive()` receiver observes it.
    pub fn notify_dead(&self) {
        let _ = self.alive_tx.send(false);
    }

    /// A receiver a bound `DownstreamSession` holds to detect this
    /// upstream dying, even if it subscribes after the fact.
    pub fn subscribe_alive(&self) -> watch::Receiver<bool> {
        self.alive_tx.subscribe()
    }

    pub fn state(&self) -> UpstreamState {
        match self.state.load(std::sync::atomic::Ordering::Acquire) {
            0 => UpstreamState::Init,
            1 => UpstreamState::Connected,
            2 => UpstreamState::Subscribed,
            _ => UpstreamState::Authenticated,
        }
    }

    pub fn set_state(&self, state: UpstreamState) {
        self.state.store(state as u8, std::sync::atomic::Ordering::Release);
    }

    /// `true` iff `Authenticated` and at least one `mining.notify` has
    /// been observed.
    pub async fn is_available(&self) -> bool {
        self.state() == UpstreamState::Authenticated && self.cache.read().await.latest_notify.is_some()
    }

    pub fn authenticated_count(&self) -> usize {
        self.downstream_outboxes.len()
    }
}
