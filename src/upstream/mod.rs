//! Upstream stratum client (C5): owns one TCP link to a real pool,
//! scripted subscribe/authorize negotiation, job/difficulty replay, and
//! the ex-frame channel used to register/submit/unregister individual
//! downstream workers.

mod client;
mod shared;

pub use client::{run_upstream, UpstreamError};
pub use shared::{DownstreamOutbox, JobWindowEntry, UpstreamCache, UpstreamHandle, UpstreamState};
