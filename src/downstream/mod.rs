//! Downstream (miner-facing) stratum session (C4): the
//! Connected/Subscribed/Authenticated state machine, request handlers,
//! and the per-session outbox that fans diff/notify traffic back out.

mod session;

pub use session::{run_downstream_session, DownstreamError, READ_TIMEOUT, WRITE_TIMEOUT};
