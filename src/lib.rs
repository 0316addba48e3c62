//! Mining-pool aggregation proxy: multiplexes many downstream stratum
//! miners over a handful of upstream pool connections.
//!
//! Module layout: [`session_id`] allocates downstream session ids,
//! [`codec`] frames both the downstream line protocol and the upstream
//! binary multiplex channel, [`downstream`] and [`upstream`] drive the
//! two sides of a connection, [`multiplexer`] binds them together, and
//! [`supervisor`] owns process-level startup/shutdown.

pub mod codec;
pub mod config;
pub mod downstream;
pub mod error;
pub mod multiplexer;
pub mod session_id;
pub mod shared;
pub mod stratum;
pub mod supervisor;
pub mod upstream;

pub use config::Configuration;
pub use error::AgentError;
pub use supervisor::run;
