//! Top-level setup errors surfaced to `main` (exit-code-1 path).
//! Per-connection protocol errors live in their owning module instead
//! (`downstream::DownstreamError`, `upstream::UpstreamError`) rather
//! than funneling everything through one type.

use std::fmt;

#[derive(Debug)]
pub enum AgentError {
    Io(std::io::Error),
    Config(serde_json::Error),
    NoPoolsConfigured,
    ListenerBind(std::io::Error),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Io(e) => write!(f, "io error: {}", e),
            AgentError::Config(e) => write!(f, "config error: {}", e),
            AgentError::NoPoolsConfigured => write!(f, "no upstream pools configured"),
            AgentError::ListenerBind(e) => write!(f, "failed to bind listener: {}", e),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Config(e)
    }
}
