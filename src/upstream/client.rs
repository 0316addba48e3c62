//! The upstream connection task: resolves and connects to one pool,
//! drives the scripted subscribe/authorize negotiation,
//! then loops replaying notify/set_difficulty to bound downstream
//! sessions and forwarding queued ex-frames upstream.

use super::shared::{UpstreamHandle, UpstreamState};
use crate::codec::{ExFrame, UpstreamFrame, UpstreamLinkCodec};
use crate::config::PoolConfig;
use crate::stratum::{notification_line, OutboundRequest};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// User-agent string this Agent advertises to upstream pools in its own
/// `mining.subscribe`, analogous to the original's `BTCCOM_MINER_AGENT`.
pub const AGENT_NAME: &str = concat!("rust-mining-agent/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub enum UpstreamError {
    Io(std::io::Error),
    Resolve(String),
    /// Shape violation in a subscribe/authorize reply, or in steady-state
    /// traffic — fatal for this upstream.
    Protocol(String),
    /// The link was poisoned by a framing error and is
    /// torn down without attempting to resynchronize.
    Framing(std::io::Error),
    Closed,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Io(e) => write!(f, "upstream io error: {}", e),
            UpstreamError::Resolve(h) => write!(f, "failed to resolve upstream host: {}", h),
            UpstreamError::Protocol(s) => write!(f, "upstream protocol violation: {}", s),
            UpstreamError::Framing(e) => write!(f, "upstream framing error: {}", e),
            UpstreamError::Closed => write!(f, "upstream connection closed"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<std::io::Error> for UpstreamError {
    fn from(e: std::io::Error) -> Self {
        UpstreamError::Io(e)
    }
}

async fn resolve_first_ipv4(host: &str, port: u16) -> Result<SocketAddr, UpstreamError> {
    // No IPv6 support: take the first IPv4 record and ignore the rest.
    tokio::net::lookup_host((host, port))
        .await
        .map_err(UpstreamError::Io)?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| UpstreamError::Resolve(host.to_string()))
}

/// Runs one upstream connection slot end to end: walks `pools` in order,
/// accepting the first that resolves, connects, and reaches
/// `Authenticated`, then replays/forwards until a fatal
/// error or the link closes. Returning `Err` here is the Supervisor's
/// signal to tear this upstream (and every downstream session bound to
/// it) down and retry.
pub async fn run_upstream(
    shared: Arc<UpstreamHandle>,
    pools: &[PoolConfig],
    mut ex_rx: mpsc::Receiver<ExFrame>,
) -> Result<(), UpstreamError> {
    let mut link = connect_and_negotiate(&shared, pools).await?;

    info!(upstream = shared.idx, "upstream authenticated");

    loop {
        tokio::select! {
            frame = link.next() => {
                let frame = frame.ok_or(UpstreamError::Closed)?.map_err(UpstreamError::Framing)?;
                handle_steady_state_frame(&shared, frame).await?;
            }
            Some(ex_frame) = ex_rx.recv() => {
                if shared.state() != UpstreamState::Authenticated {
                    warn!(upstream = shared.idx, "dropping ex-frame: upstream not authenticated");
                    continue;
                }
                link.send(UpstreamFrame::Ex(ex_frame)).await?;
            }
        }
    }
}

/// Tries each pool in order, returning the first link that connects and
/// completes subscribe+authorize. Fatal per-candidate errors (anything
/// but a connect/resolve failure) still fall through to the next
/// candidate during this startup walk, matching "accepting the first
/// that resolves and reaches Authenticated" rather than
/// aborting the whole slot on one bad pool.
async fn connect_and_negotiate(
    shared: &Arc<UpstreamHandle>,
    pools: &[PoolConfig],
) -> Result<Framed<TcpStream, UpstreamLinkCodec>, UpstreamError> {
    let mut last_err = UpstreamError::Resolve("no pools configured".to_string());
    for pool in pools {
        shared.set_state(UpstreamState::Init);
        let addr = match resolve_first_ipv4(&pool.host, pool.port).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(upstream = shared.idx, host = %pool.host, port = pool.port, "resolve failed, trying next pool");
                last_err = e;
                continue;
            }
        };
        info!(upstream = shared.idx, %addr, "connecting to upstream pool");
        let stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                warn!(upstream = shared.idx, %addr, error = %e, "connect failed, trying next pool");
                last_err = UpstreamError::Io(e);
                continue;
            }
        };
        shared.set_state(UpstreamState::Connected);

        let mut link = Framed::new(stream, UpstreamLinkCodec::default());
        let subscribe = OutboundRequest {
            id: 1,
            method: "mining.subscribe",
            params: serde_json::json!([AGENT_NAME]),
        };
        match negotiate(shared, &mut link, subscribe).await {
            Ok(()) => return Ok(link),
            Err(e) => {
                warn!(upstream = shared.idx, host = %pool.host, error = %e, "negotiation failed, trying next pool");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn negotiate(
    shared: &Arc<UpstreamHandle>,
    link: &mut Framed<TcpStream, UpstreamLinkCodec>,
    subscribe: OutboundRequest,
) -> Result<(), UpstreamError> {
    link.send(UpstreamFrame::Json(subscribe.to_line())).await?;
    negotiate_subscribe(shared, link).await?;
    negotiate_authorize(shared, link).await
}

async fn negotiate_subscribe(
    shared: &Arc<UpstreamHandle>,
    link: &mut Framed<TcpStream, UpstreamLinkCodec>,
) -> Result<(), UpstreamError> {
    loop {
        let frame = link.next().await.ok_or(UpstreamError::Closed)?.map_err(UpstreamError::Framing)?;
        let line = match frame {
            UpstreamFrame::Json(line) => line,
            UpstreamFrame::Ex(_) => {
                return Err(UpstreamError::Protocol(
                    "received ex-frame before subscribe completed".into(),
                ))
            }
        };
        let reply: Value = serde_json::from_str(line.trim_end())
            .map_err(|e| UpstreamError::Protocol(format!("malformed subscribe reply: {}", e)))?;
        if !reply["error"].is_null() {
            return Err(UpstreamError::Protocol(format!(
                "subscribe rejected: {}",
                reply["error"]
            )));
        }
        let result = reply["result"]
            .as_array()
            .ok_or_else(|| UpstreamError::Protocol("subscribe result is not an array".into()))?;
        if result.len() < 3 {
            return Err(UpstreamError::Protocol(
                "subscribe result has fewer than 3 elements".into(),
            ));
        }
        // result[1] is the upstream's own extranonce1; recorded only for
        // diagnostics. The downstream extranonce1 is the session id, not
        // this value.
        let upstream_extranonce1 = result[1]
            .as_str()
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or_else(|| UpstreamError::Protocol("extranonce1 is not hex".into()))?;
        debug!(upstream = shared.idx, upstream_extranonce1, "subscribed to upstream");

        let extranonce2_size = result[2].as_u64();
        if extranonce2_size != Some(8) {
            return Err(UpstreamError::Protocol(format!(
                "upstream extranonce2_size must be 8, got {:?}",
                extranonce2_size
            )));
        }

        shared.set_state(UpstreamState::Subscribed);

        let authorize = OutboundRequest {
            id: 2,
            method: "mining.authorize",
            params: serde_json::json!([shared.user_name, ""]),
        };
        link.send(UpstreamFrame::Json(authorize.to_line())).await?;
        return Ok(());
    }
}

async fn negotiate_authorize(
    shared: &Arc<UpstreamHandle>,
    link: &mut Framed<TcpStream, UpstreamLinkCodec>,
) -> Result<(), UpstreamError> {
    loop {
        let frame = link.next().await.ok_or(UpstreamError::Closed)?.map_err(UpstreamError::Framing)?;
        let line = match frame {
            UpstreamFrame::Json(line) => line,
            UpstreamFrame::Ex(_) => {
                return Err(UpstreamError::Protocol(
                    "received ex-frame before authorize completed".into(),
                ))
            }
        };
        let reply: Value = serde_json::from_str(line.trim_end())
            .map_err(|e| UpstreamError::Protocol(format!("malformed authorize reply: {}", e)))?;
        if reply["error"].is_null() && reply["result"].as_bool() == Some(true) {
            shared.set_state(UpstreamState::Authenticated);
            return Ok(());
        }
        return Err(UpstreamError::Protocol(format!(
            "authorize failed: {}",
            line.trim_end()
        )));
    }
}

async fn handle_steady_state_frame(
    shared: &Arc<UpstreamHandle>,
    frame: UpstreamFrame,
) -> Result<(), UpstreamError> {
    match frame {
        UpstreamFrame::Json(line) => handle_steady_state_line(shared, &line).await,
        UpstreamFrame::Ex(ExFrame::MiningSetDiff { diff, session_ids }) => {
            route_ex_set_diff(shared, diff, &session_ids).await;
            Ok(())
        }
        UpstreamFrame::Ex(other) => Err(UpstreamError::Protocol(format!(
            "received an Agent->Pool ex-frame kind from the pool: {:?}",
            other
        ))),
    }
}

async fn handle_steady_state_line(shared: &Arc<UpstreamHandle>, line: &str) -> Result<(), UpstreamError> {
    let msg: Value = match serde_json::from_str(line.trim_end()) {
        Ok(v) => v,
        Err(e) => {
            // A malformed line mid-stream is a shape violation, fatal
            // for the upstream.
            return Err(UpstreamError::Protocol(format!("malformed line: {}", e)));
        }
    };

    if let Some(method) = msg["method"].as_str() {
        let params = msg["params"].as_array().cloned().unwrap_or_default();
        match method {
            "mining.set_difficulty" => handle_set_difficulty(shared, &params).await,
            "mining.notify" => handle_notify(shared, &params, line).await,
            other => {
                // Unknown, not unparseable: real pools send benign server
                // methods (mining.set_extranonce, client.reconnect,
                // mining.ping, ...) we don't act on. Log and keep the
                // link up rather than tearing down every bound downstream
                // session over it.
                debug!(upstream = shared.idx, method = other, "unknown method, ignoring");
            }
        }
        return Ok(());
    }

    // A reply to one of our own requests (e.g. a submit ack echoed by a
    // non-ex-frame-aware pool). We ack downstream optimistically already
    //, so there is nothing further to do with it other
    // than confirm it isn't an error envelope for something we care
    // about.
    if !msg["error"].is_null() {
        debug!(upstream = shared.idx, %line, "upstream returned an error reply");
    }
    Ok(())
}

async fn handle_set_difficulty(shared: &Arc<UpstreamHandle>, params: &[Value]) {
    let Some(diff) = params.first().and_then(Value::as_f64) else {
        warn!(upstream = shared.idx, "mining.set_difficulty with no numeric diff, ignoring");
        return;
    };
    let diff = diff.round() as u64;
    shared.cache.write().await.latest_diff = Some(diff);
    broadcast_diff(shared, diff);
}

fn broadcast_diff(shared: &Arc<UpstreamHandle>, diff: u64) {
    let line = notification_line("mining.set_difficulty", serde_json::json!([diff]));
    for entry in shared.downstream_outboxes.iter() {
        if entry.value().should_send_diff(diff) {
            let _ = entry.value().sender.try_send(line.clone());
        }
    }
}

async fn route_ex_set_diff(shared: &Arc<UpstreamHandle>, diff: u32, session_ids: &[u16]) {
    let diff = diff as u64;
    shared.cache.write().await.latest_diff = Some(diff);
    let line = notification_line("mining.set_difficulty", serde_json::json!([diff]));
    for id in session_ids {
        if let Some(entry) = shared
            .downstream_outboxes
            .iter()
            .find(|e| e.key().value() == *id)
        {
            if entry.value().should_send_diff(diff) {
                let _ = entry.value().sender.try_send(line.clone());
            }
        }
    }
}

async fn handle_notify(shared: &Arc<UpstreamHandle>, params: &[Value], raw_line: &str) {
    let job_id = params
        .first()
        .and_then(Value::as_str)
        .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .map(|v| v as u8)
        .unwrap_or(0);
    let n_time = params
        .get(7)
        .and_then(Value::as_str)
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .unwrap_or(0);

    {
        let mut cache = shared.cache.write().await;
        cache.latest_notify = Some(raw_line.to_string());
        cache.push_job(job_id, n_time);
    }

    for entry in shared.downstream_outboxes.iter() {
        let _ = entry.value().sender.try_send(raw_line.to_string());
    }
}
