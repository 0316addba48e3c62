use crate::codec::{ExFrame, LineCodec};
use crate::multiplexer::Multiplexer;
use crate::session_id::SessionId;
use crate::stratum::{error_line, notification_line, success_line, Request, StratumError};
use crate::upstream::{DownstreamOutbox, UpstreamHandle};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Idle read timeout: no line observed in this long kills
/// the session, bound or not.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Per-write timeout: a stalled miner socket is torn down
/// rather than left to back the outbox channel up forever.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(120);

const MAX_AGENT_LEN: usize = 30;
const OUTBOX_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Subscribed,
    Authenticated,
}

#[derive(Debug)]
pub enum DownstreamError {
    Io(std::io::Error),
    ReadTimeout,
    WriteTimeout,
}

impl fmt::Display for DownstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownstreamError::Io(e) => write!(f, "downstream io error: {}", e),
            DownstreamError::ReadTimeout => write!(f, "downstream session idle too long"),
            DownstreamError::WriteTimeout => write!(f, "downstream write stalled"),
        }
    }
}

impl std::error::Error for DownstreamError {}

impl From<std::io::Error> for DownstreamError {
    fn from(e: std::io::Error) -> Self {
        DownstreamError::Io(e)
    }
}

fn truncate_agent(s: &str) -> String {
    match s.char_indices().nth(MAX_AGENT_LEN) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Splits `user[.worker]` on the first `.`; the worker name is the suffix
/// if present, else the whole string (matches the original's
/// `getWorkerName()`).
fn split_worker_name(user_dot_worker: &str) -> String {
    match user_dot_worker.split_once('.') {
        Some((_, worker)) => worker.to_string(),
        None => user_dot_worker.to_string(),
    }
}

fn parse_hex_u32(v: &Value) -> Option<u32> {
    v.as_str().and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
}

/// Accepts and drives one downstream miner connection end to end.
pub async fn run_downstream_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    multiplexer: Arc<Multiplexer>,
) -> Result<(), DownstreamError> {
    let session_id = match multiplexer.allocate_session().await {
        Ok(id) => id,
        Err(_) => {
            warn!(%peer_addr, "rejecting connection: session id space exhausted");
            return Ok(());
        }
    };
    info!(%peer_addr, session = session_id.value(), "downstream session accepted");

    let result = drive_session(stream, &peer_addr, session_id, &multiplexer).await;

    if let Err(e) = multiplexer.free_session(session_id).await {
        warn!(session = session_id.value(), error = %e, "freeing session id failed");
    }
    match &result {
        Ok(()) => info!(%peer_addr, session = session_id.value(), "downstream session closed"),
        Err(e) => info!(%peer_addr, session = session_id.value(), error = %e, "downstream session terminated"),
    }
    result
}

struct Session {
    id: SessionId,
    state: State,
    agent: Option<String>,
    worker: Option<String>,
    bound_upstream: Option<Arc<UpstreamHandle>>,
    /// Set alongside `bound_upstream`; resolves once that upstream dies
    /// so the session can tear itself down immediately.
    upstream_alive: Option<watch::Receiver<bool>>,
    outbox_tx: mpsc::Sender<String>,
}

/// Resolves once `rx` reports the bound upstream has died, or never if
/// the session isn't bound yet. Checking `borrow()` before awaiting
/// `changed()` handles the case where the upstream died before this
/// session subscribed.
async fn wait_for_upstream_death(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            if !*rx.borrow() {
                return;
            }
            let _ = rx.changed().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn drive_session(
    stream: TcpStream,
    peer_addr: &SocketAddr,
    session_id: SessionId,
    multiplexer: &Arc<Multiplexer>,
) -> Result<(), DownstreamError> {
    let mut framed = Framed::new(stream, LineCodec);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);

    let mut session = Session {
        id: session_id,
        state: State::Connected,
        agent: None,
        worker: None,
        bound_upstream: None,
        upstream_alive: None,
        outbox_tx,
    };

    let result = session_loop(&mut session, &mut framed, multiplexer, &mut outbox_rx).await;

    if let Some(upstream) = session.bound_upstream.take() {
        upstream.downstream_outboxes.remove(&session.id);
        let _ = upstream
            .ex_tx
            .send(ExFrame::UnregisterWorker {
                session_id: session.id.value(),
            })
            .await;
    }

    result
}

async fn session_loop(
    session: &mut Session,
    framed: &mut Framed<TcpStream, LineCodec>,
    multiplexer: &Arc<Multiplexer>,
    outbox_rx: &mut mpsc::Receiver<String>,
) -> Result<(), DownstreamError> {
    loop {
        tokio::select! {
            line = timeout(READ_TIMEOUT, framed.next()) => {
                let line = line.map_err(|_| DownstreamError::ReadTimeout)?;
                let Some(line) = line else {
                    return Ok(());
                };
                let line = line?;
                if let Some(reply) = handle_line(session, multiplexer, &line).await {
                    timeout(WRITE_TIMEOUT, framed.send(reply))
                        .await
                        .map_err(|_| DownstreamError::WriteTimeout)??;
                }
            }
            Some(out) = outbox_rx.recv() => {
                timeout(WRITE_TIMEOUT, framed.send(out))
                    .await
                    .map_err(|_| DownstreamError::WriteTimeout)??;
            }
            _ = wait_for_upstream_death(&mut session.upstream_alive) => {
                // The bound upstream is gone, so this session is torn
                // down along with it rather than left to idle out on its
                // own read timeout.
                return Ok(());
            }
        }
    }
}

async fn handle_line(session: &mut Session, multiplexer: &Arc<Multiplexer>, line: &str) -> Option<String> {
    let request = match Request::parse(line) {
        Ok(r) => r,
        Err(e) => {
            debug!(session = session.id.value(), error = %e, "dropping unparseable line");
            return None;
        }
    };

    match request.method.as_str() {
        "mining.subscribe" => Some(handle_subscribe(session, &request)),
        "mining.authorize" => Some(handle_authorize(session, multiplexer, &request).await),
        "mining.submit" => Some(handle_submit(session, &request).await),
        other => {
            debug!(session = session.id.value(), method = other, "unknown method, not replying");
            None
        }
    }
}

fn handle_subscribe(session: &mut Session, request: &Request) -> String {
    if session.state != State::Connected {
        return error_line(request.id_value(), StratumError::Unknown);
    }
    if let Some(agent) = request.params_array().first().and_then(Value::as_str) {
        session.agent = Some(truncate_agent(agent));
    }
    session.state = State::Subscribed;

    let hex = session.id.as_hex8();
    let result = json!([
        [["mining.set_difficulty", hex], ["mining.notify", hex]],
        hex,
        4
    ]);
    success_line(request.id_value(), result)
}

async fn handle_authorize(session: &mut Session, multiplexer: &Arc<Multiplexer>, request: &Request) -> String {
    if session.state != State::Subscribed {
        return error_line(request.id_value(), StratumError::NotSubscribed);
    }
    let params = request.params_array();
    let Some(user_dot_worker) = params.first().and_then(Value::as_str) else {
        return error_line(request.id_value(), StratumError::InvalidUsername);
    };

    let Some(upstream) = multiplexer.pick_upstream().await else {
        warn!(session = session.id.value(), "no upstream available at authorize time");
        return error_line(request.id_value(), StratumError::InternalError);
    };

    session.worker = Some(split_worker_name(user_dot_worker));
    session.state = State::Authenticated;
    session.upstream_alive = Some(upstream.subscribe_alive());
    session.bound_upstream = Some(upstream.clone());

    upstream.downstream_outboxes.insert(
        session.id,
        DownstreamOutbox::new(session.outbox_tx.clone()),
    );

    let agent = session.agent.clone().unwrap_or_default();
    let worker_name = session.worker.clone().unwrap_or_default();
    let _ = upstream
        .ex_tx
        .send(ExFrame::RegisterWorker {
            session_id: session.id.value(),
            agent,
            worker_name,
        })
        .await;

    replay_cached_state(session, &upstream).await;

    success_line(request.id_value(), Value::Bool(true))
}

async fn replay_cached_state(session: &Session, upstream: &Arc<UpstreamHandle>) {
    let Some(entry) = upstream.downstream_outboxes.get(&session.id) else {
        return;
    };
    let cache = upstream.cache.read().await;
    if let Some(diff) = cache.latest_diff {
        entry.value().should_send_diff(diff);
        let line = notification_line("mining.set_difficulty", json!([diff]));
        let _ = entry.value().sender.try_send(line);
    }
    if let Some(notify) = &cache.latest_notify {
        let _ = entry.value().sender.try_send(notify.clone());
    }
}

async fn handle_submit(session: &mut Session, request: &Request) -> String {
    if session.state != State::Authenticated {
        let reconnect = notification_line("client.reconnect", json!([]));
        let _ = session.outbox_tx.try_send(reconnect);
        return error_line(request.id_value(), StratumError::Unauthorized);
    }

    let params = request.params_array();
    if params.len() < 5 {
        return error_line(request.id_value(), StratumError::IllegalParams);
    }

    let Some(job_id) = parse_hex_u32(&params[1]).map(|v| v as u8) else {
        return error_line(request.id_value(), StratumError::IllegalParams);
    };
    let Some(ex_nonce2) = parse_hex_u32(&params[2]) else {
        return error_line(request.id_value(), StratumError::IllegalParams);
    };
    let Some(n_time) = parse_hex_u32(&params[3]) else {
        return error_line(request.id_value(), StratumError::IllegalParams);
    };
    let Some(nonce) = parse_hex_u32(&params[4]) else {
        return error_line(request.id_value(), StratumError::IllegalParams);
    };

    if let Some(upstream) = &session.bound_upstream {
        let gbt_time = upstream.cache.read().await.gbt_time_for(job_id);
        let frame = if gbt_time == Some(n_time) {
            ExFrame::SubmitShare {
                session_id: session.id.value(),
                job_id,
                ex_nonce2,
                nonce,
            }
        } else {
            ExFrame::SubmitShareWithTime {
                session_id: session.id.value(),
                job_id,
                ex_nonce2,
                nonce,
                n_time,
            }
        };
        let _ = upstream.ex_tx.send(frame).await;
    }

    // Optimistic ack: the Agent does not wait for upstream adjudication
    //.
    success_line(request.id_value(), Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamState;

    fn make_upstream(idx: u8) -> Arc<UpstreamHandle> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(UpstreamHandle::new(idx, "pool".into(), 3333, "user".into(), tx))
    }

    #[tokio::test]
    async fn subscribe_then_authorize_then_submit_happy_path() {
        let upstream = make_upstream(0);
        upstream.set_state(UpstreamState::Authenticated);
        upstream.cache.write().await.latest_notify = Some("{\"id\":null}\n".to_string());
        let mux = Arc::new(Multiplexer::new(vec![upstream.clone()]));

        let session_id = mux.allocate_session().await.unwrap();
        let (outbox_tx, _outbox_rx) = mpsc::channel(8);
        let mut session = Session {
            id: session_id,
            state: State::Connected,
            agent: None,
            worker: None,
            bound_upstream: None,
            upstream_alive: None,
            outbox_tx,
        };

        let subscribe = Request::parse("{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"cgminer/1.0\"]}\n").unwrap();
        let reply = handle_subscribe(&mut session, &subscribe);
        assert_eq!(session.state, State::Subscribed);
        assert!(reply.contains("mining.set_difficulty"));

        let authorize = Request::parse("{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"user.worker1\"]}\n").unwrap();
        let reply = handle_authorize(&mut session, &mux, &authorize).await;
        assert_eq!(session.state, State::Authenticated);
        assert_eq!(reply, "{\"error\":null,\"id\":2,\"result\":true}\n");
        assert_eq!(session.worker.as_deref(), Some("worker1"));
        assert!(upstream.downstream_outboxes.contains_key(&session_id));

        let submit = Request::parse(
            "{\"id\":3,\"method\":\"mining.submit\",\"params\":[\"user.worker1\",\"05\",\"deadbeef\",\"61000010\",\"cafebabe\"]}\n",
        )
        .unwrap();
        let reply = handle_submit(&mut session, &submit).await;
        assert_eq!(reply, "{\"error\":null,\"id\":3,\"result\":true}\n");
    }

    #[tokio::test]
    async fn authorize_before_subscribe_is_rejected() {
        let mux = Arc::new(Multiplexer::new(vec![]));
        let session_id = mux.allocate_session().await.unwrap();
        let (outbox_tx, _rx) = mpsc::channel(8);
        let mut session = Session {
            id: session_id,
            state: State::Connected,
            agent: None,
            worker: None,
            bound_upstream: None,
            upstream_alive: None,
            outbox_tx,
        };
        let authorize = Request::parse("{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"user.worker\"]}\n").unwrap();
        let reply = handle_authorize(&mut session, &mux, &authorize).await;
        assert_eq!(reply, "{\"error\":[25,\"Not subscribed\",null],\"id\":1,\"result\":null}\n");
        assert_eq!(session.state, State::Connected);
    }

    #[tokio::test]
    async fn submit_before_authorize_pushes_reconnect() {
        let mux = Arc::new(Multiplexer::new(vec![]));
        let session_id = mux.allocate_session().await.unwrap();
        let (outbox_tx, mut outbox_rx) = mpsc::channel(8);
        let mut session = Session {
            id: session_id,
            state: State::Subscribed,
            agent: None,
            worker: None,
            bound_upstream: None,
            upstream_alive: None,
            outbox_tx,
        };
        let submit = Request::parse(
            "{\"id\":4,\"method\":\"mining.submit\",\"params\":[\"user.worker\",\"05\",\"deadbeef\",\"61000010\",\"cafebabe\"]}\n",
        )
        .unwrap();
        let reply = handle_submit(&mut session, &submit).await;
        assert_eq!(
            reply,
            "{\"error\":[24,\"Unauthorized worker\",null],\"id\":4,\"result\":null}\n"
        );
        let pushed = outbox_rx.recv().await.unwrap();
        assert_eq!(pushed, "{\"id\":null,\"method\":\"client.reconnect\",\"params\":[]}\n");
    }

    #[test]
    fn worker_name_splits_on_first_dot() {
        assert_eq!(split_worker_name("alice.rig1"), "rig1");
        assert_eq!(split_worker_name("alice"), "alice");
        assert_eq!(split_worker_name("alice.rig1.extra"), "rig1.extra");
    }

    #[test]
    fn agent_string_is_truncated_to_30_bytes() {
        let long = "x".repeat(40);
        assert_eq!(truncate_agent(&long).len(), 30);
    }
}
