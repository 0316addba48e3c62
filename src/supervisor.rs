//! Startup/steady-state orchestration (C7): brings up `N` upstream
//! slots, gates downstream accepts on all of them becoming available,
//! then runs the accept loop and the 10s reconnect tick until shutdown
//!.

use crate::config::{Configuration, PoolConfig};
use crate::downstream::run_downstream_session;
use crate::multiplexer::{Multiplexer, DEFAULT_UPSTREAM_COUNT};
use crate::shared::utils::AbortOnDrop;
use crate::upstream::{run_upstream, UpstreamHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

const STARTUP_TICK: Duration = Duration::from_secs(1);
const STEADY_STATE_TICK: Duration = Duration::from_secs(10);

/// Runs the agent end to end: build the upstream fleet, wait for
/// readiness, then accept downstream connections until a shutdown
/// signal arrives.
pub async fn run(config: Configuration) -> Result<(), crate::error::AgentError> {
    run_with_upstream_count(config, DEFAULT_UPSTREAM_COUNT).await
}

async fn run_with_upstream_count(
    config: Configuration,
    upstream_count: usize,
) -> Result<(), crate::error::AgentError> {
    let pools = Arc::new(config.pools);
    let mut upstream_handles = Vec::with_capacity(upstream_count);
    let mut upstream_tasks: Vec<AbortOnDrop> = Vec::with_capacity(upstream_count);

    for idx in 0..upstream_count {
        let (handle, task) = spawn_upstream(idx as u8, pools.clone(), config.pool_user.clone());
        upstream_handles.push(handle);
        upstream_tasks.push(task);
    }

    let multiplexer = Arc::new(Multiplexer::new(upstream_handles));

    info!("waiting for all {} upstream slots to become available", upstream_count);
    let mut startup_ticker = interval(STARTUP_TICK);
    loop {
        startup_ticker.tick().await;
        // A slot whose first negotiation failed at boot has already exited
        // (`run_upstream` walks the pool list once and returns); respawn it
        // here too, or a single bad upstream wedges startup forever since
        // the steady-state respawn below isn't reached until readiness
        // passes.
        respawn_dead_slots(&mut upstream_tasks, &multiplexer, &pools, &config.pool_user);

        let mut all_ready = true;
        for upstream in multiplexer.all_handles() {
            if !upstream.is_available().await {
                all_ready = false;
                break;
            }
        }
        if all_ready {
            break;
        }
    }
    info!("all upstream slots available, accepting downstream connections");

    let listener = TcpListener::bind((config.agent_listen_ip, config.agent_listen_port))
        .await
        .map_err(crate::error::AgentError::ListenerBind)?;

    let mut steady_ticker = interval(STEADY_STATE_TICK);
    let mut shutdown = shutdown_signal();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let mux = multiplexer.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_downstream_session(stream, peer_addr, mux).await {
                        warn!(%peer_addr, error = %e, "downstream session ended with error");
                    }
                });
            }
            _ = steady_ticker.tick() => {
                respawn_dead_slots(&mut upstream_tasks, &multiplexer, &pools, &config.pool_user);
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, draining sessions");
                break;
            }
        }
    }

    Ok(())
}

/// Re-spawns every slot whose connection task has already exited,
/// whether that happened during the startup negotiation walk or later in
/// steady state — a transient boot-time connect/negotiate failure must
/// not wedge the slot forever waiting on the steady-state tick.
fn respawn_dead_slots(
    upstream_tasks: &mut [AbortOnDrop],
    multiplexer: &Multiplexer,
    pools: &Arc<Vec<PoolConfig>>,
    pool_user: &str,
) {
    for (idx, task) in upstream_tasks.iter_mut().enumerate() {
        if task.is_finished() {
            warn!(upstream = idx, "upstream slot died, reconnecting");
            let (handle, new_task) = spawn_upstream(idx as u8, pools.clone(), pool_user.to_string());
            // Swap the slot in the Multiplexer's table too, so new
            // authorize-time binds see the fresh handle. The old handle's
            // bound sessions were already unwound via its `alive` watch
            // when its connection task exited.
            multiplexer.replace_upstream(idx as u8, handle);
            *task = new_task;
        }
    }
}

fn spawn_upstream(
    idx: u8,
    pools: Arc<Vec<PoolConfig>>,
    pool_user: String,
) -> (Arc<UpstreamHandle>, AbortOnDrop) {
    let (ex_tx, ex_rx) = mpsc::channel(256);
    let first = pools.first();
    let handle = Arc::new(UpstreamHandle::new(
        idx,
        first.map(|p| p.host.clone()).unwrap_or_default(),
        first.map(|p| p.port).unwrap_or_default(),
        pool_user,
        ex_tx,
    ));

    let task_handle = handle.clone();
    let task_pools = pools;
    let join = tokio::spawn(async move {
        if let Err(e) = run_upstream(task_handle.clone(), &task_pools, ex_rx).await {
            error!(upstream = task_handle.idx, error = %e, "upstream slot failed");
        }
        // Whether it failed or the link merely closed, every session
        // bound to this handle must be torn down now.
        task_handle.set_state(crate::upstream::UpstreamState::Init);
        task_handle.notify_dead();
    });

    (handle, AbortOnDrop::from(join))
}

#[cfg(unix)]
async fn shutdown_signal() -> () {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> () {
    let _ = tokio::signal::ctrl_c().await;
}
