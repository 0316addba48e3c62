//! CLI entry point. Parses the config file, wires up logging, then
//! hands off to the Supervisor. Exit code 0 on clean shutdown, 1 on
//! fatal setup failure.

use std::process::ExitCode;
use stratum_agent::Configuration;
use tracing_subscriber::{prelude::*, EnvFilter};

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Configuration::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Non-blocking file writer's guard must outlive the whole run, or
    // buffered lines are dropped on shutdown.
    let _file_guard = init_logging(&config);

    match stratum_agent::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "agent exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Stdout logging is unconditional; a `-l <log_dir>` adds a daily-rolling
/// file sink on top of it.
fn init_logging(config: &Configuration) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let make_filter = || EnvFilter::try_new(&config.loglevel).unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(make_filter());

    match &config.log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "stratum-agent.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(make_filter());
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            None
        }
    }
}
