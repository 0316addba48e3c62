//! CLI parsing and JSON config file loading. CLI flags take precedence
//! over the file, mirroring the usual CLI-over-file style, simplified
//! here since there is no environment-variable layer in this crate's
//! config surface.

use crate::error::AgentError;
use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

/// One upstream pool entry as it appears in the config file's `pools`
/// array.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    agent_listen_ip: IpAddr,
    agent_listen_port: u16,
    pools: Vec<PoolConfig>,
    pool_user: String,
}

#[derive(Parser, Debug)]
#[command(name = "stratum-agent", version, about = "Stratum multiplexing agent")]
struct Args {
    /// Path to the JSON config file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
    /// Directory for a daily-rolling log file; stdout logging always happens.
    #[arg(short = 'l', long = "log-dir")]
    log_dir: Option<PathBuf>,
    /// Log level: trace|debug|info|warn|error|off.
    #[arg(long = "loglevel")]
    loglevel: Option<String>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub agent_listen_ip: IpAddr,
    pub agent_listen_port: u16,
    pub pools: Vec<PoolConfig>,
    pub pool_user: String,
    pub log_dir: Option<PathBuf>,
    pub loglevel: String,
}

impl Configuration {
    /// Parses CLI args, loads and validates the JSON config file they
    /// point at. `NoPoolsConfigured` surfaces as the
    /// exit-code-1 path in `main`.
    pub fn load() -> Result<Self, AgentError> {
        let args = Args::parse();
        let contents = std::fs::read_to_string(&args.config)?;
        let file: ConfigFile = serde_json::from_str(&contents)?;

        if file.pools.is_empty() {
            return Err(AgentError::NoPoolsConfigured);
        }

        let loglevel = args
            .loglevel
            .unwrap_or_else(|| "info".to_string());
        let loglevel = match loglevel.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => loglevel,
            _ => {
                eprintln!("Invalid log level '{}'. Defaulting to 'info'.", loglevel);
                "info".to_string()
            }
        };

        Ok(Configuration {
            agent_listen_ip: file.agent_listen_ip,
            agent_listen_port: file.agent_listen_port,
            pools: file.pools,
            pool_user: file.pool_user,
            log_dir: args.log_dir,
            loglevel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_config_file() {
        let json = r#"{
            "agent_listen_ip": "0.0.0.0",
            "agent_listen_port": 3333,
            "pools": [{"host": "pool.example.com", "port": 3333}],
            "pool_user": "agent-worker"
        }"#;
        let parsed: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.pools.len(), 1);
        assert_eq!(parsed.pools[0].host, "pool.example.com");
        assert_eq!(parsed.pool_user, "agent-worker");
    }
}
