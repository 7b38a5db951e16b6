use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::Protocol;

pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid target address: {0}")]
    InvalidTarget(String),
    #[error("only IPv4 targets are supported, got {0}")]
    UnsupportedTarget(IpAddr),
    #[error("no valid ports were specified")]
    NoPorts,
    #[error("no protocols were selected")]
    NoProtocols,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

/// Validated settings for one scan run.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub target: Ipv4Addr,
    pub ports: Vec<u16>,
    pub protocols: Vec<Protocol>,
    pub interface: String,
    pub timeout: Duration,
    pub threads: usize,
    pub output: Option<PathBuf>,
}

impl ScanConfig {
    /// Validate raw settings. `threads == 0` selects the platform default.
    pub fn new(
        target: &str,
        mut ports: Vec<u16>,
        mut protocols: Vec<Protocol>,
        interface: String,
        timeout_ms: u64,
        threads: usize,
        output: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let target = match target.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4,
            Ok(other) => return Err(ConfigError::UnsupportedTarget(other)),
            Err(_) => return Err(ConfigError::InvalidTarget(target.to_string())),
        };
        ports.sort_unstable();
        ports.dedup();
        if ports.is_empty() || ports.contains(&0) {
            return Err(ConfigError::NoPorts);
        }
        protocols.sort();
        protocols.dedup();
        if protocols.is_empty() {
            return Err(ConfigError::NoProtocols);
        }
        if timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(Self {
            target,
            ports,
            protocols,
            interface,
            timeout: Duration::from_millis(timeout_ms),
            threads: resolve_threads(threads),
            output,
        })
    }

    pub fn task_count(&self) -> usize {
        self.ports.len() * self.protocols.len()
    }
}

/// Worker count: the requested value, or the platform concurrency hint when 0. Never below 1.
pub fn resolve_threads(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(1)
}
