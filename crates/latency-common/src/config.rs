//! Worker configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Default timer tick in seconds (100 ms).
pub const DEFAULT_TICK: f64 = 0.1;

/// Default idle-flow timeout in ticks (30 s).
pub const DEFAULT_TIMEOUT_TICKS: u32 = 300;

/// Default UDP port used for QUIC detection.
pub const DEFAULT_QUIC_PORT: u16 = 4433;

/// One entry of the admission table: flows to `port` are admitted and their
/// destination rewritten to `new_dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstRewrite {
    /// Destination port the entry matches.
    pub port: u16,
    /// Rewrite destination for admitted flows.
    pub new_dst: Ipv4Addr,
}

/// Configuration for one latency worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// UDP port that selects the QUIC branch (source or destination match).
    pub quic_port: u16,
    /// Timer wheel tick in seconds.
    pub tick: f64,
    /// Idle-flow timeout in ticks.
    pub timeout_ticks: u32,
    /// Admission table, `dst_port -> new_dst_ip`.
    pub rewrites: Vec<DstRewrite>,
    /// Attach trace records to flagged buffers.
    pub trace: bool,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            quic_port: DEFAULT_QUIC_PORT,
            tick: DEFAULT_TICK,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            rewrites: Vec::new(),
            trace: false,
        }
    }
}

impl LatencyConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tick > 0.0) {
            return Err(ConfigError::InvalidTick(self.tick));
        }
        if self.timeout_ticks == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        for rw in &self.rewrites {
            if rw.new_dst.is_unspecified() {
                return Err(ConfigError::InvalidRewrite(rw.port));
            }
        }
        Ok(())
    }
}
