//! Protocol kinds and RTT sample records.

use serde::{Deserialize, Serialize};

/// Transport protocol a measured flow belongs to.
///
/// Decided once at flow admission and immutable for the flow's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtoKind {
    /// TCP with VEC reserved-bit spin and the Timestamps option.
    Tcp = 0,
    /// Legacy draft-05 QUIC with the latency spin byte.
    Quic = 1,
    /// Path Layer UDP Substrate (PSN/PSE echo).
    Plus = 2,
}

impl ProtoKind {
    /// Short display name used in packet traces.
    pub const fn name(&self) -> &'static str {
        match self {
            ProtoKind::Tcp => "TCP",
            ProtoKind::Quic => "QUIC",
            ProtoKind::Plus => "PLUS",
        }
    }
}

/// One round-trip-time estimate produced by a flow's estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RttSample {
    /// Dense index of the flow the sample belongs to.
    pub flow_index: u32,
    /// Protocol the signal was extracted from.
    pub kind: ProtoKind,
    /// Estimated round-trip time in seconds.
    pub rtt: f64,
    /// Worker clock at the arrival of the packet that completed the pairing.
    pub arrival: f64,
}
