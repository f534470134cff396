//! Per-packet trace records.
//!
//! A record is attached to a buffer when node tracing is enabled and the
//! buffer carries the traced flag. Addresses are post-rewrite values.

use latency_common::ProtoKind;
use std::fmt;

/// Trace record attached to a processed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    /// Transport source port (host order).
    pub src_port: u16,
    /// Transport destination port (host order).
    pub dst_port: u16,
    /// Source address after rewrite.
    pub new_src_ip: u32,
    /// Destination address after rewrite.
    pub new_dst_ip: u32,
    /// Protocol kind of the flow.
    pub kind: ProtoKind,
    /// Packet's ordinal within the flow.
    pub pkt_count: u32,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LATENCY packet: type: {}", self.kind.name())?;
        writeln!(f, "   src port: {}, dst port: {}", self.src_port, self.dst_port)?;
        writeln!(
            f,
            "   (new) src ip: {}, (new) dst ip: {}",
            self.new_src_ip, self.new_dst_ip
        )?;
        writeln!(f, "   pkt number in flow: {}", self.pkt_count)
    }
}
