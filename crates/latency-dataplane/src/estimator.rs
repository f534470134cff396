//! Per-protocol RTT estimator state machines.
//!
//! Each estimator consumes directional signals and pairs a forward
//! observation with the reverse observation that echoes it; the arrival-time
//! delta is the RTT sample. Direction is decided against the endpoint that
//! sent the flow's first packet.

use crate::wire::{QuicHeader, TcpHeader, TcpTimestamps};
use latency_common::ProtoKind;

/// Which way a packet travels relative to the flow initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Same source as the flow's first packet.
    Forward,
    /// The reply direction.
    Reverse,
}

/// Classify a packet against the flow's initiating endpoint.
#[inline(always)]
pub fn direction(src_ip: u32, src_port: u16, init_src_ip: u32, init_src_port: u16) -> Direction {
    if src_ip == init_src_ip && src_port == init_src_port {
        Direction::Forward
    } else {
        Direction::Reverse
    }
}

/// Last spin value seen in one direction and when it first appeared.
#[derive(Debug, Clone, Copy, Default)]
struct SpinState {
    value: Option<u8>,
    since: f64,
}

/// Spin-signal observer shared by the QUIC spin byte and the TCP VEC bits.
///
/// A direction's spin value changing marks an edge; the edge pairs with the
/// opposite direction's current value when both carry the same spin phase,
/// and the sample is the time since that value appeared on the opposite
/// side. The first observation in a direction only seeds state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinObserver {
    fwd: SpinState,
    rev: SpinState,
}

impl SpinObserver {
    /// Feed one observation; returns an RTT sample on a paired edge.
    pub fn observe(&mut self, dir: Direction, value: u8, now: f64) -> Option<f64> {
        let opp = match dir {
            Direction::Forward => self.rev,
            Direction::Reverse => self.fwd,
        };
        let me = match dir {
            Direction::Forward => &mut self.fwd,
            Direction::Reverse => &mut self.rev,
        };

        if me.value == Some(value) {
            return None;
        }
        let had_prev = me.value.is_some();
        me.value = Some(value);
        me.since = now;

        if had_prev && opp.value == Some(value) {
            Some(now - opp.since)
        } else {
            None
        }
    }
}

/// QUIC latency-spin estimator.
#[derive(Debug, Clone, Copy)]
pub struct QuicEstimator {
    conn_id: Option<u64>,
    spin: SpinObserver,
    last_pn_fwd: Option<u32>,
    last_pn_rev: Option<u32>,
}

impl QuicEstimator {
    /// New estimator; `conn_id` from the admitting packet if it carried one.
    pub fn new(conn_id: Option<u64>) -> Self {
        Self {
            conn_id,
            spin: SpinObserver::default(),
            last_pn_fwd: None,
            last_pn_rev: None,
        }
    }

    /// Connection ID observed so far.
    pub fn conn_id(&self) -> Option<u64> {
        self.conn_id
    }

    /// Feed one packet. Packets whose number does not exceed the last one
    /// recorded for their direction are discarded as reordered.
    pub fn update(&mut self, dir: Direction, hdr: &QuicHeader, now: f64) -> Option<f64> {
        let last_pn = match dir {
            Direction::Forward => &mut self.last_pn_fwd,
            Direction::Reverse => &mut self.last_pn_rev,
        };
        if let Some(last) = *last_pn {
            if hdr.packet_number <= last {
                return None;
            }
        }
        *last_pn = Some(hdr.packet_number);

        if hdr.conn_id.is_some() {
            self.conn_id = hdr.conn_id;
        }

        self.spin.observe(dir, hdr.spin, now)
    }
}

/// Samples one TCP packet can yield.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TcpSamples {
    /// Timestamp-option echo pairing.
    pub timestamp: Option<f64>,
    /// VEC spin edge pairing.
    pub spin: Option<f64>,
    /// Handshake fallback (SYN seq + 1 seen forward again).
    pub handshake: Option<f64>,
}

/// TCP estimator: VEC spin, Timestamps option echo, handshake fallback.
///
/// The caller must not feed SYN+ACK packets; they carry no usable VEC.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpEstimator {
    spin: SpinObserver,
    fwd_ts: Option<(u32, f64)>,
    rev_ts: Option<(u32, f64)>,
    syn_seq: Option<(u32, f64)>,
}

impl TcpEstimator {
    /// New empty estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet's signals.
    pub fn update(
        &mut self,
        dir: Direction,
        hdr: &TcpHeader,
        ts: Option<TcpTimestamps>,
        now: f64,
    ) -> TcpSamples {
        let mut out = TcpSamples::default();

        out.spin = self.spin.observe(dir, hdr.vec, now);

        if let Some(ts) = ts {
            // TSecr is only meaningful on packets carrying an ACK.
            if hdr.is_ack() {
                let opp = match dir {
                    Direction::Forward => &mut self.rev_ts,
                    Direction::Reverse => &mut self.fwd_ts,
                };
                if let Some((val, t0)) = *opp {
                    if ts.tsecr == val {
                        out.timestamp = Some(now - t0);
                        *opp = None;
                    }
                }
            }
            // Remember the first arrival carrying this TSval.
            let mine = match dir {
                Direction::Forward => &mut self.fwd_ts,
                Direction::Reverse => &mut self.rev_ts,
            };
            match *mine {
                Some((val, _)) if val == ts.tsval => {}
                _ => *mine = Some((ts.tsval, now)),
            }
        }

        if dir == Direction::Forward {
            if hdr.is_syn() && !hdr.is_ack() {
                // Arm the fallback only when timestamps are unavailable.
                self.syn_seq = if ts.is_none() { Some((hdr.seq, now)) } else { None };
            } else if let Some((seq, t0)) = self.syn_seq {
                if hdr.seq == seq.wrapping_add(1) {
                    out.handshake = Some(now - t0);
                    self.syn_seq = None;
                }
            }
        }

        out
    }
}

/// PLUS PSN/PSE estimator.
#[derive(Debug, Clone, Copy)]
pub struct PlusEstimator {
    cat: u64,
    fwd_psn: Option<(u32, f64)>,
    last_pse: u32,
}

impl PlusEstimator {
    /// New estimator bound to the association token from admission.
    pub fn new(cat: u64) -> Self {
        Self {
            cat,
            fwd_psn: None,
            last_pse: 0,
        }
    }

    /// Connection-association token, immutable after admission.
    pub fn cat(&self) -> u64 {
        self.cat
    }

    /// Last packet sequence echo observed on the reverse path.
    pub fn last_pse(&self) -> u32 {
        self.last_pse
    }

    /// Feed one packet's PSN/PSE pair.
    pub fn update(&mut self, dir: Direction, psn: u32, pse: u32, now: f64) -> Option<f64> {
        match dir {
            Direction::Forward => {
                self.fwd_psn = Some((psn, now));
                None
            }
            Direction::Reverse => {
                self.last_pse = pse;
                if let Some((remembered, t0)) = self.fwd_psn {
                    if pse == remembered {
                        self.fwd_psn = None;
                        return Some(now - t0);
                    }
                }
                None
            }
        }
    }
}

/// Protocol-tagged estimator state carried by a flow.
#[derive(Debug, Clone, Copy)]
pub enum Estimator {
    /// TCP estimator state.
    Tcp(TcpEstimator),
    /// QUIC estimator state.
    Quic(QuicEstimator),
    /// PLUS estimator state.
    Plus(PlusEstimator),
}

impl Estimator {
    /// Protocol kind this estimator measures.
    pub fn kind(&self) -> ProtoKind {
        match self {
            Estimator::Tcp(_) => ProtoKind::Tcp,
            Estimator::Quic(_) => ProtoKind::Quic,
            Estimator::Plus(_) => ProtoKind::Plus,
        }
    }
}
