//! The latency node: run-to-completion fast-path driver.
//!
//! Sits immediately before IPv4 forwarding. Every buffer of a frame is
//! parsed, matched or admitted to a flow, fed to the flow's RTT estimator,
//! rewritten, and handed to the downstream sink in input order. Packets the
//! node cannot or will not process are forwarded byte-identical; the node
//! never drops.
//!
//! One node instance is one worker: it owns its flow store and timer wheel
//! outright. Parallel workers each get their own instance, with flows
//! steered per worker by the host's RSS hash.

use crate::buffer::{BufferPool, PacketBuffer};
use crate::estimator::{
    direction, Estimator, PlusEstimator, QuicEstimator, TcpEstimator, TcpSamples,
};
use crate::flow::{make_key, make_plus_key, Flow, FlowKey, FlowState, FlowStore, FlowTable};
use crate::rewrite::{ipv4_header_checksum, nat_translate, transport_checksum};
use crate::stats::NodeStats;
use crate::timer::TimerWheel;
use crate::trace::TraceRecord;
use crate::wire::{
    bump_plus_hop_count, parse_ipv4, parse_plus, parse_quic, parse_tcp, parse_tcp_options,
    parse_udp, IP_PROTO_TCP, IP_PROTO_UDP, SIZE_IP4, SIZE_PLUS, SIZE_TCP, SIZE_UDP,
};
use crossbeam::channel::Sender;
use dashmap::DashMap;
use latency_common::{ConfigError, LatencyConfig, ProtoKind, RttSample};
use std::sync::atomic::Ordering;

/// Name of the downstream node every buffer is enqueued to.
pub const NEXT_NODE: &str = "ip4-lookup";

/// Downstream sink; receives every buffer of a frame in input order.
pub trait PacketSink {
    /// Enqueue one buffer.
    fn enqueue(&mut self, buffer: u32);
}

impl PacketSink for Vec<u32> {
    fn enqueue(&mut self, buffer: u32) {
        self.push(buffer);
    }
}

/// Admission oracle: `dst_port -> new_dst_ip`, populated by the management
/// plane. A port with no entry declines admission.
pub struct DstTable {
    map: DashMap<u16, u32>,
}

impl DstTable {
    /// New empty table.
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Register a rewrite destination for a port.
    pub fn insert(&self, port: u16, new_dst_ip: u32) {
        self.map.insert(port, new_dst_ip);
    }

    /// Drop a port's entry.
    pub fn remove(&self, port: u16) {
        self.map.remove(&port);
    }

    /// Rewrite destination for `port`, if the port is registered.
    #[inline(always)]
    pub fn lookup_dst(&self, port: u16) -> Option<u32> {
        self.map.get(&port).map(|e| *e)
    }
}

impl Default for DstTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One latency worker.
pub struct LatencyNode {
    quic_port: u16,
    timeout_ticks: u32,
    trace_enabled: bool,
    dst_table: DstTable,
    table: FlowTable,
    store: FlowStore,
    wheel: TimerWheel,
    samples: Sender<RttSample>,
    stats: NodeStats,
    expired: Vec<u32>,
}

impl LatencyNode {
    /// Build a worker from its configuration; RTT samples go to `samples`.
    pub fn new(config: LatencyConfig, samples: Sender<RttSample>) -> Result<Self, ConfigError> {
        config.validate()?;
        let dst_table = DstTable::new();
        for rw in &config.rewrites {
            dst_table.insert(rw.port, u32::from(rw.new_dst));
        }
        Ok(Self {
            quic_port: config.quic_port,
            timeout_ticks: config.timeout_ticks,
            trace_enabled: config.trace,
            dst_table,
            table: FlowTable::new(),
            store: FlowStore::new(),
            wheel: TimerWheel::new(config.tick),
            samples,
            stats: NodeStats::default(),
            expired: Vec::new(),
        })
    }

    /// Admission table, for the management plane to mutate at runtime.
    pub fn dst_table(&self) -> &DstTable {
        &self.dst_table
    }

    /// Node counters.
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Key registrations, two per live flow.
    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Borrow a flow record by index.
    pub fn flow(&self, index: u32) -> Option<&Flow> {
        self.store.get(index)
    }

    /// Live flow count.
    pub fn flow_count(&self) -> usize {
        self.store.len()
    }

    /// Toggle trace-record attachment.
    pub fn set_trace(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
    }

    /// Process one frame of buffers, enqueueing each to `sink` in order.
    pub fn process_frame(
        &mut self,
        clock: f64,
        pool: &mut BufferPool,
        frame: &[u32],
        sink: &mut impl PacketSink,
    ) {
        for &bi in frame {
            // Timer advancement is coupled to packet arrival.
            self.expire_flows(clock);

            self.stats.record_packet();
            let buf = pool.get_mut(bi);
            if self.observe(clock, buf).is_none() {
                self.stats.record_skip();
            }
            sink.enqueue(bi);
        }
    }

    /// Reclaim flows whose idle timer has passed.
    fn expire_flows(&mut self, clock: f64) {
        let mut expired = std::mem::take(&mut self.expired);
        self.wheel.expire_now(clock, &mut expired);
        for index in expired.drain(..) {
            if let Some(flow) = self.store.destroy(index) {
                self.table.remove(&flow.key);
                self.table.remove(&flow.key_reverse);
                self.stats.flows_expired.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(flow = index, "idle flow reclaimed");
            }
        }
        self.expired = expired;
    }

    /// The per-packet fast path. `None` means the packet takes the skip
    /// path: it is forwarded exactly as it arrived.
    fn observe(&mut self, now: f64, buf: &mut PacketBuffer) -> Option<()> {
        let ip = parse_ipv4(buf.current()).ok()?;
        let l4 = SIZE_IP4;

        let (index, admitted, is_udp, src_port, dst_port) = match ip.protocol {
            IP_PROTO_UDP => {
                let udp = parse_udp(&buf.current()[l4..]).ok()?;

                if udp.src_port == self.quic_port || udp.dst_port == self.quic_port {
                    // QUIC, detected by port.
                    let quic = parse_quic(&buf.current()[l4 + SIZE_UDP..]).ok()?;
                    let key = make_key(ip.src, ip.dst, udp.src_port, udp.dst_port, ip.protocol);
                    let (index, admitted) = self.find_or_admit(
                        key,
                        ip.src,
                        udp.src_port,
                        udp.dst_port,
                        now,
                        Estimator::Quic(QuicEstimator::new(quic.conn_id)),
                    )?;

                    let mut rtt = None;
                    {
                        let flow = self.store.get_mut(index)?;
                        let dir =
                            direction(ip.src, udp.src_port, flow.init_src_ip, flow.init_src_port);
                        if let Estimator::Quic(est) = &mut flow.estimator {
                            rtt = est.update(dir, &quic, now);
                        }
                    }
                    if let Some(rtt) = rtt {
                        self.emit_sample(index, ProtoKind::Quic, rtt, now);
                    }
                    (index, admitted, true, udp.src_port, udp.dst_port)
                } else {
                    // PLUS attempt.
                    let plus = parse_plus(&buf.current()[l4 + SIZE_UDP..]).ok()?;
                    let key = make_plus_key(
                        ip.src,
                        ip.dst,
                        udp.src_port,
                        udp.dst_port,
                        ip.protocol,
                        plus.cat,
                    );
                    let (index, admitted) = self.find_or_admit(
                        key,
                        ip.src,
                        udp.src_port,
                        udp.dst_port,
                        now,
                        Estimator::Plus(PlusEstimator::new(plus.cat)),
                    )?;

                    let mut rtt = None;
                    {
                        let flow = self.store.get_mut(index)?;
                        let dir =
                            direction(ip.src, udp.src_port, flow.init_src_ip, flow.init_src_port);
                        if let Estimator::Plus(est) = &mut flow.estimator {
                            rtt = est.update(dir, plus.psn, plus.pse, now);
                        }
                    }
                    if let Some(rtt) = rtt {
                        self.emit_sample(index, ProtoKind::Plus, rtt, now);
                    }

                    // Hop-count extension is bumped in place on traversal.
                    if plus.extended() {
                        let ext_at = l4 + SIZE_UDP + SIZE_PLUS;
                        bump_plus_hop_count(&mut buf.current_mut()[ext_at..]);
                    }
                    (index, admitted, true, udp.src_port, udp.dst_port)
                }
            }

            IP_PROTO_TCP => {
                let tcp = parse_tcp(&buf.current()[l4..]).ok()?;
                let ts = parse_tcp_options(&tcp, &buf.current()[l4 + SIZE_TCP..]).ok()?;

                // SYN+ACK carries no usable VEC.
                let measure = !(tcp.is_syn() && tcp.is_ack());

                let key = make_key(ip.src, ip.dst, tcp.src_port, tcp.dst_port, ip.protocol);
                let (index, admitted) = self.find_or_admit(
                    key,
                    ip.src,
                    tcp.src_port,
                    tcp.dst_port,
                    now,
                    Estimator::Tcp(TcpEstimator::new()),
                )?;

                let mut samples = TcpSamples::default();
                if measure {
                    let flow = self.store.get_mut(index)?;
                    let dir = direction(ip.src, tcp.src_port, flow.init_src_ip, flow.init_src_port);
                    if let Estimator::Tcp(est) = &mut flow.estimator {
                        samples = est.update(dir, &tcp, ts, now);
                    }
                }
                for rtt in [samples.timestamp, samples.spin, samples.handshake]
                    .into_iter()
                    .flatten()
                {
                    self.emit_sample(index, ProtoKind::Tcp, rtt, now);
                }
                (index, admitted, false, tcp.src_port, tcp.dst_port)
            }

            _ => return None,
        };

        // Count the packet against its flow.
        if !admitted {
            self.store.get_mut(index)?.pkt_count += 1;
        }
        let (init_src_ip, new_dst_ip, state, kind, pkt_count) = {
            let flow = self.store.get(index)?;
            (
                flow.init_src_ip,
                flow.new_dst_ip,
                flow.state,
                flow.kind(),
                flow.pkt_count,
            )
        };

        // NAT-like IP translation; inconsistent addressing forwards the
        // packet untouched with stale checksums and no timer refresh.
        if !nat_translate(&mut buf.current_mut()[..SIZE_IP4], init_src_ip, new_dst_ip) {
            return None;
        }

        // Transport checksum, then the IP header checksum over the
        // rewritten addresses.
        let seg_len = (ip.total_length as usize)
            .saturating_sub(SIZE_IP4)
            .min(buf.current_length() - SIZE_IP4);
        {
            let data = buf.current_mut();
            let src = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
            let dst = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
            let ck_at = l4 + if is_udp { 6 } else { 16 };
            if ck_at + 2 <= l4 + seg_len {
                data[ck_at] = 0;
                data[ck_at + 1] = 0;
                let ck = transport_checksum(src, dst, ip.protocol, &data[l4..l4 + seg_len]);
                data[ck_at..ck_at + 2].copy_from_slice(&ck.to_be_bytes());
            }
            let ck = ipv4_header_checksum(&data[..SIZE_IP4]);
            data[10..12].copy_from_slice(&ck.to_be_bytes());
        }

        // The timer refreshes only while the flow is Active.
        if state == FlowState::Active {
            let handle = self.wheel.update(index, now, self.timeout_ticks);
            if let Some(flow) = self.store.get_mut(index) {
                flow.timer = handle;
            }
        }

        if self.trace_enabled && buf.is_traced() {
            let (new_src_ip, new_dst_ip) = {
                let data = buf.current();
                (
                    u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
                    u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
                )
            };
            buf.trace = Some(TraceRecord {
                src_port,
                dst_port,
                new_src_ip,
                new_dst_ip,
                kind,
                pkt_count,
            });
        }

        Some(())
    }

    /// Look the key up, or admit a new flow when the destination port is
    /// registered. Returns the flow index and whether it was just created.
    fn find_or_admit(
        &mut self,
        key: FlowKey,
        src_ip: u32,
        src_port: u16,
        dst_port: u16,
        now: f64,
        estimator: Estimator,
    ) -> Option<(u32, bool)> {
        if let Some(index) = self.table.lookup(&key) {
            self.stats.record_hit();
            return Some((index, false));
        }
        self.stats.record_miss();

        // Only flows toward a registered destination are admitted.
        let new_dst_ip = self.dst_table.lookup_dst(dst_port)?;

        let key_reverse = key.reverse(new_dst_ip);
        let index = self
            .store
            .create(key, key_reverse, src_ip, src_port, new_dst_ip, estimator);
        self.table.insert(key, index);
        self.table.insert(key_reverse, index);

        let handle = self.wheel.start(index, now, self.timeout_ticks);
        if let Some(flow) = self.store.get_mut(index) {
            flow.timer = handle;
        }

        self.stats.flows_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(flow = index, dst_port, "flow admitted");
        Some((index, true))
    }

    fn emit_sample(&self, flow_index: u32, kind: ProtoKind, rtt: f64, arrival: f64) {
        self.stats.samples.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(flow = flow_index, kind = kind.name(), rtt, "rtt sample");
        if self
            .samples
            .send(RttSample {
                flow_index,
                kind,
                rtt,
                arrival,
            })
            .is_err()
        {
            tracing::trace!("sample sink disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IS_TRACED;
    use crate::wire::{PLUS_EXTENDED, PLUS_MAGIC};
    use crossbeam::channel::{unbounded, Receiver};
    use latency_common::DstRewrite;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    const CLIENT: [u8; 4] = [1, 1, 1, 1];
    const ORIG_DST: [u8; 4] = [8, 8, 8, 8];
    const WEB_DST: [u8; 4] = [10, 0, 0, 1]; // lookup_dst(80)
    const QUIC_DST: [u8; 4] = [10, 0, 0, 2]; // lookup_dst(4433)

    fn ip4(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; SIZE_IP4];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&((SIZE_IP4 + payload.len()) as u16).to_be_bytes());
        pkt[8] = 64;
        pkt[9] = proto;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        let ck = ipv4_header_checksum(&pkt);
        pkt[10..12].copy_from_slice(&ck.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut seg = vec![0u8; SIZE_UDP];
        seg[0..2].copy_from_slice(&src_port.to_be_bytes());
        seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
        seg[4..6].copy_from_slice(&((SIZE_UDP + payload.len()) as u16).to_be_bytes());
        seg.extend_from_slice(payload);
        seg
    }

    fn tcp(src_port: u16, dst_port: u16, seq: u32, flags: u8, opts: &[u8]) -> Vec<u8> {
        assert_eq!(opts.len() % 4, 0);
        let mut seg = vec![0u8; SIZE_TCP];
        seg[0..2].copy_from_slice(&src_port.to_be_bytes());
        seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
        seg[4..8].copy_from_slice(&seq.to_be_bytes());
        seg[12] = ((5 + opts.len() / 4) as u8) << 4;
        seg[13] = flags;
        seg.extend_from_slice(opts);
        seg
    }

    fn ts_option(tsval: u32, tsecr: u32) -> Vec<u8> {
        let mut opts = vec![1u8, 1, 8, 10]; // NOP NOP TS(10)
        opts.extend_from_slice(&tsval.to_be_bytes());
        opts.extend_from_slice(&tsecr.to_be_bytes());
        opts
    }

    fn quic_short(pn: u8, spin: u8) -> Vec<u8> {
        vec![0x01, pn, spin]
    }

    fn plus(flags: u32, psn: u32, pse: u32, cat: u64, ext: &[u8]) -> Vec<u8> {
        let mut seg = Vec::new();
        seg.extend_from_slice(&((PLUS_MAGIC << 28) | flags).to_be_bytes());
        seg.extend_from_slice(&psn.to_be_bytes());
        seg.extend_from_slice(&pse.to_be_bytes());
        seg.extend_from_slice(&cat.to_be_bytes());
        seg.extend_from_slice(ext);
        seg
    }

    const SYN: u8 = 0x02;
    const ACK: u8 = 0x10;

    fn node() -> (LatencyNode, Receiver<RttSample>) {
        let (tx, rx) = unbounded();
        let config = LatencyConfig {
            rewrites: vec![
                DstRewrite {
                    port: 80,
                    new_dst: Ipv4Addr::from(WEB_DST),
                },
                DstRewrite {
                    port: 4433,
                    new_dst: Ipv4Addr::from(QUIC_DST),
                },
            ],
            ..Default::default()
        };
        (LatencyNode::new(config, tx).unwrap(), rx)
    }

    /// Run one packet through the node at `clock`; returns its buffer index.
    fn run_one(node: &mut LatencyNode, pool: &mut BufferPool, clock: f64, pkt: Vec<u8>) -> u32 {
        let bi = pool.alloc(pkt);
        let mut sink = Vec::new();
        node.process_frame(clock, pool, &[bi], &mut sink);
        assert_eq!(sink, vec![bi]);
        bi
    }

    fn ip_checksum_ok(pkt: &[u8]) -> bool {
        let stored = u16::from_be_bytes([pkt[10], pkt[11]]);
        ipv4_header_checksum(pkt) == stored
    }

    fn transport_checksum_ok(pkt: &[u8]) -> bool {
        let proto = pkt[9];
        let src = u32::from_be_bytes([pkt[12], pkt[13], pkt[14], pkt[15]]);
        let dst = u32::from_be_bytes([pkt[16], pkt[17], pkt[18], pkt[19]]);
        let total = u16::from_be_bytes([pkt[2], pkt[3]]) as usize;
        let mut seg = pkt[SIZE_IP4..total].to_vec();
        let ck_at = if proto == IP_PROTO_UDP { 6 } else { 16 };
        let stored = u16::from_be_bytes([seg[ck_at], seg[ck_at + 1]]);
        seg[ck_at] = 0;
        seg[ck_at + 1] = 0;
        transport_checksum(src, dst, proto, &seg) == stored
    }

    #[test]
    fn scenario_unadmitted_flow_forwarded_untouched() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();
        let pkt = ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 22, 1, SYN, &[]));
        let before = pkt.clone();

        let bi = run_one(&mut node, &mut pool, 1.0, pkt);

        assert_eq!(pool.get(bi).current(), &before[..]);
        assert_eq!(pool.get(bi).cursor(), 0);
        assert_eq!(node.flow_count(), 0);
        assert!(node.table().is_empty());
        assert_eq!(node.stats().snapshot().skipped, 1);
    }

    #[test]
    fn scenario_tcp_admission_and_rewrite() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();
        let pkt = ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &[]));
        let bi = run_one(&mut node, &mut pool, 1.0, pkt);

        assert_eq!(node.flow_count(), 1);
        let flow = node.flow(0).unwrap();
        assert_eq!(flow.new_dst_ip, u32::from(Ipv4Addr::from(WEB_DST)));
        assert_eq!(flow.pkt_count, 1);
        assert_eq!(flow.kind(), ProtoKind::Tcp);
        assert_eq!(flow.init_src_ip, u32::from(Ipv4Addr::from(CLIENT)));
        assert_eq!(flow.init_src_port, 4000);

        let out = pool.get(bi).current();
        assert_eq!(&out[16..20], &WEB_DST);
        assert_eq!(&out[12..16], &CLIENT);
        assert!(ip_checksum_ok(out));
        assert!(transport_checksum_ok(out));
    }

    #[test]
    fn scenario_tcp_timestamp_rtt_sample() {
        let (mut node, rx) = node();
        let mut pool = BufferPool::new();

        // Forward data packet carrying TSval 100.
        let fwd = ip4(
            IP_PROTO_TCP,
            CLIENT,
            ORIG_DST,
            &tcp(4000, 80, 10, ACK, &ts_option(100, 0)),
        );
        run_one(&mut node, &mut pool, 5.0, fwd);

        // Reply from the rewritten destination echoes TSval 100, 50 ms later.
        let rev = ip4(
            IP_PROTO_TCP,
            WEB_DST,
            CLIENT,
            &tcp(80, 4000, 77, ACK, &ts_option(900, 100)),
        );
        let bi = run_one(&mut node, &mut pool, 5.050, rev);

        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.kind, ProtoKind::Tcp);
        assert_eq!(sample.flow_index, 0);
        assert!((sample.rtt - 0.050).abs() < 1e-9);
        assert!(rx.try_recv().is_err());

        // NAT reversibility: the reply leaves pointed at the initiator.
        let out = pool.get(bi).current();
        assert_eq!(&out[16..20], &CLIENT);
        assert!(ip_checksum_ok(out));
        assert!(transport_checksum_ok(out));
        // Both packets belong to one flow.
        assert_eq!(node.flow_count(), 1);
        assert_eq!(node.flow(0).unwrap().pkt_count, 2);
    }

    #[test]
    fn scenario_quic_short_header_spin() {
        let (mut node, rx) = node();
        let mut pool = BufferPool::new();

        let fwd = |pn, spin| {
            ip4(
                IP_PROTO_UDP,
                CLIENT,
                ORIG_DST,
                &udp(5000, 4433, &quic_short(pn, spin)),
            )
        };
        let rev = |pn, spin| {
            ip4(
                IP_PROTO_UDP,
                QUIC_DST,
                CLIENT,
                &udp(4433, 5000, &quic_short(pn, spin)),
            )
        };

        run_one(&mut node, &mut pool, 1.0, fwd(1, 0));
        assert_eq!(node.flow_count(), 1);
        run_one(&mut node, &mut pool, 1.1, rev(1, 1));
        // Reply matched the existing flow via the reverse key.
        assert_eq!(node.flow_count(), 1);
        run_one(&mut node, &mut pool, 1.25, fwd(2, 1));

        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.kind, ProtoKind::Quic);
        assert!((sample.rtt - 0.15).abs() < 1e-9);
        assert!((sample.arrival - 1.25).abs() < 1e-9);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn scenario_plus_hop_count_and_reverse_match() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();
        let cat = 0xDEAD_BEEF_u64;

        let fwd = ip4(
            IP_PROTO_UDP,
            CLIENT,
            ORIG_DST,
            &udp(9000, 80, &plus(PLUS_EXTENDED, 10, 0, cat, &[1, 0, 3])),
        );
        let bi = run_one(&mut node, &mut pool, 1.0, fwd);

        // Hop count bumped in place.
        let out = pool.get(bi).current();
        let ext_at = SIZE_IP4 + SIZE_UDP + SIZE_PLUS;
        assert_eq!(out[ext_at + 2], 4);
        assert_eq!(node.flow_count(), 1);
        assert_eq!(node.flow(0).unwrap().kind(), ProtoKind::Plus);

        // Reverse packet with the same CAT resolves to the same flow.
        let rev = ip4(
            IP_PROTO_UDP,
            WEB_DST,
            CLIENT,
            &udp(80, 9000, &plus(0, 1, 10, cat, &[])),
        );
        run_one(&mut node, &mut pool, 1.1, rev);
        assert_eq!(node.flow_count(), 1);
        assert_eq!(node.flow(0).unwrap().pkt_count, 2);

        // A different CAT is a different association.
        let other = ip4(
            IP_PROTO_UDP,
            CLIENT,
            ORIG_DST,
            &udp(9000, 80, &plus(0, 1, 0, cat + 1, &[])),
        );
        run_one(&mut node, &mut pool, 1.2, other);
        assert_eq!(node.flow_count(), 2);
    }

    #[test]
    fn scenario_plus_rtt_from_pse_echo() {
        let (mut node, rx) = node();
        let mut pool = BufferPool::new();
        let cat = 7u64;

        let fwd = ip4(
            IP_PROTO_UDP,
            CLIENT,
            ORIG_DST,
            &udp(9000, 80, &plus(0, 42, 0, cat, &[])),
        );
        run_one(&mut node, &mut pool, 2.0, fwd);

        let rev = ip4(
            IP_PROTO_UDP,
            WEB_DST,
            CLIENT,
            &udp(80, 9000, &plus(0, 900, 42, cat, &[])),
        );
        run_one(&mut node, &mut pool, 2.030, rev);

        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.kind, ProtoKind::Plus);
        assert!((sample.rtt - 0.030).abs() < 1e-9);
    }

    #[test]
    fn scenario_idle_expiry_and_index_reuse() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();

        let first = ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &[]));
        run_one(&mut node, &mut pool, 0.0, first);
        assert_eq!(node.flow_count(), 1);
        let key = make_key(
            u32::from(Ipv4Addr::from(CLIENT)),
            u32::from(Ipv4Addr::from(ORIG_DST)),
            4000,
            80,
            IP_PROTO_TCP,
        );
        assert_eq!(node.table().lookup(&key), Some(0));

        // 31 seconds later a packet on an unrelated flow advances the wheel.
        let other = ip4(IP_PROTO_TCP, [2, 2, 2, 2], ORIG_DST, &tcp(5000, 80, 1, SYN, &[]));
        run_one(&mut node, &mut pool, 31.0, other);

        // The idle flow is gone and its index was reused by the new one.
        assert_eq!(node.table().lookup(&key), None);
        assert_eq!(node.flow_count(), 1);
        assert_eq!(node.stats().snapshot().flows_expired, 1);
        let flow = node.flow(0).unwrap();
        assert_eq!(flow.init_src_ip, u32::from(Ipv4Addr::new(2, 2, 2, 2)));
    }

    #[test]
    fn refresh_prevents_expiry() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();

        let pkt = |seq| ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, seq, ACK, &[]));
        run_one(&mut node, &mut pool, 0.0, pkt(1));
        run_one(&mut node, &mut pool, 20.0, pkt(2));
        // 45 s after admission but only 25 s after the refresh.
        run_one(&mut node, &mut pool, 45.0, pkt(3));
        assert_eq!(node.flow_count(), 1);
        assert_eq!(node.flow(0).unwrap().pkt_count, 3);
        assert_eq!(node.stats().snapshot().flows_expired, 0);
    }

    #[test]
    fn both_keys_resolve_to_flow() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();
        let pkt = ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &[]));
        run_one(&mut node, &mut pool, 1.0, pkt);

        let flow = node.flow(0).unwrap();
        assert_eq!(node.table().get(&flow.key), Some(0));
        assert_eq!(node.table().get(&flow.key_reverse), Some(0));
        assert_eq!(node.table().len(), 2);
    }

    #[test]
    fn frame_preserves_count_and_order() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();

        let frame: Vec<u32> = vec![
            ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &[])),
            vec![0x60, 0, 0, 0], // IPv6-looking runt
            ip4(IP_PROTO_UDP, CLIENT, ORIG_DST, &udp(5000, 4433, &quic_short(1, 0))),
            ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4001, 22, 1, SYN, &[])),
            Vec::new(), // empty buffer
        ]
        .into_iter()
        .map(|p| pool.alloc(p))
        .collect();

        let mut sink = Vec::new();
        node.process_frame(2.0, &mut pool, &frame, &mut sink);
        assert_eq!(sink, frame);
        for &bi in &frame {
            assert_eq!(pool.get(bi).cursor(), 0);
        }
        assert_eq!(node.stats().snapshot().packets, 5);
    }

    #[test]
    fn malformed_packets_forwarded_without_flow_state() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();

        let cases = vec![
            // IPv6 version nibble.
            {
                let mut p = ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &[]));
                p[0] = 0x65;
                p
            },
            // IPv4 options (IHL 6).
            {
                let mut p = ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &[]));
                p[0] = 0x46;
                p
            },
            // Unsupported transport.
            ip4(1, CLIENT, ORIG_DST, &[0u8; 8]),
            // Truncated TCP.
            ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &[0u8; 12]),
            // Malformed TCP options: data offset past the segment.
            ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &{
                let mut t = tcp(4000, 80, 1, ACK, &[]);
                t[12] = 8 << 4;
                t
            }),
            // QUIC with an unknown packet-number encoding.
            ip4(
                IP_PROTO_UDP,
                CLIENT,
                ORIG_DST,
                &udp(5000, 4433, &[0x04, 0, 0, 0]),
            ),
            // UDP on a non-QUIC port that is not PLUS.
            ip4(IP_PROTO_UDP, CLIENT, ORIG_DST, &udp(5000, 80, &[0u8; 20])),
            // PLUS truncated below the base header.
            ip4(
                IP_PROTO_UDP,
                CLIENT,
                ORIG_DST,
                &udp(9000, 80, &plus(0, 1, 0, 1, &[])[..10].to_vec()),
            ),
        ];

        for pkt in cases {
            let before = pkt.clone();
            let bi = run_one(&mut node, &mut pool, 1.0, pkt);
            assert_eq!(pool.get(bi).current(), &before[..], "packet mutated");
        }
        assert_eq!(node.flow_count(), 0);
        assert!(node.table().is_empty());
    }

    #[test]
    fn syn_ack_excluded_from_measurement() {
        let (mut node, rx) = node();
        let mut pool = BufferPool::new();

        run_one(
            &mut node,
            &mut pool,
            1.0,
            ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &ts_option(50, 0))),
        );
        // SYN+ACK from the rewritten destination echoes TSval 50; it still
        // counts against the flow but produces no sample.
        run_one(
            &mut node,
            &mut pool,
            1.040,
            ip4(
                IP_PROTO_TCP,
                WEB_DST,
                CLIENT,
                &tcp(80, 4000, 1, SYN | ACK, &ts_option(800, 50)),
            ),
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(node.flow(0).unwrap().pkt_count, 2);
    }

    #[test]
    fn trace_record_attached_when_flagged() {
        let (tx, _rx) = unbounded();
        let config = LatencyConfig {
            rewrites: vec![DstRewrite {
                port: 80,
                new_dst: Ipv4Addr::from(WEB_DST),
            }],
            trace: true,
            ..Default::default()
        };
        let mut node = LatencyNode::new(config, tx).unwrap();
        let mut pool = BufferPool::new();

        let bi = pool.alloc(ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4000, 80, 1, SYN, &[])));
        pool.get_mut(bi).flags |= IS_TRACED;
        let unflagged = pool.alloc(ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(4001, 80, 1, SYN, &[])));

        let mut sink = Vec::new();
        node.process_frame(1.0, &mut pool, &[bi, unflagged], &mut sink);

        let trace = pool.get(bi).trace.unwrap();
        assert_eq!(trace.src_port, 4000);
        assert_eq!(trace.dst_port, 80);
        assert_eq!(trace.new_src_ip, u32::from(Ipv4Addr::from(CLIENT)));
        assert_eq!(trace.new_dst_ip, u32::from(Ipv4Addr::from(WEB_DST)));
        assert_eq!(trace.kind, ProtoKind::Tcp);
        assert_eq!(trace.pkt_count, 1);
        assert!(trace.to_string().starts_with("LATENCY packet: type: TCP\n"));

        assert!(pool.get(unflagged).trace.is_none());
    }

    #[test]
    fn quic_long_header_records_connection_id() {
        let (mut node, _rx) = node();
        let mut pool = BufferPool::new();

        let mut q = vec![0x80u8];
        q.extend_from_slice(&0xAABB_u64.to_be_bytes());
        q.extend_from_slice(&1u32.to_be_bytes());
        q.extend_from_slice(&5u32.to_be_bytes()); // version
        q.push(0); // spin
        let pkt = ip4(IP_PROTO_UDP, CLIENT, ORIG_DST, &udp(5000, 4433, &q));
        run_one(&mut node, &mut pool, 1.0, pkt);

        match node.flow(0).unwrap().estimator {
            Estimator::Quic(est) => assert_eq!(est.conn_id(), Some(0xAABB)),
            _ => panic!("expected a QUIC flow"),
        }
    }

    proptest! {
        /// Arbitrary bytes are always forwarded with the cursor restored.
        #[test]
        fn forwards_arbitrary_bytes(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let (mut node, _rx) = node();
            let mut pool = BufferPool::new();
            let bi = pool.alloc(data);
            let mut sink = Vec::new();
            node.process_frame(1.0, &mut pool, &[bi], &mut sink);
            prop_assert_eq!(sink, vec![bi]);
            prop_assert_eq!(pool.get(bi).cursor(), 0);
        }

        /// Rewritten TCP packets re-verify both checksums.
        #[test]
        fn rewrite_keeps_checksums_valid(sport in 1u16..u16::MAX, seq in any::<u32>()) {
            let (mut node, _rx) = node();
            let mut pool = BufferPool::new();
            let pkt = ip4(IP_PROTO_TCP, CLIENT, ORIG_DST, &tcp(sport, 80, seq, ACK, &[]));
            let bi = run_one(&mut node, &mut pool, 1.0, pkt);
            let out = pool.get(bi).current();
            prop_assert!(ip_checksum_ok(out));
            prop_assert!(transport_checksum_ok(out));
        }
    }
}
