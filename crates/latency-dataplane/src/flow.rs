//! Flow keys, the concurrent flow table, and the flow record store.
//!
//! A flow is keyed by its direction-normalised 5-tuple (plus the CAT for
//! PLUS). At admission both the forward key and a reverse key are registered
//! to the same record; the reverse key keeps the forward packet's ports
//! unchanged and wildcards the source IP to zero, so replies match
//! regardless of the pre-NAT source address.

use crate::estimator::Estimator;
use crate::timer::TimerHandle;
use dashmap::DashMap;
use latency_common::ProtoKind;

/// Direction-normalised flow key.
///
/// Two keys are equal iff they denote the same directional tuple. `cat` is
/// zero for TCP and QUIC flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source address (0 in registered reverse keys).
    pub src_ip: u32,
    /// Destination address.
    pub dst_ip: u32,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// IP protocol number.
    pub proto: u8,
    /// PLUS connection-association token, zero otherwise.
    pub cat: u64,
}

/// Key constructor for TCP and QUIC flows.
#[inline(always)]
pub fn make_key(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16, proto: u8) -> FlowKey {
    FlowKey {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        proto,
        cat: 0,
    }
}

/// Key constructor for PLUS flows; mixes in the CAT.
#[inline(always)]
pub fn make_plus_key(
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    proto: u8,
    cat: u64,
) -> FlowKey {
    FlowKey {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        proto,
        cat,
    }
}

impl FlowKey {
    /// The reverse key registered at admission: ports unchanged, source IP
    /// wildcarded, destination replaced by the rewrite target.
    #[inline(always)]
    pub fn reverse(&self, new_dst_ip: u32) -> FlowKey {
        FlowKey {
            src_ip: 0,
            dst_ip: new_dst_ip,
            ..*self
        }
    }

    /// Re-orient a packet key as the registered reverse key it would match:
    /// treat the packet's source as the rewrite target, wildcard the unknown
    /// pre-NAT source, and restore the forward port order.
    #[inline(always)]
    pub fn reverse_probe(&self) -> FlowKey {
        FlowKey {
            src_ip: 0,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
            cat: self.cat,
        }
    }
}

/// Flow lifecycle state. PLUS sub-states are reserved for a future state
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Flow is live; its timer refreshes on every processed packet.
    Active,
    /// A parser flagged the flow; timer no longer refreshes.
    Error,
}

/// Per-flow record.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Dense identifier, stable for the flow's lifetime.
    pub index: u32,
    /// Forward key as registered in the table.
    pub key: FlowKey,
    /// Reverse key as registered in the table.
    pub key_reverse: FlowKey,
    /// Address of the endpoint that sent the first observed packet.
    pub init_src_ip: u32,
    /// Port of the endpoint that sent the first observed packet.
    pub init_src_port: u16,
    /// Rewrite destination chosen at admission.
    pub new_dst_ip: u32,
    /// Packets observed on this flow, starting at 1.
    pub pkt_count: u32,
    /// Lifecycle state.
    pub state: FlowState,
    /// Protocol-tagged estimator state.
    pub estimator: Estimator,
    /// Handle into the timer wheel.
    pub timer: TimerHandle,
}

impl Flow {
    /// Protocol kind decided at admission.
    #[inline(always)]
    pub fn kind(&self) -> ProtoKind {
        self.estimator.kind()
    }
}

/// Concurrent map from flow key to flow index.
///
/// Both the forward and the reverse key of every live flow resolve to its
/// index.
pub struct FlowTable {
    map: DashMap<FlowKey, u32>,
}

impl FlowTable {
    /// New empty table.
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Exact-key lookup.
    #[inline(always)]
    pub fn get(&self, key: &FlowKey) -> Option<u32> {
        self.map.get(key).map(|e| *e)
    }

    /// Packet lookup: the exact forward-orientation key first, then the
    /// reverse-normalised probe for replies from the post-NAT destination.
    #[inline]
    pub fn lookup(&self, key: &FlowKey) -> Option<u32> {
        self.get(key).or_else(|| self.get(&key.reverse_probe()))
    }

    /// Register a key for a flow index.
    pub fn insert(&self, key: FlowKey, index: u32) {
        self.map.insert(key, index);
    }

    /// Remove a key registration.
    pub fn remove(&self, key: &FlowKey) -> bool {
        self.map.remove(key).is_some()
    }

    /// Registered key count (two per live flow).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense pool of flow records with free-list index reuse.
pub struct FlowStore {
    slots: Vec<Option<Flow>>,
    free_list: Vec<u32>,
}

impl FlowStore {
    /// New empty store.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Create a flow record; returns its stable index.
    pub fn create(
        &mut self,
        key: FlowKey,
        key_reverse: FlowKey,
        init_src_ip: u32,
        init_src_port: u16,
        new_dst_ip: u32,
        estimator: Estimator,
    ) -> u32 {
        let index = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[index as usize] = Some(Flow {
            index,
            key,
            key_reverse,
            init_src_ip,
            init_src_port,
            new_dst_ip,
            pkt_count: 1,
            state: FlowState::Active,
            estimator,
            timer: TimerHandle::default(),
        });
        index
    }

    /// Borrow a flow record.
    #[inline(always)]
    pub fn get(&self, index: u32) -> Option<&Flow> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    /// Borrow a flow record mutably.
    #[inline(always)]
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Flow> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    /// Destroy a flow record, releasing its index for reuse.
    pub fn destroy(&mut self, index: u32) -> Option<Flow> {
        let flow = self.slots.get_mut(index as usize).and_then(|s| s.take());
        if flow.is_some() {
            self.free_list.push(index);
        }
        flow
    }

    /// Live flow count.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Whether no flows are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new()
    }
}
