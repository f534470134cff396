//! Hashed timer wheel for idle-flow expiry.
//!
//! Deadlines are kept in 100-ms ticks. Updating a flow's timer pushes a new
//! wheel entry and supersedes the old one; superseded entries are dropped
//! lazily when their slot is visited. The wheel only advances when the
//! driver polls it, so expiry is coupled to packet arrival.

use std::collections::HashMap;

/// Default per-flow idle timeout in ticks (30 s at the 100-ms tick).
pub const TIMEOUT_TICKS: u32 = 300;

/// PLUS draft timeout while unassociated (10 s). Reserved for the PLUS
/// state machine; nothing reads it yet.
pub const TO_IDLE: u32 = 100;
/// PLUS draft timeout once associated (3 s). Reserved, unused.
pub const TO_ASSOCIATED: u32 = 30;
/// PLUS draft timeout after a stop signal (2 s). Reserved, unused.
pub const TO_STOP: u32 = 20;

const WHEEL_SLOTS: usize = 512;

/// A flow's position in the wheel: its current deadline tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerHandle {
    /// Absolute deadline in ticks.
    pub deadline: u64,
}

#[derive(Debug, Clone, Copy)]
struct WheelEntry {
    flow: u32,
    deadline: u64,
}

/// Hashed timer wheel keyed by tick.
pub struct TimerWheel {
    tick: f64,
    slots: Vec<Vec<WheelEntry>>,
    /// Authoritative deadline per armed flow; wheel entries not matching it
    /// are stale.
    deadlines: HashMap<u32, u64>,
    cur_tick: Option<u64>,
}

impl TimerWheel {
    /// New wheel with the given tick size in seconds.
    pub fn new(tick: f64) -> Self {
        Self {
            tick,
            slots: vec![Vec::new(); WHEEL_SLOTS],
            deadlines: HashMap::new(),
            cur_tick: None,
        }
    }

    #[inline(always)]
    fn to_tick(&self, clock: f64) -> u64 {
        (clock / self.tick) as u64
    }

    fn arm(&mut self, flow: u32, deadline: u64) -> TimerHandle {
        self.deadlines.insert(flow, deadline);
        self.slots[(deadline % WHEEL_SLOTS as u64) as usize].push(WheelEntry { flow, deadline });
        TimerHandle { deadline }
    }

    /// Arm a flow's timer `ticks` from `clock`.
    pub fn start(&mut self, flow: u32, clock: f64, ticks: u32) -> TimerHandle {
        let now = self.to_tick(clock);
        self.cur_tick.get_or_insert(now);
        self.arm(flow, now + ticks as u64)
    }

    /// Push a flow's deadline out to `ticks` from `clock`.
    pub fn update(&mut self, flow: u32, clock: f64, ticks: u32) -> TimerHandle {
        self.start(flow, clock, ticks)
    }

    /// Disarm a flow (its wheel entries become stale).
    pub fn cancel(&mut self, flow: u32) {
        self.deadlines.remove(&flow);
    }

    /// Number of armed flows.
    pub fn armed(&self) -> usize {
        self.deadlines.len()
    }

    /// Advance the wheel to `clock`, collecting flows whose deadline has
    /// passed into `expired`.
    pub fn expire_now(&mut self, clock: f64, expired: &mut Vec<u32>) {
        let now = self.to_tick(clock);
        let cur = *self.cur_tick.get_or_insert(now);
        if now <= cur {
            return;
        }

        // A gap longer than one revolution means every slot is due a visit.
        let visit = (now - cur).min(WHEEL_SLOTS as u64);
        let deadlines = &mut self.deadlines;
        for i in 1..=visit {
            let slot = ((cur + i) % WHEEL_SLOTS as u64) as usize;
            self.slots[slot].retain(|e| {
                if e.deadline > now {
                    return true;
                }
                if deadlines.get(&e.flow) == Some(&e.deadline) {
                    deadlines.remove(&e.flow);
                    expired.push(e.flow);
                }
                false
            });
        }
        self.cur_tick = Some(now);
    }
}
