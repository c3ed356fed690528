//! Time and interrupt collaborators: the virtual clock, the interrupt
//! controller, and the lines they raise on the processor.

use std::collections::VecDeque;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Asynchronous request lines sampled at instruction boundaries.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InterruptLines: u32 {
        const HARDWARE_INTERRUPT = 1 << 0;
        const RESET_REQUEST = 1 << 1;
    }
}

/// Advances virtual time. Called once per retired instruction and once per
/// halt-loop iteration; returns the lines raised by devices during the tick.
pub trait Clock {
    fn time_passes(&mut self, divisor: u32) -> InterruptLines;
}

/// Supplies the vector of the highest-priority pending hardware interrupt.
/// Called exactly once per delivery.
pub trait InterruptController {
    fn cpu_get_interrupt(&mut self) -> u8;
}

/// How a halt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltOutcome {
    /// A hardware interrupt or reset request became pending.
    Interrupted,
    /// The embedder asked the loop to stop.
    Aborted,
}

/// Tick counter with scheduled line assertions.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    ticks: u64,
    scheduled: Vec<(u64, InterruptLines)>,
}

impl VirtualClock {
    pub fn new() -> Self { Self::default() }
    pub fn ticks(&self) -> u64 { self.ticks }

    /// Raise `lines` once the tick count reaches `at`.
    pub fn schedule(&mut self, at: u64, lines: InterruptLines) { self.scheduled.push((at, lines)); }
}

impl Clock for VirtualClock {
    fn time_passes(&mut self, divisor: u32) -> InterruptLines {
        self.ticks = self.ticks.saturating_add(divisor.max(1) as u64);
        let now = self.ticks;
        let mut raised = InterruptLines::empty();
        self.scheduled.retain(|&(at, lines)| {
            if at <= now {
                raised |= lines;
                false
            } else {
                true
            }
        });
        raised
    }
}

/// FIFO of pending vectors standing in for a PIC.
#[derive(Debug, Clone)]
pub struct QueuedInterrupts {
    pending: VecDeque<u8>,
    spurious: u8,
    acknowledged: u32,
}

impl QueuedInterrupts {
    /// `spurious` is returned when asked for a vector with none queued.
    pub fn new(spurious: u8) -> Self { Self { pending: VecDeque::new(), spurious, acknowledged: 0 } }
    pub fn raise(&mut self, vector: u8) { self.pending.push_back(vector); }
    pub fn acknowledged(&self) -> u32 { self.acknowledged }
}

impl InterruptController for QueuedInterrupts {
    fn cpu_get_interrupt(&mut self) -> u8 {
        self.acknowledged += 1;
        self.pending.pop_front().unwrap_or(self.spurious)
    }
}
