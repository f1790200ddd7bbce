//! Thread control block and the small value types it's built from.

use crate::arch::x86_64::context::X86_64Context;
use crate::cap::DomainId;

pub type ThreadId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Scheduling priority. Declared lowest-to-highest so the derived `Ord`
/// directly expresses preemption order: a `Ready` thread of a strictly
/// greater variant preempts whatever is `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle,
    Low,
    Normal,
    High,
    Realtime,
}

impl Priority {
    /// Timer ticks granted before this priority's thread is preempted by
    /// another of the same priority (round-robin quantum).
    pub const fn time_slice(self) -> u32 {
        match self {
            Priority::Idle => u32::MAX,
            Priority::Low => 5,
            Priority::Normal => 10,
            Priority::High => 15,
            Priority::Realtime => 20,
        }
    }
}

#[derive(Debug)]
pub struct Tcb {
    pub thread_id: ThreadId,
    pub domain_id: DomainId,
    pub state: ThreadState,
    pub priority: Priority,
    pub stack_base: u64,
    pub stack_size: u64,
    pub entry_point: u64,
    pub arg: u64,
    pub time_slice: u32,
    pub total_time: u64,
    pub flags: u32,
    pub wake_tick: Option<u64>,
    pub context: X86_64Context,
}

impl Tcb {
    pub fn new(
        thread_id: ThreadId,
        domain_id: DomainId,
        priority: Priority,
        stack_base: u64,
        stack_size: u64,
        entry_point: u64,
        arg: u64,
        context: X86_64Context,
    ) -> Self {
        Self {
            thread_id,
            domain_id,
            state: ThreadState::Ready,
            priority,
            stack_base,
            stack_size,
            entry_point,
            arg,
            time_slice: priority.time_slice(),
            total_time: 0,
            flags: 0,
            wake_tick: None,
            context,
        }
    }
}
