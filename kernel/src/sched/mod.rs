//! Scheduler: thread control blocks and a round-robin-per-priority
//! dispatcher driven by the timer ISR.

pub mod scheduler;
pub mod tcb;

pub use scheduler::{
    block, create_thread, current_domain, current_thread, schedule, sleep, stats, terminate_thread,
    thread_domain, thread_state, unblock, yield_now, SchedStats,
};
pub use tcb::{Priority, ThreadId, ThreadState};

pub fn init() {
    scheduler::init();
}
