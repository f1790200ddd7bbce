//! Round-robin-per-priority scheduler.
//!
//! TCBs live in a flat `Vec` at stable slot indices; a terminated thread's
//! stack is freed immediately but its slot stays resident (skipped during
//! scans) so in-flight references to its `ThreadId` never dangle into a
//! reused slot. The scheduling decision (`tick`/`pick_next`) is kept separate
//! from the actual register-context switch, mirroring the call-gate split in
//! `isolation::callgate`: the decision is pure and host-testable, the switch
//! itself is `unsafe` architecture code that only runs on bare metal.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::arch::x86_64::context::X86_64Context;
use crate::cap::DomainId;
use crate::error::SchedError;
use crate::mm::pmm::{self, FrameType};

use super::tcb::{Priority, Tcb, ThreadId, ThreadState};

const STACK_SIZE: u64 = 64 * 1024;

pub struct Scheduler {
    threads: Vec<Tcb>,
    current: usize,
    next_id: ThreadId,
    ticks: u64,
    dispatches: u64,
    voluntary_switches: u64,
    involuntary_switches: u64,
    sleeping: BTreeMap<ThreadId, u64>,
}

/// Outcome of a single `tick`: the scheduler either keeps running the same
/// thread or hands off to a different one, identified by slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue(usize),
    SwitchTo { from: usize, to: usize },
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            threads: Vec::new(),
            current: 0,
            next_id: 0,
            ticks: 0,
            dispatches: 0,
            voluntary_switches: 0,
            involuntary_switches: 0,
            sleeping: BTreeMap::new(),
        }
    }

    /// Create the permanent idle thread. Called once, before any other
    /// thread exists, so slot 0 is always the idle thread.
    pub fn init_idle(&mut self, domain: DomainId, entry: extern "C" fn(u64) -> !) {
        let stack_top = pmm::alloc(STACK_SIZE, 4096, FrameType::Kernel, domain).as_u64() + STACK_SIZE;
        let tcb = Tcb::new(
            self.next_id,
            domain,
            Priority::Idle,
            stack_top - STACK_SIZE,
            STACK_SIZE,
            entry as u64,
            0,
            X86_64Context::new(stack_top, entry, 0),
        );
        self.next_id += 1;
        self.threads.push(tcb);
        self.threads[0].state = ThreadState::Running;
    }

    pub fn create_thread(
        &mut self,
        domain: DomainId,
        entry: extern "C" fn(u64) -> !,
        arg: u64,
        priority: Priority,
    ) -> Result<ThreadId, SchedError> {
        let base = pmm::alloc(STACK_SIZE, 4096, FrameType::Kernel, domain);
        if base.as_u64() == 0 {
            return Err(SchedError::StackAllocationFailed);
        }
        let stack_top = base.as_u64() + STACK_SIZE;
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).ok_or(SchedError::ThreadTableFull)?;
        let tcb = Tcb::new(
            id,
            domain,
            priority,
            base.as_u64(),
            STACK_SIZE,
            entry as u64,
            arg,
            X86_64Context::new(stack_top, entry, arg),
        );
        self.threads.push(tcb);
        Ok(id)
    }

    fn slot_of(&self, id: ThreadId) -> Option<usize> {
        self.threads.iter().position(|t| t.thread_id == id)
    }

    pub fn terminate_thread(&mut self, id: ThreadId) -> Result<(), SchedError> {
        let slot = self.slot_of(id).ok_or(SchedError::UnknownThread)?;
        let tcb = &mut self.threads[slot];
        if tcb.state != ThreadState::Terminated {
            let _ = pmm::free(crate::mm::PhysAddr::new(tcb.stack_base));
            tcb.state = ThreadState::Terminated;
        }
        Ok(())
    }

    pub fn block(&mut self, id: ThreadId) -> Result<(), SchedError> {
        let slot = self.slot_of(id).ok_or(SchedError::UnknownThread)?;
        self.threads[slot].state = ThreadState::Blocked;
        Ok(())
    }

    pub fn unblock(&mut self, id: ThreadId) -> Result<(), SchedError> {
        let slot = self.slot_of(id).ok_or(SchedError::UnknownThread)?;
        let tcb = &mut self.threads[slot];
        if tcb.state == ThreadState::Blocked {
            tcb.state = ThreadState::Ready;
            tcb.time_slice = tcb.priority.time_slice();
        }
        self.sleeping.remove(&id);
        Ok(())
    }

    /// Block the current thread and register it to wake at `self.ticks +
    /// ticks_from_now`. Driven entirely by `tick`, never a busy loop.
    pub fn sleep_current(&mut self, ticks_from_now: u64) -> ThreadId {
        let id = self.threads[self.current].thread_id;
        self.threads[self.current].state = ThreadState::Blocked;
        self.sleeping.insert(id, self.ticks + ticks_from_now);
        id
    }

    fn wake_sleepers(&mut self) {
        let due: Vec<ThreadId> = self
            .sleeping
            .iter()
            .filter(|&(_, &wake)| wake <= self.ticks)
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            self.sleeping.remove(&id);
            if let Some(slot) = self.slot_of(id) {
                let tcb = &mut self.threads[slot];
                if tcb.state == ThreadState::Blocked {
                    tcb.state = ThreadState::Ready;
                    tcb.time_slice = tcb.priority.time_slice();
                }
            }
        }
    }

    /// Round-robin scan for the highest-priority `Ready` thread, starting
    /// just after `start` and wrapping around; ties broken by ascending slot.
    fn highest_ready_from(&self, start: usize) -> Option<usize> {
        let n = self.threads.len();
        if n == 0 {
            return None;
        }
        let mut best: Option<usize> = None;
        for offset in 1..=n {
            let slot = (start + offset) % n;
            if self.threads[slot].state != ThreadState::Ready {
                continue;
            }
            best = match best {
                None => Some(slot),
                Some(b) if self.threads[slot].priority > self.threads[b].priority => Some(slot),
                Some(b) => Some(b),
            };
        }
        best
    }

    /// Called once per timer tick. Advances the tick counter, wakes any
    /// sleepers due, decrements the running thread's time slice, and decides
    /// whether a switch is needed: either the slice expired or a strictly
    /// higher-priority thread is `Ready`.
    pub fn tick(&mut self) -> Dispatch {
        self.ticks += 1;
        self.wake_sleepers();

        let cur = self.current;
        if self.threads[cur].state == ThreadState::Running {
            self.threads[cur].time_slice = self.threads[cur].time_slice.saturating_sub(1);
            self.threads[cur].total_time += 1;
        }

        let higher_ready = self
            .highest_ready_from(cur)
            .filter(|&slot| self.threads[slot].priority > self.threads[cur].priority);
        let slice_expired = self.threads[cur].state == ThreadState::Running
            && self.threads[cur].time_slice == 0;
        let current_unrunnable = self.threads[cur].state != ThreadState::Running;

        if higher_ready.is_none() && !slice_expired && !current_unrunnable {
            self.dispatches += 1;
            return Dispatch::Continue(cur);
        }

        let next = higher_ready
            .or_else(|| self.highest_ready_from(cur))
            .unwrap_or(0); // slot 0 is the idle thread, always Ready-or-Running

        if next == cur {
            self.threads[cur].time_slice = self.threads[cur].priority.time_slice();
            self.dispatches += 1;
            return Dispatch::Continue(cur);
        }

        if self.threads[cur].state == ThreadState::Running {
            self.threads[cur].state = ThreadState::Ready;
            self.involuntary_switches += 1;
        }
        self.threads[next].state = ThreadState::Running;
        self.threads[next].time_slice = self.threads[next].priority.time_slice();
        self.current = next;
        self.dispatches += 1;
        Dispatch::SwitchTo { from: cur, to: next }
    }

    /// Voluntary re-entry: give up the remainder of the current slice and
    /// pick the next `Ready` thread immediately, if any is waiting.
    pub fn yield_now(&mut self) -> Dispatch {
        let cur = self.current;
        let next = self.highest_ready_from(cur).unwrap_or(cur);
        if next == cur {
            return Dispatch::Continue(cur);
        }
        self.threads[cur].state = ThreadState::Ready;
        self.threads[next].state = ThreadState::Running;
        self.threads[next].time_slice = self.threads[next].priority.time_slice();
        self.current = next;
        self.voluntary_switches += 1;
        self.dispatches += 1;
        Dispatch::SwitchTo { from: cur, to: next }
    }

    pub fn current_thread(&self) -> ThreadId {
        self.threads[self.current].thread_id
    }

    pub fn current_domain(&self) -> DomainId {
        self.threads[self.current].domain_id
    }

    pub fn thread_domain(&self, id: ThreadId) -> Option<DomainId> {
        self.slot_of(id).map(|s| self.threads[s].domain_id)
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.slot_of(id).map(|s| self.threads[s].state)
    }

    pub fn context_ptr(&mut self, slot: usize) -> *mut X86_64Context {
        &mut self.threads[slot].context as *mut _
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            ticks: self.ticks,
            dispatches: self.dispatches,
            voluntary_switches: self.voluntary_switches,
            involuntary_switches: self.involuntary_switches,
            thread_count: self.threads.len(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedStats {
    pub ticks: u64,
    pub dispatches: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    pub thread_count: usize,
}

use spin::Mutex;

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

extern "C" fn idle_loop(_: u64) -> ! {
    loop {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Bring up the scheduler: create the idle thread in the kernel domain.
/// Called once from `kernel_init`, after capabilities and isolation exist.
pub fn init() {
    let kernel_domain = crate::cap::kernel_domain();
    SCHEDULER.lock().init_idle(kernel_domain, idle_loop);
    log::info!("sched: idle thread created");
}

pub fn create_thread(
    domain: DomainId,
    entry: extern "C" fn(u64) -> !,
    arg: u64,
    priority: Priority,
) -> Result<ThreadId, SchedError> {
    SCHEDULER.lock().create_thread(domain, entry, arg, priority)
}

pub fn terminate_thread(id: ThreadId) -> Result<(), SchedError> {
    SCHEDULER.lock().terminate_thread(id)
}

pub fn block(id: ThreadId) -> Result<(), SchedError> {
    SCHEDULER.lock().block(id)
}

pub fn unblock(id: ThreadId) -> Result<(), SchedError> {
    SCHEDULER.lock().unblock(id)
}

pub fn current_thread() -> ThreadId {
    SCHEDULER.lock().current_thread()
}

pub fn current_domain() -> DomainId {
    SCHEDULER.lock().current_domain()
}

pub fn thread_domain(id: ThreadId) -> Option<DomainId> {
    SCHEDULER.lock().thread_domain(id)
}

pub fn thread_state(id: ThreadId) -> Option<ThreadState> {
    SCHEDULER.lock().thread_state(id)
}

pub fn stats() -> SchedStats {
    SCHEDULER.lock().stats()
}

/// Voluntary re-entry into the scheduler from a syscall. Performs the actual
/// register-context switch on bare metal; on the host test target there is
/// no architectural context to switch, so it only updates TCB bookkeeping.
pub fn yield_now() {
    let outcome = SCHEDULER.lock().yield_now();
    perform_switch(outcome);
}

/// Block the current thread for `ticks_from_now` timer ticks, then
/// voluntarily re-enter the scheduler.
pub fn sleep(ticks_from_now: u64) {
    SCHEDULER.lock().sleep_current(ticks_from_now);
    yield_now();
}

/// Timer-ISR entry point: advance one tick and switch if the scheduler
/// decided to.
pub fn schedule() {
    let outcome = SCHEDULER.lock().tick();
    perform_switch(outcome);
}

fn perform_switch(outcome: Dispatch) {
    let (from, to) = match outcome {
        Dispatch::SwitchTo { from, to } => (from, to),
        Dispatch::Continue(_) => return,
    };
    #[cfg(target_os = "none")]
    {
        let mut sched = SCHEDULER.lock();
        let prev_ctx = sched.context_ptr(from);
        let next_ctx = sched.context_ptr(to) as *const X86_64Context;
        // Safety: single-processor core, both slots are live TCBs belonging
        // to threads that are not running elsewhere; `sched`'s lock is held
        // only up to here and dropped before the switch so the thread we
        // switch into can itself take the scheduler lock once resumed.
        drop(sched);
        unsafe { crate::arch::x86_64::context::switch_to(prev_ctx, next_ctx) };
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy(_: u64) -> ! {
        loop {}
    }

    fn new_with_idle() -> Scheduler {
        let mut s = Scheduler::new();
        s.init_idle(0, dummy);
        s
    }

    #[test]
    fn round_robin_sequence_e2e5() {
        let mut s = new_with_idle();
        let t1 = s.create_thread(0, dummy, 0, Priority::Normal).unwrap();
        let t2 = s.create_thread(0, dummy, 0, Priority::Normal).unwrap();
        let t3 = s.create_thread(0, dummy, 0, Priority::Normal).unwrap();

        // First tick from the idle thread hands off to T1.
        let d = s.tick();
        assert!(matches!(d, Dispatch::SwitchTo { to, .. } if s.threads[to].thread_id == t1));

        let mut running_sequence = Vec::new();
        running_sequence.push(s.current_thread());
        for _ in 0..29 {
            s.tick();
            running_sequence.push(s.current_thread());
        }

        let t1_count = running_sequence.iter().filter(|&&id| id == t1).count();
        let t2_count = running_sequence.iter().filter(|&&id| id == t2).count();
        let t3_count = running_sequence.iter().filter(|&&id| id == t3).count();
        assert_eq!(t1_count, 10);
        assert_eq!(t2_count, 10);
        assert_eq!(t3_count, 10);
        assert_eq!(running_sequence[0..10].iter().all(|&id| id == t1), true);
        assert_eq!(running_sequence[10..20].iter().all(|&id| id == t2), true);
        assert_eq!(running_sequence[20..30].iter().all(|&id| id == t3), true);
    }

    #[test]
    fn higher_priority_preempts_e9() {
        let mut s = new_with_idle();
        let low = s.create_thread(0, dummy, 0, Priority::Normal).unwrap();
        s.tick(); // idle -> low
        assert_eq!(s.current_thread(), low);

        let high = s.create_thread(0, dummy, 0, Priority::Realtime).unwrap();
        let d = s.tick();
        match d {
            Dispatch::SwitchTo { to, .. } => assert_eq!(s.threads[to].thread_id, high),
            Dispatch::Continue(_) => panic!("expected preemption by higher priority thread"),
        }
    }

    #[test]
    fn scheduler_progress_e8() {
        let mut s = new_with_idle();
        let ids: Vec<ThreadId> = (0..3)
            .map(|_| s.create_thread(0, dummy, 0, Priority::Normal).unwrap())
            .collect();
        let mut dispatched = alloc::collections::BTreeSet::new();
        for _ in 0..ids.len() {
            s.tick();
            dispatched.insert(s.current_thread());
        }
        for id in ids {
            assert!(dispatched.contains(&id));
        }
    }

    #[test]
    fn sleep_wakes_on_schedule() {
        let mut s = new_with_idle();
        let t1 = s.create_thread(0, dummy, 0, Priority::Normal).unwrap();
        s.tick();
        assert_eq!(s.current_thread(), t1);

        let slot = s.slot_of(t1).unwrap();
        s.threads[slot].state = ThreadState::Running;
        let woken = s.sleep_current(3);
        assert_eq!(woken, t1);
        assert_eq!(s.thread_state(t1), Some(ThreadState::Blocked));

        for _ in 0..3 {
            s.tick();
        }
        assert_eq!(s.thread_state(t1), Some(ThreadState::Ready));
    }

    #[test]
    fn terminate_frees_stack_and_skips_slot() {
        let mut s = new_with_idle();
        let t1 = s.create_thread(0, dummy, 0, Priority::Normal).unwrap();
        s.terminate_thread(t1).unwrap();
        assert_eq!(s.thread_state(t1), Some(ThreadState::Terminated));
        for _ in 0..5 {
            s.tick();
            assert_ne!(s.current_thread(), t1);
        }
    }
}
