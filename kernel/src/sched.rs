// Kernel Scheduler
//
// Implements a fixed-priority, round-robin scheduler with timer-based
// preemption and an explicit idle thread fallback.
//
// Key responsibilities:
// - Maintain five priority-banded ready queues (0 = most urgent)
// - Pick the next thread on every timer tick and on voluntary switches
// - Enforce strict priority across bands and round-robin within a band
// - Track sleeping threads by wake tick and reap terminated ones
// - Provide an idle thread when no runnable work exists
//
// Scheduling model:
// - Each band has its own time slice (20, 15, 10, 5, 3 ticks)
// - A tick switches threads when the slice expires or a more urgent band
//   has a ready thread; the outgoing thread goes to the tail of its band
// - Voluntary paths (yield, sleep, block, exit) switch immediately
//
// Context switching:
// - The scheduler never touches registers. It receives the interrupted
//   thread's stack pointer and returns the stack pointer to resume, which
//   the interrupt stub loads before popping the saved frame
//
// Implementation details:
// - Threads live in an id-indexed arena; queues hold ids only
// - The idle thread is never queued, it is chosen only when every band
//   is empty
// - Terminated threads are parked as zombies and their stacks are freed at
//   a later switch, once the CPU is no longer running on them
//
// Correctness and safety notes:
// - Sleepers are woken on every tick; before `enable_preemption` a tick
//   only switches away from the idle thread, never from real work
// - A thread is in at most one of: current, a ready band, the sleeping
//   list, or a primitive's wait queue
// - The kernel wrappers below hold the scheduler lock with interrupts
//   disabled and release it before raising the reschedule interrupt

#![allow(dead_code)]

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE, PRIORITY_BANDS, TIMER_FREQUENCY};
use crate::thread::{Thread, ThreadId, ThreadInfo, ThreadPriority, ThreadStack, ThreadState, ThreadStats};
use crate::{log_debug, log_info, log_warn};

const LOG_ORIGIN: &str = "sched";

pub type ThreadEntry = extern "C" fn();
pub type ExitTrampoline = extern "C" fn() -> !;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// The stack for a new thread could not be allocated.
    OutOfMemory,
    /// The requested stack cannot hold the initial frame.
    StackTooSmall,
    NoSuchThread(ThreadId),
    /// The thread is not in a state that allows the operation.
    InvalidState(ThreadId),
    /// The idle thread cannot be suspended, killed or re-prioritized.
    IdleThread,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::OutOfMemory => write!(f, "out of memory for thread stack"),
            SchedError::StackTooSmall => write!(f, "stack too small"),
            SchedError::NoSuchThread(id) => write!(f, "no thread with id {}", id),
            SchedError::InvalidState(id) => write!(f, "thread {} in wrong state", id),
            SchedError::IdleThread => write!(f, "operation not allowed on the idle thread"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    pub spawned: u64,
    pub reaped: u64,
}

pub const fn ms_to_ticks(ms: u64) -> u64 {
    (ms * TIMER_FREQUENCY as u64).div_ceil(1000)
}

pub struct Scheduler {
    threads: BTreeMap<ThreadId, Thread>,
    ready: [VecDeque<ThreadId>; PRIORITY_BANDS],
    /// Ordered by wake tick, earliest first.
    sleeping: Vec<ThreadId>,
    zombies: Vec<ThreadId>,
    current: ThreadId,
    idle: ThreadId,
    exit_trampoline: usize,
    ticks: u64,
    slice_remaining: u32,
    preemption_enabled: bool,
    next_id: u32,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Adopts the calling context as the running "kernel_main" thread and
    /// creates the idle thread.
    pub fn new(exit_trampoline: ExitTrampoline, idle_entry: ThreadEntry) -> Result<Self, SchedError> {
        let boot_id = ThreadId::from_raw(1);
        let idle_id = ThreadId::from_raw(2);

        let mut boot = Thread::new(boot_id, "kernel_main", ThreadPriority::Normal, None);
        boot.state = ThreadState::Running;

        let mut sched = Scheduler {
            threads: BTreeMap::new(),
            ready: core::array::from_fn(|_| VecDeque::new()),
            sleeping: Vec::new(),
            zombies: Vec::new(),
            current: boot_id,
            idle: idle_id,
            exit_trampoline: exit_trampoline as usize,
            ticks: 0,
            slice_remaining: ThreadPriority::Normal.time_slice(),
            preemption_enabled: false,
            next_id: 3,
            stats: SchedulerStats::default(),
        };

        let idle = sched.build_thread(idle_id, "idle", idle_entry, ThreadPriority::Idle, MIN_STACK_SIZE * 4)?;
        sched.threads.insert(boot_id, boot);
        sched.threads.insert(idle_id, idle);

        Ok(sched)
    }

    fn build_thread(
        &self,
        id: ThreadId,
        name: &str,
        entry: ThreadEntry,
        priority: ThreadPriority,
        stack_size: usize,
    ) -> Result<Thread, SchedError> {
        if stack_size < MIN_STACK_SIZE {
            return Err(SchedError::StackTooSmall);
        }

        let mut stack = ThreadStack::allocate(stack_size).ok_or(SchedError::OutOfMemory)?;
        let esp = stack
            .prepare(entry as usize, self.exit_trampoline)
            .ok_or(SchedError::StackTooSmall)?;

        let mut thread = Thread::new(id, name, priority, Some(stack));
        thread.context.esp = esp;
        Ok(thread)
    }

    pub fn spawn(
        &mut self,
        name: &str,
        entry: ThreadEntry,
        priority: ThreadPriority,
        stack_size: usize,
    ) -> Result<ThreadId, SchedError> {
        let id = ThreadId::from_raw(self.next_id);
        let thread = self.build_thread(id, name, entry, priority, stack_size)?;
        self.next_id += 1;

        self.threads.insert(id, thread);
        self.ready[priority.band()].push_back(id);
        self.stats.spawned += 1;

        log_debug!(LOG_ORIGIN, "Spawned thread {} '{}' ({:?})", id, name, priority);
        Ok(id)
    }

    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn idle_id(&self) -> ThreadId {
        self.idle
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn slice_remaining(&self) -> u32 {
        self.slice_remaining
    }

    pub fn enable_preemption(&mut self) {
        self.preemption_enabled = true;
    }

    pub fn disable_preemption(&mut self) {
        self.preemption_enabled = false;
    }

    pub fn preemption_enabled(&self) -> bool {
        self.preemption_enabled
    }

    fn state_of(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(&id).map(|t| t.state)
    }

    fn enqueue(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = ThreadState::Ready;
            if id != self.idle {
                self.ready[thread.priority.band()].push_back(id);
            }
        }
    }

    fn dequeue(&mut self, id: ThreadId) {
        for band in self.ready.iter_mut() {
            band.retain(|&queued| queued != id);
        }
        self.sleeping.retain(|&sleeper| sleeper != id);
    }

    fn highest_ready_band(&self) -> Option<usize> {
        self.ready.iter().position(|band| !band.is_empty())
    }

    fn pop_next(&mut self) -> Option<ThreadId> {
        while let Some(band) = self.highest_ready_band() {
            let id = self.ready[band].pop_front()?;
            if self.state_of(id) == Some(ThreadState::Ready) {
                return Some(id);
            }
        }
        None
    }

    fn wake_sleepers(&mut self) {
        while let Some(&id) = self.sleeping.first() {
            let due = self.threads.get(&id).map_or(true, |t| t.wake_tick <= self.ticks);
            if !due {
                break;
            }
            self.sleeping.remove(0);
            if self.state_of(id) == Some(ThreadState::Sleeping) {
                self.enqueue(id);
            }
        }
    }

    /// Timer entry point. Returns the stack pointer to resume.
    pub fn on_timer_tick(&mut self, esp: usize) -> usize {
        self.ticks += 1;
        self.stats.ticks += 1;

        let current = self.current;
        if let Some(thread) = self.threads.get_mut(&current) {
            thread.runtime_ticks += 1;
        }
        if current == self.idle {
            self.stats.idle_ticks += 1;
        }

        self.wake_sleepers();

        if !self.preemption_enabled {
            if current == self.idle && self.highest_ready_band().is_some() {
                return self.switch(esp);
            }
            return esp;
        }

        self.slice_remaining = self.slice_remaining.saturating_sub(1);

        let (state, band) = match self.threads.get(&current) {
            Some(t) => (t.state, t.priority.band()),
            None => return self.switch(esp),
        };

        if state == ThreadState::Running {
            let highest = self.highest_ready_band();

            if current == self.idle {
                if highest.is_none() {
                    return esp;
                }
            } else if !highest.is_some_and(|b| b < band) {
                if self.slice_remaining > 0 {
                    return esp;
                }
                if !highest.is_some_and(|b| b == band) {
                    // slice expired but nobody as urgent wants the CPU
                    self.slice_remaining = ThreadPriority::from_band(band)
                        .map_or(1, |p| p.time_slice());
                    return esp;
                }
            }

            self.stats.preemptions += 1;
        }

        self.switch(esp)
    }

    /// Voluntary switch: yield, sleep, block and exit all land here.
    pub fn reschedule(&mut self, esp: usize) -> usize {
        self.switch(esp)
    }

    fn switch(&mut self, esp: usize) -> usize {
        let prev = self.current;

        if let Some(thread) = self.threads.get_mut(&prev) {
            thread.context.esp = esp;
        }

        self.reap_zombies();

        match self.state_of(prev) {
            Some(ThreadState::Running) => self.enqueue(prev),
            Some(ThreadState::Terminated) => self.zombies.push(prev),
            _ => {}
        }

        let next = self.pop_next().unwrap_or(self.idle);

        let Some(thread) = self.threads.get_mut(&next) else {
            log_warn!(LOG_ORIGIN, "Thread {} vanished, resuming {}", next, prev);
            return esp;
        };

        thread.state = ThreadState::Running;
        thread.times_scheduled += 1;
        self.slice_remaining = thread.priority.time_slice();
        self.current = next;

        if next != prev {
            self.stats.context_switches += 1;
        }

        thread.context.esp
    }

    fn reap_zombies(&mut self) {
        let current = self.current;
        let mut index = 0;
        while index < self.zombies.len() {
            let id = self.zombies[index];
            if id == current {
                index += 1;
                continue;
            }

            self.zombies.swap_remove(index);
            if let Some(thread) = self.threads.remove(&id) {
                if !thread.validate_stack() {
                    log_warn!(LOG_ORIGIN, "Thread {} '{}' overflowed its stack", id, thread.name);
                }
                self.stats.reaped += 1;
                log_debug!(LOG_ORIGIN, "Reaped thread {}", id);
            }
        }
    }

    fn insert_sleeper(&mut self, id: ThreadId, wake_tick: u64) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = ThreadState::Sleeping;
            thread.wake_tick = wake_tick;
        }

        let threads = &self.threads;
        let position = self
            .sleeping
            .iter()
            .position(|other| threads.get(other).is_some_and(|t| t.wake_tick > wake_tick))
            .unwrap_or(self.sleeping.len());
        self.sleeping.insert(position, id);
    }

    /// Puts the current thread to sleep for at least one tick. The caller
    /// must reschedule afterwards.
    pub fn sleep_current(&mut self, ticks: u64) {
        let current = self.current;
        if current == self.idle {
            return;
        }
        self.insert_sleeper(current, self.ticks + ticks.max(1));
    }

    pub fn block_current(&mut self) {
        let current = self.current;
        if current == self.idle {
            return;
        }
        if let Some(thread) = self.threads.get_mut(&current) {
            thread.state = ThreadState::Blocked;
        }
    }

    /// Makes a sleeping or blocked thread ready. Returns false for any
    /// other state, including threads that no longer exist.
    pub fn wake(&mut self, id: ThreadId) -> bool {
        match self.state_of(id) {
            Some(ThreadState::Sleeping) => {
                self.sleeping.retain(|&sleeper| sleeper != id);
                self.enqueue(id);
                true
            }
            Some(ThreadState::Blocked) => {
                self.enqueue(id);
                true
            }
            _ => false,
        }
    }

    pub fn terminate_current(&mut self) {
        let current = self.current;
        if current == self.idle {
            log_warn!(LOG_ORIGIN, "Idle thread tried to exit");
            return;
        }
        if let Some(thread) = self.threads.get_mut(&current) {
            thread.state = ThreadState::Terminated;
        }
    }

    fn check_target(&self, id: ThreadId) -> Result<ThreadState, SchedError> {
        if id == self.idle {
            return Err(SchedError::IdleThread);
        }
        self.state_of(id).ok_or(SchedError::NoSuchThread(id))
    }

    /// Parks a ready, sleeping or running thread until `resume`. Suspending
    /// the current thread takes effect at the next reschedule.
    pub fn suspend(&mut self, id: ThreadId) -> Result<(), SchedError> {
        match self.check_target(id)? {
            ThreadState::Ready | ThreadState::Sleeping | ThreadState::Running => {
                self.dequeue(id);
                if let Some(thread) = self.threads.get_mut(&id) {
                    thread.state = ThreadState::Suspended;
                }
                Ok(())
            }
            _ => Err(SchedError::InvalidState(id)),
        }
    }

    pub fn resume(&mut self, id: ThreadId) -> Result<(), SchedError> {
        match self.check_target(id)? {
            ThreadState::Suspended => {
                self.enqueue(id);
                Ok(())
            }
            _ => Err(SchedError::InvalidState(id)),
        }
    }

    /// Terminates any thread but idle. Killing the current thread takes
    /// effect at the next reschedule.
    pub fn kill(&mut self, id: ThreadId) -> Result<(), SchedError> {
        if self.check_target(id)? == ThreadState::Terminated {
            return Err(SchedError::InvalidState(id));
        }

        self.dequeue(id);
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = ThreadState::Terminated;
        }
        // only the current thread's stack can still be in use
        if id != self.current && self.threads.remove(&id).is_some() {
            self.stats.reaped += 1;
        }

        log_info!(LOG_ORIGIN, "Killed thread {}", id);
        Ok(())
    }

    pub fn sleep_task(&mut self, id: ThreadId, ticks: u64) -> Result<(), SchedError> {
        match self.check_target(id)? {
            ThreadState::Ready | ThreadState::Running => {
                self.dequeue(id);
                self.insert_sleeper(id, self.ticks + ticks.max(1));
                Ok(())
            }
            _ => Err(SchedError::InvalidState(id)),
        }
    }

    pub fn set_priority(&mut self, id: ThreadId, priority: ThreadPriority) -> Result<(), SchedError> {
        let state = self.check_target(id)?;

        if state == ThreadState::Ready {
            self.dequeue(id);
        }
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.priority = priority;
        }
        if state == ThreadState::Ready {
            self.enqueue(id);
        }
        Ok(())
    }

    pub fn find(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ThreadId> {
        self.threads.values().find(|t| t.name == name).map(|t| t.id)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn count_by_state(&self, state: ThreadState) -> usize {
        self.threads.values().filter(|t| t.state == state).count()
    }

    pub fn thread_stats(&self) -> ThreadStats {
        let mut stats = ThreadStats::default();
        for thread in self.threads.values() {
            stats.count(thread.state);
        }
        stats
    }

    pub fn snapshot(&self) -> Vec<ThreadInfo> {
        self.threads.values().map(Thread::info).collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn thread_name(&self, id: ThreadId) -> Option<String> {
        self.threads.get(&id).map(|t| t.name.clone())
    }
}

// Kernel-facing wrappers over the scheduler owned by the kernel context.

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    let scheduler = crate::context::scheduler()?;
    Some(crate::util::without_interrupts(|| f(&mut scheduler.lock())))
}

pub fn spawn(name: &str, entry: ThreadEntry, priority: ThreadPriority) -> Result<ThreadId, SchedError> {
    spawn_with_stack(name, entry, priority, DEFAULT_STACK_SIZE)
}

pub fn spawn_with_stack(
    name: &str,
    entry: ThreadEntry,
    priority: ThreadPriority,
    stack_size: usize,
) -> Result<ThreadId, SchedError> {
    with_scheduler(|s| s.spawn(name, entry, priority, stack_size)).unwrap_or(Err(SchedError::OutOfMemory))
}

pub fn current_thread() -> Option<ThreadId> {
    with_scheduler(|s| s.current())
}

pub fn yield_now() {
    crate::arch::trigger_reschedule();
}

pub fn sleep_ticks(ticks: u64) {
    if with_scheduler(|s| s.sleep_current(ticks)).is_some() {
        crate::arch::trigger_reschedule();
    }
}

pub fn sleep_ms(ms: u64) {
    sleep_ticks(ms_to_ticks(ms));
}

pub fn exit() -> ! {
    with_scheduler(|s| s.terminate_current());
    loop {
        crate::arch::trigger_reschedule();
        crate::arch::halt();
    }
}

pub fn suspend(id: ThreadId) -> Result<(), SchedError> {
    let current = with_scheduler(|s| s.suspend(id).map(|()| s.current() == id))
        .ok_or(SchedError::NoSuchThread(id))??;
    if current {
        crate::arch::trigger_reschedule();
    }
    Ok(())
}

pub fn resume(id: ThreadId) -> Result<(), SchedError> {
    with_scheduler(|s| s.resume(id)).ok_or(SchedError::NoSuchThread(id))?
}

pub fn kill(id: ThreadId) -> Result<(), SchedError> {
    let current = with_scheduler(|s| s.kill(id).map(|()| s.current() == id))
        .ok_or(SchedError::NoSuchThread(id))??;
    if current {
        crate::arch::trigger_reschedule();
    }
    Ok(())
}

pub fn set_priority(id: ThreadId, priority: ThreadPriority) -> Result<(), SchedError> {
    with_scheduler(|s| s.set_priority(id, priority)).ok_or(SchedError::NoSuchThread(id))?
}

pub fn enable_preemption() {
    with_scheduler(|s| s.enable_preemption());
    log_info!(LOG_ORIGIN, "Preemption enabled");
}

pub fn disable_preemption() {
    with_scheduler(|s| s.disable_preemption());
}

/// Copies the thread table under a critical section.
pub fn snapshot() -> Vec<ThreadInfo> {
    with_scheduler(|s| s.snapshot()).unwrap_or_default()
}

pub fn stats() -> SchedulerStats {
    with_scheduler(|s| s.stats()).unwrap_or_default()
}

/// Return address planted under every thread entry function.
pub extern "C" fn thread_exit_trampoline() -> ! {
    exit()
}

pub extern "C" fn idle_thread_entry() {
    loop {
        crate::arch::halt();
    }
}
