// Blocking Synchronization Primitives
//
// Mutex, counting semaphore and condition variable for kernel threads.
//
// Structure:
// - Each primitive is a small state machine (`MutexState`,
//   `SemaphoreState`, `CondvarState`) that owns its FIFO wait queue and
//   talks to the scheduler only through `WaitContext`
// - The kernel-facing types (`Mutex<T>`, `Semaphore`, `Condvar`) run the
//   state machine with interrupts disabled and the scheduler locked, drop
//   both, then raise the reschedule interrupt when the caller must block
//
// Hand-off rules:
// - Unlock passes ownership straight to the first live waiter inside the
//   same critical section, so no third thread can take the lock between
//   the unlock and the wake-up
// - Signal on a semaphore with waiters transfers the unit to the woken
//   thread instead of incrementing the count
// - Waiters that no longer exist (killed while blocked) are skipped
//
// Lock order is always scheduler first, then primitive state.

#![allow(dead_code)]

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::arch;
use crate::sched::Scheduler;
use crate::thread::ThreadId;
use crate::util::without_interrupts;
use crate::log_panic;

const LOG_ORIGIN: &str = "sync";

/// Scheduler hooks the primitives need.
pub trait WaitContext {
    fn current(&self) -> ThreadId;
    /// Marks the current thread blocked. It keeps the CPU until the next
    /// reschedule.
    fn block_current(&mut self);
    /// Makes a blocked thread ready. False when the thread is gone or not
    /// blocked.
    fn wake(&mut self, id: ThreadId) -> bool;
    /// False when nothing could ever wake a blocked caller.
    fn can_block(&self) -> bool {
        true
    }
}

impl WaitContext for Scheduler {
    fn current(&self) -> ThreadId {
        Scheduler::current(self)
    }

    fn block_current(&mut self) {
        Scheduler::block_current(self)
    }

    fn wake(&mut self, id: ThreadId) -> bool {
        Scheduler::wake(self, id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Unlock by a thread that does not hold the mutex.
    NotOwner,
    /// Lock by the thread that already holds the mutex.
    Deadlock,
    /// Blocking wait with no scheduler to ever wake the caller.
    NoScheduler,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NotOwner => write!(f, "mutex unlocked by non-owner"),
            SyncError::Deadlock => write!(f, "mutex already held by caller"),
            SyncError::NoScheduler => write!(f, "blocking wait before the scheduler exists"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    /// The caller was queued and marked blocked; it must reschedule.
    Blocked,
}

fn wake_first_live<W: WaitContext + ?Sized>(waiters: &mut VecDeque<ThreadId>, ctx: &mut W) -> Option<ThreadId> {
    while let Some(id) = waiters.pop_front() {
        if ctx.wake(id) {
            return Some(id);
        }
    }
    None
}

pub struct MutexState {
    owner: Option<ThreadId>,
    waiters: VecDeque<ThreadId>,
}

impl MutexState {
    pub const fn new() -> Self {
        MutexState { owner: None, waiters: VecDeque::new() }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn try_acquire<W: WaitContext + ?Sized>(&mut self, ctx: &W) -> bool {
        if self.owner.is_some() {
            return false;
        }
        self.owner = Some(ctx.current());
        true
    }

    pub fn acquire<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) -> Result<Acquire, SyncError> {
        let me = ctx.current();
        match self.owner {
            None => {
                self.owner = Some(me);
                Ok(Acquire::Acquired)
            }
            Some(owner) if owner == me => Err(SyncError::Deadlock),
            Some(_) => {
                self.waiters.push_back(me);
                ctx.block_current();
                Ok(Acquire::Blocked)
            }
        }
    }

    /// Releases the mutex, handing it to the next live waiter. Returns the
    /// new owner, if any.
    pub fn release<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) -> Result<Option<ThreadId>, SyncError> {
        if self.owner != Some(ctx.current()) {
            return Err(SyncError::NotOwner);
        }

        self.owner = wake_first_live(&mut self.waiters, ctx);
        Ok(self.owner)
    }
}

impl Default for MutexState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SemaphoreState {
    count: u32,
    max: u32,
    waiters: VecDeque<ThreadId>,
}

impl SemaphoreState {
    /// `max` is raised to at least 1 and `initial` clamped to `max`.
    pub fn new(initial: u32, max: u32) -> Self {
        let max = max.max(1);
        SemaphoreState { count: initial.min(max), max, waiters: VecDeque::new() }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn try_wait(&mut self) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }

    pub fn wait<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) -> Acquire {
        if self.try_wait() {
            return Acquire::Acquired;
        }
        self.waiters.push_back(ctx.current());
        ctx.block_current();
        Acquire::Blocked
    }

    /// Wakes one waiter, or bumps the count (saturating at `max`).
    pub fn signal<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) -> Option<ThreadId> {
        let woken = wake_first_live(&mut self.waiters, ctx);
        if woken.is_none() && self.count < self.max {
            self.count += 1;
        }
        woken
    }
}

impl Default for SemaphoreState {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

pub struct CondvarState {
    waiters: VecDeque<ThreadId>,
}

impl CondvarState {
    pub const fn new() -> Self {
        CondvarState { waiters: VecDeque::new() }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Queues and blocks the current thread. The caller releases the
    /// associated mutex in the same critical section.
    pub fn enqueue_current<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) {
        self.waiters.push_back(ctx.current());
        ctx.block_current();
    }

    pub fn signal<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) -> bool {
        wake_first_live(&mut self.waiters, ctx).is_some()
    }

    pub fn broadcast<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) -> usize {
        let mut woken = 0;
        while wake_first_live(&mut self.waiters, ctx).is_some() {
            woken += 1;
        }
        woken
    }
}

impl Default for CondvarState {
    fn default() -> Self {
        Self::new()
    }
}

/// Stand-in used before the scheduler exists: only the boot thread runs,
/// so nothing can actually block.
struct BootContext;

impl WaitContext for BootContext {
    fn current(&self) -> ThreadId {
        ThreadId::from_raw(1)
    }

    fn block_current(&mut self) {}

    fn wake(&mut self, _id: ThreadId) -> bool {
        false
    }

    fn can_block(&self) -> bool {
        false
    }
}

/// Runs `f` against the live scheduler, or the boot stand-in before one
/// exists, with interrupts disabled.
fn with_wait_context<R>(f: impl FnOnce(&mut dyn WaitContext) -> R) -> R {
    without_interrupts(|| match crate::context::scheduler() {
        Some(scheduler) => f(&mut *scheduler.lock()),
        None => f(&mut BootContext),
    })
}

fn contract_violation(err: SyncError) -> ! {
    log_panic!(LOG_ORIGIN, "{}", err);
    panic!("{}", err)
}

/// Sleeping mutex protecting a value of type `T`.
pub struct Mutex<T> {
    state: spin::Mutex<MutexState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex { state: spin::Mutex::new(MutexState::new()), data: UnsafeCell::new(value) }
    }

    pub fn lock(&self) -> LockGuard<'_, T> {
        loop {
            let outcome = with_wait_context(|ctx| {
                let me = ctx.current();
                self.state.lock().acquire(ctx).map(|acquire| (acquire, me))
            });

            match outcome {
                Ok((Acquire::Acquired, _)) => return LockGuard { mutex: self },
                Ok((Acquire::Blocked, me)) => {
                    arch::trigger_reschedule();
                    // unlock hands ownership over before waking us
                    if without_interrupts(|| self.state.lock().owner()) == Some(me) {
                        return LockGuard { mutex: self };
                    }
                }
                Err(err) => contract_violation(err),
            }
        }
    }

    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        with_wait_context(|ctx| self.state.lock().try_acquire(ctx)).then(|| LockGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        without_interrupts(|| self.state.lock().is_locked())
    }

    fn unlock(&self) {
        if let Err(err) = with_wait_context(|ctx| self.state.lock().release(ctx)) {
            contract_violation(err);
        }
    }
}

/// Holds a `Mutex` until dropped.
pub struct LockGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

pub struct Semaphore {
    state: spin::Mutex<SemaphoreState>,
}

impl Semaphore {
    pub fn new(initial: u32, max: u32) -> Self {
        Semaphore { state: spin::Mutex::new(SemaphoreState::new(initial, max)) }
    }

    pub fn wait(&self) {
        let outcome = with_wait_context(|ctx| {
            let mut state = self.state.lock();
            if state.count() == 0 && !ctx.can_block() {
                return Err(SyncError::NoScheduler);
            }
            Ok(state.wait(ctx))
        });

        match outcome {
            Ok(Acquire::Acquired) => {}
            // the signaller transferred its unit to us
            Ok(Acquire::Blocked) => arch::trigger_reschedule(),
            Err(err) => contract_violation(err),
        }
    }

    pub fn try_wait(&self) -> bool {
        without_interrupts(|| self.state.lock().try_wait())
    }

    pub fn signal(&self) {
        with_wait_context(|ctx| self.state.lock().signal(ctx));
    }

    pub fn count(&self) -> u32 {
        without_interrupts(|| self.state.lock().count())
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore { state: spin::Mutex::new(SemaphoreState::default()) }
    }
}

pub struct Condvar {
    state: spin::Mutex<CondvarState>,
}

impl Condvar {
    pub const fn new() -> Self {
        Condvar { state: spin::Mutex::new(CondvarState::new()) }
    }

    /// Atomically releases `guard`'s mutex and blocks until signalled, then
    /// re-acquires the mutex.
    pub fn wait<'a, T>(&self, guard: LockGuard<'a, T>) -> LockGuard<'a, T> {
        let mutex = guard.mutex;
        core::mem::forget(guard);

        let released = with_wait_context(|ctx| {
            if !ctx.can_block() {
                return Err(SyncError::NoScheduler);
            }
            self.state.lock().enqueue_current(ctx);
            mutex.state.lock().release(ctx)
        });
        if let Err(err) = released {
            contract_violation(err);
        }

        arch::trigger_reschedule();
        mutex.lock()
    }

    pub fn signal(&self) -> bool {
        with_wait_context(|ctx| self.state.lock().signal(ctx))
    }

    pub fn broadcast(&self) -> usize {
        with_wait_context(|ctx| self.state.lock().broadcast(ctx))
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
