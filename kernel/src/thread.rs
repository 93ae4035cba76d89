// Thread Control Blocks
//
// Defines the kernel thread abstraction the scheduler works on: identity,
// state, priority, the owned stack and the saved stack pointer.
//
// Thread model:
// - Each thread has a unique `ThreadId` (never reused), a bounded name,
//   a priority band and a state
// - States: Ready → Running → Sleeping / Blocked / Suspended → Terminated
// - The boot context is adopted as a thread without an owned stack
//
// CPU context handling:
// - A suspended thread is fully described by one saved stack pointer
// - At that address sits an `InterruptFrame`, the exact layout pushed by
//   the interrupt entry stubs, so resuming a thread is "load esp, pop, iret"
// - New threads get a synthesized frame so their first run looks like a
//   return from an interrupt straight into the entry function
//
// Stack layout of a new thread (addresses grow upward):
//
//   base  [canary] ... [InterruptFrame (17 words)] [exit trampoline] top
//                       ^ saved esp                 ^ entry's return slot
//
// When the entry function returns it lands in the exit trampoline, which
// terminates the thread.
//
// Correctness notes:
// - The canary at the lowest word detects stack overflow after the fact
// - The return slot is placed so the entry function sees the 16-byte call
//   alignment the i386 ABI expects

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;

use crate::arch::gdt::{CODE_SELECTOR, DATA_SELECTOR};
use crate::config::{MAX_NAME_LEN, PRIORITY_BANDS, TIME_SLICES};
use crate::util::{align_down, bounded_name};

const STACK_CANARY: u32 = 0xDEAD_BEEF;
const STACK_ALIGN: usize = 16;

/// IF set, reserved bit 1 set.
pub const INITIAL_EFLAGS: u32 = 0x202;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    pub const fn from_raw(value: u32) -> Self {
        ThreadId(value)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Sleeping,
    Blocked,
    Suspended,
    Terminated,
}

impl ThreadState {
    pub const ALL: [ThreadState; 6] = [
        ThreadState::Ready,
        ThreadState::Running,
        ThreadState::Sleeping,
        ThreadState::Blocked,
        ThreadState::Suspended,
        ThreadState::Terminated,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ThreadState::Ready => "ready",
            ThreadState::Running => "running",
            ThreadState::Sleeping => "sleeping",
            ThreadState::Blocked => "blocked",
            ThreadState::Suspended => "suspended",
            ThreadState::Terminated => "terminated",
        }
    }
}

/// Lower value is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Idle = 4,
}

impl ThreadPriority {
    pub const fn band(&self) -> usize {
        *self as usize
    }

    pub const fn time_slice(&self) -> u32 {
        TIME_SLICES[self.band()]
    }

    pub const fn from_band(band: usize) -> Option<Self> {
        match band {
            0 => Some(ThreadPriority::Critical),
            1 => Some(ThreadPriority::High),
            2 => Some(ThreadPriority::Normal),
            3 => Some(ThreadPriority::Low),
            4 => Some(ThreadPriority::Idle),
            _ => None,
        }
    }
}

impl Default for ThreadPriority {
    fn default() -> Self {
        ThreadPriority::Normal
    }
}

const _: () = assert!(ThreadPriority::Idle as usize == PRIORITY_BANDS - 1);

/// Register image saved by the interrupt entry stubs, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Value of esp stored by `pushad`, ignored by `popad`.
    pub esp_dump: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

pub const FRAME_WORDS: usize = 17;

const _: () = assert!(size_of::<InterruptFrame>() == FRAME_WORDS * 4);

impl InterruptFrame {
    /// Frame that "returns" into `entry` in ring 0 with interrupts enabled.
    pub fn for_entry(entry: usize) -> Self {
        let data = DATA_SELECTOR as u32;
        InterruptFrame {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            eip: entry as u32,
            cs: CODE_SELECTOR as u32,
            eflags: INITIAL_EFLAGS,
            ..InterruptFrame::default()
        }
    }

    pub fn to_words(&self) -> [u32; FRAME_WORDS] {
        [
            self.gs,
            self.fs,
            self.es,
            self.ds,
            self.edi,
            self.esi,
            self.ebp,
            self.esp_dump,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.vector,
            self.error_code,
            self.eip,
            self.cs,
            self.eflags,
        ]
    }

    pub fn from_words(w: &[u32; FRAME_WORDS]) -> Self {
        InterruptFrame {
            gs: w[0],
            fs: w[1],
            es: w[2],
            ds: w[3],
            edi: w[4],
            esi: w[5],
            ebp: w[6],
            esp_dump: w[7],
            ebx: w[8],
            edx: w[9],
            ecx: w[10],
            eax: w[11],
            vector: w[12],
            error_code: w[13],
            eip: w[14],
            cs: w[15],
            eflags: w[16],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedContext {
    pub esp: usize,
}

/// Kernel stack owned by a thread.
pub struct ThreadStack {
    words: Box<[u32]>,
}

impl ThreadStack {
    /// Allocates a zeroed stack of at least `size` bytes, or `None` when the
    /// heap is exhausted.
    pub fn allocate(size: usize) -> Option<Self> {
        let len = size.div_ceil(4);
        let mut words: Vec<u32> = Vec::new();
        words.try_reserve_exact(len).ok()?;
        words.resize(len, 0);

        let mut stack = ThreadStack { words: words.into_boxed_slice() };
        if let Some(bottom) = stack.words.first_mut() {
            *bottom = STACK_CANARY;
        }
        Some(stack)
    }

    pub fn base(&self) -> usize {
        self.words.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.words.len() * 4
    }

    pub fn top(&self) -> usize {
        self.base() + self.size()
    }

    pub fn canary_intact(&self) -> bool {
        self.words.first() == Some(&STACK_CANARY)
    }

    /// Writes the first frame of a new thread and returns its saved esp.
    pub fn prepare(&mut self, entry: usize, exit_trampoline: usize) -> Option<usize> {
        let return_slot = align_down(self.top(), STACK_ALIGN).checked_sub(4)?;
        let frame_addr = return_slot.checked_sub(FRAME_WORDS * 4)?;
        if frame_addr < self.base() + 4 {
            return None;
        }

        let ret_index = (return_slot - self.base()) / 4;
        let frame_index = (frame_addr - self.base()) / 4;

        self.words[ret_index] = exit_trampoline as u32;
        self.words[frame_index..ret_index].copy_from_slice(&InterruptFrame::for_entry(entry).to_words());

        Some(frame_addr)
    }

    /// Reads back the frame stored at `esp`, if it lies inside this stack.
    pub fn frame_at(&self, esp: usize) -> Option<InterruptFrame> {
        if esp < self.base() || esp % 4 != 0 {
            return None;
        }
        let index = (esp - self.base()) / 4;
        let words: &[u32; FRAME_WORDS] = self.words.get(index..index + FRAME_WORDS)?.try_into().ok()?;
        Some(InterruptFrame::from_words(words))
    }

    pub fn word_at(&self, addr: usize) -> Option<u32> {
        if addr < self.base() {
            return None;
        }
        self.words.get((addr - self.base()) / 4).copied()
    }
}

pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub priority: ThreadPriority,
    pub state: ThreadState,
    pub context: SavedContext,
    pub stack: Option<ThreadStack>,
    /// Tick at which a sleeping thread becomes ready.
    pub wake_tick: u64,
    /// Ticks this thread was running when the timer fired.
    pub runtime_ticks: u64,
    pub times_scheduled: u64,
}

impl Thread {
    pub fn new(id: ThreadId, name: &str, priority: ThreadPriority, stack: Option<ThreadStack>) -> Self {
        Thread {
            id,
            name: bounded_name(name, MAX_NAME_LEN),
            priority,
            state: ThreadState::Ready,
            context: SavedContext::default(),
            stack,
            wake_tick: 0,
            runtime_ticks: 0,
            times_scheduled: 0,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ThreadState::Ready | ThreadState::Running)
    }

    pub fn validate_stack(&self) -> bool {
        self.stack.as_ref().map_or(true, ThreadStack::canary_intact)
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            runtime_ticks: self.runtime_ticks,
            stack_size: self.stack.as_ref().map_or(0, ThreadStack::size),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("esp", &format_args!("{:#X}", self.context.esp))
            .finish()
    }
}

/// Point-in-time copy of one thread's public fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub priority: ThreadPriority,
    pub runtime_ticks: u64,
    pub stack_size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub total: usize,
    pub ready: usize,
    pub running: usize,
    pub sleeping: usize,
    pub blocked: usize,
    pub suspended: usize,
    pub terminated: usize,
}

impl ThreadStats {
    pub fn count(&mut self, state: ThreadState) {
        self.total += 1;
        match state {
            ThreadState::Ready => self.ready += 1,
            ThreadState::Running => self.running += 1,
            ThreadState::Sleeping => self.sleeping += 1,
            ThreadState::Blocked => self.blocked += 1,
            ThreadState::Suspended => self.suspended += 1,
            ThreadState::Terminated => self.terminated += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_map_to_bands_and_slices() {
        assert_eq!(ThreadPriority::Critical.band(), 0);
        assert_eq!(ThreadPriority::Critical.time_slice(), 20);
        assert_eq!(ThreadPriority::Idle.time_slice(), 3);
        assert_eq!(ThreadPriority::from_band(2), Some(ThreadPriority::Normal));
        assert_eq!(ThreadPriority::from_band(5), None);
        assert!(ThreadPriority::Critical < ThreadPriority::Low);
    }

    #[test]
    fn entry_frame_uses_kernel_selectors() {
        let frame = InterruptFrame::for_entry(0x0010_2030);
        assert_eq!(frame.cs, 0x10);
        assert_eq!(frame.ds, 0x18);
        assert_eq!(frame.gs, 0x18);
        assert_eq!(frame.eflags, 0x202);
        assert_eq!(frame.eip, 0x0010_2030);
        assert_eq!(frame.eax, 0);
    }

    #[test]
    fn prepared_stack_holds_frame_and_return_slot() {
        let mut stack = ThreadStack::allocate(4096).unwrap();
        let esp = stack.prepare(0x0010_2030, 0x0010_4050).unwrap();

        let frame = stack.frame_at(esp).unwrap();
        assert_eq!(frame, InterruptFrame::for_entry(0x0010_2030));

        let return_slot = esp + FRAME_WORDS * 4;
        assert_eq!(stack.word_at(return_slot), Some(0x0010_4050));
        assert_eq!((return_slot + 4) % STACK_ALIGN, 0);
        assert!(return_slot < stack.top());
    }

    #[test]
    fn tiny_stack_cannot_hold_a_frame() {
        let mut stack = ThreadStack::allocate(32).unwrap();
        assert_eq!(stack.prepare(1, 2), None);
    }

    #[test]
    fn canary_guards_the_bottom_word() {
        let stack = ThreadStack::allocate(1024).unwrap();
        assert!(stack.canary_intact());
        assert_eq!(stack.size(), 1024);

        let thread = Thread::new(ThreadId::from_raw(7), "worker", ThreadPriority::Low, Some(stack));
        assert!(thread.validate_stack());
        assert_eq!(thread.info().stack_size, 1024);
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "a-very-long-thread-name-that-keeps-going-on";
        let thread = Thread::new(ThreadId::from_raw(1), long, ThreadPriority::Normal, None);
        assert_eq!(thread.name.len(), MAX_NAME_LEN);
        assert_eq!(thread.info().stack_size, 0);
    }

    #[test]
    fn stats_count_each_state() {
        let mut stats = ThreadStats::default();
        for state in ThreadState::ALL {
            stats.count(state);
        }
        stats.count(ThreadState::Ready);
        assert_eq!(stats.total, 7);
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.terminated, 1);
    }
}
