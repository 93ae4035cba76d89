// Pipes (byte-stream inter-thread channels)
//
// A pipe is a named, fixed-capacity byte ring buffer with two FIFO wait
// queues: threads waiting for data and threads waiting for space.
//
// Key responsibilities:
// - Move bytes in FIFO order from writers to readers
// - Block readers on an empty pipe and writers on a full one, waking
//   exactly one waiter of the opposite kind on every state change
// - Register reader and writer threads (up to 8 of each), and report
//   end-of-stream or a broken pipe when one side goes away
// - Manage the system-wide set of live pipes (`PipeManager`)
//
// Semantics:
// - A pipe with no registered readers may be read by any thread, and the
//   same holds for writers; once a thread of a kind is registered, only
//   registered threads of that kind may use that direction
// - Reads return as soon as at least one byte is available (short reads)
// - Writes copy as much as fits; the kernel `write` wrapper keeps going
//   until everything was written
// - A read on an empty pipe returns 0 (end of stream) once the pipe is
//   closed or its last writer detached
// - Writes fail with `BrokenPipe` once the last reader detached, and with
//   `Closed` after `close`
// - Detaching the last end of either kind from a pipe with no ends left
//   destroys it
//
// The state machines here never block by themselves. A blocking call
// queues the caller, marks it blocked through `WaitContext` and returns
// `Transfer::WouldBlock`; the wrapper then reschedules and retries.

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{MAX_NAME_LEN, MAX_PIPES, MAX_PIPE_ENDS, PIPE_DEFAULT_CAPACITY};
use crate::sync::WaitContext;
use crate::thread::ThreadId;
use crate::util::bounded_name;
use crate::{log_debug, log_info};

const LOG_ORIGIN: &str = "pipe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipeId(u32);

impl PipeId {
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    NoSuchPipe,
    NameTaken,
    TooManyPipes,
    InvalidCapacity,
    OutOfMemory,
    /// The pipe was closed.
    Closed,
    /// Every reader detached.
    BrokenPipe,
    /// The thread is not registered as an end of this kind.
    NotAttached,
    /// The thread is already registered as an end of this kind.
    AlreadyAttached,
    /// Every reader or writer slot is taken.
    TooManyEnds,
    /// The calling thread is not registered for this direction.
    NotPermitted,
    /// The kernel context is not up yet.
    NotInitialized,
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PipeError::NoSuchPipe => "no such pipe",
            PipeError::NameTaken => "pipe name already in use",
            PipeError::TooManyPipes => "pipe limit reached",
            PipeError::InvalidCapacity => "invalid pipe capacity",
            PipeError::OutOfMemory => "out of memory for pipe buffer",
            PipeError::Closed => "pipe closed",
            PipeError::BrokenPipe => "broken pipe",
            PipeError::NotAttached => "end not attached",
            PipeError::AlreadyAttached => "end already attached",
            PipeError::TooManyEnds => "too many pipe ends",
            PipeError::NotPermitted => "thread not registered on this pipe",
            PipeError::NotInitialized => "pipes not initialized",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes moved. A read of 0 bytes into a non-empty buffer is end of stream.
    Done(usize),
    WouldBlock,
}

struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    fn with_capacity(capacity: usize) -> Result<Self, PipeError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| PipeError::OutOfMemory)?;
        data.resize(capacity, 0);
        Ok(RingBuffer { data: data.into_boxed_slice(), head: 0, len: 0 })
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.capacity() - self.len);
        for (i, &byte) in bytes[..n].iter().enumerate() {
            let slot = (self.head + self.len + i) % self.capacity();
            self.data[slot] = byte;
        }
        self.len += n;
        n
    }

    fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for (i, byte) in out[..n].iter_mut().enumerate() {
            *byte = self.data[(self.head + i) % self.capacity()];
        }
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        n
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

fn wake_one<W: WaitContext + ?Sized>(queue: &mut VecDeque<ThreadId>, ctx: &mut W) {
    while let Some(id) = queue.pop_front() {
        if ctx.wake(id) {
            return;
        }
    }
}

fn wake_all<W: WaitContext + ?Sized>(queue: &mut VecDeque<ThreadId>, ctx: &mut W) {
    while let Some(id) = queue.pop_front() {
        ctx.wake(id);
    }
}

fn register(ends: &mut Vec<ThreadId>, thread: ThreadId) -> Result<(), PipeError> {
    if ends.contains(&thread) {
        return Err(PipeError::AlreadyAttached);
    }
    if ends.len() >= MAX_PIPE_ENDS {
        return Err(PipeError::TooManyEnds);
    }
    ends.push(thread);
    Ok(())
}

fn unregister(ends: &mut Vec<ThreadId>, thread: ThreadId) -> Result<(), PipeError> {
    let index = ends.iter().position(|&id| id == thread).ok_or(PipeError::NotAttached)?;
    ends.remove(index);
    Ok(())
}

pub struct Pipe {
    id: PipeId,
    name: String,
    buffer: RingBuffer,
    waiting_readers: VecDeque<ThreadId>,
    waiting_writers: VecDeque<ThreadId>,
    readers: Vec<ThreadId>,
    writers: Vec<ThreadId>,
    readers_gone: bool,
    writers_gone: bool,
    closed: bool,
    bytes_written: u64,
    bytes_read: u64,
}

impl Pipe {
    pub fn new(id: PipeId, name: &str, capacity: usize) -> Result<Self, PipeError> {
        if capacity == 0 {
            return Err(PipeError::InvalidCapacity);
        }

        Ok(Pipe {
            id,
            name: bounded_name(name, MAX_NAME_LEN),
            buffer: RingBuffer::with_capacity(capacity)?,
            waiting_readers: VecDeque::new(),
            waiting_writers: VecDeque::new(),
            readers: Vec::new(),
            writers: Vec::new(),
            readers_gone: false,
            writers_gone: false,
            closed: false,
            bytes_written: 0,
            bytes_read: 0,
        })
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn available(&self) -> usize {
        self.buffer.len
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn readers(&self) -> &[ThreadId] {
        &self.readers
    }

    pub fn writers(&self) -> &[ThreadId] {
        &self.writers
    }

    pub fn can_read(&self, thread: ThreadId) -> bool {
        self.readers.is_empty() || self.readers.contains(&thread)
    }

    pub fn can_write(&self, thread: ThreadId) -> bool {
        self.writers.is_empty() || self.writers.contains(&thread)
    }

    fn at_end_of_stream(&self) -> bool {
        self.closed || self.writers_gone
    }

    /// Reads without queuing the caller.
    pub fn try_read<W: WaitContext + ?Sized>(&mut self, out: &mut [u8], ctx: &mut W) -> Result<Transfer, PipeError> {
        if !self.can_read(ctx.current()) {
            return Err(PipeError::NotPermitted);
        }
        if out.is_empty() {
            return Ok(Transfer::Done(0));
        }

        let n = self.buffer.pop(out);
        if n > 0 {
            self.bytes_read += n as u64;
            wake_one(&mut self.waiting_writers, ctx);
            return Ok(Transfer::Done(n));
        }

        if self.at_end_of_stream() {
            Ok(Transfer::Done(0))
        } else {
            Ok(Transfer::WouldBlock)
        }
    }

    /// Reads, or queues and blocks the caller on an empty pipe.
    pub fn read<W: WaitContext + ?Sized>(&mut self, out: &mut [u8], ctx: &mut W) -> Result<Transfer, PipeError> {
        let result = self.try_read(out, ctx)?;
        if result == Transfer::WouldBlock {
            self.waiting_readers.push_back(ctx.current());
            ctx.block_current();
        }
        Ok(result)
    }

    /// Writes as much as fits without queuing the caller.
    pub fn try_write<W: WaitContext + ?Sized>(&mut self, data: &[u8], ctx: &mut W) -> Result<Transfer, PipeError> {
        if !self.can_write(ctx.current()) {
            return Err(PipeError::NotPermitted);
        }
        if self.closed {
            return Err(PipeError::Closed);
        }
        if self.readers_gone {
            return Err(PipeError::BrokenPipe);
        }
        if data.is_empty() {
            return Ok(Transfer::Done(0));
        }

        let n = self.buffer.push(data);
        if n == 0 {
            return Ok(Transfer::WouldBlock);
        }

        self.bytes_written += n as u64;
        wake_one(&mut self.waiting_readers, ctx);
        Ok(Transfer::Done(n))
    }

    /// Writes, or queues and blocks the caller on a full pipe.
    pub fn write<W: WaitContext + ?Sized>(&mut self, data: &[u8], ctx: &mut W) -> Result<Transfer, PipeError> {
        let result = self.try_write(data, ctx)?;
        if result == Transfer::WouldBlock {
            self.waiting_writers.push_back(ctx.current());
            ctx.block_current();
        }
        Ok(result)
    }

    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.buffer.peek(out)
    }

    /// Discards buffered data and wakes every blocked writer.
    pub fn flush<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) {
        self.buffer.clear();
        wake_all(&mut self.waiting_writers, ctx);
    }

    /// Readers drain what is left and then see end of stream; writers fail.
    pub fn close<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) {
        self.closed = true;
        wake_all(&mut self.waiting_readers, ctx);
        wake_all(&mut self.waiting_writers, ctx);
    }

    pub fn attach_reader(&mut self, thread: ThreadId) -> Result<(), PipeError> {
        register(&mut self.readers, thread)?;
        self.readers_gone = false;
        Ok(())
    }

    pub fn attach_writer(&mut self, thread: ThreadId) -> Result<(), PipeError> {
        register(&mut self.writers, thread)?;
        self.writers_gone = false;
        Ok(())
    }

    pub fn detach_reader<W: WaitContext + ?Sized>(&mut self, thread: ThreadId, ctx: &mut W) -> Result<(), PipeError> {
        unregister(&mut self.readers, thread)?;
        if self.readers.is_empty() {
            self.readers_gone = true;
            wake_all(&mut self.waiting_writers, ctx);
        }
        Ok(())
    }

    pub fn detach_writer<W: WaitContext + ?Sized>(&mut self, thread: ThreadId, ctx: &mut W) -> Result<(), PipeError> {
        unregister(&mut self.writers, thread)?;
        if self.writers.is_empty() {
            self.writers_gone = true;
            wake_all(&mut self.waiting_readers, ctx);
        }
        Ok(())
    }

    fn unattached(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }

    pub fn info(&self) -> PipeInfo {
        PipeInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity(),
            available: self.available(),
            readers: self.readers.len() as u32,
            writers: self.writers.len() as u32,
            closed: self.closed,
            bytes_written: self.bytes_written,
            bytes_read: self.bytes_read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeInfo {
    pub id: PipeId,
    pub name: String,
    pub capacity: usize,
    pub available: usize,
    pub readers: u32,
    pub writers: u32,
    pub closed: bool,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Reader,
    Writer,
}

pub struct PipeManager {
    pipes: BTreeMap<PipeId, Pipe>,
    next_id: u32,
}

impl PipeManager {
    pub const fn new() -> Self {
        PipeManager { pipes: BTreeMap::new(), next_id: 1 }
    }

    pub fn count(&self) -> usize {
        self.pipes.len()
    }

    pub fn create(&mut self, name: &str, capacity: usize) -> Result<PipeId, PipeError> {
        if self.pipes.len() >= MAX_PIPES {
            return Err(PipeError::TooManyPipes);
        }
        let name = bounded_name(name, MAX_NAME_LEN);
        if self.find_by_name(&name).is_some() {
            return Err(PipeError::NameTaken);
        }

        let id = PipeId(self.next_id);
        let pipe = Pipe::new(id, &name, capacity)?;
        self.next_id += 1;
        self.pipes.insert(id, pipe);

        log_debug!(LOG_ORIGIN, "Created pipe {} '{}' ({} bytes)", id, name, capacity);
        Ok(id)
    }

    pub fn create_default(&mut self, name: &str) -> Result<PipeId, PipeError> {
        self.create(name, PIPE_DEFAULT_CAPACITY)
    }

    pub fn find(&self, id: PipeId) -> Option<&Pipe> {
        self.pipes.get(&id)
    }

    pub fn find_mut(&mut self, id: PipeId) -> Option<&mut Pipe> {
        self.pipes.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<PipeId> {
        self.pipes.values().find(|p| p.name == name).map(|p| p.id)
    }

    fn pipe_mut(&mut self, id: PipeId) -> Result<&mut Pipe, PipeError> {
        self.pipes.get_mut(&id).ok_or(PipeError::NoSuchPipe)
    }

    /// Closes the pipe (waking its waiters) and frees it.
    pub fn destroy<W: WaitContext + ?Sized>(&mut self, id: PipeId, ctx: &mut W) -> Result<(), PipeError> {
        let mut pipe = self.pipes.remove(&id).ok_or(PipeError::NoSuchPipe)?;
        pipe.close(ctx);
        log_debug!(LOG_ORIGIN, "Destroyed pipe {} '{}'", id, pipe.name);
        Ok(())
    }

    pub fn destroy_by_name<W: WaitContext + ?Sized>(&mut self, name: &str, ctx: &mut W) -> Result<(), PipeError> {
        let id = self.find_by_name(name).ok_or(PipeError::NoSuchPipe)?;
        self.destroy(id, ctx)
    }

    pub fn attach(&mut self, id: PipeId, end: End, thread: ThreadId) -> Result<(), PipeError> {
        let pipe = self.pipe_mut(id)?;
        match end {
            End::Reader => pipe.attach_reader(thread),
            End::Writer => pipe.attach_writer(thread),
        }
    }

    /// Detaches one end. Returns true when that was the pipe's last end and
    /// the pipe got destroyed.
    pub fn detach<W: WaitContext + ?Sized>(
        &mut self,
        id: PipeId,
        end: End,
        thread: ThreadId,
        ctx: &mut W,
    ) -> Result<bool, PipeError> {
        let pipe = self.pipe_mut(id)?;
        match end {
            End::Reader => pipe.detach_reader(thread, ctx)?,
            End::Writer => pipe.detach_writer(thread, ctx)?,
        }

        if pipe.unattached() {
            self.destroy(id, ctx)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn close_all<W: WaitContext + ?Sized>(&mut self, ctx: &mut W) {
        for pipe in self.pipes.values_mut() {
            pipe.close(ctx);
        }
        log_info!(LOG_ORIGIN, "Closed {} pipes", self.pipes.len());
    }

    pub fn list(&self) -> Vec<PipeInfo> {
        self.pipes.values().map(Pipe::info).collect()
    }
}

impl Default for PipeManager {
    fn default() -> Self {
        Self::new()
    }
}

// Kernel-facing wrappers over the pipe manager owned by the kernel context.

fn with_pipes<R>(f: impl FnOnce(&mut PipeManager, &mut dyn WaitContext) -> R) -> Result<R, PipeError> {
    let ctx = crate::context::get().ok_or(PipeError::NotInitialized)?;
    Ok(crate::util::without_interrupts(|| {
        let mut scheduler = ctx.scheduler.lock();
        let mut pipes = ctx.pipes.lock();
        f(&mut *pipes, &mut *scheduler)
    }))
}

pub fn create(name: &str, capacity: usize) -> Result<PipeId, PipeError> {
    let id = with_pipes(|pipes, _| pipes.create(name, capacity))??;
    log_info!(LOG_ORIGIN, "Pipe {} '{}' ready", id, name);
    Ok(id)
}

pub fn destroy(id: PipeId) -> Result<(), PipeError> {
    with_pipes(|pipes, ctx| pipes.destroy(id, ctx))?
}

pub fn find(name: &str) -> Option<PipeId> {
    with_pipes(|pipes, _| pipes.find_by_name(name)).ok().flatten()
}

/// Registers the calling thread as a reader or writer of `id`.
pub fn attach(id: PipeId, end: End) -> Result<(), PipeError> {
    with_pipes(|pipes, ctx| pipes.attach(id, end, ctx.current()))?
}

pub fn detach(id: PipeId, end: End) -> Result<bool, PipeError> {
    with_pipes(|pipes, ctx| {
        let me = ctx.current();
        pipes.detach(id, end, me, ctx)
    })?
}

/// Blocks until at least one byte is read. Returns 0 at end of stream.
pub fn read(id: PipeId, out: &mut [u8]) -> Result<usize, PipeError> {
    loop {
        let outcome = with_pipes(|pipes, ctx| match pipes.find_mut(id) {
            Some(pipe) => pipe.read(out, ctx),
            None => Err(PipeError::NoSuchPipe),
        })??;

        match outcome {
            Transfer::Done(n) => return Ok(n),
            Transfer::WouldBlock => crate::arch::trigger_reschedule(),
        }
    }
}

pub fn try_read(id: PipeId, out: &mut [u8]) -> Result<Transfer, PipeError> {
    with_pipes(|pipes, ctx| match pipes.find_mut(id) {
        Some(pipe) => pipe.try_read(out, ctx),
        None => Err(PipeError::NoSuchPipe),
    })?
}

/// Blocks until all of `data` is written.
pub fn write(id: PipeId, data: &[u8]) -> Result<usize, PipeError> {
    let mut written = 0;
    while written < data.len() {
        let outcome = with_pipes(|pipes, ctx| match pipes.find_mut(id) {
            Some(pipe) => pipe.write(&data[written..], ctx),
            None => Err(PipeError::NoSuchPipe),
        })??;

        match outcome {
            Transfer::Done(n) => written += n,
            Transfer::WouldBlock => crate::arch::trigger_reschedule(),
        }
    }
    Ok(written)
}

pub fn try_write(id: PipeId, data: &[u8]) -> Result<Transfer, PipeError> {
    with_pipes(|pipes, ctx| match pipes.find_mut(id) {
        Some(pipe) => pipe.try_write(data, ctx),
        None => Err(PipeError::NoSuchPipe),
    })?
}

pub fn close(id: PipeId) -> Result<(), PipeError> {
    with_pipes(|pipes, ctx| pipes.find_mut(id).map(|pipe| pipe.close(ctx)).ok_or(PipeError::NoSuchPipe))?
}

pub fn list() -> Vec<PipeInfo> {
    with_pipes(|pipes, _| pipes.list()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::sched::tests::{scheduler, spawn};
    use crate::thread::{ThreadPriority, ThreadState};
    use alloc::rc::Rc;
    use core::cell::RefCell;

    /// A pipe nobody registered on, so every thread may use both directions.
    fn pipe(capacity: usize) -> Pipe {
        Pipe::new(PipeId(1), "test", capacity).unwrap()
    }

    #[test]
    fn bytes_come_out_in_write_order_across_wraparound() {
        let mut s = scheduler();
        let mut p = pipe(8);
        let mut out = [0u8; 8];

        assert_eq!(p.try_write(b"abcdef", &mut s), Ok(Transfer::Done(6)));
        assert_eq!(p.try_read(&mut out[..4], &mut s), Ok(Transfer::Done(4)));
        assert_eq!(&out[..4], b"abcd");

        assert_eq!(p.try_write(b"ghijkl", &mut s), Ok(Transfer::Done(6)));
        assert!(p.is_full());
        assert_eq!(p.try_read(&mut out, &mut s), Ok(Transfer::Done(8)));
        assert_eq!(&out, b"efghijkl");
        assert!(p.is_empty());
    }

    #[test]
    fn partial_write_fills_only_free_space() {
        let mut s = scheduler();
        let mut p = pipe(4);
        assert_eq!(p.try_write(b"123456", &mut s), Ok(Transfer::Done(4)));
        assert_eq!(p.try_write(b"7", &mut s), Ok(Transfer::WouldBlock));
        assert_eq!(p.free_space(), 0);
    }

    #[test]
    fn full_pipe_blocks_writer_until_reader_drains() {
        let mut s = scheduler();
        let writer = s.current();
        let reader = spawn(&mut s, "reader", ThreadPriority::Normal);
        let mut p = pipe(4);

        assert_eq!(p.write(b"wxyz", &mut s), Ok(Transfer::Done(4)));
        assert_eq!(p.write(b"!", &mut s), Ok(Transfer::WouldBlock));
        assert_eq!(s.find(writer).unwrap().state, ThreadState::Blocked);

        s.reschedule(0x1000);
        assert_eq!(s.current(), reader);
        let mut out = [0u8; 1];
        assert_eq!(p.read(&mut out, &mut s), Ok(Transfer::Done(1)));
        assert_eq!(&out, b"w");
        assert_eq!(s.find(writer).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn empty_pipe_blocks_reader_until_data_arrives() {
        let mut s = scheduler();
        let reader = s.current();
        let writer = spawn(&mut s, "writer", ThreadPriority::Normal);
        let mut p = pipe(16);
        let mut out = [0u8; 16];

        assert_eq!(p.read(&mut out, &mut s), Ok(Transfer::WouldBlock));
        assert_eq!(s.find(reader).unwrap().state, ThreadState::Blocked);

        s.reschedule(0x1000);
        assert_eq!(s.current(), writer);
        assert_eq!(p.write(b"hi", &mut s), Ok(Transfer::Done(2)));
        assert_eq!(s.find(reader).unwrap().state, ThreadState::Ready);
        assert_eq!(p.try_read(&mut out, &mut s), Ok(Transfer::Done(2)));
        assert_eq!(&out[..2], b"hi");
    }

    #[test]
    fn last_writer_detach_means_end_of_stream() {
        let mut s = scheduler();
        let me = s.current();
        let mut p = pipe(16);
        let mut out = [0u8; 4];

        p.attach_writer(me).unwrap();
        p.try_write(b"ok", &mut s).unwrap();
        p.detach_writer(me, &mut s).unwrap();

        assert_eq!(p.try_read(&mut out, &mut s), Ok(Transfer::Done(2)));
        assert_eq!(p.read(&mut out, &mut s), Ok(Transfer::Done(0)));
        assert_eq!(p.detach_writer(me, &mut s), Err(PipeError::NotAttached));
    }

    #[test]
    fn last_reader_detach_breaks_the_pipe_and_wakes_writers() {
        let mut s = scheduler();
        let writer = s.current();
        let reader = spawn(&mut s, "reader", ThreadPriority::Normal);
        let mut p = pipe(1);
        p.attach_reader(reader).unwrap();
        p.attach_writer(writer).unwrap();

        p.write(b"a", &mut s).unwrap();
        assert_eq!(p.write(b"b", &mut s), Ok(Transfer::WouldBlock));
        s.reschedule(0x1000);
        assert_eq!(s.current(), reader);

        p.detach_reader(reader, &mut s).unwrap();
        assert_eq!(s.find(writer).unwrap().state, ThreadState::Ready);

        s.reschedule(0x2000);
        assert_eq!(s.current(), writer);
        assert_eq!(p.try_write(b"b", &mut s), Err(PipeError::BrokenPipe));
    }

    #[test]
    fn registered_ends_lock_out_other_threads() {
        let mut s = scheduler();
        let me = s.current();
        let stranger = ThreadId::from_raw(77);
        let mut p = pipe(8);
        let mut out = [0u8; 4];

        p.attach_reader(stranger).unwrap();
        p.attach_writer(stranger).unwrap();
        assert!(!p.can_read(me));
        assert!(!p.can_write(me));
        assert_eq!(p.try_write(b"x", &mut s), Err(PipeError::NotPermitted));
        assert_eq!(p.read(&mut out, &mut s), Err(PipeError::NotPermitted));
        assert_eq!(s.find(me).unwrap().state, ThreadState::Running);

        p.attach_writer(me).unwrap();
        assert_eq!(p.try_write(b"x", &mut s), Ok(Transfer::Done(1)));
        assert_eq!(p.try_read(&mut out, &mut s), Err(PipeError::NotPermitted));
        assert_eq!(p.writers(), &[stranger, me]);
    }

    #[test]
    fn each_direction_takes_a_bounded_set_of_distinct_threads() {
        let mut p = pipe(8);

        for raw in 0..MAX_PIPE_ENDS as u32 {
            p.attach_reader(ThreadId::from_raw(raw)).unwrap();
        }
        assert_eq!(p.attach_reader(ThreadId::from_raw(100)), Err(PipeError::TooManyEnds));
        assert_eq!(p.attach_reader(ThreadId::from_raw(0)), Err(PipeError::AlreadyAttached));

        p.attach_writer(ThreadId::from_raw(0)).unwrap();
        assert_eq!(p.attach_writer(ThreadId::from_raw(0)), Err(PipeError::AlreadyAttached));

        let info = p.info();
        assert_eq!(info.readers, MAX_PIPE_ENDS as u32);
        assert_eq!(info.writers, 1);
    }

    #[test]
    fn close_drains_then_reports_end_of_stream() {
        let mut s = scheduler();
        let mut p = pipe(8);
        let mut out = [0u8; 8];

        p.try_write(b"tail", &mut s).unwrap();
        p.close(&mut s);

        assert!(p.is_closed());
        assert_eq!(p.try_write(b"x", &mut s), Err(PipeError::Closed));
        assert_eq!(p.try_read(&mut out, &mut s), Ok(Transfer::Done(4)));
        assert_eq!(p.try_read(&mut out, &mut s), Ok(Transfer::Done(0)));
    }

    #[test]
    fn peek_and_flush_leave_reads_consistent() {
        let mut s = scheduler();
        let mut p = pipe(8);
        let mut out = [0u8; 3];

        p.try_write(b"peek", &mut s).unwrap();
        assert_eq!(p.peek(&mut out), 3);
        assert_eq!(&out, b"pee");
        assert_eq!(p.available(), 4);

        p.flush(&mut s);
        assert!(p.is_empty());
        assert_eq!(p.try_read(&mut out, &mut s), Ok(Transfer::WouldBlock));

        let info = p.info();
        assert_eq!(info.bytes_written, 4);
        assert_eq!(info.bytes_read, 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(Pipe::new(PipeId(1), "x", 0), Err(PipeError::InvalidCapacity)));
    }

    #[test]
    fn manager_enforces_unique_names_and_limit() {
        let mut s = scheduler();
        let mut pipes = PipeManager::new();

        let first = pipes.create_default("log").unwrap();
        assert_eq!(pipes.create("log", 64), Err(PipeError::NameTaken));
        assert_eq!(pipes.find_by_name("log"), Some(first));
        assert_eq!(pipes.find(first).unwrap().capacity(), PIPE_DEFAULT_CAPACITY);

        for i in 1..MAX_PIPES {
            pipes.create(&alloc::format!("p{}", i), 16).unwrap();
        }
        assert_eq!(pipes.create("overflow", 16), Err(PipeError::TooManyPipes));

        pipes.destroy_by_name("log", &mut s).unwrap();
        assert_eq!(pipes.find(first).map(Pipe::id), None);
        let again = pipes.create("log", 16).unwrap();
        assert_ne!(again, first);
        assert_eq!(pipes.destroy(first, &mut s), Err(PipeError::NoSuchPipe));
    }

    #[test]
    fn detaching_the_last_end_destroys_the_pipe() {
        let mut s = scheduler();
        let me = s.current();
        let mut pipes = PipeManager::new();
        let id = pipes.create("chan", 32).unwrap();

        pipes.attach(id, End::Reader, me).unwrap();
        pipes.attach(id, End::Writer, me).unwrap();

        assert_eq!(pipes.detach(id, End::Writer, me, &mut s), Ok(false));
        assert_eq!(pipes.list()[0].writers, 0);
        assert_eq!(pipes.detach(id, End::Reader, me, &mut s), Ok(true));
        assert_eq!(pipes.count(), 0);
        assert_eq!(pipes.attach(id, End::Reader, me), Err(PipeError::NoSuchPipe));
    }

    #[test]
    fn destroy_wakes_blocked_readers() {
        let mut s = scheduler();
        let reader = s.current();
        let mut pipes = PipeManager::new();
        let id = pipes.create("chan", 32).unwrap();
        pipes.attach(id, End::Writer, ThreadId::from_raw(42)).unwrap();

        let mut out = [0u8; 4];
        assert_eq!(pipes.find_mut(id).unwrap().read(&mut out, &mut s), Ok(Transfer::WouldBlock));
        pipes.destroy(id, &mut s).unwrap();
        assert_eq!(s.find(reader).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn close_all_closes_every_pipe() {
        let mut s = scheduler();
        let mut pipes = PipeManager::new();
        pipes.create("a", 8).unwrap();
        pipes.create("b", 8).unwrap();

        pipes.close_all(&mut s);
        assert!(pipes.list().iter().all(|info| info.closed));
    }

    #[test]
    fn wrappers_need_the_kernel_context() {
        assert_eq!(create("early", 8), Err(PipeError::NotInitialized));
        assert_eq!(find("early"), None);
        assert!(list().is_empty());
    }

    #[test]
    fn kernel_read_sleeps_until_a_writer_delivers() {
        let ctx = testing::install(scheduler());
        let reader = ctx.scheduler.lock().current();
        let writer = spawn(&mut ctx.scheduler.lock(), "writer", ThreadPriority::Normal);
        let id = create("chan", 16).unwrap();
        attach(id, End::Reader).unwrap();

        testing::on_yield(move |ctx| {
            let esp = ctx.scheduler.lock().reschedule(0x1000);
            assert_eq!(ctx.scheduler.lock().current(), writer);
            assert_eq!(write(id, b"hello"), Ok(5));
            ctx.scheduler.lock().reschedule(esp);
        });

        let mut out = [0u8; 16];
        assert_eq!(read(id, &mut out), Ok(5));
        assert_eq!(&out[..5], b"hello");
        assert_eq!(ctx.scheduler.lock().current(), reader);
        assert_eq!(detach(id, End::Reader), Ok(true));
        assert_eq!(find("chan"), None);
    }

    #[test]
    fn kernel_write_keeps_going_as_the_reader_drains() {
        let ctx = testing::install(scheduler());
        let writer = ctx.scheduler.lock().current();
        let reader = spawn(&mut ctx.scheduler.lock(), "reader", ThreadPriority::Normal);
        let id = create("chan", 4).unwrap();
        let drained = Rc::new(RefCell::new(Vec::new()));

        let sink = drained.clone();
        testing::on_yield(move |ctx| {
            let esp = ctx.scheduler.lock().reschedule(0x1000);
            assert_eq!(ctx.scheduler.lock().current(), reader);
            let mut out = [0u8; 3];
            if let Ok(Transfer::Done(n)) = try_read(id, &mut out) {
                sink.borrow_mut().extend_from_slice(&out[..n]);
            }
            ctx.scheduler.lock().reschedule(esp);
        });

        assert_eq!(write(id, b"0123456789"), Ok(10));
        assert_eq!(ctx.scheduler.lock().current(), writer);

        let mut out = [0u8; 8];
        let Ok(Transfer::Done(n)) = try_read(id, &mut out) else {
            panic!("tail of the stream missing");
        };
        drained.borrow_mut().extend_from_slice(&out[..n]);
        assert_eq!(drained.borrow().as_slice(), b"0123456789");
        assert_eq!(list()[0].bytes_read, 10);
    }
}
