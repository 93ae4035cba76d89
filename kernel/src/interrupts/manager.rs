// Interrupt Manager
//
// Owns the 256-slot handler table and the interrupt controller, and turns
// every CPU entry (exception, hardware IRQ or software interrupt) into a
// call on a registered `InterruptHandler`.
//
// Handler protocol:
// - A handler receives the stack pointer of the saved `InterruptFrame` and
//   returns the stack pointer to resume from. Returning the argument
//   resumes the interrupted code; returning another thread's saved esp
//   switches to it
// - One handler per vector; registering an occupied vector is an error
//
// Dispatch rules:
// - No handler on an exception vector (< 0x20) is fatal
// - No handler on any other vector resumes the interrupted code
// - Vectors inside the controller's IRQ window are acknowledged after the
//   handler ran

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::log_debug;

const LOG_ORIGIN: &str = "interrupts";

pub const VECTOR_COUNT: usize = 256;

/// CPU exception vectors are 0..EXCEPTION_VECTORS.
pub const EXCEPTION_VECTORS: u8 = 0x20;

pub trait InterruptHandler: Send {
    fn handle_interrupt(&mut self, esp: usize) -> usize;
}

/// Hardware IRQ routing and acknowledgement.
pub trait InterruptController: Send {
    fn enable_irq(&mut self, irq: u8);
    fn disable_irq(&mut self, irq: u8);
    /// True when `vector` belongs to a line this controller must acknowledge.
    fn handles(&self, vector: u8) -> bool;
    fn end_of_interrupt(&mut self, vector: u8);
    fn activate(&mut self);
    fn deactivate(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptError {
    VectorInUse(u8),
    NotRegistered(u8),
}

impl fmt::Display for InterruptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptError::VectorInUse(v) => write!(f, "vector {:#04X} already has a handler", v),
            InterruptError::NotRegistered(v) => write!(f, "vector {:#04X} has no handler", v),
        }
    }
}

/// An exception arrived with nobody to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalException {
    pub vector: u8,
}

pub struct InterruptManager<C: InterruptController> {
    controller: C,
    handlers: Vec<Option<Box<dyn InterruptHandler>>>,
    counts: Vec<u64>,
}

impl<C: InterruptController> InterruptManager<C> {
    pub fn new(controller: C) -> Self {
        let mut handlers = Vec::with_capacity(VECTOR_COUNT);
        handlers.resize_with(VECTOR_COUNT, || None);

        InterruptManager {
            controller,
            handlers,
            counts: alloc::vec![0; VECTOR_COUNT],
        }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn register(&mut self, vector: u8, handler: Box<dyn InterruptHandler>) -> Result<(), InterruptError> {
        let slot = &mut self.handlers[vector as usize];
        if slot.is_some() {
            return Err(InterruptError::VectorInUse(vector));
        }
        *slot = Some(handler);
        log_debug!(LOG_ORIGIN, "Handler registered on vector {:#04X}", vector);
        Ok(())
    }

    pub fn unregister(&mut self, vector: u8) -> Result<Box<dyn InterruptHandler>, InterruptError> {
        self.handlers[vector as usize]
            .take()
            .ok_or(InterruptError::NotRegistered(vector))
    }

    pub fn is_registered(&self, vector: u8) -> bool {
        self.handlers[vector as usize].is_some()
    }

    pub fn dispatch(&mut self, vector: u8, esp: usize) -> Result<usize, FatalException> {
        self.counts[vector as usize] += 1;

        let next = match self.handlers[vector as usize].as_mut() {
            Some(handler) => handler.handle_interrupt(esp),
            None if vector < EXCEPTION_VECTORS => return Err(FatalException { vector }),
            None => esp,
        };

        if self.controller.handles(vector) {
            self.controller.end_of_interrupt(vector);
        }
        Ok(next)
    }

    /// Times `vector` was dispatched.
    pub fn count(&self, vector: u8) -> u64 {
        self.counts[vector as usize]
    }

    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn enable_irq(&mut self, irq: u8) {
        self.controller.enable_irq(irq);
    }

    pub fn disable_irq(&mut self, irq: u8) {
        self.controller.disable_irq(irq);
    }

    pub fn activate(&mut self) {
        self.controller.activate();
    }

    pub fn deactivate(&mut self) {
        self.controller.deactivate();
    }
}
