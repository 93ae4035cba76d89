// Interrupt Descriptor Table (IDT) Setup
//
// Defines the 32-bit protected-mode IDT: 256 interrupt gates, each
// pointing at its entry stub from `stubs.S` through the kernel code
// selector.
//
// Gate layout (8 bytes):
// - offset bits 0..16, selector, zero byte, access byte, offset bits 16..32
// - access = PRESENT | DPL << 5 | 32-bit interrupt gate (0x0E)
//
// Design principles:
// - Every vector goes through the same stub shape and the same Rust
//   dispatcher; which vectors matter is decided by handler registration,
//   not by the table
// - Interrupt gates clear IF on entry, so handlers never nest unless
//   they re-enable interrupts themselves
//
// Correctness notes:
// - The table is built once and kept in a `spin::Once`, so its address
//   is stable for the lifetime of the kernel
// - Stub addresses must be mapped before `lidt`; the stubs live in
//   .text inside the identity-mapped window

use bitflags::bitflags;
use core::mem::size_of;
use spin::Once;

use crate::arch::{lidt, DescriptorTablePointer};
use crate::interrupts::manager::VECTOR_COUNT;
use crate::log_debug;

const LOG_ORIGIN: &str = "idt";

/// Bytes between consecutive entry stubs.
pub const STUB_SIZE: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GateFlags: u8 {
        const INTERRUPT_GATE_32 = 0x0E;
        const DPL_LOW = 1 << 5;
        const DPL_HIGH = 1 << 6;
        const PRESENT = 0x80;
    }
}

impl GateFlags {
    pub fn interrupt_gate(dpl: u8) -> Self {
        GateFlags::PRESENT
            | GateFlags::INTERRUPT_GATE_32
            | GateFlags::from_bits_truncate((dpl & 0x3) << 5)
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateDescriptor {
    offset_lo: u16,
    selector: u16,
    zero: u8,
    access: u8,
    offset_hi: u16,
}

const _: () = assert!(size_of::<GateDescriptor>() == 8);

impl GateDescriptor {
    pub const fn missing() -> Self {
        GateDescriptor { offset_lo: 0, selector: 0, zero: 0, access: 0, offset_hi: 0 }
    }

    pub fn new(handler: u32, selector: u16, flags: GateFlags) -> Self {
        GateDescriptor {
            offset_lo: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            access: flags.bits(),
            offset_hi: (handler >> 16) as u16,
        }
    }

    pub fn handler(&self) -> u32 {
        (self.offset_hi as u32) << 16 | self.offset_lo as u32
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn flags(&self) -> GateFlags {
        GateFlags::from_bits_truncate(self.access)
    }
}

#[repr(C, align(8))]
pub struct InterruptDescriptorTable {
    entries: [GateDescriptor; VECTOR_COUNT],
}

impl InterruptDescriptorTable {
    /// Points gate n at `stub_base + n * STUB_SIZE`.
    pub fn build(stub_base: u32, selector: u16) -> Self {
        let mut entries = [GateDescriptor::missing(); VECTOR_COUNT];
        for (vector, entry) in entries.iter_mut().enumerate() {
            let stub = stub_base.wrapping_add((vector * STUB_SIZE) as u32);
            *entry = GateDescriptor::new(stub, selector, GateFlags::interrupt_gate(0));
        }
        InterruptDescriptorTable { entries }
    }

    pub fn entry(&self, vector: u8) -> &GateDescriptor {
        &self.entries[vector as usize]
    }

    fn pointer(&self) -> DescriptorTablePointer {
        DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const Self as usize as u32,
        }
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
core::arch::global_asm!(include_str!("stubs.S"));

#[cfg(all(target_arch = "x86", not(test)))]
fn stub_base() -> u32 {
    extern "C" {
        static interrupt_stubs: u8;
    }
    unsafe { core::ptr::addr_of!(interrupt_stubs) as usize as u32 }
}

#[cfg(not(all(target_arch = "x86", not(test))))]
fn stub_base() -> u32 {
    0
}

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub fn init(code_selector: u16) {
    let idt = IDT.call_once(|| InterruptDescriptorTable::build(stub_base(), code_selector));
    let pointer = idt.pointer();

    unsafe {
        lidt(&pointer);
    }

    log_debug!(
        LOG_ORIGIN,
        "IDT at {:#X}, stubs at {:#X}, {} gates",
        idt as *const _ as usize,
        stub_base(),
        VECTOR_COUNT
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_access_byte() {
        assert_eq!(GateFlags::interrupt_gate(0).bits(), 0x8E);
        assert_eq!(GateFlags::interrupt_gate(3).bits(), 0xEE);
    }

    #[test]
    fn descriptor_splits_the_handler_address() {
        let gate = GateDescriptor::new(0x0012_3456, 0x10, GateFlags::interrupt_gate(0));
        assert_eq!(gate.handler(), 0x0012_3456);
        assert_eq!(gate.selector(), 0x10);
        assert_eq!(gate.flags(), GateFlags::PRESENT | GateFlags::INTERRUPT_GATE_32);
    }

    #[test]
    fn table_points_each_vector_at_its_stub() {
        let idt = InterruptDescriptorTable::build(0x0010_2000, 0x10);
        assert_eq!(idt.entry(0).handler(), 0x0010_2000);
        assert_eq!(idt.entry(0x20).handler(), 0x0010_2000 + 0x20 * 16);
        assert_eq!(idt.entry(255).handler(), 0x0010_2000 + 255 * 16);

        let pointer = idt.pointer();
        let limit = pointer.limit;
        assert_eq!(limit, 256 * 8 - 1);
    }
}
