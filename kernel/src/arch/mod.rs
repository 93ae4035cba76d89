// Architecture Abstraction Layer
//
// Provides the low-level, architecture-specific primitives used by the
// kernel on 32-bit x86 protected mode. Every instruction that cannot be
// expressed in plain Rust lives here, behind small inline wrappers.
//
// Key responsibilities:
// - Halt the CPU and toggle the interrupt flag
// - Read EFLAGS, CR0, CR2 and CR3; write CR0 and CR3
// - Invalidate single TLB entries (`invlpg`)
// - Raw port I/O for the PIC, PIT and serial UART, plus the `PortBus`
//   seam the PIC and PIT drivers are written against
// - Load the GDT and IDT registers
//
// Design principles:
// - Architecture-specific code is isolated behind `cfg(target_arch = "x86")`
// - Off-target builds (host unit tests) get inert fallbacks so the pure
//   kernel logic above this layer compiles and runs unchanged
// - Functions are tiny and `#[inline(always)]`
//
// Correctness and safety notes:
// - Port I/O and control-register writes are `unsafe`; callers must hold
//   the invariants of the device or paging structure they touch
// - Fallback `inb` returns 0xFF (an idle, floating bus)
// - Under host tests the interrupt flag is modelled per test thread, and
//   the reschedule interrupt runs the hook installed by `context::testing`

pub mod gdt;

#[cfg(all(test, not(target_arch = "x86")))]
std::thread_local! {
    static HOST_IF: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

#[inline(always)]
pub fn halt() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }

    #[cfg(not(target_arch = "x86"))]
    core::hint::spin_loop();
}

#[inline(always)]
pub fn irq_enable() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }

    #[cfg(all(test, not(target_arch = "x86")))]
    HOST_IF.with(|flag| flag.set(true));
}

#[inline(always)]
pub fn irq_disable() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    #[cfg(all(test, not(target_arch = "x86")))]
    HOST_IF.with(|flag| flag.set(false));
}

pub const EFLAGS_IF: u32 = 1 << 9;

#[inline(always)]
pub fn eflags() -> u32 {
    #[cfg(target_arch = "x86")]
    unsafe {
        let flags: u32;
        core::arch::asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags));
        return flags;
    }

    #[cfg(all(test, not(target_arch = "x86")))]
    if HOST_IF.with(|flag| flag.get()) {
        return EFLAGS_IF;
    }

    #[allow(unreachable_code)]
    0
}

#[inline(always)]
pub fn interrupts_enabled() -> bool {
    eflags() & EFLAGS_IF != 0
}

#[inline(always)]
pub fn read_cr0() -> u32 {
    #[cfg(target_arch = "x86")]
    unsafe {
        let cr0: u32;
        core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        return cr0;
    }

    #[allow(unreachable_code)]
    0
}

#[inline(always)]
#[allow(unused_variables)]
pub unsafe fn write_cr0(value: u32) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags));
}

#[inline(always)]
pub fn read_cr2() -> u32 {
    #[cfg(target_arch = "x86")]
    unsafe {
        let cr2: u32;
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        return cr2;
    }

    #[allow(unreachable_code)]
    0
}

#[inline(always)]
pub fn read_cr3() -> u32 {
    #[cfg(target_arch = "x86")]
    unsafe {
        let cr3: u32;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        return cr3;
    }

    #[allow(unreachable_code)]
    0
}

#[inline(always)]
#[allow(unused_variables)]
pub unsafe fn write_cr3(value: u32) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
}

#[inline(always)]
#[allow(unused_variables)]
pub unsafe fn invlpg(vaddr: usize) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
}

#[inline(always)]
#[allow(unused_variables)]
pub unsafe fn outb(port: u16, value: u8) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!(
        "out dx, al",
        in("dx") port,
        in("al") value,
        options(nomem, nostack, preserves_flags)
    );
}

#[inline(always)]
#[allow(unused_variables)]
pub unsafe fn inb(port: u16) -> u8 {
    #[cfg(target_arch = "x86")]
    {
        let ret: u8;
        core::arch::asm!(
            "in al, dx",
            out("al") ret,
            in("dx") port,
            options(nomem, nostack, preserves_flags)
        );
        return ret;
    }

    #[allow(unreachable_code)]
    0xFF
}

/// Short delay for slow ISA devices: a write to the unused POST port.
#[inline(always)]
pub unsafe fn io_wait() {
    outb(0x80, 0);
}

/// Byte-wide port I/O as seen by the legacy PIC and PIT drivers.
pub trait PortBus: Send {
    fn write(&mut self, port: u16, value: u8);
    fn read(&mut self, port: u16) -> u8;

    /// Gives slow devices time to settle between command bytes.
    fn settle(&mut self) {}
}

/// The real I/O port space.
pub struct HardwarePorts;

impl PortBus for HardwarePorts {
    fn write(&mut self, port: u16, value: u8) {
        unsafe { outb(port, value) }
    }

    fn read(&mut self, port: u16) -> u8 {
        unsafe { inb(port) }
    }

    fn settle(&mut self) {
        unsafe { io_wait() }
    }
}

#[repr(C, packed)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u32,
}

#[inline(always)]
#[allow(unused_variables)]
pub unsafe fn lidt(pointer: &DescriptorTablePointer) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("lidt [{}]", in(reg) pointer, options(readonly, nostack, preserves_flags));
}

/// Software interrupt used for voluntary rescheduling.
#[inline(always)]
pub fn trigger_reschedule() {
    #[cfg(all(target_arch = "x86", not(test)))]
    unsafe {
        core::arch::asm!("int {vector}", vector = const crate::config::YIELD_VECTOR);
    }

    #[cfg(test)]
    crate::context::testing::raise_yield();
}
