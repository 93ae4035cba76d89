// x86 Multiboot v1 Boot Entry and Bootloader Handoff
//
// This module is the sole owner of the Multiboot ABI surface. It carries
// the header the bootloader scans for, a boot stack, and the `_start`
// symbol the bootloader jumps to in 32-bit protected mode with paging off.
// It builds a neutral `BootParams` and then transfers control to `kmain`.
//
// Register contract at `_start`:
// - eax holds the bootloader magic (0x2BADB002)
// - ebx holds the physical address of the information block
// - interrupts are disabled, segments are flat, no usable stack

use spin::Once;

use crate::boot::{BootParams, MultibootInfo};

extern "C" {
    static kernel_start: u8;
    static kernel_end: u8;
}

static BOOT_PARAMS: Once<BootParams> = Once::new();

core::arch::global_asm!(
    r#"
.section .multiboot, "a"
.balign 4
    .long 0x1BADB002
    .long 0x00000003
    .long -(0x1BADB002 + 0x00000003)

.section .bss
.balign 16
boot_stack_bottom:
    .skip 65536
boot_stack_top:

.section .text
.global _start
_start:
    cli
    mov esp, offset boot_stack_top
    xor ebp, ebp
    push ebx
    push eax
    call multiboot_entry
2:
    hlt
    jmp 2b
"#
);

#[no_mangle]
extern "C" fn multiboot_entry(magic: u32, info: *const MultibootInfo) -> ! {
    let (start, end) = unsafe {
        (
            core::ptr::addr_of!(kernel_start) as usize,
            core::ptr::addr_of!(kernel_end) as usize,
        )
    };

    let params = BOOT_PARAMS.call_once(|| unsafe { BootParams::from_multiboot(magic, info, start, end) });

    crate::kmain(params)
}
