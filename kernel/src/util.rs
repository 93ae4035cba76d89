// Kernel Utilities
//
// Provides common helpers used across the kernel.
//
// Key features:
// - Interrupt-safe critical sections
// - Power-of-two alignment helpers

use crate::arch;

/// Runs `f` with interrupts disabled, restoring the previous IF state.
#[inline(always)]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let were_enabled = arch::interrupts_enabled();

    arch::irq_disable();

    let result = f();

    if were_enabled {
        arch::irq_enable();
    }

    result
}

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Copies `name` into a fixed buffer, truncating at a char boundary.
pub fn bounded_name(name: &str, max: usize) -> alloc::string::String {
    if name.len() <= max {
        return alloc::string::String::from(name);
    }

    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    alloc::string::String::from(&name[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn names_are_truncated_on_char_boundaries() {
        assert_eq!(bounded_name("worker", 32), "worker");
        assert_eq!(bounded_name("abcdef", 3), "abc");
        assert_eq!(bounded_name("aé", 2), "a");
    }

    #[test]
    fn critical_section_returns_closure_value() {
        assert_eq!(without_interrupts(|| 41 + 1), 42);
    }
}
