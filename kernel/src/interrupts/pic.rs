// Legacy 8259A Programmable Interrupt Controller pair
//
// The master PIC serves IRQ 0-7 and the slave (cascaded on master IRQ 2)
// serves IRQ 8-15. Out of reset both deliver on vectors that collide with
// CPU exceptions, so `remap` moves them to `offset` and `offset + 8`.
//
// Initialization sequence (per chip):
// - ICW1 0x11: start init, cascade mode, ICW4 follows
// - ICW2: vector offset
// - ICW3: master 0x04 (slave on IRQ2), slave 0x02 (cascade identity)
// - ICW4 0x01: 8086 mode
// - OCW1: every line masked; drivers unmask theirs with `enable_irq`
//
// Acknowledge rules:
// - A vector from the slave needs an EOI on both chips, slave first
// - Vectors outside [offset, offset + 16) are never acknowledged

use crate::arch::{self, PortBus};
use crate::interrupts::manager::InterruptController;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT_WITH_ICW4: u8 = 0x11;
const ICW3_MASTER_HAS_SLAVE_ON_IRQ2: u8 = 0x04;
const ICW3_SLAVE_CASCADE_ID: u8 = 0x02;
const ICW4_8086: u8 = 0x01;
const EOI: u8 = 0x20;

pub const IRQ_LINES: u8 = 16;

pub struct Pic8259<P: PortBus> {
    bus: P,
    offset: u8,
    /// OCW1 masks (master, slave); a set bit masks the line.
    masks: [u8; 2],
}

impl<P: PortBus> Pic8259<P> {
    pub const fn new(bus: P, offset: u8) -> Self {
        Pic8259 { bus, offset, masks: [0xFF, 0xFF] }
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn masks(&self) -> [u8; 2] {
        self.masks
    }

    pub fn bus(&self) -> &P {
        &self.bus
    }

    pub fn remap(&mut self) {
        let icw = [
            (ICW1_INIT_WITH_ICW4, ICW1_INIT_WITH_ICW4),
            (self.offset, self.offset.wrapping_add(8)),
            (ICW3_MASTER_HAS_SLAVE_ON_IRQ2, ICW3_SLAVE_CASCADE_ID),
            (ICW4_8086, ICW4_8086),
        ];

        for (step, (master, slave)) in icw.into_iter().enumerate() {
            let (master_port, slave_port) = if step == 0 {
                (PIC1_CMD, PIC2_CMD)
            } else {
                (PIC1_DATA, PIC2_DATA)
            };
            self.bus.write(master_port, master);
            self.bus.settle();
            self.bus.write(slave_port, slave);
            self.bus.settle();
        }

        self.masks = [0xFF, 0xFF];
        self.write_masks();
    }

    fn write_masks(&mut self) {
        self.bus.write(PIC1_DATA, self.masks[0]);
        self.bus.write(PIC2_DATA, self.masks[1]);
    }

    fn line(irq: u8) -> (usize, u16, u8) {
        if irq < 8 {
            (0, PIC1_DATA, 1 << irq)
        } else {
            (1, PIC2_DATA, 1 << (irq - 8))
        }
    }
}

impl<P: PortBus> InterruptController for Pic8259<P> {
    fn enable_irq(&mut self, irq: u8) {
        if irq >= IRQ_LINES {
            return;
        }
        let (chip, port, bit) = Self::line(irq);
        self.masks[chip] &= !bit;
        self.bus.write(port, self.masks[chip]);
    }

    fn disable_irq(&mut self, irq: u8) {
        if irq >= IRQ_LINES {
            return;
        }
        let (chip, port, bit) = Self::line(irq);
        self.masks[chip] |= bit;
        self.bus.write(port, self.masks[chip]);
    }

    fn handles(&self, vector: u8) -> bool {
        vector >= self.offset && vector < self.offset.saturating_add(IRQ_LINES)
    }

    fn end_of_interrupt(&mut self, vector: u8) {
        if !self.handles(vector) {
            return;
        }
        if vector >= self.offset.saturating_add(8) {
            self.bus.write(PIC2_CMD, EOI);
        }
        self.bus.write(PIC1_CMD, EOI);
    }

    fn activate(&mut self) {
        arch::irq_enable();
    }

    fn deactivate(&mut self) {
        arch::irq_disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::tests::RecordingBus;

    fn pic() -> Pic8259<RecordingBus> {
        let mut pic = Pic8259::new(RecordingBus::default(), 0x20);
        pic.remap();
        pic
    }

    #[test]
    fn remap_sends_the_init_words_to_both_chips() {
        let pic = pic();
        assert_eq!(
            pic.bus().writes,
            [
                (0x20, 0x11),
                (0xA0, 0x11),
                (0x21, 0x20),
                (0xA1, 0x28),
                (0x21, 0x04),
                (0xA1, 0x02),
                (0x21, 0x01),
                (0xA1, 0x01),
                (0x21, 0xFF),
                (0xA1, 0xFF),
            ]
        );
        assert_eq!(pic.masks(), [0xFF, 0xFF]);
    }

    #[test]
    fn masks_follow_enable_and_disable() {
        let mut pic = pic();
        pic.enable_irq(0);
        pic.enable_irq(1);
        pic.enable_irq(12);
        assert_eq!(pic.masks(), [0b1111_1100, 0b1110_1111]);
        assert_eq!(pic.bus().writes.last(), Some(&(0xA1, 0b1110_1111)));

        pic.disable_irq(1);
        assert_eq!(pic.masks(), [0b1111_1110, 0b1110_1111]);
        assert_eq!(pic.bus().writes.last(), Some(&(0x21, 0b1111_1110)));

        pic.enable_irq(200);
        assert_eq!(pic.masks(), [0b1111_1110, 0b1110_1111]);
    }

    #[test]
    fn remap_leaves_every_line_masked_until_enabled() {
        let mut pic = Pic8259::new(RecordingBus::default(), 0x20);
        pic.enable_irq(3);
        pic.remap();
        assert_eq!(pic.masks(), [0xFF, 0xFF]);
        assert_eq!(&pic.bus().writes[pic.bus().writes.len() - 2..], [(0x21, 0xFF), (0xA1, 0xFF)]);
    }

    #[test]
    fn slave_vectors_acknowledge_slave_first() {
        let mut pic = pic();
        let before = pic.bus().writes.len();

        pic.end_of_interrupt(0x2C);
        pic.end_of_interrupt(0x20);
        pic.end_of_interrupt(0x30);

        assert_eq!(&pic.bus().writes[before..], [(0xA0, 0x20), (0x20, 0x20), (0x20, 0x20)]);
    }

    #[test]
    fn only_the_irq_window_is_handled() {
        let pic = pic();
        assert!(!pic.handles(0x1F));
        assert!(pic.handles(0x20));
        assert!(pic.handles(0x2F));
        assert!(!pic.handles(0x30));
    }
}
