//! Raw block-device contract consumed by filesystem collaborators.
//!
//! Drivers implement [`BlockDevice::read_sectors`]; the core only provides
//! the chunking helper on top of it.

#![allow(dead_code)]

pub const SECTOR_SIZE: usize = 512;

/// Most sectors a single `read_sectors` call can transfer.
pub const MAX_SECTORS_PER_READ: usize = u8::MAX as usize;

pub trait BlockDevice: Send {
    /// Reads `count` sectors starting at `lba` into `buf`, which holds at
    /// least `count * SECTOR_SIZE` bytes. Returns false on device error.
    fn read_sectors(&mut self, lba: u32, count: u8, buf: &mut [u8]) -> bool;

    /// Fills `buf` (a whole number of sectors) starting at `lba`, split
    /// into transfers the device accepts.
    fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> bool {
        if buf.len() % SECTOR_SIZE != 0 {
            return false;
        }

        let mut lba = lba;
        for chunk in buf.chunks_mut(MAX_SECTORS_PER_READ * SECTOR_SIZE) {
            let count = (chunk.len() / SECTOR_SIZE) as u8;
            if !self.read_sectors(lba, count, chunk) {
                return false;
            }
            lba = match lba.checked_add(count as u32) {
                Some(next) => next,
                None => return false,
            };
        }
        true
    }
}
