//! Guest physical memory using the vm-memory crate.
//!
//! A single anonymous region starting at physical address 0 backs the whole
//! address space. Real-mode software only ever sees the first megabyte
//! (plus the 64 KiB HMA reachable through segment wrap on a 286+):
//!
//! ```text
//! 0x00000 ┌─────────────────┐
//!         │ IVT / BDA       │
//!         │ Conventional RAM│
//! 0xA0000 ├─────────────────┤
//!         │ Video RAM       │
//! 0xC0000 ├─────────────────┤
//!         │ VGA BIOS (ROM)  │ 32 KiB, write-protected
//! 0xC8000 ├─────────────────┤
//!         │ Option ROMs/UMB │
//! 0xF0000 ├─────────────────┤
//!         │ System BIOS(ROM)│ 64 KiB, write-protected
//! 0x100000└─────────────────┘
//! ```
//!
//! Guest writes into a protected range are silently discarded, like writes
//! to a real ROM chip. The host loads ROM images with [`GuestMemory::load`],
//! which bypasses the protection.

use std::ops::Range;

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

/// Bytes addressable in real mode, including the HMA.
pub const REAL_MODE_SPAN: u64 = 0x10_0000 + 0x1_0000;

/// Errors from guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The host could not map the guest region.
    #[error("failed to allocate {size:#x} bytes of guest memory: {reason}")]
    Allocation { size: u64, reason: String },

    /// The access falls outside guest memory.
    #[error("guest memory access at {addr:#x} ({len} bytes) out of range")]
    OutOfRange {
        addr: u64,
        len: usize,
        #[source]
        source: GuestMemoryError,
    },
}

/// Guest physical memory with ROM write protection.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
    rom: Vec<Range<u64>>,
}

impl GuestMemory {
    /// Allocate `size` bytes starting at physical address 0.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = vec![(GuestAddress(0), size as usize)];
        let inner =
            GuestMemoryMmap::from_ranges(&regions).map_err(|e| MemoryError::Allocation {
                size,
                reason: e.to_string(),
            })?;
        Ok(Self {
            inner,
            size,
            rom: Vec::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Mark `range` read-only for the guest.
    pub fn protect(&mut self, range: Range<u64>) {
        if !self.rom.contains(&range) {
            self.rom.push(range);
        }
    }

    pub fn is_rom(&self, addr: u64) -> bool {
        self.rom.iter().any(|r| r.contains(&addr))
    }

    /// Read bytes at `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::OutOfRange {
                addr,
                len: data.len(),
                source,
            })
    }

    /// Host-side write, ignoring ROM protection.
    pub fn load(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::OutOfRange {
                addr,
                len: data.len(),
                source,
            })
    }

    /// Guest write. Bytes landing in ROM are discarded.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let end = addr + data.len() as u64;
        if !self.rom.iter().any(|r| r.start < end && addr < r.end) {
            return self.load(addr, data);
        }
        for (i, byte) in data.iter().enumerate() {
            let at = addr + i as u64;
            if !self.is_rom(at) {
                self.load(at, &[*byte])?;
            }
        }
        Ok(())
    }

    /// Byte read as the CPU sees it: unbacked addresses float high.
    pub fn read_u8(&self, addr: u64) -> u8 {
        self.inner
            .read_obj::<u8>(GuestAddress(addr))
            .unwrap_or(0xFF)
    }

    /// Byte write as the CPU sees it: ROM and unbacked addresses drop it.
    pub fn write_u8(&self, addr: u64, value: u8) {
        if addr < self.size && !self.is_rom(addr) {
            let _ = self.inner.write_obj(value, GuestAddress(addr));
        }
    }

    pub fn read_u16(&self, addr: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr + 1)])
    }

    pub fn write_u16(&self, addr: u64, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(addr, lo);
        self.write_u8(addr + 1, hi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);
        assert_eq!(mem.size(), 4096);
    }

    #[test]
    fn test_word_access_is_little_endian() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u16(100, 0x1234);
        assert_eq!(read_vec(&mem, 100, 2), vec![0x34, 0x12]);
        assert_eq!(mem.read_u16(100), 0x1234);
    }

    #[test]
    fn test_rom_discards_guest_writes() {
        let mut mem = GuestMemory::new(4096).unwrap();
        mem.load(0x100, &[0xAA; 16]).unwrap();
        mem.protect(0x100..0x110);

        mem.write_u8(0x105, 0x00);
        assert_eq!(mem.read_u8(0x105), 0xAA);

        // A write straddling the ROM boundary keeps the RAM part.
        mem.write(0x10E, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0x10E, 4), vec![0xAA, 0xAA, 3, 4]);

        mem.load(0x105, &[0x55]).unwrap();
        assert_eq!(mem.read_u8(0x105), 0x55);
    }

    #[test]
    fn test_out_of_range() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(mem.write(99, &[1, 2]).is_err());
        let mut buf = [0u8; 2];
        assert!(matches!(
            mem.read(99, &mut buf),
            Err(MemoryError::OutOfRange { addr: 99, len: 2, .. })
        ));
        assert_eq!(mem.read_u8(500), 0xFF);
        mem.write_u8(500, 1);
    }
}
