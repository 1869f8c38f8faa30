//! BIOS ROM images.
//!
//! ROM images are opaque blobs validated only by size. A rejected image
//! leaves the previously installed one in place.

use std::fmt::Write as _;

use thiserror::Error;

/// Size of the system BIOS image.
pub const SYSTEM_BIOS_SIZE: usize = 0x1_0000;
/// Physical address of the system BIOS.
pub const SYSTEM_BIOS_BASE: u64 = 0xF_0000;
/// Size of the VGA BIOS image.
pub const VGA_BIOS_SIZE: usize = 0x8000;
/// Physical address of the VGA BIOS.
pub const VGA_BIOS_BASE: u64 = 0xC_0000;

/// Errors installing ROM images.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RomError {
    /// The image does not have the exact size of the ROM socket.
    #[error("ROM image is {actual} bytes, expected exactly {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// The machine's ROM sockets.
pub struct Bios {
    system: Vec<u8>,
    vga: Vec<u8>,
}

impl Bios {
    /// Both sockets filled with 0xFF, like an erased EPROM.
    pub fn new() -> Self {
        Self {
            system: vec![0xFF; SYSTEM_BIOS_SIZE],
            vga: vec![0xFF; VGA_BIOS_SIZE],
        }
    }

    fn install(slot: &mut Vec<u8>, expected: usize, image: &[u8]) -> Result<(), RomError> {
        if image.len() != expected {
            return Err(RomError::SizeMismatch {
                expected,
                actual: image.len(),
            });
        }
        slot.copy_from_slice(image);
        Ok(())
    }

    pub fn set_system_bios(&mut self, image: &[u8]) -> Result<(), RomError> {
        Self::install(&mut self.system, SYSTEM_BIOS_SIZE, image)
    }

    pub fn set_vga_bios(&mut self, image: &[u8]) -> Result<(), RomError> {
        Self::install(&mut self.vga, VGA_BIOS_SIZE, image)
    }

    pub fn system_bios(&self) -> &[u8] {
        &self.system
    }

    pub fn vga_bios(&self) -> &[u8] {
        &self.vga
    }
}

impl Default for Bios {
    fn default() -> Self {
        Self::new()
    }
}

/// Render `bytes` as a classic hex dump, 16 bytes per line, with addresses
/// starting at `base`.
///
/// ```text
/// 000f0000  ea 5b e0 00 f0 30 31 2f  30 31 2f 39 32 00 fc 00  |.[...01/01/92...|
/// ```
pub fn hex_dump(bytes: &[u8], base: u64) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 16);
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", base + (i as u64) * 16);
        for col in 0..16 {
            if col == 8 {
                out.push(' ');
            }
            match chunk.get(col) {
                Some(b) => {
                    let _ = write!(out, " {b:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}
