//! Register file and named register access.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// FLAGS register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const CF = 1 << 0;
        /// Always reads as 1.
        const RESERVED = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

impl Flags {
    /// Status flags written by arithmetic instructions.
    pub const ARITH: Flags = Flags::CF
        .union(Flags::PF)
        .union(Flags::AF)
        .union(Flags::ZF)
        .union(Flags::SF)
        .union(Flags::OF);

    /// Bits 12..15 are hard-wired to 1 on the 8086/80186.
    pub const HIGH_NIBBLE: u16 = 0xF000;

    /// Value as stored on the stack by PUSHF or an interrupt.
    pub fn image(self) -> u16 {
        self.bits() | Self::HIGH_NIBBLE
    }

    /// Load from a stack image (POPF, IRET).
    pub fn from_image(value: u16) -> Self {
        Flags::from_bits_truncate(value) | Flags::RESERVED
    }
}

/// Errors from named register access.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterError {
    /// No register has this name.
    #[error("unknown register {0:?}")]
    Unknown(String),

    /// The register can be read but not written.
    #[error("register {0} is read-only")]
    ReadOnly(&'static str),

    /// The value does not have the register's width.
    #[error("register {name} is {expected} bytes wide, got {actual}")]
    WidthMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

// General register indices, in ModR/M encoding order.
pub const AX: u8 = 0;
pub const CX: u8 = 1;
pub const DX: u8 = 2;
pub const BX: u8 = 3;
pub const SP: u8 = 4;
pub const BP: u8 = 5;
pub const SI: u8 = 6;
pub const DI: u8 = 7;

/// Segment registers, in ModR/M encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
}

impl Seg {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Seg::Es),
            1 => Some(Seg::Cs),
            2 => Some(Seg::Ss),
            3 => Some(Seg::Ds),
            _ => None,
        }
    }
}

/// Architectural register state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    gpr: [u32; 8],
    seg: [u16; 4],
    pub ip: u16,
    pub flags: Flags,
}

impl Registers {
    /// Power-on state: execution starts at FFFF:0000.
    pub fn new() -> Self {
        let mut regs = Self {
            gpr: [0; 8],
            seg: [0; 4],
            ip: 0,
            flags: Flags::RESERVED,
        };
        regs.seg[Seg::Cs as usize] = 0xFFFF;
        regs
    }

    pub fn reg32(&self, r: u8) -> u32 {
        self.gpr[usize::from(r & 7)]
    }

    pub fn set_reg32(&mut self, r: u8, value: u32) {
        self.gpr[usize::from(r & 7)] = value;
    }

    pub fn reg16(&self, r: u8) -> u16 {
        self.gpr[usize::from(r & 7)] as u16
    }

    pub fn set_reg16(&mut self, r: u8, value: u16) {
        let slot = &mut self.gpr[usize::from(r & 7)];
        *slot = (*slot & 0xFFFF_0000) | u32::from(value);
    }

    /// AL, CL, DL, BL, AH, CH, DH, BH for 0..8.
    pub fn reg8(&self, r: u8) -> u8 {
        let r = r & 7;
        let word = self.gpr[usize::from(r & 3)];
        if r < 4 {
            word as u8
        } else {
            (word >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, r: u8, value: u8) {
        let r = r & 7;
        let slot = &mut self.gpr[usize::from(r & 3)];
        if r < 4 {
            *slot = (*slot & !0xFF) | u32::from(value);
        } else {
            *slot = (*slot & !0xFF00) | (u32::from(value) << 8);
        }
    }

    pub fn seg(&self, s: Seg) -> u16 {
        self.seg[s as usize]
    }

    pub fn set_seg(&mut self, s: Seg, value: u16) {
        self.seg[s as usize] = value;
    }

    /// Physical address of CS:IP.
    pub fn pc(&self) -> u32 {
        ((u32::from(self.seg(Seg::Cs)) << 4) + u32::from(self.ip)) & 0xF_FFFF
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

/// Something reachable by register name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegisterRef {
    Gpr32(u8),
    Gpr16(u8),
    Gpr8(u8),
    Segment(Seg),
    Ip,
    Flags,
    InstructionCount,
}

impl RegisterRef {
    pub(crate) fn width(self) -> usize {
        match self {
            RegisterRef::Gpr32(_) => 4,
            RegisterRef::Gpr16(_) | RegisterRef::Segment(_) | RegisterRef::Ip | RegisterRef::Flags => 2,
            RegisterRef::Gpr8(_) => 1,
            RegisterRef::InstructionCount => 8,
        }
    }
}

const NAMES: &[(&str, RegisterRef)] = &[
    ("eax", RegisterRef::Gpr32(AX)),
    ("ecx", RegisterRef::Gpr32(CX)),
    ("edx", RegisterRef::Gpr32(DX)),
    ("ebx", RegisterRef::Gpr32(BX)),
    ("esp", RegisterRef::Gpr32(SP)),
    ("ebp", RegisterRef::Gpr32(BP)),
    ("esi", RegisterRef::Gpr32(SI)),
    ("edi", RegisterRef::Gpr32(DI)),
    ("ax", RegisterRef::Gpr16(AX)),
    ("cx", RegisterRef::Gpr16(CX)),
    ("dx", RegisterRef::Gpr16(DX)),
    ("bx", RegisterRef::Gpr16(BX)),
    ("sp", RegisterRef::Gpr16(SP)),
    ("bp", RegisterRef::Gpr16(BP)),
    ("si", RegisterRef::Gpr16(SI)),
    ("di", RegisterRef::Gpr16(DI)),
    ("al", RegisterRef::Gpr8(0)),
    ("cl", RegisterRef::Gpr8(1)),
    ("dl", RegisterRef::Gpr8(2)),
    ("bl", RegisterRef::Gpr8(3)),
    ("ah", RegisterRef::Gpr8(4)),
    ("ch", RegisterRef::Gpr8(5)),
    ("dh", RegisterRef::Gpr8(6)),
    ("bh", RegisterRef::Gpr8(7)),
    ("es", RegisterRef::Segment(Seg::Es)),
    ("cs", RegisterRef::Segment(Seg::Cs)),
    ("ss", RegisterRef::Segment(Seg::Ss)),
    ("ds", RegisterRef::Segment(Seg::Ds)),
    ("ip", RegisterRef::Ip),
    ("flags", RegisterRef::Flags),
    ("icount", RegisterRef::InstructionCount),
];

/// Resolve a register name (case-insensitive).
pub(crate) fn lookup(name: &str) -> Result<(&'static str, RegisterRef), RegisterError> {
    NAMES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .copied()
        .ok_or_else(|| RegisterError::Unknown(name.to_string()))
}

/// Every register name, in dump order.
pub fn register_names() -> impl Iterator<Item = &'static str> {
    NAMES.iter().map(|(n, _)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_views_alias_words() {
        let mut regs = Registers::new();
        regs.set_reg16(BX, 0x1234);
        assert_eq!(regs.reg8(3), 0x34);
        assert_eq!(regs.reg8(7), 0x12);

        regs.set_reg8(7, 0xAB);
        assert_eq!(regs.reg16(BX), 0xAB34);

        regs.set_reg32(BX, 0xDEAD_0000);
        regs.set_reg16(BX, 0xBEEF);
        assert_eq!(regs.reg32(BX), 0xDEAD_BEEF);
    }

    #[test]
    fn test_power_on_entry_point() {
        let regs = Registers::new();
        assert_eq!(regs.pc(), 0xFFFF0);
        assert_eq!(regs.flags, Flags::RESERVED);
    }

    #[test]
    fn test_flags_image() {
        let flags = Flags::from_image(0x0000);
        assert_eq!(flags, Flags::RESERVED);
        assert_eq!(flags.image(), 0xF002);
        assert!(Flags::from_image(0x0200).contains(Flags::IF));
    }

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("AX").unwrap().1, RegisterRef::Gpr16(AX));
        assert_eq!(lookup("icount").unwrap().1.width(), 8);
        assert_eq!(
            lookup("r8"),
            Err(RegisterError::Unknown("r8".to_string()))
        );
    }
}
