//! Eager flag computation for arithmetic and logic instructions.
//!
//! Every helper returns the result together with the full set of status
//! flags it defines; the executor merges them into FLAGS.

use super::regs::Flags;

/// Operand width of an ALU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    pub fn from_w_bit(opcode: u8) -> Self {
        if opcode & 1 == 0 {
            Width::Byte
        } else {
            Width::Word
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
        }
    }

    pub fn sign(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extend a value of this width to 32 bits.
    pub fn sext(self, value: u32) -> i32 {
        match self {
            Width::Byte => i32::from(value as u8 as i8),
            Width::Word => i32::from(value as u16 as i16),
        }
    }
}

/// ZF, SF and PF for a result.
pub fn szp(result: u32, w: Width) -> Flags {
    let res = result & w.mask();
    let mut f = Flags::empty();
    if res == 0 {
        f |= Flags::ZF;
    }
    if res & w.sign() != 0 {
        f |= Flags::SF;
    }
    if (res as u8).count_ones() % 2 == 0 {
        f |= Flags::PF;
    }
    f
}

pub fn add(a: u32, b: u32, carry: bool, w: Width) -> (u32, Flags) {
    let wide = (a & w.mask()) + (b & w.mask()) + u32::from(carry);
    let res = wide & w.mask();
    let mut f = szp(res, w);
    if wide > w.mask() {
        f |= Flags::CF;
    }
    if (a ^ b ^ res) & 0x10 != 0 {
        f |= Flags::AF;
    }
    if (!(a ^ b) & (a ^ res)) & w.sign() != 0 {
        f |= Flags::OF;
    }
    (res, f)
}

pub fn sub(a: u32, b: u32, borrow: bool, w: Width) -> (u32, Flags) {
    let (a, b) = (a & w.mask(), b & w.mask());
    let res = a.wrapping_sub(b).wrapping_sub(u32::from(borrow)) & w.mask();
    let mut f = szp(res, w);
    if a < b + u32::from(borrow) {
        f |= Flags::CF;
    }
    if (a ^ b ^ res) & 0x10 != 0 {
        f |= Flags::AF;
    }
    if ((a ^ b) & (a ^ res)) & w.sign() != 0 {
        f |= Flags::OF;
    }
    (res, f)
}

/// AND/OR/XOR/TEST: CF and OF cleared.
pub fn logic(result: u32, w: Width) -> (u32, Flags) {
    let res = result & w.mask();
    (res, szp(res, w))
}

/// INC: CF is not part of the returned set.
pub fn inc(a: u32, w: Width) -> (u32, Flags) {
    let (res, f) = add(a, 1, false, w);
    (res, f - Flags::CF)
}

/// DEC: CF is not part of the returned set.
pub fn dec(a: u32, w: Width) -> (u32, Flags) {
    let (res, f) = sub(a, 1, false, w);
    (res, f - Flags::CF)
}

/// Evaluate a Jcc condition code (low nibble of the opcode).
pub fn condition(cc: u8, flags: Flags) -> bool {
    let sf_ne_of = flags.contains(Flags::SF) != flags.contains(Flags::OF);
    let taken = match cc & 0x0E {
        0x00 => flags.contains(Flags::OF),
        0x02 => flags.contains(Flags::CF),
        0x04 => flags.contains(Flags::ZF),
        0x06 => flags.intersects(Flags::CF | Flags::ZF),
        0x08 => flags.contains(Flags::SF),
        0x0A => flags.contains(Flags::PF),
        0x0C => sf_ne_of,
        _ => flags.contains(Flags::ZF) || sf_ne_of,
    };
    if cc & 1 != 0 {
        !taken
    } else {
        taken
    }
}

/// Shift and rotate group (`/0`..`/7`). `count` is already masked.
///
/// Returns `None` when the count is zero: nothing changes. Otherwise the
/// returned flags replace CF and OF; for the shifts (not rotates) they also
/// carry ZF, SF and PF. The `bool` says which set applies.
pub fn shift(op: u8, value: u32, count: u32, cf_in: bool, w: Width) -> Option<(u32, Flags, bool)> {
    if count == 0 {
        return None;
    }
    let mask = w.mask();
    let sign = w.sign();
    let bits = w.bits();
    let mut v = value & mask;
    let mut cf = cf_in;
    let mut is_shift = true;
    let of;
    match op & 7 {
        // ROL
        0 => {
            is_shift = false;
            for _ in 0..count {
                let top = v & sign != 0;
                v = ((v << 1) | u32::from(top)) & mask;
                cf = top;
            }
            of = (v & sign != 0) != cf;
        }
        // ROR
        1 => {
            is_shift = false;
            for _ in 0..count {
                let low = v & 1 != 0;
                v = (v >> 1) | if low { sign } else { 0 };
                cf = low;
            }
            of = (v & sign != 0) != (v & (sign >> 1) != 0);
        }
        // RCL
        2 => {
            is_shift = false;
            for _ in 0..count {
                let top = v & sign != 0;
                v = ((v << 1) | u32::from(cf)) & mask;
                cf = top;
            }
            of = (v & sign != 0) != cf;
        }
        // RCR
        3 => {
            is_shift = false;
            for _ in 0..count {
                let low = v & 1 != 0;
                v = (v >> 1) | if cf { sign } else { 0 };
                cf = low;
            }
            of = (v & sign != 0) != (v & (sign >> 1) != 0);
        }
        // SHL / SAL
        4 | 6 => {
            cf = count <= bits && (v << (count - 1)) & sign != 0;
            v = if count >= bits { 0 } else { (v << count) & mask };
            of = (v & sign != 0) != cf;
        }
        // SHR
        5 => {
            of = v & sign != 0;
            cf = count <= bits && (v >> (count - 1)) & 1 != 0;
            v = if count >= bits { 0 } else { v >> count };
        }
        // SAR
        _ => {
            let s = w.sext(v);
            let n = count.min(bits);
            cf = (s >> (n - 1)) & 1 != 0;
            v = ((s >> n) as u32) & mask;
            of = false;
        }
    }
    let mut f = if is_shift { szp(v, w) } else { Flags::empty() };
    if cf {
        f |= Flags::CF;
    }
    if of {
        f |= Flags::OF;
    }
    Some((v, f, is_shift))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_flags() {
        let (res, f) = add(0xFF, 0x01, false, Width::Byte);
        assert_eq!(res, 0);
        assert!(f.contains(Flags::CF | Flags::ZF | Flags::AF | Flags::PF));
        assert!(!f.contains(Flags::OF));

        let (res, f) = add(0x7FFF, 1, false, Width::Word);
        assert_eq!(res, 0x8000);
        assert!(f.contains(Flags::OF | Flags::SF));
        assert!(!f.contains(Flags::CF));
    }

    #[test]
    fn test_sub_borrow() {
        let (res, f) = sub(0x00, 0x01, false, Width::Byte);
        assert_eq!(res, 0xFF);
        assert!(f.contains(Flags::CF | Flags::SF));

        let (res, f) = sub(0x10, 0x0F, true, Width::Byte);
        assert_eq!(res, 0);
        assert!(f.contains(Flags::ZF));
        assert!(!f.contains(Flags::CF));

        let (_, f) = sub(0x8000, 1, false, Width::Word);
        assert!(f.contains(Flags::OF));
    }

    #[test]
    fn test_inc_dec_leave_carry_alone() {
        let (res, f) = inc(0xFFFF, Width::Word);
        assert_eq!(res, 0);
        assert!(f.contains(Flags::ZF));
        assert!(!f.contains(Flags::CF));

        let (res, f) = dec(0x80, Width::Byte);
        assert_eq!(res, 0x7F);
        assert!(f.contains(Flags::OF));
    }

    #[test]
    fn test_conditions() {
        assert!(condition(0x4, Flags::ZF));
        assert!(condition(0x5, Flags::empty()));
        assert!(condition(0xC, Flags::SF));
        assert!(!condition(0xC, Flags::SF | Flags::OF));
        assert!(condition(0xE, Flags::ZF));
        assert!(condition(0x7, Flags::empty()));
    }

    #[test]
    fn test_shifts() {
        let (v, f, _) = shift(4, 0x81, 1, false, Width::Byte).unwrap();
        assert_eq!(v, 0x02);
        assert!(f.contains(Flags::CF | Flags::OF));

        let (v, f, _) = shift(5, 0x03, 1, false, Width::Byte).unwrap();
        assert_eq!(v, 0x01);
        assert!(f.contains(Flags::CF));

        let (v, _, _) = shift(7, 0x8000, 4, false, Width::Word).unwrap();
        assert_eq!(v, 0xF800);

        let (v, f, is_shift) = shift(0, 0x80, 1, false, Width::Byte).unwrap();
        assert_eq!(v, 0x01);
        assert!(f.contains(Flags::CF));
        assert!(!is_shift);

        let (v, f, _) = shift(3, 0x01, 1, true, Width::Byte).unwrap();
        assert_eq!(v, 0x80);
        assert!(f.contains(Flags::CF));

        assert!(shift(4, 0x12, 0, false, Width::Byte).is_none());
    }
}
