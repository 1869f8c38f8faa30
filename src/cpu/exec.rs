//! Instruction decoder and executor.
//!
//! One call to [`execute`] consumes the prefixes and the opcode at CS:IP and
//! carries the instruction out against the host. The decoder is a plain
//! `match` on the opcode byte; group opcodes dispatch on the ModR/M `reg`
//! field.
//!
//! Repeated string instructions run one element per call and rewind IP to
//! the prefix while CX is non-zero, so interrupts and clock pulses land
//! between iterations as on real hardware.

use tracing::warn;

use super::alu::{self, Width};
use super::regs::{Flags, Seg, AX, BP, BX, CX, DI, DX, SI, SP};
use super::{linear, Cpu, CpuHost};
use crate::io::PortWidth;

/// What the run loop should do after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    Continue,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rep {
    /// F3: REP / REPE
    Equal,
    /// F2: REPNE
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Reg(u8),
    Mem { seg: Seg, off: u16 },
}

#[derive(Debug, Clone, Copy)]
struct ModRm {
    reg: u8,
    rm: Operand,
}

/// Upper bound on prefix bytes before the instruction is rejected.
const MAX_PREFIXES: usize = 14;

struct Exec<'a, H: CpuHost + ?Sized> {
    cpu: &'a mut Cpu,
    host: &'a mut H,
    start_ip: u16,
    seg_override: Option<Seg>,
    rep: Option<Rep>,
    op32: bool,
}

/// Execute the instruction at CS:IP.
pub(super) fn execute<H: CpuHost + ?Sized>(cpu: &mut Cpu, host: &mut H) -> Outcome {
    let start_ip = cpu.regs.ip;
    let mut ex = Exec {
        cpu,
        host,
        start_ip,
        seg_override: None,
        rep: None,
        op32: false,
    };
    ex.run()
}

impl<H: CpuHost + ?Sized> Exec<'_, H> {
    fn run(&mut self) -> Outcome {
        let mut prefixes = 0;
        let opcode = loop {
            let byte = self.fetch8();
            match byte {
                0x26 => self.seg_override = Some(Seg::Es),
                0x2E => self.seg_override = Some(Seg::Cs),
                0x36 => self.seg_override = Some(Seg::Ss),
                0x3E => self.seg_override = Some(Seg::Ds),
                0xF0 => {}
                0xF2 => self.rep = Some(Rep::NotEqual),
                0xF3 => self.rep = Some(Rep::Equal),
                0x66 => self.op32 = true,
                _ => break byte,
            }
            prefixes += 1;
            if prefixes > MAX_PREFIXES {
                return self.undefined(byte);
            }
        };
        self.dispatch(opcode)
    }

    // ── Memory and fetch ──

    fn fetch8(&mut self) -> u8 {
        let regs = &mut self.cpu.regs;
        let byte = self
            .host
            .memory()
            .read_u8(linear(regs.seg(Seg::Cs), regs.ip));
        regs.ip = regs.ip.wrapping_add(1);
        byte
    }

    fn fetch16(&mut self) -> u16 {
        let lo = self.fetch8();
        let hi = self.fetch8();
        u16::from_le_bytes([lo, hi])
    }

    fn fetch(&mut self, w: Width) -> u32 {
        match w {
            Width::Byte => u32::from(self.fetch8()),
            Width::Word => u32::from(self.fetch16()),
        }
    }

    fn read8(&self, seg: Seg, off: u16) -> u8 {
        self.host
            .memory()
            .read_u8(linear(self.cpu.regs.seg(seg), off))
    }

    fn read16(&self, seg: Seg, off: u16) -> u16 {
        u16::from_le_bytes([self.read8(seg, off), self.read8(seg, off.wrapping_add(1))])
    }

    fn write8(&mut self, seg: Seg, off: u16, value: u8) {
        let addr = linear(self.cpu.regs.seg(seg), off);
        self.host.memory().write_u8(addr, value);
    }

    fn write16(&mut self, seg: Seg, off: u16, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write8(seg, off, lo);
        self.write8(seg, off.wrapping_add(1), hi);
    }

    fn push(&mut self, value: u16) {
        self.cpu.push16(self.host.memory(), value);
    }

    fn pop(&mut self) -> u16 {
        self.cpu.pop16(self.host.memory())
    }

    fn data_seg(&self) -> Seg {
        self.seg_override.unwrap_or(Seg::Ds)
    }

    // ── Operand decoding ──

    fn modrm(&mut self) -> ModRm {
        let byte = self.fetch8();
        let md = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;
        if md == 3 {
            return ModRm {
                reg,
                rm: Operand::Reg(rm),
            };
        }
        let r = &self.cpu.regs;
        let (base, default_seg) = match rm {
            0 => (r.reg16(BX).wrapping_add(r.reg16(SI)), Seg::Ds),
            1 => (r.reg16(BX).wrapping_add(r.reg16(DI)), Seg::Ds),
            2 => (r.reg16(BP).wrapping_add(r.reg16(SI)), Seg::Ss),
            3 => (r.reg16(BP).wrapping_add(r.reg16(DI)), Seg::Ss),
            4 => (r.reg16(SI), Seg::Ds),
            5 => (r.reg16(DI), Seg::Ds),
            6 if md == 0 => (0, Seg::Ds),
            6 => (r.reg16(BP), Seg::Ss),
            _ => (r.reg16(BX), Seg::Ds),
        };
        let disp = match (md, rm) {
            (0, 6) => self.fetch16(),
            (0, _) => 0,
            (1, _) => self.fetch8() as i8 as u16,
            _ => self.fetch16(),
        };
        ModRm {
            reg,
            rm: Operand::Mem {
                seg: self.seg_override.unwrap_or(default_seg),
                off: base.wrapping_add(disp),
            },
        }
    }

    fn get(&self, op: Operand, w: Width) -> u32 {
        match (op, w) {
            (Operand::Reg(r), Width::Byte) => u32::from(self.cpu.regs.reg8(r)),
            (Operand::Reg(r), Width::Word) => u32::from(self.cpu.regs.reg16(r)),
            (Operand::Mem { seg, off }, Width::Byte) => u32::from(self.read8(seg, off)),
            (Operand::Mem { seg, off }, Width::Word) => u32::from(self.read16(seg, off)),
        }
    }

    fn set(&mut self, op: Operand, w: Width, value: u32) {
        match (op, w) {
            (Operand::Reg(r), Width::Byte) => self.cpu.regs.set_reg8(r, value as u8),
            (Operand::Reg(r), Width::Word) => self.cpu.regs.set_reg16(r, value as u16),
            (Operand::Mem { seg, off }, Width::Byte) => self.write8(seg, off, value as u8),
            (Operand::Mem { seg, off }, Width::Word) => self.write16(seg, off, value as u16),
        }
    }

    fn reg_get(&self, r: u8, w: Width) -> u32 {
        self.get(Operand::Reg(r), w)
    }

    fn reg_set(&mut self, r: u8, w: Width, value: u32) {
        self.set(Operand::Reg(r), w, value);
    }

    // ── Flags ──

    fn flag(&self, f: Flags) -> bool {
        self.cpu.regs.flags.contains(f)
    }

    fn set_flag(&mut self, f: Flags, on: bool) {
        self.cpu.regs.flags.set(f, on);
    }

    /// Replace the flags in `mask` with those in `new`.
    fn merge_flags(&mut self, mask: Flags, new: Flags) {
        let flags = &mut self.cpu.regs.flags;
        *flags = (*flags - mask) | (new & mask);
    }

    // ── Control transfer helpers ──

    fn jump_rel(&mut self, disp: i16) {
        self.cpu.regs.ip = self.cpu.regs.ip.wrapping_add(disp as u16);
    }

    fn far_jump(&mut self, seg: u16, off: u16) {
        self.cpu.regs.set_seg(Seg::Cs, seg);
        self.cpu.regs.ip = off;
    }

    fn interrupt(&mut self, vector: u8) {
        self.cpu.deliver_interrupt(self.host.memory(), vector);
    }

    /// Fault: restart point is the faulting instruction.
    fn fault(&mut self, vector: u8) -> Outcome {
        self.cpu.regs.ip = self.start_ip;
        self.interrupt(vector);
        Outcome::Continue
    }

    fn undefined(&mut self, opcode: u8) -> Outcome {
        warn!(
            "cpu: undefined opcode {:#04x} at {:04x}:{:04x}",
            opcode,
            self.cpu.regs.seg(Seg::Cs),
            self.start_ip
        );
        self.fault(6)
    }

    // ── ALU ──

    /// ADD, OR, ADC, SBB, AND, SUB, XOR, CMP. Returns `None` for CMP.
    fn alu(&mut self, op: u8, a: u32, b: u32, w: Width) -> Option<u32> {
        let cf = self.flag(Flags::CF);
        let (res, f) = match op & 7 {
            0 => alu::add(a, b, false, w),
            1 => alu::logic(a | b, w),
            2 => alu::add(a, b, cf, w),
            3 => alu::sub(a, b, cf, w),
            4 => alu::logic(a & b, w),
            5 | 7 => alu::sub(a, b, false, w),
            _ => alu::logic(a ^ b, w),
        };
        self.merge_flags(Flags::ARITH, f);
        (op & 7 != 7).then_some(res)
    }

    fn alu_block(&mut self, opcode: u8) {
        let op = opcode >> 3;
        let w = Width::from_w_bit(opcode);
        match opcode & 7 {
            0 | 1 => {
                let m = self.modrm();
                let a = self.get(m.rm, w);
                let b = self.reg_get(m.reg, w);
                if let Some(res) = self.alu(op, a, b, w) {
                    self.set(m.rm, w, res);
                }
            }
            2 | 3 => {
                let m = self.modrm();
                let a = self.reg_get(m.reg, w);
                let b = self.get(m.rm, w);
                if let Some(res) = self.alu(op, a, b, w) {
                    self.reg_set(m.reg, w, res);
                }
            }
            _ => {
                let a = self.reg_get(AX, w);
                let b = self.fetch(w);
                if let Some(res) = self.alu(op, a, b, w) {
                    self.reg_set(AX, w, res);
                }
            }
        }
    }

    fn shift_group(&mut self, m: ModRm, w: Width, count: u32) {
        let value = self.get(m.rm, w);
        let cf = self.flag(Flags::CF);
        if let Some((res, f, is_shift)) = alu::shift(m.reg, value, count & 0x1F, cf, w) {
            self.set(m.rm, w, res);
            let mask = if is_shift {
                Flags::ARITH
            } else {
                Flags::CF | Flags::OF
            };
            self.merge_flags(mask, f);
        }
    }

    // ── Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV ──

    fn group3(&mut self, opcode: u8) -> Outcome {
        let w = Width::from_w_bit(opcode);
        let m = self.modrm();
        let v = self.get(m.rm, w);
        match m.reg {
            0 | 1 => {
                let imm = self.fetch(w);
                let (_, f) = alu::logic(v & imm, w);
                self.merge_flags(Flags::ARITH, f);
            }
            2 => self.set(m.rm, w, !v & w.mask()),
            3 => {
                let (res, f) = alu::sub(0, v, false, w);
                self.set(m.rm, w, res);
                self.merge_flags(Flags::ARITH, f);
            }
            4 => {
                let wide = match w {
                    Width::Byte => {
                        let p = u32::from(self.cpu.regs.reg8(0)) * v;
                        self.cpu.regs.set_reg16(AX, p as u16);
                        p > 0xFF
                    }
                    Width::Word => {
                        let p = u32::from(self.cpu.regs.reg16(AX)) * v;
                        self.cpu.regs.set_reg16(AX, p as u16);
                        self.cpu.regs.set_reg16(DX, (p >> 16) as u16);
                        p > 0xFFFF
                    }
                };
                self.set_flag(Flags::CF, wide);
                self.set_flag(Flags::OF, wide);
            }
            5 => {
                let wide = match w {
                    Width::Byte => {
                        let p = i32::from(self.cpu.regs.reg8(0) as i8) * w.sext(v);
                        self.cpu.regs.set_reg16(AX, p as u16);
                        p != i32::from(p as i8)
                    }
                    Width::Word => {
                        let p = i32::from(self.cpu.regs.reg16(AX) as i16) * w.sext(v);
                        self.cpu.regs.set_reg16(AX, p as u16);
                        self.cpu.regs.set_reg16(DX, (p >> 16) as u16);
                        p != i32::from(p as i16)
                    }
                };
                self.set_flag(Flags::CF, wide);
                self.set_flag(Flags::OF, wide);
            }
            6 => {
                if v == 0 {
                    return self.fault(0);
                }
                match w {
                    Width::Byte => {
                        let n = u32::from(self.cpu.regs.reg16(AX));
                        let q = n / v;
                        if q > 0xFF {
                            return self.fault(0);
                        }
                        self.cpu.regs.set_reg8(0, q as u8);
                        self.cpu.regs.set_reg8(4, (n % v) as u8);
                    }
                    Width::Word => {
                        let n = (u32::from(self.cpu.regs.reg16(DX)) << 16)
                            | u32::from(self.cpu.regs.reg16(AX));
                        let q = n / v;
                        if q > 0xFFFF {
                            return self.fault(0);
                        }
                        self.cpu.regs.set_reg16(AX, q as u16);
                        self.cpu.regs.set_reg16(DX, (n % v) as u16);
                    }
                }
            }
            _ => {
                let d = i64::from(w.sext(v));
                if d == 0 {
                    return self.fault(0);
                }
                match w {
                    Width::Byte => {
                        let n = i64::from(self.cpu.regs.reg16(AX) as i16);
                        let (q, r) = (n / d, n % d);
                        if q != i64::from(q as i8) {
                            return self.fault(0);
                        }
                        self.cpu.regs.set_reg8(0, q as u8);
                        self.cpu.regs.set_reg8(4, r as u8);
                    }
                    Width::Word => {
                        let n = i64::from(
                            ((u32::from(self.cpu.regs.reg16(DX)) << 16)
                                | u32::from(self.cpu.regs.reg16(AX))) as i32,
                        );
                        let (q, r) = (n / d, n % d);
                        if q != i64::from(q as i16) {
                            return self.fault(0);
                        }
                        self.cpu.regs.set_reg16(AX, q as u16);
                        self.cpu.regs.set_reg16(DX, r as u16);
                    }
                }
            }
        }
        Outcome::Continue
    }

    // ── String instructions ──

    /// Element size in bytes for a string opcode.
    fn string_size(&self, opcode: u8) -> u16 {
        match (opcode & 1, self.op32 && matches!(opcode, 0x6D | 0x6F)) {
            (0, _) => 1,
            (_, true) => 4,
            _ => 2,
        }
    }

    fn advance_index(&mut self, reg: u8, size: u16) {
        let v = self.cpu.regs.reg16(reg);
        let v = if self.flag(Flags::DF) {
            v.wrapping_sub(size)
        } else {
            v.wrapping_add(size)
        };
        self.cpu.regs.set_reg16(reg, v);
    }

    fn read_sized(&self, seg: Seg, off: u16, size: u16) -> u32 {
        match size {
            1 => u32::from(self.read8(seg, off)),
            2 => u32::from(self.read16(seg, off)),
            _ => {
                u32::from(self.read16(seg, off))
                    | (u32::from(self.read16(seg, off.wrapping_add(2))) << 16)
            }
        }
    }

    fn write_sized(&mut self, seg: Seg, off: u16, size: u16, value: u32) {
        match size {
            1 => self.write8(seg, off, value as u8),
            2 => self.write16(seg, off, value as u16),
            _ => {
                self.write16(seg, off, value as u16);
                self.write16(seg, off.wrapping_add(2), (value >> 16) as u16);
            }
        }
    }

    fn port_width(size: u16) -> PortWidth {
        match size {
            1 => PortWidth::Byte,
            2 => PortWidth::Word,
            _ => PortWidth::Dword,
        }
    }

    fn string_op(&mut self, opcode: u8) {
        if self.rep.is_some() && self.cpu.regs.reg16(CX) == 0 {
            return;
        }
        let size = self.string_size(opcode);
        let w = if size == 1 { Width::Byte } else { Width::Word };
        let src = self.data_seg();
        let si = self.cpu.regs.reg16(SI);
        let di = self.cpu.regs.reg16(DI);
        let compares = matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF);
        match opcode {
            // INS
            0x6C | 0x6D => {
                let port = self.cpu.regs.reg16(DX);
                let value = self.host.io_read(port, Self::port_width(size));
                self.write_sized(Seg::Es, di, size, value);
                self.advance_index(DI, size);
            }
            // OUTS
            0x6E | 0x6F => {
                let port = self.cpu.regs.reg16(DX);
                let value = self.read_sized(src, si, size);
                self.host.io_write(port, Self::port_width(size), value);
                self.advance_index(SI, size);
            }
            // MOVS
            0xA4 | 0xA5 => {
                let value = self.read_sized(src, si, size);
                self.write_sized(Seg::Es, di, size, value);
                self.advance_index(SI, size);
                self.advance_index(DI, size);
            }
            // CMPS
            0xA6 | 0xA7 => {
                let a = self.read_sized(src, si, size);
                let b = self.read_sized(Seg::Es, di, size);
                self.alu(7, a, b, w);
                self.advance_index(SI, size);
                self.advance_index(DI, size);
            }
            // STOS
            0xAA | 0xAB => {
                let value = self.reg_get(AX, w);
                self.write_sized(Seg::Es, di, size, value);
                self.advance_index(DI, size);
            }
            // LODS
            0xAC | 0xAD => {
                let value = self.read_sized(src, si, size);
                self.reg_set(AX, w, value);
                self.advance_index(SI, size);
            }
            // SCAS
            _ => {
                let a = self.reg_get(AX, w);
                let b = self.read_sized(Seg::Es, di, size);
                self.alu(7, a, b, w);
                self.advance_index(DI, size);
            }
        }
        if let Some(rep) = self.rep {
            let cx = self.cpu.regs.reg16(CX).wrapping_sub(1);
            self.cpu.regs.set_reg16(CX, cx);
            let more = cx != 0
                && (!compares
                    || match rep {
                        Rep::Equal => self.flag(Flags::ZF),
                        Rep::NotEqual => !self.flag(Flags::ZF),
                    });
            if more {
                self.cpu.regs.ip = self.start_ip;
            }
        }
    }

    // ── BCD adjust ──

    fn daa_das(&mut self, subtract: bool) {
        let al = self.cpu.regs.reg8(0);
        let cf = self.flag(Flags::CF);
        let mut res = al;
        let mut new_cf = false;
        let mut af = false;
        if al & 0x0F > 9 || self.flag(Flags::AF) {
            res = if subtract {
                res.wrapping_sub(6)
            } else {
                res.wrapping_add(6)
            };
            af = true;
        }
        if al > 0x99 || cf {
            res = if subtract {
                res.wrapping_sub(0x60)
            } else {
                res.wrapping_add(0x60)
            };
            new_cf = true;
        }
        self.cpu.regs.set_reg8(0, res);
        let mut f = alu::szp(u32::from(res), Width::Byte);
        f.set(Flags::CF, new_cf);
        f.set(Flags::AF, af);
        self.merge_flags(Flags::ARITH - Flags::OF, f);
    }

    fn aaa_aas(&mut self, subtract: bool) {
        let adjust = self.cpu.regs.reg8(0) & 0x0F > 9 || self.flag(Flags::AF);
        if adjust {
            let ax = self.cpu.regs.reg16(AX);
            let ax = if subtract {
                ax.wrapping_sub(6).wrapping_sub(0x100)
            } else {
                ax.wrapping_add(0x106)
            };
            self.cpu.regs.set_reg16(AX, ax);
        }
        let al = self.cpu.regs.reg8(0) & 0x0F;
        self.cpu.regs.set_reg8(0, al);
        self.set_flag(Flags::AF, adjust);
        self.set_flag(Flags::CF, adjust);
    }

    // ── I/O ──

    fn io_width(&self, opcode: u8) -> PortWidth {
        match (opcode & 1, self.op32) {
            (0, _) => PortWidth::Byte,
            (_, true) => PortWidth::Dword,
            _ => PortWidth::Word,
        }
    }

    fn port_in(&mut self, port: u16, width: PortWidth) {
        let value = self.host.io_read(port, width);
        match width {
            PortWidth::Byte => self.cpu.regs.set_reg8(0, value as u8),
            PortWidth::Word => self.cpu.regs.set_reg16(AX, value as u16),
            PortWidth::Dword => self.cpu.regs.set_reg32(AX, value),
        }
    }

    fn port_out(&mut self, port: u16, width: PortWidth) {
        let value = self.cpu.regs.reg32(AX) & width.mask();
        self.host.io_write(port, width, value);
    }

    // ── Dispatch ──

    fn dispatch(&mut self, opcode: u8) -> Outcome {
        match opcode {
            0x00..=0x3F if opcode & 7 < 6 => self.alu_block(opcode),

            0x06 | 0x0E | 0x16 | 0x1E => {
                let seg = Seg::from_index(opcode >> 3).unwrap_or(Seg::Es);
                let value = self.cpu.regs.seg(seg);
                self.push(value);
            }
            0x07 | 0x17 | 0x1F => {
                let seg = Seg::from_index(opcode >> 3).unwrap_or(Seg::Es);
                let value = self.pop();
                self.cpu.regs.set_seg(seg, value);
                if seg == Seg::Ss {
                    self.cpu.inhibit_interrupts();
                }
            }
            0x27 => self.daa_das(false),
            0x2F => self.daa_das(true),
            0x37 => self.aaa_aas(false),
            0x3F => self.aaa_aas(true),

            0x40..=0x47 => {
                let r = opcode & 7;
                let (res, f) = alu::inc(self.reg_get(r, Width::Word), Width::Word);
                self.reg_set(r, Width::Word, res);
                self.merge_flags(Flags::ARITH - Flags::CF, f);
            }
            0x48..=0x4F => {
                let r = opcode & 7;
                let (res, f) = alu::dec(self.reg_get(r, Width::Word), Width::Word);
                self.reg_set(r, Width::Word, res);
                self.merge_flags(Flags::ARITH - Flags::CF, f);
            }
            0x50..=0x57 => {
                let r = opcode & 7;
                let value = if r == SP {
                    self.cpu.regs.reg16(SP).wrapping_sub(2)
                } else {
                    self.cpu.regs.reg16(r)
                };
                self.push(value);
            }
            0x58..=0x5F => {
                let value = self.pop();
                self.cpu.regs.set_reg16(opcode & 7, value);
            }

            // PUSHA / POPA
            0x60 => {
                let sp = self.cpu.regs.reg16(SP);
                for r in [AX, CX, DX, BX] {
                    let value = self.cpu.regs.reg16(r);
                    self.push(value);
                }
                self.push(sp);
                for r in [BP, SI, DI] {
                    let value = self.cpu.regs.reg16(r);
                    self.push(value);
                }
            }
            0x61 => {
                for r in [DI, SI, BP] {
                    let value = self.pop();
                    self.cpu.regs.set_reg16(r, value);
                }
                self.pop();
                for r in [BX, DX, CX, AX] {
                    let value = self.pop();
                    self.cpu.regs.set_reg16(r, value);
                }
            }
            // BOUND
            0x62 => {
                let m = self.modrm();
                let Operand::Mem { seg, off } = m.rm else {
                    return self.undefined(opcode);
                };
                let index = self.cpu.regs.reg16(m.reg) as i16;
                let lo = self.read16(seg, off) as i16;
                let hi = self.read16(seg, off.wrapping_add(2)) as i16;
                if index < lo || index > hi {
                    return self.fault(5);
                }
            }
            0x68 => {
                let value = self.fetch16();
                self.push(value);
            }
            0x6A => {
                let value = self.fetch8() as i8 as u16;
                self.push(value);
            }
            0x69 | 0x6B => {
                let m = self.modrm();
                let a = Width::Word.sext(self.get(m.rm, Width::Word));
                let b = if opcode == 0x6B {
                    i32::from(self.fetch8() as i8)
                } else {
                    i32::from(self.fetch16() as i16)
                };
                let p = a * b;
                self.reg_set(m.reg, Width::Word, p as u32);
                let wide = p != i32::from(p as i16);
                self.set_flag(Flags::CF, wide);
                self.set_flag(Flags::OF, wide);
            }
            0x6C..=0x6F => self.string_op(opcode),

            0x70..=0x7F => {
                let disp = self.fetch8() as i8;
                if alu::condition(opcode & 0x0F, self.cpu.regs.flags) {
                    self.jump_rel(i16::from(disp));
                }
            }

            0x80..=0x83 => {
                let w = Width::from_w_bit(opcode);
                let m = self.modrm();
                let imm = match opcode {
                    0x81 => u32::from(self.fetch16()),
                    0x83 => u32::from(self.fetch8() as i8 as u16),
                    _ => u32::from(self.fetch8()),
                };
                let a = self.get(m.rm, w);
                if let Some(res) = self.alu(m.reg, a, imm, w) {
                    self.set(m.rm, w, res);
                }
            }
            0x84 | 0x85 => {
                let w = Width::from_w_bit(opcode);
                let m = self.modrm();
                let (_, f) = alu::logic(self.get(m.rm, w) & self.reg_get(m.reg, w), w);
                self.merge_flags(Flags::ARITH, f);
            }
            0x86 | 0x87 => {
                let w = Width::from_w_bit(opcode);
                let m = self.modrm();
                let a = self.get(m.rm, w);
                let b = self.reg_get(m.reg, w);
                self.set(m.rm, w, b);
                self.reg_set(m.reg, w, a);
            }
            0x88 | 0x89 => {
                let w = Width::from_w_bit(opcode);
                let m = self.modrm();
                let value = self.reg_get(m.reg, w);
                self.set(m.rm, w, value);
            }
            0x8A | 0x8B => {
                let w = Width::from_w_bit(opcode);
                let m = self.modrm();
                let value = self.get(m.rm, w);
                self.reg_set(m.reg, w, value);
            }
            0x8C => {
                let m = self.modrm();
                let Some(seg) = Seg::from_index(m.reg) else {
                    return self.undefined(opcode);
                };
                let value = self.cpu.regs.seg(seg);
                self.set(m.rm, Width::Word, u32::from(value));
            }
            0x8D => {
                let m = self.modrm();
                let Operand::Mem { off, .. } = m.rm else {
                    return self.undefined(opcode);
                };
                self.cpu.regs.set_reg16(m.reg, off);
            }
            0x8E => {
                let m = self.modrm();
                let seg = match Seg::from_index(m.reg) {
                    Some(seg) if seg != Seg::Cs => seg,
                    _ => return self.undefined(opcode),
                };
                let value = self.get(m.rm, Width::Word) as u16;
                self.cpu.regs.set_seg(seg, value);
                if seg == Seg::Ss {
                    self.cpu.inhibit_interrupts();
                }
            }
            0x8F => {
                let m = self.modrm();
                let value = self.pop();
                self.set(m.rm, Width::Word, u32::from(value));
            }

            0x90 => {}
            0x91..=0x97 => {
                let r = opcode & 7;
                let a = self.cpu.regs.reg16(AX);
                let b = self.cpu.regs.reg16(r);
                self.cpu.regs.set_reg16(AX, b);
                self.cpu.regs.set_reg16(r, a);
            }
            0x98 => {
                let al = self.cpu.regs.reg8(0) as i8;
                self.cpu.regs.set_reg16(AX, al as i16 as u16);
            }
            0x99 => {
                let negative = self.cpu.regs.reg16(AX) & 0x8000 != 0;
                self.cpu
                    .regs
                    .set_reg16(DX, if negative { 0xFFFF } else { 0 });
            }
            0x9A => {
                let off = self.fetch16();
                let seg = self.fetch16();
                let cs = self.cpu.regs.seg(Seg::Cs);
                let ip = self.cpu.regs.ip;
                self.push(cs);
                self.push(ip);
                self.far_jump(seg, off);
            }
            // WAIT: no coprocessor
            0x9B => {}
            0x9C => {
                let image = self.cpu.regs.flags.image();
                self.push(image);
            }
            0x9D => {
                let value = self.pop();
                self.cpu.regs.flags = Flags::from_image(value);
            }
            0x9E => {
                let ah = Flags::from_bits_truncate(u16::from(self.cpu.regs.reg8(4)));
                self.merge_flags(Flags::ARITH - Flags::OF, ah);
            }
            0x9F => {
                let low = self.cpu.regs.flags.bits() as u8;
                self.cpu.regs.set_reg8(4, low);
            }

            0xA0..=0xA3 => {
                let w = Width::from_w_bit(opcode);
                let off = self.fetch16();
                let op = Operand::Mem {
                    seg: self.data_seg(),
                    off,
                };
                if opcode < 0xA2 {
                    let value = self.get(op, w);
                    self.reg_set(AX, w, value);
                } else {
                    let value = self.reg_get(AX, w);
                    self.set(op, w, value);
                }
            }
            0xA4..=0xA7 | 0xAA..=0xAF => self.string_op(opcode),
            0xA8 | 0xA9 => {
                let w = Width::from_w_bit(opcode);
                let imm = self.fetch(w);
                let (_, f) = alu::logic(self.reg_get(AX, w) & imm, w);
                self.merge_flags(Flags::ARITH, f);
            }

            0xB0..=0xB7 => {
                let imm = self.fetch8();
                self.cpu.regs.set_reg8(opcode & 7, imm);
            }
            0xB8..=0xBF => {
                let imm = self.fetch16();
                self.cpu.regs.set_reg16(opcode & 7, imm);
            }

            0xC0 | 0xC1 | 0xD0..=0xD3 => {
                let w = Width::from_w_bit(opcode);
                let m = self.modrm();
                let count = match opcode {
                    0xC0 | 0xC1 => u32::from(self.fetch8()),
                    0xD0 | 0xD1 => 1,
                    _ => u32::from(self.cpu.regs.reg8(1)),
                };
                self.shift_group(m, w, count);
            }
            0xC2 | 0xC3 => {
                let release = if opcode == 0xC2 { self.fetch16() } else { 0 };
                self.cpu.regs.ip = self.pop();
                let sp = self.cpu.regs.reg16(SP).wrapping_add(release);
                self.cpu.regs.set_reg16(SP, sp);
            }
            0xC4 | 0xC5 => {
                let m = self.modrm();
                let Operand::Mem { seg, off } = m.rm else {
                    return self.undefined(opcode);
                };
                let value = self.read16(seg, off);
                let selector = self.read16(seg, off.wrapping_add(2));
                self.cpu.regs.set_reg16(m.reg, value);
                let target = if opcode == 0xC4 { Seg::Es } else { Seg::Ds };
                self.cpu.regs.set_seg(target, selector);
            }
            0xC6 | 0xC7 => {
                let w = Width::from_w_bit(opcode);
                let m = self.modrm();
                let imm = self.fetch(w);
                self.set(m.rm, w, imm);
            }
            // ENTER
            0xC8 => {
                let size = self.fetch16();
                let level = self.fetch8() & 0x1F;
                let bp = self.cpu.regs.reg16(BP);
                self.push(bp);
                let frame = self.cpu.regs.reg16(SP);
                if level > 0 {
                    let mut walk = bp;
                    for _ in 1..level {
                        walk = walk.wrapping_sub(2);
                        let value = self.read16(Seg::Ss, walk);
                        self.push(value);
                    }
                    self.push(frame);
                }
                self.cpu.regs.set_reg16(BP, frame);
                let sp = self.cpu.regs.reg16(SP).wrapping_sub(size);
                self.cpu.regs.set_reg16(SP, sp);
            }
            // LEAVE
            0xC9 => {
                let bp = self.cpu.regs.reg16(BP);
                self.cpu.regs.set_reg16(SP, bp);
                let value = self.pop();
                self.cpu.regs.set_reg16(BP, value);
            }
            0xCA | 0xCB => {
                let release = if opcode == 0xCA { self.fetch16() } else { 0 };
                let ip = self.pop();
                let cs = self.pop();
                self.far_jump(cs, ip);
                let sp = self.cpu.regs.reg16(SP).wrapping_add(release);
                self.cpu.regs.set_reg16(SP, sp);
            }
            0xCC => self.interrupt(3),
            0xCD => {
                let vector = self.fetch8();
                self.interrupt(vector);
            }
            0xCE => {
                if self.flag(Flags::OF) {
                    self.interrupt(4);
                }
            }
            0xCF => {
                let ip = self.pop();
                let cs = self.pop();
                let flags = self.pop();
                self.far_jump(cs, ip);
                self.cpu.regs.flags = Flags::from_image(flags);
            }

            // AAM
            0xD4 => {
                let base = self.fetch8();
                if base == 0 {
                    return self.fault(0);
                }
                let al = self.cpu.regs.reg8(0);
                self.cpu.regs.set_reg8(4, al / base);
                self.cpu.regs.set_reg8(0, al % base);
                let f = alu::szp(u32::from(al % base), Width::Byte);
                self.merge_flags(Flags::ZF | Flags::SF | Flags::PF, f);
            }
            // AAD
            0xD5 => {
                let base = self.fetch8();
                let al = self.cpu.regs.reg8(0);
                let ah = self.cpu.regs.reg8(4);
                let res = al.wrapping_add(ah.wrapping_mul(base));
                self.cpu.regs.set_reg16(AX, u16::from(res));
                let f = alu::szp(u32::from(res), Width::Byte);
                self.merge_flags(Flags::ZF | Flags::SF | Flags::PF, f);
            }
            // XLAT
            0xD7 => {
                let off = self
                    .cpu
                    .regs
                    .reg16(BX)
                    .wrapping_add(u16::from(self.cpu.regs.reg8(0)));
                let value = self.read8(self.data_seg(), off);
                self.cpu.regs.set_reg8(0, value);
            }
            // ESC: no coprocessor, consume the operand
            0xD8..=0xDF => {
                self.modrm();
            }

            0xE0..=0xE2 => {
                let disp = self.fetch8() as i8;
                let cx = self.cpu.regs.reg16(CX).wrapping_sub(1);
                self.cpu.regs.set_reg16(CX, cx);
                let zf = self.flag(Flags::ZF);
                let taken = cx != 0
                    && match opcode {
                        0xE0 => !zf,
                        0xE1 => zf,
                        _ => true,
                    };
                if taken {
                    self.jump_rel(i16::from(disp));
                }
            }
            0xE3 => {
                let disp = self.fetch8() as i8;
                if self.cpu.regs.reg16(CX) == 0 {
                    self.jump_rel(i16::from(disp));
                }
            }
            0xE4 | 0xE5 => {
                let port = u16::from(self.fetch8());
                let width = self.io_width(opcode);
                self.port_in(port, width);
            }
            0xE6 | 0xE7 => {
                let port = u16::from(self.fetch8());
                let width = self.io_width(opcode);
                self.port_out(port, width);
            }
            0xE8 => {
                let disp = self.fetch16();
                let ip = self.cpu.regs.ip;
                self.push(ip);
                self.jump_rel(disp as i16);
            }
            0xE9 => {
                let disp = self.fetch16();
                self.jump_rel(disp as i16);
            }
            0xEA => {
                let off = self.fetch16();
                let seg = self.fetch16();
                self.far_jump(seg, off);
            }
            0xEB => {
                let disp = self.fetch8() as i8;
                self.jump_rel(i16::from(disp));
            }
            0xEC | 0xED => {
                let port = self.cpu.regs.reg16(DX);
                let width = self.io_width(opcode);
                self.port_in(port, width);
            }
            0xEE | 0xEF => {
                let port = self.cpu.regs.reg16(DX);
                let width = self.io_width(opcode);
                self.port_out(port, width);
            }

            0xF4 => return Outcome::Halt,
            0xF5 => {
                let cf = self.flag(Flags::CF);
                self.set_flag(Flags::CF, !cf);
            }
            0xF6 | 0xF7 => return self.group3(opcode),
            0xF8 => self.set_flag(Flags::CF, false),
            0xF9 => self.set_flag(Flags::CF, true),
            0xFA => self.set_flag(Flags::IF, false),
            0xFB => {
                if !self.flag(Flags::IF) {
                    self.cpu.inhibit_interrupts();
                }
                self.set_flag(Flags::IF, true);
            }
            0xFC => self.set_flag(Flags::DF, false),
            0xFD => self.set_flag(Flags::DF, true),
            0xFE => {
                let m = self.modrm();
                let v = self.get(m.rm, Width::Byte);
                let (res, f) = match m.reg {
                    0 => alu::inc(v, Width::Byte),
                    1 => alu::dec(v, Width::Byte),
                    _ => return self.undefined(opcode),
                };
                self.set(m.rm, Width::Byte, res);
                self.merge_flags(Flags::ARITH - Flags::CF, f);
            }
            0xFF => return self.group5(opcode),

            _ => return self.undefined(opcode),
        }
        Outcome::Continue
    }

    fn group5(&mut self, opcode: u8) -> Outcome {
        let m = self.modrm();
        match m.reg {
            0 | 1 => {
                let v = self.get(m.rm, Width::Word);
                let (res, f) = if m.reg == 0 {
                    alu::inc(v, Width::Word)
                } else {
                    alu::dec(v, Width::Word)
                };
                self.set(m.rm, Width::Word, res);
                self.merge_flags(Flags::ARITH - Flags::CF, f);
            }
            2 => {
                let target = self.get(m.rm, Width::Word) as u16;
                let ip = self.cpu.regs.ip;
                self.push(ip);
                self.cpu.regs.ip = target;
            }
            3 | 5 => {
                let Operand::Mem { seg, off } = m.rm else {
                    return self.undefined(opcode);
                };
                let target_ip = self.read16(seg, off);
                let target_cs = self.read16(seg, off.wrapping_add(2));
                if m.reg == 3 {
                    let cs = self.cpu.regs.seg(Seg::Cs);
                    let ip = self.cpu.regs.ip;
                    self.push(cs);
                    self.push(ip);
                }
                self.far_jump(target_cs, target_ip);
            }
            4 => {
                self.cpu.regs.ip = self.get(m.rm, Width::Word) as u16;
            }
            6 => {
                let value = self.get(m.rm, Width::Word) as u16;
                self.push(value);
            }
            _ => return self.undefined(opcode),
        }
        Outcome::Continue
    }
}
