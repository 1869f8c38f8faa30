//! Intel 8254 programmable interval timer.
//!
//! Ports 0x40-0x42 are the three counters, 0x43 the write-only control
//! word. Counter 0 drives IRQ 0. The counters advance from a continuous
//! clock timer in batches of input ticks.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::clock::{ClockError, SharedClock, TimerClient};
use crate::io::{PortDevice, PortMode};
use crate::module::{Module, ModuleError, ResetContext};
use crate::pic::IrqLine;

pub const PIT_INPUT_HZ: u64 = 1_193_182;

pub const PIT_BASE: u16 = 0x40;
pub const PIT_CONTROL: u16 = 0x43;

/// Host interval between counter updates.
pub const PIT_UPDATE_US: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Access {
    #[default]
    LoHi,
    Lo,
    Hi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    /// Interrupt on terminal count. Modes 1, 4 and 5 behave the same here.
    #[default]
    OneShot,
    RateGenerator,
    SquareWave,
}

#[derive(Debug, Clone, Default)]
struct Counter {
    mode: Mode,
    mode_bits: u8,
    access: Access,
    bcd: bool,
    reload: u16,
    count: u32,
    armed: bool,
    out: bool,
    /// Low byte received, waiting for the high byte.
    write_low: Option<u8>,
    /// Next LoHi read returns the high byte.
    read_high: bool,
    latched: Option<u16>,
    status: Option<u8>,
}

impl Counter {
    fn period(&self) -> u32 {
        match self.reload {
            0 => 0x10000,
            n => u32::from(n),
        }
    }

    fn program(&mut self, access: Access, mode_bits: u8, bcd: bool) {
        let mode_bits = if mode_bits >= 6 { mode_bits & 0b011 } else { mode_bits };
        *self = Counter {
            mode: match mode_bits {
                2 => Mode::RateGenerator,
                3 => Mode::SquareWave,
                _ => Mode::OneShot,
            },
            mode_bits,
            access,
            bcd,
            out: mode_bits != 0,
            ..Counter::default()
        };
    }

    fn load(&mut self, reload: u16) {
        self.reload = reload;
        self.count = self.period();
        self.armed = true;
        if self.mode == Mode::OneShot {
            self.out = false;
        }
    }

    fn write(&mut self, value: u8) {
        match self.access {
            Access::Lo => self.load(u16::from(value)),
            Access::Hi => self.load(u16::from(value) << 8),
            Access::LoHi => match self.write_low.take() {
                None => self.write_low = Some(value),
                Some(low) => self.load(u16::from_le_bytes([low, value])),
            },
        }
    }

    fn current(&self) -> u16 {
        self.count as u16
    }

    fn latch(&mut self) {
        if self.latched.is_none() {
            self.latched = Some(self.current());
            self.read_high = false;
        }
    }

    fn status_byte(&self) -> u8 {
        let access = match self.access {
            Access::Lo => 1,
            Access::Hi => 2,
            Access::LoHi => 3,
        };
        u8::from(self.out) << 7
            | u8::from(!self.armed) << 6
            | access << 4
            | self.mode_bits << 1
            | u8::from(self.bcd)
    }

    fn read(&mut self) -> u8 {
        if let Some(status) = self.status.take() {
            return status;
        }
        let value = self.latched.unwrap_or_else(|| self.current());
        let [lo, hi] = value.to_le_bytes();
        let (byte, done) = match self.access {
            Access::Lo => (lo, true),
            Access::Hi => (hi, true),
            Access::LoHi if self.read_high => (hi, true),
            Access::LoHi => (lo, false),
        };
        if self.access == Access::LoHi {
            self.read_high = !self.read_high;
        }
        if done {
            self.latched = None;
        }
        byte
    }

    /// Run `ticks` input clocks; returns how many times the count expired.
    fn advance(&mut self, ticks: u64) -> u64 {
        if !self.armed || ticks == 0 {
            return 0;
        }
        let count = u64::from(self.count);
        match self.mode {
            Mode::OneShot => {
                if ticks >= count {
                    let wrapped = (ticks - count) % 0x10000;
                    self.count = ((0x10000 - wrapped) % 0x10000) as u32;
                    self.armed = false;
                    self.out = true;
                    return 1;
                }
                self.count = (count - ticks) as u32;
                0
            }
            Mode::RateGenerator | Mode::SquareWave => {
                let period = u64::from(self.period());
                if ticks < count {
                    self.count = (count - ticks) as u32;
                    return 0;
                }
                let past = ticks - count;
                self.count = (period - past % period) as u32;
                1 + past / period
            }
        }
    }
}

/// The three-counter timer.
pub struct Pit {
    counters: [Counter; 3],
    irq: Option<IrqLine>,
    /// Input ticks owed, scaled by 1e6.
    residue: u64,
    /// Counter 0 expiries since reset.
    expiries: u64,
}

pub type SharedPit = Rc<RefCell<Pit>>;

impl Pit {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            irq: None,
            residue: 0,
            expiries: 0,
        }
    }

    /// Register the continuous update timer.
    pub fn attach_timer(this: &SharedPit, clock: &SharedClock) -> Result<(), ClockError> {
        clock
            .borrow_mut()
            .register("pit", this.clone(), PIT_UPDATE_US, true)?;
        Ok(())
    }

    fn write_control(&mut self, value: u8) {
        let select = value >> 6;
        let access = (value >> 4) & 0b11;
        if select == 3 {
            self.read_back(value);
            return;
        }
        let counter = &mut self.counters[usize::from(select)];
        let access = match access {
            0 => {
                counter.latch();
                return;
            }
            1 => Access::Lo,
            2 => Access::Hi,
            _ => Access::LoHi,
        };
        counter.program(access, (value >> 1) & 0b111, value & 1 != 0);
        debug!("pit: counter {select} mode {} {access:?}", (value >> 1) & 0b111);
    }

    /// Read-back command: latch count and/or status of selected counters.
    fn read_back(&mut self, value: u8) {
        for (i, counter) in self.counters.iter_mut().enumerate() {
            if value & (0x02 << i) == 0 {
                continue;
            }
            if value & 0x20 == 0 {
                counter.latch();
            }
            if value & 0x10 == 0 && counter.status.is_none() {
                counter.status = Some(counter.status_byte());
            }
        }
    }

    /// Advance all counters by `ticks` input clocks.
    ///
    /// Every counter 0 expiry is counted, but expiries within one batch
    /// reach IRQ 0 as a single edge: the PIC holds at most one request per
    /// line until the guest acknowledges it.
    pub fn advance(&mut self, ticks: u64) {
        let expired = self.counters[0].advance(ticks);
        for counter in &mut self.counters[1..] {
            counter.advance(ticks);
        }
        if expired == 0 {
            return;
        }
        self.expiries += expired;
        trace!("pit: counter 0 expired {expired} time(s)");
        if let Some(irq) = &self.irq {
            irq.pulse();
        }
    }

    /// Counter 0 expiries since reset.
    pub fn expiries(&self) -> u64 {
        self.expiries
    }

    pub fn count(&self, counter: usize) -> u16 {
        self.counters[counter % 3].current()
    }

    pub fn out(&self, counter: usize) -> bool {
        self.counters[counter % 3].out
    }
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

impl PortDevice for Pit {
    fn read_byte(&mut self, port: u16) -> u8 {
        match port.wrapping_sub(PIT_BASE) {
            i @ 0..=2 => self.counters[usize::from(i)].read(),
            _ => 0xFF,
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        match port.wrapping_sub(PIT_BASE) {
            i @ 0..=2 => self.counters[usize::from(i)].write(value),
            3 => self.write_control(value),
            _ => {}
        }
    }
}

impl TimerClient for Pit {
    fn on_timer(&mut self) {
        self.residue += PIT_UPDATE_US * PIT_INPUT_HZ;
        let ticks = self.residue / 1_000_000;
        self.residue %= 1_000_000;
        self.advance(ticks);
    }
}

impl Module for Pit {
    fn name(&self) -> &'static str {
        "pit"
    }

    fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
        ctx.release_ports();
        self.counters = Default::default();
        self.residue = 0;
        self.expiries = 0;
        self.irq = Some(ctx.request_irq("pit", Some(0))?);
        ctx.claim_range(PIT_BASE, 3, PortMode::ReadWrite)?;
        ctx.claim_port(PIT_CONTROL, PortMode::WriteOnly)?;
        Ok(())
    }

    fn dump(&self) -> String {
        let mut out = format!("pit: {} counter 0 expiries\n", self.expiries);
        for (i, c) in self.counters.iter().enumerate() {
            let _ = writeln!(
                out,
                "  counter {i}: mode {} {:?} reload {:#06x} count {:#06x} out {} {}",
                c.mode_bits,
                c.access,
                c.reload,
                c.count,
                u8::from(c.out),
                if c.armed { "counting" } else { "idle" }
            );
        }
        out
    }

    fn connections(&self) -> &'static [&'static str] {
        &["pic"]
    }
}
