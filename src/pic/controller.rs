//! A single Intel 8259A controller.
//!
//! The controller has eight request inputs (IR0-IR7) and one INT output.
//! Three byte-wide registers track each line:
//!
//! ```text
//!  IR pins ──► IRR ──(& !IMR)──► priority resolver ──► INT
//!                                      ▲
//!                                     ISR (blocks equal/lower priority)
//! ```
//!
//! Priority is circular: the line after `lowest_priority` has the highest
//! priority. Rotation commands move `lowest_priority` around.

use tracing::{debug, warn};

/// Initialization sequence position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Ready,
    ExpectIcw2,
    ExpectIcw3,
    ExpectIcw4,
}

/// ICW1 bits
mod icw1 {
    pub const IC4: u8 = 0x01;
    pub const SNGL: u8 = 0x02;
    pub const LTIM: u8 = 0x08;
    pub const INIT: u8 = 0x10;
}

/// ICW4 bits
mod icw4 {
    pub const UPM: u8 = 0x01;
    pub const AEOI: u8 = 0x02;
    pub const BUF: u8 = 0x08;
    pub const SFNM: u8 = 0x10;
}

/// One 8259A programmable interrupt controller.
#[derive(Debug, Clone)]
pub struct Pic8259 {
    /// Interrupt Mask Register (1 = masked)
    imr: u8,
    /// Interrupt Request Register
    irr: u8,
    /// In-Service Register
    isr: u8,
    /// Current level of each input pin, for edge detection.
    pins: u8,
    /// Inputs that are level-sensitive regardless of ICW1 (the cascade input).
    level_lines: u8,

    level_triggered: bool,
    /// Not part of a cascade (ICW1 SNGL).
    single: bool,
    special_fully_nested: bool,
    buffered: bool,
    auto_eoi: bool,
    rotate_on_auto_eoi: bool,
    special_mask: bool,
    polled: bool,
    /// OCW3 register select: read ISR instead of IRR on the command port.
    read_isr: bool,

    /// Vector base programmed by ICW2.
    interrupt_offset: u8,
    /// ICW3: slave bitmap on a master, cascade identity on a slave.
    cascade_config: u8,

    /// Line currently presented on INT.
    current_irq: u8,
    lowest_priority: u8,
    int_out: bool,

    init: InitState,
    requires_icw4: bool,
}

impl Pic8259 {
    pub(crate) fn new(interrupt_offset: u8, cascade_config: u8) -> Self {
        Self {
            imr: 0xFF,
            irr: 0,
            isr: 0,
            pins: 0,
            level_lines: 0,
            level_triggered: false,
            single: false,
            special_fully_nested: false,
            buffered: false,
            auto_eoi: false,
            rotate_on_auto_eoi: false,
            special_mask: false,
            polled: false,
            read_isr: false,
            interrupt_offset,
            cascade_config,
            current_irq: 0,
            lowest_priority: 7,
            int_out: false,
            init: InitState::Ready,
            requires_icw4: false,
        }
    }

    /// Restore power-on register state.
    ///
    /// The vector base and cascade wiring survive; they belong to the board,
    /// not to the controller's run-time state.
    pub(crate) fn reset(&mut self) {
        self.imr = 0xFF;
        self.irr = 0;
        self.isr = 0;
        self.pins = 0;
        self.level_triggered = false;
        self.special_fully_nested = false;
        self.buffered = false;
        self.auto_eoi = false;
        self.rotate_on_auto_eoi = false;
        self.special_mask = false;
        self.polled = false;
        self.read_isr = false;
        self.current_irq = 0;
        self.lowest_priority = 7;
        self.int_out = false;
        self.init = InitState::Ready;
        self.requires_icw4 = false;
    }

    pub fn imr(&self) -> u8 {
        self.imr
    }

    pub fn irr(&self) -> u8 {
        self.irr
    }

    pub fn isr(&self) -> u8 {
        self.isr
    }

    pub fn interrupt_offset(&self) -> u8 {
        self.interrupt_offset
    }

    pub fn lowest_priority(&self) -> u8 {
        self.lowest_priority
    }

    /// State of the INT output pin.
    pub fn int_output(&self) -> bool {
        self.int_out
    }

    pub fn is_cascaded(&self) -> bool {
        !self.single
    }

    pub fn auto_eoi(&self) -> bool {
        self.auto_eoi
    }

    pub fn special_fully_nested(&self) -> bool {
        self.special_fully_nested
    }

    pub fn buffered(&self) -> bool {
        self.buffered
    }

    pub fn special_mask(&self) -> bool {
        self.special_mask
    }

    pub fn level_triggered(&self) -> bool {
        self.level_triggered
    }

    /// Treat input `line` as level-sensitive. Used for the master input a
    /// slave's INT output is wired to.
    pub(crate) fn with_level_input(mut self, line: u8) -> Self {
        self.level_lines |= 1 << line;
        self
    }

    #[inline]
    fn level_sensitive(&self) -> u8 {
        if self.level_triggered {
            0xFF
        } else {
            self.level_lines
        }
    }

    pub(crate) fn set_interrupt_offset(&mut self, offset: u8) {
        self.interrupt_offset = offset & 0xF8;
    }

    /// Drive input pin `line` to `level`.
    ///
    /// A masked line updates its pin but never latches into IRR.
    pub(crate) fn set_pin(&mut self, line: u8, level: bool) {
        let mask = 1u8 << line;
        let level_sensitive = self.level_sensitive() & mask != 0;
        if level {
            let rising = self.pins & mask == 0;
            self.pins |= mask;
            if self.imr & mask == 0 && (level_sensitive || rising) {
                self.irr |= mask;
            }
        } else {
            self.pins &= !mask;
            if level_sensitive {
                self.irr &= !mask;
            }
        }
        self.evaluate();
    }

    /// Priority rank of `line`, 0 being the highest.
    #[inline]
    fn rank(&self, line: u8) -> u8 {
        line.wrapping_sub(self.lowest_priority).wrapping_sub(1) & 7
    }

    /// Line with rank `rank`.
    #[inline]
    fn line_at(&self, rank: u8) -> u8 {
        (self.lowest_priority + 1 + rank) & 7
    }

    /// Highest-priority line set in `bits`.
    fn highest_in(&self, bits: u8) -> Option<u8> {
        (0..8).map(|r| self.line_at(r)).find(|l| bits & (1 << l) != 0)
    }

    /// Recompute the INT output from IRR, IMR and ISR.
    fn evaluate(&mut self) {
        self.int_out = false;
        let mut pending = self.irr & !self.imr;
        if pending == 0 {
            return;
        }

        // Ranks strictly below `ceiling` may interrupt.
        let mut ceiling = 8;
        if self.special_mask {
            pending &= !self.isr;
        } else if let Some(serviced) = self.highest_in(self.isr) {
            ceiling = self.rank(serviced);
            if self.special_fully_nested {
                ceiling += 1;
            }
        }

        if let Some(line) = self.highest_in(pending) {
            if self.rank(line) < ceiling {
                self.int_out = true;
                self.current_irq = line;
            }
        }
    }

    /// INTA cycle: move the presented request into service.
    ///
    /// Returns the acknowledged line, or `None` when INT was not asserted.
    pub(crate) fn acknowledge(&mut self) -> Option<u8> {
        if !self.int_out {
            return None;
        }
        let line = self.current_irq;
        let mask = 1u8 << line;

        if self.auto_eoi {
            if self.rotate_on_auto_eoi {
                self.lowest_priority = line;
            }
        } else {
            self.isr |= mask;
        }
        self.irr &= !mask;
        if self.level_sensitive() & self.pins & mask != 0 {
            self.irr |= mask;
        }
        self.evaluate();
        Some(line)
    }

    /// Clear the highest-priority in-service line. Returns the cleared line.
    pub(crate) fn non_specific_eoi(&mut self, rotate: bool) -> Option<u8> {
        let line = self.highest_in(self.isr)?;
        self.isr &= !(1 << line);
        if rotate {
            self.lowest_priority = line;
        }
        self.evaluate();
        Some(line)
    }

    /// Clear in-service `line`.
    pub(crate) fn specific_eoi(&mut self, line: u8, rotate: bool) {
        self.isr &= !(1 << (line & 7));
        if rotate {
            self.lowest_priority = line & 7;
        }
        self.evaluate();
    }

    /// Poll command: acknowledge like INTA and report the line in bits 0-2.
    fn poll(&mut self) -> u8 {
        self.polled = false;
        match self.acknowledge() {
            Some(line) => 0x80 | line,
            None => 0,
        }
    }

    pub(crate) fn read_command(&mut self) -> u8 {
        if self.polled {
            return self.poll();
        }
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    pub(crate) fn read_data(&mut self) -> u8 {
        if self.polled {
            return self.poll();
        }
        self.imr
    }

    pub(crate) fn write_command(&mut self, value: u8) {
        if value & icw1::INIT != 0 {
            self.begin_init(value);
            return;
        }
        if value & 0x08 != 0 {
            self.write_ocw3(value);
        } else {
            self.write_ocw2(value);
        }
    }

    pub(crate) fn write_data(&mut self, value: u8) {
        match self.init {
            InitState::Ready => {
                self.imr = value;
                self.irr |= self.pins & self.level_sensitive() & !self.imr;
                self.evaluate();
            }
            InitState::ExpectIcw2 => {
                self.interrupt_offset = value & 0xF8;
                self.init = if !self.single {
                    InitState::ExpectIcw3
                } else if self.requires_icw4 {
                    InitState::ExpectIcw4
                } else {
                    InitState::Ready
                };
            }
            InitState::ExpectIcw3 => {
                self.cascade_config = value;
                self.init = if self.requires_icw4 {
                    InitState::ExpectIcw4
                } else {
                    InitState::Ready
                };
            }
            InitState::ExpectIcw4 => {
                if value & icw4::UPM == 0 {
                    warn!("pic: MCS-80/85 mode requested, continuing in 8086 mode");
                }
                self.auto_eoi = value & icw4::AEOI != 0;
                self.buffered = value & icw4::BUF != 0;
                self.special_fully_nested = value & icw4::SFNM != 0;
                self.init = InitState::Ready;
            }
        }
    }

    fn begin_init(&mut self, value: u8) {
        self.imr = 0;
        self.isr = 0;
        self.irr = 0;
        self.lowest_priority = 7;
        self.special_mask = false;
        self.read_isr = false;
        self.polled = false;
        self.auto_eoi = false;
        self.rotate_on_auto_eoi = false;
        self.special_fully_nested = false;
        self.buffered = false;
        self.int_out = false;
        self.level_triggered = value & icw1::LTIM != 0;
        self.single = value & icw1::SNGL != 0;
        self.requires_icw4 = value & icw1::IC4 != 0;
        self.init = InitState::ExpectIcw2;
        debug!(
            "pic: ICW1 {:#04x} ({} triggered)",
            value,
            if self.level_triggered { "level" } else { "edge" }
        );
    }

    fn write_ocw2(&mut self, value: u8) {
        let level = value & 0x07;
        match value >> 5 {
            0b000 => self.rotate_on_auto_eoi = false,
            0b001 => {
                self.non_specific_eoi(false);
            }
            0b010 => {}
            0b011 => self.specific_eoi(level, false),
            0b100 => self.rotate_on_auto_eoi = true,
            0b101 => {
                self.non_specific_eoi(true);
            }
            0b110 => {
                self.lowest_priority = level;
                self.evaluate();
            }
            _ => self.specific_eoi(level, true),
        }
    }

    fn write_ocw3(&mut self, value: u8) {
        if value & 0x04 != 0 {
            self.polled = true;
            return;
        }
        match value & 0x03 {
            0b10 => self.read_isr = false,
            0b11 => self.read_isr = true,
            _ => {}
        }
        match (value >> 5) & 0x03 {
            0b10 => self.special_mask = false,
            0b11 => self.special_mask = true,
            _ => {}
        }
        self.evaluate();
    }
}
