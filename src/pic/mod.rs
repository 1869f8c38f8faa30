//! Cascaded 8259A interrupt controller pair.
//!
//! The PC/AT wires a slave 8259 into input 2 of the master:
//!
//! ```text
//!  IRQ0-7  ──► ┌────────┐
//!              │ master │──► CPU INTR
//!  IRQ8-15 ──► ┌────────┐
//!              │ slave  │──► master IR2
//! ```
//!
//! Devices drive lines through an [`IrqLine`] handed out by
//! [`DualPic::request_irq`]. The CPU polls [`DualPic::intr`] at every
//! instruction boundary and, when it can take the interrupt, calls
//! [`DualPic::acknowledge`] to get the vector.

mod controller;

pub use controller::Pic8259;

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::io::{PortDevice, PortMode};
use crate::module::{Module, ModuleError, ResetContext};

/// Master command port.
pub const MASTER_CMD: u16 = 0x20;
/// Master data port.
pub const MASTER_DATA: u16 = 0x21;
/// Slave command port.
pub const SLAVE_CMD: u16 = 0xA0;
/// Slave data port.
pub const SLAVE_DATA: u16 = 0xA1;

/// Number of IRQ lines across both controllers.
pub const IRQ_LINES: usize = 16;

/// Master input the slave's INT output is wired to.
const CASCADE_LINE: u8 = 2;

/// Vector bases a PC BIOS programs at POST.
const MASTER_OFFSET: u8 = 0x08;
const SLAVE_OFFSET: u8 = 0x70;

/// Errors reported by the interrupt controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PicError {
    /// The line number is outside 0-15.
    #[error("IRQ line {0} does not exist")]
    InvalidLine(u8),

    /// Every assignable line is taken.
    #[error("no free IRQ line for {owner}")]
    NoFreeIrq { owner: &'static str },

    /// Freeing a line that nobody owns.
    #[error("IRQ line {0} is not allocated")]
    NotAllocated(u8),
}

/// Master/slave 8259A pair.
#[derive(Debug, Clone)]
pub struct DualPic {
    master: Pic8259,
    slave: Pic8259,
    owners: [Option<&'static str>; IRQ_LINES],
}

impl DualPic {
    /// Create a pair wired the PC/AT way, vector bases at 0x08 and 0x70.
    pub fn new() -> Self {
        let mut owners = [None; IRQ_LINES];
        owners[usize::from(CASCADE_LINE)] = Some("cascade");
        Self {
            master: Pic8259::new(MASTER_OFFSET, 1 << CASCADE_LINE).with_level_input(CASCADE_LINE),
            slave: Pic8259::new(SLAVE_OFFSET, CASCADE_LINE),
            owners,
        }
    }

    pub fn master(&self) -> &Pic8259 {
        &self.master
    }

    pub fn slave(&self) -> &Pic8259 {
        &self.slave
    }

    /// Override the vector bases (board configuration, survives reset).
    pub fn set_offsets(&mut self, master: u8, slave: u8) {
        self.master.set_interrupt_offset(master);
        self.slave.set_interrupt_offset(slave);
    }

    /// Restore both controllers to power-on defaults.
    ///
    /// IRQ ownership and vector bases are preserved.
    pub fn reset(&mut self) {
        self.master.reset();
        self.slave.reset();
    }

    /// Raise IRQ `irq`.
    pub fn assert_irq(&mut self, irq: u8) -> Result<(), PicError> {
        self.set_line(irq, true)
    }

    /// Lower IRQ `irq`.
    pub fn clear_irq(&mut self, irq: u8) -> Result<(), PicError> {
        self.set_line(irq, false)
    }

    fn set_line(&mut self, irq: u8, level: bool) -> Result<(), PicError> {
        match irq {
            0..=7 => self.master.set_pin(irq, level),
            8..=15 => {
                self.slave.set_pin(irq - 8, level);
                self.sync_cascade();
            }
            _ => return Err(PicError::InvalidLine(irq)),
        }
        Ok(())
    }

    /// Propagate the slave's INT output into the master's cascade input.
    fn sync_cascade(&mut self) {
        if self.master.is_cascaded() {
            self.master.set_pin(CASCADE_LINE, self.slave.int_output());
        }
    }

    /// State of the CPU's INTR line.
    pub fn intr(&self) -> bool {
        self.master.int_output()
    }

    /// Acknowledge the highest-priority pending request.
    ///
    /// Returns the interrupt vector, or `None` if INTR was not asserted.
    /// Requests on the cascade line are resolved through the slave; if the
    /// slave withdrew its request the slave's spurious vector (IR7) is
    /// returned.
    pub fn acknowledge(&mut self) -> Option<u8> {
        let line = self.master.acknowledge()?;
        if line == CASCADE_LINE && self.master.is_cascaded() {
            let vector = match self.slave.acknowledge() {
                Some(slave_line) => self.slave.interrupt_offset() + slave_line,
                None => {
                    debug!("pic: spurious IRQ15");
                    self.slave.interrupt_offset() + 7
                }
            };
            self.sync_cascade();
            Some(vector)
        } else {
            Some(self.master.interrupt_offset() + line)
        }
    }

    /// End-of-interrupt.
    ///
    /// `Some(line)` issues a specific EOI. For a slave line the cascade
    /// line on the master is released once the slave has nothing left in
    /// service. `None` clears the highest-priority in-service line.
    pub fn end_of_interrupt(&mut self, irq: Option<u8>) -> Result<(), PicError> {
        match irq {
            Some(line @ 0..=7) => self.master.specific_eoi(line, false),
            Some(line @ 8..=15) => {
                self.slave.specific_eoi(line - 8, false);
                self.sync_cascade();
                if self.slave.isr() == 0 {
                    self.master.specific_eoi(CASCADE_LINE, false);
                }
            }
            Some(line) => return Err(PicError::InvalidLine(line)),
            None => {
                if self.master.non_specific_eoi(false) == Some(CASCADE_LINE) {
                    self.slave.non_specific_eoi(false);
                    self.sync_cascade();
                }
            }
        }
        Ok(())
    }

    /// Assign an IRQ line to `owner`.
    ///
    /// A device that already owns a line gets the same line back, so
    /// repeated resets are stable. `preferred` is the line the device is
    /// wired to on a PC/AT; if it is taken the next free line is handed out.
    pub fn request_irq(&mut self, owner: &'static str, preferred: Option<u8>) -> Result<u8, PicError> {
        if let Some(line) = self.owners.iter().position(|o| *o == Some(owner)) {
            return Ok(line as u8);
        }
        if let Some(line) = preferred {
            let slot = self
                .owners
                .get(usize::from(line))
                .ok_or(PicError::InvalidLine(line))?;
            if slot.is_none() {
                self.owners[usize::from(line)] = Some(owner);
                return Ok(line);
            }
        }
        match self.owners.iter().position(Option::is_none) {
            Some(line) => {
                self.owners[line] = Some(owner);
                if preferred.is_some() {
                    warn!("pic: {} moved to IRQ {} (preferred line taken)", owner, line);
                }
                Ok(line as u8)
            }
            None => Err(PicError::NoFreeIrq { owner }),
        }
    }

    /// Release a line obtained from [`Self::request_irq`].
    pub fn free_irq(&mut self, irq: u8) -> Result<(), PicError> {
        let slot = self
            .owners
            .get_mut(usize::from(irq))
            .ok_or(PicError::InvalidLine(irq))?;
        match slot {
            Some(_) if irq != CASCADE_LINE => {
                *slot = None;
                Ok(())
            }
            _ => Err(PicError::NotAllocated(irq)),
        }
    }

    /// Device owning `irq`.
    pub fn irq_owner(&self, irq: u8) -> Option<&'static str> {
        self.owners.get(usize::from(irq)).copied().flatten()
    }

    pub fn port_read(&mut self, port: u16) -> u8 {
        match port {
            MASTER_CMD => self.master.read_command(),
            MASTER_DATA => self.master.read_data(),
            SLAVE_CMD => {
                let v = self.slave.read_command();
                self.sync_cascade();
                v
            }
            SLAVE_DATA => {
                let v = self.slave.read_data();
                self.sync_cascade();
                v
            }
            _ => 0xFF,
        }
    }

    pub fn port_write(&mut self, port: u16, value: u8) {
        match port {
            MASTER_CMD => self.master.write_command(value),
            MASTER_DATA => self.master.write_data(value),
            SLAVE_CMD => self.slave.write_command(value),
            SLAVE_DATA => self.slave.write_data(value),
            _ => return,
        }
        self.sync_cascade();
    }

    /// Human-readable register snapshot.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, pic) in [("master", &self.master), ("slave", &self.slave)] {
            let _ = writeln!(
                out,
                "{name}: IMR={:02x} IRR={:02x} ISR={:02x} base={:#04x} lowest={} INT={} aeoi={} sfnm={}",
                pic.imr(),
                pic.irr(),
                pic.isr(),
                pic.interrupt_offset(),
                pic.lowest_priority(),
                pic.int_output(),
                pic.auto_eoi(),
                pic.special_fully_nested(),
            );
        }
        for (line, owner) in self.owners.iter().enumerate() {
            if let Some(owner) = owner {
                let _ = writeln!(out, "  IRQ{line:<2} {owner}");
            }
        }
        out
    }
}

impl Default for DualPic {
    fn default() -> Self {
        Self::new()
    }
}

/// The controller pair shared by every interrupt source.
pub type SharedPic = Rc<RefCell<DualPic>>;

/// A device's handle on its IRQ line.
#[derive(Clone)]
pub struct IrqLine {
    pic: SharedPic,
    irq: u8,
}

impl IrqLine {
    pub(crate) fn new(pic: SharedPic, irq: u8) -> Self {
        Self { pic, irq }
    }

    pub fn number(&self) -> u8 {
        self.irq
    }

    pub fn raise(&self) {
        if let Err(err) = self.pic.borrow_mut().assert_irq(self.irq) {
            warn!("pic: raise failed: {err}");
        }
    }

    pub fn lower(&self) {
        if let Err(err) = self.pic.borrow_mut().clear_irq(self.irq) {
            warn!("pic: lower failed: {err}");
        }
    }

    /// Raise then lower: one edge on an edge-triggered controller.
    pub fn pulse(&self) {
        self.raise();
        self.lower();
    }
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IrqLine({})", self.irq)
    }
}

/// The PIC as seen from the I/O bus and the module lifecycle.
pub struct PicDevice {
    pic: SharedPic,
}

impl PicDevice {
    pub fn new(pic: SharedPic) -> Self {
        Self { pic }
    }
}

impl PortDevice for PicDevice {
    fn read_byte(&mut self, port: u16) -> u8 {
        self.pic.borrow_mut().port_read(port)
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        self.pic.borrow_mut().port_write(port, value);
    }
}

impl Module for PicDevice {
    fn name(&self) -> &'static str {
        "pic"
    }

    fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
        self.pic.borrow_mut().reset();
        for port in [MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA] {
            ctx.claim_port(port, PortMode::ReadWrite)?;
        }
        Ok(())
    }

    fn dump(&self) -> String {
        self.pic.borrow().dump()
    }
}
