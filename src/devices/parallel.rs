//! Parallel printer port (LPT1).
//!
//! Data at base, read-only status at base + 1, control at base + 2. A
//! strobe pulse hands the data byte to the host; with interrupts enabled
//! the printer's acknowledge raises IRQ 7.

use tracing::trace;

use crate::io::{PortDevice, PortMode};
use crate::module::{Module, ModuleError, ResetContext};
use crate::pic::IrqLine;

pub const LPT1_BASE: u16 = 0x378;

// Status: not busy, no ack, selected, no error.
const STATUS_IDLE: u8 = 0xDF;

const CTRL_STROBE: u8 = 0x01;
const CTRL_IRQ_ENABLE: u8 = 0x10;

pub struct Parallel {
    base: u16,
    data: u8,
    control: u8,
    printed: Vec<u8>,
    irq: Option<IrqLine>,
}

impl Parallel {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            data: 0,
            control: 0,
            printed: Vec::new(),
            irq: None,
        }
    }

    /// Bytes strobed out by the guest.
    pub fn output(&self) -> &[u8] {
        &self.printed
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.printed)
    }

    fn write_control(&mut self, value: u8) {
        let rising = self.control & CTRL_STROBE == 0 && value & CTRL_STROBE != 0;
        self.control = value;
        if rising {
            trace!("parallel: strobe {:#04x}", self.data);
            self.printed.push(self.data);
            if value & CTRL_IRQ_ENABLE != 0 {
                if let Some(irq) = &self.irq {
                    irq.pulse();
                }
            }
        }
    }
}

impl Default for Parallel {
    fn default() -> Self {
        Self::new(LPT1_BASE)
    }
}

impl PortDevice for Parallel {
    fn read_byte(&mut self, port: u16) -> u8 {
        match port.wrapping_sub(self.base) {
            0 => self.data,
            1 => STATUS_IDLE,
            2 => self.control | 0xE0,
            _ => 0xFF,
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        match port.wrapping_sub(self.base) {
            0 => self.data = value,
            2 => self.write_control(value),
            _ => {}
        }
    }
}

impl Module for Parallel {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
        ctx.release_ports();
        self.data = 0;
        self.control = 0;
        self.irq = Some(ctx.request_irq("parallel", Some(7))?);
        ctx.claim_port(self.base, PortMode::ReadWrite)?;
        ctx.claim_port(self.base + 1, PortMode::ReadOnly)?;
        ctx.claim_port(self.base + 2, PortMode::ReadWrite)?;
        Ok(())
    }

    fn dump(&self) -> String {
        format!(
            "parallel: base {:#x} data {:#04x} control {:#04x} printed {}\n",
            self.base,
            self.data,
            self.control,
            self.printed.len()
        )
    }

    fn connections(&self) -> &'static [&'static str] {
        &["pic"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strobe_emits_data() {
        let mut lpt = Parallel::default();
        for b in b"ok" {
            lpt.write_byte(LPT1_BASE, *b);
            lpt.write_byte(LPT1_BASE + 2, CTRL_STROBE);
            lpt.write_byte(LPT1_BASE + 2, 0);
        }
        assert_eq!(lpt.take_output(), b"ok".to_vec());
    }

    #[test]
    fn test_held_strobe_prints_once() {
        let mut lpt = Parallel::default();
        lpt.write_byte(LPT1_BASE, b'x');
        lpt.write_byte(LPT1_BASE + 2, CTRL_STROBE);
        lpt.write_byte(LPT1_BASE + 2, CTRL_STROBE | CTRL_IRQ_ENABLE);
        assert_eq!(lpt.output(), b"x");
    }

    #[test]
    fn test_registers_read_back() {
        let mut lpt = Parallel::default();
        lpt.write_byte(LPT1_BASE, 0xA5);
        assert_eq!(lpt.read_byte(LPT1_BASE), 0xA5);
        assert_eq!(lpt.read_byte(LPT1_BASE + 1), STATUS_IDLE);
        lpt.write_byte(LPT1_BASE + 2, 0x0C);
        assert_eq!(lpt.read_byte(LPT1_BASE + 2), 0xEC);
    }
}
