//! 8250 UART serial port.
//!
//! Transmitted bytes go to a host writer such as stdout, or are captured
//! for the host when no writer is attached. Received bytes are queued by the host with
//! [`Serial::push_input`].

use std::collections::VecDeque;
use std::io::Write;

use tracing::{debug, trace, warn};

use crate::io::{PortDevice, PortMode};
use crate::module::{Module, ModuleError, ResetContext};
use crate::pic::IrqLine;

/// I/O port base for COM1.
pub const SERIAL_COM1_BASE: u16 = 0x3F8;

// Register offsets from the base port. THR/RBR and IER double as the
// divisor latch while LCR bit 7 (DLAB) is set.
mod regs {
    pub const DATA: u16 = 0;
    pub const IER: u16 = 1;
    pub const IIR_FCR: u16 = 2;
    pub const LCR: u16 = 3;
    pub const MCR: u16 = 4;
    pub const LSR: u16 = 5;
    pub const MSR: u16 = 6;
    pub const SCRATCH: u16 = 7;
}

mod lsr {
    pub const DATA_READY: u8 = 0x01;
    pub const THR_EMPTY: u8 = 0x20;
    pub const TX_IDLE: u8 = 0x40;
}

mod ier {
    pub const RX_AVAILABLE: u8 = 0x01;
    pub const THR_EMPTY: u8 = 0x02;
}

/// IIR identification codes, highest priority first.
mod iir {
    pub const RX_AVAILABLE: u8 = 0x04;
    pub const THR_EMPTY: u8 = 0x02;
    pub const NONE: u8 = 0x01;
}

const LCR_DLAB: u8 = 0x80;
const MCR_LOOPBACK: u8 = 0x10;
const MCR_OUT2: u8 = 0x08;
// DCD, DSR and CTS asserted.
const MSR_CONNECTED: u8 = 0xB0;

/// 8250 UART serial port.
pub struct Serial {
    base: u16,
    ier: u8,
    lcr: u8,
    mcr: u8,
    scratch: u8,
    fcr: u8,
    divisor: [u8; 2],
    /// A THRE interrupt is waiting to be identified.
    thre_pending: bool,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    sink: Option<Box<dyn Write>>,
    irq: Option<IrqLine>,
}

impl Serial {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            ier: 0,
            lcr: 0,
            mcr: 0,
            scratch: 0,
            fcr: 0,
            divisor: [0; 2],
            thre_pending: false,
            rx: VecDeque::new(),
            tx: Vec::new(),
            sink: None,
            irq: None,
        }
    }

    /// Send transmitted bytes to `sink` instead of the capture buffer.
    pub fn set_sink(&mut self, sink: Box<dyn Write>) {
        self.sink = Some(sink);
    }

    /// Bytes the guest has transmitted while no sink was attached.
    pub fn output(&self) -> &[u8] {
        &self.tx
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Queue bytes for the guest to receive.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
        self.update_irq();
    }

    fn divisor(&self) -> u16 {
        u16::from_le_bytes(self.divisor)
    }

    fn interrupt_id(&self) -> u8 {
        if self.ier & ier::RX_AVAILABLE != 0 && !self.rx.is_empty() {
            iir::RX_AVAILABLE
        } else if self.ier & ier::THR_EMPTY != 0 && self.thre_pending {
            iir::THR_EMPTY
        } else {
            iir::NONE
        }
    }

    fn update_irq(&mut self) {
        let Some(irq) = &self.irq else {
            return;
        };
        if self.interrupt_id() != iir::NONE && self.mcr & MCR_OUT2 != 0 {
            irq.raise();
        } else {
            irq.lower();
        }
    }

    fn transmit(&mut self, value: u8) {
        if self.mcr & MCR_LOOPBACK != 0 {
            self.rx.push_back(value);
        } else {
            match &mut self.sink {
                Some(sink) => {
                    if let Err(err) = sink.write_all(&[value]).and_then(|()| sink.flush()) {
                        warn!("serial: output failed: {err}");
                        self.sink = None;
                    }
                }
                None => self.tx.push(value),
            }
        }
        self.thre_pending = true;
        self.update_irq();
    }

    fn read_register(&mut self, offset: u16) -> u8 {
        let dlab = self.lcr & LCR_DLAB != 0;
        match offset {
            regs::DATA | regs::IER if dlab => self.divisor[usize::from(offset)],
            regs::DATA => {
                let value = self.rx.pop_front().unwrap_or(0);
                self.update_irq();
                value
            }
            regs::IER => self.ier,
            regs::IIR_FCR => {
                let id = self.interrupt_id();
                // Identifying a THRE interrupt acknowledges it.
                if id == iir::THR_EMPTY {
                    self.thre_pending = false;
                    self.update_irq();
                }
                id
            }
            regs::LCR => self.lcr,
            regs::MCR => self.mcr,
            regs::LSR => {
                let ready = if self.rx.is_empty() { 0 } else { lsr::DATA_READY };
                lsr::THR_EMPTY | lsr::TX_IDLE | ready
            }
            regs::MSR => MSR_CONNECTED,
            regs::SCRATCH => self.scratch,
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u16, value: u8) {
        let dlab = self.lcr & LCR_DLAB != 0;
        match offset {
            regs::DATA | regs::IER if dlab => self.divisor[usize::from(offset)] = value,
            regs::DATA => self.transmit(value),
            regs::IER => {
                // Enabling THRE with an empty holding register interrupts at once.
                if value & ier::THR_EMPTY != 0 && self.ier & ier::THR_EMPTY == 0 {
                    self.thre_pending = true;
                }
                self.ier = value & 0x0F;
                self.update_irq();
            }
            regs::IIR_FCR => self.fcr = value,
            regs::LCR => {
                if dlab && value & LCR_DLAB == 0 {
                    debug!("serial: divisor {}", self.divisor());
                }
                self.lcr = value;
            }
            regs::MCR => {
                self.mcr = value;
                self.update_irq();
            }
            regs::SCRATCH => self.scratch = value,
            _ => trace!("serial: write {value:#04x} to offset {offset} dropped"),
        }
    }
}

impl PortDevice for Serial {
    fn read_byte(&mut self, port: u16) -> u8 {
        self.read_register(port.wrapping_sub(self.base))
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        self.write_register(port.wrapping_sub(self.base), value);
    }
}

impl Module for Serial {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
        ctx.release_ports();
        self.ier = 0;
        self.lcr = 0;
        self.mcr = 0;
        self.fcr = 0;
        self.thre_pending = false;
        self.rx.clear();
        self.irq = Some(ctx.request_irq("serial", Some(4))?);
        ctx.claim_range(self.base, 8, PortMode::ReadWrite)?;
        Ok(())
    }

    fn dump(&self) -> String {
        format!(
            "serial: base {:#x} irq {} ier {:#04x} lcr {:#04x} mcr {:#04x} divisor {} rx {} tx {}\n",
            self.base,
            self.irq.as_ref().map_or(-1, |l| i16::from(l.number())),
            self.ier,
            self.lcr,
            self.mcr,
            self.divisor(),
            self.rx.len(),
            self.tx.len()
        )
    }

    fn connections(&self) -> &'static [&'static str] {
        &["pic"]
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new(SERIAL_COM1_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const COM1: u16 = SERIAL_COM1_BASE;

    #[test]
    fn test_transmitter_never_busy() {
        let mut uart = Serial::default();
        let status = uart.read_byte(COM1 + regs::LSR);
        assert_eq!(status & (lsr::THR_EMPTY | lsr::TX_IDLE), lsr::THR_EMPTY | lsr::TX_IDLE);
        assert_eq!(status & lsr::DATA_READY, 0);
        assert_eq!(uart.read_byte(COM1 + regs::MSR), MSR_CONNECTED);
    }

    #[test]
    fn test_divisor_latch_shadows_data_and_ier() {
        let mut uart = Serial::default();
        uart.write_byte(COM1 + regs::LCR, LCR_DLAB | 0x03);
        uart.write_byte(COM1 + regs::DATA, 0x0C);
        uart.write_byte(COM1 + regs::IER, 0x00);
        assert_eq!(uart.divisor(), 12);
        assert_eq!(uart.read_byte(COM1 + regs::DATA), 0x0C);
        assert!(uart.output().is_empty());

        uart.write_byte(COM1 + regs::LCR, 0x03);
        uart.write_byte(COM1 + regs::SCRATCH, 0x5A);
        uart.write_byte(COM1 + regs::DATA, b'A');
        assert_eq!(uart.output(), b"A");
        assert_eq!(uart.read_byte(COM1 + regs::SCRATCH), 0x5A);
    }

    #[test]
    fn test_capture_through_ports() {
        let mut uart = Serial::default();
        for b in b"hi\n" {
            uart.write_byte(COM1, *b);
        }
        assert_eq!(uart.take_output(), b"hi\n".to_vec());
        assert!(uart.output().is_empty());
    }

    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_takes_output_instead_of_capture() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let mut uart = Serial::default();
        uart.set_sink(Box::new(Shared(written.clone())));
        for b in b"boot ok\n" {
            uart.write_byte(COM1, *b);
        }
        assert_eq!(written.borrow().as_slice(), b"boot ok\n");
        assert!(uart.output().is_empty());
    }

    #[test]
    fn test_receive_and_identify() {
        let mut uart = Serial::default();
        assert_eq!(uart.read_register(regs::IIR_FCR), iir::NONE);
        uart.write_register(regs::IER, ier::RX_AVAILABLE);
        uart.push_input(b"x");
        assert_eq!(uart.read_register(regs::LSR) & lsr::DATA_READY, lsr::DATA_READY);
        assert_eq!(uart.read_register(regs::IIR_FCR), iir::RX_AVAILABLE);
        assert_eq!(uart.read_register(regs::DATA), b'x');
        assert_eq!(uart.read_register(regs::IIR_FCR), iir::NONE);
    }

    #[test]
    fn test_thre_interrupt_cleared_by_iir_read() {
        let mut uart = Serial::default();
        uart.write_register(regs::IER, ier::THR_EMPTY);
        assert_eq!(uart.read_register(regs::IIR_FCR), iir::THR_EMPTY);
        assert_eq!(uart.read_register(regs::IIR_FCR), iir::NONE);
        uart.write_register(regs::DATA, b'z');
        assert_eq!(uart.read_register(regs::IIR_FCR), iir::THR_EMPTY);
    }

    #[test]
    fn test_loopback() {
        let mut uart = Serial::default();
        uart.write_register(regs::MCR, MCR_LOOPBACK);
        uart.write_register(regs::DATA, 0x55);
        assert!(uart.output().is_empty());
        assert_eq!(uart.read_register(regs::DATA), 0x55);
    }

    #[test]
    fn test_irq_needs_out2() {
        use crate::clock::{Clock, ClockConfig};
        use crate::io::IoBus;
        use crate::pic::DualPic;

        let pic = Rc::new(RefCell::new(DualPic::new()));
        let clock = Clock::shared(ClockConfig::default());
        let uart = Rc::new(RefCell::new(Serial::default()));
        let mut bus = IoBus::new();
        let id = bus.attach("serial", uart.clone());
        uart.borrow_mut()
            .reset(&mut ResetContext::new(&mut bus, Some(id), &pic, &clock))
            .unwrap();
        pic.borrow_mut().port_write(0x21, 0x00);

        uart.borrow_mut().write_register(regs::IER, ier::RX_AVAILABLE);
        uart.borrow_mut().push_input(b"a");
        assert!(!pic.borrow().intr());
        uart.borrow_mut().write_register(regs::MCR, MCR_OUT2);
        assert!(pic.borrow().intr());
        assert_eq!(pic.borrow_mut().acknowledge(), Some(0x08 + 4));
    }
}
