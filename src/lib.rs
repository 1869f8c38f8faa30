//! Relic - an emulator of legacy x86 personal computers.
//!
//! The crate models the hardware kernel of a PC/AT class machine: a
//! real-mode CPU, the port-mapped I/O bus, the cascaded 8259 interrupt
//! controllers, a clock that drives device timers, and the classic
//! peripherals (8254 PIT, CMOS/RTC, 8250 UART, parallel port and ATA/IDE
//! disks). [`Machine`](machine::Machine) wires them together.

pub mod clock;
pub mod cpu;
pub mod devices;
pub mod io;
pub mod machine;
pub mod memory;
pub mod module;
pub mod pic;
pub mod rom;

pub use machine::{Machine, MachineConfig, MachineError};
