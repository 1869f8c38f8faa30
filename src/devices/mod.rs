//! Legacy PC peripherals.

pub mod ata;
mod cmos;
mod hold;
mod parallel;
mod pit;
mod serial;

pub use cmos::{Cmos, SharedCmos, CMOS_PORT_DATA, CMOS_PORT_INDEX, REG_HARD_DISK};
pub use hold::HoldLine;
pub use parallel::{Parallel, LPT1_BASE};
pub use pit::{Pit, SharedPit, PIT_BASE, PIT_CONTROL, PIT_INPUT_HZ};
pub use serial::{Serial, SERIAL_COM1_BASE};
