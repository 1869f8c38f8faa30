//! Device lifecycle and the machine-construction context.
//!
//! Every emulated device implements [`Module`]. Port decoding
//! ([`PortDevice`](crate::io::PortDevice)) and clock callbacks
//! ([`TimerClient`](crate::clock::TimerClient)) are separate traits a
//! device opts into; a device that interrupts holds an [`IrqLine`].
//!
//! During reset a module receives a [`ResetContext`] that threads the bus,
//! the interrupt controller and the clock through to it. There is no global
//! registry: whatever a module needs is reachable from the context.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::clock::{ClockError, SharedClock};
use crate::devices::ata::AtaError;
use crate::io::{DeviceId, IoBus, IoError, PortMode};
use crate::pic::{IrqLine, PicError, SharedPic};

/// Errors raised while wiring or resetting a module.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// The module tried to claim ports but was never attached to the bus.
    #[error("{module} is not attached to the I/O bus")]
    NotOnBus { module: &'static str },

    /// A required peer module is absent from the machine.
    #[error("{module} requires a connection to {peer}")]
    MissingConnection {
        module: &'static str,
        peer: &'static str,
    },

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Irq(#[from] PicError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Ata(#[from] AtaError),
}

/// Lifecycle contract shared by every device.
pub trait Module {
    /// Short, unique name used in logs, dumps and connection checks.
    fn name(&self) -> &'static str;

    /// Re-establish port claims and derived state.
    fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError>;

    /// Called once the machine starts running.
    fn start(&mut self) {}

    /// Called when the machine stops.
    fn stop(&mut self) {}

    /// Human-readable diagnostic snapshot.
    fn dump(&self) -> String;

    /// Names of the modules this one must be wired to.
    fn connections(&self) -> &'static [&'static str] {
        &[]
    }
}

/// A module shared between the machine and its capability views.
pub type SharedModule = Rc<RefCell<dyn Module>>;

/// What a module can reach while it resets.
pub struct ResetContext<'a> {
    bus: &'a mut IoBus,
    device: Option<DeviceId>,
    pic: &'a SharedPic,
    clock: &'a SharedClock,
}

impl<'a> ResetContext<'a> {
    /// Build a context for the module attached to the bus as `device`
    /// (`None` for modules that decode no ports).
    pub fn new(
        bus: &'a mut IoBus,
        device: Option<DeviceId>,
        pic: &'a SharedPic,
        clock: &'a SharedClock,
    ) -> Self {
        Self {
            bus,
            device,
            pic,
            clock,
        }
    }

    fn device(&self) -> Result<DeviceId, ModuleError> {
        self.device.ok_or(ModuleError::NotOnBus { module: "device" })
    }

    /// Claim `port` for the module being reset.
    pub fn claim_port(&mut self, port: u16, mode: PortMode) -> Result<(), ModuleError> {
        let id = self.device()?;
        self.bus.register(port, id, mode)?;
        Ok(())
    }

    /// Claim `len` consecutive ports starting at `start`.
    pub fn claim_range(&mut self, start: u16, len: u16, mode: PortMode) -> Result<(), ModuleError> {
        let id = self.device()?;
        self.bus.register_range(start, len, id, mode)?;
        Ok(())
    }

    /// Drop every port the module currently owns.
    pub fn release_ports(&mut self) {
        if let Some(id) = self.device {
            self.bus.release(id);
        }
    }

    /// Obtain an IRQ line for `owner`.
    pub fn request_irq(
        &mut self,
        owner: &'static str,
        preferred: Option<u8>,
    ) -> Result<IrqLine, ModuleError> {
        let irq = self.pic.borrow_mut().request_irq(owner, preferred)?;
        Ok(IrqLine::new(self.pic.clone(), irq))
    }

    pub fn pic(&self) -> &SharedPic {
        self.pic
    }

    pub fn clock(&self) -> &SharedClock {
        self.clock
    }
}
