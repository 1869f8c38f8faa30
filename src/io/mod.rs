//! Port-mapped I/O bus.
//!
//! Every `IN`/`OUT` the CPU executes lands here. The bus maps each 16-bit
//! port address to exactly one owning device and forwards the access.
//!
//! # Port Map
//!
//! ```text
//! 0x0020 - 0x0021  PIC master (command / data)
//! 0x0040 - 0x0043  PIT 8254 (0x43 write-only)
//! 0x0070 - 0x0071  CMOS / RTC
//! 0x00A0 - 0x00A1  PIC slave (command / data)
//! 0x0170 - 0x0177  ATA secondary channel
//! 0x01F0 - 0x01F7  ATA primary channel
//! 0x0376 - 0x0377  ATA secondary control
//! 0x0378 - 0x037A  LPT1
//! 0x03F6 - 0x03F7  ATA primary control (0x3F0 - 0x3F5 belong to the floppy controller)
//! 0x03F8 - 0x03FF  COM1
//! ```
//!
//! Devices are attached once at machine construction and receive a
//! [`DeviceId`]. During reset each device claims the ports it decodes.
//! Claims are authoritative: the last claim for a port wins, and
//! re-claiming a port for the same device is a no-op.
//!
//! Accesses to unclaimed ports never fail the machine. Real ISA buses
//! float high, so reads return all-ones of the access width and writes
//! are dropped. [`IoBus::try_read`] / [`IoBus::try_write`] expose the
//! underlying condition for callers that need to tell an unknown port
//! from a write-only one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

/// Value returned for a byte read from a port nobody decodes.
pub const FILLER_BYTE: u8 = 0xFF;

/// Access width of a port operation.
///
/// x86 `IN`/`OUT` support 1, 2, or 4 byte operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortWidth {
    Byte,
    Word,
    Dword,
}

impl PortWidth {
    /// Number of bytes moved by an access of this width.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            PortWidth::Byte => 1,
            PortWidth::Word => 2,
            PortWidth::Dword => 4,
        }
    }

    /// Mask covering the significant bits of a value of this width.
    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            PortWidth::Byte => 0xFF,
            PortWidth::Word => 0xFFFF,
            PortWidth::Dword => 0xFFFF_FFFF,
        }
    }

    /// All-ones pattern a floating bus returns for this width.
    #[inline]
    pub const fn filler(self) -> u32 {
        self.mask()
    }
}

/// Direction restrictions a device places on one of its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

/// Handle for a device attached to an [`IoBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(usize);

/// Errors reported by the I/O bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// No device claims the port.
    #[error("unknown I/O port {port:#06x}")]
    UnknownPort { port: u16 },

    /// The port exists but its owner only accepts writes.
    #[error("read from write-only I/O port {port:#06x} owned by {owner}")]
    WriteOnlyPort { port: u16, owner: &'static str },

    /// The port exists but its owner only accepts reads.
    #[error("write to read-only I/O port {port:#06x} owned by {owner}")]
    ReadOnlyPort { port: u16, owner: &'static str },

    /// A registration named a device that was never attached.
    #[error("device {0:?} is not attached to the I/O bus")]
    UnknownDevice(DeviceId),
}

/// Trait for devices that decode I/O ports.
///
/// Implementors provide byte access. Word and double-word accesses are
/// split into consecutive byte accesses on `port`, `port + 1`, ... unless
/// the device overrides [`PortDevice::read`] / [`PortDevice::write`]
/// (the ATA data register is natively 16 bits wide, for instance).
pub trait PortDevice {
    /// Handle a byte read from `port`.
    fn read_byte(&mut self, port: u16) -> u8;

    /// Handle a byte write to `port`.
    fn write_byte(&mut self, port: u16, value: u8);

    /// Handle a read of the given width starting at `port`.
    fn read(&mut self, port: u16, width: PortWidth) -> u32 {
        let mut value = 0u32;
        for i in 0..width.bytes() {
            let byte = self.read_byte(port.wrapping_add(i as u16));
            value |= u32::from(byte) << (8 * i);
        }
        value
    }

    /// Handle a write of the given width starting at `port`.
    fn write(&mut self, port: u16, width: PortWidth, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().take(width.bytes()).enumerate() {
            self.write_byte(port.wrapping_add(i as u16), *byte);
        }
    }
}

/// A port device shared between the bus and the rest of the machine.
pub type SharedPortDevice = Rc<RefCell<dyn PortDevice>>;

struct AttachedDevice {
    name: &'static str,
    device: SharedPortDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortEntry {
    owner: DeviceId,
    mode: PortMode,
}

/// Port-mapped I/O bus routing accesses to their owning device.
pub struct IoBus {
    devices: Vec<AttachedDevice>,
    ports: HashMap<u16, PortEntry>,
    /// Accesses answered with filler or dropped.
    unhandled: u64,
}

impl IoBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            ports: HashMap::new(),
            unhandled: 0,
        }
    }

    /// Attach a device. It owns no ports until it claims them.
    pub fn attach(&mut self, name: &'static str, device: SharedPortDevice) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(AttachedDevice { name, device });
        id
    }

    /// Name the device was attached under.
    pub fn device_name(&self, id: DeviceId) -> Option<&'static str> {
        self.devices.get(id.0).map(|d| d.name)
    }

    /// Claim `port` for device `id`.
    ///
    /// Re-claiming a port for its current owner only updates the mode.
    /// Claiming a port owned by another device moves it.
    pub fn register(&mut self, port: u16, id: DeviceId, mode: PortMode) -> Result<(), IoError> {
        if id.0 >= self.devices.len() {
            return Err(IoError::UnknownDevice(id));
        }
        let entry = PortEntry { owner: id, mode };
        match self.ports.insert(port, entry) {
            Some(prev) if prev.owner != id => {
                debug!(
                    "io: port {:#06x} moved from {} to {}",
                    port,
                    self.devices[prev.owner.0].name,
                    self.devices[id.0].name
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Claim `len` consecutive ports starting at `start`.
    pub fn register_range(
        &mut self,
        start: u16,
        len: u16,
        id: DeviceId,
        mode: PortMode,
    ) -> Result<(), IoError> {
        for offset in 0..len {
            self.register(start.wrapping_add(offset), id, mode)?;
        }
        Ok(())
    }

    /// Drop the claim on `port`, returning its previous owner.
    pub fn unregister(&mut self, port: u16) -> Option<DeviceId> {
        self.ports.remove(&port).map(|e| e.owner)
    }

    /// Drop every claim held by `id`.
    pub fn release(&mut self, id: DeviceId) {
        self.ports.retain(|_, e| e.owner != id);
    }

    /// Device owning `port`, if any.
    pub fn owner(&self, port: u16) -> Option<DeviceId> {
        self.ports.get(&port).map(|e| e.owner)
    }

    /// Mode `port` was claimed with, if claimed.
    pub fn mode(&self, port: u16) -> Option<PortMode> {
        self.ports.get(&port).map(|e| e.mode)
    }

    /// All ports claimed by `id`, ascending.
    pub fn ports_of(&self, id: DeviceId) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .ports
            .iter()
            .filter(|(_, e)| e.owner == id)
            .map(|(p, _)| *p)
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Number of accesses that hit an unknown or direction-restricted port.
    pub fn unhandled_accesses(&self) -> u64 {
        self.unhandled
    }

    /// Read from `port`, reporting why the access could not be delivered.
    pub fn try_read(&mut self, port: u16, width: PortWidth) -> Result<u32, IoError> {
        let entry = *self.ports.get(&port).ok_or(IoError::UnknownPort { port })?;
        let attached = &self.devices[entry.owner.0];
        if entry.mode == PortMode::WriteOnly {
            return Err(IoError::WriteOnlyPort {
                port,
                owner: attached.name,
            });
        }
        let value = attached.device.borrow_mut().read(port, width);
        Ok(value & width.mask())
    }

    /// Write to `port`, reporting why the access could not be delivered.
    pub fn try_write(&mut self, port: u16, width: PortWidth, value: u32) -> Result<(), IoError> {
        let entry = *self.ports.get(&port).ok_or(IoError::UnknownPort { port })?;
        let attached = &self.devices[entry.owner.0];
        if entry.mode == PortMode::ReadOnly {
            return Err(IoError::ReadOnlyPort {
                port,
                owner: attached.name,
            });
        }
        attached
            .device
            .borrow_mut()
            .write(port, width, value & width.mask());
        Ok(())
    }

    /// Read from `port` the way the guest sees it: undeliverable reads
    /// return the floating-bus filler for `width`.
    pub fn read(&mut self, port: u16, width: PortWidth) -> u32 {
        match self.try_read(port, width) {
            Ok(value) => value,
            Err(err) => {
                self.unhandled += 1;
                debug!("io: IN {:?} -> filler ({err})", width);
                width.filler()
            }
        }
    }

    /// Write to `port` the way the guest sees it: undeliverable writes are
    /// dropped.
    pub fn write(&mut self, port: u16, width: PortWidth, value: u32) {
        if let Err(err) = self.try_write(port, width, value) {
            self.unhandled += 1;
            debug!("io: OUT {:?} {:#x} dropped ({err})", width, value);
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, PortWidth::Byte) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, PortWidth::Byte, u32::from(value));
    }
}

impl Default for IoBus {
    fn default() -> Self {
        Self::new()
    }
}
