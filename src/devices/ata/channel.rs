//! One ATA channel: task file registers, PIO data phases and the command set.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use super::atapi::{self, PacketResult};
use super::drive::{Carrier, Drive, DriveKind, DriveRole, DriveState};
use super::image::DiskImage;
use super::{AtaError, DRIVES_PER_CHANNEL, SECTOR_SIZE};
use crate::clock::{ClockError, SharedClock, TimerClient, TimerHandle};
use crate::io::{PortDevice, PortMode, PortWidth};
use crate::module::{Module, ModuleError, ResetContext};
use crate::pic::IrqLine;

bitflags! {
    /// Status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        const ERR = 0x01;
        const DRQ = 0x08;
        const DSC = 0x10;
        const DF = 0x20;
        const DRDY = 0x40;
        const BSY = 0x80;
    }
}

impl Status {
    const READY: Status = Status::DRDY.union(Status::DSC);
}

// Error register bits.
const ERR_ABRT: u8 = 0x04;
const ERR_IDNF: u8 = 0x10;
const ERR_UNC: u8 = 0x40;

// Device control register bits.
const CTRL_NIEN: u8 = 0x02;
const CTRL_SRST: u8 = 0x04;

const DEV_SLAVE: u8 = 0x10;
const DEV_LBA: u8 = 0x40;

// ATAPI interrupt reason, reported in the sector count register.
const IREASON_COD: u8 = 0x01;
const IREASON_IO: u8 = 0x02;

const PACKET_LEN: usize = 12;

/// Port layout and IRQ of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPorts {
    /// Command block: data register through command/status.
    pub base: u16,
    /// Control block base; only `+6` and `+7` belong to the channel.
    pub control: u16,
    pub irq: u8,
}

impl ChannelPorts {
    pub const PRIMARY: ChannelPorts = ChannelPorts {
        base: 0x1F0,
        control: 0x3F0,
        irq: 14,
    };

    pub const SECONDARY: ChannelPorts = ChannelPorts {
        base: 0x170,
        control: 0x370,
        irq: 15,
    };

    pub fn for_channel(index: usize) -> Self {
        if index == 0 {
            Self::PRIMARY
        } else {
            Self::SECONDARY
        }
    }
}

const NAMES: [&str; 2] = ["ata0", "ata1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Sectors read from disk.
    ReadSectors,
    /// Sectors headed to disk at `lba`.
    WriteSectors { lba: u64 },
    Identify,
    /// A command packet being written.
    Packet,
    /// Packet command response data.
    PacketData,
}

/// An in-progress PIO transfer.
#[derive(Debug)]
struct Transfer {
    phase: Phase,
    data: Vec<u8>,
    pos: usize,
    /// One interrupt per block.
    block: usize,
    block_end: usize,
}

impl Transfer {
    fn new(phase: Phase, data: Vec<u8>, block: usize) -> Self {
        let block = block.max(2);
        let block_end = block.min(data.len());
        Self {
            phase,
            data,
            pos: 0,
            block,
            block_end,
        }
    }

    fn is_inbound(&self) -> bool {
        matches!(self.phase, Phase::ReadSectors | Phase::Identify | Phase::PacketData)
    }
}

/// Work waiting for the completion timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Command(u8),
    Packet([u8; PACKET_LEN]),
}

pub struct AtaChannel {
    index: usize,
    ports: ChannelPorts,
    drives: [Drive; DRIVES_PER_CHANNEL],
    selected: usize,

    features: u8,
    sector_count: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    device: u8,
    status: Status,
    error: u8,
    control: u8,

    transfer: Option<Transfer>,
    pending: Option<Pending>,
    irq: Option<IrqLine>,
    timer: Option<TimerHandle>,
    command_delay_us: u64,
}

pub type SharedAtaChannel = Rc<RefCell<AtaChannel>>;

impl AtaChannel {
    pub fn new(index: usize, command_delay_us: u64) -> Self {
        Self {
            index,
            ports: ChannelPorts::for_channel(index),
            drives: [Drive::new(DriveRole::Master), Drive::new(DriveRole::Slave)],
            selected: 0,
            features: 0,
            sector_count: 0,
            lba0: 0,
            lba1: 0,
            lba2: 0,
            device: 0,
            status: Status::empty(),
            error: 0,
            control: 0,
            transfer: None,
            pending: None,
            irq: None,
            timer: None,
            command_delay_us,
        }
    }

    /// Register the channel's one-shot completion timer.
    ///
    /// Without one, commands complete synchronously.
    pub fn attach_timer(this: &SharedAtaChannel, clock: &SharedClock) -> Result<(), ClockError> {
        let delay = this.borrow().command_delay_us;
        let owner = this.borrow().name();
        let id = clock.borrow_mut().register(owner, this.clone(), delay, false)?;
        clock.borrow_mut().set_timer_active(id, false)?;
        this.borrow_mut().timer = Some(TimerHandle::new(clock.clone(), id));
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ports(&self) -> ChannelPorts {
        self.ports
    }

    /// Assigned IRQ, `None` until the first reset.
    pub fn irq(&self) -> Option<u8> {
        self.irq.as_ref().map(IrqLine::number)
    }

    pub fn drive(&self, index: usize) -> &Drive {
        &self.drives[index % DRIVES_PER_CHANNEL]
    }

    pub fn selected_drive_index(&self) -> usize {
        self.selected
    }

    pub fn set_selected_drive_index(&mut self, index: usize) {
        self.selected = index % DRIVES_PER_CHANNEL;
        if self.selected == 1 {
            self.device |= DEV_SLAVE;
        } else {
            self.device &= !DEV_SLAVE;
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some() || self.transfer.is_some() || self.status.contains(Status::BSY)
    }

    pub fn drive_state(&self, index: usize) -> DriveState {
        let index = index % DRIVES_PER_CHANNEL;
        if !self.drives[index].is_present() {
            DriveState::Absent
        } else if index != self.selected {
            DriveState::PresentIdle
        } else if self.is_busy() {
            DriveState::Busy
        } else {
            DriveState::Selected
        }
    }

    /// Put `image` into drive slot `index`.
    pub fn attach(&mut self, index: usize, carrier: Carrier, image: DiskImage) -> Result<(), AtaError> {
        let index = index % DRIVES_PER_CHANNEL;
        if self.is_busy() {
            return Err(AtaError::Busy {
                channel: self.index,
            });
        }
        self.drives[index].attach(carrier, image)?;
        debug!(
            "{}: {:?} attached as drive {index} ({} blocks)",
            self.name(),
            self.drives[index].kind(),
            self.drives[index].total_sectors()
        );
        if index == self.selected {
            self.status = self.idle_status();
        }
        Ok(())
    }

    /// Empty drive slot `index`.
    pub fn detach(&mut self, index: usize) -> Result<Option<DiskImage>, AtaError> {
        let index = index % DRIVES_PER_CHANNEL;
        if self.is_busy() {
            return Err(AtaError::Busy {
                channel: self.index,
            });
        }
        let image = self.drives[index].detach();
        if index == self.selected {
            self.status = self.idle_status();
        }
        Ok(image)
    }

    fn current(&mut self) -> &mut Drive {
        &mut self.drives[self.selected]
    }

    fn idle_status(&self) -> Status {
        match self.drives[self.selected].kind() {
            DriveKind::None => Status::empty(),
            _ => Status::READY,
        }
    }

    fn raise_irq(&mut self) {
        if self.control & CTRL_NIEN != 0 {
            return;
        }
        if let Some(irq) = &self.irq {
            irq.raise();
        }
    }

    fn lower_irq(&mut self) {
        if let Some(irq) = &self.irq {
            irq.lower();
        }
    }

    /// Load the device signature into the task file.
    fn set_signature(&mut self) {
        self.sector_count = 1;
        self.lba0 = 1;
        if self.drives[self.selected].is_atapi() {
            self.lba1 = 0x14;
            self.lba2 = 0xEB;
        } else {
            self.lba1 = 0;
            self.lba2 = 0;
        }
    }

    /// Channel reset, as after power-on or SRST.
    fn reset_registers(&mut self) {
        self.pending = None;
        self.transfer = None;
        if let Some(timer) = &self.timer {
            timer.set_active(false);
        }
        self.set_selected_drive_index(0);
        for drive in &mut self.drives {
            drive.reset();
        }
        self.features = 0;
        self.device = 0xA0;
        self.error = 0x01;
        self.set_signature();
        self.status = self.idle_status();
        self.lower_irq();
    }

    fn sector_total(&self) -> u64 {
        if self.sector_count == 0 {
            256
        } else {
            u64::from(self.sector_count)
        }
    }

    /// Starting sector of the command, in LBA or CHS form.
    fn target_lba(&self) -> Option<u64> {
        if self.device & DEV_LBA != 0 {
            Some(
                u64::from(self.device & 0x0F) << 24
                    | u64::from(self.lba2) << 16
                    | u64::from(self.lba1) << 8
                    | u64::from(self.lba0),
            )
        } else {
            let cylinder = u16::from_le_bytes([self.lba1, self.lba2]);
            self.drives[self.selected]
                .logical_geometry()
                .to_lba(cylinder, self.device & 0x0F, self.lba0)
        }
    }

    /// Validate the addressed range of a sector command.
    fn sector_range(&self) -> Option<(u64, u64)> {
        let lba = self.target_lba()?;
        let count = self.sector_total();
        (lba + count <= self.drives[self.selected].total_sectors()).then_some((lba, count))
    }

    fn abort(&mut self, error: u8) {
        self.transfer = None;
        self.error = error;
        self.status = Status::READY | Status::ERR;
        self.raise_irq();
    }

    fn complete(&mut self) {
        self.transfer = None;
        self.error = 0;
        self.status = Status::READY;
        self.raise_irq();
    }

    fn begin_pio_in(&mut self, phase: Phase, data: Vec<u8>, block: usize) {
        self.transfer = Some(Transfer::new(phase, data, block));
        self.status = Status::READY | Status::DRQ;
        self.raise_irq();
    }

    fn begin_pio_out(&mut self, phase: Phase, len: usize, block: usize) {
        self.transfer = Some(Transfer::new(phase, vec![0; len], block));
        self.status = Status::READY | Status::DRQ;
    }

    fn write_command(&mut self, command: u8) {
        let present = self.drives[self.selected].is_present();
        if !present && command != 0x90 {
            trace!("{}: command {command:#04x} to absent drive", self.name());
            return;
        }
        if self.status.contains(Status::BSY) {
            debug!("{}: command {command:#04x} while busy ignored", self.name());
            return;
        }
        self.lower_irq();
        self.transfer = None;
        // DEVICE RESET runs immediately, even on a hung device.
        if command == 0x08 {
            self.execute(command);
            return;
        }
        self.schedule(Pending::Command(command));
    }

    fn schedule(&mut self, work: Pending) {
        self.status = Status::BSY;
        match &self.timer {
            Some(timer) if self.command_delay_us > 0 => {
                self.pending = Some(work);
                timer.reset(self.command_delay_us);
                timer.set_active(true);
            }
            _ => self.run(work),
        }
    }

    fn run(&mut self, work: Pending) {
        match work {
            Pending::Command(cmd) => self.execute(cmd),
            Pending::Packet(packet) => self.execute_packet(&packet),
        }
    }

    fn execute(&mut self, command: u8) {
        let kind = self.drives[self.selected].kind();
        trace!("{}: command {command:#04x} on {kind:?}", self.name());
        match (command, kind) {
            // DEVICE RESET
            (0x08, DriveKind::Cdrom) => {
                self.current().reset();
                self.set_signature();
                self.error = 0x01;
                self.status = Status::empty();
            }
            // RECALIBRATE
            (0x10..=0x1F, DriveKind::HardDisk) => self.complete(),
            // READ SECTORS
            (0x20 | 0x21, DriveKind::HardDisk) => self.read_sectors(SECTOR_SIZE),
            // WRITE SECTORS
            (0x30 | 0x31, DriveKind::HardDisk) => self.write_sectors(SECTOR_SIZE),
            // READ VERIFY SECTORS
            (0x40 | 0x41, DriveKind::HardDisk) => match self.sector_range() {
                Some(_) => self.complete(),
                None => self.abort(ERR_IDNF),
            },
            // SEEK
            (0x70..=0x7F, DriveKind::HardDisk) => self.complete(),
            // EXECUTE DEVICE DIAGNOSTIC
            (0x90, _) => {
                for drive in &mut self.drives {
                    drive.reset();
                }
                self.set_selected_drive_index(0);
                self.set_signature();
                self.error = 0x01;
                self.status = self.idle_status();
                self.raise_irq();
            }
            // INITIALIZE DEVICE PARAMETERS
            (0x91, DriveKind::HardDisk) => {
                let heads = (self.device & 0x0F) + 1;
                let sectors = self.sector_count;
                self.current().set_logical_geometry(heads, sectors);
                self.complete();
            }
            // PACKET
            (0xA0, DriveKind::Cdrom) => {
                self.sector_count = IREASON_COD;
                self.begin_pio_out(Phase::Packet, PACKET_LEN, PACKET_LEN);
            }
            // IDENTIFY PACKET DEVICE
            (0xA1, DriveKind::Cdrom) => {
                let data = self.drives[self.selected].identify_packet();
                self.begin_pio_in(Phase::Identify, data, SECTOR_SIZE);
            }
            // READ MULTIPLE / WRITE MULTIPLE
            (0xC4 | 0xC5, DriveKind::HardDisk) => {
                let multiple = usize::from(self.drives[self.selected].multiple());
                if multiple == 0 {
                    self.abort(ERR_ABRT);
                } else if command == 0xC4 {
                    self.read_sectors(multiple * SECTOR_SIZE);
                } else {
                    self.write_sectors(multiple * SECTOR_SIZE);
                }
            }
            // SET MULTIPLE MODE
            (0xC6, DriveKind::HardDisk) => {
                let count = self.sector_count;
                if self.current().set_multiple(count) {
                    self.complete();
                } else {
                    self.abort(ERR_ABRT);
                }
            }
            // Power management: STANDBY/IDLE IMMEDIATE, STANDBY, IDLE.
            (0xE0..=0xE3, _) => self.complete(),
            // CHECK POWER MODE: always active.
            (0xE5, _) => {
                self.complete();
                self.sector_count = 0xFF;
            }
            // FLUSH CACHE
            (0xE7, DriveKind::HardDisk) => {
                let flushed = self
                    .current()
                    .image_mut()
                    .map_or(Ok(()), DiskImage::flush);
                match flushed {
                    Ok(()) => self.complete(),
                    Err(err) => {
                        warn!("{}: flush failed: {err}", self.name());
                        self.abort(ERR_ABRT);
                    }
                }
            }
            // IDENTIFY DEVICE
            (0xEC, DriveKind::HardDisk) => {
                let data = self.drives[self.selected].identify();
                self.begin_pio_in(Phase::Identify, data, SECTOR_SIZE);
            }
            // An ATAPI device aborts IDENTIFY and shows its signature.
            (0xEC, DriveKind::Cdrom) => {
                self.set_signature();
                self.abort(ERR_ABRT);
            }
            // SET FEATURES
            (0xEF, _) => {
                debug!("{}: set features {:#04x}", self.name(), self.features);
                self.complete();
            }
            _ => {
                debug!("{}: unsupported command {command:#04x} for {kind:?}", self.name());
                self.abort(ERR_ABRT);
            }
        }
    }

    fn read_sectors(&mut self, block: usize) {
        let Some((lba, count)) = self.sector_range() else {
            self.abort(ERR_IDNF);
            return;
        };
        let read = match self.current().image_mut() {
            Some(image) => image.read_blocks(lba, count, SECTOR_SIZE),
            None => {
                self.abort(ERR_ABRT);
                return;
            }
        };
        match read {
            Ok(data) => self.begin_pio_in(Phase::ReadSectors, data, block),
            Err(err) => {
                warn!("{}: read of {count} sectors at {lba} failed: {err}", self.name());
                self.abort(ERR_UNC);
            }
        }
    }

    fn write_sectors(&mut self, block: usize) {
        let Some((lba, count)) = self.sector_range() else {
            self.abort(ERR_IDNF);
            return;
        };
        let protected = self.drives[self.selected]
            .image()
            .is_some_and(DiskImage::is_write_protected);
        if protected {
            self.abort(ERR_ABRT);
            return;
        }
        self.begin_pio_out(Phase::WriteSectors { lba }, count as usize * SECTOR_SIZE, block);
    }

    fn execute_packet(&mut self, packet: &[u8; PACKET_LEN]) {
        let limit = match u16::from_le_bytes([self.lba1, self.lba2]) {
            0 | 0xFFFF => 0xFFFE,
            n => n & !1,
        };
        match atapi::handle_packet(self.current(), packet) {
            PacketResult::DataIn(data) if !data.is_empty() => {
                let block = usize::from(limit);
                self.set_byte_count(block.min(data.len()));
                self.sector_count = IREASON_IO;
                self.begin_pio_in(Phase::PacketData, data, block);
            }
            PacketResult::DataIn(_) | PacketResult::NoData => {
                self.sector_count = IREASON_IO | IREASON_COD;
                self.complete();
            }
            PacketResult::Error(sense) => {
                self.sector_count = IREASON_IO | IREASON_COD;
                self.abort(sense.key.code() << 4 | ERR_ABRT);
            }
        }
    }

    fn set_byte_count(&mut self, count: usize) {
        let [lo, hi] = (count.min(0xFFFF) as u16).to_le_bytes();
        self.lba1 = lo;
        self.lba2 = hi;
    }

    fn read_data(&mut self, bytes: usize) -> u32 {
        let Some(xfer) = self.transfer.as_mut().filter(|t| t.is_inbound()) else {
            return 0xFFFF_FFFF >> (32 - 8 * bytes);
        };
        let mut value = 0u32;
        for i in 0..bytes {
            let byte = xfer.data.get(xfer.pos).copied().unwrap_or(0);
            value |= u32::from(byte) << (8 * i);
            xfer.pos += 1;
        }
        if xfer.pos >= xfer.block_end {
            self.end_block();
        }
        value
    }

    fn write_data(&mut self, value: u32, bytes: usize) {
        let Some(xfer) = self.transfer.as_mut().filter(|t| !t.is_inbound()) else {
            return;
        };
        for byte in value.to_le_bytes().iter().take(bytes) {
            if let Some(slot) = xfer.data.get_mut(xfer.pos) {
                *slot = *byte;
            }
            xfer.pos += 1;
        }
        if xfer.pos >= xfer.block_end {
            self.end_block();
        }
    }

    /// The guest drained or filled the current block.
    fn end_block(&mut self) {
        let Some(xfer) = self.transfer.as_mut() else {
            return;
        };
        if xfer.pos < xfer.data.len() {
            xfer.block_end = (xfer.block_end + xfer.block).min(xfer.data.len());
            let chunk = xfer.block_end - xfer.pos;
            let phase = xfer.phase;
            if phase == Phase::PacketData {
                self.set_byte_count(chunk);
            }
            self.raise_irq();
            return;
        }
        let Some(xfer) = self.transfer.take() else {
            return;
        };
        match xfer.phase {
            Phase::ReadSectors | Phase::Identify => {
                self.status = Status::READY;
            }
            Phase::PacketData => {
                self.sector_count = IREASON_IO | IREASON_COD;
                self.complete();
            }
            Phase::Packet => {
                let mut packet = [0u8; PACKET_LEN];
                packet.copy_from_slice(&xfer.data[..PACKET_LEN]);
                self.schedule(Pending::Packet(packet));
            }
            Phase::WriteSectors { lba } => {
                let written = match self.current().image_mut() {
                    Some(image) => image.write_blocks(lba, SECTOR_SIZE, &xfer.data),
                    None => Ok(()),
                };
                match written {
                    Ok(()) => self.complete(),
                    Err(err) => {
                        warn!("{}: write at sector {lba} failed: {err}", self.name());
                        self.abort(ERR_ABRT);
                    }
                }
            }
        }
    }

    fn write_control(&mut self, value: u8) {
        let was_reset = self.control & CTRL_SRST != 0;
        self.control = value;
        if value & CTRL_NIEN != 0 {
            self.lower_irq();
        }
        match (was_reset, value & CTRL_SRST != 0) {
            (false, true) => {
                self.pending = None;
                self.transfer = None;
                self.status = Status::BSY;
            }
            (true, false) => {
                debug!("{}: soft reset", self.name());
                self.reset_registers();
            }
            _ => {}
        }
    }

    /// Drive address register (`control + 7`).
    fn drive_address(&self) -> u8 {
        let head = self.device & 0x0F;
        let select = if self.selected == 0 { 0x02 } else { 0x01 };
        0xC0 | ((!head & 0x0F) << 2) | select
    }

    fn read_register(&mut self, offset: u16) -> u8 {
        match offset {
            1 => self.error,
            2 => self.sector_count,
            3 => self.lba0,
            4 => self.lba1,
            5 => self.lba2,
            6 => self.device | 0xA0,
            _ => {
                self.lower_irq();
                self.alternate_status()
            }
        }
    }

    fn alternate_status(&self) -> u8 {
        if self.drives[self.selected].is_present() {
            self.status.bits()
        } else {
            0
        }
    }

    fn write_register(&mut self, offset: u16, value: u8) {
        // Task file writes are ignored while the device is busy.
        if offset != 7 && self.status.contains(Status::BSY) {
            return;
        }
        match offset {
            1 => self.features = value,
            2 => self.sector_count = value,
            3 => self.lba0 = value,
            4 => self.lba1 = value,
            5 => self.lba2 = value,
            6 => {
                self.device = value;
                self.selected = usize::from(value & DEV_SLAVE != 0);
            }
            _ => self.write_command(value),
        }
    }
}

impl PortDevice for AtaChannel {
    fn read_byte(&mut self, port: u16) -> u8 {
        let ports = self.ports;
        match port {
            p if p == ports.base => self.read_data(1) as u8,
            p if p > ports.base && p < ports.base + 8 => self.read_register(p - ports.base),
            p if p == ports.control + 6 => self.alternate_status(),
            p if p == ports.control + 7 => self.drive_address(),
            _ => 0xFF,
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        let ports = self.ports;
        match port {
            p if p == ports.base => self.write_data(u32::from(value), 1),
            p if p > ports.base && p < ports.base + 8 => self.write_register(p - ports.base, value),
            p if p == ports.control + 6 => self.write_control(value),
            _ => trace!("{}: write {value:#04x} to {port:#x} dropped", self.name()),
        }
    }

    fn read(&mut self, port: u16, width: PortWidth) -> u32 {
        if port == self.ports.base {
            return self.read_data(width.bytes());
        }
        let mut value = 0u32;
        for i in 0..width.bytes() {
            value |= u32::from(self.read_byte(port.wrapping_add(i as u16))) << (8 * i);
        }
        value
    }

    fn write(&mut self, port: u16, width: PortWidth, value: u32) {
        if port == self.ports.base {
            self.write_data(value, width.bytes());
            return;
        }
        for (i, byte) in value.to_le_bytes().iter().take(width.bytes()).enumerate() {
            self.write_byte(port.wrapping_add(i as u16), *byte);
        }
    }
}

impl TimerClient for AtaChannel {
    fn on_timer(&mut self) {
        if let Some(work) = self.pending.take() {
            self.run(work);
        }
    }
}

impl Module for AtaChannel {
    fn name(&self) -> &'static str {
        NAMES[self.index % NAMES.len()]
    }

    fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
        let defaults = ChannelPorts::for_channel(self.index);
        ctx.release_ports();
        self.ports = defaults;

        let irq = ctx.request_irq(self.name(), Some(defaults.irq))?;
        debug!("{}: irq {}", self.name(), irq.number());
        self.irq = Some(irq);

        ctx.claim_range(defaults.base, 8, PortMode::ReadWrite)?;
        ctx.claim_port(defaults.control + 6, PortMode::ReadWrite)?;
        ctx.claim_port(defaults.control + 7, PortMode::ReadOnly)?;

        self.control = 0;
        self.reset_registers();
        Ok(())
    }

    fn dump(&self) -> String {
        let mut out = format!(
            "{}: ports {:#x}/{:#x} irq {} status {:#04x} error {:#04x} selected {}\n",
            self.name(),
            self.ports.base,
            self.ports.control + 6,
            self.irq().map_or("-".to_string(), |n| n.to_string()),
            self.status.bits(),
            self.error,
            self.selected
        );
        let _ = writeln!(
            out,
            "  task file: sc={:#04x} lba={:02x}{:02x}{:02x} dev={:#04x} features={:#04x}",
            self.sector_count, self.lba2, self.lba1, self.lba0, self.device, self.features
        );
        for (i, drive) in self.drives.iter().enumerate() {
            let media = drive
                .image()
                .map_or("no media".to_string(), |img| format!("{} ({} bytes)", img.name(), img.len()));
            let _ = writeln!(
                out,
                "  drive {i}: {:?} {:?} {media}",
                drive.kind(),
                self.drive_state(i)
            );
        }
        out
    }

    fn connections(&self) -> &'static [&'static str] {
        &["pic"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{self, Clock, ClockConfig};
    use crate::devices::ata::CD_BLOCK_SIZE;
    use crate::io::IoBus;
    use crate::pic::{DualPic, SharedPic};

    struct Rig {
        bus: IoBus,
        pic: SharedPic,
        clock: SharedClock,
        channel: SharedAtaChannel,
    }

    impl Rig {
        fn new(index: usize, delay_us: u64) -> Self {
            let pic: SharedPic = Rc::new(RefCell::new(DualPic::new()));
            let clock = Clock::shared(ClockConfig::default());
            let channel = Rc::new(RefCell::new(AtaChannel::new(index, delay_us)));
            AtaChannel::attach_timer(&channel, &clock).unwrap();
            let mut bus = IoBus::new();
            let id = bus.attach("ata", channel.clone());
            {
                let mut ctx = ResetContext::new(&mut bus, Some(id), &pic, &clock);
                channel.borrow_mut().reset(&mut ctx).unwrap();
            }
            Self {
                bus,
                pic,
                clock,
                channel,
            }
        }

        fn hard_disk(self, sectors: usize) -> Self {
            let mut data = vec![0u8; sectors * SECTOR_SIZE];
            for (i, s) in data.chunks_mut(SECTOR_SIZE).enumerate() {
                s.fill(i as u8);
            }
            let image = DiskImage::from_bytes("hd", data, false);
            self.channel
                .borrow_mut()
                .attach(0, Carrier::HardDisk, image)
                .unwrap();
            self
        }

        fn out(&mut self, port: u16, value: u8) {
            self.bus.write_u8(port, value);
        }

        fn inb(&mut self, port: u16) -> u8 {
            self.bus.read_u8(port)
        }

        fn inw(&mut self, port: u16) -> u16 {
            self.bus.read(port, PortWidth::Word) as u16
        }

        fn outw(&mut self, port: u16, value: u16) {
            self.bus.write(port, PortWidth::Word, u32::from(value));
        }

        fn wait(&mut self) {
            clock::advance(&self.clock, 1_000);
        }

        fn irq_pending(&self) -> bool {
            self.pic.borrow().intr()
        }

        /// Acknowledge and retire IRQ 14 if it is pending.
        fn take_irq(&self) -> bool {
            let mut pic = self.pic.borrow_mut();
            let vector = pic.acknowledge();
            if vector.is_some() {
                pic.end_of_interrupt(Some(14)).unwrap();
            }
            vector == Some(0x76)
        }
    }

    fn unmask_all(pic: &SharedPic) {
        let mut pic = pic.borrow_mut();
        pic.port_write(0x21, 0x00);
        pic.port_write(0xA1, 0x00);
    }

    #[test]
    fn test_reset_claims_primary_ports() {
        let rig = Rig::new(0, 0);
        let owner = rig.bus.owner(0x1F0);
        assert!(owner.is_some());
        for port in 0x1F0..=0x1F7 {
            assert_eq!(rig.bus.owner(port), owner, "port {port:#x}");
        }
        assert_eq!(rig.bus.owner(0x3F6), owner);
        assert_eq!(rig.bus.owner(0x3F7), owner);
        assert_eq!(rig.bus.mode(0x3F7), Some(PortMode::ReadOnly));
        assert_eq!(rig.bus.owner(0x3F0), None);
        assert_eq!(rig.channel.borrow().selected_drive_index(), 0);
        assert_eq!(rig.channel.borrow().irq(), Some(14));
    }

    #[test]
    fn test_secondary_channel_defaults() {
        let rig = Rig::new(1, 0);
        assert!(rig.bus.owner(0x170).is_some());
        assert!(rig.bus.owner(0x376).is_some());
        assert_eq!(rig.channel.borrow().irq(), Some(15));
    }

    #[test]
    fn test_attach_then_eject_is_absent() {
        let rig = Rig::new(0, 0);
        let before = rig.channel.borrow().drive_state(1);
        assert_eq!(before, DriveState::Absent);
        let image = DiskImage::from_bytes("hd", vec![0; SECTOR_SIZE * 4], false);
        rig.channel
            .borrow_mut()
            .attach(1, Carrier::HardDisk, image)
            .unwrap();
        assert_eq!(rig.channel.borrow().drive_state(1), DriveState::PresentIdle);
        rig.channel.borrow_mut().detach(1).unwrap();
        assert_eq!(rig.channel.borrow().drive_state(1), before);
        assert_eq!(rig.channel.borrow().drive(1).kind(), DriveKind::None);
    }

    #[test]
    fn test_absent_drive_reads_zero_status() {
        let mut rig = Rig::new(0, 0);
        assert_eq!(rig.inb(0x1F7), 0);
        rig.out(0x1F7, 0xEC);
        assert_eq!(rig.inb(0x1F7), 0);
    }

    #[test]
    fn test_identify_over_ports() {
        let mut rig = Rig::new(0, 0).hard_disk(16 * 63 * 2);
        rig.out(0x1F6, 0xA0);
        rig.out(0x1F7, 0xEC);
        let status = rig.inb(0x1F7);
        assert_eq!(status & 0x88, 0x08);
        let words: Vec<u16> = (0..256).map(|_| rig.inw(0x1F0)).collect();
        assert_eq!(words[1], 2);
        assert_eq!(words[3], 16);
        assert_eq!(words[6], 63);
        assert_eq!(rig.inb(0x1F7) & 0x08, 0);
    }

    #[test]
    fn test_read_sectors_lba() {
        let mut rig = Rig::new(0, 0).hard_disk(64);
        rig.out(0x1F2, 2);
        rig.out(0x1F3, 5);
        rig.out(0x1F4, 0);
        rig.out(0x1F5, 0);
        rig.out(0x1F6, 0xE0);
        rig.out(0x1F7, 0x20);
        let mut data = Vec::new();
        for _ in 0..512 {
            data.extend_from_slice(&rig.inw(0x1F0).to_le_bytes());
        }
        assert!(data[..512].iter().all(|b| *b == 5));
        assert!(data[512..].iter().all(|b| *b == 6));
        assert_eq!(rig.inb(0x1F7), 0x50);
    }

    #[test]
    fn test_read_sectors_chs() {
        let mut rig = Rig::new(0, 0).hard_disk(16 * 63 * 2);
        // Cylinder 1, head 0, sector 1 is LBA 16 * 63.
        rig.out(0x1F2, 1);
        rig.out(0x1F3, 1);
        rig.out(0x1F4, 1);
        rig.out(0x1F5, 0);
        rig.out(0x1F6, 0xA0);
        rig.out(0x1F7, 0x20);
        let first = rig.inw(0x1F0);
        assert_eq!(first, u16::from_le_bytes([(16 * 63) as u8; 2]));
    }

    #[test]
    fn test_read_out_of_range_aborts() {
        let mut rig = Rig::new(0, 0).hard_disk(8);
        rig.out(0x1F2, 1);
        rig.out(0x1F3, 8);
        rig.out(0x1F6, 0xE0);
        rig.out(0x1F7, 0x20);
        assert_eq!(rig.inb(0x1F7) & 0x01, 0x01);
        assert_eq!(rig.inb(0x1F1), ERR_IDNF);
    }

    #[test]
    fn test_write_then_read_back() {
        let mut rig = Rig::new(0, 0).hard_disk(8);
        rig.out(0x1F2, 1);
        rig.out(0x1F3, 3);
        rig.out(0x1F6, 0xE0);
        rig.out(0x1F7, 0x30);
        assert_eq!(rig.inb(0x1F7) & 0x08, 0x08);
        for _ in 0..256 {
            rig.outw(0x1F0, 0xBEEF);
        }
        assert_eq!(rig.inb(0x1F7), 0x50);

        rig.out(0x1F2, 1);
        rig.out(0x1F3, 3);
        rig.out(0x1F7, 0x20);
        assert_eq!(rig.inw(0x1F0), 0xBEEF);
    }

    #[test]
    fn test_write_protected_disk_aborts_writes() {
        let mut rig = Rig::new(0, 0);
        let image = DiskImage::from_bytes("ro", vec![0; SECTOR_SIZE * 4], true);
        rig.channel
            .borrow_mut()
            .attach(0, Carrier::HardDisk, image)
            .unwrap();
        rig.out(0x1F2, 1);
        rig.out(0x1F6, 0xE0);
        rig.out(0x1F7, 0x30);
        assert_eq!(rig.inb(0x1F7), 0x51);
        assert_eq!(rig.inb(0x1F1), ERR_ABRT);
    }

    #[test]
    fn test_unknown_command_aborts() {
        let mut rig = Rig::new(0, 0).hard_disk(8);
        rig.out(0x1F7, 0xFE);
        assert_eq!(rig.inb(0x1F7), 0x51);
        assert_eq!(rig.inb(0x1F1), ERR_ABRT);
    }

    #[test]
    fn test_delayed_completion_and_irq() {
        let mut rig = Rig::new(0, 100).hard_disk(8);
        unmask_all(&rig.pic);
        rig.out(0x1F7, 0xEC);
        assert_eq!(rig.inb(0x3F6) & 0x80, 0x80);
        assert_eq!(rig.channel.borrow().drive_state(0), DriveState::Busy);
        let spare = DiskImage::from_bytes("spare", vec![0; SECTOR_SIZE], false);
        let err = rig
            .channel
            .borrow_mut()
            .attach(0, Carrier::HardDisk, spare)
            .unwrap_err();
        assert!(matches!(err, AtaError::Busy { channel: 0 }));

        rig.wait();
        assert_eq!(rig.inb(0x3F6) & 0x88, 0x08);
        assert!(rig.irq_pending());
        assert!(rig.take_irq());
    }

    #[test]
    fn test_other_slot_locked_while_command_in_flight() {
        let mut rig = Rig::new(0, 100).hard_disk(8);
        rig.out(0x1F7, 0xEC);
        assert_eq!(rig.channel.borrow().drive_state(0), DriveState::Busy);

        let spare = DiskImage::from_bytes("spare", vec![0; SECTOR_SIZE], false);
        let err = rig
            .channel
            .borrow_mut()
            .attach(1, Carrier::HardDisk, spare)
            .unwrap_err();
        assert!(matches!(err, AtaError::Busy { channel: 0 }));
        let err = rig.channel.borrow_mut().detach(1).unwrap_err();
        assert!(matches!(err, AtaError::Busy { channel: 0 }));
        assert_eq!(rig.channel.borrow().drive_state(1), DriveState::Absent);

        // Still locked during the data phase; free once it is drained.
        rig.wait();
        for _ in 0..256 {
            rig.inw(0x1F0);
        }
        let spare = DiskImage::from_bytes("spare", vec![0; SECTOR_SIZE], false);
        rig.channel
            .borrow_mut()
            .attach(1, Carrier::HardDisk, spare)
            .unwrap();
        assert_eq!(rig.channel.borrow().drive_state(1), DriveState::PresentIdle);
    }

    #[test]
    fn test_nien_suppresses_irq() {
        let mut rig = Rig::new(0, 0).hard_disk(8);
        unmask_all(&rig.pic);
        rig.out(0x3F6, CTRL_NIEN);
        rig.out(0x1F7, 0xE7);
        assert!(!rig.irq_pending());
    }

    #[test]
    fn test_soft_reset_restores_signature() {
        let mut rig = Rig::new(0, 0).hard_disk(8);
        rig.out(0x1F6, 0xB0);
        rig.out(0x1F3, 0x77);
        rig.out(0x3F6, CTRL_SRST);
        rig.out(0x3F6, 0);
        assert_eq!(rig.channel.borrow().selected_drive_index(), 0);
        assert_eq!(rig.inb(0x1F3), 1);
        assert_eq!(rig.inb(0x1F2), 1);
        assert_eq!(rig.inb(0x1F7), 0x50);
    }

    #[test]
    fn test_set_multiple_and_read_multiple() {
        let mut rig = Rig::new(0, 0).hard_disk(16);
        unmask_all(&rig.pic);
        rig.out(0x1F2, 4);
        rig.out(0x1F7, 0xC6);
        assert!(rig.take_irq());
        assert_eq!(rig.inb(0x1F7), 0x50);

        rig.out(0x1F2, 8);
        rig.out(0x1F3, 0);
        rig.out(0x1F6, 0xE0);
        rig.out(0x1F7, 0xC4);
        assert!(rig.take_irq());
        rig.inb(0x1F7);
        // One interrupt per block of four sectors.
        for _ in 0..(4 * 256) {
            rig.inw(0x1F0);
        }
        assert!(rig.take_irq());
        assert_eq!(rig.inb(0x1F7) & 0x08, 0x08);
        for _ in 0..(4 * 256) {
            rig.inw(0x1F0);
        }
        assert!(!rig.take_irq());
        assert_eq!(rig.inb(0x1F7), 0x50);
    }

    #[test]
    fn test_atapi_signature_and_read() {
        let mut rig = Rig::new(1, 0);
        let mut data = vec![0u8; CD_BLOCK_SIZE * 4];
        data[CD_BLOCK_SIZE * 2] = 0xCD;
        let image = DiskImage::from_bytes("cd", data, true);
        rig.channel
            .borrow_mut()
            .attach(0, Carrier::Cdrom, image)
            .unwrap();

        // IDENTIFY DEVICE aborts and leaves the packet signature.
        rig.out(0x177, 0xEC);
        assert_eq!(rig.inb(0x177) & 0x01, 0x01);
        assert_eq!((rig.inb(0x174), rig.inb(0x175)), (0x14, 0xEB));

        let send = |rig: &mut Rig, packet: [u8; 12]| {
            rig.out(0x174, 0x00);
            rig.out(0x175, 0x08);
            rig.out(0x177, 0xA0);
            assert_eq!(rig.inb(0x172), IREASON_COD);
            for pair in packet.chunks(2) {
                rig.outw(0x170, u16::from_le_bytes([pair[0], pair[1]]));
            }
        };

        // Clear the pending medium-change attention.
        send(&mut rig, [0; 12]);
        assert_eq!(rig.inb(0x177) & 0x01, 0x01);
        assert_eq!(rig.inb(0x171) >> 4, 0x06);

        send(&mut rig, [0x28, 0, 0, 0, 0, 2, 0, 0, 1, 0, 0, 0]);
        assert_eq!(rig.inb(0x177) & 0x08, 0x08);
        assert_eq!(rig.inb(0x172), IREASON_IO);
        let count = u16::from_le_bytes([rig.inb(0x174), rig.inb(0x175)]);
        assert_eq!(usize::from(count), CD_BLOCK_SIZE);
        assert_eq!(rig.inw(0x170), 0x00CD);
        for _ in 1..(CD_BLOCK_SIZE / 2) {
            rig.inw(0x170);
        }
        assert_eq!(rig.inb(0x172), IREASON_IO | IREASON_COD);
        assert_eq!(rig.inb(0x177), 0x50);
    }
}
