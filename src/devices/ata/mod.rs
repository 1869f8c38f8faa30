//! ATA/IDE controller: two channels with up to two drives each.
//!
//! Hard disks speak the ATA command set over PIO; CD-ROM drives are ATAPI
//! devices that accept SCSI packets through the PACKET command.

pub mod atapi;
pub mod channel;
pub mod drive;
pub mod image;

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;

use thiserror::Error;

pub use channel::{AtaChannel, ChannelPorts, SharedAtaChannel};
pub use drive::{Carrier, Drive, DriveKind, DriveRole, DriveState};
pub use image::{BlockBackend, DiskImage, FileBackend, MemoryBackend};

/// Bytes per hard-disk sector.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per CD-ROM block.
pub const CD_BLOCK_SIZE: usize = 2048;

/// Largest sector count addressable with 28-bit LBA.
pub const LBA28_LIMIT: u64 = 1 << 28;

/// Drives per channel.
pub const DRIVES_PER_CHANNEL: usize = 2;

/// Channels on a legacy PC.
pub const MAX_CHANNELS: usize = 2;

#[derive(Error, Debug)]
pub enum AtaError {
    #[error("invalid drive selector {0:?}")]
    InvalidSelector(String),

    #[error("drive {0} does not exist on this controller")]
    NoSuchDrive(DriveSelector),

    #[error("{0:?} media cannot be attached to an ATA channel")]
    UnsupportedCarrier(Carrier),

    #[error("image {name} is empty")]
    EmptyImage { name: String },

    #[error("image {name} is {len} bytes, not a whole number of {block}-byte blocks")]
    Misaligned { name: String, len: u64, block: usize },

    #[error("image {name} has {sectors} sectors, beyond the 28-bit LBA limit")]
    TooLarge { name: String, sectors: u64 },

    #[error("channel {channel} has a command in flight")]
    Busy { channel: usize },

    #[error("failed to open image {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Addresses one drive slot: channel and master/slave position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriveSelector {
    pub channel: usize,
    pub drive: usize,
}

impl DriveSelector {
    pub const fn new(channel: usize, drive: usize) -> Self {
        Self { channel, drive }
    }

    /// Flat index: 0 primary master .. 3 secondary slave.
    pub fn index(self) -> usize {
        self.channel * DRIVES_PER_CHANNEL + self.drive
    }

    pub fn from_index(index: usize) -> Option<Self> {
        (index < MAX_CHANNELS * DRIVES_PER_CHANNEL).then(|| {
            Self::new(index / DRIVES_PER_CHANNEL, index % DRIVES_PER_CHANNEL)
        })
    }
}

impl fmt::Display for DriveSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = match self.channel {
            0 => "primary",
            1 => "secondary",
            n => return write!(f, "channel{n}-drive{}", self.drive),
        };
        let role = if self.drive == 0 { "master" } else { "slave" };
        write!(f, "{channel}-{role}")
    }
}

impl FromStr for DriveSelector {
    type Err = AtaError;

    /// Accepts `0`..`3`, `hd0`..`hd3`, or `primary-master` style names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let index = match lower.as_str() {
            "primary-master" | "pm" => Some(0),
            "primary-slave" | "ps" => Some(1),
            "secondary-master" | "sm" => Some(2),
            "secondary-slave" | "ss" => Some(3),
            other => other
                .strip_prefix("hd")
                .unwrap_or(other)
                .parse::<usize>()
                .ok(),
        };
        index
            .and_then(Self::from_index)
            .ok_or_else(|| AtaError::InvalidSelector(s.to_string()))
    }
}

/// The set of ATA channels, addressed by [`DriveSelector`].
pub struct AtaController {
    channels: Vec<SharedAtaChannel>,
}

impl AtaController {
    /// Build `count` channels (clamped to [`MAX_CHANNELS`]).
    pub fn new(count: usize, command_delay_us: u64) -> Self {
        let channels = (0..count.min(MAX_CHANNELS))
            .map(|i| Rc::new(RefCell::new(AtaChannel::new(i, command_delay_us))))
            .collect();
        Self { channels }
    }

    pub fn channels(&self) -> &[SharedAtaChannel] {
        &self.channels
    }

    fn channel(&self, selector: DriveSelector) -> Result<&SharedAtaChannel, AtaError> {
        if selector.drive >= DRIVES_PER_CHANNEL {
            return Err(AtaError::NoSuchDrive(selector));
        }
        self.channels
            .get(selector.channel)
            .ok_or(AtaError::NoSuchDrive(selector))
    }

    /// Attach `image` to the slot named by `selector`.
    pub fn insert(
        &self,
        selector: DriveSelector,
        carrier: Carrier,
        mut image: DiskImage,
        write_protected: bool,
    ) -> Result<(), AtaError> {
        if write_protected {
            image.set_write_protected(true);
        }
        self.channel(selector)?
            .borrow_mut()
            .attach(selector.drive, carrier, image)
    }

    /// Detach the image in `selector`, leaving the slot absent.
    pub fn eject(&self, selector: DriveSelector) -> Result<Option<DiskImage>, AtaError> {
        self.channel(selector)?.borrow_mut().detach(selector.drive)
    }

    pub fn drive_kind(&self, selector: DriveSelector) -> Result<DriveKind, AtaError> {
        Ok(self.channel(selector)?.borrow().drive(selector.drive).kind())
    }

    pub fn drive_state(&self, selector: DriveSelector) -> Result<DriveState, AtaError> {
        Ok(self.channel(selector)?.borrow().drive_state(selector.drive))
    }
}
