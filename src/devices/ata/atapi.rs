//! SCSI packet commands for ATAPI CD-ROM drives.

use tracing::{debug, warn};

use super::drive::Drive;
use super::CD_BLOCK_SIZE;

/// SCSI sense keys reported by the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenseKey {
    #[default]
    NoSense,
    NotReady,
    MediumError,
    IllegalRequest,
    UnitAttention,
}

impl SenseKey {
    pub fn code(self) -> u8 {
        match self {
            SenseKey::NoSense => 0x00,
            SenseKey::NotReady => 0x02,
            SenseKey::MediumError => 0x03,
            SenseKey::IllegalRequest => 0x05,
            SenseKey::UnitAttention => 0x06,
        }
    }
}

const ASC_UNRECOVERED_READ: u8 = 0x11;
const ASC_INVALID_COMMAND: u8 = 0x20;
const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
const ASC_INVALID_FIELD: u8 = 0x24;
const ASC_MEDIUM_CHANGED: u8 = 0x28;
const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

/// Largest single READ transfer, in blocks.
const MAX_READ_BLOCKS: u32 = 0x2000;

/// Sense data: key plus additional sense code and qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NONE: Sense = Sense {
        key: SenseKey::NoSense,
        asc: 0,
        ascq: 0,
    };

    pub const fn new(key: SenseKey, asc: u8) -> Self {
        Self { key, asc, ascq: 0 }
    }
}

/// Outcome of a packet command.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketResult {
    NoData,
    DataIn(Vec<u8>),
    Error(Sense),
}

fn truncated(mut data: Vec<u8>, alloc: usize) -> PacketResult {
    data.truncate(alloc);
    if data.is_empty() {
        PacketResult::NoData
    } else {
        PacketResult::DataIn(data)
    }
}

fn fail(drive: &mut Drive, sense: Sense) -> PacketResult {
    drive.sense = sense;
    PacketResult::Error(sense)
}

/// Report a pending medium change once, then medium presence.
fn check_ready(drive: &mut Drive) -> Result<(), PacketResult> {
    if drive.media_changed {
        drive.media_changed = false;
        return Err(fail(drive, Sense::new(SenseKey::UnitAttention, ASC_MEDIUM_CHANGED)));
    }
    if !drive.has_media() {
        return Err(fail(drive, Sense::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT)));
    }
    Ok(())
}

/// Execute one 12-byte packet against `drive`.
pub fn handle_packet(drive: &mut Drive, packet: &[u8; 12]) -> PacketResult {
    let opcode = packet[0];
    debug!("atapi: packet {opcode:#04x}");
    match opcode {
        // TEST UNIT READY
        0x00 => match check_ready(drive) {
            Ok(()) => {
                drive.sense = Sense::NONE;
                PacketResult::NoData
            }
            Err(e) => e,
        },
        // REQUEST SENSE
        0x03 => {
            let sense = drive.sense;
            drive.sense = Sense::NONE;
            truncated(request_sense(sense), usize::from(packet[4]))
        }
        // INQUIRY
        0x12 => truncated(inquiry(), usize::from(packet[4])),
        // START STOP UNIT
        0x1B => {
            let loej = packet[4] & 0x02 != 0;
            let start = packet[4] & 0x01 != 0;
            if loej {
                drive.tray_open = !start;
            }
            PacketResult::NoData
        }
        // PREVENT ALLOW MEDIUM REMOVAL
        0x1E => PacketResult::NoData,
        // READ CAPACITY
        0x25 => {
            if let Err(e) = check_ready(drive) {
                return e;
            }
            let last = drive.total_sectors().saturating_sub(1).min(u64::from(u32::MAX)) as u32;
            let mut data = Vec::with_capacity(8);
            data.extend_from_slice(&last.to_be_bytes());
            data.extend_from_slice(&(CD_BLOCK_SIZE as u32).to_be_bytes());
            PacketResult::DataIn(data)
        }
        // READ(10)
        0x28 => {
            let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
            let blocks = u32::from(u16::from_be_bytes([packet[7], packet[8]]));
            read_blocks(drive, lba, blocks)
        }
        // READ(12)
        0xA8 => {
            let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
            let blocks = u32::from_be_bytes([packet[6], packet[7], packet[8], packet[9]]);
            read_blocks(drive, lba, blocks)
        }
        // READ TOC
        0x43 => {
            if let Err(e) = check_ready(drive) {
                return e;
            }
            let alloc = usize::from(u16::from_be_bytes([packet[7], packet[8]]));
            match packet[2] & 0x0F {
                0 => truncated(read_toc(drive.total_sectors() as u32), alloc),
                format => {
                    debug!("atapi: unsupported TOC format {format}");
                    fail(drive, Sense::new(SenseKey::IllegalRequest, ASC_INVALID_FIELD))
                }
            }
        }
        // MODE SENSE(10)
        0x5A => {
            let alloc = usize::from(u16::from_be_bytes([packet[7], packet[8]]));
            match packet[2] & 0x3F {
                0x2A | 0x3F => truncated(capabilities_page(), alloc),
                _ => fail(drive, Sense::new(SenseKey::IllegalRequest, ASC_INVALID_FIELD)),
            }
        }
        _ => {
            warn!("atapi: unsupported packet opcode {opcode:#04x}");
            fail(drive, Sense::new(SenseKey::IllegalRequest, ASC_INVALID_COMMAND))
        }
    }
}

fn read_blocks(drive: &mut Drive, lba: u32, blocks: u32) -> PacketResult {
    if let Err(e) = check_ready(drive) {
        return e;
    }
    if blocks == 0 {
        return PacketResult::NoData;
    }
    if blocks > MAX_READ_BLOCKS {
        return fail(drive, Sense::new(SenseKey::IllegalRequest, ASC_INVALID_FIELD));
    }
    let end = u64::from(lba) + u64::from(blocks);
    if end > drive.total_sectors() {
        return fail(drive, Sense::new(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE));
    }
    let result = match drive.image_mut() {
        Some(image) => image.read_blocks(u64::from(lba), u64::from(blocks), CD_BLOCK_SIZE),
        None => return fail(drive, Sense::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT)),
    };
    match result {
        Ok(data) => PacketResult::DataIn(data),
        Err(err) => {
            warn!("atapi: read of {blocks} blocks at {lba} failed: {err}");
            fail(drive, Sense::new(SenseKey::MediumError, ASC_UNRECOVERED_READ))
        }
    }
}

fn request_sense(sense: Sense) -> Vec<u8> {
    let mut data = vec![0u8; 18];
    data[0] = 0x70;
    data[2] = sense.key.code();
    data[7] = 10;
    data[12] = sense.asc;
    data[13] = sense.ascq;
    data
}

fn inquiry() -> Vec<u8> {
    let mut data = vec![0u8; 36];
    data[0] = 0x05; // CD/DVD device
    data[1] = 0x80; // removable
    data[2] = 0x05;
    data[3] = 0x02;
    data[4] = 31;
    data[8..16].copy_from_slice(b"RELIC   ");
    data[16..32].copy_from_slice(b"VIRTUAL CD-ROM  ");
    data[32..36].copy_from_slice(b"1.0 ");
    data
}

fn read_toc(blocks: u32) -> Vec<u8> {
    let mut data = vec![0u8; 20];
    data[0..2].copy_from_slice(&18u16.to_be_bytes());
    data[2] = 1;
    data[3] = 1;
    // Track 1: data track at LBA 0.
    data[5] = 0x14;
    data[6] = 0x01;
    // Lead-out.
    data[13] = 0x14;
    data[14] = 0xAA;
    data[16..20].copy_from_slice(&blocks.to_be_bytes());
    data
}

fn capabilities_page() -> Vec<u8> {
    let mut data = vec![0u8; 8 + 20];
    data[0..2].copy_from_slice(&26u16.to_be_bytes());
    data[8] = 0x2A;
    data[9] = 18;
    data[10] = 0x01; // reads CD-R
    data[14] = 0x29; // tray loader, eject, lock
    data
}
