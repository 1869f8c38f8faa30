//! A drive slot on an ATA channel and the media attached to it.

use super::atapi::Sense;
use super::image::DiskImage;
use super::{AtaError, CD_BLOCK_SIZE, LBA28_LIMIT, SECTOR_SIZE};

/// What occupies a drive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveKind {
    #[default]
    None,
    HardDisk,
    Cdrom,
}

/// Media type offered for attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    Floppy,
    HardDisk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveRole {
    Master,
    Slave,
}

/// Observable state of a drive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Absent,
    PresentIdle,
    Selected,
    Busy,
}

/// Cylinder/head/sector geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl Geometry {
    /// Default translation for a disk of `total` sectors.
    pub fn for_sectors(total: u64) -> Self {
        let sectors = total.clamp(1, 63);
        let heads = (total / sectors).clamp(1, 16);
        let cylinders = (total / (heads * sectors)).clamp(1, 16383);
        Self {
            cylinders: cylinders as u16,
            heads: heads as u8,
            sectors: sectors as u8,
        }
    }

    pub fn capacity(self) -> u64 {
        u64::from(self.cylinders) * u64::from(self.heads) * u64::from(self.sectors)
    }

    /// Translate a CHS address (sector numbers start at 1).
    pub fn to_lba(self, cylinder: u16, head: u8, sector: u8) -> Option<u64> {
        if sector == 0 || sector > self.sectors || head >= self.heads {
            return None;
        }
        let heads = u64::from(self.heads);
        let spt = u64::from(self.sectors);
        Some((u64::from(cylinder) * heads + u64::from(head)) * spt + u64::from(sector) - 1)
    }
}

pub struct Drive {
    role: DriveRole,
    kind: DriveKind,
    image: Option<DiskImage>,
    geometry: Geometry,
    /// Translation set by INITIALIZE DEVICE PARAMETERS.
    logical: Geometry,
    /// Sectors per block for READ/WRITE MULTIPLE; 0 when disabled.
    multiple: u8,
    pub(crate) sense: Sense,
    pub(crate) media_changed: bool,
    /// CD-ROM tray opened from the guest.
    pub(crate) tray_open: bool,
}

impl Drive {
    pub fn new(role: DriveRole) -> Self {
        Self {
            role,
            kind: DriveKind::None,
            image: None,
            geometry: Geometry::default(),
            logical: Geometry::default(),
            multiple: 0,
            sense: Sense::NONE,
            media_changed: false,
            tray_open: false,
        }
    }

    pub fn role(&self) -> DriveRole {
        self.role
    }

    pub fn kind(&self) -> DriveKind {
        self.kind
    }

    pub fn is_present(&self) -> bool {
        self.kind != DriveKind::None
    }

    pub fn is_atapi(&self) -> bool {
        self.kind == DriveKind::Cdrom
    }

    pub fn image(&self) -> Option<&DiskImage> {
        self.image.as_ref()
    }

    pub(crate) fn image_mut(&mut self) -> Option<&mut DiskImage> {
        self.image.as_mut()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn logical_geometry(&self) -> Geometry {
        self.logical
    }

    pub(crate) fn set_logical_geometry(&mut self, heads: u8, sectors: u8) {
        let heads = heads.max(1);
        let per_cylinder = u64::from(heads) * u64::from(sectors);
        let cylinders = if per_cylinder == 0 {
            0
        } else {
            (self.total_sectors() / per_cylinder).min(0xFFFF)
        };
        self.logical = Geometry {
            cylinders: cylinders as u16,
            heads,
            sectors,
        };
    }

    pub fn multiple(&self) -> u8 {
        self.multiple
    }

    pub(crate) fn set_multiple(&mut self, count: u8) -> bool {
        if count == 0 || (count <= 16 && count.is_power_of_two()) {
            self.multiple = count;
            true
        } else {
            false
        }
    }

    /// Sector (hard disk) or block (CD-ROM) size.
    pub fn block_size(&self) -> usize {
        match self.kind {
            DriveKind::Cdrom => CD_BLOCK_SIZE,
            _ => SECTOR_SIZE,
        }
    }

    /// Capacity in blocks of [`Drive::block_size`].
    pub fn total_sectors(&self) -> u64 {
        self.image
            .as_ref()
            .map_or(0, |img| img.len() / self.block_size() as u64)
    }

    /// A CD-ROM with a disc loaded, or any hard disk.
    pub fn has_media(&self) -> bool {
        self.image.is_some() && !self.tray_open
    }

    /// Check `image` against the carrier and put it in this slot.
    pub fn attach(&mut self, carrier: Carrier, image: DiskImage) -> Result<(), AtaError> {
        let (kind, block) = match carrier {
            Carrier::HardDisk => (DriveKind::HardDisk, SECTOR_SIZE),
            Carrier::Cdrom => (DriveKind::Cdrom, CD_BLOCK_SIZE),
            Carrier::Floppy => return Err(AtaError::UnsupportedCarrier(carrier)),
        };
        let len = image.len();
        if len == 0 {
            return Err(AtaError::EmptyImage {
                name: image.name().to_string(),
            });
        }
        if len % block as u64 != 0 {
            return Err(AtaError::Misaligned {
                name: image.name().to_string(),
                len,
                block,
            });
        }
        let sectors = len / SECTOR_SIZE as u64;
        if kind == DriveKind::HardDisk && sectors > LBA28_LIMIT {
            return Err(AtaError::TooLarge {
                name: image.name().to_string(),
                sectors,
            });
        }

        self.kind = kind;
        self.image = Some(image);
        self.tray_open = false;
        self.media_changed = kind == DriveKind::Cdrom;
        self.geometry = match kind {
            DriveKind::HardDisk => Geometry::for_sectors(sectors),
            _ => Geometry::default(),
        };
        self.reset();
        Ok(())
    }

    /// Empty the slot.
    pub fn detach(&mut self) -> Option<DiskImage> {
        let image = self.image.take();
        *self = Self::new(self.role);
        image
    }

    /// Drive-level reset: logical geometry and sense data return to default.
    pub fn reset(&mut self) {
        self.logical = self.geometry;
        self.sense = Sense::NONE;
    }

    /// The 256-word IDENTIFY DEVICE block.
    pub fn identify(&self) -> Vec<u8> {
        let mut words = [0u16; 256];
        let geo = self.geometry;
        let cur = self.logical;
        let total = self.total_sectors().min(LBA28_LIMIT - 1) as u32;

        words[0] = 0x0040;
        words[1] = geo.cylinders;
        words[3] = u16::from(geo.heads);
        words[4] = (SECTOR_SIZE * usize::from(geo.sectors)) as u16;
        words[5] = SECTOR_SIZE as u16;
        words[6] = u16::from(geo.sectors);
        write_ata_string(&mut words[10..20], "RELIC0000000001");
        words[20] = 3;
        words[21] = 512;
        write_ata_string(&mut words[23..27], "1.0");
        write_ata_string(&mut words[27..47], "RELIC HARDDISK");
        words[47] = 0x8010;
        words[49] = 1 << 9;
        words[51] = 0x0200;
        words[53] = 0x0001;
        words[54] = cur.cylinders;
        words[55] = u16::from(cur.heads);
        words[56] = u16::from(cur.sectors);
        let current = cur.capacity().min(u64::from(u32::MAX)) as u32;
        words[57] = current as u16;
        words[58] = (current >> 16) as u16;
        if self.multiple != 0 {
            words[59] = 0x0100 | u16::from(self.multiple);
        }
        words[60] = total as u16;
        words[61] = (total >> 16) as u16;
        words[80] = 0x007E;
        words[82] = 1 << 14;
        words[83] = 1 << 14 | 1 << 12;
        words[84] = 1 << 14;
        words[85] = 1 << 14;
        words[86] = 1 << 12;
        words[87] = 1 << 14;
        words_to_bytes(&words)
    }

    /// The 256-word IDENTIFY PACKET DEVICE block.
    pub fn identify_packet(&self) -> Vec<u8> {
        let mut words = [0u16; 256];
        // ATAPI, CD-ROM, removable, 12-byte packets.
        words[0] = 0x8580;
        write_ata_string(&mut words[10..20], "RELIC0000000002");
        write_ata_string(&mut words[23..27], "1.0");
        write_ata_string(&mut words[27..47], "RELIC CD-ROM");
        words[49] = 1 << 9;
        words[53] = 0x0003;
        words[80] = 0x001E;
        words_to_bytes(&words)
    }
}

/// ATA strings store two characters per word, first character high.
fn write_ata_string(words: &mut [u16], text: &str) {
    let mut bytes = text.bytes().chain(std::iter::repeat(b' '));
    for word in words.iter_mut() {
        let hi = bytes.next().unwrap_or(b' ');
        let lo = bytes.next().unwrap_or(b' ');
        *word = u16::from_be_bytes([hi, lo]);
    }
}

fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(sectors: usize) -> DiskImage {
        DiskImage::from_bytes("hd", vec![0; sectors * SECTOR_SIZE], false)
    }

    #[test]
    fn test_geometry_for_small_and_large_disks() {
        let geo = Geometry::for_sectors(20);
        assert_eq!((geo.cylinders, geo.heads, geo.sectors), (1, 1, 20));

        let geo = Geometry::for_sectors(16 * 63 * 100);
        assert_eq!((geo.cylinders, geo.heads, geo.sectors), (100, 16, 63));
        assert_eq!(geo.to_lba(0, 0, 1), Some(0));
        assert_eq!(geo.to_lba(1, 2, 3), Some((16 + 2) * 63 + 2));
        assert_eq!(geo.to_lba(0, 0, 0), None);
        assert_eq!(geo.to_lba(0, 16, 1), None);
    }

    #[test]
    fn test_attach_validates_images() {
        let mut drive = Drive::new(DriveRole::Master);
        let odd = DiskImage::from_bytes("odd", vec![0; 700], false);
        assert!(matches!(
            drive.attach(Carrier::HardDisk, odd),
            Err(AtaError::Misaligned { block: 512, .. })
        ));
        let cd = DiskImage::from_bytes("cd", vec![0; 1024], false);
        assert!(matches!(
            drive.attach(Carrier::Cdrom, cd),
            Err(AtaError::Misaligned { block: 2048, .. })
        ));
        let empty = DiskImage::from_bytes("empty", Vec::new(), false);
        assert!(matches!(
            drive.attach(Carrier::HardDisk, empty),
            Err(AtaError::EmptyImage { .. })
        ));
        assert!(matches!(
            drive.attach(Carrier::Floppy, disk(2880)),
            Err(AtaError::UnsupportedCarrier(Carrier::Floppy))
        ));
        assert!(!drive.is_present());
    }

    #[test]
    fn test_detach_restores_empty_slot() {
        let mut drive = Drive::new(DriveRole::Slave);
        drive.attach(Carrier::HardDisk, disk(1008)).unwrap();
        assert!(drive.set_multiple(8));
        assert_eq!(drive.total_sectors(), 1008);

        assert!(drive.detach().is_some());
        assert_eq!(drive.kind(), DriveKind::None);
        assert_eq!(drive.multiple(), 0);
        assert_eq!(drive.total_sectors(), 0);
        assert_eq!(drive.role(), DriveRole::Slave);
        assert!(drive.detach().is_none());
    }

    #[test]
    fn test_identify_layout() {
        let mut drive = Drive::new(DriveRole::Master);
        drive.attach(Carrier::HardDisk, disk(16 * 63 * 10)).unwrap();
        let id = drive.identify();
        let word = |i: usize| u16::from_le_bytes([id[i * 2], id[i * 2 + 1]]);
        assert_eq!(id.len(), 512);
        assert_eq!(word(1), 10);
        assert_eq!(word(3), 16);
        assert_eq!(word(6), 63);
        assert_eq!(u32::from(word(60)) | u32::from(word(61)) << 16, 16 * 63 * 10);
        // "RE" stored high byte first.
        assert_eq!(word(27), u16::from_be_bytes(*b"RE"));
    }

    #[test]
    fn test_set_multiple_rejects_odd_counts() {
        let mut drive = Drive::new(DriveRole::Master);
        assert!(drive.set_multiple(16));
        assert!(!drive.set_multiple(3));
        assert!(!drive.set_multiple(32));
        assert_eq!(drive.multiple(), 16);
    }
}
