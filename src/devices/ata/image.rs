//! Disk images backing ATA drives.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::AtaError;

/// Random-access byte storage under a disk image.
pub trait BlockBackend {
    fn len(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A host file.
pub struct FileBackend {
    file: File,
    len: u64,
}

impl FileBackend {
    pub fn open(path: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl BlockBackend for FileBackend {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// An in-memory image.
pub struct MemoryBackend {
    data: Vec<u8>,
}

impl MemoryBackend {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlockBackend for MemoryBackend {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        let src = self
            .data
            .get(start..start + buf.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        let dst = self
            .data
            .get_mut(start..start + buf.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A disk image handle: backend plus write protection.
pub struct DiskImage {
    name: String,
    backend: Box<dyn BlockBackend>,
    write_protected: bool,
}

impl DiskImage {
    pub fn new(name: impl Into<String>, backend: Box<dyn BlockBackend>, write_protected: bool) -> Self {
        Self {
            name: name.into(),
            backend,
            write_protected,
        }
    }

    /// Open a host file. Protected images are opened read-only.
    pub fn open(path: &Path, write_protected: bool) -> Result<Self, AtaError> {
        let backend = FileBackend::open(path, !write_protected).map_err(|source| AtaError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(
            path.display().to_string(),
            Box::new(backend),
            write_protected,
        ))
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>, write_protected: bool) -> Self {
        Self::new(name, Box::new(MemoryBackend::new(data)), write_protected)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    /// Read `count` blocks of `block_size` bytes starting at `block`.
    pub fn read_blocks(&mut self, block: u64, count: u64, block_size: usize) -> io::Result<Vec<u8>> {
        let len = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(block_size))
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut buf = vec![0u8; len];
        self.backend.read_at(block * block_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write whole blocks starting at `block`.
    pub fn write_blocks(&mut self, block: u64, block_size: usize, data: &[u8]) -> io::Result<()> {
        if self.write_protected {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.backend.write_at(block * block_size as u64, data)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.backend.flush()
    }
}

impl std::fmt::Debug for DiskImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImage")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("write_protected", &self.write_protected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_image_blocks() {
        let mut image = DiskImage::from_bytes("mem", vec![0u8; 2048], false);
        image.write_blocks(2, 512, &[0x5A; 512]).unwrap();
        let data = image.read_blocks(1, 2, 512).unwrap();
        assert_eq!(data.len(), 1024);
        assert!(data[..512].iter().all(|b| *b == 0));
        assert!(data[512..].iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn test_reads_past_end_fail() {
        let mut image = DiskImage::from_bytes("mem", vec![0u8; 1024], false);
        assert!(image.read_blocks(1, 2, 512).is_err());
    }

    #[test]
    fn test_write_protected_image() {
        let mut image = DiskImage::from_bytes("rom", vec![0u8; 512], true);
        let err = image.write_blocks(0, 512, &[1; 512]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(image.read_blocks(0, 1, 512).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_open_missing_file() {
        let err = DiskImage::open(Path::new("/nonexistent/relic.img"), true).unwrap_err();
        assert!(matches!(err, AtaError::Open { .. }));
    }
}
