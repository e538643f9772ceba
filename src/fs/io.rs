//! Positioned sector I/O over the backing image.
//!
//! Every transfer is a seek followed by a full-length read or write. A
//! transfer that moves fewer bytes than a whole sector is reported as
//! [`FilesystemError::ShortTransfer`] rather than silently padded.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use crate::error::FilesystemError;

const ZERO_CHUNK_SIZE: usize = 256 * 1024; // 256 KB I/O buffer

/// Sector-granular access to a seekable image.
pub struct SectorIo<D> {
    device: D,
    bytes_per_sector: u64,
}

impl<D> SectorIo<D> {
    pub fn new(device: D, bytes_per_sector: u16) -> Self {
        Self {
            device,
            bytes_per_sector: bytes_per_sector as u64,
        }
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.bytes_per_sector as usize
    }

    /// Absolute byte offset for a given sector number.
    fn sector_offset(&self, sector: u64) -> u64 {
        sector * self.bytes_per_sector
    }

    pub fn get_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_inner(self) -> D {
        self.device
    }
}

impl<D: Read + Seek> SectorIo<D> {
    /// Read one sector into a freshly allocated buffer.
    pub fn read_sector(&mut self, sector: u64) -> Result<Vec<u8>, FilesystemError> {
        let mut buf = vec![0u8; self.bytes_per_sector()];
        self.read_sector_into(sector, &mut buf)?;
        Ok(buf)
    }

    /// Read one sector into `buf`, which must be exactly one sector long.
    pub fn read_sector_into(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), FilesystemError> {
        self.check_len(buf.len())?;
        let offset = self.sector_offset(sector);
        self.read_at(sector, offset, buf)
    }

    /// Read `count` consecutive sectors.
    pub fn read_sectors(&mut self, first: u64, count: u64) -> Result<Vec<u8>, FilesystemError> {
        let mut buf = vec![0u8; (count * self.bytes_per_sector) as usize];
        let offset = self.sector_offset(first);
        self.read_at(first, offset, &mut buf)?;
        Ok(buf)
    }

    /// Read raw bytes at an absolute offset. Used for the boot sector, which
    /// must be read before the real sector size is known.
    pub fn read_bytes_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FilesystemError> {
        let sector = offset / self.bytes_per_sector.max(1);
        self.read_at(sector, offset, buf)
    }

    /// Total size of the backing image in bytes.
    pub fn device_len(&mut self) -> Result<u64, FilesystemError> {
        Ok(self.device.seek(SeekFrom::End(0))?)
    }

    fn read_at(&mut self, sector: u64, offset: u64, buf: &mut [u8]) -> Result<(), FilesystemError> {
        self.device.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.device.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled != buf.len() {
            return Err(FilesystemError::ShortTransfer {
                sector,
                expected: buf.len(),
                actual: filled,
            });
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<(), FilesystemError> {
        if len != self.bytes_per_sector() {
            return Err(FilesystemError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "sector buffer is {len} bytes, sector size is {}",
                    self.bytes_per_sector
                ),
            )));
        }
        Ok(())
    }
}

impl<D: Read + Write + Seek> SectorIo<D> {
    /// Write one full sector.
    pub fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<(), FilesystemError> {
        self.check_len(buf.len())?;
        let offset = self.sector_offset(sector);
        self.write_at(sector, offset, buf)
    }

    /// Write `count` zero-filled sectors starting at `first`.
    pub fn zero_sectors(&mut self, first: u64, count: u64) -> Result<(), FilesystemError> {
        let per_chunk = (ZERO_CHUNK_SIZE as u64 / self.bytes_per_sector).max(1);
        let zeros = vec![0u8; (per_chunk.min(count) * self.bytes_per_sector) as usize];
        let mut done = 0;
        while done < count {
            let n = per_chunk.min(count - done);
            let sector = first + done;
            let offset = self.sector_offset(sector);
            self.write_at(sector, offset, &zeros[..(n * self.bytes_per_sector) as usize])?;
            done += n;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), FilesystemError> {
        self.device.flush()?;
        Ok(())
    }

    fn write_at(&mut self, sector: u64, offset: u64, buf: &[u8]) -> Result<(), FilesystemError> {
        self.device.seek(SeekFrom::Start(offset))?;
        let mut written = 0;
        while written < buf.len() {
            match self.device.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if written != buf.len() {
            return Err(FilesystemError::ShortTransfer {
                sector,
                expected: buf.len(),
                actual: written,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_write_then_read_sector() {
        let mut io = SectorIo::new(Cursor::new(vec![0u8; 512 * 4]), 512);
        let mut sector = vec![0u8; 512];
        sector[0] = 0xAB;
        sector[511] = 0xCD;
        io.write_sector(2, &sector).unwrap();

        assert_eq!(io.read_sector(2).unwrap(), sector);
        assert_eq!(io.read_sector(1).unwrap(), vec![0u8; 512]);
        assert_eq!(io.get_mut().get_ref()[1024], 0xAB);
    }

    #[test]
    fn test_short_read_is_reported() {
        let mut io = SectorIo::new(Cursor::new(vec![0u8; 700]), 512);
        match io.read_sector(1) {
            Err(FilesystemError::ShortTransfer {
                sector,
                expected,
                actual,
            }) => {
                assert_eq!(sector, 1);
                assert_eq!(expected, 512);
                assert_eq!(actual, 188);
            }
            other => panic!("expected short transfer, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_buffer_length_rejected() {
        let mut io = SectorIo::new(Cursor::new(vec![0u8; 1024]), 512);
        assert!(io.write_sector(0, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_zero_sectors() {
        let mut io = SectorIo::new(Cursor::new(vec![0xFFu8; 512 * 3]), 512);
        io.zero_sectors(1, 2).unwrap();
        let data = io.into_inner().into_inner();
        assert!(data[..512].iter().all(|&b| b == 0xFF));
        assert!(data[512..].iter().all(|&b| b == 0));
    }
}
