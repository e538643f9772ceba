//! Lay down a fresh FAT32 volume on a blank (or to-be-discarded) image.

use std::fs::OpenOptions;
use std::io::{Read, Seek, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{NaiveDateTime, Utc};
use log::info;

use super::boot_sector::{BootSector, FsInfo, BOOT_SECTOR_SIZE, EXTENDED_BOOT_SIGNATURE};
use super::dir_entry::{is_legal_short_char, Attributes, CaseFlags, FatTimestamp, ShortEntry};
use super::fat_table::END_OF_CHAIN;
use super::io::SectorIo;
use crate::error::FilesystemError;

const ROOT_CLUSTER: u32 = 2;
const FS_INFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;
/// Highest cluster count a FAT32 volume may have.
const MAX_FAT32_CLUSTERS: u64 = 0x0FFF_FFF5;

/// Parameters for [`format_volume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub media: u8,
    pub oem_name: String,
    /// `None` writes the `NO NAME` placeholder and no root label entry.
    pub volume_label: Option<String>,
    /// Fixed volume serial; derived from the clock when `None`.
    pub volume_id: Option<u32>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 32,
            num_fats: 2,
            media: 0xF8,
            oem_name: "RUSTYFAT".into(),
            volume_label: None,
            volume_id: None,
        }
    }
}

impl FormatOptions {
    /// Reject parameters that cannot describe a FAT32 volume.
    pub fn validate(&self) -> Result<(), FilesystemError> {
        if !matches!(self.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FilesystemError::Unsupported(format!(
                "bytes per sector must be 512, 1024, 2048 or 4096, not {}",
                self.bytes_per_sector
            )));
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(FilesystemError::Unsupported(format!(
                "sectors per cluster must be a power of two, not {}",
                self.sectors_per_cluster
            )));
        }
        if self.bytes_per_sector as u32 * self.sectors_per_cluster as u32 > 65536 {
            return Err(FilesystemError::Unsupported(
                "cluster size above 64 KiB".into(),
            ));
        }
        // Sectors 6 and 7 hold the backup boot sector and backup FSInfo.
        if self.reserved_sectors <= BACKUP_BOOT_SECTOR + FS_INFO_SECTOR {
            return Err(FilesystemError::Unsupported(format!(
                "at least {} reserved sectors are needed, not {}",
                BACKUP_BOOT_SECTOR + FS_INFO_SECTOR + 1,
                self.reserved_sectors
            )));
        }
        if self.num_fats == 0 {
            return Err(FilesystemError::Unsupported("FAT count must be at least 1".into()));
        }
        if self.media != 0xF0 && self.media < 0xF8 {
            return Err(FilesystemError::Unsupported(format!(
                "invalid media descriptor {:#04X}",
                self.media
            )));
        }
        if self.oem_name.len() > 8 || !self.oem_name.is_ascii() {
            return Err(FilesystemError::InvalidName(format!(
                "OEM name must be at most 8 ASCII characters: {:?}",
                self.oem_name
            )));
        }
        if let Some(label) = &self.volume_label {
            if label.is_empty()
                || label.len() > 11
                || !label.chars().all(|c| c == ' ' || is_legal_short_char(c))
            {
                return Err(FilesystemError::InvalidName(format!(
                    "volume label must be 1..=11 legal 8.3 characters: {label:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Sectors per FAT copy:
/// `ceil(4 * (total - reserved) / (spc * bps + 4 * num_fats))`.
pub fn compute_fat_size(
    total_sectors: u32,
    reserved_sectors: u32,
    sectors_per_cluster: u32,
    bytes_per_sector: u32,
    num_fats: u32,
) -> u32 {
    let num = 4 * (total_sectors as u64).saturating_sub(reserved_sectors as u64);
    let den = sectors_per_cluster as u64 * bytes_per_sector as u64 + 4 * num_fats as u64;
    num.div_ceil(den) as u32
}

/// Pack a timestamp into a volume serial: FAT date in the high half, FAT
/// time in the low half. Only an identifier; two volumes formatted within
/// the same two seconds share a serial.
pub fn pack_volume_id(now: &NaiveDateTime) -> u32 {
    let ts = FatTimestamp::from_datetime(now);
    ((ts.date as u32) << 16) | ts.time as u32
}

fn padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    for (d, b) in out.iter_mut().zip(s.bytes()) {
        *d = b.to_ascii_uppercase();
    }
    out
}

/// Write a FAT32 file system filling the first `total_bytes` of `device`.
///
/// Writes the boot sector and its backup, both FSInfo copies, every FAT copy
/// (zeroed, with the reserved entries and the root directory's end-of-chain
/// entry set) and a zeroed root directory cluster. The rest of the data
/// region is left as it was.
pub fn format_volume<D: Read + Write + Seek>(
    device: D,
    total_bytes: u64,
    opts: &FormatOptions,
) -> Result<BootSector, FilesystemError> {
    opts.validate()?;

    let bps = opts.bytes_per_sector as u32;
    let spc = opts.sectors_per_cluster as u32;
    let reserved = opts.reserved_sectors as u32;
    let num_fats = opts.num_fats as u32;

    let total_sectors = total_bytes / bps as u64;
    if total_sectors > u32::MAX as u64 {
        return Err(FilesystemError::Unsupported(format!(
            "{total_bytes} bytes is too large for a FAT32 volume"
        )));
    }
    let total_sectors = total_sectors as u32;

    let fat_size = compute_fat_size(total_sectors, reserved, spc, bps, num_fats);
    let first_data_sector = reserved as u64 + num_fats as u64 * fat_size as u64;
    let data_clusters = (total_sectors as u64).saturating_sub(first_data_sector) / spc as u64;
    if data_clusters < 2 {
        return Err(FilesystemError::DiskFull(format!(
            "{total_bytes} bytes leaves no room for a data region"
        )));
    }
    if data_clusters > MAX_FAT32_CLUSTERS {
        return Err(FilesystemError::Unsupported(format!(
            "{data_clusters} clusters exceed the FAT32 limit; use larger clusters"
        )));
    }
    let clusters = data_clusters as u32;

    let volume_id = opts
        .volume_id
        .unwrap_or_else(|| pack_volume_id(&Utc::now().naive_utc()));

    let mut oem_name = [b' '; 8];
    for (d, b) in oem_name.iter_mut().zip(opts.oem_name.bytes()) {
        *d = b;
    }

    let boot_sector = BootSector {
        jump_boot: [0xEB, 0x58, 0x90],
        oem_name,
        bytes_per_sector: opts.bytes_per_sector,
        sectors_per_cluster: opts.sectors_per_cluster,
        reserved_sector_count: opts.reserved_sectors,
        num_fats: opts.num_fats,
        root_entry_count: 0,
        total_sectors_16: 0,
        media: opts.media,
        fat_size_16: 0,
        sectors_per_track: 0x3F,
        num_heads: 16,
        hidden_sectors: 0,
        total_sectors_32: total_sectors,
        fat_size_32: fat_size,
        ext_flags: 0,
        fs_version: 0,
        root_cluster: ROOT_CLUSTER,
        fs_info_sector: FS_INFO_SECTOR,
        backup_boot_sector: BACKUP_BOOT_SECTOR,
        reserved: [0; 12],
        drive_number: 0x80,
        reserved1: 0,
        boot_signature: EXTENDED_BOOT_SIGNATURE,
        volume_id,
        volume_label: padded(opts.volume_label.as_deref().unwrap_or("NO NAME")),
        fs_type: *b"FAT32   ",
        boot_code: [0; 420],
    };

    let mut io = SectorIo::new(device, opts.bytes_per_sector);
    let sector_len = bps as usize;

    // Reserved region and every FAT copy start out zeroed.
    io.zero_sectors(0, first_data_sector)?;

    let mut boot = vec![0u8; sector_len];
    boot[..BOOT_SECTOR_SIZE].copy_from_slice(&boot_sector.to_bytes());
    io.write_sector(0, &boot)?;
    io.write_sector(BACKUP_BOOT_SECTOR as u64, &boot)?;

    let fs_info = FsInfo::new(clusters - 1, ROOT_CLUSTER + 1).to_bytes(sector_len);
    io.write_sector(FS_INFO_SECTOR as u64, &fs_info)?;
    io.write_sector((BACKUP_BOOT_SECTOR + FS_INFO_SECTOR) as u64, &fs_info)?;

    let mut fat_head = vec![0u8; sector_len];
    LittleEndian::write_u32(&mut fat_head[0..4], 0x0FFF_FF00 | opts.media as u32);
    LittleEndian::write_u32(&mut fat_head[4..8], 0x0FFF_FFFF);
    LittleEndian::write_u32(&mut fat_head[8..12], END_OF_CHAIN);
    for copy in 0..num_fats as u64 {
        io.write_sector(reserved as u64 + copy * fat_size as u64, &fat_head)?;
    }

    let root_sector = first_data_sector + (ROOT_CLUSTER as u64 - 2) * spc as u64;
    io.zero_sectors(root_sector, spc as u64)?;

    if let Some(label) = &opts.volume_label {
        let entry = ShortEntry::new(
            padded(label),
            CaseFlags::empty(),
            Attributes::VOLUME_ID,
            0,
            FatTimestamp::now(),
        );
        let mut sector = vec![0u8; sector_len];
        sector[..32].copy_from_slice(&entry.to_bytes());
        io.write_sector(root_sector, &sector)?;
    }

    io.flush()?;

    info!(
        "formatted FAT32 volume {}: {} sectors, {} clusters, {} sectors per FAT",
        boot_sector.serial_string(),
        total_sectors,
        clusters,
        fat_size
    );
    Ok(boot_sector)
}

/// Format an existing image file in place, using its current length.
pub fn format_image(
    path: impl AsRef<Path>,
    opts: &FormatOptions,
) -> Result<BootSector, FilesystemError> {
    let path = path.as_ref();
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(FilesystemError::Parse(format!(
            "{} is empty; give the image a size before formatting",
            path.display()
        )));
    }
    format_volume(&mut file, len, opts)
}
