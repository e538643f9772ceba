use std::io::{Read, Seek};

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};

use super::boot_sector::{
    BootSector, FatType, FsInfo, Geometry, BOOT_SECTOR_SIZE, FSINFO_UNKNOWN,
};
use super::fat_table::{FatEntry, FatTable, FAT_ENTRY_MASK};
use super::io::SectorIo;

/// Whether the image's boot sector describes a FAT32 volume.
pub fn is_fat32(file: &mut (impl Read + Seek)) -> Result<bool> {
    let mut io = SectorIo::new(&mut *file, BOOT_SECTOR_SIZE as u16);
    let mut bpb = [0u8; BOOT_SECTOR_SIZE];
    io.read_bytes_at(0, &mut bpb)
        .context("failed to read boot sector")?;
    Ok(BootSector::parse(&bpb)
        .map(|bs| bs.fat_type() == FatType::Fat32)
        .unwrap_or(false))
}

/// Check the consistency of a FAT32 image without modifying it.
///
/// Checks the boot sector and its backup, FAT[0] media byte, FAT[1] clean
/// flags, FSInfo signatures and free count, out-of-range FAT links, that
/// all FAT copies are identical and that the root directory chain is sound.
/// Returns a list of warning messages (empty = all good).
pub fn validate_fat32(
    file: &mut (impl Read + Seek),
    log_cb: &mut impl FnMut(&str),
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    let mut io = SectorIo::new(&mut *file, BOOT_SECTOR_SIZE as u16);
    let mut bpb = [0u8; BOOT_SECTOR_SIZE];
    io.read_bytes_at(0, &mut bpb)
        .context("failed to read boot sector")?;

    let bs = match BootSector::parse(&bpb) {
        Ok(bs) => bs,
        Err(e) => {
            warnings.push(format!("BPB: {e}"));
            return Ok(report(warnings, log_cb));
        }
    };
    let fat_type = bs.fat_type();
    if fat_type != FatType::Fat32 {
        warnings.push(format!("not a FAT32 volume (detected {})", fat_type.name()));
        return Ok(report(warnings, log_cb));
    }
    log_cb("This disk image is formatted as FAT32.");

    let geo = match Geometry::from_boot_sector(&bs) {
        Ok(geo) => geo,
        Err(e) => {
            warnings.push(format!("BPB: {e}"));
            return Ok(report(warnings, log_cb));
        }
    };
    let mut io = SectorIo::new(io.into_inner(), bs.bytes_per_sector);
    let device_len = io.device_len()?;
    if device_len < geo.total_size() {
        warnings.push(format!(
            "image is {device_len} bytes, shorter than the {} bytes the BPB describes",
            geo.total_size()
        ));
        return Ok(report(warnings, log_cb));
    }

    // Backup boot sector
    let backup = bs.backup_boot_sector as u32;
    if backup != 0 && backup < geo.reserved_sectors {
        let copy = io
            .read_sector(backup as u64)
            .context("failed to read backup boot sector")?;
        if copy[..BOOT_SECTOR_SIZE] != bpb[..] {
            warnings.push(format!("backup boot sector {backup} differs from sector 0"));
        }
    } else {
        warnings.push("BPB: no backup boot sector".to_string());
    }

    let fat_sectors = geo.fat_size as u64;
    let fat_data = io
        .read_sectors(geo.fat_start_sector(0), fat_sectors)
        .context("failed to read FAT")?;

    // Check FAT[0] media byte
    let fat0 = LittleEndian::read_u32(&fat_data[0..4]) & FAT_ENTRY_MASK;
    if fat0 & 0xFF != bs.media as u32 {
        warnings.push(format!(
            "FAT32: FAT[0] low byte = 0x{:02X}, media byte = 0x{:02X}",
            fat0 & 0xFF,
            bs.media
        ));
    }

    // Check FAT[1] clean flags
    let fat1 = LittleEndian::read_u32(&fat_data[4..8]);
    if fat1 & 0x0800_0000 == 0 {
        warnings.push("FAT32: FAT[1] clean shutdown bit not set".to_string());
    }
    if fat1 & 0x0400_0000 == 0 {
        warnings.push("FAT32: FAT[1] no-error bit not set".to_string());
    }

    // Out-of-range links and the real free count
    let total_entries = geo.total_clusters + 2;
    let mut out_of_bounds = 0u32;
    let mut free = 0u32;
    for cluster in 2..total_entries {
        let off = cluster as usize * 4;
        match FatEntry::from_raw(LittleEndian::read_u32(&fat_data[off..off + 4])) {
            FatEntry::Free => free += 1,
            FatEntry::Next(next) if next >= total_entries => out_of_bounds += 1,
            FatEntry::Reserved(_) => out_of_bounds += 1,
            _ => {}
        }
    }
    if out_of_bounds > 0 {
        warnings.push(format!(
            "{out_of_bounds} cluster(s) reference beyond total ({total_entries})"
        ));
    }

    // Check FSInfo
    let fs_info_sector = bs.fs_info_sector as u32;
    if fs_info_sector > 0 && fs_info_sector < geo.reserved_sectors {
        let sector = io
            .read_sector(fs_info_sector as u64)
            .context("failed to read FSInfo")?;
        let info = FsInfo::parse(&sector);
        if !info.signatures_valid {
            warnings.push(format!(
                "FSInfo: bad signatures 0x{:08X} 0x{:08X} 0x{:08X}",
                LittleEndian::read_u32(&sector[0..4]),
                LittleEndian::read_u32(&sector[484..488]),
                LittleEndian::read_u32(&sector[508..512])
            ));
        }
        if info.free_count != FSINFO_UNKNOWN {
            if info.free_count > geo.total_clusters {
                warnings.push(format!(
                    "FSInfo: free_count ({}) > total clusters ({})",
                    info.free_count, geo.total_clusters
                ));
            } else if info.free_count != free {
                warnings.push(format!(
                    "FSInfo: free_count ({}) differs from FAT ({free})",
                    info.free_count
                ));
            }
        }
        if info.next_free != FSINFO_UNKNOWN && !geo.is_data_cluster(info.next_free) {
            warnings.push(format!(
                "FSInfo: next_free ({}) outside data region",
                info.next_free
            ));
        }
    } else {
        warnings.push(format!("BPB: FSInfo sector {fs_info_sector} is not usable"));
    }

    // FAT copies must match the first
    for copy in 1..geo.num_fats {
        let other = io
            .read_sectors(geo.fat_start_sector(copy), fat_sectors)
            .with_context(|| format!("failed to read FAT copy {copy}"))?;
        if other != fat_data {
            let first_diff = other
                .iter()
                .zip(fat_data.iter())
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            warnings.push(format!(
                "FAT copy {copy} differs from FAT 0 (first at entry {})",
                first_diff / 4
            ));
        }
    }

    // Root directory chain
    let fat = FatTable::new(geo);
    match fat.chain(&mut io, geo.root_cluster) {
        Ok(chain) => log_cb(&format!("root directory spans {} cluster(s)", chain.len())),
        Err(e) => warnings.push(format!("root directory: {e}")),
    }

    Ok(report(warnings, log_cb))
}

fn report(warnings: Vec<String>, log_cb: &mut impl FnMut(&str)) -> Vec<String> {
    for w in &warnings {
        log_cb(&format!("FAT validation warning: {w}"));
    }
    if warnings.is_empty() {
        log_cb("FAT validation: all checks passed");
    }
    warnings
}
