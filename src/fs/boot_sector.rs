//! Boot sector (BPB) and FSInfo codec, plus the geometry derived from them.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FilesystemError;

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;

pub const FSINFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
pub const FSINFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
pub const FSINFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;
/// FSInfo value meaning "not known".
pub const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

const BOOT_CODE_LEN: usize = 420;

/// FAT variant, determined from the BPB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn name(&self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }
}

/// The 512-byte boot sector, field for field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub jump_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub num_fats: u8,
    /// Legacy root entry count; 0 on FAT32.
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub fat_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
    pub boot_code: [u8; BOOT_CODE_LEN],
}

impl BootSector {
    /// Decode a boot sector, rejecting anything that would make later
    /// sector arithmetic meaningless.
    pub fn parse(bpb: &[u8]) -> Result<Self, FilesystemError> {
        if bpb.len() < BOOT_SECTOR_SIZE {
            return Err(FilesystemError::Parse(format!(
                "boot sector is {} bytes, need {BOOT_SECTOR_SIZE}",
                bpb.len()
            )));
        }

        if bpb[510..512] != BOOT_SIGNATURE {
            return Err(FilesystemError::Parse(format!(
                "unrecognized or corrupt volume: boot signature {:02X} {:02X}",
                bpb[510], bpb[511]
            )));
        }

        // Validate jump instruction (EB xx 90 or E9 xx xx)
        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            return Err(FilesystemError::Parse(
                "invalid FAT boot sector: bad jump instruction".into(),
            ));
        }

        let bytes_per_sector = LittleEndian::read_u16(&bpb[11..13]);
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FilesystemError::Parse(format!(
                "invalid bytes per sector: {bytes_per_sector}"
            )));
        }

        let sectors_per_cluster = bpb[13];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FilesystemError::Parse(format!(
                "invalid sectors per cluster: {sectors_per_cluster}"
            )));
        }

        let reserved_sector_count = LittleEndian::read_u16(&bpb[14..16]);
        if reserved_sector_count == 0 {
            return Err(FilesystemError::Parse("reserved sector count is 0".into()));
        }

        let num_fats = bpb[16];
        if num_fats == 0 {
            return Err(FilesystemError::Parse("FAT count is 0".into()));
        }

        let mut bs = Self {
            jump_boot: [0; 3],
            oem_name: [0; 8],
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            num_fats,
            root_entry_count: LittleEndian::read_u16(&bpb[17..19]),
            total_sectors_16: LittleEndian::read_u16(&bpb[19..21]),
            media: bpb[21],
            fat_size_16: LittleEndian::read_u16(&bpb[22..24]),
            sectors_per_track: LittleEndian::read_u16(&bpb[24..26]),
            num_heads: LittleEndian::read_u16(&bpb[26..28]),
            hidden_sectors: LittleEndian::read_u32(&bpb[28..32]),
            total_sectors_32: LittleEndian::read_u32(&bpb[32..36]),
            fat_size_32: LittleEndian::read_u32(&bpb[36..40]),
            ext_flags: LittleEndian::read_u16(&bpb[40..42]),
            fs_version: LittleEndian::read_u16(&bpb[42..44]),
            root_cluster: LittleEndian::read_u32(&bpb[44..48]),
            fs_info_sector: LittleEndian::read_u16(&bpb[48..50]),
            backup_boot_sector: LittleEndian::read_u16(&bpb[50..52]),
            reserved: [0; 12],
            drive_number: bpb[64],
            reserved1: bpb[65],
            boot_signature: bpb[66],
            volume_id: LittleEndian::read_u32(&bpb[67..71]),
            volume_label: [0; 11],
            fs_type: [0; 8],
            boot_code: [0; BOOT_CODE_LEN],
        };
        bs.jump_boot.copy_from_slice(&bpb[0..3]);
        bs.oem_name.copy_from_slice(&bpb[3..11]);
        bs.reserved.copy_from_slice(&bpb[52..64]);
        bs.volume_label.copy_from_slice(&bpb[71..82]);
        bs.fs_type.copy_from_slice(&bpb[82..90]);
        bs.boot_code.copy_from_slice(&bpb[90..510]);
        Ok(bs)
    }

    /// Encode back into the on-disk 512-byte layout.
    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut bpb = [0u8; BOOT_SECTOR_SIZE];
        bpb[0..3].copy_from_slice(&self.jump_boot);
        bpb[3..11].copy_from_slice(&self.oem_name);
        LittleEndian::write_u16(&mut bpb[11..13], self.bytes_per_sector);
        bpb[13] = self.sectors_per_cluster;
        LittleEndian::write_u16(&mut bpb[14..16], self.reserved_sector_count);
        bpb[16] = self.num_fats;
        LittleEndian::write_u16(&mut bpb[17..19], self.root_entry_count);
        LittleEndian::write_u16(&mut bpb[19..21], self.total_sectors_16);
        bpb[21] = self.media;
        LittleEndian::write_u16(&mut bpb[22..24], self.fat_size_16);
        LittleEndian::write_u16(&mut bpb[24..26], self.sectors_per_track);
        LittleEndian::write_u16(&mut bpb[26..28], self.num_heads);
        LittleEndian::write_u32(&mut bpb[28..32], self.hidden_sectors);
        LittleEndian::write_u32(&mut bpb[32..36], self.total_sectors_32);
        LittleEndian::write_u32(&mut bpb[36..40], self.fat_size_32);
        LittleEndian::write_u16(&mut bpb[40..42], self.ext_flags);
        LittleEndian::write_u16(&mut bpb[42..44], self.fs_version);
        LittleEndian::write_u32(&mut bpb[44..48], self.root_cluster);
        LittleEndian::write_u16(&mut bpb[48..50], self.fs_info_sector);
        LittleEndian::write_u16(&mut bpb[50..52], self.backup_boot_sector);
        bpb[52..64].copy_from_slice(&self.reserved);
        bpb[64] = self.drive_number;
        bpb[65] = self.reserved1;
        bpb[66] = self.boot_signature;
        LittleEndian::write_u32(&mut bpb[67..71], self.volume_id);
        bpb[71..82].copy_from_slice(&self.volume_label);
        bpb[82..90].copy_from_slice(&self.fs_type);
        bpb[90..510].copy_from_slice(&self.boot_code);
        bpb[510..512].copy_from_slice(&BOOT_SIGNATURE);
        bpb
    }

    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    pub fn fat_size(&self) -> u32 {
        if self.fat_size_16 != 0 {
            self.fat_size_16 as u32
        } else {
            self.fat_size_32
        }
    }

    fn root_dir_sectors(&self) -> u32 {
        let bps = self.bytes_per_sector as u32;
        ((self.root_entry_count as u32 * 32) + (bps - 1)) / bps
    }

    /// Number of data clusters implied by the BPB alone.
    fn data_cluster_count(&self) -> u32 {
        let data_start = self.reserved_sector_count as u32
            + self.num_fats as u32 * self.fat_size()
            + self.root_dir_sectors();
        self.total_sectors().saturating_sub(data_start) / self.sectors_per_cluster as u32
    }

    /// Determine the FAT variant.
    ///
    /// Cluster-count thresholds decide, except that a zero 16-bit FAT size
    /// together with a zero root entry count is FAT32 layout whatever the
    /// cluster count. Small FAT32 images fall in that case.
    pub fn fat_type(&self) -> FatType {
        let total_clusters = self.data_cluster_count();
        if self.fat_size_16 == 0 && self.root_entry_count == 0 {
            FatType::Fat32
        } else if total_clusters < 4085 {
            FatType::Fat12
        } else if total_clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Volume label with padding removed; `None` for the "NO NAME" placeholder.
    pub fn label(&self) -> Option<String> {
        let label = String::from_utf8_lossy(&self.volume_label).trim().to_string();
        if label.is_empty() || label == "NO NAME" {
            None
        } else {
            Some(label)
        }
    }

    /// Volume serial in the `XXXX-XXXX` form DOS prints.
    pub fn serial_string(&self) -> String {
        format!(
            "{:04X}-{:04X}",
            (self.volume_id >> 16) & 0xFFFF,
            self.volume_id & 0xFFFF
        )
    }
}

/// Geometry derived from a validated FAT32 boot sector. Immutable for the
/// lifetime of a mounted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub fat_size: u32,
    pub total_sectors: u32,
    pub root_cluster: u32,
    pub first_data_sector: u32,
    pub total_clusters: u32,
}

impl Geometry {
    pub fn from_boot_sector(bs: &BootSector) -> Result<Self, FilesystemError> {
        let fat_type = bs.fat_type();
        if fat_type != FatType::Fat32 {
            return Err(FilesystemError::Unsupported(format!(
                "{} volumes are detected but not supported",
                fat_type.name()
            )));
        }

        let bytes_per_sector = bs.bytes_per_sector as u32;
        let sectors_per_cluster = bs.sectors_per_cluster as u32;
        let reserved_sectors = bs.reserved_sector_count as u32;
        let num_fats = bs.num_fats as u32;
        let fat_size = bs.fat_size_32;
        let total_sectors = bs.total_sectors();

        if fat_size == 0 {
            return Err(FilesystemError::Parse("FAT32 FAT size is 0".into()));
        }

        let first_data_sector = reserved_sectors as u64 + num_fats as u64 * fat_size as u64;
        if first_data_sector >= total_sectors as u64 {
            return Err(FilesystemError::Parse(format!(
                "data region starts at sector {first_data_sector}, \
                 past end of volume ({total_sectors})"
            )));
        }
        let first_data_sector = first_data_sector as u32;

        // Never address clusters the FAT has no entry for.
        let data_clusters = (total_sectors - first_data_sector) / sectors_per_cluster;
        let fat_capacity = ((fat_size as u64 * bytes_per_sector as u64) / 4).saturating_sub(2);
        let total_clusters = (data_clusters as u64).min(fat_capacity) as u32;

        if bs.root_cluster < 2 || bs.root_cluster > total_clusters + 1 {
            return Err(FilesystemError::Parse(format!(
                "root cluster {} outside data region",
                bs.root_cluster
            )));
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            fat_size,
            total_sectors,
            root_cluster: bs.root_cluster,
            first_data_sector,
            total_clusters,
        })
    }

    /// First sector of a data cluster.
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.first_data_sector as u64 + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> usize {
        (self.bytes_per_sector * self.sectors_per_cluster) as usize
    }

    /// Highest cluster number with both a FAT entry and data sectors.
    pub fn max_cluster(&self) -> u32 {
        self.total_clusters + 1
    }

    pub fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.max_cluster()
    }

    /// First sector of FAT copy `index`.
    pub fn fat_start_sector(&self, index: u32) -> u64 {
        self.reserved_sectors as u64 + index as u64 * self.fat_size as u64
    }

    pub fn total_size(&self) -> u64 {
        self.total_sectors as u64 * self.bytes_per_sector as u64
    }
}

/// The advisory FSInfo sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
    /// Whether all three signatures matched when decoded.
    pub signatures_valid: bool,
}

impl FsInfo {
    pub fn new(free_count: u32, next_free: u32) -> Self {
        Self {
            free_count,
            next_free,
            signatures_valid: true,
        }
    }

    /// Decode an FSInfo sector. Never fails: bad signatures only mark the
    /// hints as untrustworthy.
    pub fn parse(sector: &[u8]) -> Self {
        if sector.len() < 512 {
            return Self {
                free_count: FSINFO_UNKNOWN,
                next_free: FSINFO_UNKNOWN,
                signatures_valid: false,
            };
        }
        let lead = LittleEndian::read_u32(&sector[0..4]);
        let structure = LittleEndian::read_u32(&sector[484..488]);
        let trail = LittleEndian::read_u32(&sector[508..512]);
        Self {
            free_count: LittleEndian::read_u32(&sector[488..492]),
            next_free: LittleEndian::read_u32(&sector[492..496]),
            signatures_valid: lead == FSINFO_LEAD_SIGNATURE
                && structure == FSINFO_STRUCT_SIGNATURE
                && trail == FSINFO_TRAIL_SIGNATURE,
        }
    }

    /// Encode into a sector-sized buffer.
    pub fn to_bytes(&self, bytes_per_sector: usize) -> Vec<u8> {
        let mut sector = vec![0u8; bytes_per_sector.max(512)];
        LittleEndian::write_u32(&mut sector[0..4], FSINFO_LEAD_SIGNATURE);
        LittleEndian::write_u32(&mut sector[484..488], FSINFO_STRUCT_SIGNATURE);
        LittleEndian::write_u32(&mut sector[488..492], self.free_count);
        LittleEndian::write_u32(&mut sector[492..496], self.next_free);
        LittleEndian::write_u32(&mut sector[508..512], FSINFO_TRAIL_SIGNATURE);
        sector
    }

    /// Free cluster count, if the sector is valid and the value is plausible.
    pub fn free_count_hint(&self, total_clusters: u32) -> Option<u32> {
        (self.signatures_valid
            && self.free_count != FSINFO_UNKNOWN
            && self.free_count <= total_clusters)
            .then_some(self.free_count)
    }

    /// Next-free hint, if the sector is valid and the value names a data cluster.
    pub fn next_free_hint(&self, geometry: &Geometry) -> Option<u32> {
        (self.signatures_valid && geometry.is_data_cluster(self.next_free))
            .then_some(self.next_free)
    }
}
