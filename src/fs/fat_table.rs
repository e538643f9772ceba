//! FAT32 allocation table: entry access, free-cluster search, chain walking
//! and chain extension.
//!
//! All reads and writes go through [`SectorIo`] one sector at a time. Writes
//! are read-modify-write on the containing sector and are repeated for every
//! FAT copy so the copies stay identical.

use std::io::{Read, Seek, Write};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use super::boot_sector::Geometry;
use super::io::SectorIo;
use crate::error::FilesystemError;

/// Low 28 bits of a FAT32 entry are significant.
pub const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
/// Value written to terminate a chain.
pub const END_OF_CHAIN: u32 = 0x0FFF_FFFF;
/// Smallest value recognised as end-of-chain.
pub const END_OF_CHAIN_MIN: u32 = 0x0FFF_FFF8;
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;

/// Decoded meaning of a FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Next(u32),
    EndOfChain,
    Bad,
    /// Cluster value 1 or 0x0FFFFFF0..=0x0FFFFFF6.
    Reserved(u32),
}

impl FatEntry {
    pub fn from_raw(raw: u32) -> Self {
        let value = raw & FAT_ENTRY_MASK;
        if value == 0 {
            FatEntry::Free
        } else if value >= END_OF_CHAIN_MIN {
            FatEntry::EndOfChain
        } else if value == BAD_CLUSTER {
            FatEntry::Bad
        } else if value < 2 || value >= 0x0FFF_FFF0 {
            FatEntry::Reserved(value)
        } else {
            FatEntry::Next(value)
        }
    }

    pub fn is_end_of_chain(&self) -> bool {
        matches!(self, FatEntry::EndOfChain)
    }
}

/// View of the FAT region of a mounted volume.
#[derive(Debug, Clone, Copy)]
pub struct FatTable {
    geometry: Geometry,
}

impl FatTable {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry }
    }

    /// Sector (absolute, in the first FAT copy) and byte offset within that
    /// sector of the entry for `cluster`.
    pub fn cluster_to_fat_offset(&self, cluster: u32) -> (u64, usize) {
        let byte = cluster as u64 * 4;
        let bps = self.geometry.bytes_per_sector as u64;
        (
            self.geometry.reserved_sectors as u64 + byte / bps,
            (byte % bps) as usize,
        )
    }

    fn check_index(&self, cluster: u32) -> Result<(), FilesystemError> {
        if cluster > self.geometry.max_cluster() {
            return Err(FilesystemError::Corrupt(format!(
                "cluster {cluster} beyond end of FAT (max {})",
                self.geometry.max_cluster()
            )));
        }
        Ok(())
    }

    /// Read the masked 28-bit entry for `cluster`.
    pub fn get_next_cluster<D: Read + Seek>(
        &self,
        io: &mut SectorIo<D>,
        cluster: u32,
    ) -> Result<u32, FilesystemError> {
        self.check_index(cluster)?;
        let (sector, offset) = self.cluster_to_fat_offset(cluster);
        let buf = io.read_sector(sector)?;
        Ok(LittleEndian::read_u32(&buf[offset..offset + 4]) & FAT_ENTRY_MASK)
    }

    pub fn entry<D: Read + Seek>(
        &self,
        io: &mut SectorIo<D>,
        cluster: u32,
    ) -> Result<FatEntry, FilesystemError> {
        Ok(FatEntry::from_raw(self.get_next_cluster(io, cluster)?))
    }

    /// Write the entry for `cluster` in every FAT copy, keeping the top four
    /// reserved bits of each existing entry.
    pub fn set_fat_entry<D: Read + Write + Seek>(
        &self,
        io: &mut SectorIo<D>,
        cluster: u32,
        value: u32,
    ) -> Result<(), FilesystemError> {
        self.check_index(cluster)?;
        let (sector, offset) = self.cluster_to_fat_offset(cluster);
        let relative = sector - self.geometry.reserved_sectors as u64;
        for copy in 0..self.geometry.num_fats {
            let target = self.geometry.fat_start_sector(copy) + relative;
            let mut buf = io.read_sector(target)?;
            let existing = LittleEndian::read_u32(&buf[offset..offset + 4]);
            let new_val = (existing & 0xF000_0000) | (value & FAT_ENTRY_MASK);
            LittleEndian::write_u32(&mut buf[offset..offset + 4], new_val);
            io.write_sector(target, &buf)?;
        }
        Ok(())
    }

    /// First free cluster at or above 2, scanning every cluster the volume
    /// has. Returns `None` when the volume is full.
    pub fn find_free_cluster<D: Read + Seek>(
        &self,
        io: &mut SectorIo<D>,
    ) -> Result<Option<u32>, FilesystemError> {
        let per_sector = self.geometry.bytes_per_sector / 4;
        let end = self.geometry.max_cluster() + 1;
        let mut cluster = 2u32;
        while cluster < end {
            let (sector, _) = self.cluster_to_fat_offset(cluster);
            let buf = io.read_sector(sector)?;
            let first_in_sector = cluster - cluster % per_sector;
            let last_in_sector = (first_in_sector + per_sector).min(end);
            for c in cluster..last_in_sector {
                let off = ((c - first_in_sector) * 4) as usize;
                if LittleEndian::read_u32(&buf[off..off + 4]) & FAT_ENTRY_MASK == 0 {
                    return Ok(Some(c));
                }
            }
            cluster = last_in_sector;
        }
        Ok(None)
    }

    /// Count free clusters by scanning the whole first FAT copy.
    pub fn free_cluster_count<D: Read + Seek>(
        &self,
        io: &mut SectorIo<D>,
    ) -> Result<u32, FilesystemError> {
        let per_sector = self.geometry.bytes_per_sector / 4;
        let end = self.geometry.max_cluster() + 1;
        let mut free = 0u32;
        let mut cluster = 2u32;
        while cluster < end {
            let (sector, _) = self.cluster_to_fat_offset(cluster);
            let buf = io.read_sector(sector)?;
            let first_in_sector = cluster - cluster % per_sector;
            let last_in_sector = (first_in_sector + per_sector).min(end);
            free += (cluster..last_in_sector)
                .filter(|c| {
                    let off = ((c - first_in_sector) * 4) as usize;
                    LittleEndian::read_u32(&buf[off..off + 4]) & FAT_ENTRY_MASK == 0
                })
                .count() as u32;
            cluster = last_in_sector;
        }
        Ok(free)
    }

    /// Claim a free cluster: mark it end-of-chain, then zero its data.
    pub fn allocate_cluster<D: Read + Write + Seek>(
        &self,
        io: &mut SectorIo<D>,
    ) -> Result<u32, FilesystemError> {
        let cluster = self
            .find_free_cluster(io)?
            .ok_or_else(|| FilesystemError::DiskFull("no free cluster".into()))?;
        self.set_fat_entry(io, cluster, END_OF_CHAIN)?;
        io.zero_sectors(
            self.geometry.cluster_to_sector(cluster),
            self.geometry.sectors_per_cluster as u64,
        )?;
        debug!("allocated cluster {cluster}");
        Ok(cluster)
    }

    /// Append a freshly allocated, zeroed cluster after `last_cluster`.
    pub fn extend_chain<D: Read + Write + Seek>(
        &self,
        io: &mut SectorIo<D>,
        last_cluster: u32,
    ) -> Result<u32, FilesystemError> {
        let new_cluster = self.allocate_cluster(io)?;
        self.set_fat_entry(io, last_cluster, new_cluster)?;
        debug!("extended chain {last_cluster} -> {new_cluster}");
        Ok(new_cluster)
    }

    /// Every cluster of the chain starting at `start`, in order.
    ///
    /// The walk is bounded by the cluster count of the volume. A link outside
    /// the data region, a free or bad entry inside the chain, or a chain
    /// longer than the volume is reported as corruption.
    pub fn chain<D: Read + Seek>(
        &self,
        io: &mut SectorIo<D>,
        start: u32,
    ) -> Result<Vec<u32>, FilesystemError> {
        if !self.geometry.is_data_cluster(start) {
            return Err(FilesystemError::Corrupt(format!(
                "chain starts at invalid cluster {start}"
            )));
        }
        let limit = self.geometry.total_clusters as usize;
        let mut clusters = vec![start];
        let mut current = start;
        loop {
            match self.entry(io, current)? {
                FatEntry::EndOfChain => return Ok(clusters),
                FatEntry::Next(next) => {
                    if !self.geometry.is_data_cluster(next) {
                        return Err(FilesystemError::Corrupt(format!(
                            "cluster {current} links to out-of-range cluster {next}"
                        )));
                    }
                    if clusters.len() >= limit {
                        return Err(FilesystemError::Corrupt(format!(
                            "cluster chain from {start} exceeds {limit} clusters (cycle?)"
                        )));
                    }
                    clusters.push(next);
                    current = next;
                }
                FatEntry::Free => {
                    return Err(FilesystemError::Corrupt(format!(
                        "cluster {current} in chain from {start} is marked free"
                    )));
                }
                FatEntry::Bad => {
                    return Err(FilesystemError::Corrupt(format!(
                        "cluster {current} in chain from {start} is marked bad"
                    )));
                }
                FatEntry::Reserved(v) => {
                    return Err(FilesystemError::Corrupt(format!(
                        "cluster {current} holds reserved value {v:#010X}"
                    )));
                }
            }
        }
    }
}
