//! Mounted FAT32 volume: directory listing, entry creation and path
//! resolution on top of the FAT table and entry codec.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use super::boot_sector::{BootSector, FsInfo, Geometry, BOOT_SECTOR_SIZE, FSINFO_UNKNOWN};
use super::dir_entry::{
    build_lfn_entries, generate_short_name, lfn_checksum, validate_name, Attributes,
    FatTimestamp, LfnAssembler, RawEntry, ShortEntry, ShortNameKind, DIR_ENTRY_SIZE, ENTRY_END,
    ENTRY_FREE,
};
use super::entry::{EntrySlot, FileEntry};
use super::fat_table::FatTable;
use super::filesystem::{EditableFilesystem, Filesystem, FilesystemError};
use super::io::SectorIo;

/// FAT32 caps a directory at 65536 32-byte slots.
const MAX_DIR_SLOTS: usize = 65536;

/// A mounted FAT32 volume.
pub struct FatFilesystem<D> {
    io: SectorIo<D>,
    boot_sector: BootSector,
    geometry: Geometry,
    fat: FatTable,
    /// Advisory hints; updated on allocation, written by `sync_metadata`.
    fs_info: FsInfo,
    label: Option<String>,
    read_only: bool,
}

/// Outcome of [`FatFilesystem::create_entry`].
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(FileEntry),
    /// An entry of that name was already present; only its access date changed.
    Existing(FileEntry),
}

impl CreateOutcome {
    pub fn into_entry(self) -> FileEntry {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::Existing(e) => e,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Where path resolution currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    AtRoot,
    AtSubdir(u32),
}

/// Non-fatal conditions met while resolving a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathNotice {
    /// `..` was applied at the root and ignored.
    AboveRoot,
}

/// Result of a successful path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub cluster: u32,
    /// Display path of the target, e.g. `/DOCUMENTS/2024`.
    pub path: String,
    pub notices: Vec<PathNotice>,
}

/// Current directory of a session: a cluster plus the path shown to the user.
///
/// The cluster is authoritative. `..` always goes through the on-disk `..`
/// entry, never through the display path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory {
    cluster: u32,
    segments: Vec<String>,
}

impl WorkingDirectory {
    pub fn at_root(root_cluster: u32) -> Self {
        Self {
            cluster: root_cluster,
            segments: Vec::new(),
        }
    }

    pub fn cluster(&self) -> u32 {
        self.cluster
    }

    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// Move to `path`. On failure the working directory is unchanged.
    pub fn change<D: Read + Seek>(
        &mut self,
        fs: &mut FatFilesystem<D>,
        path: &str,
    ) -> Result<Vec<PathNotice>, FilesystemError> {
        let (resolution, segments) = fs.resolve_components(path, self)?;
        self.cluster = resolution.cluster;
        self.segments = segments;
        Ok(resolution.notices)
    }
}

/// A directory's clusters loaded into memory, for scanning and patching.
struct DirBuffer {
    clusters: Vec<u32>,
    sectors: Vec<u64>,
    data: Vec<u8>,
    bytes_per_sector: usize,
}

impl DirBuffer {
    fn slot_count(&self) -> usize {
        self.data.len() / DIR_ENTRY_SIZE
    }

    fn slot_bytes(&self, index: usize) -> &[u8] {
        &self.data[index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE]
    }

    fn slot_location(&self, index: usize) -> EntrySlot {
        let byte = index * DIR_ENTRY_SIZE;
        EntrySlot {
            sector: self.sectors[byte / self.bytes_per_sector],
            offset: byte % self.bytes_per_sector,
        }
    }

    fn sector_index_of(&self, slot: usize) -> usize {
        slot * DIR_ENTRY_SIZE / self.bytes_per_sector
    }

    /// Index of the first 0x00 terminator, or the slot count.
    fn end_index(&self) -> usize {
        (0..self.slot_count())
            .find(|&i| self.slot_bytes(i)[0] == ENTRY_END)
            .unwrap_or(self.slot_count())
    }

    /// Start of the first run of `needed` consecutive reusable slots.
    /// Everything from the terminator onwards is reusable.
    fn find_free_run(&self, needed: usize) -> Option<usize> {
        let end = self.end_index();
        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..self.slot_count() {
            let first = self.slot_bytes(i)[0];
            if i >= end || first == ENTRY_FREE || first == ENTRY_END {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == needed {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Raw names of every short entry, for tail uniqueness.
    fn short_names(&self) -> Vec<[u8; 11]> {
        let mut names = Vec::new();
        for i in 0..self.end_index() {
            if let RawEntry::Short(short) = RawEntry::decode(self.slot_bytes(i)) {
                names.push(short.name);
            }
        }
        names
    }
}

impl FatFilesystem<File> {
    /// Open an image file for reading and writing.
    pub fn open_image(path: impl AsRef<Path>) -> Result<Self, FilesystemError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::open(file)
    }

    /// Open an image file for listing only; mutating calls fail.
    pub fn open_image_read_only(path: impl AsRef<Path>) -> Result<Self, FilesystemError> {
        let file = File::open(path)?;
        let mut fs = Self::open(file)?;
        fs.read_only = true;
        Ok(fs)
    }
}

impl<D: Read + Seek> FatFilesystem<D> {
    /// Mount a FAT32 volume that starts at byte 0 of `device`.
    pub fn open(device: D) -> Result<Self, FilesystemError> {
        let mut probe = SectorIo::new(device, BOOT_SECTOR_SIZE as u16);
        let mut bpb = [0u8; BOOT_SECTOR_SIZE];
        probe
            .read_bytes_at(0, &mut bpb)
            .map_err(|e| FilesystemError::Parse(format!("cannot read boot sector: {e}")))?;

        let boot_sector = BootSector::parse(&bpb)?;
        let geometry = Geometry::from_boot_sector(&boot_sector)?;

        let device_len = probe.device_len()?;
        if device_len < geometry.total_size() {
            return Err(FilesystemError::Parse(format!(
                "image is {device_len} bytes but the volume claims {}",
                geometry.total_size()
            )));
        }

        let mut io = SectorIo::new(probe.into_inner(), boot_sector.bytes_per_sector);

        let fs_info_sector = boot_sector.fs_info_sector as u32;
        let fs_info = if fs_info_sector != 0 && fs_info_sector < geometry.reserved_sectors {
            let info = FsInfo::parse(&io.read_sector(fs_info_sector as u64)?);
            if !info.signatures_valid {
                warn!("FSInfo sector {fs_info_sector} has bad signatures; ignoring hints");
            }
            info
        } else {
            warn!("boot sector names no usable FSInfo sector");
            FsInfo {
                free_count: FSINFO_UNKNOWN,
                next_free: FSINFO_UNKNOWN,
                signatures_valid: false,
            }
        };

        info!(
            "mounted FAT32 volume {}: {} clusters of {} bytes, root cluster {}",
            boot_sector.serial_string(),
            geometry.total_clusters,
            geometry.cluster_size(),
            geometry.root_cluster
        );

        Ok(Self {
            io,
            label: boot_sector.label(),
            boot_sector,
            geometry,
            fat: FatTable::new(geometry),
            fs_info,
            read_only: false,
        })
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot_sector
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn fs_info(&self) -> &FsInfo {
        &self.fs_info
    }

    pub fn root_cluster(&self) -> u32 {
        self.geometry.root_cluster
    }

    /// Volume serial as `XXXX-XXXX`.
    pub fn volume_serial(&self) -> String {
        self.boot_sector.serial_string()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn working_root(&self) -> WorkingDirectory {
        WorkingDirectory::at_root(self.geometry.root_cluster)
    }

    pub fn into_inner(self) -> D {
        self.io.into_inner()
    }

    /// A `..` first cluster of 0 names the root.
    fn dir_cluster(&self, cluster: u32) -> u32 {
        if cluster == 0 {
            self.geometry.root_cluster
        } else {
            cluster
        }
    }

    /// Masked FAT entry for `cluster`.
    pub fn get_next_cluster(&mut self, cluster: u32) -> Result<u32, FilesystemError> {
        self.fat.get_next_cluster(&mut self.io, cluster)
    }

    pub fn find_free_cluster(&mut self) -> Result<Option<u32>, FilesystemError> {
        self.fat.find_free_cluster(&mut self.io)
    }

    /// Every cluster of a chain, with cycle and range checks.
    pub fn chain(&mut self, start: u32) -> Result<Vec<u32>, FilesystemError> {
        self.fat.chain(&mut self.io, start)
    }

    pub fn free_cluster_count(&mut self) -> Result<u32, FilesystemError> {
        let free = self.fat.free_cluster_count(&mut self.io)?;
        self.fs_info.free_count = free;
        Ok(free)
    }

    fn load_dir(&mut self, cluster: u32) -> Result<DirBuffer, FilesystemError> {
        let cluster = self.dir_cluster(cluster);
        let clusters = self.fat.chain(&mut self.io, cluster)?;
        let spc = self.geometry.sectors_per_cluster as u64;
        let mut sectors = Vec::with_capacity(clusters.len() * spc as usize);
        let mut data = Vec::with_capacity(clusters.len() * self.geometry.cluster_size());
        for &c in &clusters {
            let first = self.geometry.cluster_to_sector(c);
            data.extend_from_slice(&self.io.read_sectors(first, spc)?);
            sectors.extend(first..first + spc);
        }
        Ok(DirBuffer {
            clusters,
            sectors,
            data,
            bytes_per_sector: self.io.bytes_per_sector(),
        })
    }

    /// Decode live entries in on-disk order. Stops at the first terminator.
    fn parse_directory(
        &self,
        buf: &DirBuffer,
        cluster: u32,
        parent_path: &str,
    ) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        let mut lfn = LfnAssembler::default();
        for i in 0..buf.slot_count() {
            match RawEntry::decode(buf.slot_bytes(i)) {
                RawEntry::End => break,
                RawEntry::Free => lfn.clear(),
                RawEntry::Lfn(fragment) => lfn.push(fragment),
                RawEntry::Short(short) => {
                    if short.is_volume_label() {
                        lfn.clear();
                        continue;
                    }
                    let long_name = lfn.take_name(&short);
                    entries.push(FileEntry::from_short(
                        &short,
                        long_name,
                        parent_path,
                        cluster,
                        buf.slot_location(i),
                    ));
                }
            }
        }
        entries
    }

    fn read_entries(
        &mut self,
        cluster: u32,
        parent_path: &str,
    ) -> Result<Vec<FileEntry>, FilesystemError> {
        let cluster = self.dir_cluster(cluster);
        let buf = self.load_dir(cluster)?;
        let mut entries = self.parse_directory(&buf, cluster, parent_path);
        sort_entries(&mut entries);
        Ok(entries)
    }

    /// All live entries of a directory, `.` and `..` included, sorted
    /// case-insensitively ignoring one leading dot. Equal names keep their
    /// on-disk order.
    pub fn list_dir(&mut self, cluster: u32) -> Result<Vec<FileEntry>, FilesystemError> {
        let parent_path = if self.dir_cluster(cluster) == self.geometry.root_cluster {
            "/"
        } else {
            ""
        };
        self.read_entries(cluster, parent_path)
    }

    /// Case-insensitive lookup by long or short name.
    pub fn find_entry(
        &mut self,
        cluster: u32,
        name: &str,
    ) -> Result<Option<FileEntry>, FilesystemError> {
        Ok(self
            .list_dir(cluster)?
            .into_iter()
            .find(|e| !e.is_dot_entry() && e.matches(name)))
    }

    /// Cluster a directory's `..` entry points at, with 0 mapped to the root.
    fn parent_of(&mut self, cluster: u32) -> Result<u32, FilesystemError> {
        let buf = self.load_dir(cluster)?;
        let dotdot = self
            .parse_directory(&buf, cluster, "")
            .into_iter()
            .find(|e| e.short_name == "..")
            .ok_or_else(|| {
                FilesystemError::Corrupt(format!("directory at cluster {cluster} has no .. entry"))
            })?;
        Ok(self.dir_cluster(dotdot.first_cluster()))
    }

    /// Resolve `path` starting from `from`. A leading `/` (or an empty
    /// path) starts at the root.
    pub fn resolve_path(
        &mut self,
        path: &str,
        from: &WorkingDirectory,
    ) -> Result<Resolution, FilesystemError> {
        Ok(self.resolve_components(path, from)?.0)
    }

    /// Cluster of an absolute path.
    pub fn cluster_of(&mut self, path: &str) -> Result<u32, FilesystemError> {
        let root = self.working_root();
        Ok(self.resolve_path(path, &root)?.cluster)
    }

    fn resolve_components(
        &mut self,
        path: &str,
        from: &WorkingDirectory,
    ) -> Result<(Resolution, Vec<String>), FilesystemError> {
        let root = self.geometry.root_cluster;
        let absolute = path.is_empty() || path.starts_with('/');
        let (mut state, mut segments) = if absolute {
            (NavState::AtRoot, Vec::new())
        } else if from.cluster == root {
            (NavState::AtRoot, Vec::new())
        } else {
            (NavState::AtSubdir(from.cluster), from.segments.clone())
        };
        let mut notices = Vec::new();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            match (component, state) {
                (".", _) => {}
                ("..", NavState::AtRoot) => {
                    warn!("No entry above root directory");
                    notices.push(PathNotice::AboveRoot);
                }
                ("..", NavState::AtSubdir(cluster)) => {
                    let parent = self.parent_of(cluster)?;
                    segments.pop();
                    state = if parent == root {
                        NavState::AtRoot
                    } else {
                        NavState::AtSubdir(parent)
                    };
                }
                (name, current) => {
                    let cluster = match current {
                        NavState::AtRoot => root,
                        NavState::AtSubdir(c) => c,
                    };
                    let entry = self.find_entry(cluster, name)?.ok_or_else(|| {
                        FilesystemError::NotFound(display_join(&segments, name))
                    })?;
                    if !entry.is_directory() {
                        return Err(FilesystemError::NotADirectory(display_join(
                            &segments, &entry.name,
                        )));
                    }
                    let target = self.dir_cluster(entry.first_cluster());
                    segments.push(entry.name);
                    state = if target == root {
                        NavState::AtRoot
                    } else {
                        NavState::AtSubdir(target)
                    };
                }
            }
        }

        let cluster = match state {
            NavState::AtRoot => root,
            NavState::AtSubdir(c) => c,
        };
        let resolution = Resolution {
            cluster,
            path: format!("/{}", segments.join("/")),
            notices,
        };
        Ok((resolution, segments))
    }

    /// Bytes in free clusters, from a full FAT scan.
    pub fn free_bytes(&mut self) -> Result<u64, FilesystemError> {
        Ok(self.free_cluster_count()? as u64 * self.geometry.cluster_size() as u64)
    }
}

impl<D: Read + Write + Seek> FatFilesystem<D> {
    fn ensure_writable(&self) -> Result<(), FilesystemError> {
        if self.read_only {
            return Err(FilesystemError::Unsupported("volume is opened read-only".into()));
        }
        Ok(())
    }

    pub fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FilesystemError> {
        self.ensure_writable()?;
        self.fat.set_fat_entry(&mut self.io, cluster, value)
    }

    fn note_allocation(&mut self, cluster: u32) {
        if self.fs_info.free_count != FSINFO_UNKNOWN && self.fs_info.free_count > 0 {
            self.fs_info.free_count -= 1;
        }
        self.fs_info.next_free = if cluster < self.geometry.max_cluster() {
            cluster + 1
        } else {
            FSINFO_UNKNOWN
        };
    }

    /// Claim a free cluster as a one-cluster chain, zeroed.
    pub fn allocate_cluster(&mut self) -> Result<u32, FilesystemError> {
        self.ensure_writable()?;
        let cluster = self.fat.allocate_cluster(&mut self.io)?;
        self.note_allocation(cluster);
        Ok(cluster)
    }

    /// Link a new zeroed cluster after `last_cluster`.
    pub fn extend_chain(&mut self, last_cluster: u32) -> Result<u32, FilesystemError> {
        self.ensure_writable()?;
        let cluster = self.fat.extend_chain(&mut self.io, last_cluster)?;
        self.note_allocation(cluster);
        Ok(cluster)
    }

    /// Refresh the last-access date of an existing entry in place.
    fn touch_access_date(
        &mut self,
        entry: &mut FileEntry,
        now: FatTimestamp,
    ) -> Result<(), FilesystemError> {
        let Some(slot) = entry.slot else {
            return Ok(());
        };
        let mut sector = self.io.read_sector(slot.sector)?;
        LittleEndian::write_u16(&mut sector[slot.offset + 18..slot.offset + 20], now.date);
        self.io.write_sector(slot.sector, &sector)?;
        entry.access_date = now.date;
        debug!("refreshed access date of {}", entry.name);
        Ok(())
    }

    /// Create a file or directory named `name` in the directory at
    /// `parent_cluster`.
    ///
    /// If the name already exists (case-insensitively) only its access date
    /// is updated. A new directory gets its own zeroed cluster holding `.`
    /// and `..` before the parent entry referencing it is written. A
    /// failure part way leaves whatever was already written in place.
    pub fn create_entry(
        &mut self,
        parent_cluster: u32,
        name: &str,
        is_dir: bool,
    ) -> Result<CreateOutcome, FilesystemError> {
        self.create_entry_in(parent_cluster, "", name, is_dir)
    }

    fn create_entry_in(
        &mut self,
        parent_cluster: u32,
        parent_path: &str,
        name: &str,
        is_dir: bool,
    ) -> Result<CreateOutcome, FilesystemError> {
        self.ensure_writable()?;
        validate_name(name)?;
        let parent = self.dir_cluster(parent_cluster);
        let now = FatTimestamp::now();

        let mut buf = self.load_dir(parent)?;
        if let Some(mut existing) = self
            .parse_directory(&buf, parent, parent_path)
            .into_iter()
            .find(|e| !e.is_dot_entry() && e.matches(name))
        {
            self.touch_access_date(&mut existing, now)?;
            self.sync_metadata()?;
            return Ok(CreateOutcome::Existing(existing));
        }

        let kind = if is_dir {
            ShortNameKind::Directory
        } else {
            ShortNameKind::File
        };
        let short_name = generate_short_name(name, kind, &buf.short_names())?;
        let lfn_entries = if short_name.needs_lfn {
            build_lfn_entries(name, lfn_checksum(&short_name.raw))?
        } else {
            Vec::new()
        };
        let needed = lfn_entries.len() + 1;

        let start = loop {
            if let Some(start) = buf.find_free_run(needed) {
                break start;
            }
            if buf.slot_count() >= MAX_DIR_SLOTS {
                return Err(FilesystemError::DiskFull(format!(
                    "directory at cluster {parent} is full"
                )));
            }
            let last = buf.clusters.last().copied().unwrap_or(parent);
            let new_cluster = self.extend_chain(last)?;
            let first = self.geometry.cluster_to_sector(new_cluster);
            let spc = self.geometry.sectors_per_cluster as u64;
            buf.clusters.push(new_cluster);
            buf.sectors.extend(first..first + spc);
            buf.data
                .resize(buf.data.len() + self.geometry.cluster_size(), 0);
        };
        let end_before = buf.end_index();

        let (attributes, first_cluster) = if is_dir {
            let cluster = self.allocate_cluster()?;
            self.write_dot_entries(cluster, parent, now)?;
            (Attributes::DIRECTORY, cluster)
        } else {
            (Attributes::ARCHIVE, 0)
        };
        let short = ShortEntry::new(
            short_name.raw,
            short_name.case,
            attributes,
            first_cluster,
            now,
        );

        let mut dirty = BTreeSet::new();
        for (i, lfn) in lfn_entries.iter().enumerate() {
            let slot = start + i;
            buf.data[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
                .copy_from_slice(&lfn.to_bytes());
            dirty.insert(buf.sector_index_of(slot));
        }
        let short_slot = start + lfn_entries.len();
        buf.data[short_slot * DIR_ENTRY_SIZE..(short_slot + 1) * DIR_ENTRY_SIZE]
            .copy_from_slice(&short.to_bytes());
        dirty.insert(buf.sector_index_of(short_slot));

        // Entries written at or past the old terminator must be followed by one.
        let after = short_slot + 1;
        if short_slot >= end_before
            && after < buf.slot_count()
            && buf.data[after * DIR_ENTRY_SIZE] != ENTRY_END
        {
            buf.data[after * DIR_ENTRY_SIZE] = ENTRY_END;
            dirty.insert(buf.sector_index_of(after));
        }

        let bps = buf.bytes_per_sector;
        for &index in &dirty {
            self.io
                .write_sector(buf.sectors[index], &buf.data[index * bps..(index + 1) * bps])?;
        }
        debug!(
            "wrote {} entr{} for {name:?} at slot {start} of directory {parent}",
            needed,
            if needed == 1 { "y" } else { "ies" }
        );

        self.sync_metadata()?;

        let long_name = short_name.needs_lfn.then(|| name.to_string());
        Ok(CreateOutcome::Created(FileEntry::from_short(
            &short,
            long_name,
            parent_path,
            parent,
            buf.slot_location(short_slot),
        )))
    }

    /// Fill the first two slots of a fresh directory cluster.
    fn write_dot_entries(
        &mut self,
        cluster: u32,
        parent: u32,
        now: FatTimestamp,
    ) -> Result<(), FilesystemError> {
        let parent_ref = if parent == self.geometry.root_cluster { 0 } else { parent };
        let sector_no = self.geometry.cluster_to_sector(cluster);
        let mut sector = self.io.read_sector(sector_no)?;
        sector[0..DIR_ENTRY_SIZE].copy_from_slice(&ShortEntry::dot(cluster, now).to_bytes());
        sector[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]
            .copy_from_slice(&ShortEntry::dotdot(parent_ref, now).to_bytes());
        self.io.write_sector(sector_no, &sector)
    }

    /// Create the last component of `path`, resolving its parent from `from`.
    pub fn create_at_path(
        &mut self,
        path: &str,
        from: &WorkingDirectory,
        is_dir: bool,
    ) -> Result<CreateOutcome, FilesystemError> {
        let trimmed = path.trim_end_matches('/');
        let (parent_path, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => (".", trimmed),
        };
        let parent = self.resolve_path(parent_path, from)?;
        self.create_entry_in(parent.cluster, &parent.path, name, is_dir)
    }

    /// Write FSInfo (primary and backup) and flush the image.
    pub fn sync_metadata(&mut self) -> Result<(), FilesystemError> {
        self.ensure_writable()?;
        let fs_info_sector = self.boot_sector.fs_info_sector as u64;
        if fs_info_sector != 0 && fs_info_sector < self.geometry.reserved_sectors as u64 {
            let bytes = self.fs_info.to_bytes(self.io.bytes_per_sector());
            self.io.write_sector(fs_info_sector, &bytes)?;
            let backup = self.boot_sector.backup_boot_sector as u64;
            if backup != 0 && backup + fs_info_sector < self.geometry.reserved_sectors as u64 {
                self.io.write_sector(backup + fs_info_sector, &bytes)?;
            }
            self.fs_info.signatures_valid = true;
        }
        self.io.flush()
    }
}

fn display_join(segments: &[String], name: &str) -> String {
    if segments.is_empty() {
        format!("/{name}")
    } else {
        format!("/{}/{name}", segments.join("/"))
    }
}

/// Sort key: lower-cased name with one leading dot dropped.
fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by_cached_key(|e| {
        let name = e.name.strip_prefix('.').unwrap_or(e.name.as_str());
        name.to_lowercase()
    });
}

impl<D: Read + Seek + Send> Filesystem for FatFilesystem<D> {
    fn root(&mut self) -> Result<FileEntry, FilesystemError> {
        Ok(FileEntry::root(self.geometry.root_cluster))
    }

    fn list_directory(&mut self, entry: &FileEntry) -> Result<Vec<FileEntry>, FilesystemError> {
        if !entry.is_directory() {
            return Err(FilesystemError::NotADirectory(entry.path.clone()));
        }
        let entries = self.read_entries(entry.first_cluster(), &entry.path)?;
        Ok(entries.into_iter().filter(|e| !e.is_dot_entry()).collect())
    }

    fn volume_label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn fs_type(&self) -> &str {
        "FAT32"
    }

    fn total_size(&self) -> u64 {
        self.geometry.total_size()
    }

    fn used_size(&mut self) -> Result<u64, FilesystemError> {
        let free = self.free_cluster_count()?;
        Ok((self.geometry.total_clusters - free) as u64 * self.geometry.cluster_size() as u64)
    }
}

impl<D: Read + Write + Seek + Send> EditableFilesystem for FatFilesystem<D> {
    fn create_file(
        &mut self,
        parent: &FileEntry,
        name: &str,
    ) -> Result<FileEntry, FilesystemError> {
        if !parent.is_directory() {
            return Err(FilesystemError::NotADirectory(parent.path.clone()));
        }
        Ok(self
            .create_entry_in(parent.first_cluster(), &parent.path, name, false)?
            .into_entry())
    }

    fn create_directory(
        &mut self,
        parent: &FileEntry,
        name: &str,
    ) -> Result<FileEntry, FilesystemError> {
        if !parent.is_directory() {
            return Err(FilesystemError::NotADirectory(parent.path.clone()));
        }
        Ok(self
            .create_entry_in(parent.first_cluster(), &parent.path, name, true)?
            .into_entry())
    }

    fn sync_metadata(&mut self) -> Result<(), FilesystemError> {
        FatFilesystem::sync_metadata(self)
    }

    fn free_space(&mut self) -> Result<u64, FilesystemError> {
        self.free_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat_table::{END_OF_CHAIN, END_OF_CHAIN_MIN};
    use crate::fs::format::{format_volume, FormatOptions};
    use std::io::Cursor;

    const MIB: u64 = 1024 * 1024;

    fn fresh_volume(size: u64) -> FatFilesystem<Cursor<Vec<u8>>> {
        let mut cursor = Cursor::new(vec![0u8; size as usize]);
        format_volume(&mut cursor, size, &FormatOptions::default()).unwrap();
        FatFilesystem::open(cursor).unwrap()
    }

    fn names(entries: &[FileEntry]) -> Vec<String> {
        entries.iter().map(|e| e.name.clone()).collect()
    }

    #[test]
    fn test_open_formatted_volume() {
        let fs = fresh_volume(20 * MIB);
        assert_eq!(fs.root_cluster(), 2);
        assert_eq!(fs.geometry().bytes_per_sector, 512);
        assert!(fs.fs_info().signatures_valid);
        assert_eq!(fs.volume_serial().len(), 9);
        assert_eq!(fs.fs_type(), "FAT32");
    }

    #[test]
    fn test_open_rejects_truncated_image() {
        let mut cursor = Cursor::new(vec![0u8; (20 * MIB) as usize]);
        format_volume(&mut cursor, 20 * MIB, &FormatOptions::default()).unwrap();
        let mut data = cursor.into_inner();
        data.truncate((10 * MIB) as usize);
        assert!(matches!(
            FatFilesystem::open(Cursor::new(data)),
            Err(FilesystemError::Parse(_))
        ));
    }

    #[test]
    fn test_open_rejects_blank_image() {
        let result = FatFilesystem::open(Cursor::new(vec![0u8; 4096]));
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(crate::error::ErrorKind::Format)
        );
    }

    #[test]
    fn test_mkdir_and_list_root() {
        let mut fs = fresh_volume(20 * MIB);
        let outcome = fs.create_entry(2, "DOCUMENTS", true).unwrap();
        assert!(outcome.was_created());

        let root = fs.list_dir(2).unwrap();
        let docs = root.iter().find(|e| e.name == "DOCUMENTS").unwrap();
        assert!(docs.attributes.contains(Attributes::DIRECTORY));
        assert!(docs.first_cluster() >= 3);
        assert_eq!(docs.short_name, "DOCUME~1");

        let inside = fs.list_dir(docs.first_cluster()).unwrap();
        assert_eq!(names(&inside), vec![".", ".."]);
        assert_eq!(inside[0].first_cluster(), docs.first_cluster());
        assert_eq!(inside[1].first_cluster(), 0);
        assert!(fs.get_next_cluster(docs.first_cluster()).unwrap() >= END_OF_CHAIN_MIN);
    }

    #[test]
    fn test_long_file_name_roundtrip() {
        let mut fs = fresh_volume(20 * MIB);
        fs.create_entry(2, "a_very_long_filename.txt", false).unwrap();
        let entry = fs.find_entry(2, "a_very_long_filename.txt").unwrap().unwrap();
        assert_eq!(entry.long_name.as_deref(), Some("a_very_long_filename.txt"));
        assert_eq!(entry.short_name, "AVERYL~1.TXT");
        assert!(entry.is_file());
        assert_eq!(entry.first_cluster(), 0);
        assert!(entry.attributes.contains(Attributes::ARCHIVE));

        fs.create_entry(2, "a_very_long_filename_2.txt", false).unwrap();
        let second = fs.find_entry(2, "a_very_long_filename_2.txt").unwrap().unwrap();
        assert_eq!(second.short_name, "AVERYL~2.TXT");
    }

    #[test]
    fn test_short_name_without_lfn() {
        let mut fs = fresh_volume(20 * MIB);
        fs.create_entry(2, "notes", false).unwrap();
        let entry = fs.find_entry(2, "NOTES").unwrap().unwrap();
        assert_eq!(entry.long_name, None);
        assert_eq!(entry.name, "notes");

        let slot = entry.slot.unwrap();
        let sector = fs.io.read_sector(slot.sector).unwrap();
        assert_eq!(&sector[slot.offset..slot.offset + 11], b"NOTES      ");
        // Nothing precedes it but the end of the (empty) root.
        assert_eq!(slot.offset, 0);
    }

    #[test]
    fn test_existing_name_is_not_duplicated() {
        let mut fs = fresh_volume(20 * MIB);
        assert!(fs.create_entry(2, "report.txt", false).unwrap().was_created());
        let again = fs.create_entry(2, "REPORT.TXT", false).unwrap();
        assert!(!again.was_created());
        assert_eq!(fs.list_dir(2).unwrap().len(), 1);
    }

    #[test]
    fn test_listing_is_sorted_ignoring_leading_dot() {
        let mut fs = fresh_volume(20 * MIB);
        for name in ["zeta", ".hidden", "Alpha", "beta"] {
            fs.create_entry(2, name, false).unwrap();
        }
        // "Alpha" fits 8.3 but is mixed case, so it is stored upper-cased.
        let listed = names(&fs.list_dir(2).unwrap());
        assert_eq!(listed, vec!["ALPHA", "beta", ".hidden", "zeta"]);
    }

    #[test]
    fn test_directory_grows_past_one_cluster() {
        let mut fs = fresh_volume(20 * MIB);
        // 512-byte clusters hold 16 slots; each name below needs 3.
        for i in 0..12 {
            fs.create_entry(2, &format!("a_long_file_name_{i:02}.txt"), false)
                .unwrap();
        }
        assert!(fs.chain(2).unwrap().len() >= 3);
        let listed = fs.list_dir(2).unwrap();
        assert_eq!(listed.len(), 12);
        assert_eq!(listed[0].name, "a_long_file_name_00.txt");
        assert_eq!(listed[11].name, "a_long_file_name_11.txt");
    }

    #[test]
    fn test_deleted_slots_are_reused() {
        let mut fs = fresh_volume(20 * MIB);
        fs.create_entry(2, "first", false).unwrap();
        fs.create_entry(2, "second", false).unwrap();
        let first = fs.find_entry(2, "first").unwrap().unwrap();
        let slot = first.slot.unwrap();
        let mut sector = fs.io.read_sector(slot.sector).unwrap();
        sector[slot.offset] = ENTRY_FREE;
        fs.io.write_sector(slot.sector, &sector).unwrap();

        fs.create_entry(2, "third", false).unwrap();
        let third = fs.find_entry(2, "third").unwrap().unwrap();
        assert_eq!(third.slot, Some(slot));
        assert_eq!(names(&fs.list_dir(2).unwrap()), vec!["second", "third"]);
    }

    #[test]
    fn test_scan_stops_at_end_marker() {
        let mut fs = fresh_volume(20 * MIB);
        fs.create_entry(2, "first", false).unwrap();
        fs.create_entry(2, "second", false).unwrap();
        let first = fs.find_entry(2, "first").unwrap().unwrap().slot.unwrap();
        let second = fs.find_entry(2, "second").unwrap().unwrap().slot.unwrap();
        assert_eq!(second.sector, first.sector);

        let mut sector = fs.io.read_sector(first.sector).unwrap();
        sector[first.offset] = ENTRY_END;
        fs.io.write_sector(first.sector, &sector).unwrap();

        // The later entry is still intact on disk but lies past the end marker.
        let sector = fs.io.read_sector(second.sector).unwrap();
        assert_eq!(&sector[second.offset..second.offset + 11], b"SECOND     ");
        assert!(fs.list_dir(2).unwrap().is_empty());
        assert!(fs.find_entry(2, "second").unwrap().is_none());
    }

    #[test]
    fn test_resolve_dotdot_uses_on_disk_parent() {
        let mut fs = fresh_volume(20 * MIB);
        let a = fs.create_entry(2, "A", true).unwrap().into_entry();
        let b = fs.create_entry(a.first_cluster(), "B", true).unwrap().into_entry();
        let root = fs.working_root();

        let res = fs.resolve_path("/A/B", &root).unwrap();
        assert_eq!(res.cluster, b.first_cluster());
        assert_eq!(res.path, "/A/B");

        let res = fs.resolve_path("/A/B/..", &root).unwrap();
        assert_eq!(res.cluster, a.first_cluster());
        assert_eq!(res.path, "/A");

        let res = fs.resolve_path("/A/./B/../..", &root).unwrap();
        assert_eq!(res.cluster, 2);
        assert!(res.notices.is_empty());
    }

    #[test]
    fn test_dotdot_above_root_is_a_notice() {
        let mut fs = fresh_volume(20 * MIB);
        fs.create_entry(2, "A", true).unwrap();
        let root = fs.working_root();
        let res = fs.resolve_path("../../A", &root).unwrap();
        assert_eq!(res.path, "/A");
        assert_eq!(res.notices, vec![PathNotice::AboveRoot, PathNotice::AboveRoot]);
    }

    #[test]
    fn test_resolve_errors() {
        let mut fs = fresh_volume(20 * MIB);
        fs.create_entry(2, "file.txt", false).unwrap();
        let root = fs.working_root();
        assert!(matches!(
            fs.resolve_path("/missing", &root),
            Err(FilesystemError::NotFound(_))
        ));
        assert!(matches!(
            fs.resolve_path("/file.txt", &root),
            Err(FilesystemError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_working_directory_change() {
        let mut fs = fresh_volume(20 * MIB);
        let docs = fs.create_entry(2, "docs", true).unwrap().into_entry();
        fs.create_entry(docs.first_cluster(), "2024", true).unwrap();

        let mut wd = fs.working_root();
        wd.change(&mut fs, "docs").unwrap();
        assert_eq!(wd.path(), "/docs");
        wd.change(&mut fs, "2024").unwrap();
        assert_eq!(wd.path(), "/docs/2024");

        assert!(wd.change(&mut fs, "nope").is_err());
        assert_eq!(wd.path(), "/docs/2024");

        wd.change(&mut fs, "..").unwrap();
        assert_eq!(wd.cluster(), docs.first_cluster());
        wd.change(&mut fs, "/").unwrap();
        assert_eq!(wd.cluster(), 2);
    }

    #[test]
    fn test_create_at_path() {
        let mut fs = fresh_volume(20 * MIB);
        let root = fs.working_root();
        fs.create_at_path("/projects", &root, true).unwrap();
        let created = fs
            .create_at_path("/projects/readme.md", &root, false)
            .unwrap()
            .into_entry();
        assert_eq!(created.path, "/projects/readme.md");
        let cluster = fs.cluster_of("/projects").unwrap();
        assert_eq!(created.parent_cluster, cluster);
        assert!(fs.find_entry(cluster, "README.MD").unwrap().is_some());
    }

    #[test]
    fn test_allocation_updates_fsinfo_hints() {
        let mut fs = fresh_volume(20 * MIB);
        let free_before = fs.free_cluster_count().unwrap();
        let cluster = fs.allocate_cluster().unwrap();
        assert!(fs.get_next_cluster(cluster).unwrap() >= END_OF_CHAIN_MIN);
        assert_eq!(fs.fs_info().free_count, free_before - 1);
        assert_eq!(fs.fs_info().next_free, cluster + 1);
        fs.sync_metadata().unwrap();

        let reopened = FatFilesystem::open(fs.into_inner()).unwrap();
        assert_eq!(reopened.fs_info().free_count, free_before - 1);
    }

    #[test]
    fn test_corrupt_directory_chain_reported() {
        let mut fs = fresh_volume(20 * MIB);
        let a = fs.create_entry(2, "A", true).unwrap().into_entry();
        let c = a.first_cluster();
        let extra = fs.extend_chain(c).unwrap();
        fs.set_fat_entry(extra, c).unwrap();
        assert!(matches!(fs.list_dir(c), Err(FilesystemError::Corrupt(_))));
        fs.set_fat_entry(extra, END_OF_CHAIN).unwrap();
        assert_eq!(fs.list_dir(c).unwrap().len(), 2);
    }

    #[test]
    fn test_trait_view_hides_dot_entries() {
        let mut fs = fresh_volume(20 * MIB);
        let root = fs.root().unwrap();
        let dir = fs.create_directory(&root, "music").unwrap();
        fs.create_file(&dir, "track01.mp3").unwrap();
        let listed = fs.list_directory(&dir).unwrap();
        assert_eq!(names(&listed), vec!["track01.mp3"]);
        assert_eq!(listed[0].path, "/music/track01.mp3");
        assert!(fs.used_size().unwrap() > 0);
        assert!(fs.free_space().unwrap() < fs.total_size());
    }

    #[test]
    fn test_read_only_session_refuses_writes() {
        let mut cursor = Cursor::new(vec![0u8; (20 * MIB) as usize]);
        format_volume(&mut cursor, 20 * MIB, &FormatOptions::default()).unwrap();
        let mut fs = FatFilesystem::open(cursor).unwrap();
        fs.read_only = true;
        assert!(matches!(
            fs.create_entry(2, "x", false),
            Err(FilesystemError::Unsupported(_))
        ));
        assert!(fs.list_dir(2).unwrap().is_empty());
    }
}
