use super::dir_entry::{format_fat_datetime, Attributes, FatTimestamp, ShortEntry};

/// Where a short entry lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySlot {
    /// Absolute sector holding the 32-byte short entry.
    pub sector: u64,
    /// Byte offset of the entry within that sector.
    pub offset: usize,
}

/// A resolved directory entry: a short entry plus its long name, if any.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Long name when present, otherwise the short display name.
    pub name: String,
    pub short_name: String,
    pub long_name: Option<String>,
    pub path: String,
    pub entry_type: EntryType,
    pub size: u64,
    /// First cluster; 0 for empty files and for a `..` that names the root.
    pub location: u64,
    pub parent_cluster: u32,
    pub attributes: Attributes,
    pub created: FatTimestamp,
    pub modified: FatTimestamp,
    pub access_date: u16,
    /// `None` for the root directory, which has no entry of its own.
    pub slot: Option<EntrySlot>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryType {
    File,
    Directory,
}

impl FileEntry {
    pub fn root(root_cluster: u32) -> Self {
        Self {
            name: "/".into(),
            short_name: "/".into(),
            long_name: None,
            path: "/".into(),
            entry_type: EntryType::Directory,
            size: 0,
            location: root_cluster as u64,
            parent_cluster: root_cluster,
            attributes: Attributes::DIRECTORY,
            created: FatTimestamp::default(),
            modified: FatTimestamp::default(),
            access_date: 0,
            slot: None,
        }
    }

    pub fn from_short(
        short: &ShortEntry,
        long_name: Option<String>,
        parent_path: &str,
        parent_cluster: u32,
        slot: EntrySlot,
    ) -> Self {
        let short_name = short.display_name();
        let name = long_name.clone().unwrap_or_else(|| short_name.clone());
        let path = if parent_path.is_empty() {
            name.clone()
        } else if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        };
        let entry_type = if short.is_directory() {
            EntryType::Directory
        } else {
            EntryType::File
        };
        Self {
            name,
            short_name,
            long_name,
            path,
            entry_type,
            size: if short.is_directory() {
                0
            } else {
                short.file_size as u64
            },
            location: short.first_cluster as u64,
            parent_cluster,
            attributes: short.attributes,
            created: short.created,
            modified: short.modified,
            access_date: short.access_date,
            slot: Some(slot),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    pub fn first_cluster(&self) -> u32 {
        self.location as u32
    }

    pub fn is_dot_entry(&self) -> bool {
        self.short_name == "." || self.short_name == ".."
    }

    /// Case-insensitive match against the long or short name.
    pub fn matches(&self, name: &str) -> bool {
        let wanted = name.to_lowercase();
        self.name.to_lowercase() == wanted || self.short_name.to_lowercase() == wanted
    }

    /// Last write time as `YYYY-MM-DD HH:MM:SS`, empty when never set.
    pub fn modified_string(&self) -> String {
        format_fat_datetime(self.modified.date, self.modified.time)
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::dir_entry::CaseFlags;

    #[test]
    fn test_from_short_prefers_long_name() {
        let short = ShortEntry::new(
            *b"AVERYL~1TXT",
            CaseFlags::empty(),
            Attributes::ARCHIVE,
            0,
            FatTimestamp::default(),
        );
        let slot = EntrySlot {
            sector: 700,
            offset: 64,
        };
        let entry = FileEntry::from_short(
            &short,
            Some("a_very_long_filename.txt".into()),
            "/",
            2,
            slot,
        );
        assert_eq!(entry.name, "a_very_long_filename.txt");
        assert_eq!(entry.short_name, "AVERYL~1.TXT");
        assert_eq!(entry.path, "/a_very_long_filename.txt");
        assert!(entry.is_file());
        assert!(entry.matches("A_VERY_LONG_FILENAME.TXT"));
        assert!(entry.matches("averyl~1.txt"));
        assert_eq!(entry.slot, Some(slot));

        let nested = FileEntry::from_short(&short, None, "/DOCS", 9, slot);
        assert_eq!(nested.path, "/DOCS/AVERYL~1.TXT");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(20 * 1024 * 1024), "20.0 MiB");
    }
}
