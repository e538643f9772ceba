use super::entry::FileEntry;

pub use crate::error::FilesystemError;

/// Trait for browsing a mounted volume.
pub trait Filesystem: Send {
    /// Get the root directory entry.
    fn root(&mut self) -> Result<FileEntry, FilesystemError>;

    /// List the contents of a directory, without `.` and `..`.
    fn list_directory(&mut self, entry: &FileEntry) -> Result<Vec<FileEntry>, FilesystemError>;

    /// Volume label, if available.
    fn volume_label(&self) -> Option<&str>;

    /// Filesystem type name ("FAT32").
    fn fs_type(&self) -> &str;

    /// Total filesystem size in bytes.
    fn total_size(&self) -> u64;

    /// Used space in bytes.
    fn used_size(&mut self) -> Result<u64, FilesystemError>;
}

/// Trait for volumes that support creating entries.
///
/// Each method that modifies the filesystem should call `sync_metadata()` internally
/// before returning to ensure on-disk consistency.
pub trait EditableFilesystem: Filesystem {
    /// Create an empty file in the given parent directory. If an entry with
    /// that name already exists only its access date is refreshed.
    fn create_file(&mut self, parent: &FileEntry, name: &str) -> Result<FileEntry, FilesystemError>;

    /// Create a subdirectory in the given parent directory.
    fn create_directory(
        &mut self,
        parent: &FileEntry,
        name: &str,
    ) -> Result<FileEntry, FilesystemError>;

    /// Flush FSInfo and the backing image.
    fn sync_metadata(&mut self) -> Result<(), FilesystemError>;

    /// Returns the number of free bytes available on the filesystem.
    fn free_space(&mut self) -> Result<u64, FilesystemError>;
}
