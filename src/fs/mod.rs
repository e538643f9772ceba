pub mod boot_sector;
pub mod dir_entry;
pub mod entry;
pub mod fat;
pub mod fat_table;
pub mod filesystem;
pub mod format;
pub mod io;
pub mod validate;

pub use boot_sector::{BootSector, FatType, FsInfo, Geometry};
pub use dir_entry::{Attributes, FatTimestamp};
pub use entry::{EntryType, FileEntry};
pub use fat::{CreateOutcome, FatFilesystem, PathNotice, Resolution, WorkingDirectory};
pub use filesystem::{EditableFilesystem, Filesystem, FilesystemError};
pub use format::{format_image, format_volume, FormatOptions};
pub use validate::{is_fat32, validate_fat32};
