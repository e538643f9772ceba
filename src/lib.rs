//! User-space FAT32 driver for raw disk images.
//!
//! [`FatFilesystem`] mounts an image (any `Read + Seek` device, or a file via
//! [`FatFilesystem::open_image`]) and offers directory listing, path
//! resolution and creation of files and directories. [`format_image`] lays
//! down a fresh FAT32 volume and [`validate_fat32`] checks an existing one.

pub mod error;
pub mod fs;

pub use error::{ErrorKind, FilesystemError};
pub use fs::{
    format_image, format_volume, validate_fat32, FatFilesystem, FileEntry, FormatOptions,
    WorkingDirectory,
};
