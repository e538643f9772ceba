use thiserror::Error;

/// Errors from FAT32 volume operations.
#[derive(Error, Debug)]
pub enum FilesystemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short transfer at sector {sector}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        sector: u64,
        expected: usize,
        actual: usize,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("corrupt volume: {0}")]
    Corrupt(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("invalid name: {0}")]
    InvalidName(String),
}

/// Coarse classification of a [`FilesystemError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Format,
    Corruption,
    OutOfSpace,
    NotFound,
    WrongType,
    InvalidInput,
}

impl FilesystemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilesystemError::Io(_) | FilesystemError::ShortTransfer { .. } => ErrorKind::Io,
            FilesystemError::Parse(_) | FilesystemError::Unsupported(_) => ErrorKind::Format,
            FilesystemError::Corrupt(_) => ErrorKind::Corruption,
            FilesystemError::DiskFull(_) => ErrorKind::OutOfSpace,
            FilesystemError::NotFound(_) => ErrorKind::NotFound,
            FilesystemError::NotADirectory(_) => ErrorKind::WrongType,
            FilesystemError::InvalidName(_) => ErrorKind::InvalidInput,
        }
    }

    /// Only failures of the backing image itself should end an interactive
    /// session; everything else is reported and the session continues.
    pub fn is_fatal_to_session(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let io = FilesystemError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(io.is_fatal_to_session());

        let missing = FilesystemError::NotFound("/A".into());
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(!missing.is_fatal_to_session());

        assert_eq!(
            FilesystemError::Corrupt("cycle".into()).kind(),
            ErrorKind::Corruption
        );
        assert_eq!(
            FilesystemError::DiskFull("no free cluster".into()).kind(),
            ErrorKind::OutOfSpace
        );
    }

    #[test]
    fn test_display_messages() {
        let err = FilesystemError::ShortTransfer {
            sector: 7,
            expected: 512,
            actual: 100,
        };
        assert_eq!(
            err.to_string(),
            "short transfer at sector 7: expected 512 bytes, got 100"
        );
        assert_eq!(
            FilesystemError::NotADirectory("/A/file.txt".into()).to_string(),
            "not a directory: /A/file.txt"
        );
    }
}
