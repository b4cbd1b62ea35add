use thiserror::Error;

/// Errors surfaced by the filesystem.
///
/// `BadBlock` is special: the engine always retries it internally by
/// relocating onto a fresh block, so public operations never return it.
/// The one place relocation is impossible is the superblock pair at
/// blocks {0, 1}, which surfaces `Frozen` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("device i/o failure")]
    Io,
    #[error("data corrupted or device not formatted")]
    Corrupt,
    #[error("device reported a bad block")]
    BadBlock,
    #[error("entry not found")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("entry is not a directory")]
    NotDir,
    #[error("entry is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("bad file or directory handle")]
    BadFile,
    #[error("file too large")]
    FileTooLarge,
    #[error("no space left on device")]
    NoSpace,
    #[error("no attribute with that type")]
    NoAttr,
    #[error("name too long")]
    NameTooLong,
    #[error("invalid argument")]
    Invalid,
    #[error("superblock pair failed, filesystem is frozen")]
    Frozen,
}

pub type Result<T> = core::result::Result<T, FsError>;
