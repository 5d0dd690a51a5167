//! Error types for the archive filesystem.

use crate::types::ArchiveFormat;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The archive could not be opened (missing, corrupt or unreadable header).
    #[error("Cannot open archive {path}: {reason}")]
    ArchiveOpen {
        /// Path of the archive file
        path: PathBuf,
        /// Human readable reason reported by the engine
        reason: String,
    },

    /// The archive format is not supported.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The decoding engine could not be loaded.
    #[error("Library load error: {0}")]
    LibraryLoad(#[from] LoadError),

    /// The archive needs a password and the one supplied (if any) is wrong.
    #[error("Password is wrong")]
    WrongPassword,

    /// Decoding a single entry failed.
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    /// No node exists at the given path.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// The path resolves to a file where a directory was expected.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// The path resolves to a directory where a file was expected.
    #[error("Is a directory: {0}")]
    IsDirectory(String),

    /// The file handle is unknown or already closed.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Any write-type operation; the filesystem is read-only.
    #[error("Write protected")]
    WriteProtected,

    /// The archive is being unmounted and the request was abandoned.
    #[error("Cancelled")]
    Cancelled,

    /// The engine aborted the pass for a reason without a result code.
    #[error("Engine error: {0}")]
    Engine(String),

    /// An I/O error occurred outside the decoder.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Returns `true` for failures that end a read but leave the mount usable.
    pub fn is_entry_scoped(&self) -> bool {
        matches!(
            self,
            FsError::Extraction(_) | FsError::WrongPassword | FsError::Engine(_)
        )
    }
}

/// Per-entry decode failures, one per native result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("File is corrupted. Crc check has failed.")]
    CrcMismatch,

    #[error("File is corrupted. Data error has occured.")]
    DataError,

    #[error("Unsupported method error has occured.")]
    UnsupportedMethod,

    #[error("File is unavailable.")]
    Unavailable,

    #[error("Unexpected end of file.")]
    UnexpectedEnd,

    #[error("Data after end of archive.")]
    TrailingData,

    #[error("File is not archive.")]
    NotAnArchive,

    #[error("Archive headers error.")]
    HeaderError,
}

/// Failures while loading the decoding engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The engine module is not available.
    #[error("decoder module is missing: {0}")]
    Missing(String),

    /// The engine reports an API version this crate cannot drive.
    #[error("decoder module has version {found}, expected {expected}")]
    IncompatibleVersion {
        /// Version exposed by the module
        found: u32,
        /// Version this crate was built against
        expected: u32,
    },

    /// The engine does not provide a decoder for the requested format.
    #[error("decoder module does not support {0}")]
    MissingEntryPoint(ArchiveFormat),
}

/// Cloneable failure recorded for one index of an extraction session.
///
/// A single session may serve several waiting readers, so its failures must
/// be shareable; they are turned into [`FsError`] at the read boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Extraction(ExtractionError),
    WrongPassword,
    Cancelled,
    Engine(String),
}

impl From<Failure> for FsError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Extraction(kind) => FsError::Extraction(kind),
            Failure::WrongPassword => FsError::WrongPassword,
            Failure::Cancelled => FsError::Cancelled,
            Failure::Engine(message) => FsError::Engine(message),
        }
    }
}

impl From<ExtractionError> for Failure {
    fn from(kind: ExtractionError) -> Self {
        Failure::Extraction(kind)
    }
}
