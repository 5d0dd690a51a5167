//! # archivefs
//!
//! A read-only filesystem view over compressed archives.
//!
//! Mounting an archive builds a directory tree from its headers; file
//! contents are decoded on demand. Solid archives pack many files into one
//! compressed block, so a read of one file may decode its predecessors in
//! the block too. The extraction cache makes sure each block is decoded by
//! at most one pass at a time and that concurrent readers share that pass.
//!
//! ## Supported Formats
//!
//! - 7-Zip (solid blocks, AES-encrypted entries and headers)
//! - ZIP (including AES and ZipCrypto encryption)
//! - TAR (plain, gzip, bzip2)
//!
//! ## Example
//!
//! ```rust,no_run
//! use archivefs::{mount, probe, MountOptions};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let info = probe(Path::new("archive.7z"))?;
//! println!("Format: {}, Entries: {}", info.format, info.entries);
//!
//! let fs = mount(MountOptions::new("archive.7z"))?;
//! for child in fs.list_directory("/")? {
//!     println!("{} ({} bytes)", child.name, child.attributes.size);
//! }
//!
//! let handle = fs.open("/docs/readme.txt")?;
//! let bytes = fs.read(handle, 0, 4096)?;
//! fs.close(handle)?;
//! println!("{}", String::from_utf8_lossy(&bytes));
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod budget;
pub mod cache;
pub mod credential;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fs;
pub mod namespace;
pub mod probe;
pub mod safety;
pub mod session;
pub mod types;

// Re-export main types
pub use cache::{CacheConfig, CacheStats};
pub use credential::{CredentialProvider, NoPrompt};
pub use dispatch::{ReadPool, ReadRequest, ReadResult};
pub use engine::EngineRegistry;
pub use error::{ExtractionError, FsError, LoadError};
pub use fs::ArchiveFs;
pub use types::{
    ArchiveEntry, ArchiveFormat, ArchiveInfo, Attributes, DirEntry, Entry, FileHandle,
    MountOptions, NodeKind, Parallelism, RootSelection,
};

use std::path::Path;
use std::sync::Arc;

/// Probe an archive to retrieve metadata without mounting it.
///
/// # Errors
///
/// Returns an error if:
/// - The archive file doesn't exist
/// - The format is unsupported or corrupted
/// - The headers are encrypted
pub fn probe(path: &Path) -> Result<ArchiveInfo, FsError> {
    probe::probe_archive(&EngineRegistry::builtin(), path, None)
}

/// Mount an archive with the built-in engine and no password prompt.
///
/// Use [`ArchiveFs::mount`] to share an engine registry between mounts or
/// to supply a [`CredentialProvider`].
pub fn mount(options: MountOptions) -> Result<ArchiveFs, FsError> {
    ArchiveFs::mount(options, &EngineRegistry::builtin(), Arc::new(NoPrompt))
}
