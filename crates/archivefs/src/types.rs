//! Type definitions shared across the archive filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Identifier of a solid block: entries sharing it must be decoded together.
pub type BlockId = u32;

/// Archive formats the built-in engine can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    SevenZip,
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveFormat::SevenZip => "7Z",
            ArchiveFormat::Zip => "ZIP",
            ArchiveFormat::Tar => "TAR",
            ArchiveFormat::TarGz => "TAR.GZ",
            ArchiveFormat::TarBz2 => "TAR.BZ2",
        };
        f.write_str(name)
    }
}

/// One archive member, fixed once the archive is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Position in header order, 0-based
    pub index: u32,

    /// Path as stored in the archive
    pub path: String,

    pub is_directory: bool,

    /// Uncompressed size in bytes
    pub size: u64,

    pub modified: Option<SystemTime>,

    pub encrypted: bool,

    /// Solid block holding the entry's data; `None` when there is no data
    pub block: Option<BlockId>,
}

impl Entry {
    /// Whether reading this entry requires a decode pass at all.
    pub fn has_data(&self) -> bool {
        !self.is_directory && self.size > 0 && self.block.is_some()
    }
}

/// Individual entry within an archive, as reported by [`crate::probe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Path of the entry within the archive
    pub path: String,

    /// Whether this entry is a directory
    pub is_directory: bool,

    /// Uncompressed size in bytes
    pub size: u64,

    /// Whether the entry's data is encrypted
    pub encrypted: bool,

    /// Solid block holding the entry (if any)
    pub block: Option<BlockId>,
}

/// Metadata information about an archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Archive format
    pub format: ArchiveFormat,

    /// Number of entries in the archive
    pub entries: u64,

    /// Compressed size in bytes (if available)
    pub compressed_bytes: Option<u64>,

    /// Estimated uncompressed size in bytes (if available)
    pub uncompressed_estimate: Option<u64>,

    /// Whether any entry is password-protected
    pub encrypted: bool,

    /// Number of distinct solid blocks holding data
    pub solid_blocks: u64,

    /// List of all entries in the archive
    pub entry_list: Vec<ArchiveEntry>,
}

/// Which directory of the archive is presented as the filesystem root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSelection {
    /// Re-root at an existing directory path
    Path(String),

    /// Descend through directories that are the only child of their parent
    Auto,
}

/// Upper bound on worker threads serving reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    /// min(4, processor count)
    #[default]
    Default,

    /// Processor count
    All,

    /// Explicit value, capped at the processor count
    Limit(usize),
}

impl Parallelism {
    /// Resolves the worker count for a machine with `cpus` processors.
    pub fn resolve(self, cpus: usize) -> usize {
        let cpus = cpus.max(1);
        match self {
            Parallelism::Default => cpus.min(4),
            Parallelism::All => cpus,
            Parallelism::Limit(n) if n > 0 && n < cpus => n,
            Parallelism::Limit(_) => cpus,
        }
    }

    /// Resolves against the processors of the current machine.
    pub fn workers(self) -> usize {
        self.resolve(num_cpus::get())
    }
}

/// Options for mounting an archive.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Archive file to expose
    pub archive_path: PathBuf,

    /// Optional sub-root to present instead of the archive root
    pub root: Option<RootSelection>,

    /// Password for encrypted archives
    pub password: Option<String>,

    /// Extractor switches handed to the engine, as given on the command line
    pub extractor_switches: Vec<String>,

    /// Worker thread limit for the read dispatcher
    pub parallelism: Parallelism,

    /// Volume label override
    pub volume_label: Option<String>,

    /// Skip format detection and use this decoder
    pub format: Option<ArchiveFormat>,

    /// Bytes of decoded entries kept in memory (default: 256 MB)
    pub cache_budget_bytes: u64,

    /// Memory declared for each running extraction session (default: 64 MB)
    pub session_reservation_bytes: u64,

    /// How long a new session waits for sibling requests to join
    pub coalesce_window: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            archive_path: PathBuf::new(),
            root: None,
            password: None,
            extractor_switches: Vec::new(),
            parallelism: Parallelism::Default,
            volume_label: None,
            format: None,
            cache_budget_bytes: 256 * 1024 * 1024, // 256 MB
            session_reservation_bytes: 64 * 1024 * 1024, // 64 MB
            coalesce_window: Duration::from_millis(2),
        }
    }
}

impl MountOptions {
    /// Options for `archive_path` with every other field defaulted.
    pub fn new(archive_path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            ..Self::default()
        }
    }

    /// Appends switches given as `a,b;c` lists.
    pub fn add_switches(&mut self, raw: &str) {
        self.extractor_switches.extend(
            raw.split([',', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }
}

/// Kind of a namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// Attributes reported by `getAttributes` and directory listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub kind: NodeKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl Attributes {
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// One child in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attributes: Attributes,
}

/// Opaque handle to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(pub(crate) u64);

impl FileHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}
