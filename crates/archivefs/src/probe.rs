//! Archive probing: format detection and metadata without mounting.

use crate::archive::ArchiveHandle;
use crate::credential::NoPrompt;
use crate::engine::EngineRegistry;
use crate::error::FsError;
use crate::types::{ArchiveEntry, ArchiveFormat, ArchiveInfo};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

const SEVEN_ZIP_MAGIC: &[u8] = &[0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c];
const ZIP_MAGIC: &[&[u8]] = &[b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const TAR_MAGIC_OFFSET: usize = 257;

/// Probe an archive to retrieve metadata without mounting it.
///
/// Only headers are read. Archives whose headers are encrypted need
/// `password`; without it this fails with [`FsError::WrongPassword`].
///
/// # Errors
///
/// Returns an error if:
/// - The archive file doesn't exist
/// - The format is unsupported or corrupted
/// - The archive cannot be read
pub fn probe_archive(
    registry: &Arc<EngineRegistry>,
    path: &Path,
    password: Option<String>,
) -> Result<ArchiveInfo, FsError> {
    if !path.exists() {
        return Err(FsError::ArchiveOpen {
            path: path.to_path_buf(),
            reason: "file does not exist".to_string(),
        });
    }

    let compressed_bytes = std::fs::metadata(path).ok().map(|m| m.len());
    let handle = ArchiveHandle::open(registry, path, None, &[], password, Arc::new(NoPrompt))?;

    let entry_list: Vec<ArchiveEntry> = handle
        .entries()
        .iter()
        .map(|entry| ArchiveEntry {
            path: entry.path.clone(),
            is_directory: entry.is_directory,
            size: entry.size,
            encrypted: entry.encrypted,
            block: entry.block,
        })
        .collect();

    let solid_blocks = entry_list
        .iter()
        .filter_map(|e| e.block)
        .collect::<BTreeSet<_>>()
        .len() as u64;
    let uncompressed_estimate = if entry_list.is_empty() {
        None
    } else {
        Some(entry_list.iter().map(|e| e.size).sum())
    };

    Ok(ArchiveInfo {
        format: handle.format(),
        entries: entry_list.len() as u64,
        compressed_bytes,
        uncompressed_estimate,
        encrypted: entry_list.iter().any(|e| e.encrypted),
        solid_blocks,
        entry_list,
    })
}

/// Detect archive format from magic bytes, then from the file extension.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat, FsError> {
    let mut head = Vec::with_capacity(TAR_MAGIC_OFFSET + 8);
    File::open(path)?
        .take((TAR_MAGIC_OFFSET + 8) as u64)
        .read_to_end(&mut head)?;

    if let Some(format) = detect_magic(&head) {
        return Ok(format);
    }
    detect_extension(path)
}

fn detect_magic(head: &[u8]) -> Option<ArchiveFormat> {
    if head.starts_with(SEVEN_ZIP_MAGIC) {
        return Some(ArchiveFormat::SevenZip);
    }
    if ZIP_MAGIC.iter().any(|magic| head.starts_with(magic)) {
        return Some(ArchiveFormat::Zip);
    }
    if head.starts_with(GZIP_MAGIC) {
        return Some(ArchiveFormat::TarGz);
    }
    if head.starts_with(BZIP2_MAGIC) {
        return Some(ArchiveFormat::TarBz2);
    }
    if head.len() >= TAR_MAGIC_OFFSET + 5 && &head[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar" {
        return Some(ArchiveFormat::Tar);
    }
    None
}

fn detect_extension(path: &Path) -> Result<ArchiveFormat, FsError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let is_tar_stem = path
        .file_stem()
        .is_some_and(|stem| stem.to_string_lossy().to_lowercase().ends_with(".tar"));

    let format = match extension.as_str() {
        "7z" => ArchiveFormat::SevenZip,
        "zip" => ArchiveFormat::Zip,
        "tar" => ArchiveFormat::Tar,
        "tgz" => ArchiveFormat::TarGz,
        "tbz2" | "tbz" => ArchiveFormat::TarBz2,
        "gz" if is_tar_stem => ArchiveFormat::TarGz,
        "bz2" if is_tar_stem => ArchiveFormat::TarBz2,
        _ => {
            return Err(FsError::UnsupportedFormat(format!(
                "Unknown extension: {}",
                extension
            )))
        }
    };

    Ok(format)
}
