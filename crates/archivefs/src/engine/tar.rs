//! TAR decoder, plain or wrapped in gzip/bzip2.
//!
//! A compressed tarball is a single stream: every file with data sits in
//! block 0 and reaching an entry means decoding everything in front of it.

use super::{Decoder, EngineError, ExtractCallback, OpenError, OperationResult};
use crate::types::{ArchiveFormat, Entry};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tar::EntryType;

pub(crate) struct TarDecoder {
    path: PathBuf,
    format: ArchiveFormat,
    entries: Vec<Entry>,
}

/// `Some(is_directory)` for the header kinds exposed in the namespace.
///
/// Links and special files are skipped both when listing and when decoding,
/// so entry indexes count the same headers in both walks.
fn exposed(kind: EntryType) -> Option<bool> {
    if kind.is_dir() {
        Some(true)
    } else if kind.is_file() {
        Some(false)
    } else {
        None
    }
}

fn open_stream(path: &Path, format: ArchiveFormat) -> io::Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    Ok(match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(file)),
        _ => Box::new(file),
    })
}

impl TarDecoder {
    pub(crate) fn open(path: &Path, format: ArchiveFormat) -> Result<Self, OpenError> {
        let corrupt = |err: io::Error| OpenError::Corrupt(err.to_string());
        let mut archive = tar::Archive::new(open_stream(path, format)?);
        let mut entries = Vec::new();

        for item in archive.entries().map_err(corrupt)? {
            let entry = item.map_err(corrupt)?;
            let header = entry.header();
            let Some(is_directory) = exposed(header.entry_type()) else {
                continue;
            };
            let index = entries.len() as u32;
            let size = if is_directory { 0 } else { entry.size() };
            let modified = header
                .mtime()
                .ok()
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
            let path = entry.path().map_err(corrupt)?.to_string_lossy().into_owned();

            entries.push(Entry {
                index,
                path,
                is_directory,
                size,
                modified,
                encrypted: false,
                block: (size > 0).then_some(0),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            format,
            entries,
        })
    }
}

impl Decoder for TarDecoder {
    fn format(&self) -> ArchiveFormat {
        self.format
    }

    fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn extract(
        &mut self,
        indexes: &[u32],
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError> {
        let mut pending = indexes.iter().copied().peekable();
        if pending.peek().is_none() {
            return Ok(());
        }

        let mut archive = tar::Archive::new(open_stream(&self.path, self.format)?);
        let walk = archive
            .entries()
            .map_err(|err| EngineError::Result(OperationResult::from_io(&err, false)))?;
        let mut next_index = 0u32;

        for item in walk {
            let mut entry =
                item.map_err(|err| EngineError::Result(OperationResult::from_io(&err, false)))?;
            if exposed(entry.header().entry_type()).is_none() {
                continue;
            }
            let index = next_index;
            next_index += 1;

            while pending.next_if(|&want| want < index).is_some() {}
            match pending.peek() {
                None => break,
                Some(&want) if want != index => continue,
                Some(_) => {
                    pending.next();
                }
            }

            if callback.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            let code = match io::copy(&mut entry, callback.target(index)) {
                Ok(_) => OperationResult::Ok,
                Err(err) => OperationResult::from_io(&err, false),
            };
            callback.set_operation_result(index, code);
            if code != OperationResult::Ok {
                // The stream position is lost; nothing after this can be trusted.
                return Err(EngineError::Result(code));
            }
        }

        Ok(())
    }
}
