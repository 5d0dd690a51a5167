//! 7-Zip decoder backed by `sevenz-rust2`.
//!
//! Solid blocks are 7z folders. The header table is read once at open; a
//! pass then decodes only the folders that hold requested indexes, each from
//! its own start, and stops inside a folder after its last requested index.

use super::{Decoder, EngineError, ExtractCallback, OpenError, OperationResult};
use crate::types::{ArchiveFormat, BlockId, Entry};
use sevenz_rust2::{Archive, BlockDecoder, Password, SevenZArchiveEntry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Method id of the 7zAES coder.
const AES_METHOD_ID: &[u8] = &[0x06, 0xf1, 0x07, 0x01];

pub(crate) struct SevenZipDecoder {
    path: PathBuf,
    archive: Archive,
    entries: Vec<Entry>,
    /// Password that unlocked encrypted headers, if any
    header_password: Option<String>,
}

impl SevenZipDecoder {
    pub(crate) fn open(
        path: &Path,
        password: &mut dyn FnMut() -> Option<String>,
    ) -> Result<Self, OpenError> {
        let (archive, header_password) = match Archive::open(path) {
            Ok(archive) => (archive, None),
            Err(err)
                if OperationResult::classify(&err.to_string(), false)
                    == OperationResult::WrongPassword =>
            {
                tracing::debug!(path = %path.display(), "7z headers are encrypted");
                let secret = password().ok_or(OpenError::WrongPassword)?;
                let archive =
                    Archive::open_with_password(path, &Password::from(secret.as_str()))
                        .map_err(|err| map_open_error(err, true))?;
                (archive, Some(secret))
            }
            Err(err) => return Err(map_open_error(err, false)),
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: read_entries(&archive),
            archive,
            header_password,
        })
    }
}

fn map_open_error(err: sevenz_rust2::Error, encrypted: bool) -> OpenError {
    match OperationResult::classify(&err.to_string(), encrypted) {
        OperationResult::WrongPassword => OpenError::WrongPassword,
        _ => OpenError::Corrupt(err.to_string()),
    }
}

fn folder_encrypted(archive: &Archive, folder: usize) -> bool {
    archive.folders.get(folder).is_some_and(|folder| {
        folder
            .coders
            .iter()
            .any(|coder| coder.decompression_method_id() == AES_METHOD_ID)
    })
}

fn read_entries(archive: &Archive) -> Vec<Entry> {
    archive
        .files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            let folder = archive
                .stream_map
                .file_folder_index
                .get(index)
                .copied()
                .flatten();
            let modified = file
                .has_last_modified_date
                .then(|| SystemTime::from(file.last_modified_date()));
            Entry {
                index: index as u32,
                path: file.name().to_string(),
                is_directory: file.is_directory(),
                size: file.size(),
                modified,
                encrypted: folder.is_some_and(|f| folder_encrypted(archive, f)),
                block: if file.has_stream {
                    folder.map(|f| f as BlockId)
                } else {
                    None
                },
            }
        })
        .collect()
}

/// Maps the address of each file record to its index.
///
/// The block decoder passes `&SevenZArchiveEntry` references into the
/// archive's file table, so the address identifies the index without
/// comparing names, which need not be unique.
fn entry_slots(archive: &Archive) -> HashMap<usize, u32> {
    archive
        .files
        .iter()
        .enumerate()
        .map(|(index, file)| (file as *const SevenZArchiveEntry as usize, index as u32))
        .collect()
}

impl Decoder for SevenZipDecoder {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::SevenZip
    }

    fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn extract(
        &mut self,
        indexes: &[u32],
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError> {
        let mut blocks: BTreeMap<BlockId, BTreeSet<u32>> = BTreeMap::new();
        for &index in indexes {
            if let Some(block) = self.entries.get(index as usize).and_then(|e| e.block) {
                blocks.entry(block).or_default().insert(index);
            }
        }
        if blocks.is_empty() {
            return Ok(());
        }

        let encrypted = indexes
            .iter()
            .any(|&i| self.entries.get(i as usize).is_some_and(|e| e.encrypted));
        let password = if encrypted {
            let secret = callback.password().ok_or(EngineError::PasswordRequired)?;
            Password::from(secret.as_str())
        } else if let Some(secret) = &self.header_password {
            Password::from(secret.as_str())
        } else {
            Password::empty()
        };

        let mut source = File::open(&self.path)?;
        let slots = entry_slots(&self.archive);

        for (&block, members) in &blocks {
            if callback.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            let Some(&last) = members.last() else {
                continue;
            };
            let block_encrypted = folder_encrypted(&self.archive, block as usize);
            let mut settled = BTreeSet::new();
            let mut aborted = false;
            let mut fatal = None;

            let walk = BlockDecoder::new(
                block as usize,
                &self.archive,
                password.as_slice(),
                &mut source,
            )
            .for_each_entries(&mut |file, data| {
                let Some(&index) = slots.get(&(file as *const SevenZArchiveEntry as usize)) else {
                    return Ok(true);
                };
                if index > last {
                    return Ok(false);
                }
                if callback.is_cancelled() {
                    aborted = true;
                    return Ok(false);
                }
                if !members.contains(&index) {
                    io::copy(data, &mut io::sink())?;
                    return Ok(true);
                }

                let code = match io::copy(data, callback.target(index)) {
                    Ok(_) => OperationResult::Ok,
                    Err(err) => OperationResult::from_io(&err, block_encrypted),
                };
                callback.set_operation_result(index, code);
                settled.insert(index);
                if code.is_pass_fatal() {
                    fatal = Some(code);
                    return Ok(false);
                }
                Ok(index < last)
            });

            if aborted {
                return Err(EngineError::Aborted);
            }
            if let Some(code) = fatal {
                return Err(EngineError::Result(code));
            }
            if let Err(err) = walk {
                // The block is lost; the other blocks of the pass still decode.
                let code = OperationResult::classify(&err.to_string(), block_encrypted);
                tracing::debug!(block, error = %err, "7z block failed to decode");
                for &index in members.difference(&settled) {
                    callback.set_operation_result(index, code);
                }
                if code.is_pass_fatal() {
                    return Err(EngineError::Result(code));
                }
            }
        }

        Ok(())
    }
}
