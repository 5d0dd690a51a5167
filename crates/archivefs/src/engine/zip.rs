//! ZIP decoder backed by the `zip` crate. Every stored file is its own block.

use super::{Decoder, EngineError, ExtractCallback, OpenError, OperationResult};
use crate::types::{ArchiveFormat, Entry};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::OffsetDateTime;
use zip::result::ZipError;
use zip::ZipArchive;

pub(crate) struct ZipDecoder {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl ZipDecoder {
    pub(crate) fn open(path: &Path) -> Result<Self, OpenError> {
        let mut archive = open_archive(path).map_err(|err| match err {
            ZipError::Io(err) => OpenError::Io(err),
            other => OpenError::Corrupt(other.to_string()),
        })?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            // Raw access reads the local header without touching encrypted data.
            let file = archive
                .by_index_raw(i)
                .map_err(|err| OpenError::Corrupt(err.to_string()))?;
            let is_directory = file.is_dir();
            let size = file.size();
            // DOS timestamps carry no zone; they are read as UTC.
            let modified = file
                .last_modified()
                .and_then(|stamp| OffsetDateTime::try_from(stamp).ok())
                .map(SystemTime::from);
            entries.push(Entry {
                index: i as u32,
                path: file.name().to_string(),
                is_directory,
                size,
                modified,
                encrypted: file.encrypted(),
                block: (!is_directory && size > 0).then_some(i as u32),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, ZipError> {
    let file = File::open(path)?;
    ZipArchive::new(BufReader::new(file))
}

fn classify_zip_error(err: &ZipError, encrypted: bool) -> OperationResult {
    match err {
        ZipError::InvalidPassword => OperationResult::WrongPassword,
        ZipError::UnsupportedArchive(message) => {
            if message.to_lowercase().contains("password") {
                OperationResult::WrongPassword
            } else {
                OperationResult::UnsupportedMethod
            }
        }
        ZipError::FileNotFound => OperationResult::Unavailable,
        ZipError::Io(err) => OperationResult::from_io(err, encrypted),
        other => OperationResult::classify(&other.to_string(), encrypted),
    }
}

impl Decoder for ZipDecoder {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn extract(
        &mut self,
        indexes: &[u32],
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError> {
        if indexes.is_empty() {
            return Ok(());
        }
        let mut archive = open_archive(&self.path).map_err(|err| match err {
            ZipError::Io(err) => EngineError::Io(err),
            other => EngineError::Result(OperationResult::classify(&other.to_string(), false)),
        })?;

        for &index in indexes {
            if callback.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            let encrypted = self
                .entries
                .get(index as usize)
                .is_some_and(|entry| entry.encrypted);

            let secret = if encrypted {
                Some(callback.password().ok_or(EngineError::PasswordRequired)?)
            } else {
                None
            };
            let opened = match &secret {
                Some(secret) => archive.by_index_decrypt(index as usize, secret.as_bytes()),
                None => archive.by_index(index as usize),
            };

            let code = match opened {
                Ok(mut file) => match io::copy(&mut file, callback.target(index)) {
                    Ok(_) => OperationResult::Ok,
                    Err(err) => OperationResult::from_io(&err, encrypted),
                },
                Err(err) => classify_zip_error(&err, encrypted),
            };
            callback.set_operation_result(index, code);
            if code.is_pass_fatal() {
                break;
            }
        }

        Ok(())
    }
}
