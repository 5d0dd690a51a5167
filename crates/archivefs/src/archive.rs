//! Ownership of one opened archive.

use crate::credential::{CredentialProvider, CredentialStore};
use crate::engine::{Decoder, DecoderHandle, EngineRegistry, OpenError};
use crate::error::FsError;
use crate::probe::detect_format;
use crate::types::{ArchiveFormat, BlockId, Entry};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// An opened archive: entry table, decoder and credential.
///
/// The decoder sits behind its own mutex, which is the per-handle
/// serialization point: at most one pass drives it at any instant, whatever
/// block it is decoding. The engine reference is released when the handle is
/// dropped.
pub struct ArchiveHandle {
    path: PathBuf,
    format: ArchiveFormat,
    entries: Arc<[Entry]>,
    blocks: BTreeMap<BlockId, Vec<u32>>,
    modified: SystemTime,
    decoder: Mutex<Box<dyn Decoder>>,
    credentials: CredentialStore,
    cancelled: Arc<AtomicBool>,
    _lease: DecoderHandle,
}

impl std::fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("entries", &self.entries.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl ArchiveHandle {
    /// Opens `path` through the registry.
    ///
    /// When the headers are encrypted the credential is asked for here. A
    /// rejected password is dropped and, if the user has not been prompted
    /// yet, the open is retried once with whatever the prompt returns.
    pub fn open(
        registry: &Arc<EngineRegistry>,
        path: &Path,
        format: Option<ArchiveFormat>,
        switches: &[String],
        password: Option<String>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Result<Self, FsError> {
        let metadata = std::fs::metadata(path).map_err(|err| FsError::ArchiveOpen {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let format = match format {
            Some(format) => format,
            None => detect_format(path)?,
        };

        let lease = registry.acquire(registry.new_consumer(), format)?;
        let credentials = CredentialStore::new(password, provider);

        let decoder = loop {
            let attempt = lease
                .engine()
                .open(format, path, switches, &mut || credentials.obtain());
            match attempt {
                Ok(decoder) => break decoder,
                Err(OpenError::WrongPassword) => {
                    let retry = credentials.has_password() && credentials.can_prompt();
                    credentials.reject();
                    if !retry {
                        return Err(FsError::WrongPassword);
                    }
                }
                Err(OpenError::Corrupt(reason)) => {
                    return Err(FsError::ArchiveOpen {
                        path: path.to_path_buf(),
                        reason,
                    })
                }
                Err(OpenError::Io(err)) => {
                    return Err(FsError::ArchiveOpen {
                        path: path.to_path_buf(),
                        reason: err.to_string(),
                    })
                }
            }
        };

        let entries: Arc<[Entry]> = decoder.entries().to_vec().into();
        let mut blocks: BTreeMap<BlockId, Vec<u32>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.has_data()) {
            if let Some(block) = entry.block {
                blocks.entry(block).or_default().push(entry.index);
            }
        }
        for members in blocks.values_mut() {
            members.sort_unstable();
        }

        tracing::info!(
            path = %path.display(),
            %format,
            entries = entries.len(),
            blocks = blocks.len(),
            "archive opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            entries,
            blocks,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            decoder: Mutex::new(decoder),
            credentials,
            cancelled: Arc::new(AtomicBool::new(false)),
            _lease: lease,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn entries(&self) -> &Arc<[Entry]> {
        &self.entries
    }

    pub fn entry(&self, index: u32) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Data-carrying members of `block`, ascending.
    pub fn block_members(&self, block: BlockId) -> &[u32] {
        self.blocks.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Modification time of the archive file itself.
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Waits for exclusive use of the decoder.
    pub(crate) fn lock_decoder(&self) -> MutexGuard<'_, Box<dyn Decoder>> {
        self.decoder.lock()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!(path = %self.path.display(), "archive handle cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}
