//! Filesystem operation adapter.
//!
//! [`ArchiveFs`] is what a virtual-filesystem driver talks to: paths are
//! resolved in the [`Namespace`], reads go through the [`ExtractionCache`].
//! Every write-type operation is refused.

use crate::archive::ArchiveHandle;
use crate::budget::ResourceManager;
use crate::cache::{CacheConfig, CacheStats, ExtractionCache};
use crate::credential::CredentialProvider;
use crate::engine::EngineRegistry;
use crate::error::FsError;
use crate::namespace::Namespace;
use crate::types::{
    Attributes, DirEntry, Entry, FileHandle, MountOptions, Parallelism, RootSelection,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Callback run once the filesystem is available, or with `None` if mounting
/// it failed.
pub type MountHook = Box<dyn FnOnce(Option<&Path>) + Send>;

#[derive(Debug, Clone)]
struct OpenFile {
    entry: u32,
    path: String,
}

/// A mounted archive.
pub struct ArchiveFs {
    namespace: Namespace,
    cache: ExtractionCache,
    resources: Arc<ResourceManager>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_handle: AtomicU64,
    volume_label: String,
    parallelism: Parallelism,
    mount_hook: Mutex<Option<MountHook>>,
    unmounted: AtomicBool,
}

impl std::fmt::Debug for ArchiveFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFs")
            .field("archive", self.cache.handle())
            .field("root", &self.namespace.root_path())
            .field("volume_label", &self.volume_label)
            .finish()
    }
}

impl ArchiveFs {
    /// Opens the archive, builds the namespace and checks the password.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The archive cannot be opened or its engine cannot be loaded
    /// - The requested sub-root is not a directory of the archive
    /// - The archive has encrypted entries and no working password was given
    pub fn mount(
        options: MountOptions,
        registry: &Arc<EngineRegistry>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Result<Self, FsError> {
        let handle = Arc::new(ArchiveHandle::open(
            registry,
            &options.archive_path,
            options.format,
            &options.extractor_switches,
            options.password.clone(),
            provider,
        )?);

        let mut namespace = Namespace::build(handle.entries(), handle.modified());
        match &options.root {
            Some(RootSelection::Path(root)) => {
                if !namespace.set_root(root) {
                    return Err(FsError::PathNotFound(root.clone()));
                }
            }
            Some(RootSelection::Auto) => {
                namespace.set_root_auto();
            }
            None => {}
        }

        let volume_label = match options.volume_label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => default_label(&options.archive_path, &namespace),
        };

        let resources = ResourceManager::new();
        let cache = ExtractionCache::new(
            Arc::clone(&handle),
            Arc::clone(&resources),
            CacheConfig {
                budget_bytes: options.cache_budget_bytes,
                session_reservation_bytes: options.session_reservation_bytes,
                coalesce_window: options.coalesce_window,
            },
        );

        let fs = Self {
            namespace,
            cache,
            resources,
            open_files: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            volume_label,
            parallelism: options.parallelism,
            mount_hook: Mutex::new(None),
            unmounted: AtomicBool::new(false),
        };
        fs.verify_password(options.password.is_some())?;

        tracing::info!(
            archive = %options.archive_path.display(),
            root = %fs.namespace.root_path(),
            label = %fs.volume_label,
            "archive mounted"
        );
        Ok(fs)
    }

    /// Decodes the first encrypted file once so a wrong password fails the
    /// mount instead of every later read.
    fn verify_password(&self, password_given: bool) -> Result<(), FsError> {
        let handle = self.cache.handle();
        let credentials = handle.credentials();
        if credentials.is_confirmed() {
            return Ok(());
        }

        let Some(entry) = self
            .namespace
            .find_first_encrypted()
            .and_then(|index| handle.entry(index))
        else {
            if password_given && !handle.entries().iter().any(|e| e.encrypted) {
                tracing::warn!("a password was supplied but the archive is not encrypted");
            }
            return Ok(());
        };

        loop {
            match self.cache.materialize(entry) {
                Ok(_) => return Ok(()),
                // A rejected password given up front earns one prompt.
                Err(FsError::WrongPassword) if credentials.can_prompt() => {
                    tracing::warn!("archive password rejected, asking again");
                }
                Err(FsError::WrongPassword) => return Err(FsError::WrongPassword),
                Err(err) => {
                    tracing::warn!(
                        path = %entry.path,
                        error = %err,
                        "could not verify password, continuing"
                    );
                    return Ok(());
                }
            }
        }
    }

    fn ensure_mounted(&self) -> Result<(), FsError> {
        if self.unmounted.load(Ordering::SeqCst) {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn entry(&self, index: u32) -> Result<&Entry, FsError> {
        self.cache
            .handle()
            .entry(index)
            .ok_or(FsError::Extraction(crate::error::ExtractionError::Unavailable))
    }

    /// Opens the file at `path` for reading.
    pub fn open(&self, path: &str) -> Result<FileHandle, FsError> {
        self.ensure_mounted()?;
        let node = self.namespace.lookup(path)?;
        let Some(entry) = node.entry() else {
            return Err(FsError::IsDirectory(path.to_string()));
        };

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.cache.pin(entry);
        self.open_files.lock().insert(
            id,
            OpenFile {
                entry,
                path: path.to_string(),
            },
        );
        tracing::trace!(handle = id, path, "file opened");
        Ok(FileHandle(id))
    }

    /// Reads up to `length` bytes at `offset`. Never reads past the file's
    /// size; an offset at or beyond the end returns no bytes.
    pub fn read(&self, handle: FileHandle, offset: u64, length: usize) -> Result<Vec<u8>, FsError> {
        self.ensure_mounted()?;
        let file = self
            .open_files
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or(FsError::InvalidHandle(handle.0))?;

        let entry = self.entry(file.entry)?;
        self.cache.read(entry, offset, length).inspect_err(|err| {
            if !matches!(err, FsError::Cancelled) {
                tracing::warn!(path = %file.path, error = %err, "read failed");
            }
        })
    }

    /// Releases a handle returned by [`open`](Self::open).
    pub fn close(&self, handle: FileHandle) -> Result<(), FsError> {
        let file = self
            .open_files
            .lock()
            .remove(&handle.0)
            .ok_or(FsError::InvalidHandle(handle.0))?;
        self.cache.unpin(file.entry);
        Ok(())
    }

    pub fn get_attributes(&self, path: &str) -> Result<Attributes, FsError> {
        self.ensure_mounted()?;
        Ok(self.namespace.lookup(path)?.attributes())
    }

    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.ensure_mounted()?;
        self.namespace.list(path)
    }

    /// Whole contents of the file at `path`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let handle = self.open(path)?;
        let size = self.get_attributes(path)?.size;
        let result = usize::try_from(size)
            .map_err(|_| FsError::Engine(format!("{} does not fit in memory", path)))
            .and_then(|length| self.read(handle, 0, length));
        self.close(handle)?;
        result
    }

    pub fn write(&self, _handle: FileHandle, _offset: u64, _data: &[u8]) -> Result<usize, FsError> {
        Err(FsError::WriteProtected)
    }

    pub fn create(&self, _path: &str, _directory: bool) -> Result<FileHandle, FsError> {
        Err(FsError::WriteProtected)
    }

    pub fn delete(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::WriteProtected)
    }

    pub fn rename(&self, _from: &str, _to: &str) -> Result<(), FsError> {
        Err(FsError::WriteProtected)
    }

    pub fn set_attributes(&self, _path: &str, _attributes: Attributes) -> Result<(), FsError> {
        Err(FsError::WriteProtected)
    }

    /// Registers the callback run by [`on_mount`](Self::on_mount).
    pub fn set_mount_hook(&self, hook: impl FnOnce(Option<&Path>) + Send + 'static) {
        *self.mount_hook.lock() = Some(Box::new(hook));
    }

    /// Called by the driver once the filesystem is reachable at
    /// `mount_point`, or with `None` when mounting failed. The hook runs at
    /// most once.
    pub fn on_mount(&self, mount_point: Option<&Path>) {
        match mount_point {
            Some(point) => tracing::info!(mount_point = %point.display(), "filesystem available"),
            None => tracing::error!("filesystem could not be mounted"),
        }
        let hook = self.mount_hook.lock().take();
        if let Some(hook) = hook {
            hook(mount_point);
        }
    }

    /// Abandons in-flight sessions and refuses further reads.
    pub fn unmount(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.cancel();
        let open = self.open_files.lock().len();
        tracing::info!(open_files = open, "archive unmounted");
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::SeqCst)
    }

    pub fn volume_label(&self) -> &str {
        &self.volume_label
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn archive(&self) -> &Arc<ArchiveHandle> {
        self.cache.handle()
    }

    pub fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.namespace
            .lookup(path)
            .ok()
            .and_then(|node| node.entry())
            .is_some_and(|index| self.cache.is_resident(index))
    }
}

impl Drop for ArchiveFs {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Archive file stem, annotated with the active sub-root.
fn default_label(archive: &Path, namespace: &Namespace) -> String {
    let label = archive
        .file_stem()
        .map(|stem| stem.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    if !namespace.is_rerooted() {
        return label;
    }

    let mut root = namespace.root_path();
    if !label.is_empty() {
        let rest = root
            .strip_prefix(&format!("/{}", label))
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .map(str::to_string);
        if let Some(rest) = rest {
            root = format!("/.{}", rest);
        }
    }

    if label.is_empty() {
        root
    } else {
        format!("{} ({})", label, root)
    }
}
