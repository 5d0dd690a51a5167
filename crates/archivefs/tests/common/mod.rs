//! Shared helpers: archive fixtures and a scripted engine.
#![allow(dead_code)]

use archivefs::engine::{
    Decoder, Engine, EngineError, EngineLoader, ExtractCallback, OpenError, OperationResult,
    ENGINE_API_VERSION,
};
use archivefs::{ArchiveFormat, Entry, EngineRegistry, LoadError, MountOptions};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Helper function to create a test archive directory
pub fn setup_test_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Helper function to create a ZIP archive
pub fn create_zip_archive(archive_path: &Path, files: &[(&str, &[u8])]) -> std::io::Result<()> {
    let file = File::create(archive_path)?;
    let mut zip = zip::ZipWriter::new(file);

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in files {
        if name.ends_with('/') {
            zip.add_directory(name.trim_end_matches('/'), options)?;
        } else {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
    }

    zip.finish()?;
    Ok(())
}

/// Helper function to create a ZIP archive whose files are AES encrypted
pub fn create_encrypted_zip(
    archive_path: &Path,
    password: &str,
    files: &[(&str, &[u8])],
) -> std::io::Result<()> {
    let file = File::create(archive_path)?;
    let mut zip = zip::ZipWriter::new(file);

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .with_aes_encryption(zip::AesMode::Aes256, password);

    for (name, content) in files {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }

    zip.finish()?;
    Ok(())
}

/// Helper function to create a TAR.GZ archive
pub fn create_tar_gz_archive(archive_path: &Path, files: &[(&str, &[u8])]) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000);
        header.set_cksum();
        tar.append_data(&mut header, name, &content[..])?;
    }

    tar.into_inner()?.finish()?;
    Ok(())
}

/// Helper function to create a 7z archive, one folder per file
pub fn create_7z_archive(archive_path: &Path, files: &[(&str, &[u8])]) -> std::io::Result<()> {
    use sevenz_rust2::{SevenZArchiveEntry, SevenZWriter};

    let file = File::create(archive_path)?;
    let mut sz = SevenZWriter::new(file).map_err(std::io::Error::other)?;

    for (name, content) in files {
        let mut entry = SevenZArchiveEntry::new();
        entry.name = name.to_string();
        entry.has_stream = !content.is_empty();
        entry.is_directory = false;
        let reader = (!content.is_empty()).then(|| std::io::Cursor::new(content.to_vec()));
        sz.push_archive_entry(entry, reader)
            .map_err(std::io::Error::other)?;
    }

    sz.finish().map_err(std::io::Error::other)?;
    Ok(())
}

/// Helper function to create a 7z archive with one solid folder per group
pub fn create_solid_7z_archive(
    archive_path: &Path,
    blocks: &[&[(&str, &[u8])]],
) -> std::io::Result<()> {
    use sevenz_rust2::{SeqReader, SevenZArchiveEntry, SevenZWriter, SourceReader};

    let file = File::create(archive_path)?;
    let mut sz = SevenZWriter::new(file).map_err(std::io::Error::other)?;

    for files in blocks {
        let entries = files
            .iter()
            .map(|(name, _)| SevenZArchiveEntry::new_file(name))
            .collect();
        let readers = files
            .iter()
            .map(|(_, content)| SourceReader::new(std::io::Cursor::new(content.to_vec())))
            .collect();
        sz.push_archive_entries(entries, SeqReader::new(readers))
            .map_err(std::io::Error::other)?;
    }

    sz.finish()?;
    Ok(())
}

/// Offset and length of a 7z folder's packed data within the file.
pub fn packed_7z_folder(archive_path: &Path, folder: usize) -> (u64, u64) {
    const SIGNATURE_HEADER_SIZE: u64 = 32;

    let archive = sevenz_rust2::Archive::open(archive_path).expect("Failed to read 7z headers");
    let stream = archive.stream_map.folder_first_pack_stream_index[folder];
    let offset =
        SIGNATURE_HEADER_SIZE + archive.pack_pos + archive.stream_map.pack_stream_offsets[stream];
    (offset, archive.pack_sizes[stream])
}

/// Bytes that do not compress, from a small xorshift generator.
pub fn noise(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Deterministic file contents of a given length.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

/// One member of a scripted archive.
#[derive(Debug, Clone)]
pub struct MockFile {
    pub path: String,
    pub data: Vec<u8>,
    pub block: Option<u32>,
    pub encrypted: bool,
    pub is_directory: bool,
}

impl MockFile {
    pub fn file(path: &str, data: &[u8], block: u32) -> Self {
        Self {
            path: path.to_string(),
            data: data.to_vec(),
            block: (!data.is_empty()).then_some(block),
            encrypted: false,
            is_directory: false,
        }
    }

    pub fn dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            data: Vec::new(),
            block: None,
            encrypted: false,
            is_directory: true,
        }
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }
}

/// Script for the mock engine plus everything it observed.
#[derive(Default)]
pub struct Scenario {
    pub files: Vec<MockFile>,
    pub password: Option<String>,
    pub header_encrypted: bool,
    pub pass_delay: Duration,

    /// Result codes reported for an index on every pass
    pub failures: Mutex<HashMap<u32, OperationResult>>,
    /// Result codes reported for an index on the next pass only
    pub fail_once: Mutex<HashMap<u32, OperationResult>>,
    /// Indexes whose output is cut in half
    pub truncated: Mutex<HashSet<u32>>,

    pub passes: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub opens: AtomicUsize,
    pub loads: AtomicUsize,
    pub log: Mutex<Vec<Vec<u32>>>,
}

impl Scenario {
    pub fn new(files: Vec<MockFile>) -> Self {
        Self {
            files,
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.pass_delay = delay;
        self
    }

    pub fn with_header_encryption(mut self) -> Self {
        self.header_encrypted = true;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn passes_log(&self) -> Vec<Vec<u32>> {
        self.log.lock().clone()
    }

    pub fn data(&self, index: u32) -> &[u8] {
        &self.files[index as usize].data
    }

    fn entries(&self) -> Vec<Entry> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, file)| Entry {
                index: i as u32,
                path: file.path.clone(),
                is_directory: file.is_directory,
                size: file.data.len() as u64,
                modified: None,
                encrypted: file.encrypted,
                block: file.block,
            })
            .collect()
    }
}

/// Loader handing out a [`MockEngine`], or a scripted load failure.
pub struct MockLoader {
    scenario: Arc<Scenario>,
    version: u32,
    failure: Option<LoadError>,
}

impl MockLoader {
    pub fn new(scenario: Arc<Scenario>) -> Self {
        Self {
            scenario,
            version: ENGINE_API_VERSION,
            failure: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn failing(mut self, failure: LoadError) -> Self {
        self.failure = Some(failure);
        self
    }
}

impl EngineLoader for MockLoader {
    fn load(&self) -> Result<Arc<dyn Engine>, LoadError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        self.scenario.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockEngine {
            scenario: Arc::clone(&self.scenario),
            version: self.version,
        }))
    }
}

pub struct MockEngine {
    scenario: Arc<Scenario>,
    version: u32,
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn api_version(&self) -> u32 {
        self.version
    }

    fn formats(&self) -> &[ArchiveFormat] {
        &[ArchiveFormat::Zip]
    }

    fn open(
        &self,
        _format: ArchiveFormat,
        _path: &Path,
        _switches: &[String],
        password: &mut dyn FnMut() -> Option<String>,
    ) -> Result<Box<dyn Decoder>, OpenError> {
        self.scenario.opens.fetch_add(1, Ordering::SeqCst);
        if self.scenario.header_encrypted && password() != self.scenario.password {
            return Err(OpenError::WrongPassword);
        }
        Ok(Box::new(MockDecoder {
            scenario: Arc::clone(&self.scenario),
            entries: self.scenario.entries(),
        }))
    }
}

pub struct MockDecoder {
    scenario: Arc<Scenario>,
    entries: Vec<Entry>,
}

impl MockDecoder {
    fn run(&self, indexes: &[u32], callback: &mut dyn ExtractCallback) -> Result<(), EngineError> {
        std::thread::sleep(self.scenario.pass_delay);
        let mut unlocked: Option<bool> = None;

        for &index in indexes {
            if callback.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            let file = &self.scenario.files[index as usize];

            if file.encrypted {
                let ok = match unlocked {
                    Some(ok) => ok,
                    None => {
                        let given = callback.password().ok_or(EngineError::PasswordRequired)?;
                        let ok = Some(given) == self.scenario.password;
                        unlocked = Some(ok);
                        ok
                    }
                };
                if !ok {
                    callback.set_operation_result(index, OperationResult::WrongPassword);
                    continue;
                }
            }

            let injected = self
                .scenario
                .fail_once
                .lock()
                .remove(&index)
                .or_else(|| self.scenario.failures.lock().get(&index).copied());
            if let Some(code) = injected {
                callback.set_operation_result(index, code);
                if code.is_pass_fatal() {
                    return Ok(());
                }
                continue;
            }

            let data = if self.scenario.truncated.lock().contains(&index) {
                &file.data[..file.data.len() / 2]
            } else {
                &file.data[..]
            };
            callback.target(index).write_all(data)?;
            callback.set_operation_result(index, OperationResult::Ok);
        }
        Ok(())
    }
}

impl Decoder for MockDecoder {
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
        self.scenario.passes.fetch_add(1, Ordering::SeqCst);
        let active = self.scenario.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.scenario.max_active.fetch_max(active, Ordering::SeqCst);
        self.scenario.log.lock().push(indexes.to_vec());

        let result = self.run(indexes, callback);

        self.scenario.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Registry over the mock engine of `scenario`.
pub fn mock_registry(scenario: &Arc<Scenario>) -> Arc<EngineRegistry> {
    EngineRegistry::new(MockLoader::new(Arc::clone(scenario)))
}

/// Mount options for a mock archive. The file only has to exist.
pub fn mock_options(dir: &TempDir) -> MountOptions {
    let path: PathBuf = dir.path().join("mock.zip");
    std::fs::write(&path, b"mock").expect("Failed to write mock archive");
    let mut options = MountOptions::new(path);
    options.format = Some(ArchiveFormat::Zip);
    options.coalesce_window = Duration::ZERO;
    options
}

/// A password provider that counts how often it is asked.
pub fn counting_provider(
    answer: Option<&'static str>,
) -> (Arc<AtomicUsize>, Arc<dyn archivefs::CredentialProvider>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let provider = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        answer.map(str::to_string)
    };
    (calls, Arc::new(provider))
}
