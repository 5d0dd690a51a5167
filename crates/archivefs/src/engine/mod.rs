//! Decoding engine binding.
//!
//! The engine is the only component that touches compressed bytes. It is
//! loaded lazily through an [`EngineLoader`], shared process-wide through the
//! [`EngineRegistry`], and drives one [`Decoder`] per opened archive.
//!
//! A decode pass is a synchronous conversation: the decoder walks indexes in
//! ascending order and, for each one, asks the [`ExtractCallback`] where the
//! bytes go, reports a result code when the entry is done, and may ask for a
//! password before it starts on encrypted data.

mod registry;
mod sevenz;
mod tar;
mod zip;

pub use registry::{ConsumerId, DecoderHandle, EngineRegistry};

use crate::error::{ExtractionError, Failure, LoadError};
use crate::types::{ArchiveFormat, Entry};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

/// Engine API version this crate drives.
pub const ENGINE_API_VERSION: u32 = 1;

/// Per-entry result code reported by a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Ok,
    CrcError,
    DataError,
    UnsupportedMethod,
    Unavailable,
    UnexpectedEnd,
    DataAfterEnd,
    IsNotArc,
    HeadersError,
    WrongPassword,
}

impl OperationResult {
    /// The failure recorded for this code, `None` on success.
    pub fn failure(self) -> Option<Failure> {
        let kind = match self {
            OperationResult::Ok => return None,
            OperationResult::WrongPassword => return Some(Failure::WrongPassword),
            OperationResult::CrcError => ExtractionError::CrcMismatch,
            OperationResult::DataError => ExtractionError::DataError,
            OperationResult::UnsupportedMethod => ExtractionError::UnsupportedMethod,
            OperationResult::Unavailable => ExtractionError::Unavailable,
            OperationResult::UnexpectedEnd => ExtractionError::UnexpectedEnd,
            OperationResult::DataAfterEnd => ExtractionError::TrailingData,
            OperationResult::IsNotArc => ExtractionError::NotAnArchive,
            OperationResult::HeadersError => ExtractionError::HeaderError,
        };
        Some(Failure::Extraction(kind))
    }

    /// Structural errors end the whole pass, not just the current entry.
    pub fn is_pass_fatal(self) -> bool {
        matches!(self, OperationResult::IsNotArc | OperationResult::HeadersError)
    }

    /// Best-effort classification of an engine error message.
    ///
    /// Engines built on pure-Rust crates surface failures as error values
    /// rather than numeric codes; this maps their wording onto the codes.
    /// Data and checksum errors inside encrypted entries are almost always a
    /// wrong key, so they are reported as such.
    pub fn classify(message: &str, encrypted: bool) -> OperationResult {
        let msg = message.to_lowercase();

        if msg.contains("password") || msg.contains("decrypt") {
            return OperationResult::WrongPassword;
        }

        if msg.contains("checksum") || msg.contains("crc") {
            return if encrypted {
                OperationResult::WrongPassword
            } else {
                OperationResult::CrcError
            };
        }

        if msg.contains("unsupported") || msg.contains("not supported") {
            return OperationResult::UnsupportedMethod;
        }

        if msg.contains("unexpected end")
            || msg.contains("unexpected eof")
            || msg.contains("failed to fill whole buffer")
        {
            return OperationResult::UnexpectedEnd;
        }

        if msg.contains("signature") || msg.contains("not an archive") {
            return OperationResult::IsNotArc;
        }

        if msg.contains("header") {
            return OperationResult::HeadersError;
        }

        if msg.contains("trailing") || msg.contains("after end") {
            return OperationResult::DataAfterEnd;
        }

        if encrypted {
            OperationResult::WrongPassword
        } else {
            OperationResult::DataError
        }
    }

    /// Classifies an I/O error raised while copying entry data.
    pub fn from_io(err: &io::Error, encrypted: bool) -> OperationResult {
        match err.kind() {
            io::ErrorKind::UnexpectedEof if !encrypted => OperationResult::UnexpectedEnd,
            _ => OperationResult::classify(&err.to_string(), encrypted),
        }
    }
}

/// Reasons a decoder gives up on a pass as a whole.
#[derive(Debug)]
pub enum EngineError {
    /// The callback reported cancellation.
    Aborted,

    /// Encrypted data was reached and no password was available.
    PasswordRequired,

    /// The pass stopped with a result code that covers every entry left.
    Result(OperationResult),

    /// The archive file itself could not be read.
    Io(io::Error),
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl EngineError {
    pub fn into_failure(self) -> Failure {
        match self {
            EngineError::Aborted => Failure::Cancelled,
            EngineError::PasswordRequired => Failure::WrongPassword,
            EngineError::Result(code) => code
                .failure()
                .unwrap_or_else(|| Failure::Engine("pass ended without output".into())),
            EngineError::Io(err) => Failure::Engine(err.to_string()),
        }
    }
}

/// Destination of one entry's bytes during a pass.
#[derive(Debug)]
pub enum Target {
    /// Materialize the entry
    Keep(Vec<u8>),

    /// Decode through and drop the bytes
    Discard,
}

impl Write for Target {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Target::Keep(buffer) => buffer.extend_from_slice(buf),
            Target::Discard => {}
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The session side of a decode pass.
pub trait ExtractCallback {
    /// Output for `index`; called once, just before its data is decoded.
    fn target(&mut self, index: u32) -> &mut Target;

    /// Completion code for `index`.
    fn set_operation_result(&mut self, index: u32, result: OperationResult);

    /// Password for encrypted data. May block on the user.
    fn password(&mut self) -> Option<String>;

    /// Checked between entries; `true` aborts the pass.
    fn is_cancelled(&self) -> bool;
}

/// Decoder for one opened archive. Not reentrant: callers serialize passes.
pub trait Decoder: Send {
    fn format(&self) -> ArchiveFormat;

    /// Entry table in header order.
    fn entries(&self) -> &[Entry];

    /// Runs one pass over `indexes`, which are ascending and cover whole
    /// solid blocks up to the last wanted entry of each.
    fn extract(
        &mut self,
        indexes: &[u32],
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError>;
}

/// Failure to open an archive with a decoder.
#[derive(Debug)]
pub enum OpenError {
    WrongPassword,
    Corrupt(String),
    Io(io::Error),
}

impl From<io::Error> for OpenError {
    fn from(err: io::Error) -> Self {
        OpenError::Io(err)
    }
}

/// Loaded decoding engine.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn api_version(&self) -> u32;

    fn formats(&self) -> &[ArchiveFormat];

    /// Opens `path`, reading the entry table. `password` is consulted only
    /// when the headers themselves are encrypted.
    fn open(
        &self,
        format: ArchiveFormat,
        path: &Path,
        switches: &[String],
        password: &mut dyn FnMut() -> Option<String>,
    ) -> Result<Box<dyn Decoder>, OpenError>;
}

/// Produces the engine on first use.
pub trait EngineLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn Engine>, LoadError>;
}

/// Loader for the engine compiled into this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinLoader;

impl EngineLoader for BuiltinLoader {
    fn load(&self) -> Result<Arc<dyn Engine>, LoadError> {
        Ok(Arc::new(BuiltinEngine))
    }
}

/// Engine backed by the `sevenz-rust2`, `zip` and `tar` crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngine;

const BUILTIN_FORMATS: &[ArchiveFormat] = &[
    ArchiveFormat::SevenZip,
    ArchiveFormat::Zip,
    ArchiveFormat::Tar,
    ArchiveFormat::TarGz,
    ArchiveFormat::TarBz2,
];

impl Engine for BuiltinEngine {
    fn name(&self) -> &str {
        "builtin"
    }

    fn api_version(&self) -> u32 {
        ENGINE_API_VERSION
    }

    fn formats(&self) -> &[ArchiveFormat] {
        BUILTIN_FORMATS
    }

    fn open(
        &self,
        format: ArchiveFormat,
        path: &Path,
        switches: &[String],
        password: &mut dyn FnMut() -> Option<String>,
    ) -> Result<Box<dyn Decoder>, OpenError> {
        for switch in switches {
            tracing::warn!(switch = %switch, %format, "ignoring unknown extractor switch");
        }
        match format {
            ArchiveFormat::SevenZip => Ok(Box::new(sevenz::SevenZipDecoder::open(path, password)?)),
            ArchiveFormat::Zip => Ok(Box::new(zip::ZipDecoder::open(path)?)),
            ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 => {
                Ok(Box::new(tar::TarDecoder::open(path, format)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes_map_one_to_one() {
        let cases = [
            (OperationResult::CrcError, ExtractionError::CrcMismatch),
            (OperationResult::DataError, ExtractionError::DataError),
            (OperationResult::UnsupportedMethod, ExtractionError::UnsupportedMethod),
            (OperationResult::Unavailable, ExtractionError::Unavailable),
            (OperationResult::UnexpectedEnd, ExtractionError::UnexpectedEnd),
            (OperationResult::DataAfterEnd, ExtractionError::TrailingData),
            (OperationResult::IsNotArc, ExtractionError::NotAnArchive),
            (OperationResult::HeadersError, ExtractionError::HeaderError),
        ];
        for (code, kind) in cases {
            assert_eq!(code.failure(), Some(Failure::Extraction(kind)));
        }
        assert_eq!(OperationResult::Ok.failure(), None);
        assert_eq!(
            OperationResult::WrongPassword.failure(),
            Some(Failure::WrongPassword)
        );
    }

    #[test]
    fn test_pass_fatal_codes() {
        assert!(OperationResult::HeadersError.is_pass_fatal());
        assert!(OperationResult::IsNotArc.is_pass_fatal());
        assert!(!OperationResult::CrcError.is_pass_fatal());
        assert!(!OperationResult::WrongPassword.is_pass_fatal());
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(
            OperationResult::classify("Checksum verification failed", false),
            OperationResult::CrcError
        );
        assert_eq!(
            OperationResult::classify("Checksum verification failed", true),
            OperationResult::WrongPassword
        );
        assert_eq!(
            OperationResult::classify("Password required", false),
            OperationResult::WrongPassword
        );
        assert_eq!(
            OperationResult::classify("Unsupported compression method", false),
            OperationResult::UnsupportedMethod
        );
        assert_eq!(
            OperationResult::classify("bad signature", false),
            OperationResult::IsNotArc
        );
        assert_eq!(
            OperationResult::classify("something odd", false),
            OperationResult::DataError
        );
    }

    #[test]
    fn test_eof_maps_to_unexpected_end() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        assert_eq!(OperationResult::from_io(&err, false), OperationResult::UnexpectedEnd);
    }

    #[test]
    fn test_discard_target_swallows_bytes() {
        let mut keep = Target::Keep(Vec::new());
        let mut discard = Target::Discard;
        keep.write_all(b"abc").unwrap();
        discard.write_all(b"abc").unwrap();
        assert!(matches!(keep, Target::Keep(ref b) if b == b"abc"));
        assert!(matches!(discard, Target::Discard));
    }
}
