//! Integration tests for archive probing functionality.

mod common;

use archivefs::{probe, ArchiveFormat, FsError};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper function to create a simple test file
fn create_test_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let file_path = dir.path().join(name);
    let mut file = File::create(&file_path).expect("Failed to create test file");
    file.write_all(content).expect("Failed to write test file");
    file_path
}

/// Helper function to create a TAR.BZ2 archive
fn create_tar_bz2_archive(archive_path: &PathBuf, files: &[(&str, &[u8])]) -> std::io::Result<()> {
    use bzip2::write::BzEncoder;

    let file = File::create(archive_path)?;
    let encoder = BzEncoder::new(file, bzip2::Compression::default());
    let mut tar = tar::Builder::new(encoder);

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, name, &content[..])?;
    }

    tar.into_inner()?.finish()?;
    Ok(())
}

#[test]
fn test_probe_zip_archive() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("test.zip");

    common::create_zip_archive(&archive_path, &[("test.txt", b"Hello, World!")])
        .expect("Failed to create ZIP");

    let info = probe(&archive_path).expect("Failed to probe archive");

    assert_eq!(info.format, ArchiveFormat::Zip);
    assert_eq!(info.format.to_string(), "ZIP");
    assert_eq!(info.entries, 1);
    assert!(info.compressed_bytes.is_some());
    assert_eq!(info.uncompressed_estimate, Some(13));
    assert!(!info.encrypted);
}

#[test]
fn test_probe_tar_gz_archive() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("test.tar.gz");

    common::create_tar_gz_archive(
        &archive_path,
        &[("test.txt", b"Hello, World!"), ("more.txt", b"More")],
    )
    .expect("Failed to create TAR.GZ");

    let info = probe(&archive_path).expect("Failed to probe archive");

    assert_eq!(info.format, ArchiveFormat::TarGz);
    assert_eq!(info.entries, 2);
    // A compressed tarball is one solid stream.
    assert_eq!(info.solid_blocks, 1);

    let entry = &info.entry_list[0];
    assert_eq!(entry.path, "test.txt");
    assert!(!entry.is_directory);
    assert_eq!(entry.size, 13);
}

#[test]
fn test_probe_tar_bz2_archive() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("test.tar.bz2");

    create_tar_bz2_archive(&archive_path, &[("test.txt", b"Hello, BZ2!")])
        .expect("Failed to create TAR.BZ2");

    let info = probe(&archive_path).expect("Failed to probe archive");

    assert_eq!(info.format, ArchiveFormat::TarBz2);
    assert_eq!(info.entries, 1);
    assert_eq!(info.entry_list[0].size, 11);
}

#[test]
fn test_probe_tar_archive() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("test.tar");

    let file = File::create(&archive_path).expect("Failed to create archive");
    let mut tar = tar::Builder::new(file);
    let content = b"Hello, World!";
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, "test.txt", &content[..])
        .expect("Failed to add file to TAR");
    tar.finish().expect("Failed to finish TAR");

    let info = probe(&archive_path).expect("Failed to probe archive");

    assert_eq!(info.format, ArchiveFormat::Tar);
    assert_eq!(info.entries, 1);
}

#[test]
fn test_probe_7z_archive() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("test.7z");

    common::create_7z_archive(&archive_path, &[("test.txt", b"Hello, 7z!")])
        .expect("Failed to create 7z");

    let info = probe(&archive_path).expect("Failed to probe archive");

    assert_eq!(info.format, ArchiveFormat::SevenZip);
    assert_eq!(info.entries, 1);
    assert_eq!(info.entry_list[0].path, "test.txt");
    assert_eq!(info.entry_list[0].size, 10);
}

#[test]
fn test_probe_detects_format_from_content() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("misnamed.bin");

    common::create_zip_archive(&archive_path, &[("a.txt", b"a")]).expect("Failed to create ZIP");

    let info = probe(&archive_path).expect("Failed to probe archive");
    assert_eq!(info.format, ArchiveFormat::Zip);
}

#[test]
fn test_probe_entry_list() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("entries.zip");

    common::create_zip_archive(
        &archive_path,
        &[
            ("folder/", b""),
            ("file1.txt", b"Content 1"),
            ("folder/file2.txt", b"Content 2 is longer"),
        ],
    )
    .expect("Failed to create ZIP");

    let info = probe(&archive_path).expect("Failed to probe archive");

    assert_eq!(info.entries, 3);
    assert_eq!(info.entry_list.len(), 3);

    let folder_entry = info
        .entry_list
        .iter()
        .find(|e| e.path == "folder/")
        .expect("Folder not found");
    assert!(folder_entry.is_directory);
    assert_eq!(folder_entry.block, None);

    let file2_entry = info
        .entry_list
        .iter()
        .find(|e| e.path == "folder/file2.txt")
        .expect("folder/file2.txt not found");
    assert!(!file2_entry.is_directory);
    assert_eq!(file2_entry.size, 19);

    // Every ZIP member compresses on its own.
    assert_eq!(info.solid_blocks, 2);
}

#[test]
fn test_probe_encrypted_zip() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("locked.zip");

    common::create_encrypted_zip(&archive_path, "secret", &[("a.txt", b"hidden")])
        .expect("Failed to create encrypted ZIP");

    // Entry headers are readable without the password.
    let info = probe(&archive_path).expect("Failed to probe archive");
    assert!(info.encrypted);
    assert!(info.entry_list[0].encrypted);
}

#[test]
fn test_probe_empty_archive() {
    let temp_dir = common::setup_test_dir();
    let archive_path = temp_dir.path().join("empty.zip");

    common::create_zip_archive(&archive_path, &[]).expect("Failed to create empty ZIP");

    let info = probe(&archive_path).expect("Failed to probe empty archive");

    assert_eq!(info.format, ArchiveFormat::Zip);
    assert_eq!(info.entries, 0);
    assert_eq!(info.uncompressed_estimate, None);
    assert_eq!(info.solid_blocks, 0);
}

#[test]
fn test_probe_nonexistent_file() {
    let temp_dir = common::setup_test_dir();
    let nonexistent = temp_dir.path().join("nonexistent.zip");

    let result = probe(&nonexistent);

    assert!(matches!(result, Err(FsError::ArchiveOpen { .. })));
}

#[test]
fn test_probe_corrupted_archive() {
    let temp_dir = common::setup_test_dir();
    let corrupted_path =
        create_test_file(&temp_dir, "corrupted.zip", b"This is not a valid ZIP file");

    let result = probe(&corrupted_path);

    assert!(matches!(result, Err(FsError::ArchiveOpen { .. })));
}

#[test]
fn test_probe_unsupported_format() {
    let temp_dir = common::setup_test_dir();
    let unsupported_path = create_test_file(&temp_dir, "test.unknown", b"Some content");

    let result = probe(&unsupported_path);

    assert!(matches!(result, Err(FsError::UnsupportedFormat(_))));
}
