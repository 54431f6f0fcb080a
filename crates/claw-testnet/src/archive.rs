//! Single-file tar archives for the engine's archive endpoints.

use std::io::Read;

use tar::{Archive, Builder, EntryType, Header};

use crate::error::{TestnetError, TestnetResult};

/// A regular file extracted from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    /// Path inside the archive, without a leading `./`.
    pub path: String,
    /// File contents.
    pub data: Vec<u8>,
    /// Unix mode bits.
    pub mode: u32,
}

/// Build an uncompressed archive containing one regular file.
///
/// # Errors
///
/// Returns error if the path cannot be encoded in a tar header.
pub fn pack_file(path: &str, data: &[u8], mode: u32) -> TestnetResult<Vec<u8>> {
    let mut archive = Builder::new(Vec::new());

    let mut header = Header::new_gnu();
    header
        .set_path(path)
        .map_err(|e| TestnetError::Archive(format!("invalid entry path {path}: {e}")))?;
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_entry_type(EntryType::Regular);
    header.set_mtime(chrono::Utc::now().timestamp().unsigned_abs());
    header.set_cksum();

    archive.append(&header, data)?;
    Ok(archive.into_inner()?)
}

/// Extract every regular file from an uncompressed archive.
///
/// # Errors
///
/// Returns error if the archive is malformed.
pub fn unpack_files(bytes: &[u8]) -> TestnetResult<Vec<ArchiveFile>> {
    let mut archive = Archive::new(bytes);
    let mut files = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| TestnetError::Archive(format!("failed to read entries: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| TestnetError::Archive(format!("failed to read entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| TestnetError::Archive(format!("invalid entry path: {e}")))?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mode = entry.header().mode().unwrap_or(0o644);

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.push(ArchiveFile { path, data, mode });
    }

    Ok(files)
}

/// Extract the single regular file a download of one path yields.
///
/// # Errors
///
/// Returns error if the archive is malformed or holds no regular file.
pub fn unpack_single(bytes: &[u8], what: &str) -> TestnetResult<Vec<u8>> {
    unpack_files(bytes)?
        .into_iter()
        .next()
        .map(|file| file.data)
        .ok_or_else(|| TestnetError::Archive(format!("archive for {what} holds no regular file")))
}
