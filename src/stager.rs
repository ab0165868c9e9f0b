//! Staging and unpacking of transfer sources. A single regular file is
//! shipped as-is; anything else (multiple inputs, directories) is packed
//! into one DEFLATE archive first.
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DIGEST_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("no files selected for transfer")]
    NoInput,
    #[error("zip slip detected: {0:?} would extract outside target directory")]
    ZipSlip(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

/// What actually goes on the wire for one outgoing request.
#[derive(Debug, Clone)]
pub struct TransferSource {
    pub is_zip: bool,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// Build transfer metadata for the selected paths, staging a zip at
/// `staging_path` when more than a single plain file was picked.
pub fn prepare_transfer(paths: &[PathBuf], staging_path: &Path) -> Result<TransferSource, StageError> {
    if paths.is_empty() {
        return Err(StageError::NoInput);
    }

    if paths.len() == 1 && paths[0].is_file() {
        let path = &paths[0];
        let size = fs::metadata(path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        return Ok(TransferSource {
            is_zip: false,
            path: path.clone(),
            name,
            size,
        });
    }

    let mut writer = ZipWriter::new(File::create(staging_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in paths {
        if path.is_file() {
            let arcname = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            writer.start_file(arcname, options)?;
            io::copy(&mut File::open(path)?, &mut writer)?;
        } else if path.is_dir() {
            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dir".to_string());
            for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
                // Zip member names use forward slashes on every platform.
                let mut arcname = base.clone();
                for comp in rel.components() {
                    arcname.push('/');
                    arcname.push_str(&comp.as_os_str().to_string_lossy());
                }
                writer.start_file(arcname, options)?;
                io::copy(&mut File::open(entry.path())?, &mut writer)?;
            }
        }
    }
    writer.finish()?;

    let size = fs::metadata(staging_path)?.len();
    Ok(TransferSource {
        is_zip: true,
        path: staging_path.to_path_buf(),
        name: "Archive.zip".to_string(),
        size,
    })
}

/// Extract an archive into `extract_dir`, refusing any member that would
/// land outside it. On slip detection nothing has been written and the
/// archive is left in place; on success the archive is deleted.
pub fn extract_zip(zip_path: &Path, extract_dir: &Path) -> Result<(), StageError> {
    let mut archive = ZipArchive::new(File::open(zip_path)?)?;

    // Validate every member name before writing a single byte.
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.enclosed_name().is_none() {
            return Err(StageError::ZipSlip(entry.name().to_string()));
        }
    }

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => return Err(StageError::ZipSlip(entry.name().to_string())),
        };
        let out = extract_dir.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            io::copy(&mut entry, &mut File::create(&out)?)?;
        }
    }

    fs::remove_file(zip_path)?;
    Ok(())
}

/// Streaming SHA-256, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String, StageError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_string(&hasher.finalize()))
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
