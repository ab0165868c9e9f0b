//! File-transfer coordination: the offer tables on both sides of a
//! request and the chunked stream receive with integrity validation.
//! A request is only ever streamed to a peer that accepted it, and a
//! received stream is only surfaced after size and digest both match.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::warn;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::{CryptoError, SessionCrypto};
use crate::protocol::Message;
use crate::stager::{self, hex_string, StageError};
use crate::transport::{read_frame, FrameError, FrameRead};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid chunk length: {0}")]
    InvalidChunk(u32),
    #[error("size mismatch (expected={expected}, actual={actual})")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("sha-256 mismatch for received file stream")]
    DigestMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Sender-side record for one offered transfer. Lives until cancel or
/// engine stop; the staged archive (if any) is deleted with it.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub path: PathBuf,
    pub is_zip: bool,
    pub speed_limit: i64,
    pub file_size: u64,
    pub file_sha256: String,
}

/// The three request tables. All access goes through these methods so
/// the accept-loop workers and the caller thread stay serialized.
#[derive(Default)]
pub struct TransferTables {
    outgoing: Mutex<HashMap<String, OutgoingTransfer>>,
    incoming: Mutex<HashMap<String, Message>>,
    download_paths: Mutex<HashMap<String, PathBuf>>,
}

impl TransferTables {
    pub fn insert_outgoing(&self, req_id: &str, transfer: OutgoingTransfer) {
        self.outgoing.lock().insert(req_id.to_string(), transfer);
    }

    pub fn outgoing(&self, req_id: &str) -> Option<OutgoingTransfer> {
        self.outgoing.lock().get(req_id).cloned()
    }

    pub fn remove_outgoing(&self, req_id: &str) -> Option<OutgoingTransfer> {
        self.outgoing.lock().remove(req_id)
    }

    pub fn outgoing_ids(&self) -> Vec<String> {
        self.outgoing.lock().keys().cloned().collect()
    }

    pub fn outgoing_snapshot(&self) -> Vec<(String, OutgoingTransfer)> {
        self.outgoing
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Store a FILE_REQ as received; the packet itself is the record.
    pub fn register_incoming(&self, msg: &Message) {
        if let Some(req_id) = &msg.req_id {
            self.incoming.lock().insert(req_id.clone(), msg.clone());
        }
    }

    pub fn incoming_request(&self, req_id: &str) -> Option<Message> {
        self.incoming.lock().get(req_id).cloned()
    }

    pub fn remove_incoming(&self, req_id: &str) -> Option<Message> {
        self.incoming.lock().remove(req_id)
    }

    /// Promote an offer to accepted by recording where the stream lands.
    pub fn mark_accepted(&self, req_id: &str, save_path: &Path) {
        self.download_paths
            .lock()
            .insert(req_id.to_string(), save_path.to_path_buf());
    }

    pub fn download_path(&self, req_id: &str) -> Option<PathBuf> {
        self.download_paths.lock().get(req_id).cloned()
    }

    pub fn remove_download_path(&self, req_id: &str) -> Option<PathBuf> {
        self.download_paths.lock().remove(req_id)
    }

    pub fn download_snapshot(&self) -> Vec<(String, PathBuf)> {
        self.download_paths
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Validated parameters for one accepted stream receive.
#[derive(Debug, Clone)]
pub struct ReceivePlan {
    pub req_id: String,
    pub save_path: PathBuf,
    pub is_zip: bool,
    pub expected_size: u64,
    pub expected_sha256: String,
}

/// `<save_path>_extracted`, where archive transfers unpack.
pub fn extracted_dir_for(save_path: &Path) -> PathBuf {
    let mut s = save_path.as_os_str().to_os_string();
    s.push("_extracted");
    PathBuf::from(s)
}

/// Receive an accepted stream to completion. On any validation failure
/// the partial download is removed before the error is returned, so a
/// failed transfer never leaves observable output. The one exception is
/// a slipped archive, which stays on disk for inspection.
pub fn receive_stream<R: Read>(
    stream: &mut R,
    plan: &ReceivePlan,
    crypto: &SessionCrypto,
) -> Result<PathBuf, TransferError> {
    match run_receive(stream, plan, crypto) {
        Ok(final_path) => Ok(final_path),
        Err(err) => {
            cleanup_failed_receive(&plan.save_path, &err);
            Err(err)
        }
    }
}

fn run_receive<R: Read>(
    stream: &mut R,
    plan: &ReceivePlan,
    crypto: &SessionCrypto,
) -> Result<PathBuf, TransferError> {
    if let Some(parent) = plan.save_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut out = File::create(&plan.save_path)?;
    let mut received: u64 = 0;
    let mut hasher = Sha256::new();
    loop {
        match read_frame(stream)? {
            FrameRead::Eof => break,
            FrameRead::Frame(chunk) => {
                if chunk.is_empty() {
                    return Err(TransferError::InvalidChunk(0));
                }
                let raw = crypto.decrypt(&chunk)?;
                out.write_all(&raw)?;
                received += raw.len() as u64;
                hasher.update(&raw);
            }
        }
    }
    drop(out);

    if received != plan.expected_size {
        return Err(TransferError::SizeMismatch {
            expected: plan.expected_size,
            actual: received,
        });
    }
    let actual_sha256 = hex_string(&hasher.finalize());
    if !plan.expected_sha256.is_empty()
        && actual_sha256 != plan.expected_sha256.to_lowercase()
    {
        return Err(TransferError::DigestMismatch);
    }

    if plan.is_zip {
        let extract_dir = extracted_dir_for(&plan.save_path);
        stager::extract_zip(&plan.save_path, &extract_dir)?;
        Ok(extract_dir)
    } else {
        Ok(plan.save_path.clone())
    }
}

fn cleanup_failed_receive(save_path: &Path, err: &TransferError) {
    if matches!(err, TransferError::Stage(StageError::ZipSlip(_))) {
        return;
    }
    let extract_dir = extracted_dir_for(save_path);
    if extract_dir.is_dir() {
        if let Err(e) = fs::remove_dir_all(&extract_dir) {
            warn!("[Transfer] partial extract cleanup failed: {e}");
        }
    }
    let result = if save_path.is_dir() {
        fs::remove_dir_all(save_path)
    } else if save_path.exists() {
        fs::remove_file(save_path)
    } else {
        Ok(())
    };
    if let Err(e) = result {
        warn!("[Transfer] partial download cleanup failed: {e}");
    }
}
