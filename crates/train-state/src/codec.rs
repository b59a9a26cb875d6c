//! Checkpoint file format
//!
//! A checkpoint is a single file: a fixed little-endian header followed by
//! the bincode-encoded state dict.
//!
//! ```text
//! magic "TSCK" | version u32 | step u64 | kind u8 | payload_size u64
//! | metadata_len u32 | metadata json | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use train_core::{get_step, Error, Result, StateDict, Step};
use uuid::Uuid;

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"TSCK";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Bytes before the metadata: magic, version, step, kind, payload size, metadata length
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 1 + 8 + 4;

/// Which container produced a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    /// Step counter only
    Base = 0,

    /// Step, params and optimizer state
    Basic = 1,

    /// Basic plus EMA parameters
    Denoising = 2,
}

impl TryFrom<u8> for CheckpointKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(CheckpointKind::Base),
            1 => Ok(CheckpointKind::Basic),
            2 => Ok(CheckpointKind::Denoising),
            other => Err(other),
        }
    }
}

/// Descriptive fields stored as JSON in the header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderMetadata {
    pub created_at: DateTime<Utc>,
    pub kind: CheckpointKind,
}

/// Checkpoint file header
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub step: Step,
    pub kind: CheckpointKind,
    pub payload_size: u64,
    pub metadata: HeaderMetadata,
}

/// Encode a state dict into checkpoint bytes
pub fn encode(kind: CheckpointKind, state: &StateDict) -> Result<Bytes> {
    let step = get_step(state)?.unwrap_or(0);
    let payload = bincode::serialize(state)?;
    let metadata = serde_json::to_vec(&HeaderMetadata {
        created_at: Utc::now(),
        kind,
    })?;

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata.len() + payload.len());
    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(CHECKPOINT_VERSION);
    buf.put_u64_le(step);
    buf.put_u8(kind as u8);
    buf.put_u64_le(payload.len() as u64);
    buf.put_u32_le(metadata.len() as u32);
    buf.put_slice(&metadata);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Parse the header, returning it with the remaining payload bytes
fn split_header<'a>(origin: &str, mut buf: &'a [u8]) -> Result<(CheckpointHeader, &'a [u8])> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        path: origin.to_string(),
        reason,
    };

    if buf.remaining() < FIXED_HEADER_LEN {
        return Err(corrupted(format!(
            "file is {} bytes, shorter than the {}-byte header",
            buf.remaining(),
            FIXED_HEADER_LEN
        )));
    }

    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != CHECKPOINT_MAGIC {
        return Err(corrupted("invalid checkpoint magic".to_string()));
    }

    let version = buf.get_u32_le();
    if version != CHECKPOINT_VERSION {
        warn!(
            "Checkpoint version mismatch: expected {}, got {}",
            CHECKPOINT_VERSION, version
        );
    }

    let step = buf.get_u64_le();
    let kind = CheckpointKind::try_from(buf.get_u8())
        .map_err(|k| corrupted(format!("unknown checkpoint kind {}", k)))?;
    let payload_size = buf.get_u64_le();
    let meta_len = buf.get_u32_le() as usize;

    if buf.remaining() < meta_len {
        return Err(corrupted("truncated metadata".to_string()));
    }
    let metadata: HeaderMetadata = serde_json::from_slice(&buf[..meta_len])
        .map_err(|e| corrupted(format!("unreadable metadata: {}", e)))?;
    buf.advance(meta_len);

    if buf.remaining() as u64 != payload_size {
        return Err(corrupted(format!(
            "payload is {} bytes, header declares {}",
            buf.remaining(),
            payload_size
        )));
    }

    Ok((
        CheckpointHeader {
            version,
            step,
            kind,
            payload_size,
            metadata,
        },
        buf,
    ))
}

/// Decode checkpoint bytes into header and state dict
pub fn decode(origin: &str, data: &[u8]) -> Result<(CheckpointHeader, StateDict)> {
    let (header, payload) = split_header(origin, data)?;
    let state: StateDict = bincode::deserialize(payload).map_err(|e| Error::CheckpointCorrupted {
        path: origin.to_string(),
        reason: format!("undecodable payload: {}", e),
    })?;
    Ok((header, state))
}

/// Unique temporary path next to `path`
fn temp_path(path: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4()
    );
    path.with_file_name(temp_name)
}

/// Write pre-encoded checkpoint bytes atomically (temp file, fsync, rename)
#[instrument(skip_all, fields(path = %path.display(), size = data.len()))]
pub fn write_bytes(path: &Path, data: &[u8]) -> Result<u64> {
    let start = std::time::Instant::now();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(Error::Io(e));
    }

    debug!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Checkpoint file written"
    );
    Ok(data.len() as u64)
}

/// Encode and write a checkpoint file
pub fn write_checkpoint_file(path: &Path, kind: CheckpointKind, state: &StateDict) -> Result<u64> {
    let data = encode(kind, state)?;
    let size = write_bytes(path, &data)?;
    info!(path = %path.display(), ?kind, size_bytes = size, "Checkpoint saved");
    Ok(size)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::CheckpointNotFound {
            path: path.display().to_string(),
        },
        _ => Error::Io(e),
    })
}

/// Read and decode a checkpoint file
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_checkpoint_file(path: &Path) -> Result<(CheckpointHeader, StateDict)> {
    let data = read_file(path)?;
    let decoded = decode(&path.display().to_string(), &data)?;
    debug!(step = decoded.0.step, kind = ?decoded.0.kind, "Checkpoint read");
    Ok(decoded)
}

/// Read only the header of a checkpoint file
pub fn read_header(path: &Path) -> Result<CheckpointHeader> {
    let data = read_file(path)?;
    split_header(&path.display().to_string(), &data).map(|(header, _)| header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use train_core::{Tensor, Value};

    fn sample_state() -> StateDict {
        let mut params = StateDict::new();
        params.insert(
            "w".to_string(),
            Value::Tensor(Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
        );
        let mut state = StateDict::new();
        state.insert("step".to_string(), Value::Int(100));
        state.insert("params".to_string(), Value::Map(params));
        state
    }

    #[test]
    fn test_write_and_read_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("test.ckpt");
        let state = sample_state();

        let size = write_checkpoint_file(&path, CheckpointKind::Basic, &state).unwrap();
        assert!(size > FIXED_HEADER_LEN as u64);

        let (header, restored) = read_checkpoint_file(&path).unwrap();
        assert_eq!(header.step, 100);
        assert_eq!(header.kind, CheckpointKind::Basic);
        assert_eq!(header.metadata.kind, CheckpointKind::Basic);
        assert_eq!(restored, state);
        assert_eq!(read_header(&path).unwrap(), header);
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = tempdir().unwrap();
        write_checkpoint_file(&dir.path().join("a.ckpt"), CheckpointKind::Base, &sample_state())
            .unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "Temp files should be cleaned up");
    }

    #[test]
    fn test_bad_magic() {
        let mut data = encode(CheckpointKind::Base, &sample_state()).unwrap().to_vec();
        data[0] = b'X';
        let err = decode("mem", &data).unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
    }

    #[test]
    fn test_truncated_payload() {
        let data = encode(CheckpointKind::Base, &sample_state()).unwrap();
        let err = decode("mem", &data[..data.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));

        let err = decode("mem", &data[..10]).unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = read_checkpoint_file(&dir.path().join("missing.ckpt")).unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound { .. }));
    }
}
