//! Scalar summaries in TensorBoard event files
//!
//! Event files are TFRecord streams: each record is
//!
//! ```text
//! length u64 | masked crc32c(length) u32 | payload | masked crc32c(payload) u32
//! ```
//!
//! and each payload is a protobuf `Event`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use prost::Message;
use tracing::{debug, info, instrument, warn};
use train_core::{Error, LoggingConfig, Result, Step};

/// Scalars keyed by step, then by tag
pub type ScalarLog = BTreeMap<Step, BTreeMap<String, f64>>;

const FILE_VERSION: &str = "brain.Event:2";
const SCALARS_PLUGIN: &str = "scalars";
const DT_FLOAT: i32 = 1;
const DT_DOUBLE: i32 = 2;

static WRITER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Protobuf messages of the event file format (subset)
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Event {
        #[prost(double, tag = "1")]
        pub wall_time: f64,
        #[prost(int64, tag = "2")]
        pub step: i64,
        #[prost(oneof = "event::What", tags = "3, 5")]
        pub what: Option<event::What>,
    }

    pub mod event {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum What {
            #[prost(string, tag = "3")]
            FileVersion(String),
            #[prost(message, tag = "5")]
            Summary(super::Summary),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Summary {
        #[prost(message, repeated, tag = "1")]
        pub value: Vec<summary::Value>,
    }

    pub mod summary {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Value {
            #[prost(string, tag = "1")]
            pub tag: String,
            #[prost(message, optional, tag = "9")]
            pub metadata: Option<super::SummaryMetadata>,
            #[prost(oneof = "value::Kind", tags = "2, 8")]
            pub kind: Option<value::Kind>,
        }

        pub mod value {
            #[derive(Clone, PartialEq, ::prost::Oneof)]
            pub enum Kind {
                #[prost(float, tag = "2")]
                SimpleValue(f32),
                #[prost(message, tag = "8")]
                Tensor(super::super::TensorProto),
            }
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SummaryMetadata {
        #[prost(message, optional, tag = "1")]
        pub plugin_data: Option<PluginData>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PluginData {
        #[prost(string, tag = "1")]
        pub plugin_name: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TensorProto {
        #[prost(int32, tag = "1")]
        pub dtype: i32,
        #[prost(bytes = "vec", tag = "4")]
        pub tensor_content: Vec<u8>,
        #[prost(float, repeated, tag = "5")]
        pub float_val: Vec<f32>,
        #[prost(double, repeated, tag = "6")]
        pub double_val: Vec<f64>,
    }
}

use proto::event::What;
use proto::summary::value::Kind;

fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

/// Frame one payload as a TFRecord
fn encode_record(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = Vec::with_capacity(payload.len() + 16);
    record.extend_from_slice(&len);
    record.extend_from_slice(&masked_crc(&len).to_le_bytes());
    record.extend_from_slice(payload);
    record.extend_from_slice(&masked_crc(payload).to_le_bytes());
    record
}

/// Split a TFRecord stream into payloads.
///
/// A truncated trailing record is dropped with a warning since the file may
/// still be being written; checksum mismatches are errors.
fn decode_records<'a>(path: &Path, data: &'a [u8]) -> Result<Vec<&'a [u8]>> {
    let err = |message: String| Error::EventLog {
        path: path.display().to_string(),
        message,
    };

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < 12 {
            warn!(path = %path.display(), offset = pos, "Ignoring truncated record header");
            break;
        }

        let len_bytes = &rest[..8];
        let len_crc = u32::from_le_bytes([rest[8], rest[9], rest[10], rest[11]]);
        if masked_crc(len_bytes) != len_crc {
            return Err(err(format!("length checksum mismatch at offset {}", pos)));
        }

        let mut len_arr = [0u8; 8];
        len_arr.copy_from_slice(len_bytes);
        let len = u64::from_le_bytes(len_arr) as usize;

        let end = 12usize.saturating_add(len).saturating_add(4);
        if rest.len() < end {
            warn!(path = %path.display(), offset = pos, "Ignoring truncated record payload");
            break;
        }

        let payload = &rest[12..12 + len];
        let data_crc = u32::from_le_bytes([rest[12 + len], rest[13 + len], rest[14 + len], rest[15 + len]]);
        if masked_crc(payload) != data_crc {
            return Err(err(format!("payload checksum mismatch at offset {}", pos)));
        }

        records.push(payload);
        pos += end;
    }
    Ok(records)
}

/// Scalar carried by a summary value, if it holds one
fn scalar_of(value: &proto::summary::Value) -> Option<f64> {
    match value.kind.as_ref()? {
        Kind::SimpleValue(v) => Some(f64::from(*v)),
        Kind::Tensor(tensor) => {
            let plugin = value
                .metadata
                .as_ref()
                .and_then(|m| m.plugin_data.as_ref())
                .map(|p| p.plugin_name.as_str());
            if plugin != Some(SCALARS_PLUGIN) {
                return None;
            }
            match (
                tensor.float_val.as_slice(),
                tensor.double_val.as_slice(),
                tensor.tensor_content.as_slice(),
            ) {
                ([v], _, _) => Some(f64::from(*v)),
                (_, [v], _) => Some(*v),
                (_, _, bytes) if tensor.dtype == DT_FLOAT && bytes.len() == 4 => {
                    Some(f64::from(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
                }
                (_, _, bytes) if tensor.dtype == DT_DOUBLE && bytes.len() == 8 => {
                    let mut arr = [0u8; 8];
                    arr.copy_from_slice(bytes);
                    Some(f64::from_le_bytes(arr))
                }
                _ => None,
            }
        }
    }
}

/// Event files in `logdir`, sorted by name; a file path is returned as is
fn event_files(logdir: &Path) -> Result<Vec<PathBuf>> {
    let err = |message: String| Error::EventLog {
        path: logdir.display().to_string(),
        message,
    };

    if logdir.is_file() {
        return Ok(vec![logdir.to_path_buf()]);
    }
    if !logdir.is_dir() {
        return Err(err("log directory does not exist".to_string()));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(logdir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains("tfevents") && entry.path().is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn read_event_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::EventLog {
        path: path.display().to_string(),
        message: format!("unreadable event file: {}", e),
    })
}

/// Loads scalar summaries from events in a logdir
#[instrument(skip_all, fields(logdir = %logdir.as_ref().display()))]
pub fn load_scalars_from_tfevents<P: AsRef<Path>>(logdir: P) -> Result<ScalarLog> {
    let logdir = logdir.as_ref();
    let mut data = ScalarLog::new();
    let mut events = 0usize;

    for path in event_files(logdir)? {
        let bytes = read_event_file(&path)?;
        for payload in decode_records(&path, &bytes)? {
            let event = proto::Event::decode(payload).map_err(|e| Error::EventLog {
                path: path.display().to_string(),
                message: format!("undecodable event: {}", e),
            })?;
            events += 1;

            let Some(What::Summary(summary)) = event.what else {
                continue;
            };
            if event.step < 0 {
                warn!(step = event.step, "Skipping summary with negative step");
                continue;
            }

            for value in &summary.value {
                if let Some(scalar) = scalar_of(value) {
                    data.entry(event.step as Step)
                        .or_default()
                        .insert(value.tag.clone(), scalar);
                }
            }
        }
    }

    debug!(events, steps = data.len(), "Loaded scalar summaries");
    Ok(data)
}

/// Appends scalar summaries to a new event file
pub struct EventWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl EventWriter {
    /// Create a new event file in `logdir`
    pub fn create<P: AsRef<Path>>(logdir: P) -> Result<Self> {
        let logdir = logdir.as_ref();
        fs::create_dir_all(logdir)?;

        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let name = format!(
            "events.out.tfevents.{}.{}.{}.{:06}",
            Utc::now().timestamp(),
            host,
            std::process::id(),
            WRITER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let path = logdir.join(name);

        let mut writer = Self {
            file: BufWriter::new(File::create(&path)?),
            path,
        };
        writer.write_event(proto::Event {
            wall_time: wall_time(),
            step: 0,
            what: Some(What::FileVersion(FILE_VERSION.to_string())),
        })?;
        info!(path = %writer.path.display(), "Event file created");
        Ok(writer)
    }

    /// Create a writer in the configured event directory, if one is set
    pub fn from_config(config: &LoggingConfig) -> Result<Option<Self>> {
        config.event_dir.as_deref().map(Self::create).transpose()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `value` for `tag` at `step`
    pub fn add_scalar(&mut self, tag: &str, value: f64, step: Step) -> Result<()> {
        let event_step = i64::try_from(step).map_err(|_| Error::CounterOverflow {
            key: "step".to_string(),
            value: step,
        })?;
        let summary = proto::Summary {
            value: vec![proto::summary::Value {
                tag: tag.to_string(),
                metadata: None,
                kind: Some(Kind::SimpleValue(value as f32)),
            }],
        };
        self.write_event(proto::Event {
            wall_time: wall_time(),
            step: event_step,
            what: Some(What::Summary(summary)),
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn write_event(&mut self, event: proto::Event) -> Result<()> {
        self.file.write_all(&encode_record(&event.encode_to_vec()))?;
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if let Err(e) = self.file.flush() {
            warn!(path = %self.path.display(), error = %e, "Failed to flush event file");
        }
    }
}

fn wall_time() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_load() {
        let dir = tempdir().unwrap();
        let mut writer = EventWriter::create(dir.path()).unwrap();
        writer.add_scalar("loss", 0.5, 1).unwrap();
        writer.add_scalar("lr", 0.25, 1).unwrap();
        writer.add_scalar("loss", 0.125, 2).unwrap();
        writer.flush().unwrap();

        let data = load_scalars_from_tfevents(dir.path()).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[&1]["loss"], 0.5);
        assert_eq!(data[&1]["lr"], 0.25);
        assert_eq!(data[&2]["loss"], 0.125);
    }

    #[test]
    fn test_later_files_override() {
        let dir = tempdir().unwrap();
        {
            let mut first = EventWriter::create(dir.path()).unwrap();
            first.add_scalar("loss", 1.0, 5).unwrap();
        }
        {
            let mut second = EventWriter::create(dir.path()).unwrap();
            second.add_scalar("loss", 2.0, 5).unwrap();
        }

        let data = load_scalars_from_tfevents(dir.path()).unwrap();
        assert_eq!(data[&5]["loss"], 2.0);
    }

    #[test]
    fn test_tensor_scalar_summary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.out.tfevents.0.test");
        let event = proto::Event {
            wall_time: 0.0,
            step: 3,
            what: Some(What::Summary(proto::Summary {
                value: vec![proto::summary::Value {
                    tag: "acc".to_string(),
                    metadata: Some(proto::SummaryMetadata {
                        plugin_data: Some(proto::PluginData {
                            plugin_name: SCALARS_PLUGIN.to_string(),
                        }),
                    }),
                    kind: Some(Kind::Tensor(proto::TensorProto {
                        dtype: DT_DOUBLE,
                        double_val: vec![0.75],
                        ..Default::default()
                    })),
                }],
            })),
        };
        fs::write(&path, encode_record(&event.encode_to_vec())).unwrap();

        let data = load_scalars_from_tfevents(&path).unwrap();
        assert_eq!(data[&3]["acc"], 0.75);
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = tempdir().unwrap();
        let path = {
            let mut writer = EventWriter::create(dir.path()).unwrap();
            writer.add_scalar("loss", 1.0, 1).unwrap();
            writer.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = load_scalars_from_tfevents(dir.path()).unwrap_err();
        assert!(matches!(err, Error::EventLog { .. }));
    }

    #[test]
    fn test_truncated_tail_ignored() {
        let dir = tempdir().unwrap();
        let path = {
            let mut writer = EventWriter::create(dir.path()).unwrap();
            writer.add_scalar("loss", 1.0, 1).unwrap();
            writer.add_scalar("loss", 2.0, 2).unwrap();
            writer.path().to_path_buf()
        };

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let data = load_scalars_from_tfevents(dir.path()).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[&1]["loss"], 1.0);
    }

    #[test]
    fn test_missing_logdir() {
        let dir = tempdir().unwrap();
        let err = load_scalars_from_tfevents(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::EventLog { .. }));
    }

    #[test]
    fn test_empty_logdir() {
        let dir = tempdir().unwrap();
        assert!(load_scalars_from_tfevents(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_file_names_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.out.tfevents.gone");

        let err = read_event_file(&path).unwrap_err();
        match err {
            Error::EventLog { path: reported, .. } => {
                assert!(reported.ends_with("events.out.tfevents.gone"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_writer_from_config() {
        let dir = tempdir().unwrap();

        let config = LoggingConfig::default();
        assert!(EventWriter::from_config(&config).unwrap().is_none());

        let config = LoggingConfig {
            event_dir: Some(dir.path().join("events")),
            ..LoggingConfig::default()
        };
        let mut writer = EventWriter::from_config(&config).unwrap().unwrap();
        writer.add_scalar("lr", 0.5, 3).unwrap();
        writer.flush().unwrap();

        let data = load_scalars_from_tfevents(dir.path().join("events")).unwrap();
        assert_eq!(data[&3]["lr"], 0.5);
    }

    #[test]
    fn test_add_scalar_rejects_unrepresentable_step() {
        let dir = tempdir().unwrap();
        let mut writer = EventWriter::create(dir.path()).unwrap();
        let err = writer.add_scalar("loss", 1.0, u64::MAX).unwrap_err();
        assert!(matches!(err, Error::CounterOverflow { .. }));
    }
}
