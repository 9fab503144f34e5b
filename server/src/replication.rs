//! Replication handler of the reference server.
//!
//! Documents are acknowledged with a small status reply; file parts are
//! written into the trace store directory at their segment offset, so a
//! peer can stream one file across many frames in any order.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tracing::debug;

use daqhist_session::ReplicationHandler;
use daqhist_wire::{AccessOptions, FilePartHeader};

/// Replication handler writing inbound data under the store root.
pub struct ReplicationSink {
    root: PathBuf,
}

impl ReplicationSink {
    /// Create a sink rooted at the trace store directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn checked_name(name: &str) -> anyhow::Result<&str> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        bail!("invalid name {name:?}");
    }
    Ok(name)
}

impl ReplicationHandler for ReplicationSink {
    fn on_document(&self, doc: Value, attachment: Option<&[u8]>) -> anyhow::Result<Value> {
        let op = doc.get("op").and_then(Value::as_str).unwrap_or("unknown");
        debug!(op, attachment_bytes = attachment.map_or(0, <[u8]>::len), "replication document");
        Ok(json!({
            "ok": true,
            "op": op,
            "attachment_bytes": attachment.map_or(0, <[u8]>::len),
        }))
    }

    fn on_file_part(&self, header: FilePartHeader, data: &[u8]) -> anyhow::Result<()> {
        let shot = checked_name(&header.shot_name)?;
        let file_name = checked_name(&header.file_name)?;

        let dir = self.root.join(shot);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;

        let path = dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {path:?}"))?;
        file.write_all_at(data, header.seg_offset as u64)
            .with_context(|| format!("writing {path:?} at {}", header.seg_offset))?;

        let volatile = AccessOptions::from_bits_truncate(header.access_options)
            .contains(AccessOptions::VOLATILE);
        debug!(
            shot,
            file = file_name,
            offset = header.seg_offset,
            bytes = data.len(),
            volatile,
            "file part stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_parts_assemble_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ReplicationSink::new(dir.path());

        let header = |offset: i64| FilePartHeader {
            shot_name: "SHOT1".into(),
            file_name: "raw.dat".into(),
            access_options: 0,
            full_size: 8,
            seg_offset: offset,
        };
        sink.on_file_part(header(4), &[5, 6, 7, 8]).unwrap();
        sink.on_file_part(header(0), &[1, 2, 3, 4]).unwrap();

        let written = std::fs::read(dir.path().join("SHOT1/raw.dat")).unwrap();
        assert_eq!(written, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ReplicationSink::new(dir.path());

        let header = FilePartHeader {
            shot_name: "..".into(),
            file_name: "raw.dat".into(),
            access_options: 0,
            full_size: 1,
            seg_offset: 0,
        };
        assert!(sink.on_file_part(header, &[0]).is_err());
    }

    #[test]
    fn test_document_ack() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ReplicationSink::new(dir.path());

        let reply = sink
            .on_document(json!({"op": "sync"}), Some(&[0u8; 16]))
            .unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["op"], "sync");
        assert_eq!(reply["attachment_bytes"], 16);
    }
}
