// src/replay.rs

//! Append-only notification replay log.
//!
//! One log per replay-enabled module. Each record is a single line,
//! `{crc32_hex}|{json}`, fsynced after every append so a crash never loses
//! an acknowledged notification. Reading stops at the first corrupted
//! record.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Layout;
use crate::error::Result;
use crate::tree::Forest;

/// One replayed notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub timestamp: DateTime<Utc>,
    pub notif: Forest,
}

/// Append a notification to a module's replay log and fsync.
pub fn append(layout: &Layout, module: &str, record: &ReplayRecord) -> Result<()> {
    let path = layout.notif_file(module);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

    let json = serde_json::to_string(record)?;
    let crc = crc32fast::hash(json.as_bytes());
    writeln!(file, "{crc:08x}|{json}")?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Read all valid records of a module's replay log, in append order.
pub fn read_all(layout: &Layout, module: &str) -> Result<Vec<ReplayRecord>> {
    let path = layout.notif_file(module);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(&path)?);
    let mut records = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let Some((crc_hex, json)) = line.split_once('|') else {
            warn!(module, line = line_num + 1, "malformed replay record");
            break;
        };
        let Ok(expected) = u32::from_str_radix(crc_hex, 16) else {
            warn!(module, line = line_num + 1, "invalid replay checksum");
            break;
        };
        if crc32fast::hash(json.as_bytes()) != expected {
            // Torn tail after a crash; everything before it is intact.
            warn!(module, line = line_num + 1, "replay checksum mismatch, truncating");
            break;
        }
        records.push(serde_json::from_str(json)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DataNode;
    use tempfile::TempDir;

    fn layout() -> (TempDir, Layout) {
        let dir = TempDir::new().unwrap();
        let layout = Layout::with_shm_dir(dir.path().join("repo"), dir.path().join("shm")).unwrap();
        layout.ensure_dirs().unwrap();
        (dir, layout)
    }

    fn record(ts: i64) -> ReplayRecord {
        ReplayRecord {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            notif: vec![DataNode::leaf("alarms", "event", "link-down")],
        }
    }

    #[test]
    fn test_append_and_read_in_order() {
        let (_dir, layout) = layout();
        append(&layout, "alarms", &record(100)).unwrap();
        append(&layout, "alarms", &record(200)).unwrap();

        let records = read_all(&layout, "alarms").unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].timestamp < records[1].timestamp);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let (_dir, layout) = layout();
        assert!(read_all(&layout, "alarms").unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_tail_truncates() {
        let (_dir, layout) = layout();
        append(&layout, "alarms", &record(100)).unwrap();

        // Simulate a torn write.
        let path = layout.notif_file("alarms");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "deadbeef|{{\"truncated").unwrap();

        let records = read_all(&layout, "alarms").unwrap();
        assert_eq!(records.len(), 1);
    }
}
