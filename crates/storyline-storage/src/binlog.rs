//! Action Binlog
//!
//! A durable log of pending user-initiated operations (send, edit, delete,
//! mark-read, expiring-reload). Each operation appends an event before its
//! RPC is issued and erases it once the server has answered, so a crash in
//! between leaves the event behind for replay on the next start.
//!
//! ## File format
//!
//! A sequence of CRC-checked entries:
//!
//! ```text
//! ┌───────────┬──────────┬──────────┬──────────┬────────────┬─────────┐
//! │ Entry Len │ CRC32    │ Event Id │ Kind     │ Created At │ Payload │
//! │ (4 bytes) │(4 bytes) │(8 bytes) │(4 bytes) │ (8 bytes)  │(N bytes)│
//! └───────────┴──────────┴──────────┴──────────┴────────────┴─────────┘
//! ```
//!
//! Kind 0 is reserved for erase markers whose payload is the erased event
//! id. Re-appending an entry with an existing id rewrites that event in
//! place, which is how an in-flight edit replaces its own log event.
//!
//! On open the file is scanned (corrupted or truncated tails are dropped
//! with a warning), markers are applied, and the surviving events are
//! compacted into a fresh file.

use crate::error::Result;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const ENTRY_HEADER_LEN: usize = 4 + 8 + 4 + 8;
const ERASE_KIND: u32 = 0;

/// A live (not yet erased) binlog event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEvent {
    pub id: u64,
    pub kind: u32,
    pub data: Bytes,
}

struct BinlogInner {
    file: File,
    next_event_id: u64,
    live: BTreeMap<u64, (u32, Bytes)>,
}

/// Append-only log with rewrite-in-place and erase, compacted on open.
pub struct Binlog {
    path: PathBuf,
    inner: Mutex<BinlogInner>,
}

impl Binlog {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let (live, next_event_id, total_entries) = match tokio::fs::read(&path).await {
            Ok(data) => scan(&data),
            Err(e) if e.kind() == ErrorKind::NotFound => (BTreeMap::new(), 1, 0),
            Err(e) => return Err(e.into()),
        };

        // Compact: the erased majority of a long-lived log never comes back.
        let tmp_path = path.with_extension("binlog.tmp");
        {
            let mut tmp = File::create(&tmp_path).await?;
            for (id, (kind, data)) in &live {
                tmp.write_all(&encode_entry(*id, *kind, data)).await?;
            }
            tmp.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &path).await?;

        let file = OpenOptions::new().append(true).open(&path).await?;

        info!(
            path = %path.display(),
            live = live.len(),
            scanned = total_entries,
            "binlog opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(BinlogInner {
                file,
                next_event_id,
                live,
            }),
        })
    }

    /// Appends a new event and returns its id. `kind` must be non-zero.
    pub async fn add(&self, kind: u32, data: &[u8]) -> Result<u64> {
        debug_assert_ne!(kind, ERASE_KIND);
        let mut inner = self.inner.lock().await;
        let id = inner.next_event_id;
        inner.next_event_id += 1;
        inner.file.write_all(&encode_entry(id, kind, data)).await?;
        inner.file.sync_data().await?;
        inner.live.insert(id, (kind, Bytes::copy_from_slice(data)));
        debug!(event_id = id, kind, len = data.len(), "binlog event added");
        Ok(id)
    }

    /// Replaces the payload of an existing event, keeping its id.
    pub async fn rewrite(&self, id: u64, kind: u32, data: &[u8]) -> Result<()> {
        debug_assert_ne!(kind, ERASE_KIND);
        let mut inner = self.inner.lock().await;
        inner.file.write_all(&encode_entry(id, kind, data)).await?;
        inner.file.sync_data().await?;
        inner.live.insert(id, (kind, Bytes::copy_from_slice(data)));
        debug!(event_id = id, kind, "binlog event rewritten");
        Ok(())
    }

    /// Erases an event. Erasing id 0 or an unknown id is a no-op.
    pub async fn erase(&self, id: u64) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if inner.live.remove(&id).is_none() {
            return Ok(());
        }
        let marker = id.to_le_bytes();
        inner
            .file
            .write_all(&encode_entry(id, ERASE_KIND, &marker))
            .await?;
        inner.file.sync_data().await?;
        debug!(event_id = id, "binlog event erased");
        Ok(())
    }

    /// Snapshot of the live events in id order.
    pub async fn events(&self) -> Vec<BinlogEvent> {
        let inner = self.inner.lock().await;
        inner
            .live
            .iter()
            .map(|(id, (kind, data))| BinlogEvent {
                id: *id,
                kind: *kind,
                data: data.clone(),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_entry(id: u64, kind: u32, data: &[u8]) -> Vec<u8> {
    let created_at = chrono::Utc::now().timestamp_millis();
    let entry_len = (ENTRY_HEADER_LEN + data.len()) as u32;

    let mut body = Vec::with_capacity(ENTRY_HEADER_LEN + data.len());
    body.extend_from_slice(&id.to_le_bytes());
    body.extend_from_slice(&kind.to_le_bytes());
    body.extend_from_slice(&created_at.to_le_bytes());
    body.extend_from_slice(data);

    let mut crc = crc32fast::Hasher::new();
    crc.update(&body);
    let checksum = crc.finalize();

    let mut entry = Vec::with_capacity(8 + body.len());
    entry.extend_from_slice(&entry_len.to_le_bytes());
    entry.extend_from_slice(&checksum.to_le_bytes());
    entry.extend_from_slice(&body);
    entry
}

fn scan(data: &[u8]) -> (BTreeMap<u64, (u32, Bytes)>, u64, usize) {
    let mut live = BTreeMap::new();
    let mut max_id = 0u64;
    let mut total = 0usize;
    let mut pos = 0usize;

    while pos + 8 <= data.len() {
        let entry_len =
            u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let stored_crc = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        let body_start = pos + 8;
        if entry_len < ENTRY_HEADER_LEN || body_start + entry_len > data.len() {
            warn!(offset = pos, "partial binlog entry at end of file, dropping tail");
            break;
        }
        let body = &data[body_start..body_start + entry_len];

        let mut crc = crc32fast::Hasher::new();
        crc.update(body);
        if crc.finalize() != stored_crc {
            warn!(offset = pos, "corrupted binlog entry, dropping tail");
            break;
        }

        let id = u64::from_le_bytes([
            body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
        ]);
        let kind = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
        let payload = &body[ENTRY_HEADER_LEN..];

        if kind == ERASE_KIND {
            if payload.len() == 8 {
                let erased = u64::from_le_bytes([
                    payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
                    payload[6], payload[7],
                ]);
                live.remove(&erased);
            }
        } else {
            live.insert(id, (kind, Bytes::copy_from_slice(payload)));
        }
        max_id = max_id.max(id);
        total += 1;
        pos = body_start + entry_len;
    }

    (live, max_id + 1, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_in(dir: &TempDir) -> Binlog {
        Binlog::open(dir.path().join("actions.binlog")).await.unwrap()
    }

    #[tokio::test]
    async fn add_erase_and_reopen() {
        let dir = TempDir::new().unwrap();
        let binlog = open_in(&dir).await;

        let a = binlog.add(4, b"send").await.unwrap();
        let b = binlog.add(5, b"edit").await.unwrap();
        assert!(a < b);
        binlog.erase(a).await.unwrap();

        let events = binlog.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, b);
        assert_eq!(events[0].kind, 5);
        assert_eq!(events[0].data.as_ref(), b"edit");

        drop(binlog);
        let binlog = open_in(&dir).await;
        let events = binlog.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, b);

        // Ids keep increasing after a restart.
        let c = binlog.add(4, b"again").await.unwrap();
        assert!(c > b);
    }

    #[tokio::test]
    async fn rewrite_keeps_the_id() {
        let dir = TempDir::new().unwrap();
        let binlog = open_in(&dir).await;

        let id = binlog.add(5, b"v1").await.unwrap();
        binlog.rewrite(id, 5, b"v2").await.unwrap();

        let events = binlog.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].data.as_ref(), b"v2");

        drop(binlog);
        let binlog = open_in(&dir).await;
        let events = binlog.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_ref(), b"v2");
    }

    #[tokio::test]
    async fn erase_of_unknown_id_is_noop() {
        let dir = TempDir::new().unwrap();
        let binlog = open_in(&dir).await;
        binlog.erase(0).await.unwrap();
        binlog.erase(99).await.unwrap();
        assert!(binlog.is_empty().await);
    }

    #[tokio::test]
    async fn corrupted_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actions.binlog");
        let binlog = Binlog::open(&path).await.unwrap();
        let id = binlog.add(4, b"keep").await.unwrap();
        binlog.add(4, b"mangle-me").await.unwrap();
        drop(binlog);

        // Flip a byte in the last entry's payload.
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let binlog = Binlog::open(&path).await.unwrap();
        let events = binlog.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].data.as_ref(), b"keep");
    }

    #[tokio::test]
    async fn compaction_shrinks_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actions.binlog");
        let binlog = Binlog::open(&path).await.unwrap();
        for _ in 0..50 {
            let id = binlog.add(2, b"read-stories").await.unwrap();
            binlog.erase(id).await.unwrap();
        }
        let keep = binlog.add(2, b"still-pending").await.unwrap();
        drop(binlog);

        let before = std::fs::metadata(&path).unwrap().len();
        let binlog = Binlog::open(&path).await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);
        assert_eq!(binlog.events().await[0].id, keep);
    }
}
