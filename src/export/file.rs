//! File archive sink
//!
//! Writes each batch as `<root>/<tenant>/<first>-<last>-<receipt>.jsonl`
//! with a `.receipt.json` beside it. The receipt id keeps two exports of the
//! same id range apart. The batch file is written to a temporary name,
//! fsynced and renamed, so a crash never leaves a half-written archive under
//! the final name.

use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{events_merkle_root, AuditEvent};
use crate::error::{AuditError, Result};
use crate::export::{ExportAdapter, ExportReceipt};

pub struct FileArchiveAdapter {
    root: PathBuf,
}

impl FileArchiveAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the batch acknowledged by `receipt` is archived
    pub fn archive_path(&self, receipt: &ExportReceipt) -> PathBuf {
        self.root.join(receipt.tenant.as_str()).join(format!(
            "{:012}-{:012}-{}.jsonl",
            receipt.first_id, receipt.last_id, receipt.receipt_id
        ))
    }

    fn write_batch(path: &Path, events: &[AuditEvent]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("jsonl.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| AuditError::Io(e.into_error()))?;
        file.sync_all()?;

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Re-read an archived batch and check it against its receipt
    pub fn verify_archive(path: &Path, receipt: &ExportReceipt) -> Result<bool> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<AuditEvent>(&line)?);
        }

        let intact = events.iter().all(AuditEvent::verify_hash)
            && events.len() == receipt.event_count
            && events_merkle_root(&events).as_deref() == Some(receipt.merkle_root.as_str());
        Ok(intact)
    }
}

#[async_trait]
impl ExportAdapter for FileArchiveAdapter {
    fn name(&self) -> &str {
        "file"
    }

    async fn export_batch(&self, events: &[AuditEvent]) -> Result<ExportReceipt> {
        let receipt = ExportReceipt::for_batch(self.name(), Uuid::new_v4().to_string(), events)?;
        let path = self.archive_path(&receipt);

        Self::write_batch(&path, events).map_err(|e| match e {
            AuditError::Io(io) => AuditError::ExportUnavailable(format!(
                "failed to write archive {}: {}",
                path.display(),
                io
            )),
            other => other,
        })?;

        let receipt_path = path.with_extension("receipt.json");
        fs::write(&receipt_path, serde_json::to_vec_pretty(&receipt)?)
            .map_err(|e| AuditError::ExportUnavailable(format!("failed to write receipt: {}", e)))?;

        debug!("Archived batch to {}", path.display());
        info!(
            tenant = %receipt.tenant,
            first_id = receipt.first_id,
            last_id = receipt.last_id,
            receipt_id = %receipt.receipt_id,
            "Exported audit batch to file archive"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{NewAuditEvent, TenantId};
    use tempfile::TempDir;

    fn batch(tenant: &str, ids: std::ops::RangeInclusive<i64>) -> Vec<AuditEvent> {
        let tenant = TenantId::new(tenant).unwrap();
        let mut previous: Option<String> = None;
        ids.map(|id| {
            let event = NewAuditEvent::new("access", "alice", "doc", "read").seal(
                &tenant,
                id,
                previous.clone(),
            );
            previous = Some(event.current_hash.clone());
            event
        })
        .collect()
    }

    #[tokio::test]
    async fn test_export_writes_jsonl_and_receipt() {
        let dir = TempDir::new().unwrap();
        let adapter = FileArchiveAdapter::new(dir.path()).unwrap();
        let events = batch("t1", 1..=3);

        let receipt = adapter.export_batch(&events).await.unwrap();
        let path = dir
            .path()
            .join("t1")
            .join(format!("000000000001-000000000003-{}.jsonl", receipt.receipt_id));

        assert_eq!(adapter.archive_path(&receipt), path);
        assert!(path.exists());
        assert!(path.with_extension("receipt.json").exists());
        assert_eq!(receipt.event_count, 3);
        assert!(FileArchiveAdapter::verify_archive(&path, &receipt).unwrap());
    }

    #[tokio::test]
    async fn test_tampered_archive_fails_receipt_check() {
        let dir = TempDir::new().unwrap();
        let adapter = FileArchiveAdapter::new(dir.path()).unwrap();
        let events = batch("t1", 1..=2);
        let receipt = adapter.export_batch(&events).await.unwrap();

        let path = adapter.archive_path(&receipt);
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replace("alice", "mallory")).unwrap();

        assert!(!FileArchiveAdapter::verify_archive(&path, &receipt).unwrap());
    }

    #[tokio::test]
    async fn test_same_range_exported_twice_keeps_both_archives() {
        let dir = TempDir::new().unwrap();
        let adapter = FileArchiveAdapter::new(dir.path()).unwrap();
        let events = batch("t1", 1..=3);

        let first = adapter.export_batch(&events).await.unwrap();
        let second = adapter.export_batch(&events).await.unwrap();
        assert_ne!(adapter.archive_path(&first), adapter.archive_path(&second));

        for receipt in [&first, &second] {
            let path = adapter.archive_path(receipt);
            let stored: ExportReceipt =
                serde_json::from_slice(&fs::read(path.with_extension("receipt.json")).unwrap()).unwrap();
            assert_eq!(&stored, receipt);
            assert!(FileArchiveAdapter::verify_archive(&path, receipt).unwrap());
        }
        assert_eq!(fs::read_dir(dir.path().join("t1")).unwrap().count(), 4);
    }

    #[tokio::test]
    async fn test_mixed_tenant_batch_rejected() {
        let dir = TempDir::new().unwrap();
        let adapter = FileArchiveAdapter::new(dir.path()).unwrap();
        let mut events = batch("t1", 1..=1);
        events.extend(batch("t2", 2..=2));

        let result = adapter.export_batch(&events).await;
        assert!(matches!(result, Err(AuditError::ExportRejected(_))));
    }
}
