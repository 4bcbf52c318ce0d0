//! Capped, crash-safe local log of every record not yet confirmed by the sink.
//!
//! The log is a JSON array of [`BufferedRecord`]s rewritten atomically on
//! every mutation, so a record is on disk by the time [`DurableBuffer::append`]
//! returns. Capacity pressure evicts the oldest records and never fails the
//! write; probing must not stop because telemetry is backing up.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::models::{BufferedRecord, TelemetryRecord};
use super::utils::write_atomically;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("buffer I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize buffer: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Counters surfaced as the buffer's health signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferHealth {
    pub len: usize,
    pub capacity: usize,
    /// Records evicted to respect the capacity.
    pub evicted: u64,
    /// Records dropped after exhausting their delivery attempts.
    pub dropped: u64,
    /// Times an unparseable log was set aside and replaced by an empty one.
    pub corrupt_recoveries: u64,
    pub write_failures: u64,
}

impl BufferHealth {
    pub fn is_degraded(&self) -> bool {
        self.corrupt_recoveries > 0 || self.write_failures > 0
    }

    pub fn data_loss(&self) -> u64 {
        self.evicted + self.dropped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Retained { attempts: u32 },
    Dropped { attempts: u32 },
    NotFound,
}

pub struct DurableBuffer {
    path: PathBuf,
    capacity: usize,
    records: Vec<BufferedRecord>,
    health: BufferHealth,
}

pub type SharedBuffer = Arc<Mutex<DurableBuffer>>;

/// Locks a shared buffer. A panic while holding the lock leaves the log
/// consistent on disk, so poisoning is ignored.
pub fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, DurableBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DurableBuffer {
    /// Opens the log at `path`. Never fails: a missing file is an empty
    /// buffer, an unreadable one is set aside and reported through
    /// [`BufferHealth::corrupt_recoveries`].
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let capacity = capacity.max(1);
        let mut buffer = Self {
            path,
            capacity,
            records: Vec::new(),
            health: BufferHealth {
                capacity,
                ..BufferHealth::default()
            },
        };

        match std::fs::read(&buffer.path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<BufferedRecord>>(&bytes) {
                Ok(records) => {
                    buffer.records = records;
                    let excess = buffer.records.len().saturating_sub(capacity);
                    if excess > 0 {
                        buffer.evict_oldest(excess);
                        buffer.persist_logged();
                    }
                    debug!(path = ?buffer.path, records = buffer.records.len(), "Loaded buffered records.");
                }
                Err(e) => {
                    error!(path = ?buffer.path, error = %e, "Buffer file is corrupt; continuing with an empty buffer.");
                    buffer.set_aside_corrupt_file();
                    buffer.health.corrupt_recoveries += 1;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(path = ?buffer.path, error = %e, "Failed to read buffer file; continuing with an empty buffer.");
                buffer.health.corrupt_recoveries += 1;
            }
        }
        buffer
    }

    fn set_aside_corrupt_file(&self) {
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{}", Utc::now().timestamp()));
        if let Err(e) = std::fs::rename(&self.path, &aside) {
            warn!(path = ?self.path, error = %e, "Failed to move corrupt buffer file aside.");
        } else {
            warn!(path = ?aside, "Corrupt buffer file preserved for inspection.");
        }
    }

    /// Appends `record` and persists before returning.
    ///
    /// On an I/O error the record is kept in memory and written with the next
    /// successful persist; the error is returned for the caller to log.
    pub fn append(&mut self, record: TelemetryRecord) -> Result<Uuid, BufferError> {
        if self.records.len() >= self.capacity {
            let excess = self.records.len() + 1 - self.capacity;
            self.evict_oldest(excess);
        }

        let id = Uuid::new_v4();
        let enqueued_at = self.next_enqueue_time();
        self.records.push(BufferedRecord {
            id,
            enqueued_at,
            delivery_attempts: 0,
            record,
        });
        self.persist()?;
        Ok(id)
    }

    /// Enqueue times never go backwards, so enqueue order survives a wall
    /// clock step.
    fn next_enqueue_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.records.last() {
            Some(last) if last.enqueued_at > now => last.enqueued_at,
            _ => now,
        }
    }

    fn evict_oldest(&mut self, count: usize) {
        let count = count.min(self.records.len());
        for evicted in self.records.drain(..count) {
            warn!(
                id = %evicted.id,
                kind = evicted.record.label(),
                enqueued_at = %evicted.enqueued_at,
                "Buffer at capacity; evicting oldest record."
            );
        }
        self.health.evicted += count as u64;
    }

    /// Unconfirmed records in ascending `enqueued_at` order.
    pub fn list_unconfirmed(&self) -> Vec<BufferedRecord> {
        let mut records = self.records.clone();
        records.sort_by_key(|r| r.enqueued_at);
        records
    }

    pub fn get(&self, id: Uuid) -> Option<&BufferedRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Removes a delivered record. Returns whether it was present.
    pub fn mark_delivered(&mut self, id: Uuid) -> Result<bool, BufferError> {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        if self.records.len() == before {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Counts a failed delivery. A record that reaches `max_attempts` is
    /// dropped and counted as lost.
    pub fn record_failed_attempt(
        &mut self,
        id: Uuid,
        max_attempts: u32,
    ) -> Result<AttemptOutcome, BufferError> {
        let Some(index) = self.records.iter().position(|r| r.id == id) else {
            return Ok(AttemptOutcome::NotFound);
        };
        let attempts = {
            let record = &mut self.records[index];
            record.delivery_attempts += 1;
            record.delivery_attempts
        };

        let outcome = if attempts >= max_attempts.max(1) {
            let dropped = self.records.remove(index);
            self.health.dropped += 1;
            warn!(
                id = %dropped.id,
                kind = dropped.record.label(),
                attempts,
                "Giving up on record after repeated delivery failures."
            );
            AttemptOutcome::Dropped { attempts }
        } else {
            AttemptOutcome::Retained { attempts }
        };
        self.persist()?;
        Ok(outcome)
    }

    /// Rewrites the log from memory.
    pub fn flush(&mut self) -> Result<(), BufferError> {
        self.persist()
    }

    fn persist(&mut self) -> Result<(), BufferError> {
        let result = serde_json::to_vec_pretty(&self.records)
            .map_err(BufferError::from)
            .and_then(|bytes| {
                write_atomically(&self.path, &bytes).map_err(|source| BufferError::Io {
                    path: self.path.clone(),
                    source,
                })
            });
        if result.is_err() {
            self.health.write_failures += 1;
        }
        result
    }

    fn persist_logged(&mut self) {
        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to persist buffer.");
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn health(&self) -> BufferHealth {
        BufferHealth {
            len: self.records.len(),
            ..self.health.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_modules::models::{CheckResult, StatusChangeEvent};
    use chrono::TimeZone;

    fn check(minute: u32) -> TelemetryRecord {
        TelemetryRecord::Check(CheckResult::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, minute, 0).unwrap(),
            "house1",
            vec![],
        ))
    }

    fn minute_of(record: &BufferedRecord) -> u32 {
        use chrono::Timelike;
        record.record.timestamp().minute()
    }

    #[test]
    fn test_append_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");

        let id = {
            let mut buffer = DurableBuffer::open(&path, 10);
            buffer.append(check(1)).unwrap()
            // dropped without any shutdown path
        };

        let reopened = DurableBuffer::open(&path, 10);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.list_unconfirmed()[0].id, id);
        assert_eq!(reopened.list_unconfirmed()[0].record, check(1));
    }

    #[test]
    fn test_capacity_evicts_exactly_one_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = DurableBuffer::open(dir.path().join("buffer.json"), 3);
        for m in 0..3 {
            buffer.append(check(m)).unwrap();
        }
        assert_eq!(buffer.len(), 3);

        buffer.append(check(3)).unwrap();
        assert_eq!(buffer.len(), 3);
        let minutes: Vec<u32> = buffer.list_unconfirmed().iter().map(minute_of).collect();
        assert_eq!(minutes, vec![1, 2, 3]);
        assert_eq!(buffer.health().evicted, 1);
        assert_eq!(buffer.health().data_loss(), 1);
    }

    #[test]
    fn test_reopen_with_smaller_capacity_trims_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        {
            let mut buffer = DurableBuffer::open(&path, 5);
            for m in 0..5 {
                buffer.append(check(m)).unwrap();
            }
        }
        let buffer = DurableBuffer::open(&path, 2);
        let minutes: Vec<u32> = buffer.list_unconfirmed().iter().map(minute_of).collect();
        assert_eq!(minutes, vec![3, 4]);
        assert_eq!(buffer.health().evicted, 3);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        std::fs::write(&path, "[{ this is not json").unwrap();

        let mut buffer = DurableBuffer::open(&path, 10);
        assert!(buffer.is_empty());
        assert_eq!(buffer.health().corrupt_recoveries, 1);
        assert!(buffer.health().is_degraded());

        let aside = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(aside);

        buffer.append(check(1)).unwrap();
        assert_eq!(DurableBuffer::open(&path, 10).len(), 1);
    }

    #[test]
    fn test_mark_delivered_and_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        let mut buffer = DurableBuffer::open(&path, 10);
        let a = buffer.append(check(1)).unwrap();
        let b = buffer
            .append(TelemetryRecord::StatusChange(StatusChangeEvent::OutageStart {
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 2, 0).unwrap(),
                location_id: "house1".into(),
            }))
            .unwrap();
        let c = buffer.append(check(3)).unwrap();

        let order: Vec<Uuid> = buffer.list_unconfirmed().iter().map(|r| r.id).collect();
        assert_eq!(order, vec![a, b, c]);

        assert!(buffer.mark_delivered(b).unwrap());
        assert!(!buffer.mark_delivered(b).unwrap());
        let order: Vec<Uuid> = DurableBuffer::open(&path, 10)
            .list_unconfirmed()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(order, vec![a, c]);
    }

    #[test]
    fn test_failed_attempts_drop_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = DurableBuffer::open(dir.path().join("buffer.json"), 10);
        let id = buffer.append(check(1)).unwrap();

        assert_eq!(
            buffer.record_failed_attempt(id, 3).unwrap(),
            AttemptOutcome::Retained { attempts: 1 }
        );
        assert_eq!(
            buffer.record_failed_attempt(id, 3).unwrap(),
            AttemptOutcome::Retained { attempts: 2 }
        );
        assert_eq!(buffer.get(id).map(|r| r.delivery_attempts), Some(2));
        assert_eq!(
            buffer.record_failed_attempt(id, 3).unwrap(),
            AttemptOutcome::Dropped { attempts: 3 }
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.health().dropped, 1);
        assert_eq!(
            buffer.record_failed_attempt(id, 3).unwrap(),
            AttemptOutcome::NotFound
        );
    }

    #[test]
    fn test_write_failure_keeps_record_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("buffer.json");
        std::fs::create_dir(&path).unwrap();

        let mut buffer = DurableBuffer::open(&path, 10);
        assert!(buffer.append(check(1)).is_err());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.health().write_failures, 1);
    }
}
