//! Counter persistence.
//!
//! A store owns one [`CounterRecord`] per (key, segment). Every mutation is
//! applied under the store lock, so concurrent callers never observe the
//! same value twice for one counter.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SequenceError;

/// Identity of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey {
    pub key: String,
    pub segment: Option<String>,
}

impl CounterKey {
    pub fn new(key: impl Into<String>, segment: Option<&str>) -> Self {
        Self {
            key: key.into(),
            segment: segment.map(str::to_string),
        }
    }

    pub fn unsegmented(key: impl Into<String>) -> Self {
        Self::new(key, None)
    }
}

/// Persisted state of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub key: String,
    pub segment: Option<String>,
    /// Pattern fixed when the counter was created.
    pub pattern: String,
    pub current_value: i64,
    pub last_advanced_at: DateTime<Utc>,
    /// Bumped by the store on every persisted change.
    #[serde(default)]
    pub version: u64,
}

impl CounterRecord {
    pub fn new(key: &CounterKey, pattern: impl Into<String>, current_value: i64, now: DateTime<Utc>) -> Self {
        Self {
            key: key.key.clone(),
            segment: key.segment.clone(),
            pattern: pattern.into(),
            current_value,
            last_advanced_at: now,
            version: 0,
        }
    }

    pub fn counter_key(&self) -> CounterKey {
        CounterKey {
            key: self.key.clone(),
            segment: self.segment.clone(),
        }
    }

    /// Optionally reset, then step to `max(current, initial) + 1`.
    ///
    /// Only touches the in-memory copy; `version` is left to the store. An
    /// exhausted counter is left unchanged.
    pub fn advance(
        &mut self,
        force_reset_to: Option<i64>,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, SequenceError> {
        let base = force_reset_to.unwrap_or(self.current_value);
        let next = base.max(initial_value).checked_add(1).ok_or_else(|| {
            SequenceError::Storage(format!(
                "counter {}/{} exhausted at {}",
                self.key,
                self.segment.as_deref().unwrap_or("-"),
                base
            ))
        })?;
        if let Some(reset_to) = force_reset_to {
            info!(
                key = %self.key,
                segment = ?self.segment,
                from = self.current_value,
                to = reset_to,
                "resetting counter"
            );
        }
        self.current_value = next;
        self.last_advanced_at = now;
        Ok(next)
    }
}

/// Durable home of counter records.
pub trait CounterStore: Send + Sync {
    fn get(&self, key: &CounterKey) -> Result<Option<CounterRecord>, SequenceError>;

    /// Fetch the counter, creating it with the given defaults if absent.
    /// Concurrent creations of one key collapse into a single record.
    fn get_or_create(
        &self,
        key: &CounterKey,
        default_pattern: &str,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<CounterRecord, SequenceError>;

    /// Atomically reset (optionally) and advance `record`, returning the new value.
    ///
    /// When the stored version no longer matches `record.version` a competing
    /// advance has run since `record` was read. Without a forced reset the
    /// stored value is advanced. With one, nothing changes and `Conflict` is
    /// returned: the reset decision was taken against an outdated
    /// `last_advanced_at` and has to be made again on a fresh read.
    fn advance(
        &self,
        record: &CounterRecord,
        force_reset_to: Option<i64>,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, SequenceError>;

    /// Persist records advanced elsewhere, all or nothing.
    ///
    /// Each record's `version` must equal the stored one, otherwise nothing is
    /// written and `Conflict` names the first stale counter.
    fn save(&self, records: &[CounterRecord]) -> Result<(), SequenceError>;

    /// Snapshot ordered by key, then segment.
    fn records(&self) -> Result<Vec<CounterRecord>, SequenceError>;
}

#[derive(Debug, Default)]
struct CounterTable {
    counters: HashMap<CounterKey, CounterRecord>,
}

impl CounterTable {
    fn from_records(records: Vec<CounterRecord>) -> Self {
        let counters = records.into_iter().map(|r| (r.counter_key(), r)).collect();
        Self { counters }
    }

    fn sorted(&self) -> Vec<CounterRecord> {
        let mut records: Vec<CounterRecord> = self.counters.values().cloned().collect();
        records.sort_by(|a, b| (&a.key, &a.segment).cmp(&(&b.key, &b.segment)));
        records
    }

    /// Returns the record and whether it has to be inserted.
    fn plan_get_or_create(
        &self,
        key: &CounterKey,
        default_pattern: &str,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> (CounterRecord, bool) {
        match self.counters.get(key) {
            Some(existing) => (existing.clone(), false),
            None => {
                debug!(key = %key.key, segment = ?key.segment, pattern = default_pattern, "creating counter");
                (CounterRecord::new(key, default_pattern, initial_value, now), true)
            }
        }
    }

    fn plan_advance(
        &self,
        record: &CounterRecord,
        force_reset_to: Option<i64>,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<(CounterRecord, i64), SequenceError> {
        let key = record.counter_key();
        let mut stored = self
            .counters
            .get(&key)
            .cloned()
            .ok_or_else(|| SequenceError::Storage(format!("counter {}/{:?} does not exist", key.key, key.segment)))?;

        if stored.version != record.version {
            if force_reset_to.is_some() {
                warn!(
                    key = %key.key,
                    segment = ?key.segment,
                    seen = record.version,
                    stored = stored.version,
                    "reset requested on a stale read"
                );
                return Err(SequenceError::Conflict {
                    key: key.key,
                    segment: key.segment,
                });
            }
            debug!(
                key = %key.key,
                segment = ?key.segment,
                seen = record.version,
                stored = stored.version,
                "counter advanced concurrently, continuing from stored value"
            );
        }

        let value = stored.advance(force_reset_to, initial_value, now)?;
        stored.version += 1;
        debug!(key = %key.key, segment = ?key.segment, value, "advanced counter");
        Ok((stored, value))
    }

    fn plan_save(&self, records: &[CounterRecord]) -> Result<Vec<CounterRecord>, SequenceError> {
        let mut planned = Vec::with_capacity(records.len());
        for record in records {
            let key = record.counter_key();
            let stored_version = self.counters.get(&key).map(|r| r.version);
            match stored_version {
                Some(v) if v != record.version => {
                    warn!(key = %key.key, segment = ?key.segment, seen = record.version, stored = v, "stale save rejected");
                    return Err(SequenceError::Conflict {
                        key: key.key,
                        segment: key.segment,
                    });
                }
                Some(_) => {
                    let mut next = record.clone();
                    next.version += 1;
                    planned.push(next);
                }
                None => planned.push(record.clone()),
            }
        }
        Ok(planned)
    }

    fn put(&mut self, record: CounterRecord) -> Option<CounterRecord> {
        self.counters.insert(record.counter_key(), record)
    }

    fn restore(&mut self, key: &CounterKey, previous: Option<CounterRecord>) {
        match previous {
            Some(p) => {
                self.counters.insert(key.clone(), p);
            }
            None => {
                self.counters.remove(key);
            }
        }
    }
}

fn lock(table: &Mutex<CounterTable>) -> Result<MutexGuard<'_, CounterTable>, SequenceError> {
    table
        .lock()
        .map_err(|e| SequenceError::Storage(format!("lock poisoned: {}", e)))
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    table: Mutex<CounterTable>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        // Counting is read-only, so a poisoned table is still safe to inspect.
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, key: &CounterKey) -> Result<Option<CounterRecord>, SequenceError> {
        Ok(lock(&self.table)?.counters.get(key).cloned())
    }

    fn get_or_create(
        &self,
        key: &CounterKey,
        default_pattern: &str,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<CounterRecord, SequenceError> {
        let mut table = lock(&self.table)?;
        let (record, created) = table.plan_get_or_create(key, default_pattern, initial_value, now);
        if created {
            table.put(record.clone());
        }
        Ok(record)
    }

    fn advance(
        &self,
        record: &CounterRecord,
        force_reset_to: Option<i64>,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, SequenceError> {
        let mut table = lock(&self.table)?;
        let (next, value) = table.plan_advance(record, force_reset_to, initial_value, now)?;
        table.put(next);
        Ok(value)
    }

    fn save(&self, records: &[CounterRecord]) -> Result<(), SequenceError> {
        let mut table = lock(&self.table)?;
        for record in table.plan_save(records)? {
            table.put(record);
        }
        Ok(())
    }

    fn records(&self) -> Result<Vec<CounterRecord>, SequenceError> {
        Ok(lock(&self.table)?.sorted())
    }
}

/// Current on-disk layout version.
pub const STORE_FILE_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u16,
    counters: Vec<CounterRecord>,
}

/// A store persisted as one JSON document, rewritten after every change.
///
/// Writes go to a sibling temp file that is renamed over the target. A failed
/// write leaves both the file and the in-memory table as they were.
#[derive(Debug)]
pub struct FileCounterStore {
    path: PathBuf,
    table: Mutex<CounterTable>,
}

impl FileCounterStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SequenceError> {
        let path = path.into();
        let table = if path.exists() {
            let file: StoreFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if file.version != STORE_FILE_VERSION {
                return Err(SequenceError::Storage(format!(
                    "unsupported store version {} in {}",
                    file.version,
                    path.display()
                )));
            }
            CounterTable::from_records(file.counters)
        } else {
            CounterTable::default()
        };
        debug!(path = %path.display(), counters = table.counters.len(), "opened counter store");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn flush(&self, table: &CounterTable) -> Result<(), SequenceError> {
        let file = StoreFile {
            version: STORE_FILE_VERSION,
            counters: table.sorted(),
        };
        let data = serde_json::to_string_pretty(&file)?;
        let tmp = self.temp_path();
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Insert `records`, flush, and roll the table back if the flush fails.
    fn commit(&self, table: &mut CounterTable, records: Vec<CounterRecord>) -> Result<(), SequenceError> {
        let mut previous = Vec::with_capacity(records.len());
        for record in records {
            let key = record.counter_key();
            previous.push((key, table.put(record)));
        }
        if let Err(err) = self.flush(table) {
            for (key, prev) in previous.into_iter().rev() {
                table.restore(&key, prev);
            }
            return Err(err);
        }
        Ok(())
    }
}

impl CounterStore for FileCounterStore {
    fn get(&self, key: &CounterKey) -> Result<Option<CounterRecord>, SequenceError> {
        Ok(lock(&self.table)?.counters.get(key).cloned())
    }

    fn get_or_create(
        &self,
        key: &CounterKey,
        default_pattern: &str,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<CounterRecord, SequenceError> {
        let mut table = lock(&self.table)?;
        let (record, created) = table.plan_get_or_create(key, default_pattern, initial_value, now);
        if created {
            self.commit(&mut table, vec![record.clone()])?;
        }
        Ok(record)
    }

    fn advance(
        &self,
        record: &CounterRecord,
        force_reset_to: Option<i64>,
        initial_value: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, SequenceError> {
        let mut table = lock(&self.table)?;
        let (next, value) = table.plan_advance(record, force_reset_to, initial_value, now)?;
        self.commit(&mut table, vec![next])?;
        Ok(value)
    }

    fn save(&self, records: &[CounterRecord]) -> Result<(), SequenceError> {
        let mut table = lock(&self.table)?;
        let planned = table.plan_save(records)?;
        self.commit(&mut table, planned)
    }

    fn records(&self) -> Result<Vec<CounterRecord>, SequenceError> {
        Ok(lock(&self.table)?.sorted())
    }
}
