//! Per-chunk cache of section-keyed records.
//!
//! `SectionStorage` lazily decodes columns of per-section payloads,
//! keeps mutated columns in memory, and writes them back through the io
//! worker a few columns per tick, so persistence cost is spread out
//! instead of landing on a single frame.
//!
//! On disk a column is one bincode record: a magic tag, the schema
//! version, the owning chunk position, then the `(section y, payload)`
//! pairs. The position lives in the fixed-size prefix so corruption
//! recovery can match a payload back to its slot without touching the
//! section bodies.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_common::{ChunkPos, CommonError, MagicBytes, SchemaVersion, SectionPos};
use tracing::warn;

use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::io_worker::{IoWorker, LogFailureSink};
use crate::region::ChunkPosExtractor;
use crate::region_storage::RegionFileStorage;

#[derive(Deserialize)]
struct ColumnRecord<R> {
    magic: MagicBytes,
    version: SchemaVersion,
    pos: ChunkPos,
    sections: Vec<(i8, R)>,
}

#[derive(Serialize)]
struct ColumnRecordRef<'a, R> {
    magic: MagicBytes,
    version: SchemaVersion,
    pos: ChunkPos,
    sections: Vec<(i8, &'a R)>,
}

/// Header prefix shared by every column record.
#[derive(Deserialize)]
struct RecordHeader {
    magic: MagicBytes,
    version: SchemaVersion,
    pos: ChunkPos,
}

/// Reads the chunk position out of a serialized column record.
///
/// Only the fixed-size header prefix is parsed, which is what region
/// recovery needs to match a scanned payload to its slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordPosExtractor;

impl ChunkPosExtractor for RecordPosExtractor {
    fn extract(&self, payload: &[u8]) -> Option<ChunkPos> {
        let header: RecordHeader = bincode::deserialize(payload).ok()?;
        if !MagicBytes::SECTIONS.matches(header.magic.0) {
            return None;
        }
        SchemaVersion::SECTION_COLUMN
            .can_read(&header.version)
            .then_some(header.pos)
    }
}

fn encode_column<R: Serialize>(pos: ChunkPos, sections: &BTreeMap<i8, R>) -> StorageResult<Vec<u8>> {
    let record = ColumnRecordRef {
        magic: MagicBytes::SECTIONS,
        version: SchemaVersion::SECTION_COLUMN,
        pos,
        sections: sections.iter().map(|(y, value)| (*y, value)).collect(),
    };
    Ok(bincode::serialize(&record)?)
}

fn decode_column<R: DeserializeOwned>(payload: &[u8]) -> StorageResult<ColumnRecord<R>> {
    let record: ColumnRecord<R> = bincode::deserialize(payload)?;
    if !MagicBytes::SECTIONS.matches(record.magic.0) {
        return Err(CommonError::BadMagic {
            expected: MagicBytes::SECTIONS.0,
            found: record.magic.0,
        }
        .into());
    }
    if !SchemaVersion::SECTION_COLUMN.can_read(&record.version) {
        return Err(CommonError::SchemaMismatch {
            found: record.version,
            expected: SchemaVersion::SECTION_COLUMN,
        }
        .into());
    }
    Ok(record)
}

/// Record keys store the vertical section index as a single byte.
fn storable_y(pos: SectionPos) -> i8 {
    let Ok(y) = i8::try_from(pos.y) else {
        panic!("section y {} cannot be stored in a column record", pos.y);
    };
    y
}

/// Dirty-tracked cache of per-section records, one entry per chunk
/// column, backed by an [`IoWorker`].
pub struct SectionStorage<R>
where
    R: Serialize + DeserializeOwned,
{
    worker: IoWorker,
    cache: AHashMap<ChunkPos, BTreeMap<i8, R>>,
    dirty: AHashSet<ChunkPos>,
    /// Write-back order for dirty columns, oldest first.
    dirty_order: VecDeque<ChunkPos>,
    fsync_on_flush: bool,
    closed: bool,
}

impl<R> SectionStorage<R>
where
    R: Serialize + DeserializeOwned,
{
    /// Opens section storage rooted at `directory`, spawning its io
    /// worker with the corruption-recovery extractor installed.
    pub fn open(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        config: &StorageConfig,
    ) -> StorageResult<Self> {
        let storage = RegionFileStorage::new(
            directory,
            config.codec(),
            config.pool_capacity,
            Some(Arc::new(RecordPosExtractor)),
        )?;
        let worker = IoWorker::spawn(name, storage, Arc::new(LogFailureSink))?;
        Ok(Self::new(worker, config.fsync_on_synchronize))
    }

    /// Wraps an already-spawned worker.
    #[must_use]
    pub fn new(worker: IoWorker, fsync_on_flush: bool) -> Self {
        Self {
            worker,
            cache: AHashMap::new(),
            dirty: AHashSet::new(),
            dirty_order: VecDeque::new(),
            fsync_on_flush,
            closed: false,
        }
    }

    /// Returns the record stored for `pos`, loading and decoding the
    /// owning column on first touch.
    pub fn get(&mut self, pos: SectionPos) -> StorageResult<Option<&R>> {
        let column = pos.column();
        let y = storable_y(pos);
        self.ensure_column(column)?;
        Ok(self.cache.get(&column).and_then(|sections| sections.get(&y)))
    }

    /// Stores a record for `pos`, returning the one it replaced.
    pub fn set(&mut self, pos: SectionPos, value: R) -> StorageResult<Option<R>> {
        let column = pos.column();
        let y = storable_y(pos);
        self.ensure_column(column)?;
        let prior = self.cache.entry(column).or_default().insert(y, value);
        self.mark_dirty(column);
        Ok(prior)
    }

    /// Removes the record stored for `pos`, if any.
    pub fn remove(&mut self, pos: SectionPos) -> StorageResult<Option<R>> {
        let column = pos.column();
        let y = storable_y(pos);
        self.ensure_column(column)?;
        let removed = match self.cache.get_mut(&column) {
            Some(sections) => sections.remove(&y),
            None => None,
        };
        if removed.is_some() {
            self.mark_dirty(column);
        }
        Ok(removed)
    }

    /// Number of columns with unflushed mutations.
    #[must_use]
    pub fn dirty_columns(&self) -> usize {
        self.dirty.len()
    }

    /// Writes back up to `budget` dirty columns, oldest first. Returns
    /// how many were handed to the worker.
    pub fn tick(&mut self, budget: usize) -> usize {
        let mut written = 0;
        while written < budget {
            let Some(column) = self.dirty_order.pop_front() else {
                break;
            };
            self.dirty.remove(&column);
            self.submit_column(column);
            written += 1;
        }
        written
    }

    /// Writes back every dirty column, then waits for the worker to
    /// drain.
    pub fn flush_all(&mut self) -> StorageResult<()> {
        while let Some(column) = self.dirty_order.pop_front() {
            self.dirty.remove(&column);
            self.submit_column(column);
        }
        self.worker.synchronize(self.fsync_on_flush).wait_blocking()
    }

    /// Flushes everything and stops the worker. Safe to call more than
    /// once.
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.flush_all();
        self.worker.close();
        result
    }

    fn ensure_column(&mut self, column: ChunkPos) -> StorageResult<()> {
        if self.cache.contains_key(&column) {
            return Ok(());
        }
        let sections = match self.worker.load(column).wait_blocking()? {
            Some(payload) => match decode_column::<R>(&payload) {
                Ok(record) => {
                    if record.pos != column {
                        warn!(
                            storage = self.worker.storage_name(),
                            column = %column,
                            recorded = %record.pos,
                            "column record carries a foreign position"
                        );
                    }
                    record.sections.into_iter().collect()
                },
                Err(err) => {
                    warn!(
                        storage = self.worker.storage_name(),
                        column = %column,
                        error = %err,
                        "discarding unreadable section column"
                    );
                    BTreeMap::new()
                },
            },
            None => BTreeMap::new(),
        };
        self.cache.insert(column, sections);
        Ok(())
    }

    fn mark_dirty(&mut self, column: ChunkPos) {
        if self.dirty.insert(column) {
            self.dirty_order.push_back(column);
        }
    }

    fn submit_column(&mut self, column: ChunkPos) {
        let payload = match self.cache.get(&column) {
            Some(sections) if !sections.is_empty() => {
                match encode_column(column, sections) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!(
                            storage = self.worker.storage_name(),
                            column = %column,
                            error = %err,
                            "failed to encode section column"
                        );
                        return;
                    },
                }
            },
            // A fully emptied column removes its record instead of
            // persisting an empty list.
            _ => None,
        };
        let _ = self.worker.store(column, payload);
    }
}

impl<R> Drop for SectionStorage<R>
where
    R: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close() {
            warn!(
                storage = self.worker.storage_name(),
                error = %err,
                "failed to flush section storage on drop"
            );
        }
    }
}
