//! Bounded pool of open region files for one storage root.
//!
//! File handles are kept warm in most-recently-used order and closed on
//! eviction. All access to one root is serialized through its worker, so
//! the pool needs no locking of its own; evicting a file another caller
//! "holds" cannot happen.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_common::{ChunkPos, RegionPos};
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::error::StorageResult;
use crate::region::{ChunkPosExtractor, RegionFile};

/// Default bound on simultaneously open region files.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Open region files for one directory, most recently used first.
pub struct RegionFileStorage {
    directory: PathBuf,
    codec: Codec,
    capacity: usize,
    extractor: Option<Arc<dyn ChunkPosExtractor>>,
    pool: VecDeque<RegionFile>,
}

impl RegionFileStorage {
    /// Opens a storage root, creating the directory if needed.
    ///
    /// `extractor` is handed to every region file so damaged headers can
    /// be rebuilt by scanning; see [`RegionFile::open`].
    pub fn new(
        directory: impl Into<PathBuf>,
        codec: Codec,
        capacity: usize,
        extractor: Option<Arc<dyn ChunkPosExtractor>>,
    ) -> StorageResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            codec,
            capacity: capacity.max(1),
            extractor,
            pool: VecDeque::new(),
        })
    }

    /// Directory holding the region files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Number of region files currently open.
    #[must_use]
    pub fn open_files(&self) -> usize {
        self.pool.len()
    }

    /// Returns the open region file covering `chunk`.
    ///
    /// With `existing_only`, a region whose file is not on disk reports
    /// `Ok(None)` instead of creating an empty one; pure reads use this
    /// to avoid littering the directory.
    pub fn region_file(
        &mut self,
        chunk: ChunkPos,
        existing_only: bool,
    ) -> StorageResult<Option<&mut RegionFile>> {
        let region = chunk.region();
        let pooled = self.pool.iter().any(|file| file.region_pos() == region);
        if existing_only && !pooled && !self.region_path(region).exists() {
            return Ok(None);
        }
        self.open_or_promote(region).map(Some)
    }

    /// Reads the record for `chunk`, never creating a missing file.
    pub fn read(&mut self, chunk: ChunkPos) -> StorageResult<Option<Vec<u8>>> {
        match self.region_file(chunk, true)? {
            Some(file) => file.read(chunk),
            None => Ok(None),
        }
    }

    /// Whether a record for `chunk` exists on disk.
    pub fn has_chunk(&mut self, chunk: ChunkPos) -> StorageResult<bool> {
        match self.region_file(chunk, true)? {
            Some(file) => Ok(file.has_chunk(chunk)),
            None => Ok(false),
        }
    }

    /// Writes the record for `chunk`, creating the region file if
    /// needed.
    pub fn write(&mut self, chunk: ChunkPos, payload: &[u8]) -> StorageResult<()> {
        self.open_or_promote(chunk.region())?.write(chunk, payload)
    }

    /// Removes the record for `chunk`. Never creates a file just to
    /// record an absence.
    pub fn delete(&mut self, chunk: ChunkPos) -> StorageResult<()> {
        match self.region_file(chunk, true)? {
            Some(file) => file.clear(chunk),
            None => Ok(()),
        }
    }

    /// Syncs every open region file to disk.
    pub fn flush(&mut self) -> StorageResult<()> {
        for file in &mut self.pool {
            file.flush()?;
        }
        Ok(())
    }

    /// Closes every open region file, reporting the first failure after
    /// attempting all of them.
    pub fn close(&mut self) -> StorageResult<()> {
        let mut first_failure = None;
        while let Some(mut file) = self.pool.pop_front() {
            if let Err(err) = file.close() {
                warn!(region = %file.region_pos(), error = %err, "failed to close region file");
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn open_or_promote(&mut self, region: RegionPos) -> StorageResult<&mut RegionFile> {
        match self.pool.iter().position(|file| file.region_pos() == region) {
            Some(0) => {},
            Some(index) => {
                if let Some(file) = self.pool.remove(index) {
                    self.pool.push_front(file);
                }
            },
            None => {
                let file = RegionFile::open(
                    region,
                    &self.directory,
                    self.codec.clone(),
                    self.extractor.as_deref(),
                )?;
                // Make room first so the bound is never exceeded.
                while self.pool.len() >= self.capacity {
                    self.close_lru();
                }
                self.pool.push_front(file);
            },
        }
        Ok(&mut self.pool[0])
    }

    fn close_lru(&mut self) {
        if let Some(mut evicted) = self.pool.pop_back() {
            debug!(region = %evicted.region_pos(), "evicting least recently used region file");
            if let Err(err) = evicted.close() {
                warn!(
                    region = %evicted.region_pos(),
                    error = %err,
                    "failed to close evicted region file"
                );
            }
        }
    }

    fn region_path(&self, region: RegionPos) -> PathBuf {
        self.directory.join(RegionFile::file_name(region))
    }
}
