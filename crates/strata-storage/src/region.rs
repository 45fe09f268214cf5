//! Sector-addressed region files.
//!
//! A region file (`r.<x>.<z>.mca`) holds up to 1024 chunk records in
//! 4096-byte sectors. Sectors 0 and 1 carry the header: 1024 big-endian
//! offset entries packed as `sector << 8 | count`, then 1024 big-endian
//! save timestamps. An offset entry of zero means the slot is absent; a
//! count of 255 is a sentinel telling readers to take the true length
//! from the payload's own prefix.
//!
//! Each record is framed as `[u32 length][u8 version][length - 1 bytes]`
//! and zero-padded to a sector boundary. The version byte's low bits pick
//! the codec; its high bit marks a stub whose real data lives in a
//! companion file `c.<x>.<z>.mcc` carrying the same framing without the
//! padding. Records needing 256 or more sectors always spill there.
//!
//! Rewrites allocate fresh sectors, update the header, and only then
//! release the old ones, so a failure part-way never damages the record
//! a reader would have seen before the rewrite began.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use strata_common::{ChunkPos, RegionPos, CHUNKS_PER_REGION};
use tracing::{debug, warn};

use crate::codec::{decode_payload, Codec};
use crate::error::StorageResult;

/// Bytes per sector.
pub const SECTOR_BYTES: usize = 4096;
/// Sectors reserved for the header tables.
const HEADER_SECTORS: u64 = 2;
/// Bytes covered by the two header tables.
const HEADER_BYTES: usize = SECTOR_BYTES * 2;
/// Length field plus version byte.
const FRAME_HEADER_BYTES: usize = 5;
/// Version-byte flag for records stored in a companion file.
const EXTERNAL_FLAG: u8 = 0x80;
/// Largest count a header entry can carry; doubles as the sentinel.
const MAX_HEADER_SECTORS: u32 = 255;

/// Reads the chunk position a record claims, given only its decoded
/// payload.
///
/// Recovery uses this to re-home payloads found by scanning sectors,
/// since a damaged header cannot be trusted for placement.
pub trait ChunkPosExtractor: Send + Sync {
    /// Position embedded in `payload`, or `None` when the bytes do not
    /// look like a record.
    fn extract(&self, payload: &[u8]) -> Option<ChunkPos>;
}

/// One packed offset-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SlotEntry(u32);

impl SlotEntry {
    const ABSENT: Self = Self(0);

    fn new(sector: u64, count: u32) -> Self {
        debug_assert!(sector >= HEADER_SECTORS && sector < (1 << 24));
        debug_assert!(count >= 1 && count <= MAX_HEADER_SECTORS);
        Self(((sector as u32) << 8) | count)
    }

    const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    const fn raw(self) -> u32 {
        self.0
    }

    const fn sector(self) -> u64 {
        (self.0 >> 8) as u64
    }

    const fn count(self) -> u32 {
        self.0 & 0xff
    }

    const fn is_absent(self) -> bool {
        self.0 == 0
    }
}

/// Sector occupancy map with first-fit allocation.
#[derive(Debug, Default)]
struct SectorBitmap {
    used: Vec<bool>,
}

impl SectorBitmap {
    fn with_header() -> Self {
        Self {
            used: vec![true; HEADER_SECTORS as usize],
        }
    }

    /// Marks a span occupied, reporting whether any sector in it already
    /// was.
    fn mark(&mut self, start: u64, count: u32) -> bool {
        let start = start as usize;
        let end = start + count as usize;
        if end > self.used.len() {
            self.used.resize(end, false);
        }
        let mut overlapped = false;
        for slot in &mut self.used[start..end] {
            overlapped |= *slot;
            *slot = true;
        }
        overlapped
    }

    fn free(&mut self, start: u64, count: u32) {
        let start = start as usize;
        if start >= self.used.len() {
            return;
        }
        let end = (start + count as usize).min(self.used.len());
        for slot in &mut self.used[start..end] {
            *slot = false;
        }
    }

    /// Finds the lowest span of `count` free sectors and marks it used.
    fn allocate(&mut self, count: u32) -> u64 {
        let count = count as usize;
        let mut start = HEADER_SECTORS as usize;
        loop {
            // Everything past the current end of the map is free.
            if start + count > self.used.len() {
                self.used.resize(start + count, false);
            }
            match self.used[start..start + count].iter().position(|used| *used) {
                None => break,
                Some(used_at) => start += used_at + 1,
            }
        }
        for slot in &mut self.used[start..start + count] {
            *slot = true;
        }
        start as u64
    }
}

/// One open region file with its in-memory header tables and sector
/// occupancy map.
#[derive(Debug)]
pub struct RegionFile {
    pos: RegionPos,
    path: PathBuf,
    directory: PathBuf,
    file: File,
    codec: Codec,
    offsets: Vec<SlotEntry>,
    timestamps: Vec<u32>,
    /// Sector spans actually occupied, with 255-count sentinels resolved.
    true_counts: Vec<u32>,
    bitmap: SectorBitmap,
}

impl RegionFile {
    /// File name for a region position.
    #[must_use]
    pub fn file_name(pos: RegionPos) -> String {
        format!("r.{}.{}.mca", pos.x, pos.z)
    }

    /// Opens or creates the region file for `pos` under `directory`.
    ///
    /// `extractor` enables full header recovery when damage is detected;
    /// without one, damaged slots are dropped individually instead.
    pub fn open(
        pos: RegionPos,
        directory: &Path,
        codec: Codec,
        extractor: Option<&dyn ChunkPosExtractor>,
    ) -> StorageResult<Self> {
        let path = directory.join(Self::file_name(pos));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut region = Self {
            pos,
            path,
            directory: directory.to_path_buf(),
            file,
            codec,
            offsets: vec![SlotEntry::ABSENT; CHUNKS_PER_REGION],
            timestamps: vec![0; CHUNKS_PER_REGION],
            true_counts: vec![0; CHUNKS_PER_REGION],
            bitmap: SectorBitmap::with_header(),
        };
        region.load_existing(extractor)?;
        debug!(region = %pos, path = %region.path.display(), "opened region file");
        Ok(region)
    }

    /// Region this file covers.
    #[must_use]
    pub const fn region_pos(&self) -> RegionPos {
        self.pos
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file currently holds a record for `pos`.
    #[must_use]
    pub fn has_chunk(&self, pos: ChunkPos) -> bool {
        self.pos.contains(pos) && !self.offsets[pos.region_local_index()].is_absent()
    }

    /// Advisory save timestamp (seconds since the epoch) for `pos`.
    #[must_use]
    pub fn timestamp(&self, pos: ChunkPos) -> u32 {
        self.assert_owned(pos);
        self.timestamps[pos.region_local_index()]
    }

    /// Reads and decompresses the record for `pos`.
    ///
    /// Slots whose framing turns out inconsistent are reported and read
    /// as absent, so one bad record never blocks the rest of the file.
    pub fn read(&mut self, pos: ChunkPos) -> StorageResult<Option<Vec<u8>>> {
        self.assert_owned(pos);
        let entry = self.offsets[pos.region_local_index()];
        if entry.is_absent() {
            return Ok(None);
        }
        let file_len = self.file.metadata()?.len();
        let at = entry.sector() * SECTOR_BYTES as u64;
        let Some((length, version)) = self.read_frame_header(entry.sector(), file_len)? else {
            warn!(region = %self.pos, chunk = %pos, "allocated slot has no readable frame");
            return Ok(None);
        };
        let span_bytes =
            u64::from(self.true_counts[pos.region_local_index()]) * SECTOR_BYTES as u64;
        if u64::from(length) + 4 > span_bytes.min(file_len.saturating_sub(at)) {
            warn!(
                region = %self.pos,
                chunk = %pos,
                length,
                "frame length overruns its allocation"
            );
            return Ok(None);
        }
        if version & EXTERNAL_FLAG != 0 {
            return self.read_external(pos);
        }
        let body = self.read_bytes(at + FRAME_HEADER_BYTES as u64, length as usize - 1)?;
        Ok(Some(decode_payload(version, &body)?))
    }

    /// Stores a record, replacing any prior data for the chunk.
    pub fn write(&mut self, pos: ChunkPos, payload: &[u8]) -> StorageResult<()> {
        self.assert_owned(pos);
        let index = pos.region_local_index();
        let body = self.codec.encode_payload(payload)?;
        let span = Self::sectors_for_body(body.len());

        let old_entry = self.offsets[index];
        let old_count = self.true_counts[index];

        let (entry, count) = if span > MAX_HEADER_SECTORS {
            self.write_external_file(pos, &body)?;
            let sector = self.bitmap.allocate(1);
            self.write_frame(sector, &[], self.codec.id() | EXTERNAL_FLAG)?;
            (SlotEntry::new(sector, 1), 1)
        } else {
            let sector = self.bitmap.allocate(span);
            self.write_frame(sector, &body, self.codec.id())?;
            (Self::entry_for(sector, span), span)
        };

        self.offsets[index] = entry;
        self.timestamps[index] = epoch_seconds();
        self.true_counts[index] = count;
        self.write_slot(index)?;

        if span <= MAX_HEADER_SECTORS {
            // A companion file from an earlier oversized save is stale now.
            match fs::remove_file(self.external_path(pos)) {
                Ok(()) => debug!(region = %self.pos, chunk = %pos, "removed stale companion file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {},
                Err(err) => return Err(err.into()),
            }
        }
        if !old_entry.is_absent() {
            self.bitmap.free(old_entry.sector(), old_count);
        }
        Ok(())
    }

    /// Drops the record for `pos`, releasing its sectors and any
    /// companion file.
    pub fn clear(&mut self, pos: ChunkPos) -> StorageResult<()> {
        self.assert_owned(pos);
        let index = pos.region_local_index();
        let entry = self.offsets[index];
        if entry.is_absent() {
            return Ok(());
        }
        let count = self.true_counts[index];
        self.offsets[index] = SlotEntry::ABSENT;
        self.timestamps[index] = 0;
        self.true_counts[index] = 0;
        self.write_slot(index)?;
        self.bitmap.free(entry.sector(), count);
        match fs::remove_file(self.external_path(pos)) {
            Ok(()) => {},
            Err(err) if err.kind() == ErrorKind::NotFound => {},
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Forces buffered writes to disk.
    pub fn flush(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Pads the file to a whole sector and syncs it.
    pub fn close(&mut self) -> StorageResult<()> {
        self.pad_to_sector()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn load_existing(&mut self, extractor: Option<&dyn ChunkPosExtractor>) -> StorageResult<()> {
        let len = self.file.metadata()?.len();
        if len == 0 {
            // Reserve the header sectors eagerly so payload offsets are
            // stable from the first write.
            return self.write_full_header();
        }
        if (len as usize) < HEADER_BYTES {
            warn!(region = %self.pos, len, "region file too short for a header, starting over");
            return self.write_full_header();
        }

        let header = self.read_bytes(0, HEADER_BYTES)?;
        for index in 0..CHUNKS_PER_REGION {
            self.offsets[index] = SlotEntry::from_raw(read_u32(&header, index * 4));
            self.timestamps[index] = read_u32(&header, HEADER_BYTES / 2 + index * 4);
        }

        let total_sectors = len.div_ceil(SECTOR_BYTES as u64);
        let mut damaged: Vec<usize> = Vec::new();
        for index in 0..CHUNKS_PER_REGION {
            let entry = self.offsets[index];
            if entry.is_absent() {
                continue;
            }
            if entry.sector() < HEADER_SECTORS || entry.count() == 0 {
                damaged.push(index);
                continue;
            }
            let mut count = entry.count();
            if count == MAX_HEADER_SECTORS {
                match self.probe_true_count(entry.sector(), len)? {
                    Some(actual) => count = actual,
                    None => {
                        damaged.push(index);
                        continue;
                    },
                }
            }
            if entry.sector() + u64::from(count) > total_sectors {
                damaged.push(index);
                continue;
            }
            if self.bitmap.mark(entry.sector(), count) {
                damaged.push(index);
                continue;
            }
            self.true_counts[index] = count;
        }

        if damaged.is_empty() {
            return Ok(());
        }
        if let Some(extractor) = extractor {
            warn!(
                region = %self.pos,
                slots = damaged.len(),
                "header damage detected, rebuilding from a full scan"
            );
            self.recover(extractor)
        } else {
            for index in damaged {
                warn!(region = %self.pos, slot = index, "dropping slot with a damaged header entry");
                self.offsets[index] = SlotEntry::ABSENT;
                self.timestamps[index] = 0;
                self.true_counts[index] = 0;
            }
            self.write_full_header()
        }
    }

    /// Backs the file up and rebuilds the header from a full sector scan.
    ///
    /// Payloads are re-homed by the chunk position embedded in their own
    /// data. When two payloads claim the same slot, the one later in the
    /// file wins, matching append-leaning allocation order. Slots without
    /// a readable payload are dropped for the caller to regenerate.
    fn recover(&mut self, extractor: &dyn ChunkPosExtractor) -> StorageResult<()> {
        let backup = self
            .path
            .with_file_name(format!("{}.backup", Self::file_name(self.pos)));
        fs::copy(&self.path, &backup)?;
        warn!(
            region = %self.pos,
            backup = %backup.display(),
            "backed up damaged region file"
        );

        let len = self.file.metadata()?.len();
        let total_sectors = len.div_ceil(SECTOR_BYTES as u64);
        let mut candidates: Vec<Option<(u64, u32)>> = vec![None; CHUNKS_PER_REGION];
        for sector in HEADER_SECTORS..total_sectors {
            let Some((length, version)) = self.read_frame_header(sector, len)? else {
                continue;
            };
            if version & EXTERNAL_FLAG != 0 {
                // Stubs carry nothing to identify them by; companion
                // files are re-linked from their own names below.
                continue;
            }
            if length < 2 {
                continue;
            }
            let at = sector * SECTOR_BYTES as u64;
            if u64::from(length) + 4 > len.saturating_sub(at) {
                // A claimed length running past EOF is a torn tail frame.
                continue;
            }
            let span = Self::sectors_for_length(length);
            let body = self.read_bytes(at + FRAME_HEADER_BYTES as u64, length as usize - 1)?;
            let Ok(payload) = decode_payload(version, &body) else {
                continue;
            };
            let Some(chunk) = extractor.extract(&payload) else {
                continue;
            };
            if chunk.region() != self.pos {
                continue;
            }
            candidates[chunk.region_local_index()] = Some((sector, span));
        }

        self.bitmap = SectorBitmap::with_header();
        self.offsets = vec![SlotEntry::ABSENT; CHUNKS_PER_REGION];
        self.timestamps = vec![0; CHUNKS_PER_REGION];
        self.true_counts = vec![0; CHUNKS_PER_REGION];
        let mut recovered = 0usize;
        for (index, candidate) in candidates.iter().enumerate() {
            let Some((sector, span)) = *candidate else {
                continue;
            };
            if self.bitmap.mark(sector, span) {
                warn!(region = %self.pos, slot = index, "dropping slot whose payload overlaps another");
                continue;
            }
            self.offsets[index] = Self::entry_for(sector, span);
            self.true_counts[index] = span;
            recovered += 1;
        }

        self.relink_external(extractor)?;
        self.write_full_header()?;
        warn!(region = %self.pos, recovered, "rebuilt region header from scan");
        Ok(())
    }

    /// Points empty slots back at verified companion files after a scan
    /// rebuild. Slots already recovered from in-file data keep that data.
    fn relink_external(&mut self, extractor: &dyn ChunkPosExtractor) -> StorageResult<()> {
        for dir_entry in fs::read_dir(&self.directory)? {
            let name = dir_entry?.file_name();
            let Some(chunk) = parse_external_name(&name.to_string_lossy()) else {
                continue;
            };
            if chunk.region() != self.pos || !self.offsets[chunk.region_local_index()].is_absent()
            {
                continue;
            }
            let verified = match self.read_external(chunk) {
                Ok(Some(payload)) => extractor.extract(&payload) == Some(chunk),
                Ok(None) => false,
                Err(err) => {
                    warn!(region = %self.pos, chunk = %chunk, error = %err, "companion file unreadable");
                    false
                },
            };
            if !verified {
                warn!(region = %self.pos, chunk = %chunk, "companion file failed verification, slot stays absent");
                continue;
            }
            let sector = self.bitmap.allocate(1);
            self.write_frame(sector, &[], self.codec.id() | EXTERNAL_FLAG)?;
            let index = chunk.region_local_index();
            self.offsets[index] = SlotEntry::new(sector, 1);
            self.true_counts[index] = 1;
            debug!(region = %self.pos, chunk = %chunk, "re-linked companion file");
        }
        Ok(())
    }

    fn read_external(&mut self, pos: ChunkPos) -> StorageResult<Option<Vec<u8>>> {
        let path = self.external_path(pos);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(region = %self.pos, chunk = %pos, "stub points at a missing companion file");
                return Ok(None);
            },
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < FRAME_HEADER_BYTES {
            warn!(region = %self.pos, chunk = %pos, "companion file too short for a frame");
            return Ok(None);
        }
        let length = read_u32(&bytes, 0) as usize;
        let version = bytes[4];
        if length < 1 || 4 + length > bytes.len() || version & EXTERNAL_FLAG != 0 {
            warn!(region = %self.pos, chunk = %pos, "companion file frame is inconsistent");
            return Ok(None);
        }
        Ok(Some(decode_payload(version, &bytes[5..4 + length])?))
    }

    fn write_external_file(&mut self, pos: ChunkPos, body: &[u8]) -> StorageResult<()> {
        let target = self.external_path(pos);
        let staging = self
            .directory
            .join(format!("c.{}.{}.mcc.tmp", pos.x, pos.z));
        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
        frame.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
        frame.push(self.codec.id());
        frame.extend_from_slice(body);
        fs::write(&staging, &frame)?;
        fs::rename(&staging, &target)?;
        debug!(
            region = %self.pos,
            chunk = %pos,
            bytes = frame.len(),
            "wrote oversized record to a companion file"
        );
        Ok(())
    }

    fn write_frame(&mut self, sector: u64, body: &[u8], version: u8) -> StorageResult<()> {
        let span = Self::sectors_for_body(body.len()) as usize;
        let mut frame = Vec::with_capacity(span * SECTOR_BYTES);
        frame.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
        frame.push(version);
        frame.extend_from_slice(body);
        frame.resize(span * SECTOR_BYTES, 0);
        self.file.seek(SeekFrom::Start(sector * SECTOR_BYTES as u64))?;
        self.file.write_all(&frame)?;
        Ok(())
    }

    fn write_slot(&mut self, index: usize) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start((index * 4) as u64))?;
        self.file.write_all(&self.offsets[index].raw().to_be_bytes())?;
        self.file
            .seek(SeekFrom::Start((HEADER_BYTES / 2 + index * 4) as u64))?;
        self.file.write_all(&self.timestamps[index].to_be_bytes())?;
        Ok(())
    }

    fn write_full_header(&mut self) -> StorageResult<()> {
        let mut header = vec![0u8; HEADER_BYTES];
        for index in 0..CHUNKS_PER_REGION {
            let at = index * 4;
            header[at..at + 4].copy_from_slice(&self.offsets[index].raw().to_be_bytes());
            let at = HEADER_BYTES / 2 + index * 4;
            header[at..at + 4].copy_from_slice(&self.timestamps[index].to_be_bytes());
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    /// Reads the payload's own length prefix to size a slot whose header
    /// count carries the 255 sentinel.
    fn probe_true_count(&mut self, sector: u64, file_len: u64) -> StorageResult<Option<u32>> {
        let at = sector * SECTOR_BYTES as u64;
        if at + 4 > file_len {
            return Ok(None);
        }
        let prefix = self.read_bytes(at, 4)?;
        let length = read_u32(&prefix, 0);
        if length == 0 {
            return Ok(None);
        }
        Ok(Some(Self::sectors_for_length(length)))
    }

    fn read_frame_header(&mut self, sector: u64, file_len: u64) -> StorageResult<Option<(u32, u8)>> {
        let at = sector * SECTOR_BYTES as u64;
        if at + FRAME_HEADER_BYTES as u64 > file_len {
            return Ok(None);
        }
        let bytes = self.read_bytes(at, FRAME_HEADER_BYTES)?;
        let length = read_u32(&bytes, 0);
        if length == 0 {
            return Ok(None);
        }
        Ok(Some((length, bytes[4])))
    }

    fn read_bytes(&mut self, at: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(at))?;
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn pad_to_sector(&mut self) -> StorageResult<()> {
        let len = self.file.metadata()?.len();
        let padded = len.div_ceil(SECTOR_BYTES as u64) * SECTOR_BYTES as u64;
        if padded != len {
            self.file.set_len(padded)?;
        }
        Ok(())
    }

    fn external_path(&self, pos: ChunkPos) -> PathBuf {
        self.directory.join(format!("c.{}.{}.mcc", pos.x, pos.z))
    }

    fn assert_owned(&self, pos: ChunkPos) {
        assert!(
            self.pos.contains(pos),
            "chunk {pos} does not belong to region {}",
            self.pos
        );
    }

    fn entry_for(sector: u64, span: u32) -> SlotEntry {
        SlotEntry::new(sector, span.min(MAX_HEADER_SECTORS))
    }

    /// Sectors covering an encoded body of `body_len` bytes.
    fn sectors_for_body(body_len: usize) -> u32 {
        (body_len + FRAME_HEADER_BYTES).div_ceil(SECTOR_BYTES) as u32
    }

    /// Sectors covering a frame whose length field is `length`.
    fn sectors_for_length(length: u32) -> u32 {
        (length as usize + 4).div_ceil(SECTOR_BYTES) as u32
    }
}

impl Drop for RegionFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(region = %self.pos, error = %err, "failed to close region file cleanly");
        }
    }
}

fn parse_external_name(name: &str) -> Option<ChunkPos> {
    let rest = name.strip_prefix("c.")?.strip_suffix(".mcc")?;
    let (x, z) = rest.split_once('.')?;
    Some(ChunkPos::new(x.parse().ok()?, z.parse().ok()?))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn epoch_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}
