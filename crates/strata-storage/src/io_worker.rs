//! Single-writer io executor with write coalescing.
//!
//! One worker thread owns the [`RegionFileStorage`] for a storage root
//! and serializes every read and write against it. Stores are queued as
//! pending entries keyed by chunk; a second store for the same chunk
//! before the first drains replaces the payload in place, and every
//! caller's completion resolves once the final bytes are durable (last
//! writer wins). Loads served while an entry is pending return a copy of
//! the in-memory payload, so a caller always reads its own writes.
//!
//! Between commands the worker persists one pending entry at a time,
//! oldest first, so a deep backlog never starves fresh submissions.
//! Shutdown drains every pending entry, then closes the storage;
//! operations submitted after shutdown resolve silently without effect.

use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use strata_common::ChunkPos;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::region_storage::RegionFileStorage;

/// Receives load and save failures for reporting.
///
/// The worker reports a failure and still surfaces it through the
/// operation's handle; sinks are for operators, not control flow.
pub trait FailureSink: Send + Sync {
    /// Reports a failed load.
    fn on_load_failure(&self, storage: &str, pos: ChunkPos, error: &StorageError);
    /// Reports a failed save.
    fn on_save_failure(&self, storage: &str, pos: ChunkPos, error: &StorageError);
}

/// Default sink that reports failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFailureSink;

impl FailureSink for LogFailureSink {
    fn on_load_failure(&self, storage: &str, pos: ChunkPos, error: &StorageError) {
        warn!(storage, chunk = %pos, error = %error, "failed to load chunk record");
    }

    fn on_save_failure(&self, storage: &str, pos: ChunkPos, error: &StorageError) {
        warn!(storage, chunk = %pos, error = %error, "failed to save chunk record");
    }
}

/// Completion handle for a queued write or synchronize.
pub type WriteToken = PendingResult<()>;

/// Completion handle for a submitted operation.
#[derive(Debug)]
pub struct PendingResult<T> {
    state: PendingState<T>,
}

#[derive(Debug)]
enum PendingState<T> {
    Ready(StorageResult<T>),
    Waiting(oneshot::Receiver<StorageResult<T>>),
}

impl<T> PendingResult<T> {
    fn ready(result: StorageResult<T>) -> Self {
        Self {
            state: PendingState::Ready(result),
        }
    }

    fn waiting(receiver: oneshot::Receiver<StorageResult<T>>) -> Self {
        Self {
            state: PendingState::Waiting(receiver),
        }
    }

    /// Waits asynchronously for the operation to settle.
    pub async fn wait(self) -> StorageResult<T> {
        match self.state {
            PendingState::Ready(result) => result,
            PendingState::Waiting(receiver) => match receiver.await {
                Ok(result) => result,
                Err(_) => Err(StorageError::WorkerStopped),
            },
        }
    }

    /// Waits by blocking the current thread.
    ///
    /// Must not be called from an async context; use [`Self::wait`]
    /// there instead.
    pub fn wait_blocking(self) -> StorageResult<T> {
        match self.state {
            PendingState::Ready(result) => result,
            PendingState::Waiting(receiver) => match receiver.blocking_recv() {
                Ok(result) => result,
                Err(_) => Err(StorageError::WorkerStopped),
            },
        }
    }
}

enum Command {
    Store {
        pos: ChunkPos,
        payload: Option<Vec<u8>>,
        done: oneshot::Sender<StorageResult<()>>,
    },
    Load {
        pos: ChunkPos,
        done: oneshot::Sender<StorageResult<Option<Vec<u8>>>>,
    },
    Synchronize {
        flush: bool,
        done: oneshot::Sender<StorageResult<()>>,
    },
    Shutdown,
}

/// Producer-facing handle for one storage root's worker thread.
pub struct IoWorker {
    storage_name: String,
    sender: Sender<Command>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoWorker {
    /// Starts a worker thread that owns `storage`.
    pub fn spawn(
        name: impl Into<String>,
        storage: RegionFileStorage,
        sink: Arc<dyn FailureSink>,
    ) -> StorageResult<Self> {
        let storage_name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = Worker {
            name: storage_name.clone(),
            storage,
            pending: AHashMap::new(),
            order: VecDeque::new(),
            tickets: Vec::new(),
            sink,
            receiver,
        };
        let thread = thread::Builder::new()
            .name(format!("strata-io-{storage_name}"))
            .spawn(move || worker.run())?;
        Ok(Self {
            storage_name,
            sender,
            stop: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Name identifying this storage root in logs and failure reports.
    #[must_use]
    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    /// Queues a record write, or a record removal when `payload` is
    /// `None`.
    ///
    /// The token settles once these bytes, or a later overwrite of the
    /// same chunk, are durably written. After [`Self::close`] the store
    /// is silently dropped and the token settles `Ok`.
    pub fn store(&self, pos: ChunkPos, payload: Option<Vec<u8>>) -> WriteToken {
        if self.stop.load(Ordering::SeqCst) {
            debug!(storage = %self.storage_name, chunk = %pos, "dropped store submitted after shutdown");
            return PendingResult::ready(Ok(()));
        }
        let (done, receiver) = oneshot::channel();
        match self.sender.send(Command::Store { pos, payload, done }) {
            Ok(()) => PendingResult::waiting(receiver),
            Err(_) => PendingResult::ready(Err(StorageError::WorkerStopped)),
        }
    }

    /// Queues a record read.
    ///
    /// A read behind a pending write of the same chunk observes the
    /// pending bytes. After [`Self::close`] the handle settles
    /// `Ok(None)`.
    pub fn load(&self, pos: ChunkPos) -> PendingResult<Option<Vec<u8>>> {
        if self.stop.load(Ordering::SeqCst) {
            return PendingResult::ready(Ok(None));
        }
        let (done, receiver) = oneshot::channel();
        match self.sender.send(Command::Load { pos, done }) {
            Ok(()) => PendingResult::waiting(receiver),
            Err(_) => PendingResult::ready(Err(StorageError::WorkerStopped)),
        }
    }

    /// Returns a token that settles once every write pending at the
    /// time of the call has drained. With `flush`, the OS-level sync of
    /// all open files is forced after the drain.
    pub fn synchronize(&self, flush: bool) -> WriteToken {
        if self.stop.load(Ordering::SeqCst) {
            return PendingResult::ready(Ok(()));
        }
        let (done, receiver) = oneshot::channel();
        match self.sender.send(Command::Synchronize { flush, done }) {
            Ok(()) => PendingResult::waiting(receiver),
            Err(_) => PendingResult::ready(Err(StorageError::WorkerStopped)),
        }
    }

    /// Stops the worker, blocking until pending writes have drained and
    /// the storage is closed. Safe to call more than once.
    pub fn close(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(Command::Shutdown);
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!(storage = %self.storage_name, "io worker thread panicked");
            }
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.close();
    }
}

struct PendingStore {
    payload: Option<Vec<u8>>,
    waiters: Vec<oneshot::Sender<StorageResult<()>>>,
}

struct SyncTicket {
    remaining: usize,
    flush: bool,
    done: oneshot::Sender<StorageResult<()>>,
}

struct Worker {
    name: String,
    storage: RegionFileStorage,
    pending: AHashMap<ChunkPos, PendingStore>,
    /// Drain order for `pending`; every pending key appears exactly once.
    order: VecDeque<ChunkPos>,
    tickets: Vec<SyncTicket>,
    sink: Arc<dyn FailureSink>,
    receiver: Receiver<Command>,
}

impl Worker {
    fn run(mut self) {
        let mut stopping = false;
        while !stopping {
            if self.pending.is_empty() {
                match self.receiver.recv() {
                    Ok(command) => stopping = self.handle(command),
                    Err(_) => stopping = true,
                }
            } else {
                // Absorb everything already queued, then persist one
                // record, so submissions never wait behind a long drain.
                loop {
                    match self.receiver.try_recv() {
                        Ok(command) => {
                            if self.handle(command) {
                                stopping = true;
                                break;
                            }
                        },
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            stopping = true;
                            break;
                        },
                    }
                }
                if !stopping {
                    self.persist_oldest();
                }
            }
        }
        self.finish();
    }

    /// Handles one command; returns whether shutdown was requested.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Store { pos, payload, done } => {
                self.enqueue_store(pos, payload, done);
                false
            },
            Command::Load { pos, done } => {
                self.handle_load(pos, done);
                false
            },
            Command::Synchronize { flush, done } => {
                self.register_ticket(flush, done);
                false
            },
            Command::Shutdown => true,
        }
    }

    fn enqueue_store(
        &mut self,
        pos: ChunkPos,
        payload: Option<Vec<u8>>,
        done: oneshot::Sender<StorageResult<()>>,
    ) {
        match self.pending.entry(pos) {
            Entry::Occupied(mut entry) => {
                // Last writer wins. Earlier callers settle through the
                // same drain; their superseded bytes are never written.
                let slot = entry.get_mut();
                slot.payload = payload;
                slot.waiters.push(done);
            },
            Entry::Vacant(entry) => {
                entry.insert(PendingStore {
                    payload,
                    waiters: vec![done],
                });
                self.order.push_back(pos);
            },
        }
    }

    fn handle_load(&mut self, pos: ChunkPos, done: oneshot::Sender<StorageResult<Option<Vec<u8>>>>) {
        let result = match self.pending.get(&pos) {
            // Read-your-writes: serve bytes still waiting to drain.
            Some(slot) => Ok(slot.payload.clone()),
            None => self.storage.read(pos).map_err(|err| {
                self.sink.on_load_failure(&self.name, pos, &err);
                err
            }),
        };
        let _ = done.send(result);
    }

    fn register_ticket(&mut self, flush: bool, done: oneshot::Sender<StorageResult<()>>) {
        let remaining = self.order.len();
        let ticket = SyncTicket {
            remaining,
            flush,
            done,
        };
        if remaining == 0 {
            Self::complete_ticket(&mut self.storage, ticket);
        } else {
            self.tickets.push(ticket);
        }
    }

    fn complete_ticket(storage: &mut RegionFileStorage, ticket: SyncTicket) {
        let result = if ticket.flush {
            storage.flush()
        } else {
            Ok(())
        };
        let _ = ticket.done.send(result);
    }

    fn persist_oldest(&mut self) {
        let Some(pos) = self.order.pop_front() else {
            return;
        };
        let Some(slot) = self.pending.remove(&pos) else {
            return;
        };
        let result = match &slot.payload {
            Some(payload) => self.storage.write(pos, payload),
            None => self.storage.delete(pos),
        };
        match result {
            Ok(()) => {
                for waiter in slot.waiters {
                    let _ = waiter.send(Ok(()));
                }
            },
            Err(err) => {
                self.sink.on_save_failure(&self.name, pos, &err);
                for waiter in slot.waiters {
                    let _ = waiter.send(Err(err.replicate()));
                }
            },
        }
        self.settle_tickets();
    }

    fn settle_tickets(&mut self) {
        for ticket in &mut self.tickets {
            ticket.remaining = ticket.remaining.saturating_sub(1);
        }
        let mut index = 0;
        while index < self.tickets.len() {
            if self.tickets[index].remaining == 0 {
                let ticket = self.tickets.swap_remove(index);
                Self::complete_ticket(&mut self.storage, ticket);
            } else {
                index += 1;
            }
        }
    }

    fn finish(mut self) {
        debug!(
            storage = %self.name,
            pending = self.pending.len(),
            "draining io worker before close"
        );
        while !self.pending.is_empty() {
            self.persist_oldest();
        }
        debug_assert!(self.tickets.is_empty());
        // Commands that raced the shutdown resolve without effect.
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Store { done, .. } => {
                    let _ = done.send(Ok(()));
                },
                Command::Load { done, .. } => {
                    let _ = done.send(Ok(None));
                },
                Command::Synchronize { done, .. } => {
                    let _ = done.send(Ok(()));
                },
                Command::Shutdown => {},
            }
        }
        if let Err(err) = self.storage.close() {
            warn!(storage = %self.name, error = %err, "failed to close region storage cleanly");
        }
        debug!(storage = %self.name, "io worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use tempfile::TempDir;

    fn open_storage(dir: &TempDir) -> RegionFileStorage {
        RegionFileStorage::new(dir.path().join("region"), Codec::Zlib, 8, None).unwrap()
    }

    fn spawn_worker(dir: &TempDir) -> IoWorker {
        IoWorker::spawn("overworld", open_storage(dir), Arc::new(LogFailureSink)).unwrap()
    }

    fn direct_worker(dir: &TempDir) -> (Worker, Sender<Command>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = Worker {
            name: "direct".to_string(),
            storage: open_storage(dir),
            pending: AHashMap::new(),
            order: VecDeque::new(),
            tickets: Vec::new(),
            sink: Arc::new(LogFailureSink),
            receiver,
        };
        (worker, sender)
    }

    #[test]
    fn test_store_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        let pos = ChunkPos::new(3, -7);

        worker
            .store(pos, Some(b"chunk bytes".to_vec()))
            .wait_blocking()
            .unwrap();
        let loaded = worker.load(pos).wait_blocking().unwrap();
        assert_eq!(loaded.unwrap(), b"chunk bytes");
        worker.close();
    }

    #[test]
    fn test_load_missing_chunk_is_none_and_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        let loaded = worker.load(ChunkPos::new(9, 9)).wait_blocking().unwrap();
        assert_eq!(loaded, None);
        worker.close();
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("region"))
            .unwrap()
            .collect();
        assert!(entries.is_empty(), "pure reads must not create files");
    }

    #[test]
    fn test_read_your_writes() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        let pos = ChunkPos::new(0, 0);

        worker
            .store(pos, Some(b"durable".to_vec()))
            .wait_blocking()
            .unwrap();
        let handle = worker.store(pos, Some(b"newer".to_vec()));
        let loaded = worker.load(pos).wait_blocking().unwrap();
        assert_eq!(loaded.unwrap(), b"newer");
        handle.wait_blocking().unwrap();
        worker.close();
    }

    #[test]
    fn test_coalescing_writes_only_the_last_payload() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _sender) = direct_worker(&dir);
        let pos = ChunkPos::new(1, 1);

        let (first_done, mut first) = oneshot::channel();
        let (second_done, mut second) = oneshot::channel();
        worker.enqueue_store(pos, Some(b"first".to_vec()), first_done);
        worker.enqueue_store(pos, Some(b"second".to_vec()), second_done);
        assert_eq!(worker.pending.len(), 1, "stores for one chunk coalesce");
        assert_eq!(worker.order.len(), 1);

        worker.persist_oldest();
        assert!(worker.pending.is_empty());
        assert!(first.try_recv().unwrap().is_ok());
        assert!(second.try_recv().unwrap().is_ok());
        assert_eq!(
            worker.storage.read(pos).unwrap().unwrap(),
            b"second",
            "only the last payload reaches disk"
        );
    }

    #[test]
    fn test_synchronize_settles_after_pending_drain() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _sender) = direct_worker(&dir);

        for x in 0..3 {
            let (done, _receiver) = oneshot::channel();
            worker.enqueue_store(ChunkPos::new(x, 0), Some(vec![x as u8]), done);
        }
        let (done, mut ticket) = oneshot::channel();
        worker.register_ticket(false, done);
        assert!(ticket.try_recv().is_err(), "ticket waits for the drain");

        worker.persist_oldest();
        worker.persist_oldest();
        assert!(ticket.try_recv().is_err());
        worker.persist_oldest();
        assert!(ticket.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_synchronize_with_nothing_pending_is_immediate() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        worker.synchronize(true).wait_blocking().unwrap();
        worker.close();
    }

    #[test]
    fn test_last_writer_wins_end_to_end() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        let pos = ChunkPos::new(-4, 12);

        let first = worker.store(pos, Some(b"A".to_vec()));
        let second = worker.store(pos, Some(b"B".to_vec()));
        first.wait_blocking().unwrap();
        second.wait_blocking().unwrap();
        assert_eq!(worker.load(pos).wait_blocking().unwrap().unwrap(), b"B");
        worker.close();
    }

    #[test]
    fn test_store_none_removes_record() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        let pos = ChunkPos::new(2, 2);

        worker.store(pos, Some(b"here".to_vec())).wait_blocking().unwrap();
        worker.store(pos, None).wait_blocking().unwrap();
        assert_eq!(worker.load(pos).wait_blocking().unwrap(), None);
        worker.close();
    }

    #[test]
    fn test_close_drains_pending_writes() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        let chunks: Vec<ChunkPos> = (0..16).map(|x| ChunkPos::new(x, x)).collect();
        for (index, pos) in chunks.iter().enumerate() {
            let _ = worker.store(*pos, Some(vec![index as u8; 64]));
        }
        worker.close();

        let mut reopened = open_storage(&dir);
        for (index, pos) in chunks.iter().enumerate() {
            assert_eq!(
                reopened.read(*pos).unwrap().unwrap(),
                vec![index as u8; 64],
                "chunk {pos} must survive close"
            );
        }
    }

    #[test]
    fn test_operations_after_close_are_silent() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        worker.close();

        let pos = ChunkPos::new(5, 5);
        assert!(worker.store(pos, Some(b"late".to_vec())).wait_blocking().is_ok());
        assert_eq!(worker.load(pos).wait_blocking().unwrap(), None);
        assert!(worker.synchronize(true).wait_blocking().is_ok());
    }

    #[tokio::test]
    async fn test_async_wait() {
        let dir = TempDir::new().unwrap();
        let worker = spawn_worker(&dir);
        let pos = ChunkPos::new(11, -3);

        worker.store(pos, Some(b"async".to_vec())).wait().await.unwrap();
        let loaded = worker.load(pos).wait().await.unwrap();
        assert_eq!(loaded.unwrap(), b"async");
        worker.close();
    }
}
