//! The disk coordinator: a single-threaded actor in front of the worker
//! pool.
//!
//! The actor task is the "network thread" of the design: it owns every
//! piece of mutable state (torrent entries, partial pieces, the read
//! cache) and never blocks. Blocking work (file I/O, SHA-1) runs on the
//! [`WorkerPool`]; each job receives moved-out piece state and posts a
//! typed completion event back through the actor's channel, which the
//! actor applies before re-checking the piece for further work.
//!
//! All user handlers are invoked on the actor task.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::bitfield::Bitfield;
use crate::blockinfo::{BlockInfo, BlockSource};
use crate::cache::{DiskBuffer, DiskBufferPool, WTinyLfu};
use crate::constants::{BLOCK_SIZE, RESUME_FILE_EXTENSION, WRITE_BUFFER_EXPIRY};
use crate::pool::WorkerPool;
use crate::storage::{StorageError, StorageInfo, TorrentStorage};
use crate::TorrentId;

use super::error::DiskError;
use super::piece::{Block, PartialPiece, PieceCompletionHandler, PieceWork, SaveHandler};
use super::settings::DiskSettings;
use super::torrent::{BlockFetch, FetchHandler, FetchSubscriber, TorrentEntry};

/// Counters exposed for diagnostics; a snapshot is taken on demand.
#[derive(Debug, Clone, Default)]
pub struct DiskStats {
    pub num_blocks_written: u64,
    pub num_blocks_read: u64,
    pub num_read_cache_hits: u64,
    pub num_read_cache_misses: u64,
    pub read_cache_capacity: usize,
    pub read_cache_size: usize,
    pub num_partial_pieces: usize,
    pub num_buffered_blocks: usize,
}

type AllocateHandler = Box<dyn FnOnce(Result<Arc<TorrentStorage>, DiskError>) + Send>;
type OpHandler = Box<dyn FnOnce(Result<(), DiskError>) + Send>;
type ResumeDataHandler = Box<dyn FnOnce(Result<Bytes, DiskError>) + Send>;
type AllResumeDataHandler = Box<dyn FnOnce(Result<Vec<Bytes>, DiskError>) + Send>;
type IntegrityHandler = Box<dyn FnOnce(Result<Bitfield, DiskError>) + Send>;
type DigestHandler = Box<dyn FnOnce([u8; 20]) + Send>;
type StatsHandler = Box<dyn FnOnce(DiskStats) + Send>;

/// Commands accepted by the disk actor.
enum Command {
    AllocateTorrent {
        id: TorrentId,
        download_dir: PathBuf,
        name: String,
        info: StorageInfo,
        piece_hashes: Bytes,
        handler: AllocateHandler,
    },
    SaveBlock {
        id: TorrentId,
        info: BlockInfo,
        data: DiskBuffer,
        save_handler: SaveHandler,
        completion_handler: PieceCompletionHandler,
    },
    FetchBlock {
        id: TorrentId,
        info: BlockInfo,
        handler: FetchHandler,
    },
    MoveTorrent {
        id: TorrentId,
        new_dir: PathBuf,
        handler: OpHandler,
    },
    RenameTorrent {
        id: TorrentId,
        name: String,
        handler: OpHandler,
    },
    EraseTorrentFiles {
        id: TorrentId,
        handler: OpHandler,
    },
    EraseTorrentResumeData {
        id: TorrentId,
        handler: OpHandler,
    },
    SaveTorrentResumeData {
        id: TorrentId,
        data: Bytes,
        handler: OpHandler,
    },
    LoadTorrentResumeData {
        id: TorrentId,
        handler: ResumeDataHandler,
    },
    LoadAllTorrentResumeData {
        handler: AllResumeDataHandler,
    },
    CheckStorageIntegrity {
        id: TorrentId,
        pieces: Bitfield,
        handler: IntegrityHandler,
    },
    CreateSha1Digest {
        data: Bytes,
        handler: DigestHandler,
    },
    SetReadCacheCapacity(u32),
    SetConcurrency(usize),
    SetResumeDataPath(PathBuf),
    Stats(StatsHandler),
    Shutdown,
}

/// Completions posted by workers back to the actor. The channel hop is
/// the release/acquire edge of the piece handoff protocol.
enum Event {
    /// Outcome of `hash_and_save_blocks` or `flush_buffer`. `saved` and
    /// `failed` partition the blocks the worker held.
    BlocksSaved {
        id: TorrentId,
        piece_index: u32,
        work: PieceWork,
        saved: Vec<Block>,
        failed: Vec<Block>,
        error: Option<StorageError>,
    },
    /// Outcome of `handle_complete_piece`. `verdict` is `None` when a
    /// read-back failed before the hash could be finished.
    PieceComplete {
        id: TorrentId,
        piece_index: u32,
        work: PieceWork,
        verdict: Option<bool>,
        saved: Vec<Block>,
        unsaved: Vec<Block>,
        error: Option<StorageError>,
    },
    BlocksRead {
        id: TorrentId,
        info: BlockInfo,
        result: Result<Vec<BlockSource>, StorageError>,
    },
    /// Runs an ancillary operation's user handler on the actor.
    Notify(Box<dyn FnOnce() + Send>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    torrent: TorrentId,
    piece: u32,
    offset: u32,
}

/// Keeps `TorrentEntry::num_pending_ops` balanced across a job's
/// lifetime: incremented at dispatch, decremented after the completion
/// has been posted.
struct OpGuard(Arc<AtomicU32>);

impl OpGuard {
    fn new(counter: &Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Spawns the disk actor onto the current tokio runtime.
pub fn spawn(settings: DiskSettings) -> (DiskHandle, task::JoinHandle<()>) {
    let settings = settings.sanitized();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let buffer_pool = DiskBufferPool::new();
    let disk = Disk::new(settings, event_tx, Arc::clone(&buffer_pool));
    let handle = DiskHandle {
        cmd_tx,
        buffer_pool,
    };
    let join = task::spawn(disk.run(cmd_rx, event_rx));
    (handle, join)
}

/// Cheap-to-clone handle used to talk to the disk actor from anywhere.
#[derive(Clone)]
pub struct DiskHandle {
    cmd_tx: UnboundedSender<Command>,
    buffer_pool: Arc<DiskBufferPool>,
}

impl DiskHandle {
    /// Acquires a pooled, page-aligned block buffer. Served directly from
    /// the shared pool; never fails.
    pub fn get_disk_buffer(&self, len: usize) -> DiskBuffer {
        self.buffer_pool.get(len)
    }

    /// Acquires a buffer pre-filled with `data`.
    pub fn get_disk_buffer_from(&self, data: &[u8]) -> DiskBuffer {
        self.buffer_pool.get_from(data)
    }

    /// Registers a torrent and creates its directory tree. Handled inline
    /// by the actor, without touching the worker pool.
    pub fn allocate_torrent(
        &self,
        id: TorrentId,
        download_dir: PathBuf,
        name: String,
        info: StorageInfo,
        piece_hashes: Bytes,
        handler: impl FnOnce(Result<Arc<TorrentStorage>, DiskError>) + Send + 'static,
    ) {
        self.send(Command::AllocateTorrent {
            id,
            download_dir,
            name,
            info,
            piece_hashes,
            handler: Box::new(handler),
        });
    }

    /// Queues a block for hashing and saving. Blocks are buffered per
    /// piece and processed in batches; `save_handler` fires once this
    /// block's save is concluded, `completion_handler` (stored from the
    /// piece's first block only) fires once the whole piece's hash has
    /// been verified.
    pub fn save_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: DiskBuffer,
        save_handler: impl FnOnce(Result<(), DiskError>) + Send + 'static,
        completion_handler: impl FnOnce(bool) + Send + 'static,
    ) {
        self.send(Command::SaveBlock {
            id,
            info,
            data,
            save_handler: Box::new(save_handler),
            completion_handler: Box::new(completion_handler),
        });
    }

    /// Fetches a block, serving it from the read cache when possible and
    /// coalescing concurrent fetches of the same region into one read.
    pub fn fetch_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        handler: impl FnOnce(Result<BlockSource, DiskError>) + Send + 'static,
    ) {
        self.send(Command::FetchBlock {
            id,
            info,
            handler: Box::new(handler),
        });
    }

    pub fn move_torrent(
        &self,
        id: TorrentId,
        new_dir: PathBuf,
        handler: impl FnOnce(Result<(), DiskError>) + Send + 'static,
    ) {
        self.send(Command::MoveTorrent {
            id,
            new_dir,
            handler: Box::new(handler),
        });
    }

    pub fn rename_torrent(
        &self,
        id: TorrentId,
        name: String,
        handler: impl FnOnce(Result<(), DiskError>) + Send + 'static,
    ) {
        self.send(Command::RenameTorrent {
            id,
            name,
            handler: Box::new(handler),
        });
    }

    /// Removes the torrent's files and its resume data.
    pub fn erase_torrent_files(
        &self,
        id: TorrentId,
        handler: impl FnOnce(Result<(), DiskError>) + Send + 'static,
    ) {
        self.send(Command::EraseTorrentFiles {
            id,
            handler: Box::new(handler),
        });
    }

    /// Removes only the torrent's resume data, e.g. when the user stops
    /// seeding but keeps the files.
    pub fn erase_torrent_resume_data(
        &self,
        id: TorrentId,
        handler: impl FnOnce(Result<(), DiskError>) + Send + 'static,
    ) {
        self.send(Command::EraseTorrentResumeData {
            id,
            handler: Box::new(handler),
        });
    }

    /// Persists opaque, already-encoded resume data for the torrent.
    pub fn save_torrent_resume_data(
        &self,
        id: TorrentId,
        data: Bytes,
        handler: impl FnOnce(Result<(), DiskError>) + Send + 'static,
    ) {
        self.send(Command::SaveTorrentResumeData {
            id,
            data,
            handler: Box::new(handler),
        });
    }

    pub fn load_torrent_resume_data(
        &self,
        id: TorrentId,
        handler: impl FnOnce(Result<Bytes, DiskError>) + Send + 'static,
    ) {
        self.send(Command::LoadTorrentResumeData {
            id,
            handler: Box::new(handler),
        });
    }

    /// Loads the resume data of every torrent found under the resume data
    /// directory. Intended for application startup.
    pub fn load_all_torrent_resume_data(
        &self,
        handler: impl FnOnce(Result<Vec<Bytes>, DiskError>) + Send + 'static,
    ) {
        self.send(Command::LoadAllTorrentResumeData {
            handler: Box::new(handler),
        });
    }

    /// Hashes every piece marked in `pieces` and reports the subset whose
    /// digest matched its expected value.
    pub fn check_storage_integrity(
        &self,
        id: TorrentId,
        pieces: Bitfield,
        handler: impl FnOnce(Result<Bitfield, DiskError>) + Send + 'static,
    ) {
        self.send(Command::CheckStorageIntegrity {
            id,
            pieces,
            handler: Box::new(handler),
        });
    }

    /// Hashes arbitrary data on the pool. For piece data, prefer
    /// `save_block`, which hashes incrementally.
    pub fn create_sha1_digest(
        &self,
        data: Bytes,
        handler: impl FnOnce([u8; 20]) + Send + 'static,
    ) {
        self.send(Command::CreateSha1Digest {
            data,
            handler: Box::new(handler),
        });
    }

    pub fn set_read_cache_capacity(&self, capacity: u32) {
        self.send(Command::SetReadCacheCapacity(capacity));
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        self.send(Command::SetConcurrency(concurrency));
    }

    pub fn set_resume_data_path(&self, path: PathBuf) {
        self.send(Command::SetResumeDataPath(path));
    }

    pub fn stats(&self, handler: impl FnOnce(DiskStats) + Send + 'static) {
        self.send(Command::Stats(Box::new(handler)));
    }

    /// Asks the actor to finish outstanding work and exit.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        // A send failure means the actor is gone; handlers are dropped.
        let _ = self.cmd_tx.send(command);
    }
}

struct Disk {
    settings: DiskSettings,
    pool: WorkerPool,
    read_cache: WTinyLfu<CacheKey, BlockSource>,
    buffer_pool: Arc<DiskBufferPool>,
    /// Sorted by id; looked up by binary search.
    torrents: Vec<TorrentEntry>,
    stats: DiskStats,
    event_tx: UnboundedSender<Event>,
    shutting_down: bool,
}

impl Disk {
    fn new(
        settings: DiskSettings,
        event_tx: UnboundedSender<Event>,
        buffer_pool: Arc<DiskBufferPool>,
    ) -> Self {
        let pool = match settings.concurrency {
            Some(n) => WorkerPool::with_concurrency(n),
            None => WorkerPool::new(),
        };
        let read_cache = WTinyLfu::new(settings.read_cache_capacity);
        Self {
            settings,
            pool,
            read_cache,
            buffer_pool,
            torrents: Vec::new(),
            stats: DiskStats::default(),
            event_tx,
            shutting_down: false,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: UnboundedReceiver<Command>,
        mut event_rx: UnboundedReceiver<Event>,
    ) {
        let mut tick = time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    // A closed command channel means every handle is gone.
                    None => break,
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                },
                Some(event) = event_rx.recv() => self.handle_event(event),
                _ = tick.tick() => self.tick(),
            }
        }
        self.shutdown(&mut event_rx);
    }

    /// Returns false once the actor should exit.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::AllocateTorrent {
                id,
                download_dir,
                name,
                info,
                piece_hashes,
                handler,
            } => self.allocate_torrent(id, download_dir, name, info, piece_hashes, handler),
            Command::SaveBlock {
                id,
                info,
                data,
                save_handler,
                completion_handler,
            } => self.save_block(id, info, data, save_handler, completion_handler),
            Command::FetchBlock { id, info, handler } => self.fetch_block(id, info, handler),
            Command::MoveTorrent {
                id,
                new_dir,
                handler,
            } => self.post_storage_op(id, handler, move |storage| storage.move_to(new_dir)),
            Command::RenameTorrent { id, name, handler } => {
                self.post_storage_op(id, handler, move |storage| storage.rename(name))
            }
            Command::EraseTorrentFiles { id, handler } => self.erase_torrent_files(id, handler),
            Command::EraseTorrentResumeData { id, handler } => {
                let path = resume_file_path(&self.settings.resume_data_path, id);
                self.post_op(id, handler, move || match fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(StorageError::Io(e)),
                });
            }
            Command::SaveTorrentResumeData { id, data, handler } => {
                let dir = self.settings.resume_data_path.clone();
                self.post_op(id, handler, move || save_resume_data(&dir, id, &data));
            }
            Command::LoadTorrentResumeData { id, handler } => {
                self.load_torrent_resume_data(id, handler)
            }
            Command::LoadAllTorrentResumeData { handler } => {
                self.load_all_torrent_resume_data(handler)
            }
            Command::CheckStorageIntegrity {
                id,
                pieces,
                handler,
            } => self.check_storage_integrity(id, pieces, handler),
            Command::CreateSha1Digest { data, handler } => {
                let event_tx = self.event_tx.clone();
                self.pool.post(Box::new(move || {
                    let digest: [u8; 20] = Sha1::digest(&data).into();
                    let _ = event_tx.send(Event::Notify(Box::new(move || handler(digest))));
                }));
            }
            Command::SetReadCacheCapacity(capacity) => {
                let capacity = capacity.max(1);
                self.settings.read_cache_capacity = capacity;
                self.read_cache.change_capacity(capacity);
            }
            Command::SetConcurrency(concurrency) => {
                self.settings.concurrency = Some(concurrency);
                self.pool.change_concurrency(concurrency);
            }
            Command::SetResumeDataPath(path) => self.settings.resume_data_path = path,
            Command::Stats(handler) => handler(self.stats_snapshot()),
            Command::Shutdown => return false,
        }
        true
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::BlocksSaved {
                id,
                piece_index,
                work,
                saved,
                failed,
                error,
            } => self.on_blocks_saved(id, piece_index, work, saved, failed, error),
            Event::PieceComplete {
                id,
                piece_index,
                work,
                verdict,
                saved,
                unsaved,
                error,
            } => self.on_piece_complete(id, piece_index, work, verdict, saved, unsaved, error),
            Event::BlocksRead { id, info, result } => self.on_blocks_read(id, info, result),
            Event::Notify(notify) => notify(),
        }
    }

    // -------
    // torrent registry
    // -------

    fn find_entry(&self, id: TorrentId) -> Option<usize> {
        self.torrents.binary_search_by_key(&id, |t| t.id).ok()
    }

    fn allocate_torrent(
        &mut self,
        id: TorrentId,
        download_dir: PathBuf,
        name: String,
        info: StorageInfo,
        piece_hashes: Bytes,
        handler: AllocateHandler,
    ) {
        if self.find_entry(id).is_some() {
            tracing::warn!(id, "torrent already allocated");
            handler(Err(DiskError::OperationAborted));
            return;
        }
        // Allocation only creates the directory tree, which is cheap
        // enough to do inline instead of going through the pool.
        let storage = TorrentStorage::new(download_dir, name, info)
            .and_then(|storage| storage.allocate().map(|()| storage));
        match storage {
            Ok(storage) => {
                let storage = Arc::new(storage);
                let position = self.torrents.partition_point(|t| t.id < id);
                self.torrents.insert(
                    position,
                    TorrentEntry::new(id, Arc::clone(&storage), piece_hashes),
                );
                tracing::debug!(id, "torrent allocated");
                handler(Ok(storage));
            }
            Err(e) => handler(Err(e.into())),
        }
    }

    // -------
    // writing
    // -------

    fn save_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        data: DiskBuffer,
        save_handler: SaveHandler,
        completion_handler: PieceCompletionHandler,
    ) {
        let now = Instant::now();
        let capacity = self.settings.write_buffer_capacity as usize;
        let Some(entry_index) = self.find_entry(id) else {
            save_handler(Err(DiskError::OperationAborted));
            return;
        };
        let entry = &mut self.torrents[entry_index];
        let piece_length = entry.storage.piece_length(info.piece_index);
        if !info.is_valid(piece_length) || data.len() != info.length as usize {
            save_handler(Err(DiskError::InvalidBlock));
            return;
        }

        let gated = entry.retry_gated(now);
        let piece = entry
            .pieces
            .entry(info.piece_index)
            .or_insert_with(|| PartialPiece::new(info.piece_index, piece_length, completion_handler));

        if piece.save_progress.has(info.index_in_piece()) || piece.has_buffered(info.offset) {
            save_handler(Err(DiskError::DuplicateBlock));
            return;
        }
        // With the buffer full and saving stalled on disk errors there is
        // nowhere to put the block.
        if piece.buffer.len() >= capacity && gated {
            save_handler(Err(DiskError::BlockDropped));
            return;
        }

        piece.insert_block(Block {
            offset: info.offset,
            data,
            save_handler: Some(save_handler),
        });
        self.dispatch_write(entry_index, info.piece_index);
    }

    /// Decides what, if anything, to do with a piece's buffered blocks:
    /// finish the piece, hash-and-save a full cache line, force-flush an
    /// overgrown buffer, or arm the expiry timer and wait for more blocks.
    fn dispatch_write(&mut self, entry_index: usize, piece_index: u32) {
        if self.shutting_down {
            return;
        }
        enum Action {
            Complete,
            HashAndSave(Range<usize>),
            Flush,
        }

        let now = Instant::now();
        let line_size = self.settings.write_cache_line_size as usize;
        let capacity = self.settings.write_buffer_capacity as usize;

        let action = {
            let entry = &mut self.torrents[entry_index];
            if entry.retry_gated(now) {
                return;
            }
            let Some(piece) = entry.pieces.get_mut(&piece_index) else {
                return;
            };
            if piece.is_busy || piece.buffer.is_empty() {
                return;
            }
            if piece.is_complete() {
                Action::Complete
            } else {
                let unhashed = piece
                    .work
                    .as_ref()
                    .expect("idle piece owns its work state")
                    .unhashed_offset;
                let hashable = piece.hashable_range(unhashed);
                if hashable.len() >= line_size {
                    Action::HashAndSave(hashable)
                } else if piece.buffer.len() >= capacity {
                    Action::Flush
                } else {
                    if piece.expiry.is_none() {
                        piece.expiry = Some(now + WRITE_BUFFER_EXPIRY);
                    }
                    return;
                }
            }
        };

        match action {
            Action::Complete => self.spawn_complete_piece(entry_index, piece_index),
            Action::HashAndSave(range) => self.spawn_hash_and_save(entry_index, piece_index, range),
            Action::Flush => self.spawn_flush(entry_index, piece_index),
        }
    }

    /// Marks the piece busy and moves the chosen blocks plus the hash
    /// state out for a worker. Returns everything a job needs.
    #[allow(clippy::type_complexity)]
    fn checkout_piece(
        &mut self,
        entry_index: usize,
        piece_index: u32,
        range: Option<Range<usize>>,
    ) -> (
        Arc<TorrentStorage>,
        TorrentId,
        PieceWork,
        Vec<Block>,
        OpGuard,
        UnboundedSender<Event>,
    ) {
        let entry = &mut self.torrents[entry_index];
        let piece = entry.pieces.get_mut(&piece_index).expect("piece exists");
        debug_assert!(!piece.is_busy);
        piece.is_busy = true;
        let work = piece.work.take().expect("idle piece owns its work state");
        let blocks: Vec<Block> = match range {
            Some(range) => piece.buffer.drain(range).collect(),
            None => piece.buffer.drain(..).collect(),
        };
        if piece.buffer.is_empty() {
            piece.expiry = None;
        }
        (
            Arc::clone(&entry.storage),
            entry.id,
            work,
            blocks,
            OpGuard::new(&entry.num_pending_ops),
            self.event_tx.clone(),
        )
    }

    fn spawn_hash_and_save(&mut self, entry_index: usize, piece_index: u32, range: Range<usize>) {
        let (storage, id, work, blocks, guard, event_tx) =
            self.checkout_piece(entry_index, piece_index, Some(range));
        tracing::trace!(id, piece_index, blocks = blocks.len(), "hash and save");
        self.pool.post(Box::new(move || {
            hash_and_save_blocks(&storage, id, piece_index, work, blocks, &event_tx);
            drop(guard);
        }));
    }

    fn spawn_flush(&mut self, entry_index: usize, piece_index: u32) {
        let (storage, id, work, blocks, guard, event_tx) =
            self.checkout_piece(entry_index, piece_index, None);
        tracing::trace!(id, piece_index, blocks = blocks.len(), "flushing write buffer");
        self.pool.post(Box::new(move || {
            flush_buffer(&storage, id, piece_index, work, blocks, &event_tx);
            drop(guard);
        }));
    }

    fn spawn_complete_piece(&mut self, entry_index: usize, piece_index: u32) {
        let expected = self.torrents[entry_index]
            .expected_piece_hash(piece_index)
            .unwrap_or([0; 20]);
        let piece_length = self.torrents[entry_index]
            .storage
            .piece_length(piece_index);
        let (storage, id, work, blocks, guard, event_tx) =
            self.checkout_piece(entry_index, piece_index, None);
        tracing::trace!(id, piece_index, "piece complete, finishing hash");
        self.pool.post(Box::new(move || {
            handle_complete_piece(
                &storage,
                id,
                piece_index,
                piece_length,
                expected,
                work,
                blocks,
                &event_tx,
            );
            drop(guard);
        }));
    }

    fn on_blocks_saved(
        &mut self,
        id: TorrentId,
        piece_index: u32,
        work: PieceWork,
        saved: Vec<Block>,
        failed: Vec<Block>,
        error: Option<StorageError>,
    ) {
        let Some(entry_index) = self.find_entry(id) else {
            return;
        };
        let num_saved = saved.len() as u64;
        {
            let entry = &mut self.torrents[entry_index];
            let Some(piece) = entry.pieces.get_mut(&piece_index) else {
                return;
            };
            piece.is_busy = false;
            piece.work = Some(work);
            for mut block in saved {
                let index = (block.offset / BLOCK_SIZE) as usize;
                if !piece.save_progress.has(index) {
                    piece.save_progress.set(index);
                    piece.num_saved_blocks += 1;
                }
                if let Some(handler) = block.save_handler.take() {
                    handler(Ok(()));
                }
            }
            if failed.is_empty() {
                entry.backoff.reset();
                entry.retry_at = None;
            } else {
                tracing::warn!(
                    id,
                    piece_index,
                    blocks = failed.len(),
                    error = %error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "saving blocks failed, restoring to buffer"
                );
                conclude_displaced(piece.restore_blocks(failed));
                let delay = entry.backoff.next_delay();
                entry.retry_at = Some(Instant::now() + delay);
            }
            purge_duplicate_buffered(piece);
        }
        self.stats.num_blocks_written += num_saved;
        // A batch may have accumulated while the worker held the piece.
        self.dispatch_write(entry_index, piece_index);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_piece_complete(
        &mut self,
        id: TorrentId,
        piece_index: u32,
        work: PieceWork,
        verdict: Option<bool>,
        saved: Vec<Block>,
        unsaved: Vec<Block>,
        error: Option<StorageError>,
    ) {
        let Some(entry_index) = self.find_entry(id) else {
            return;
        };
        let num_saved = saved.len() as u64;
        let mut destroyed = false;
        {
            let entry = &mut self.torrents[entry_index];
            let Some(piece) = entry.pieces.get_mut(&piece_index) else {
                return;
            };
            piece.is_busy = false;
            piece.work = Some(work);
            match verdict {
                None => {
                    // Hashing was cut short by a read-back failure; the
                    // piece keeps its state and is retried later.
                    tracing::warn!(
                        id,
                        piece_index,
                        error = %error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                        "piece hash read-back failed"
                    );
                    conclude_displaced(piece.restore_blocks(unsaved));
                    let delay = entry.backoff.next_delay();
                    entry.retry_at = Some(Instant::now() + delay);
                }
                Some(false) => {
                    tracing::debug!(id, piece_index, "piece failed hash check");
                    if let Some(handler) = piece.completion_handler.take() {
                        handler(false);
                    }
                    for mut block in unsaved {
                        if let Some(handler) = block.save_handler.take() {
                            handler(Err(DiskError::CorruptDataDropped));
                        }
                    }
                    // Blocks that arrived while the worker was hashing
                    // belong to the same corrupt piece.
                    for mut block in piece.buffer.drain(..) {
                        if let Some(handler) = block.save_handler.take() {
                            handler(Err(DiskError::CorruptDataDropped));
                        }
                    }
                    entry.pieces.remove(&piece_index);
                    destroyed = true;
                }
                Some(true) => {
                    tracing::debug!(id, piece_index, "piece passed hash check");
                    if let Some(handler) = piece.completion_handler.take() {
                        handler(true);
                    }
                    for mut block in saved {
                        let index = (block.offset / BLOCK_SIZE) as usize;
                        if !piece.save_progress.has(index) {
                            piece.save_progress.set(index);
                            piece.num_saved_blocks += 1;
                        }
                        if let Some(handler) = block.save_handler.take() {
                            handler(Ok(()));
                        }
                    }
                    if unsaved.is_empty() {
                        entry.backoff.reset();
                        entry.retry_at = None;
                    } else {
                        tracing::warn!(
                            id,
                            piece_index,
                            blocks = unsaved.len(),
                            "saving verified piece failed, will retry"
                        );
                        conclude_displaced(piece.restore_blocks(unsaved));
                        let delay = entry.backoff.next_delay();
                        entry.retry_at = Some(Instant::now() + delay);
                    }
                    purge_duplicate_buffered(piece);
                    if piece.save_progress.is_complete() && piece.buffer.is_empty() {
                        entry.pieces.remove(&piece_index);
                        destroyed = true;
                    }
                }
            }
        }
        self.stats.num_blocks_written += num_saved;
        if !destroyed {
            self.dispatch_write(entry_index, piece_index);
        }
    }

    // -------
    // reading
    // -------

    fn fetch_block(&mut self, id: TorrentId, info: BlockInfo, handler: FetchHandler) {
        let Some(entry_index) = self.find_entry(id) else {
            handler(Err(DiskError::OperationAborted));
            return;
        };
        let piece_length = self.torrents[entry_index]
            .storage
            .piece_length(info.piece_index);
        if !info.is_valid(piece_length) {
            handler(Err(DiskError::InvalidBlock));
            return;
        }

        let key = CacheKey {
            torrent: id,
            piece: info.piece_index,
            offset: info.offset,
        };
        if let Some(source) = self.read_cache.get(&key) {
            self.stats.num_read_cache_hits += 1;
            handler(Ok(source.clone()));
            return;
        }
        self.stats.num_read_cache_misses += 1;

        // If an in-flight read already covers this block, wait for it
        // instead of reading the same region twice.
        let entry = &mut self.torrents[entry_index];
        if let Some(fetch) = entry
            .block_fetches
            .iter_mut()
            .find(|f| f.covers(info.piece_index, info.offset))
        {
            fetch.subscribe(FetchSubscriber {
                handler,
                requested_offset: info.offset,
            });
            return;
        }

        self.dispatch_read(entry_index, info, handler);
    }

    /// Expands the request into a read-ahead span where configured and
    /// hands it to a worker.
    fn dispatch_read(&mut self, entry_index: usize, info: BlockInfo, handler: FetchHandler) {
        let entry = &self.torrents[entry_index];
        let id = entry.id;
        let piece_length = entry.storage.piece_length(info.piece_index);
        let blocks_in_piece = piece_length.div_ceil(BLOCK_SIZE);
        let first_block = info.offset / BLOCK_SIZE;

        let num_blocks = if !self.settings.read_ahead_enabled
            || first_block + 1 >= blocks_in_piece
        {
            1
        } else {
            let mut span = self
                .settings
                .read_cache_line_size
                .min(blocks_in_piece - first_block);
            // Stop the span at the first block that is already cached.
            for ahead in 1..span {
                let key = CacheKey {
                    torrent: id,
                    piece: info.piece_index,
                    offset: info.offset + ahead * BLOCK_SIZE,
                };
                if self.read_cache.contains(&key) {
                    span = ahead;
                    break;
                }
            }
            span
        };
        let end = (info.offset + num_blocks * BLOCK_SIZE).min(piece_length);
        let length = end - info.offset;

        let entry = &mut self.torrents[entry_index];
        entry.block_fetches.push(BlockFetch {
            info,
            num_blocks,
            subscribers: vec![FetchSubscriber {
                handler,
                requested_offset: info.offset,
            }],
        });
        let storage = Arc::clone(&entry.storage);
        let guard = OpGuard::new(&entry.num_pending_ops);
        let event_tx = self.event_tx.clone();
        tracing::trace!(id, piece = info.piece_index, offset = info.offset, num_blocks, "dispatching read");
        self.pool.post(Box::new(move || {
            let result = storage.read_blocks(info.piece_index, info.offset, length);
            let _ = event_tx.send(Event::BlocksRead { id, info, result });
            drop(guard);
        }));
    }

    fn on_blocks_read(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        result: Result<Vec<BlockSource>, StorageError>,
    ) {
        let Some(entry_index) = self.find_entry(id) else {
            return;
        };
        let fetch = {
            let entry = &mut self.torrents[entry_index];
            let Some(position) = entry.block_fetches.iter().position(|f| {
                f.info.piece_index == info.piece_index && f.info.offset == info.offset
            }) else {
                return;
            };
            entry.block_fetches.remove(position)
        };

        match result {
            Ok(blocks) => {
                self.stats.num_blocks_read += blocks.len() as u64;
                for block in &blocks {
                    self.read_cache.insert(
                        CacheKey {
                            torrent: id,
                            piece: block.info.piece_index,
                            offset: block.info.offset,
                        },
                        block.clone(),
                    );
                }
                for subscriber in fetch.subscribers {
                    match blocks
                        .iter()
                        .find(|b| b.info.offset == subscriber.requested_offset)
                    {
                        Some(block) => (subscriber.handler)(Ok(block.clone())),
                        None => (subscriber.handler)(Err(DiskError::OperationAborted)),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(id, piece = info.piece_index, error = %e, "block read failed");
                let error = DiskError::from(e);
                for subscriber in fetch.subscribers {
                    (subscriber.handler)(Err(error.clone()));
                }
            }
        }
    }

    // -------
    // ancillary operations
    // -------

    /// Posts a storage-level operation for `id` to the pool and routes
    /// its outcome back to `handler` on the actor.
    fn post_storage_op(
        &mut self,
        id: TorrentId,
        handler: OpHandler,
        op: impl FnOnce(&TorrentStorage) -> Result<(), StorageError> + Send + 'static,
    ) {
        let Some(entry_index) = self.find_entry(id) else {
            handler(Err(DiskError::OperationAborted));
            return;
        };
        let entry = &self.torrents[entry_index];
        let storage = Arc::clone(&entry.storage);
        let guard = OpGuard::new(&entry.num_pending_ops);
        let event_tx = self.event_tx.clone();
        self.pool.post(Box::new(move || {
            let result = op(&storage).map_err(DiskError::from);
            let _ = event_tx.send(Event::Notify(Box::new(move || handler(result))));
            drop(guard);
        }));
    }

    /// Like `post_storage_op` for operations that only need the torrent
    /// to exist, not its storage.
    fn post_op(
        &mut self,
        id: TorrentId,
        handler: OpHandler,
        op: impl FnOnce() -> Result<(), StorageError> + Send + 'static,
    ) {
        self.post_storage_op(id, handler, move |_| op());
    }

    fn erase_torrent_files(&mut self, id: TorrentId, handler: OpHandler) {
        let resume_path = resume_file_path(&self.settings.resume_data_path, id);
        self.post_storage_op(id, handler, move |storage| {
            storage.erase_files()?;
            match fs::remove_file(&resume_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e)),
            }
        });
    }

    fn load_torrent_resume_data(&mut self, id: TorrentId, handler: ResumeDataHandler) {
        let path = resume_file_path(&self.settings.resume_data_path, id);
        let event_tx = self.event_tx.clone();
        self.pool.post(Box::new(move || {
            let result = fs::read(&path)
                .map(Bytes::from)
                .map_err(|e| DiskError::from(StorageError::Io(e)));
            let _ = event_tx.send(Event::Notify(Box::new(move || handler(result))));
        }));
    }

    fn load_all_torrent_resume_data(&mut self, handler: AllResumeDataHandler) {
        let dir = self.settings.resume_data_path.clone();
        let event_tx = self.event_tx.clone();
        self.pool.post(Box::new(move || {
            let result = load_all_resume_data(&dir).map_err(DiskError::from);
            let _ = event_tx.send(Event::Notify(Box::new(move || handler(result))));
        }));
    }

    fn check_storage_integrity(
        &mut self,
        id: TorrentId,
        pieces: Bitfield,
        handler: IntegrityHandler,
    ) {
        let Some(entry_index) = self.find_entry(id) else {
            handler(Err(DiskError::OperationAborted));
            return;
        };
        let entry = &self.torrents[entry_index];
        let storage = Arc::clone(&entry.storage);
        let hashes = entry.piece_hashes.clone();
        let guard = OpGuard::new(&entry.num_pending_ops);
        let event_tx = self.event_tx.clone();
        self.pool.post(Box::new(move || {
            let mut valid = Bitfield::new(pieces.len());
            for index in pieces.set_indices() {
                let Some(expected) = hashes.get(index * 20..index * 20 + 20) else {
                    continue;
                };
                match storage.read_piece(index as u32) {
                    Ok(data) => {
                        let digest: [u8; 20] = Sha1::digest(&data).into();
                        if digest == expected {
                            valid.set(index);
                        }
                    }
                    Err(e) => {
                        tracing::trace!(id, piece = index, error = %e, "integrity check read failed");
                    }
                }
            }
            tracing::debug!(id, valid = valid.count(), checked = pieces.count(), "integrity check finished");
            let _ = event_tx.send(Event::Notify(Box::new(move || handler(Ok(valid)))));
            drop(guard);
        }));
    }

    // -------
    // timers, stats, shutdown
    // -------

    fn tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = Instant::now();
        for entry_index in 0..self.torrents.len() {
            // Reopen the retry gate and reattempt stalled pieces.
            if self.torrents[entry_index]
                .retry_at
                .is_some_and(|at| at <= now)
            {
                self.torrents[entry_index].retry_at = None;
                let stalled: Vec<u32> = self.torrents[entry_index]
                    .pieces
                    .iter()
                    .filter(|(_, p)| !p.is_busy && !p.buffer.is_empty())
                    .map(|(index, _)| *index)
                    .collect();
                for piece_index in stalled {
                    self.dispatch_write(entry_index, piece_index);
                }
            }

            // Flush pieces whose buffered blocks lingered too long.
            let expired: Vec<u32> = self.torrents[entry_index]
                .pieces
                .iter()
                .filter(|(_, p)| !p.is_busy && p.expiry.is_some_and(|at| at <= now))
                .map(|(index, _)| *index)
                .collect();
            for piece_index in expired {
                let entry = &mut self.torrents[entry_index];
                if let Some(piece) = entry.pieces.get_mut(&piece_index) {
                    piece.expiry = None;
                }
                if entry.retry_gated(now) {
                    continue;
                }
                let Some(piece) = entry.pieces.get(&piece_index) else {
                    continue;
                };
                if piece.buffer.is_empty() {
                    continue;
                }
                tracing::trace!(piece_index, "write buffer expired, flushing");
                if piece.is_complete() {
                    self.dispatch_write(entry_index, piece_index);
                } else {
                    self.spawn_flush(entry_index, piece_index);
                }
            }
        }
    }

    fn stats_snapshot(&self) -> DiskStats {
        let mut stats = self.stats.clone();
        stats.read_cache_capacity = self.read_cache.capacity();
        stats.read_cache_size = self.read_cache.size();
        stats.num_partial_pieces = self.torrents.iter().map(|t| t.pieces.len()).sum();
        stats.num_buffered_blocks = self.torrents.iter().map(|t| t.num_buffered_blocks()).sum();
        stats
    }

    fn shutdown(&mut self, event_rx: &mut UnboundedReceiver<Event>) {
        tracing::debug!("disk core shutting down");
        self.shutting_down = true;

        // Last chance for lingering buffered blocks to reach disk.
        for entry_index in 0..self.torrents.len() {
            let flushable: Vec<(u32, bool)> = self.torrents[entry_index]
                .pieces
                .iter()
                .filter(|(_, p)| !p.is_busy && !p.buffer.is_empty())
                .map(|(index, p)| (*index, p.is_complete()))
                .collect();
            for (piece_index, complete) in flushable {
                if complete {
                    self.spawn_complete_piece(entry_index, piece_index);
                } else {
                    self.spawn_flush(entry_index, piece_index);
                }
            }
        }

        // Blocking here is fine: the actor is exiting and the pool must
        // finish its queue before completions can be drained.
        self.pool.join_all();
        while let Ok(event) = event_rx.try_recv() {
            self.handle_event(event);
        }

        for entry in &mut self.torrents {
            for fetch in entry.block_fetches.drain(..) {
                for subscriber in fetch.subscribers {
                    (subscriber.handler)(Err(DiskError::OperationAborted));
                }
            }
            for (_, mut piece) in entry.pieces.drain() {
                for mut block in piece.buffer.drain(..) {
                    if let Some(handler) = block.save_handler.take() {
                        handler(Err(DiskError::OperationAborted));
                    }
                }
            }
            if let Err(e) = entry.storage.flush() {
                tracing::warn!(id = entry.id, error = %e, "flushing storage on shutdown failed");
            }
        }
    }
}

/// Concludes blocks that lost a restore collision: a copy of them was
/// already buffered and possibly hashed, so they are duplicates.
fn conclude_displaced(displaced: Vec<Block>) {
    for mut block in displaced {
        if let Some(handler) = block.save_handler.take() {
            handler(Err(DiskError::DuplicateBlock));
        }
    }
}

/// Fires `DuplicateBlock` for buffered blocks whose save bit got set
/// while they sat in the buffer (the same block was in flight when they
/// arrived).
fn purge_duplicate_buffered(piece: &mut PartialPiece) {
    let buffer = std::mem::take(&mut piece.buffer);
    for mut block in buffer {
        if piece.save_progress.has((block.offset / BLOCK_SIZE) as usize) {
            if let Some(handler) = block.save_handler.take() {
                handler(Err(DiskError::DuplicateBlock));
            }
        } else {
            piece.buffer.push(block);
        }
    }
}

// -------
// worker-side jobs
// -------

/// Hashes a contiguous, hashable run of blocks and writes it with one
/// gathered write.
fn hash_and_save_blocks(
    storage: &TorrentStorage,
    id: TorrentId,
    piece_index: u32,
    mut work: PieceWork,
    blocks: Vec<Block>,
    event_tx: &UnboundedSender<Event>,
) {
    debug_assert_eq!(blocks.first().map(|b| b.offset), Some(work.unhashed_offset));
    for block in &blocks {
        work.hasher.update(&block.data);
        work.unhashed_offset = block.end();
    }
    let start = blocks[0].offset;
    let result = {
        let slices: Vec<&[u8]> = blocks.iter().map(|b| &*b.data).collect();
        storage.write_blocks(piece_index, start, &slices)
    };
    let event = match result {
        Ok(()) => Event::BlocksSaved {
            id,
            piece_index,
            work,
            saved: blocks,
            failed: Vec::new(),
            error: None,
        },
        Err(e) => Event::BlocksSaved {
            id,
            piece_index,
            work,
            saved: Vec::new(),
            failed: blocks,
            error: Some(e),
        },
    };
    let _ = event_tx.send(event);
}

/// Flushes a possibly gappy buffer: hashes whatever prefix is hashable,
/// then writes each contiguous run independently.
fn flush_buffer(
    storage: &TorrentStorage,
    id: TorrentId,
    piece_index: u32,
    mut work: PieceWork,
    blocks: Vec<Block>,
    event_tx: &UnboundedSender<Event>,
) {
    for block in &blocks {
        if block.offset == work.unhashed_offset {
            work.hasher.update(&block.data);
            work.unhashed_offset = block.end();
        } else if block.offset > work.unhashed_offset {
            break;
        }
        // Offsets below `unhashed_offset` were hashed before an earlier
        // failed save; they only need writing.
    }
    let (saved, failed, error) = save_maybe_contiguous_blocks(storage, piece_index, blocks);
    let _ = event_tx.send(Event::BlocksSaved {
        id,
        piece_index,
        work,
        saved,
        failed,
        error,
    });
}

/// Writes blocks grouped into contiguous runs, one gathered write per
/// run. A failing run does not fail the others.
fn save_maybe_contiguous_blocks(
    storage: &TorrentStorage,
    piece_index: u32,
    blocks: Vec<Block>,
) -> (Vec<Block>, Vec<Block>, Option<StorageError>) {
    let mut saved = Vec::new();
    let mut failed = Vec::new();
    let mut error = None;

    let mut run: Vec<Block> = Vec::new();
    let mut flush_run = |run: &mut Vec<Block>,
                         saved: &mut Vec<Block>,
                         failed: &mut Vec<Block>,
                         error: &mut Option<StorageError>| {
        if run.is_empty() {
            return;
        }
        let start = run[0].offset;
        let result = {
            let slices: Vec<&[u8]> = run.iter().map(|b| &*b.data).collect();
            storage.write_blocks(piece_index, start, &slices)
        };
        match result {
            Ok(()) => saved.append(run),
            Err(e) => {
                *error = Some(e);
                failed.append(run);
            }
        }
    };

    for block in blocks {
        if let Some(last) = run.last() {
            if block.offset != last.end() {
                flush_run(&mut run, &mut saved, &mut failed, &mut error);
            }
        }
        run.push(block);
    }
    flush_run(&mut run, &mut saved, &mut failed, &mut error);

    (saved, failed, error)
}

/// Finishes hashing a complete piece, reading back any blocks that were
/// saved unhashed, verifies the digest, and, if it matches, writes the
/// remaining buffered blocks.
#[allow(clippy::too_many_arguments)]
fn handle_complete_piece(
    storage: &TorrentStorage,
    id: TorrentId,
    piece_index: u32,
    piece_length: u32,
    expected: [u8; 20],
    mut work: PieceWork,
    blocks: Vec<Block>,
    event_tx: &UnboundedSender<Event>,
) {
    // Feed the rest of the piece in strict offset order: buffered blocks
    // from memory, already-saved unhashed ranges from disk.
    let mut offset = work.unhashed_offset;
    while offset < piece_length {
        let length = (piece_length - offset).min(BLOCK_SIZE);
        if let Ok(index) = blocks.binary_search_by_key(&offset, |b| b.offset) {
            work.hasher.update(&blocks[index].data);
        } else {
            match storage.read(piece_index, offset, length) {
                Ok(data) => work.hasher.update(&data),
                Err(e) => {
                    let _ = event_tx.send(Event::PieceComplete {
                        id,
                        piece_index,
                        work,
                        verdict: None,
                        saved: Vec::new(),
                        unsaved: blocks,
                        error: Some(e),
                    });
                    return;
                }
            }
        }
        offset += length;
        work.unhashed_offset = offset;
    }

    let digest = work.digest();
    if digest != expected {
        let _ = event_tx.send(Event::PieceComplete {
            id,
            piece_index,
            work,
            verdict: Some(false),
            saved: Vec::new(),
            unsaved: blocks,
            error: None,
        });
        return;
    }

    let (saved, unsaved, error) = save_maybe_contiguous_blocks(storage, piece_index, blocks);
    let _ = event_tx.send(Event::PieceComplete {
        id,
        piece_index,
        work,
        verdict: Some(true),
        saved,
        unsaved,
        error,
    });
}

// -------
// resume data files
// -------

fn resume_file_path(dir: &Path, id: TorrentId) -> PathBuf {
    dir.join(format!("{id}.{RESUME_FILE_EXTENSION}"))
}

/// Writes resume data to a temporary file, then renames it into place so
/// a crash never leaves a truncated file behind.
fn save_resume_data(dir: &Path, id: TorrentId, data: &[u8]) -> Result<(), StorageError> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{id}.{RESUME_FILE_EXTENSION}.tmp"));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, resume_file_path(dir, id))?;
    Ok(())
}

fn load_all_resume_data(dir: &Path) -> Result<Vec<Bytes>, StorageError> {
    let mut paths = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // No resume directory simply means no torrents were saved yet.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == RESUME_FILE_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();
    let mut all = Vec::with_capacity(paths.len());
    for path in paths {
        all.push(Bytes::from(fs::read(&path)?));
    }
    Ok(all)
}
