use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::error::StorageError;
use super::file::{AllocationMode, StorageInfo};
use crate::blockinfo::{BlockInfo, BlockSource};
use crate::constants::BLOCK_SIZE;

fn validate_relative_path(path: &Path) -> Result<(), StorageError> {
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug)]
struct FileHandle {
    file: File,
    is_write: bool,
}

/// Per-torrent file-backed storage.
///
/// All I/O is synchronous positioned I/O intended to run on the worker
/// pool; the handles cache and the relocatable root make the type safe to
/// share across worker threads.
#[derive(Debug)]
pub struct TorrentStorage {
    info: StorageInfo,
    /// Directory containing the torrent's root directory.
    download_dir: RwLock<PathBuf>,
    /// Name of the torrent's root directory under `download_dir`.
    name: RwLock<String>,
    allocation_mode: AllocationMode,
    handles: DashMap<usize, Arc<FileHandle>>,
}

impl TorrentStorage {
    pub fn new(
        download_dir: PathBuf,
        name: String,
        info: StorageInfo,
    ) -> Result<Self, StorageError> {
        validate_relative_path(Path::new(&name))?;
        for file in &info.files {
            validate_relative_path(&file.path)?;
        }
        Ok(Self {
            info,
            download_dir: RwLock::new(download_dir),
            name: RwLock::new(name),
            allocation_mode: AllocationMode::Sparse,
            handles: DashMap::new(),
        })
    }

    pub fn with_allocation_mode(mut self, mode: AllocationMode) -> Self {
        self.allocation_mode = mode;
        self
    }

    pub fn info(&self) -> &StorageInfo {
        &self.info
    }

    pub fn num_pieces(&self) -> u32 {
        self.info.num_pieces()
    }

    pub fn piece_length(&self, index: u32) -> u32 {
        self.info.piece_length(index)
    }

    /// The torrent's root directory (`download_dir/name`).
    pub fn root_dir(&self) -> PathBuf {
        self.download_dir.read().join(&*self.name.read())
    }

    fn file_path(&self, file_index: usize) -> PathBuf {
        self.root_dir().join(&self.info.files[file_index].path)
    }

    /// Creates the directory tree (and, in full-allocation mode, the files
    /// at their final lengths).
    pub fn allocate(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.root_dir())?;
        for (index, entry) in self.info.files.iter().enumerate() {
            let path = self.file_path(index);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            if self.allocation_mode == AllocationMode::Full {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false)
                    .open(&path)?;
                file.set_len(entry.length)?;
            }
        }
        Ok(())
    }

    fn get_or_open(&self, file_index: usize, write: bool) -> Result<Arc<FileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            if handle.is_write || !write {
                return Ok(Arc::clone(&handle));
            }
            // Read handle needs upgrading.
            drop(handle);
            self.handles.remove(&file_index);
        }

        let path = self.file_path(file_index);
        let handle = if write {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            Arc::new(FileHandle {
                file,
                is_write: true,
            })
        } else {
            let file = File::open(&path)
                .map_err(|_| StorageError::FileNotFound(path.display().to_string()))?;
            Arc::new(FileHandle {
                file,
                is_write: false,
            })
        };

        self.handles.insert(file_index, Arc::clone(&handle));
        Ok(handle)
    }

    fn check_range(&self, piece: u32, offset: u32, length: u32) -> Result<(), StorageError> {
        let piece_length = self.info.piece_length(piece);
        if piece_length == 0 {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        if offset as u64 + length as u64 > piece_length as u64 {
            return Err(StorageError::InvalidBlock { piece, offset });
        }
        Ok(())
    }

    /// Writes a contiguous run of blocks starting at `offset` within
    /// `piece` with one gathered write per touched file region.
    pub fn write_blocks(
        &self,
        piece: u32,
        offset: u32,
        blocks: &[&[u8]],
    ) -> Result<(), StorageError> {
        let total: usize = blocks.iter().map(|b| b.len()).sum();
        self.check_range(piece, offset, total as u32)?;

        // Gather the run into one buffer, then cut it along file spans.
        let mut gathered = Vec::with_capacity(total);
        for block in blocks {
            gathered.extend_from_slice(block);
        }

        let mut consumed = 0usize;
        for span in self.info.file_spans(piece, offset, total as u32) {
            let handle = self.get_or_open(span.file_index, true)?;
            let chunk = &gathered[consumed..consumed + span.length as usize];
            write_all_at(&handle.file, chunk, span.file_offset)?;
            consumed += span.length as usize;
        }
        Ok(())
    }

    /// Reads `length` bytes starting at `offset` within `piece`.
    pub fn read(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        self.check_range(piece, offset, length)?;
        let mut data = BytesMut::zeroed(length as usize);
        let mut filled = 0usize;
        for span in self.info.file_spans(piece, offset, length) {
            let handle = self.get_or_open(span.file_index, false)?;
            let chunk = &mut data[filled..filled + span.length as usize];
            read_exact_at(&handle.file, chunk, span.file_offset)?;
            filled += span.length as usize;
        }
        Ok(data.freeze())
    }

    /// Reads one block.
    pub fn read_block(&self, info: &BlockInfo) -> Result<BlockSource, StorageError> {
        let data = self.read(info.piece_index, info.offset, info.length)?;
        Ok(BlockSource { info: *info, data })
    }

    /// Reads a contiguous span and returns it cut into block-sized
    /// sources. The split is zero-copy: each source shares the one read
    /// buffer.
    pub fn read_blocks(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Vec<BlockSource>, StorageError> {
        let data = self.read(piece, offset, length)?;
        let mut sources = Vec::with_capacity(length.div_ceil(BLOCK_SIZE) as usize);
        let mut cursor = 0u32;
        while cursor < length {
            let len = (length - cursor).min(BLOCK_SIZE);
            sources.push(BlockSource {
                info: BlockInfo::new(piece, offset + cursor, len),
                data: data.slice(cursor as usize..(cursor + len) as usize),
            });
            cursor += len;
        }
        Ok(sources)
    }

    /// Reads an entire piece.
    pub fn read_piece(&self, piece: u32) -> Result<Bytes, StorageError> {
        let length = self.info.piece_length(piece);
        if length == 0 {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        self.read(piece, 0, length)
    }

    /// Moves the torrent's root directory under `new_dir`.
    pub fn move_to(&self, new_dir: PathBuf) -> Result<(), StorageError> {
        self.handles.clear();
        let name = self.name.read().clone();
        let old_root = self.download_dir.read().join(&name);
        fs::create_dir_all(&new_dir)?;
        if old_root.exists() {
            fs::rename(&old_root, new_dir.join(&name))?;
        }
        *self.download_dir.write() = new_dir;
        tracing::debug!(root = %self.root_dir().display(), "torrent storage moved");
        Ok(())
    }

    /// Renames the torrent's root directory.
    pub fn rename(&self, new_name: String) -> Result<(), StorageError> {
        validate_relative_path(Path::new(&new_name))?;
        self.handles.clear();
        let dir = self.download_dir.read().clone();
        let old_root = dir.join(&*self.name.read());
        if old_root.exists() {
            fs::rename(&old_root, dir.join(&new_name))?;
        }
        *self.name.write() = new_name;
        Ok(())
    }

    /// Removes every file of the torrent. Removing an already-absent tree
    /// succeeds.
    pub fn erase_files(&self) -> Result<(), StorageError> {
        self.handles.clear();
        match fs::remove_dir_all(self.root_dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Syncs written data and drops cached handles.
    pub fn flush(&self) -> Result<(), StorageError> {
        let keys: Vec<usize> = self.handles.iter().map(|r| *r.key()).collect();
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.is_write {
                    handle.file.sync_data()?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset)?;
        written += n;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
        offset += n as u64;
    }
    Ok(())
}
