//! End-to-end tests of the write and read pipelines against a real
//! tempdir-backed storage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use super::*;
use crate::bitfield::Bitfield;
use crate::blockinfo::BlockInfo;
use crate::constants::BLOCK_SIZE;
use crate::storage::{FileEntry, StorageInfo, TorrentStorage};
use crate::TorrentId;

const TORRENT: TorrentId = 7;

/// Events delivered by the pipeline's handlers, in delivery order.
#[derive(Debug)]
enum PipelineEvent {
    Completion(bool),
    Saved(u32, Result<(), DiskError>),
}

struct Harness {
    handle: DiskHandle,
    join: task::JoinHandle<()>,
    storage: Arc<TorrentStorage>,
    content: Vec<u8>,
    // Removing the tempdir removes the torrent's files.
    tmp: TempDir,
}

/// Deterministic torrent content.
fn make_content(total: usize) -> Vec<u8> {
    (0..total).map(|i| (i % 251) as u8).collect()
}

fn piece_hashes(content: &[u8], piece_length: u32) -> Bytes {
    let mut hashes = Vec::new();
    for piece in content.chunks(piece_length as usize) {
        let digest: [u8; 20] = Sha1::digest(piece).into();
        hashes.extend_from_slice(&digest);
    }
    Bytes::from(hashes)
}

async fn setup(settings: DiskSettings, piece_length: u32, total: usize) -> Harness {
    let tmp = TempDir::new().unwrap();
    let content = make_content(total);
    let (handle, join) = spawn(settings);

    let info = StorageInfo {
        piece_length,
        total_length: total as u64,
        files: vec![FileEntry::new(PathBuf::from("data.bin"), total as u64, 0)],
    };
    let (tx, rx) = oneshot::channel();
    handle.allocate_torrent(
        TORRENT,
        tmp.path().to_path_buf(),
        "t".into(),
        info,
        piece_hashes(&content, piece_length),
        move |result| {
            tx.send(result).unwrap();
        },
    );
    let storage = rx.await.unwrap().expect("allocation succeeds");

    Harness {
        handle,
        join,
        storage,
        content,
        tmp,
    }
}

impl Harness {
    fn block_data(&self, piece: u32, offset: u32) -> &[u8] {
        let piece_length = self.storage.piece_length(piece);
        let start = piece as usize * self.storage.info().piece_length as usize + offset as usize;
        let len = (piece_length - offset).min(BLOCK_SIZE) as usize;
        &self.content[start..start + len]
    }

    /// Queues one block save, reporting outcomes into `events`.
    fn save(&self, piece: u32, offset: u32, events: &mpsc::UnboundedSender<PipelineEvent>) {
        self.save_data(piece, offset, self.block_data(piece, offset).to_vec(), events);
    }

    fn save_data(
        &self,
        piece: u32,
        offset: u32,
        data: Vec<u8>,
        events: &mpsc::UnboundedSender<PipelineEvent>,
    ) {
        let info = BlockInfo::new(piece, offset, data.len() as u32);
        let buffer = self.handle.get_disk_buffer_from(&data);
        let save_tx = events.clone();
        let completion_tx = events.clone();
        self.handle.save_block(
            TORRENT,
            info,
            buffer,
            move |result| {
                let _ = save_tx.send(PipelineEvent::Saved(offset, result));
            },
            move |valid| {
                let _ = completion_tx.send(PipelineEvent::Completion(valid));
            },
        );
    }

    async fn stats(&self) -> DiskStats {
        let (tx, rx) = oneshot::channel();
        self.handle.stats(move |stats| {
            let _ = tx.send(stats);
        });
        rx.await.unwrap()
    }

    async fn finish(self) {
        self.handle.shutdown();
        self.join.await.unwrap();
    }
}

async fn recv_events(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>, n: usize) -> Vec<PipelineEvent> {
    let mut events = Vec::with_capacity(n);
    for _ in 0..n {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("pipeline event within timeout")
            .expect("pipeline channel open");
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_in_order_save_completes_piece() {
    let harness = setup(DiskSettings::default(), 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for block in 0..4u32 {
        harness.save(0, block * BLOCK_SIZE, &tx);
    }

    let events = recv_events(&mut rx, 5).await;
    // The hash verdict lands before any of the piece's save outcomes.
    assert!(matches!(events[0], PipelineEvent::Completion(true)));
    let mut saved: Vec<u32> = events[1..]
        .iter()
        .map(|e| match e {
            PipelineEvent::Saved(offset, Ok(())) => *offset / BLOCK_SIZE,
            other => panic!("unexpected event: {other:?}"),
        })
        .collect();
    saved.sort_unstable();
    assert_eq!(saved, vec![0, 1, 2, 3]);

    // The piece landed on disk intact.
    let on_disk = harness.storage.read_piece(0).unwrap();
    assert_eq!(on_disk.as_ref(), &harness.content[..]);

    let stats = harness.stats().await;
    assert_eq!(stats.num_blocks_written, 4);
    assert_eq!(stats.num_partial_pieces, 0);
    harness.finish().await;
}

#[tokio::test]
async fn test_out_of_order_blocks_hash_in_offset_order() {
    let settings = DiskSettings {
        write_cache_line_size: 4,
        write_buffer_capacity: 8,
        ..Default::default()
    };
    let harness = setup(settings, 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for block in [3u32, 1, 2, 0] {
        harness.save(0, block * BLOCK_SIZE, &tx);
    }

    let events = recv_events(&mut rx, 5).await;
    // A correct digest proves the hasher saw the bytes in offset order,
    // not arrival order.
    assert!(matches!(events[0], PipelineEvent::Completion(true)));
    assert_eq!(
        harness.storage.read_piece(0).unwrap().as_ref(),
        &harness.content[..]
    );
    harness.finish().await;
}

#[tokio::test]
async fn test_forced_flush_with_gap_then_readback() {
    let settings = DiskSettings {
        write_cache_line_size: 4,
        write_buffer_capacity: 3,
        ..Default::default()
    };
    let harness = setup(settings, 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Three buffered blocks with a gap at block 1 hit the forced-flush
    // threshold: block 0 is hashed, blocks 2 and 3 are saved unhashed.
    harness.save(0, 0, &tx);
    harness.save(0, 2 * BLOCK_SIZE, &tx);
    harness.save(0, 3 * BLOCK_SIZE, &tx);

    let events = recv_events(&mut rx, 3).await;
    let mut flushed: Vec<u32> = events
        .iter()
        .map(|e| match e {
            PipelineEvent::Saved(offset, Ok(())) => *offset / BLOCK_SIZE,
            other => panic!("unexpected event: {other:?}"),
        })
        .collect();
    flushed.sort_unstable();
    assert_eq!(flushed, vec![0, 2, 3]);

    // The missing block completes the piece; the saved-but-unhashed
    // blocks are read back from disk to finish the digest.
    harness.save(0, BLOCK_SIZE, &tx);
    let events = recv_events(&mut rx, 2).await;
    assert!(matches!(events[0], PipelineEvent::Completion(true)));
    assert!(matches!(events[1], PipelineEvent::Saved(offset, Ok(())) if offset == BLOCK_SIZE));

    assert_eq!(
        harness.storage.read_piece(0).unwrap().as_ref(),
        &harness.content[..]
    );
    harness.finish().await;
}

#[tokio::test]
async fn test_hash_mismatch_drops_buffered_blocks() {
    let harness = setup(DiskSettings::default(), 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for block in 0..3u32 {
        harness.save(0, block * BLOCK_SIZE, &tx);
    }
    // The last block carries the wrong bytes.
    harness.save_data(0, 3 * BLOCK_SIZE, vec![0xEE; BLOCK_SIZE as usize], &tx);

    let events = recv_events(&mut rx, 5).await;
    assert!(matches!(events[0], PipelineEvent::Completion(false)));
    for event in &events[1..] {
        assert!(
            matches!(event, PipelineEvent::Saved(_, Err(DiskError::CorruptDataDropped))),
            "unexpected event: {event:?}"
        );
    }

    // The piece state is gone; a redownload starts from scratch.
    let stats = harness.stats().await;
    assert_eq!(stats.num_partial_pieces, 0);
    assert_eq!(stats.num_buffered_blocks, 0);
    harness.finish().await;
}

#[tokio::test]
async fn test_duplicate_and_invalid_blocks_rejected() {
    let harness = setup(DiskSettings::default(), 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    harness.save(0, 0, &tx);
    // Same block again while it is still buffered.
    harness.save(0, 0, &tx);
    let events = recv_events(&mut rx, 1).await;
    assert!(matches!(
        events[0],
        PipelineEvent::Saved(0, Err(DiskError::DuplicateBlock))
    ));

    // Unaligned offset.
    harness.save_data(0, 17, vec![0u8; BLOCK_SIZE as usize], &tx);
    let events = recv_events(&mut rx, 1).await;
    assert!(matches!(
        events[0],
        PipelineEvent::Saved(17, Err(DiskError::InvalidBlock))
    ));

    // Unknown torrent.
    let (done_tx, done_rx) = oneshot::channel();
    harness.handle.save_block(
        99,
        BlockInfo::new(0, 0, BLOCK_SIZE),
        harness.handle.get_disk_buffer(BLOCK_SIZE as usize),
        move |result| {
            done_tx.send(result).unwrap();
        },
        |_| {},
    );
    assert!(matches!(
        done_rx.await.unwrap(),
        Err(DiskError::OperationAborted)
    ));
    harness.finish().await;
}

#[tokio::test]
async fn test_concurrent_fetches_coalesce_into_one_read() {
    let settings = DiskSettings {
        read_ahead_enabled: false,
        ..Default::default()
    };
    let harness = setup(settings, 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    // Put the content on disk directly.
    let blocks: Vec<&[u8]> = harness.content.chunks(BLOCK_SIZE as usize).collect();
    harness.storage.write_blocks(0, 0, &blocks).unwrap();

    let info = BlockInfo::new(0, BLOCK_SIZE, BLOCK_SIZE);
    let (tx, mut rx) = mpsc::unbounded_channel();
    for _ in 0..10 {
        let tx = tx.clone();
        harness.handle.fetch_block(TORRENT, info, move |result| {
            let _ = tx.send(result);
        });
    }

    let expected = harness.block_data(0, BLOCK_SIZE);
    for _ in 0..10 {
        let result = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let source = result.expect("fetch succeeds");
        assert_eq!(source.info, info);
        assert_eq!(source.data.as_ref(), expected);
    }

    // However the ten requests interleaved with the read completion, the
    // storage itself was read exactly once.
    let stats = harness.stats().await;
    assert_eq!(stats.num_blocks_read, 1);
    harness.finish().await;
}

#[tokio::test]
async fn test_read_ahead_populates_cache() {
    let settings = DiskSettings {
        read_cache_line_size: 4,
        ..Default::default()
    };
    let harness = setup(settings, 8 * BLOCK_SIZE, 8 * BLOCK_SIZE as usize).await;
    let blocks: Vec<&[u8]> = harness.content.chunks(BLOCK_SIZE as usize).collect();
    harness.storage.write_blocks(0, 0, &blocks).unwrap();

    let fetch = |info: BlockInfo| {
        let handle = harness.handle.clone();
        async move {
            let (tx, rx) = oneshot::channel();
            handle.fetch_block(TORRENT, info, move |result| {
                let _ = tx.send(result);
            });
            rx.await.unwrap().expect("fetch succeeds")
        }
    };

    let first = fetch(BlockInfo::new(0, 0, BLOCK_SIZE)).await;
    assert_eq!(first.data.as_ref(), harness.block_data(0, 0));

    // The read-ahead pulled in four blocks; the following fetches are
    // served from cache without further storage reads.
    let stats = harness.stats().await;
    assert_eq!(stats.num_blocks_read, 4);

    for block in 1..4u32 {
        let source = fetch(BlockInfo::new(0, block * BLOCK_SIZE, BLOCK_SIZE)).await;
        assert_eq!(source.data.as_ref(), harness.block_data(0, block * BLOCK_SIZE));
    }
    let stats = harness.stats().await;
    assert_eq!(stats.num_blocks_read, 4);
    assert!(stats.num_read_cache_hits >= 3);
    harness.finish().await;
}

#[tokio::test]
async fn test_last_block_of_piece_reads_single() {
    let settings = DiskSettings {
        read_cache_line_size: 4,
        ..Default::default()
    };
    // Short last piece: 2 full pieces of 2 blocks, then 1000 bytes.
    let total = 4 * BLOCK_SIZE as usize + 1000;
    let harness = setup(settings, 2 * BLOCK_SIZE, total).await;
    for piece in 0..3u32 {
        let piece_length = harness.storage.piece_length(piece);
        let start = piece as usize * 2 * BLOCK_SIZE as usize;
        let data = &harness.content[start..start + piece_length as usize];
        let blocks: Vec<&[u8]> = data.chunks(BLOCK_SIZE as usize).collect();
        harness.storage.write_blocks(piece, 0, &blocks).unwrap();
    }

    let info = BlockInfo::new(2, 0, 1000);
    let (tx, rx) = oneshot::channel();
    harness.handle.fetch_block(TORRENT, info, move |result| {
        let _ = tx.send(result);
    });
    let source = rx.await.unwrap().expect("fetch succeeds");
    assert_eq!(source.data.len(), 1000);
    assert_eq!(source.data.as_ref(), harness.block_data(2, 0));

    let stats = harness.stats().await;
    assert_eq!(stats.num_blocks_read, 1);
    harness.finish().await;
}

#[tokio::test]
async fn test_resume_data_round_trip() {
    let tmp = TempDir::new().unwrap();
    let settings = DiskSettings {
        resume_data_path: tmp.path().join("resume"),
        ..Default::default()
    };
    let harness = setup(settings, BLOCK_SIZE, BLOCK_SIZE as usize).await;

    let payload = Bytes::from_static(b"d8:completei1ee");
    let (tx, rx) = oneshot::channel();
    harness
        .handle
        .save_torrent_resume_data(TORRENT, payload.clone(), move |result| {
            tx.send(result).unwrap();
        });
    rx.await.unwrap().unwrap();

    let (tx, rx) = oneshot::channel();
    harness.handle.load_torrent_resume_data(TORRENT, move |result| {
        tx.send(result).unwrap();
    });
    assert_eq!(rx.await.unwrap().unwrap(), payload);

    let (tx, rx) = oneshot::channel();
    harness.handle.load_all_torrent_resume_data(move |result| {
        tx.send(result).unwrap();
    });
    let all = rx.await.unwrap().unwrap();
    assert_eq!(all, vec![payload]);

    let (tx, rx) = oneshot::channel();
    harness.handle.erase_torrent_resume_data(TORRENT, move |result| {
        tx.send(result).unwrap();
    });
    rx.await.unwrap().unwrap();

    let (tx, rx) = oneshot::channel();
    harness.handle.load_torrent_resume_data(TORRENT, move |result| {
        tx.send(result).unwrap();
    });
    assert!(rx.await.unwrap().is_err());
    harness.finish().await;
}

#[tokio::test]
async fn test_check_storage_integrity() {
    let harness = setup(DiskSettings::default(), 2 * BLOCK_SIZE, 6 * BLOCK_SIZE as usize).await;
    for piece in 0..3u32 {
        let start = piece as usize * 2 * BLOCK_SIZE as usize;
        let data = &harness.content[start..start + 2 * BLOCK_SIZE as usize];
        let blocks: Vec<&[u8]> = data.chunks(BLOCK_SIZE as usize).collect();
        harness.storage.write_blocks(piece, 0, &blocks).unwrap();
    }
    // Corrupt the middle piece on disk.
    let garbage = vec![0xAAu8; BLOCK_SIZE as usize];
    harness
        .storage
        .write_blocks(1, 0, &[garbage.as_slice()])
        .unwrap();

    let (tx, rx) = oneshot::channel();
    harness
        .handle
        .check_storage_integrity(TORRENT, Bitfield::full(3), move |result| {
            tx.send(result).unwrap();
        });
    let valid = rx.await.unwrap().unwrap();
    assert!(valid.has(0));
    assert!(!valid.has(1));
    assert!(valid.has(2));
    harness.finish().await;
}

#[tokio::test]
async fn test_create_sha1_digest() {
    let harness = setup(DiskSettings::default(), BLOCK_SIZE, BLOCK_SIZE as usize).await;
    let data = Bytes::from_static(b"hello disk");
    let (tx, rx) = oneshot::channel();
    harness.handle.create_sha1_digest(data.clone(), move |digest| {
        tx.send(digest).unwrap();
    });
    let expected: [u8; 20] = Sha1::digest(&data).into();
    assert_eq!(rx.await.unwrap(), expected);
    harness.finish().await;
}

#[tokio::test]
async fn test_move_rename_and_erase() {
    let harness = setup(DiskSettings::default(), BLOCK_SIZE, BLOCK_SIZE as usize).await;
    let blocks: Vec<&[u8]> = harness.content.chunks(BLOCK_SIZE as usize).collect();
    harness.storage.write_blocks(0, 0, &blocks).unwrap();

    let new_dir = harness.tmp.path().join("moved");
    let (tx, rx) = oneshot::channel();
    harness
        .handle
        .move_torrent(TORRENT, new_dir.clone(), move |result| {
            tx.send(result).unwrap();
        });
    rx.await.unwrap().unwrap();
    assert!(new_dir.join("t").join("data.bin").exists());

    let (tx, rx) = oneshot::channel();
    harness
        .handle
        .rename_torrent(TORRENT, "renamed".into(), move |result| {
            tx.send(result).unwrap();
        });
    rx.await.unwrap().unwrap();
    assert!(new_dir.join("renamed").join("data.bin").exists());

    let (tx, rx) = oneshot::channel();
    harness.handle.erase_torrent_files(TORRENT, move |result| {
        tx.send(result).unwrap();
    });
    rx.await.unwrap().unwrap();
    assert!(!new_dir.join("renamed").exists());
    harness.finish().await;
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_blocks() {
    // A single buffered block, below every flush threshold.
    let harness = setup(DiskSettings::default(), 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    harness.save(0, 0, &tx);

    let storage = Arc::clone(&harness.storage);
    let expected = harness.block_data(0, 0).to_vec();
    harness.finish().await;

    // Shutdown force-flushed the lingering block.
    let events = recv_events(&mut rx, 1).await;
    assert!(matches!(events[0], PipelineEvent::Saved(0, Ok(()))));
    let on_disk = storage.read(0, 0, BLOCK_SIZE).unwrap();
    assert_eq!(on_disk.as_ref(), expected.as_slice());
}

#[tokio::test]
#[ignore = "waits out the 10 second write buffer expiry"]
async fn test_write_buffer_expiry_flushes() {
    let harness = setup(DiskSettings::default(), 4 * BLOCK_SIZE, 4 * BLOCK_SIZE as usize).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    harness.save(0, 0, &tx);

    let events = tokio::time::timeout(Duration::from_secs(15), rx.recv()).await;
    let event = events.expect("expiry flush within 15s").unwrap();
    assert!(matches!(event, PipelineEvent::Saved(0, Ok(()))));
    harness.finish().await;
}
