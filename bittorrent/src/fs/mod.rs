use std::{
    collections::HashMap,
    io::{Read, Seek},
    sync::{mpsc, Arc, Mutex, RwLock},
    thread::JoinHandle,
};
use crate::{
    block::*,
    store::{StoreInfo, FileInfo},
    Peer,
};
use piece::Piece;

mod piece;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("sync error: {0}")]
    SyncError(String),

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::Sender<CommandToDisk>;
pub type DiskRx = mpsc::Receiver<CommandToDisk>;
pub type DiskEventTx = mpsc::Sender<DiskEvent>;
pub type DiskEventRx = mpsc::Receiver<DiskEvent>;

pub enum CommandToDisk {
    // Block from peer needs to be written to disk.
    WriteBlock { block: BlockInfo, data: Vec<u8> },

    // Block has been requested by `peer`, needs to be read from disk.
    ReadBlock { block: BlockInfo, peer: Peer },

    Shutdown,
}

/// Events the disk thread reports back to the worker that owns it. Delivered
/// off the dispatch loop thread; the worker drains these into per-peer
/// outbound queues that dispatcher suppliers then poll.
pub enum DiskEvent {
    PieceWritten { idx: usize, valid: bool },
    BlockRead { peer: Peer, block: BlockData },
}

pub struct Disk {
    info: StoreInfo,
    write_buf: HashMap<usize, Piece>,
    piece_hashes: Vec<[u8; 20]>,
    disk_rx: DiskRx,
    ctx: Arc<Ctx>,
}

struct Ctx {
    files: Vec<RwLock<TorrentFile>>,
    // `mpsc::Sender` is `Send` but not `Sync`; wrapping it is what lets
    // `Arc<Ctx>` (and so `Disk`) be `Send` into the disk thread.
    events_tx: Mutex<DiskEventTx>,
    read_cache: Mutex<lru::LruCache<usize, Arc<Vec<u8>>>>,
}

pub struct TorrentFile {
    pub info: FileInfo,
    pub handle: std::fs::File,
}

impl TorrentFile {
    pub fn new(dir: &std::path::Path, info: FileInfo) -> Result<Self> {
        let path = dir.join(&info.path);
        tracing::info!("creating file: {:?}", &path);

        let handle = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self { info, handle })
    }
}

/// Spawns the disk thread. Runs off the dispatch loop thread entirely; the
/// worker talks to it only through `DiskTx`/`DiskEventRx`.
pub fn spawn(
    info: StoreInfo,
    piece_hashes: Vec<[u8; 20]>,
) -> Result<(JoinHandle<Result<()>>, DiskTx, DiskEventRx)> {
    tracing::info!("spawning disk thread");
    let (events_tx, events_rx) = mpsc::channel();
    let (mut disk, disk_tx) = Disk::new(info, piece_hashes, events_tx)?;
    let handle = std::thread::Builder::new()
        .name("disk".into())
        .spawn(move || disk.run())
        .expect("failed to spawn disk thread");
    Ok((handle, disk_tx, events_rx))
}

impl Disk {
    pub fn new(info: StoreInfo, piece_hashes: Vec<[u8; 20]>, events_tx: DiskEventTx) -> Result<(Self, DiskTx)> {
        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        debug_assert!(!info.files.is_empty());
        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            let path = info.output_dir.join(&file.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    tracing::info!("creating sub-directory: {:?}", subdir);
                    std::fs::create_dir_all(subdir)?;
                }
            }
            files.push(RwLock::new(TorrentFile::new(&info.output_dir, file.clone())?));
        }

        let (disk_tx, disk_rx) = mpsc::channel();
        let read_cache = Mutex::new(lru::LruCache::new(std::num::NonZeroUsize::new(500).unwrap()));
        Ok((
            Self {
                info,
                piece_hashes,
                write_buf: HashMap::new(),
                disk_rx,
                ctx: Arc::new(Ctx { files, events_tx: Mutex::new(events_tx), read_cache }),
            },
            disk_tx,
        ))
    }

    #[tracing::instrument(name = "disk", skip_all)]
    pub fn run(&mut self) -> Result<()> {
        tracing::info!("starting disk");
        while let Ok(cmd) = self.disk_rx.recv() {
            match cmd {
                CommandToDisk::WriteBlock { block, data } => self.write_block(block, data)?,
                CommandToDisk::ReadBlock { block, peer } => self.read_block(block, peer)?,
                CommandToDisk::Shutdown => {
                    tracing::info!("disk shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        tracing::trace!("received block: {:?}", info);
        let piece_idx = info.piece_idx;

        if !self.write_buf.contains_key(&piece_idx) {
            self.new_piece(piece_idx);
            tracing::trace!("added new piece {} to write buf", piece_idx);
        }
        let piece = self.write_buf.get_mut(&piece_idx).expect("piece not found in write buf");
        piece.add_block(info.offset, data);

        tracing::trace!(
            "piece {}: {} blocks received out of {}",
            piece_idx,
            piece.num_blocks_received,
            num_blocks(piece.length)
        );
        if piece.num_blocks_received == num_blocks(piece.length) {
            let piece = self.write_buf.remove(&piece_idx).expect("piece not found in write buf");
            let offset = self.info.piece_byte_offset(piece_idx);
            let valid = piece.verify_hash();

            if valid {
                tracing::trace!("piece {} hash verified", piece_idx);
                piece.write(offset, &self.ctx.files)?;
            } else {
                tracing::warn!("piece {} failed hash verification", piece_idx);
            }

            self.ctx
                .events_tx
                .lock()?
                .send(DiskEvent::PieceWritten { idx: piece_idx, valid })
                .map_err(|e| DiskError::ChannelError(e.to_string()))?;
        }
        Ok(())
    }

    fn new_piece(&mut self, piece_idx: usize) {
        let length = self.info.piece_length(piece_idx);
        let piece = Piece {
            hash: self.piece_hashes[piece_idx],
            length,
            data: vec![0; length],
            blocks_received: vec![false; num_blocks(length) as usize],
            num_blocks_received: 0,
            file_overlap: self.info.piece_file_intersections(piece_idx),
        };
        self.write_buf.insert(piece_idx, piece);
    }

    fn read_block(&self, block_info: BlockInfo, peer: Peer) -> Result<()> {
        let block_idx = block_info.idx_in_piece();

        let cached = self.ctx.read_cache.lock()?.get(&block_info.piece_idx).cloned();
        let piece_bytes = if let Some(cached) = cached {
            tracing::trace!("cache hit for piece {}", block_info.piece_idx);
            cached
        } else {
            let file_range = self.info.piece_file_intersections(block_info.piece_idx);
            let piece_offset = self.info.piece_byte_offset(block_info.piece_idx);
            let piece_len = self.info.piece_length(block_info.piece_idx);
            let bytes = Arc::new(read_piece(piece_offset, piece_len, file_range, &self.ctx.files));
            self.ctx.read_cache.lock()?.put(block_info.piece_idx, bytes.clone());
            bytes
        };

        let start = block_idx * crate::BLOCK_SIZE;
        let end = (start + block_info.len).min(piece_bytes.len());
        if start >= piece_bytes.len() {
            tracing::warn!("block index out of range for piece {}", block_info.piece_idx);
            return Ok(());
        }

        self.ctx
            .events_tx
            .lock()?
            .send(DiskEvent::BlockRead {
                peer,
                block: BlockData {
                    piece_idx: block_info.piece_idx,
                    offset: block_info.offset,
                    data: piece_bytes[start..end].to_vec(),
                },
            })
            .map_err(|e| DiskError::ChannelError(e.to_string()))?;

        Ok(())
    }
}

fn read_piece(
    piece_offset: usize,
    piece_len: usize,
    file_range: std::ops::Range<usize>,
    files: &[RwLock<TorrentFile>],
) -> Vec<u8> {
    let mut bytes_read = 0;
    let mut total_offset = piece_offset;
    let mut buf = vec![0; piece_len];

    let files = &files[file_range];
    for file in files.iter() {
        let mut f = file.write().unwrap();

        let byte_range = f.info.byte_range();
        let file_offset = total_offset - byte_range.start;
        let piece_remaining = piece_len - bytes_read;
        let file_remaining = byte_range.end - total_offset;
        let bytes_remaining = std::cmp::min(piece_remaining, file_remaining);

        f.handle.seek(std::io::SeekFrom::Start(file_offset as u64)).unwrap();
        let n = f.handle.read(&mut buf[bytes_read..bytes_read + bytes_remaining]).unwrap();

        bytes_read += n;
        total_offset += n;
    }
    debug_assert_eq!(bytes_read, piece_len);
    buf
}
