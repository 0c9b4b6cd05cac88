use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;
use std::sync::RwLock;
use sha1::{Digest, Sha1};

use super::TorrentFile;
use crate::block::num_blocks;

/// A piece assembled in the write buffer from incoming blocks before it is
/// verified and flushed to disk.
#[derive(Debug)]
pub struct Piece {
    pub hash: [u8; 20],
    pub length: usize,
    pub data: Vec<u8>,
    pub blocks_received: Vec<bool>,
    pub num_blocks_received: u32,
    pub file_overlap: Range<usize>,
}

impl Piece {
    pub fn add_block(&mut self, offset: usize, data: Vec<u8>) {
        let block_idx = offset / crate::BLOCK_SIZE;
        if self.blocks_received[block_idx] {
            tracing::warn!("duplicate block at offset {}", offset);
            return;
        }
        self.data[offset..offset + data.len()].copy_from_slice(&data);
        self.blocks_received[block_idx] = true;
        self.num_blocks_received += 1;
    }

    pub fn verify_hash(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    /// Scatter-writes the assembled piece across every file it overlaps,
    /// mirroring the scatter-read in [`super::read_piece`].
    pub fn write(&self, piece_offset: usize, files: &[RwLock<TorrentFile>]) -> std::io::Result<()> {
        let files = &files[self.file_overlap.clone()];
        let mut bytes_written = 0;
        let mut total_offset = piece_offset;

        for file in files {
            let mut f = file.write().unwrap();
            let byte_range = f.info.byte_range();
            let file_offset = total_offset - byte_range.start;
            let piece_remaining = self.length - bytes_written;
            let file_remaining = byte_range.end - total_offset;
            let chunk_len = piece_remaining.min(file_remaining);

            f.handle.seek(SeekFrom::Start(file_offset as u64))?;
            f.handle.write_all(&self.data[bytes_written..bytes_written + chunk_len])?;

            bytes_written += chunk_len;
            total_offset += chunk_len;
        }

        debug_assert_eq!(bytes_written, self.length, "scatter-write did not cover the whole piece");
        Ok(())
    }
}

pub fn num_blocks_for(piece_len: usize) -> u32 {
    num_blocks(piece_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_block() {
        let mut piece = Piece {
            hash: [0; 20],
            length: crate::BLOCK_SIZE * 2,
            data: vec![0; crate::BLOCK_SIZE * 2],
            blocks_received: vec![false; 2],
            num_blocks_received: 0,
            file_overlap: 0..1,
        };
        piece.add_block(0, vec![1; crate::BLOCK_SIZE]);
        assert_eq!(piece.num_blocks_received, 1);
        piece.add_block(0, vec![2; crate::BLOCK_SIZE]);
        assert_eq!(piece.num_blocks_received, 1, "duplicate block must not be counted twice");
    }

    #[test]
    fn verifies_hash_of_assembled_data() {
        let data = vec![7u8; crate::BLOCK_SIZE];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();

        let mut piece = Piece {
            hash,
            length: crate::BLOCK_SIZE,
            data: vec![0; crate::BLOCK_SIZE],
            blocks_received: vec![false; 1],
            num_blocks_received: 0,
            file_overlap: 0..1,
        };
        piece.add_block(0, data);
        assert!(piece.verify_hash());
    }
}
