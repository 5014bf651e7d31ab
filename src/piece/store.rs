//! On-disk piece assembly.
//!
//! Each piece accumulates into an in-memory buffer as its blocks arrive.
//! Once complete, its digest is checked and — if it matches — the buffer is
//! staged to a `tmp/<index>.piece` file on the blocking thread pool, since
//! `std::fs` writes would otherwise stall the async runtime. Staging each
//! piece individually rather than writing straight into the final output
//! lets a restarted download resume: [`PieceStore::load_existing_pieces`]
//! scans the tmp directory at startup and marks whichever pieces are
//! already there as done, and [`PieceStore::assemble_final`] concatenates
//! them into the real output file(s) once every piece has arrived.
use super::{digest_matches, MAX_PIECE_RETRIES};
use crate::scheduler::Scheduler;
use crate::torrent::TorrentFile;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("piece {0} has no buffer in progress")]
    UnknownPiece(usize),

    #[error("block write at piece {piece} begin {begin} length {length} is out of range")]
    BlockOutOfRange { piece: usize, begin: u32, length: u32 },

    #[error("piece {0} exceeded {MAX_PIECE_RETRIES} digest mismatches")]
    RetriesExhausted(usize),

    #[error("I/O error writing piece to disk: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type PieceResult<T> = std::result::Result<T, PieceError>;

struct Inner {
    buffers: HashMap<usize, Vec<u8>>,
    retries: HashMap<usize, u32>,
}

/// Owns every piece buffer currently being assembled for one torrent.
///
/// Locking only ever guards the in-memory maps, never disk I/O, so a
/// critical section here is always short.
pub struct PieceStore {
    torrent: Arc<TorrentFile>,
    download_root: PathBuf,
    tmp_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl PieceStore {
    pub fn new(torrent: Arc<TorrentFile>, download_root: PathBuf) -> Self {
        // Namespaced under a shared `tmp` directory rather than
        // `download_root.join(&torrent.info.name)`: for a single-file
        // torrent that name is the final *file*'s own path, which can't
        // also be a directory holding a `tmp` subdirectory.
        let tmp_dir = download_root.join("tmp").join(&torrent.info.name);
        Self {
            torrent,
            download_root,
            tmp_dir,
            inner: Mutex::new(Inner {
                buffers: HashMap::new(),
                retries: HashMap::new(),
            }),
        }
    }

    /// Allocates a zeroed buffer for `index`, ready to accept blocks.
    pub fn begin_piece(&self, index: usize) {
        let len = self.torrent.piece_size(index).max(0) as usize;
        self.inner.lock().buffers.entry(index).or_insert_with(|| vec![0u8; len]);
    }

    /// Copies a received block into its piece's buffer.
    pub fn accept_block(&self, index: usize, begin: u32, data: &[u8]) -> PieceResult<()> {
        let mut inner = self.inner.lock();
        let buffer = inner
            .buffers
            .get_mut(&index)
            .ok_or(PieceError::UnknownPiece(index))?;
        let begin = begin as usize;
        let end = begin + data.len();
        if end > buffer.len() {
            return Err(PieceError::BlockOutOfRange {
                piece: index,
                begin: begin as u32,
                length: data.len() as u32,
            });
        }
        buffer[begin..end].copy_from_slice(data);
        Ok(())
    }

    fn tmp_path(&self, index: usize) -> PathBuf {
        self.tmp_dir.join(format!("{:08}.piece", index))
    }

    /// Verifies and, on success, stages piece `index` to its tmp file.
    ///
    /// `Ok(true)` means the piece is complete and staged. `Ok(false)` means
    /// the digest didn't match and the piece's buffer has been dropped so
    /// it can be re-requested; the caller is responsible for noticing the
    /// retry count and giving up after [`MAX_PIECE_RETRIES`].
    #[instrument(skip(self), level = "debug")]
    pub async fn finalize_piece(&self, index: usize) -> PieceResult<bool> {
        let data = {
            let mut inner = self.inner.lock();
            inner.buffers.remove(&index).ok_or(PieceError::UnknownPiece(index))?
        };

        let expected = self
            .torrent
            .pieces_hash
            .get(index)
            .ok_or(PieceError::UnknownPiece(index))?;

        if !digest_matches(&data, expected) {
            let mut inner = self.inner.lock();
            let retries = inner.retries.entry(index).or_insert(0);
            *retries += 1;
            if *retries >= MAX_PIECE_RETRIES {
                return Err(PieceError::RetriesExhausted(index));
            }
            return Ok(false);
        }

        let path = self.tmp_path(index);
        tokio::task::spawn_blocking(move || write_piece_tmp(&path, &data)).await??;
        Ok(true)
    }

    /// Scans the tmp directory for already-staged pieces and marks each
    /// one, whose file size matches the expected piece size, complete on
    /// `scheduler`. Lets a restarted download resume instead of
    /// re-fetching everything from scratch.
    #[instrument(skip(self, scheduler), level = "debug")]
    pub async fn load_existing_pieces(&self, scheduler: &Scheduler) -> PieceResult<()> {
        let tmp_dir = self.tmp_dir.clone();
        let num_pieces = self.torrent.num_pieces();
        let sizes: Vec<i64> = (0..num_pieces).map(|i| self.torrent.piece_size(i)).collect();
        let found = tokio::task::spawn_blocking(move || scan_tmp_dir(&tmp_dir, &sizes)).await??;
        for index in found {
            scheduler.piece_completed(index);
        }
        Ok(())
    }

    /// Concatenates every staged tmp piece into the final output file(s).
    /// Only meaningful to call once every piece has been verified.
    #[instrument(skip(self), level = "debug")]
    pub async fn assemble_final(&self) -> PieceResult<()> {
        let torrent = self.torrent.clone();
        let download_root = self.download_root.clone();
        let tmp_dir = self.tmp_dir.clone();
        tokio::task::spawn_blocking(move || assemble_final_blocking(&torrent, &download_root, &tmp_dir)).await??
    }
}

fn write_piece_tmp(path: &std::path::Path, data: &[u8]) -> PieceResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    Ok(())
}

fn scan_tmp_dir(tmp_dir: &std::path::Path, piece_sizes: &[i64]) -> std::io::Result<Vec<usize>> {
    let mut found = Vec::new();
    for (index, &expected_size) in piece_sizes.iter().enumerate() {
        let path = tmp_dir.join(format!("{:08}.piece", index));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() as i64 == expected_size => found.push(index),
            _ => continue,
        }
    }
    Ok(found)
}

fn assemble_final_blocking(
    torrent: &TorrentFile,
    download_root: &std::path::Path,
    tmp_dir: &std::path::Path,
) -> PieceResult<()> {
    for index in 0..torrent.num_pieces() {
        let tmp_path = tmp_dir.join(format!("{:08}.piece", index));
        let mut data = Vec::new();
        std::fs::File::open(&tmp_path)?.read_to_end(&mut data)?;
        write_piece_to_disk(torrent, download_root, index, &data)?;
    }
    Ok(())
}

/// Writes a verified piece's bytes into whichever output files its byte
/// range overlaps, seeking to the right offset in each.
fn write_piece_to_disk(
    torrent: &TorrentFile,
    download_root: &std::path::Path,
    index: usize,
    data: &[u8],
) -> PieceResult<()> {
    for overlap in torrent.file_overlaps_for_piece(index) {
        let full_path = download_root.join(&overlap.path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&full_path)?;
        file.seek(SeekFrom::Start(overlap.file_offset as u64))?;
        file.write_all(&data[overlap.data_offset..overlap.data_offset + overlap.data_len])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::file::{FileDict, InfoDict};

    fn single_file_torrent(piece_length: i64, length: i64, hash: [u8; 20]) -> TorrentFile {
        TorrentFile {
            announce: "http://tracker".to_string(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            info: InfoDict {
                piece_length,
                pieces: Vec::new(),
                private: false,
                name: "out-torrent".to_string(),
                length: Some(length),
                files: Vec::new(),
                is_directory: false,
            },
            info_hash: [0u8; 20],
            pieces_hash: vec![hash],
        }
    }

    #[tokio::test]
    async fn finalize_rejects_digest_mismatch_and_allows_retry() {
        let torrent = Arc::new(single_file_torrent(4, 4, [0xabu8; 20]));
        let dir = std::env::temp_dir().join(format!("leech-test-{:?}", std::thread::current().id()));
        let store = PieceStore::new(torrent, dir);
        store.begin_piece(0);
        store.accept_block(0, 0, b"data").unwrap();
        let ok = store.finalize_piece(0).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn finalize_stages_to_tmp_and_assemble_final_writes_output() {
        let mut hasher = sha1::Sha1::new();
        use sha1::Digest;
        hasher.update(b"data");
        let hash: [u8; 20] = hasher.finalize().into();

        let torrent = Arc::new(single_file_torrent(4, 4, hash));
        let dir = std::env::temp_dir().join(format!("leech-test-ok-{:?}", std::thread::current().id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = PieceStore::new(torrent, dir.clone());
        store.begin_piece(0);
        store.accept_block(0, 0, b"data").unwrap();
        let ok = store.finalize_piece(0).await.unwrap();
        assert!(ok);

        let tmp_path = dir.join("tmp").join("out-torrent").join("00000000.piece");
        assert_eq!(std::fs::read(&tmp_path).unwrap(), b"data");

        store.assemble_final().await.unwrap();
        let written = std::fs::read(dir.join("out-torrent")).unwrap();
        assert_eq!(written, b"data");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn load_existing_pieces_marks_scheduler_done_from_tmp_dir() {
        let torrent = Arc::new(single_file_torrent(4, 4, [0u8; 20]));
        let dir = std::env::temp_dir().join(format!("leech-test-resume-{:?}", std::thread::current().id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = PieceStore::new(torrent, dir.clone());
        let tmp_dir = dir.join("tmp").join("out-torrent");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        std::fs::write(tmp_dir.join("00000000.piece"), b"data").unwrap();

        let scheduler = Scheduler::new(1);
        assert!(!scheduler.is_done());
        store.load_existing_pieces(&scheduler).await.unwrap();
        assert!(scheduler.is_done());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
