//! Persisting downloaded content.
//!
//! The engine talks to storage through the [`ContentStorage`] trait and
//! tolerates its failures: a failed piece write is retried once and then
//! surfaced to the torrent's owner, never crashing the torrent itself.
//! [`FileStorage`] is the file backed implementation.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
};

use nix::sys::uio::{pread, pwrite};
use sha1::{Digest, Sha1};

use crate::{
    storage_info::{FileInfo, StorageInfo},
    PieceIndex, Sha1Hash,
};

/// Where verified content is read from and written to.
///
/// Offsets and lengths are piece relative; implementations map them onto
/// whatever backing layout they use.
pub trait ContentStorage: Send {
    /// Reads `len` bytes starting at `offset` within the piece.
    fn read(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> io::Result<Vec<u8>>;

    /// Writes `data` starting at `offset` within the piece.
    fn write(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> io::Result<()>;

    /// Writes a whole piece.
    fn write_piece(
        &mut self,
        piece_index: PieceIndex,
        data: &[u8],
    ) -> io::Result<()> {
        self.write(piece_index, 0, data)
    }

    /// Writes a whole piece and verifies the stored bytes against the
    /// expected hash in one operation. Returns `Ok(false)` if the
    /// implementation doesn't support this, in which case the caller falls
    /// back to a plain write followed by its own verification.
    fn write_piece_verified(
        &mut self,
        piece_index: PieceIndex,
        data: &[u8],
        expected_hash: &Sha1Hash,
    ) -> io::Result<bool> {
        let _ = (piece_index, data, expected_hash);
        Ok(false)
    }

    /// Flushes and releases the backing resources.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// File backed storage: one handle per torrent file, opened up front, with
/// positioned reads and writes spanning file boundaries as needed.
pub struct FileStorage {
    info: StorageInfo,
    files: Vec<TorrentFile>,
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl FileStorage {
    /// Creates the torrent's directory structure and opens all its file
    /// handles.
    pub fn open(info: &StorageInfo) -> io::Result<Self> {
        if !info.download_dir.exists() {
            log::info!("Creating download dir {:?}", info.download_dir);
            fs::create_dir_all(&info.download_dir)?;
        }

        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            debug_assert!(!file.path.is_absolute());
            let path = info.download_dir.join(&file.path);

            // get the parent of the file path: if there is one (i.e. this
            // is not a file in the torrent root), and doesn't exist, create it
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    log::info!("Creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(subdir)?;
                }
            }

            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    e
                })?;
            files.push(TorrentFile {
                info: FileInfo {
                    path,
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                },
                handle,
            });
        }

        Ok(Self {
            info: info.clone(),
            files,
        })
    }

    /// Checks that the range is within the piece and returns its offset in
    /// the torrent.
    fn torrent_offset(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> io::Result<u64> {
        let piece_len = self.info.piece_len(piece_index).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid piece index")
        })?;
        if offset as u64 + len as u64 > piece_len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside piece",
            ));
        }
        Ok(piece_index as u64 * self.info.piece_len as u64 + offset as u64)
    }
}

impl ContentStorage for FileStorage {
    fn read(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> io::Result<Vec<u8>> {
        let mut torrent_offset =
            self.torrent_offset(piece_index, offset, len)?;
        let mut buf = vec![0; len as usize];
        let mut read = 0;

        let file_range = self
            .info
            .files_intersecting_bytes(torrent_offset..torrent_offset + len as u64);
        for file in &self.files[file_range] {
            let slice = file
                .info
                .slice_at(torrent_offset, len as u64 - read as u64);
            let mut file_offset = slice.offset;
            let mut left = slice.len as usize;
            while left > 0 {
                let n = pread(
                    file.handle.as_raw_fd(),
                    &mut buf[read..read + left],
                    file_offset as i64,
                )
                .map_err(nix_to_io)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past end of file",
                    ));
                }
                read += n;
                left -= n;
                file_offset += n as u64;
            }
            torrent_offset += slice.len;
        }

        debug_assert_eq!(read, len as usize);
        Ok(buf)
    }

    fn write(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> io::Result<()> {
        let mut torrent_offset =
            self.torrent_offset(piece_index, offset, data.len() as u32)?;
        let mut written = 0;

        let file_range = self.info.files_intersecting_bytes(
            torrent_offset..torrent_offset + data.len() as u64,
        );
        for file in &self.files[file_range] {
            let slice = file
                .info
                .slice_at(torrent_offset, (data.len() - written) as u64);
            let mut file_offset = slice.offset;
            let mut left = slice.len as usize;
            // IO syscalls are not guaranteed to write the whole input buffer
            // in one go, so we need to write until all bytes have been
            // confirmed to be written (or an error occurs)
            while left > 0 {
                let n = pwrite(
                    file.handle.as_raw_fd(),
                    &data[written..written + left],
                    file_offset as i64,
                )
                .map_err(|e| {
                    log::warn!(
                        "File {:?} write error: {}",
                        file.info.path,
                        e
                    );
                    nix_to_io(e)
                })?;
                written += n;
                left -= n;
                file_offset += n as u64;
            }
            torrent_offset += slice.len;
        }

        debug_assert_eq!(written, data.len());
        Ok(())
    }

    fn write_piece_verified(
        &mut self,
        piece_index: PieceIndex,
        data: &[u8],
        expected_hash: &Sha1Hash,
    ) -> io::Result<bool> {
        self.write(piece_index, 0, data)?;
        // read the stored bytes back so the verification covers the actual
        // write, not just the buffer we were handed
        let stored = self.read(piece_index, 0, data.len() as u32)?;
        let digest = Sha1::digest(&stored);
        if digest.as_slice() != expected_hash {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stored piece does not match its hash",
            ));
        }
        Ok(true)
    }

    fn close(&mut self) -> io::Result<()> {
        for file in self.files.iter() {
            file.handle.sync_all()?;
        }
        Ok(())
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage_info::tests::storage_with_files;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    /// In-memory storage used by the torrent tests.
    #[derive(Default)]
    pub(crate) struct MemoryStorage {
        pub pieces: HashMap<PieceIndex, Vec<u8>>,
        /// When set, the next `fail_writes` writes return an error.
        pub fail_writes: usize,
    }

    impl ContentStorage for MemoryStorage {
        fn read(
            &mut self,
            piece_index: PieceIndex,
            offset: u32,
            len: u32,
        ) -> io::Result<Vec<u8>> {
            let piece = self.pieces.get(&piece_index).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "piece not stored")
            })?;
            let start = offset as usize;
            let end = start + len as usize;
            piece.get(start..end).map(|s| s.to_vec()).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "out of range")
            })
        }

        fn write(
            &mut self,
            piece_index: PieceIndex,
            offset: u32,
            data: &[u8],
        ) -> io::Result<()> {
            if self.fail_writes > 0 {
                self.fail_writes -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "simulated write failure",
                ));
            }
            let piece = self.pieces.entry(piece_index).or_default();
            let end = offset as usize + data.len();
            if piece.len() < end {
                piece.resize(end, 0);
            }
            piece[offset as usize..end].copy_from_slice(data);
            Ok(())
        }
    }

    fn with_dir(
        piece_len: u32,
        file_lens: &[u64],
    ) -> (tempfile::TempDir, StorageInfo) {
        let dir = tempfile::tempdir().unwrap();
        let mut info = storage_with_files(piece_len, file_lens);
        info.download_dir = dir.path().join("download");
        (dir, info)
    }

    #[test]
    fn test_round_trip_within_single_file() {
        let (_dir, info) = with_dir(16, &[64]);
        let mut storage = FileStorage::open(&info).unwrap();

        let piece: Vec<u8> = (0..16).collect();
        storage.write_piece(1, &piece).unwrap();
        assert_eq!(storage.read(1, 0, 16).unwrap(), piece);
        assert_eq!(storage.read(1, 4, 8).unwrap(), &piece[4..12]);
    }

    #[test]
    fn test_write_spanning_multiple_files() {
        // piece 0 covers file 0 entirely and the head of file 1
        let (_dir, info) = with_dir(16, &[6, 20, 6]);
        let mut storage = FileStorage::open(&info).unwrap();

        let piece0: Vec<u8> = (100..116).collect();
        let piece1: Vec<u8> = (200..216).collect();
        storage.write_piece(0, &piece0).unwrap();
        storage.write_piece(1, &piece1).unwrap();

        assert_eq!(storage.read(0, 0, 16).unwrap(), piece0);
        assert_eq!(storage.read(1, 0, 16).unwrap(), piece1);

        // the files on disk carry the right slices
        let f0 = fs::read(info.download_dir.join("file-0")).unwrap();
        assert_eq!(f0, &piece0[..6]);
        let f1 = fs::read(info.download_dir.join("file-1")).unwrap();
        assert_eq!(&f1[..10], &piece0[6..]);
        assert_eq!(&f1[10..16], &piece1[..6]);
    }

    #[test]
    fn test_verified_write_accepts_matching_hash() {
        let (_dir, info) = with_dir(16, &[32]);
        let mut storage = FileStorage::open(&info).unwrap();

        let piece = vec![0xab; 16];
        let digest = Sha1::digest(&piece);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);

        assert!(storage.write_piece_verified(0, &piece, &hash).unwrap());
        assert!(storage
            .write_piece_verified(1, &piece, &[0; 20])
            .is_err());
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let (_dir, info) = with_dir(16, &[20]);
        let mut storage = FileStorage::open(&info).unwrap();
        // last piece is only 4 bytes long
        assert!(storage.write(1, 0, &[0; 16]).is_err());
        assert!(storage.read(0, 8, 16).is_err());
        assert!(storage.write(2, 0, &[0; 4]).is_err());
    }
}
