use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// One file of the torrent, addressed in the torrent's flat byte space:
/// all files concatenated in torrent order, without gaps.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Where the file goes, relative to the download directory.
    pub path: PathBuf,
    /// How many bytes of the torrent belong to this file.
    pub len: u64,
    /// The offset of the file's first byte in the flat byte space; 0 for
    /// the first (or only) file.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// One past the file's last byte in the flat byte space.
    pub(crate) fn end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Whether the byte at the given torrent offset lands in this file.
    pub(crate) fn contains(&self, torrent_offset: u64) -> bool {
        (self.torrent_offset..self.end_offset()).contains(&torrent_offset)
    }

    /// Translates a cut of `wanted` bytes starting at `torrent_offset`
    /// into this file's own coordinates. The returned length is capped at
    /// the file end: whatever of `wanted` doesn't fit here spills into the
    /// files after it, and the caller carries on there.
    ///
    /// # Panics
    ///
    /// The starting offset must land inside this file; pieces are mapped
    /// to their files before their bytes are.
    pub(crate) fn slice_at(&self, torrent_offset: u64, wanted: u64) -> FileSlice {
        assert!(
            self.contains(torrent_offset),
            "byte {} is not inside file {:?}",
            torrent_offset,
            self.path,
        );
        let offset = torrent_offset - self.torrent_offset;
        FileSlice {
            offset,
            len: wanted.min(self.len - offset),
        }
    }
}

/// A contiguous run of bytes within one file, relative to the file start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count
/// and length and the layout of its files.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    pub download_dir: PathBuf,
    /// All files in the torrent, in torrent order. Their offsets strictly
    /// increase, are disjoint, and cover the whole download without gaps; a
    /// single file download is a one element list with offset 0.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.download_len();
        let piece_len = metainfo.info.piece_len;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        // if the torrent is an archive, download files into the torrent's
        // own directory to not scatter them across the download root
        let files = metainfo.files();
        let download_dir = if files.len() > 1 {
            download_dir.join(&metainfo.info.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the byte range the piece covers in the torrent.
    pub(crate) fn piece_byte_range(
        &self,
        index: PieceIndex,
    ) -> Result<Range<u64>> {
        let start = index as u64 * self.piece_len as u64;
        Ok(start..start + self.piece_len(index)? as u64)
    }

    /// Returns the zero-based indices of the files of torrent that intersect
    /// with the piece.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        log::trace!("Returning files intersecting piece {}", index);
        Ok(self.files_intersecting_bytes(self.piece_byte_range(index)?))
    }

    /// The indices of the files overlapping the given half-open byte range
    /// of the torrent; empty if the range falls outside every file.
    ///
    /// Since the files tile the flat byte space without gaps, the
    /// overlapping ones are always one contiguous run: a file overlaps iff
    /// it begins before the range ends and ends after the range begins.
    pub(crate) fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        let mut overlapping =
            self.files.iter().enumerate().filter_map(|(index, file)| {
                let overlaps = file.torrent_offset < byte_range.end
                    && file.end_offset() > byte_range.start;
                if overlaps {
                    Some(index)
                } else {
                    None
                }
            });
        match overlapping.next() {
            Some(first) => {
                let last = overlapping.last().unwrap_or(first);
                first..last + 1
            }
            None => 0..0,
        }
    }

    /// Whether the piece lies entirely within a single file.
    pub(crate) fn piece_in_single_file(&self, index: PieceIndex) -> bool {
        self.files_intersecting_piece(index)
            .map(|files| files.len() == 1)
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a storage info with the given file lengths laid out back to
    /// back; used by this module's and other modules' tests.
    pub(crate) fn storage_with_files(
        piece_len: u32,
        file_lens: &[u64],
    ) -> StorageInfo {
        let mut files = Vec::with_capacity(file_lens.len());
        let mut offset = 0;
        for (i, len) in file_lens.iter().enumerate() {
            files.push(FileInfo {
                path: PathBuf::from(format!("file-{}", i)),
                torrent_offset: offset,
                len: *len,
            });
            offset += len;
        }
        let download_len: u64 = file_lens.iter().sum();
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            files,
        }
    }

    #[test]
    fn test_slice_at_caps_at_the_file_end() {
        // no IO here, the path is never opened
        let file = FileInfo {
            path: PathBuf::from("payload.bin"),
            len: 500,
            torrent_offset: 200,
        };

        // a cut reaching past the file is truncated to what the file holds
        assert_eq!(
            file.slice_at(300, 1000),
            FileSlice {
                offset: 100,
                len: 400,
            }
        );
        // a cut that fits is returned as asked
        assert_eq!(
            file.slice_at(300, 10),
            FileSlice {
                offset: 100,
                len: 10,
            }
        );
        // starting at the first byte and asking for everything covers the
        // whole file
        assert_eq!(
            file.slice_at(200, 500),
            FileSlice {
                offset: 0,
                len: 500,
            }
        );
    }

    #[test]
    #[should_panic(expected = "is not inside file")]
    fn test_slice_at_before_the_file_panics() {
        let file = FileInfo {
            path: PathBuf::from("payload.bin"),
            len: 500,
            torrent_offset: 200,
        };
        file.slice_at(100, 400);
    }

    #[test]
    #[should_panic(expected = "is not inside file")]
    fn test_slice_at_past_the_file_panics() {
        let file = FileInfo {
            path: PathBuf::from("payload.bin"),
            len: 500,
            torrent_offset: 200,
        };
        // the end offset is one past the last valid byte
        file.slice_at(700, 1);
    }

    #[test]
    fn test_files_intersecting_pieces() {
        // one file, four pieces (the last one short): every piece maps to it
        let info = storage_with_files(4, &[3 * 4 + 2]);
        for piece in 0..4 {
            assert_eq!(info.files_intersecting_piece(piece).unwrap(), 0..1);
        }
        assert!(info.piece_in_single_file(2));

        // seven files over five 16 byte pieces; file boundaries at
        // 9, 20, 27, 36, 48, 64, piece boundaries at 16, 32, 48, 64
        let info = storage_with_files(16, &[9, 11, 7, 9, 12, 16, 8]);
        // piece 0 = [0, 16) crosses from file 0 into file 1
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        // piece 1 = [16, 32) finishes file 1, swallows file 2, starts file 3
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
        // piece 2 = [32, 48) finishes file 3 and starts file 4
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..5);
        // pieces 3 and 4 line up exactly with files 5 and 6
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 5..6);
        assert_eq!(info.files_intersecting_piece(4).unwrap(), 6..7);
        assert!(info.piece_in_single_file(3));
        assert!(!info.piece_in_single_file(0));
        // there is no piece 5
        assert!(info.files_intersecting_piece(5).is_err());
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let info = storage_with_files(1 << 14, &[12341234]);
        assert_eq!(info.files_intersecting_bytes(0..1), 0..1);
        assert_eq!(info.files_intersecting_bytes(0..12341234), 0..1);

        // file boundaries at 4, 13, 16; total 26 bytes
        let info = storage_with_files(16, &[4, 9, 3, 10]);
        // exactly the first file
        assert_eq!(info.files_intersecting_bytes(0..4), 0..1);
        // one byte over the first boundary pulls in the second file
        assert_eq!(info.files_intersecting_bytes(0..5), 0..2);
        // up to (but excluding) the second boundary stays at two files
        assert_eq!(info.files_intersecting_bytes(0..13), 0..2);
        // reaching into the third and fourth files
        assert_eq!(info.files_intersecting_bytes(0..15), 0..3);
        assert_eq!(info.files_intersecting_bytes(0..18), 0..4);
        // the torrent's very last byte
        assert_eq!(info.files_intersecting_bytes(25..26), 3..4);
        // runs that neither start nor end at the torrent's edges
        assert_eq!(info.files_intersecting_bytes(4..16), 1..3);
        assert_eq!(info.files_intersecting_bytes(8..14), 1..3);
        // a single byte grabs exactly one file
        assert_eq!(info.files_intersecting_bytes(13..14), 2..3);
        // wholly past the end of the torrent
        assert_eq!(info.files_intersecting_bytes(30..38), 0..0);
    }
}
