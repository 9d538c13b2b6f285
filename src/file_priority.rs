//! Maps per file download priorities onto per piece priorities and
//! classifications.
//!
//! A piece overlapping only skipped files must never be downloaded; a piece
//! straddling a skipped and a wanted file still has to be fetched whole,
//! since the piece is the unit of verification.

use crate::{
    error::{Error, Result},
    Bitfield, FileIndex, PieceIndex, StorageInfo,
};

/// The priority assigned to a file by the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilePriority {
    Normal,
    /// Don't download this file.
    Skip,
    High,
}

impl FilePriority {
    /// The priority a file of this priority contributes to an overlapping
    /// piece. A piece's priority is the maximum contribution across its
    /// files.
    fn piece_contribution(self) -> u8 {
        match self {
            Self::Skip => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }
}

/// What a piece's overlapping file priorities mean for downloading it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceClass {
    /// Every overlapping file is wanted.
    Wanted,
    /// The piece touches both skipped and wanted files; it is downloaded
    /// for the sake of the wanted ones.
    Boundary,
    /// Every overlapping file is skipped; the piece must not be downloaded.
    Blacklisted,
}

/// The effect of a priority change.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PriorityChange {
    /// The pieces that were downloadable before and are blacklisted now.
    /// Any in-flight download of these is discarded by the caller.
    pub newly_blacklisted: Vec<PieceIndex>,
}

/// Tracks file priorities and the piece priorities derived from them.
pub(crate) struct FilePriorities {
    storage: StorageInfo,
    files: Vec<FilePriority>,
    pieces: Vec<u8>,
    classes: Vec<PieceClass>,
}

impl FilePriorities {
    /// Creates the mapping with every file at normal priority.
    pub fn new(storage: StorageInfo) -> Self {
        let files = vec![FilePriority::Normal; storage.files.len()];
        let pieces = vec![FilePriority::Normal.piece_contribution(); storage.piece_count];
        let classes = vec![PieceClass::Wanted; storage.piece_count];
        Self {
            storage,
            files,
            pieces,
            classes,
        }
    }

    pub fn file_priority(&self, file: FileIndex) -> Option<FilePriority> {
        self.files.get(file).copied()
    }

    /// The per piece priorities: 0 skip, 1 normal, 2 high.
    pub fn piece_priorities(&self) -> &[u8] {
        &self.pieces
    }

    pub fn piece_priority(&self, piece: PieceIndex) -> u8 {
        self.pieces[piece]
    }

    pub fn piece_class(&self, piece: PieceIndex) -> PieceClass {
        self.classes[piece]
    }

    /// Whether the piece should be downloaded at all.
    pub fn is_piece_wanted(&self, piece: PieceIndex) -> bool {
        self.pieces[piece] > 0
    }

    /// Changes a file's priority and recomputes the piece mapping.
    ///
    /// Skipping a file that is already fully downloaded and verified is
    /// refused: its pieces are on disk and unskippable.
    pub fn set_file_priority(
        &mut self,
        file: FileIndex,
        priority: FilePriority,
        own_pieces: &Bitfield,
    ) -> Result<PriorityChange> {
        if file >= self.files.len() {
            return Err(Error::InvalidFileIndex);
        }
        if self.files[file] == priority {
            return Ok(PriorityChange::default());
        }
        if priority == FilePriority::Skip
            && self.is_file_fully_verified(file, own_pieces)
        {
            return Err(Error::FileAlreadyComplete);
        }

        log::info!("Setting file {} priority to {:?}", file, priority);
        self.files[file] = priority;
        Ok(self.recompute())
    }

    /// Whether every piece overlapping the file has been verified.
    fn is_file_fully_verified(
        &self,
        file: FileIndex,
        own_pieces: &Bitfield,
    ) -> bool {
        let info = &self.storage.files[file];
        let piece_len = self.storage.piece_len as u64;
        let first_piece = (info.torrent_offset / piece_len) as PieceIndex;
        let last_piece = if info.len == 0 {
            first_piece
        } else {
            ((info.end_offset() - 1) / piece_len) as PieceIndex
        };
        (first_piece..=last_piece).all(|piece| own_pieces.has(piece))
    }

    /// Recomputes every piece's priority and classification from the file
    /// priorities, returning the pieces that just became blacklisted.
    fn recompute(&mut self) -> PriorityChange {
        let mut change = PriorityChange::default();
        for piece in 0..self.storage.piece_count {
            let files = self
                .storage
                .files_intersecting_piece(piece)
                .expect("piece index from storage's own piece count");

            let mut priority = 0;
            let mut any_skipped = false;
            let mut any_wanted = false;
            for file in files {
                let file_priority = self.files[file];
                priority = priority.max(file_priority.piece_contribution());
                if file_priority == FilePriority::Skip {
                    any_skipped = true;
                } else {
                    any_wanted = true;
                }
            }

            let class = match (any_skipped, any_wanted) {
                (true, false) => PieceClass::Blacklisted,
                (false, _) => PieceClass::Wanted,
                (true, true) => PieceClass::Boundary,
            };
            if class == PieceClass::Blacklisted
                && self.classes[piece] != PieceClass::Blacklisted
            {
                change.newly_blacklisted.push(piece);
            }
            self.pieces[piece] = priority;
            self.classes[piece] = class;
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::tests::storage_with_files;
    use pretty_assertions::assert_eq;

    /// Three files over four 8 byte pieces:
    ///
    /// ```text
    /// pieces: |0       |1       |2       |3   |
    /// files:  |a           |b  |c            |
    ///         0           12  16            28
    /// ```
    fn fixture() -> FilePriorities {
        FilePriorities::new(storage_with_files(8, &[12, 4, 12]))
    }

    #[test]
    fn test_all_normal_by_default() {
        let priorities = fixture();
        assert_eq!(priorities.piece_priorities(), &[1, 1, 1, 1]);
        for piece in 0..4 {
            assert_eq!(priorities.piece_class(piece), PieceClass::Wanted);
            assert!(priorities.is_piece_wanted(piece));
        }
    }

    #[test]
    fn test_skip_blacklists_only_fully_covered_pieces() {
        let mut priorities = fixture();
        let own = Bitfield::new(4);

        // skipping file 0 ([0, 12)): piece 0 ([0, 8)) is covered only by it,
        // piece 1 ([8, 16)) also touches file 1
        let change = priorities
            .set_file_priority(0, FilePriority::Skip, &own)
            .unwrap();
        assert_eq!(change.newly_blacklisted, vec![0]);
        assert_eq!(priorities.piece_class(0), PieceClass::Blacklisted);
        assert!(!priorities.is_piece_wanted(0));
        assert_eq!(priorities.piece_class(1), PieceClass::Boundary);
        assert_eq!(priorities.piece_priorities(), &[0, 1, 1, 1]);

        // skipping file 1 completes piece 1's cover of skipped files
        let change = priorities
            .set_file_priority(1, FilePriority::Skip, &own)
            .unwrap();
        assert_eq!(change.newly_blacklisted, vec![1]);

        // and skipping file 2 blacklists the rest
        let change = priorities
            .set_file_priority(2, FilePriority::Skip, &own)
            .unwrap();
        assert_eq!(change.newly_blacklisted, vec![2, 3]);
        assert_eq!(priorities.piece_priorities(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_high_priority_wins_on_shared_pieces() {
        let mut priorities = fixture();
        let own = Bitfield::new(4);
        priorities
            .set_file_priority(1, FilePriority::High, &own)
            .unwrap();
        // file 1 spans [12, 16), which is inside piece 1
        assert_eq!(priorities.piece_priorities(), &[1, 2, 1, 1]);
        assert_eq!(priorities.piece_class(1), PieceClass::Wanted);
    }

    #[test]
    fn test_unskipping_restores_pieces() {
        let mut priorities = fixture();
        let own = Bitfield::new(4);
        priorities
            .set_file_priority(0, FilePriority::Skip, &own)
            .unwrap();
        let change = priorities
            .set_file_priority(0, FilePriority::Normal, &own)
            .unwrap();
        assert_eq!(change.newly_blacklisted, vec![]);
        assert_eq!(priorities.piece_class(0), PieceClass::Wanted);
        assert_eq!(priorities.piece_priorities(), &[1, 1, 1, 1]);
    }

    #[test]
    fn test_refuses_to_skip_completed_file() {
        let mut priorities = fixture();
        let mut own = Bitfield::new(4);
        // file 1 spans only piece 1
        own.set(1);
        assert!(matches!(
            priorities.set_file_priority(1, FilePriority::Skip, &own),
            Err(Error::FileAlreadyComplete)
        ));
        // an incomplete file can still be skipped
        assert!(priorities
            .set_file_priority(2, FilePriority::Skip, &own)
            .is_ok());
    }

    #[test]
    fn test_invalid_file_index() {
        let mut priorities = fixture();
        let own = Bitfield::new(4);
        assert!(matches!(
            priorities.set_file_priority(9, FilePriority::High, &own),
            Err(Error::InvalidFileIndex)
        ));
    }

    #[test]
    fn test_setting_same_priority_is_a_noop() {
        let mut priorities = fixture();
        let own = Bitfield::new(4);
        let change = priorities
            .set_file_priority(0, FilePriority::Normal, &own)
            .unwrap();
        assert_eq!(change, PriorityChange::default());
    }
}
