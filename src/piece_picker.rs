//! Picks the pieces to download from a peer.

use std::collections::HashSet;

use crate::{Bitfield, PieceIndex};

/// Everything the picker looks at. It is a pure function of this input:
/// no clock, no IO, and identical inputs produce identical output.
pub(crate) struct PickContext<'a> {
    /// The pieces the peer has.
    pub peer_pieces: &'a Bitfield,
    /// The pieces we already have; never picked again.
    pub own_pieces: &'a Bitfield,
    /// Per piece priority; 0 means the piece is not wanted at all.
    pub priorities: &'a [u8],
    /// Per piece count of non-seed peers that have it; seeds are excluded
    /// since they don't differentiate between pieces.
    pub availability: &'a [usize],
    /// The pieces that are already partially downloaded.
    pub started: &'a HashSet<PieceIndex>,
}

/// Selects up to `max_pieces` pieces to request from a peer.
///
/// Candidates are every piece the peer has, we don't, and that has a
/// non-zero priority. They are ranked by descending priority first, then
/// partially downloaded pieces before fresh ones (finish what we started),
/// then rarest first. The piece index breaks remaining ties to keep the
/// order fully deterministic.
pub(crate) fn pick_pieces(
    ctx: PickContext<'_>,
    max_pieces: usize,
) -> Vec<PieceIndex> {
    debug_assert_eq!(ctx.own_pieces.len(), ctx.priorities.len());
    debug_assert_eq!(ctx.own_pieces.len(), ctx.availability.len());

    let mut candidates: Vec<PieceIndex> = (0..ctx.own_pieces.len())
        .filter(|index| {
            ctx.peer_pieces.has(*index)
                && !ctx.own_pieces.has(*index)
                && ctx.priorities[*index] > 0
        })
        .collect();

    candidates.sort_by_key(|index| {
        (
            std::cmp::Reverse(ctx.priorities[*index]),
            std::cmp::Reverse(ctx.started.contains(index)),
            ctx.availability[*index],
            *index,
        )
    });
    candidates.truncate(max_pieces);
    candidates
}
