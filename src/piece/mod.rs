//! Piece and block data model.
//!
//! A torrent's data is divided into pieces, and each piece is requested and
//! transferred in fixed-size blocks. Digest verification always runs over
//! a contiguous `&[u8]` piece buffer — never over a reinterpreted
//! collection of individual byte values, which is the failure mode that
//! silently turns a correct-looking verifier into one that always passes.
pub mod store;

use sha1::{Digest, Sha1};

pub use store::{PieceError, PieceStore};

/// The block size this client requests pieces in by default. Real-world
/// peers nearly universally expect 16 KiB and may refuse larger requests;
/// configurable via [`crate::config::Config::block_size`].
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// The default number of outstanding block requests kept in flight per peer.
pub const DEFAULT_REQUEST_WINDOW: usize = 10;

/// How many times a piece may fail digest verification before it is
/// abandoned (and, at the runtime level, reassigned to another peer).
pub const MAX_PIECE_RETRIES: u32 = 3;

/// The length of the next block to request within a piece, starting at
/// `next_offset` bytes into a piece of `piece_len` bytes, capped at
/// `block_size`. Returns `0` once the piece has been fully requested.
///
/// Computed incrementally rather than batched up front, so a peer session
/// can top up its request window one block at a time as each block
/// completes, instead of only requesting a piece's first `request_window`
/// blocks and stalling forever on anything larger than that window.
pub fn next_block_length(piece_len: u32, next_offset: u32, block_size: u32) -> u32 {
    block_size.min(piece_len.saturating_sub(next_offset))
}

/// Whether `data`'s SHA-1 digest matches `expected`, computed over the
/// contiguous byte buffer.
pub fn digest_matches(data: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().as_slice() == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_blocks_are_capped_at_block_size() {
        assert_eq!(next_block_length(BLOCK_SIZE * 2, 0, BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(next_block_length(BLOCK_SIZE * 2, BLOCK_SIZE, BLOCK_SIZE), BLOCK_SIZE);
    }

    #[test]
    fn last_block_is_shorter_when_not_a_multiple() {
        let piece_len = BLOCK_SIZE + 100;
        assert_eq!(next_block_length(piece_len, BLOCK_SIZE, BLOCK_SIZE), 100);
    }

    #[test]
    fn fully_requested_piece_yields_zero_length() {
        assert_eq!(next_block_length(BLOCK_SIZE, BLOCK_SIZE, BLOCK_SIZE), 0);
    }

    #[test]
    fn digest_matches_only_exact_content() {
        let data = b"hello world";
        let mut hasher = Sha1::new();
        hasher.update(data);
        let expected: [u8; 20] = hasher.finalize().into();
        assert!(digest_matches(data, &expected));
        assert!(!digest_matches(b"hello worlD", &expected));
    }
}
