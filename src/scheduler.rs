//! Piece scheduling.
//!
//! A single [`Scheduler`] is shared across every peer task for one torrent.
//! It owns the only copy of "which pieces are done" and "which piece is
//! whose responsibility right now", so each peer task calls into it instead
//! of keeping its own idea of global progress. The lock only ever guards
//! these two small maps — never I/O — so holding it is always brief.
use crate::peer::Bitfield;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

struct Inner {
    completed: Vec<bool>,
    assigned: HashMap<usize, SocketAddr>,
    blacklist: HashSet<SocketAddr>,
    permanently_failed: HashSet<usize>,
}

pub struct Scheduler {
    num_pieces: usize,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            num_pieces,
            inner: Mutex::new(Inner {
                completed: vec![false; num_pieces],
                assigned: HashMap::new(),
                blacklist: HashSet::new(),
                permanently_failed: HashSet::new(),
            }),
        }
    }

    /// The lowest-index piece that is neither completed nor currently
    /// assigned and that `peer_bitfield` claims to have, assigned to
    /// `peer`. Sequential, lowest-index-first assignment keeps the
    /// scheduling policy simple and deterministic; it is not
    /// rarest-first, which is out of scope here.
    pub fn next_piece_for(&self, peer: SocketAddr, peer_bitfield: &Bitfield) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.blacklist.contains(&peer) {
            return None;
        }
        for index in 0..self.num_pieces {
            if inner.completed[index]
                || inner.assigned.contains_key(&index)
                || inner.permanently_failed.contains(&index)
            {
                continue;
            }
            if !peer_bitfield.has_piece(index) {
                continue;
            }
            inner.assigned.insert(index, peer);
            return Some(index);
        }
        None
    }

    /// Marks a piece done and releases its assignment.
    pub fn piece_completed(&self, index: usize) {
        let mut inner = self.inner.lock();
        if index < inner.completed.len() {
            inner.completed[index] = true;
        }
        inner.assigned.remove(&index);
    }

    /// Releases a piece's assignment without marking it done, so another
    /// peer can pick it up — used after a digest mismatch that hasn't yet
    /// exhausted its retry budget.
    pub fn piece_failed(&self, index: usize) {
        self.inner.lock().assigned.remove(&index);
    }

    /// Releases every piece assigned to `peer`, e.g. after its connection
    /// drops, so they become available for reassignment.
    pub fn peer_dropped(&self, peer: SocketAddr) {
        self.inner.lock().assigned.retain(|_, assigned_to| *assigned_to != peer);
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().completed.iter().all(|&done| done)
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().completed.iter().filter(|&&done| done).count()
    }

    /// Blacklists `peer` for the remainder of this session and releases
    /// any piece currently assigned to it, per the disposition for a
    /// rejected handshake or an info-hash mismatch.
    pub fn blacklist(&self, peer: SocketAddr) {
        let mut inner = self.inner.lock();
        inner.blacklist.insert(peer);
        inner.assigned.retain(|_, assigned_to| *assigned_to != peer);
    }

    pub fn is_blacklisted(&self, peer: SocketAddr) -> bool {
        self.inner.lock().blacklist.contains(&peer)
    }

    /// Records that piece `index` exhausted its retry budget and releases
    /// its assignment. It stays neither completed nor assignable.
    pub fn mark_permanently_failed(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.permanently_failed.insert(index);
        inner.assigned.remove(&index);
    }

    pub fn has_permanently_failed_pieces(&self) -> bool {
        !self.inner.lock().permanently_failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn full_bitfield(n: usize) -> Bitfield {
        let mut bf = Bitfield::new(n);
        for i in 0..n {
            bf.set_piece(i);
        }
        bf
    }

    #[test]
    fn assigns_lowest_index_first() {
        let scheduler = Scheduler::new(3);
        let bf = full_bitfield(3);
        assert_eq!(scheduler.next_piece_for(addr(1), &bf), Some(0));
        assert_eq!(scheduler.next_piece_for(addr(1), &bf), Some(1));
    }

    #[test]
    fn does_not_double_assign_a_piece() {
        let scheduler = Scheduler::new(1);
        let bf = full_bitfield(1);
        assert_eq!(scheduler.next_piece_for(addr(1), &bf), Some(0));
        assert_eq!(scheduler.next_piece_for(addr(2), &bf), None);
    }

    #[test]
    fn peer_dropped_frees_its_assignments() {
        let scheduler = Scheduler::new(1);
        let bf = full_bitfield(1);
        scheduler.next_piece_for(addr(1), &bf);
        scheduler.peer_dropped(addr(1));
        assert_eq!(scheduler.next_piece_for(addr(2), &bf), Some(0));
    }

    #[test]
    fn piece_completed_is_reflected_in_is_done() {
        let scheduler = Scheduler::new(1);
        let bf = full_bitfield(1);
        scheduler.next_piece_for(addr(1), &bf);
        assert!(!scheduler.is_done());
        scheduler.piece_completed(0);
        assert!(scheduler.is_done());
    }

    #[test]
    fn only_assigns_pieces_the_peer_has() {
        let scheduler = Scheduler::new(2);
        let mut bf = Bitfield::new(2);
        bf.set_piece(1);
        assert_eq!(scheduler.next_piece_for(addr(1), &bf), Some(1));
    }

    #[test]
    fn blacklisted_peer_gets_no_piece_and_loses_its_assignment() {
        let scheduler = Scheduler::new(1);
        let bf = full_bitfield(1);
        scheduler.next_piece_for(addr(1), &bf);
        scheduler.blacklist(addr(1));
        assert!(scheduler.is_blacklisted(addr(1)));
        assert_eq!(scheduler.next_piece_for(addr(1), &bf), None);
        assert_eq!(scheduler.next_piece_for(addr(2), &bf), Some(0));
    }

    #[test]
    fn permanently_failed_piece_is_never_reassigned() {
        let scheduler = Scheduler::new(1);
        let bf = full_bitfield(1);
        scheduler.next_piece_for(addr(1), &bf);
        scheduler.mark_permanently_failed(0);
        assert!(scheduler.has_permanently_failed_pieces());
        assert_eq!(scheduler.next_piece_for(addr(2), &bf), None);
        assert!(!scheduler.is_done());
    }
}
