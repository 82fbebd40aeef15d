//! Remote peers known to the session.
//!
//! Liveness is cooperative: every housekeeping tick calls
//! [`PeerTable::expire`], so a silent peer is dropped at most one tick after
//! the timeout.

use crate::transport::PeerSnapshot;
use common::types::Uid;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// One remote participant.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub uid: Uid,
    pub joined_at: Instant,
    pub last_seen: Instant,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub video_enabled: bool,
    pub dual_stream: bool,
}

impl RemotePeer {
    fn from_snapshot(snapshot: &PeerSnapshot, now: Instant) -> Self {
        Self {
            uid: snapshot.uid,
            joined_at: now,
            last_seen: now,
            audio_muted: snapshot.audio_muted,
            video_muted: snapshot.video_muted,
            video_enabled: snapshot.video_enabled,
            dual_stream: snapshot.dual_stream,
        }
    }
}

/// Outcome of rebuilding the table from a membership snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Peers not known before the snapshot, ordered by uid.
    pub joined: Vec<Uid>,
    /// Previously known peers absent from the snapshot, ordered by uid.
    pub dropped: Vec<Uid>,
}

/// Peers of the current session.
#[derive(Debug, Default)]
pub struct PeerTable {
    local_uid: Uid,
    peers: HashMap<Uid, RemotePeer>,
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resolved local uid. Peers claiming it are rejected.
    pub fn set_local_uid(&mut self, uid: Uid) {
        self.local_uid = uid;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.peers.contains_key(&uid)
    }

    #[must_use]
    pub fn get(&self, uid: Uid) -> Option<&RemotePeer> {
        self.peers.get(&uid)
    }

    pub fn get_mut(&mut self, uid: Uid) -> Option<&mut RemotePeer> {
        self.peers.get_mut(&uid)
    }

    /// Uids ordered ascending.
    #[must_use]
    pub fn uids(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.peers.keys().copied().collect();
        uids.sort();
        uids
    }

    fn admissible(&self, uid: Uid) -> bool {
        !uid.is_local() && uid != self.local_uid
    }

    /// Record a peer announced by signaling. Returns true if it is new.
    ///
    /// A peer already present only has its media flags refreshed. The local
    /// uid and the reserved uid 0 are never admitted.
    pub fn observe(&mut self, snapshot: &PeerSnapshot, now: Instant) -> bool {
        if !self.admissible(snapshot.uid) {
            return false;
        }
        match self.peers.get_mut(&snapshot.uid) {
            Some(peer) => {
                peer.last_seen = now;
                peer.audio_muted = snapshot.audio_muted;
                peer.video_muted = snapshot.video_muted;
                peer.video_enabled = snapshot.video_enabled;
                peer.dual_stream = snapshot.dual_stream;
                false
            }
            None => {
                self.peers
                    .insert(snapshot.uid, RemotePeer::from_snapshot(snapshot, now));
                true
            }
        }
    }

    /// Refresh liveness. Returns false for unknown peers.
    pub fn touch(&mut self, uid: Uid, now: Instant) -> bool {
        match self.peers.get_mut(&uid) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, uid: Uid) -> Option<RemotePeer> {
        self.peers.remove(&uid)
    }

    /// Remove peers silent for at least `timeout`. Returns them ordered by uid.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<Uid> {
        let mut expired: Vec<Uid> = self
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_seen) >= timeout)
            .map(|p| p.uid)
            .collect();
        expired.sort();
        for uid in &expired {
            self.peers.remove(uid);
        }
        expired
    }

    /// Discard all state and rebuild from a fresh snapshot.
    pub fn rebuild(&mut self, snapshot: &[PeerSnapshot], now: Instant) -> MembershipDiff {
        let before: HashSet<Uid> = self.peers.keys().copied().collect();
        self.peers.clear();
        for peer in snapshot {
            if self.admissible(peer.uid) {
                self.peers
                    .insert(peer.uid, RemotePeer::from_snapshot(peer, now));
            }
        }

        let mut joined: Vec<Uid> = self
            .peers
            .keys()
            .filter(|uid| !before.contains(uid))
            .copied()
            .collect();
        joined.sort();
        let mut dropped: Vec<Uid> = before
            .into_iter()
            .filter(|uid| !self.peers.contains_key(uid))
            .collect();
        dropped.sort();

        MembershipDiff { joined, dropped }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_observe_new_and_existing() {
        let mut table = PeerTable::new();
        table.set_local_uid(Uid(42));
        let now = Instant::now();

        assert!(table.observe(&PeerSnapshot::new(Uid(7)), now));
        let mut update = PeerSnapshot::new(Uid(7));
        update.audio_muted = true;
        assert!(!table.observe(&update, now));
        assert!(table.get(Uid(7)).is_some_and(|p| p.audio_muted));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_and_reserved_uids_rejected() {
        let mut table = PeerTable::new();
        table.set_local_uid(Uid(42));
        let now = Instant::now();

        assert!(!table.observe(&PeerSnapshot::new(Uid(42)), now));
        assert!(!table.observe(&PeerSnapshot::new(Uid::LOCAL), now));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_after_silence() {
        let mut table = PeerTable::new();
        table.observe(&PeerSnapshot::new(Uid(7)), Instant::now());
        table.observe(&PeerSnapshot::new(Uid(8)), Instant::now());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(table.touch(Uid(8), Instant::now()));
        assert!(!table.touch(Uid(9), Instant::now()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(table.expire(Instant::now(), Duration::from_secs(15)), vec![Uid(7)]);
        assert!(table.contains(Uid(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_reports_diff() {
        let mut table = PeerTable::new();
        table.set_local_uid(Uid(42));
        let now = Instant::now();
        table.observe(&PeerSnapshot::new(Uid(1)), now);
        table.observe(&PeerSnapshot::new(Uid(2)).with_dual_stream(), now);

        let diff = table.rebuild(
            &[
                PeerSnapshot::new(Uid(2)),
                PeerSnapshot::new(Uid(3)),
                PeerSnapshot::new(Uid(42)),
            ],
            now,
        );

        assert_eq!(diff.joined, vec![Uid(3)]);
        assert_eq!(diff.dropped, vec![Uid(1)]);
        assert_eq!(table.uids(), vec![Uid(2), Uid(3)]);
        // State was rebuilt, not carried over.
        assert!(table.get(Uid(2)).is_some_and(|p| !p.dual_stream));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_from_empty_snapshot() {
        let mut table = PeerTable::new();
        table.observe(&PeerSnapshot::new(Uid(1)), Instant::now());

        let diff = table.rebuild(&[], Instant::now());
        assert_eq!(diff.dropped, vec![Uid(1)]);
        assert!(table.is_empty());
    }
}
