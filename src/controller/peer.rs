use std::net::SocketAddr;

use rand::seq::SliceRandom;

use crate::group::{MemberInfo, MemberRole};

/// Leader-side view of one remote member.
#[derive(Debug, Clone)]
pub struct Peer {
    pub member_id: u64,
    pub addr: SocketAddr,
    pub role: MemberRole,
    /// Highest position the peer acknowledged appending.
    pub match_position: u64,
    /// Highest position the peer acknowledged as durable.
    pub sync_match_position: u64,
    /// Compaction point last delivered to the peer; compaction requests
    /// are monotone, so a peer at this point is never re-sent a lower or
    /// equal one.
    pub compact_position: u64,
    /// Group version the peer last reported.
    pub group_version: u64,
    /// Validated leader term the peer last reported; negative when the
    /// peer knows no leader.
    pub leader_check: i64,
    /// `(active_sessions, leader_weight)` from the last snapshot scoring
    /// round.
    pub snapshot_score: Option<(u32, f32)>,
}

impl Peer {
    pub fn new(info: &MemberInfo) -> Peer {
        Peer {
            member_id: info.id,
            addr: info.addr,
            role: info.role,
            match_position: 0,
            sync_match_position: 0,
            compact_position: 0,
            group_version: 0,
            leader_check: -1,
            snapshot_score: None,
        }
    }

    pub fn is_consensus(&self) -> bool {
        self.role.is_consensus()
    }
}

/// Majority-committed position: sorts the consensus match positions
/// (the local highest among them) and takes the upper median, which is
/// the largest position a majority has reached.
pub fn quorum_commit(local_highest: u64, peers: &[Peer]) -> u64 {
    let mut positions: Vec<u64> = peers
        .iter()
        .filter(|p| p.is_consensus())
        .map(|p| p.match_position)
        .collect();
    positions.push(local_highest);
    positions.sort_unstable();
    positions[positions.len() / 2]
}

/// Picks the best peer to serve a snapshot: fewest active sessions wins,
/// the leader is penalized, and ties fall to a random shuffle ahead of a
/// stable sort.
pub fn pick_snapshot_peer(peers: &[Peer]) -> Option<u64> {
    let mut scored: Vec<(u64, u32, f32)> = peers
        .iter()
        .filter_map(|p| {
            p.snapshot_score
                .map(|(sessions, weight)| (p.member_id, sessions, weight))
        })
        .collect();
    scored.shuffle(&mut rand::thread_rng());
    scored.sort_by(|a, b| {
        (a.1, a.2)
            .partial_cmp(&(b.1, b.2))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.first().map(|(id, _, _)| *id)
}

#[cfg(test)]
mod test {
    use super::*;

    fn peer(id: u64, role: MemberRole, match_position: u64) -> Peer {
        let mut p = Peer::new(&MemberInfo {
            id,
            addr: format!("127.0.0.1:{}", 8000 + id).parse().unwrap(),
            role,
        });
        p.match_position = match_position;
        p
    }

    #[test]
    fn quorum_is_upper_median() {
        // three nodes: local at 100, peers at 40 and 80 -> 80 has majority
        let peers = vec![
            peer(2, MemberRole::Normal, 40),
            peer(3, MemberRole::Normal, 80),
        ];
        assert_eq!(quorum_commit(100, &peers), 80);

        // observers do not count
        let mut with_observer = peers.clone();
        with_observer.push(peer(4, MemberRole::Observer, 1000));
        assert_eq!(quorum_commit(100, &with_observer), 80);

        // single node commits alone
        assert_eq!(quorum_commit(100, &[]), 100);

        // five nodes
        let five = vec![
            peer(2, MemberRole::Normal, 10),
            peer(3, MemberRole::Normal, 20),
            peer(4, MemberRole::Standby, 30),
            peer(5, MemberRole::Normal, 40),
        ];
        assert_eq!(quorum_commit(50, &five), 30);
    }

    #[test]
    fn snapshot_peer_prefers_idle_followers() {
        let mut a = peer(2, MemberRole::Normal, 0);
        a.snapshot_score = Some((3, -1.0));
        let mut b = peer(3, MemberRole::Normal, 0);
        b.snapshot_score = Some((0, -1.0));
        let mut leader = peer(4, MemberRole::Normal, 0);
        leader.snapshot_score = Some((0, 1.0));
        let unscored = peer(5, MemberRole::Normal, 0);

        let picked = pick_snapshot_peer(&[a, b, leader, unscored]);
        assert_eq!(picked, Some(3));

        assert_eq!(pick_snapshot_peer(&[]), None);
    }
}
