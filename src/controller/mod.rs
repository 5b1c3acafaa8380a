//! The consensus controller: role and term state machine, election,
//! replication fan-out, quorum commit tracking, and group membership
//! administration. One controller drives one [`StateLog`] and one
//! [`ChannelManager`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hashbrown::HashSet;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::watch;

use crate::channel::{
    connect_stream, ChannelHandler, ChannelManager, Command, ConnectHeader, ConnectionType,
    PeerChannel, WriteFrame,
};
use crate::config::Config;
use crate::controller::peer::{pick_snapshot_peer, quorum_commit, Peer};
use crate::error::{Error, Result};
use crate::group::{ControlMessage, GroupMembership, MemberRole};
use crate::state_log::StateLog;
use crate::term_log::{CommitWait, LogInfo, LogWriter};

pub mod peer;

/// Raft role of the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Bytes served per `QUERY_DATA` reply command.
const QUERY_DATA_CHUNK: usize = 64 * 1024;
/// Missing ranges requested per missing-data tick.
const MISSING_RANGES_PER_TICK: usize = 16;
/// Minimum interval between `QUERY_TERMS` probes.
const QUERY_TERMS_INTERVAL: Duration = Duration::from_millis(1);

struct CtlState {
    role: Role,
    current_term: u64,
    /// Term for which a reachable leader has been confirmed.
    validated_term: u64,
    voted_for: Option<u64>,
    grants_remaining: u32,
    /// Stability gate: positive while a leader was recently observed.
    election_validated: i32,
    leader_id: Option<u64>,
    /// Channel replies to the current leader ride on.
    leader_reply_channel: Option<Arc<PeerChannel>>,
    peers: Vec<Peer>,
    leader_writer: Option<LogWriter>,
    /// Quorum commit position this leader has established.
    commit_position: u64,
    proxy_index: usize,
    proxy_bytes: u64,
    /// Control messages written to the log, waiting for commit.
    pending_controls: Vec<(u64, ControlMessage)>,
    /// Outstanding missing-data query ranges; cleared on role change and
    /// shutdown so queries are abortable.
    missing_requests: HashSet<(u64, u64)>,
    /// Ticks the leader has watched commit trail highest.
    leadership_strikes: i32,
}

pub struct Controller {
    config: Config,
    state_log: Arc<StateLog>,
    manager: Arc<ChannelManager>,
    group: Arc<dyn GroupMembership>,
    state: parking_lot::Mutex<CtlState>,
    query_terms_last: parking_lot::Mutex<Option<Instant>>,
    snapshot_sessions: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl Controller {
    pub fn new(
        config: Config,
        state_log: Arc<StateLog>,
        manager: Arc<ChannelManager>,
        group: Arc<dyn GroupMembership>,
    ) -> Arc<Controller> {
        let local = state_log.capture_highest();
        let commit_position = local.appliable();
        let peers = group
            .members()
            .iter()
            .filter(|m| m.id != config.local_member_id)
            .map(Peer::new)
            .collect();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Controller {
            config: config.clone(),
            state_log,
            manager,
            group,
            state: parking_lot::Mutex::new(CtlState {
                role: Role::Follower,
                current_term: local.term,
                validated_term: 0,
                voted_for: None,
                grants_remaining: 0,
                election_validated: config.election_validation_budget,
                leader_id: None,
                leader_reply_channel: None,
                peers,
                leader_writer: None,
                commit_position,
                proxy_index: 0,
                proxy_bytes: 0,
                pending_controls: Vec::new(),
                missing_requests: HashSet::new(),
                leadership_strikes: 0,
            }),
            query_terms_last: parking_lot::Mutex::new(None),
            snapshot_sessions: AtomicU32::new(0),
            shutdown,
        })
    }

    /// Starts the transport and the periodic tasks. Returns the bound
    /// listen address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = self.manager.start(self.clone()).await?;
        {
            let st = self.state.lock();
            for peer in &st.peers {
                self.manager.connect(peer.member_id, peer.addr);
            }
        }
        tokio::spawn(election_loop(self.clone()));
        tokio::spawn(missing_data_loop(self.clone()));
        tokio::spawn(sync_loop(self.clone()));
        Ok(addr)
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.state.lock().leader_id
    }

    pub fn state_log(&self) -> &Arc<StateLog> {
        &self.state_log
    }

    pub fn local_member_id(&self) -> u64 {
        self.config.local_member_id
    }

    /// Appends `data` to the replicated log. Leader only; returns the
    /// position just past the written bytes.
    pub fn write(&self, data: &[u8]) -> Result<u64> {
        let mut st = self.state.lock();
        if st.role != Role::Leader {
            return Err(Error::InvalidState("not the leader"));
        }
        self.write_locked(&mut st, Bytes::copy_from_slice(data))
    }

    fn write_locked(&self, st: &mut CtlState, data: Bytes) -> Result<u64> {
        let writer = st
            .leader_writer
            .as_mut()
            .ok_or(Error::InvalidState("not the leader"))?;
        let position = writer.position();
        let end = position + data.len() as u64;
        writer.write(&data, end)?;
        let info = writer.log().info();
        self.update_commit(st, &info);

        let frame = WriteFrame {
            prev_term: prev_for(&info, position),
            term: info.term,
            position,
            highest: info.highest,
            commit: st.commit_position,
            data,
        };
        self.replicate(st, frame);
        Ok(end)
    }

    /// Sends a write to the peers, either directly or through a proxy
    /// peer that fans it out. Heartbeats (empty frames) always go direct
    /// so every follower keeps a validated channel to the leader.
    fn replicate(&self, st: &mut CtlState, frame: WriteFrame) {
        if self.config.proxy_writes && !frame.data.is_empty() && st.peers.len() >= 2 {
            if st.proxy_bytes >= self.config.proxy_rebalance_bytes {
                st.proxy_index = st.proxy_index.wrapping_add(1);
                st.proxy_bytes = 0;
            }
            st.proxy_bytes += frame.data.len() as u64;
            let proxy = &st.peers[st.proxy_index % st.peers.len()];
            self.send_to(proxy.member_id, proxy.addr, &Command::WriteAndProxy(frame));
        } else {
            let cmd = Command::WriteData(frame);
            for peer in &st.peers {
                self.send_to(peer.member_id, peer.addr, &cmd);
            }
        }
    }

    /// Waits for the appliable commit to reach `position`.
    pub async fn wait_for_commit(&self, position: u64, timeout: Duration) -> CommitWait {
        let log = match self.state_log.term_at(position.saturating_sub(1)) {
            Some(log) => log,
            None => {
                let info = self.state_log.capture_highest();
                match self.state_log.term_log(info.term) {
                    Some(log) => log,
                    None => return CommitWait::TermEnded,
                }
            }
        };
        log.wait_for_commit(position, timeout).await
    }

    /// Proposes a member joining the group. Leader only; applied once the
    /// control message commits.
    pub fn propose_join(&self, id: u64, addr: SocketAddr, role: MemberRole) -> Result<u64> {
        let mut st = self.state.lock();
        if st.role != Role::Leader {
            return Err(Error::InvalidState("not the leader"));
        }
        let msg = self.group.propose_join(id, addr, role);
        self.write_control(&mut st, msg)
    }

    /// Proposes a role change. A change that alters the consensus
    /// majority requires a majority of consensus peers to have confirmed
    /// the current group version first.
    pub fn propose_update_role(&self, id: u64, role: MemberRole) -> Result<u64> {
        let mut st = self.state.lock();
        if st.role != Role::Leader {
            return Err(Error::InvalidState("not the leader"));
        }
        let old_role = self
            .group
            .members()
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.role)
            .ok_or(Error::InvalidState("unknown member"))?;
        if old_role.is_consensus() != role.is_consensus() {
            let version = self.group.version();
            let confirmed = st
                .peers
                .iter()
                .filter(|p| p.is_consensus() && p.group_version == version)
                .count()
                + 1;
            let total = self.consensus_total(&st);
            if confirmed * 2 <= total {
                return Err(Error::InvalidState(
                    "group version not confirmed by a majority",
                ));
            }
        }
        let msg = self.group.propose_update_role(id, role);
        self.write_control(&mut st, msg)
    }

    /// Proposes removing a member. The leader removing itself is
    /// unsupported and surfaced as an error.
    pub fn propose_remove(&self, id: u64) -> Result<u64> {
        let mut st = self.state.lock();
        if st.role != Role::Leader {
            return Err(Error::InvalidState("not the leader"));
        }
        if id == self.config.local_member_id {
            return Err(Error::InvalidState("leader cannot remove itself"));
        }
        let msg = self.group.propose_remove(id);
        self.write_control(&mut st, msg)
    }

    fn write_control(&self, st: &mut CtlState, msg: ControlMessage) -> Result<u64> {
        let position = self.write_locked(st, Bytes::from(msg.encode()))?;
        st.pending_controls.push((position, msg));
        Ok(position)
    }

    /// Fans a snapshot scoring round out to the peers; replies fill in
    /// [`Peer::snapshot_score`].
    pub fn request_snapshot_scores(&self) {
        let st = self.state.lock();
        for peer in &st.peers {
            self.send_to(peer.member_id, peer.addr, &Command::SnapshotScore);
        }
    }

    pub fn best_snapshot_peer(&self) -> Option<(u64, SocketAddr)> {
        let st = self.state.lock();
        let id = pick_snapshot_peer(&st.peers)?;
        st.peers
            .iter()
            .find(|p| p.member_id == id)
            .map(|p| (p.member_id, p.addr))
    }

    /// Opens a snapshot stream to the best-scored peer. The stream's
    /// contents belong to the snapshot layer.
    pub async fn connect_snapshot(&self) -> Result<(tokio::net::TcpStream, ConnectHeader)> {
        let (_, addr) = self
            .best_snapshot_peer()
            .ok_or(Error::InvalidState("no snapshot peer available"))?;
        let mut kind = ConnectionType::SNAPSHOT;
        if self.config.checksums {
            kind |= ConnectionType::CRC;
        }
        let header = ConnectHeader::new(
            self.config.group_id,
            self.config.local_member_id,
            kind,
            self.config.group_token_1,
            self.config.group_token_2,
        );
        connect_stream(addr, header).await
    }

    /// Counts a snapshot serving session until the guard drops; the count
    /// feeds snapshot scoring replies.
    pub fn begin_snapshot_session(self: &Arc<Self>) -> SnapshotSession {
        self.snapshot_sessions.fetch_add(1, Ordering::AcqRel);
        SnapshotSession {
            controller: self.clone(),
        }
    }

    /// Immediately campaigns for leadership.
    pub fn force_election(&self) {
        let mut st = self.state.lock();
        st.election_validated = -1;
        self.campaign(&mut st);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        {
            let mut st = self.state.lock();
            st.missing_requests.clear();
            st.leader_writer = None;
        }
        self.manager.shutdown();
        self.state_log.close();
    }

    /// Returns whether the command was handed to a live socket.
    fn send_to(&self, peer_id: u64, addr: SocketAddr, cmd: &Command) -> bool {
        let ch = self.manager.connect(peer_id, addr);
        match ch.send(cmd) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(peer = peer_id, %e, "send failed");
                false
            }
        }
    }

    /// Consensus member count, the local member included when it votes.
    fn consensus_total(&self, st: &CtlState) -> usize {
        let peers = st.peers.iter().filter(|p| p.is_consensus()).count();
        if self.group.local_role().is_consensus() {
            peers + 1
        } else {
            peers
        }
    }

    fn become_follower(&self, st: &mut CtlState, term: u64) {
        if term > st.current_term {
            st.voted_for = None;
        }
        if st.role != Role::Follower {
            tracing::info!(term, "stepping down to follower");
        }
        st.role = Role::Follower;
        st.current_term = st.current_term.max(term);
        st.grants_remaining = 0;
        st.leader_writer = None;
        st.leadership_strikes = 0;
        st.missing_requests.clear();
    }

    fn campaign(&self, st: &mut CtlState) {
        let total = self.consensus_total(st);
        if total == 0 || !self.group.local_role().is_consensus() {
            return;
        }
        st.role = Role::Candidate;
        st.current_term += 1;
        st.voted_for = Some(self.config.local_member_id);
        st.leader_id = None;
        st.leader_reply_channel = None;
        // votes still needed beyond our own
        st.grants_remaining = (total / 2) as u32;
        tracing::info!(term = st.current_term, "campaigning for leadership");
        if st.grants_remaining == 0 {
            self.become_leader(st);
            return;
        }
        let local = self.state_log.capture_highest();
        let cmd = Command::RequestVote {
            term: st.current_term,
            candidate_id: self.config.local_member_id,
            highest_term: local.term,
            highest_position: local.highest,
        };
        for peer in st.peers.iter().filter(|p| p.is_consensus()) {
            self.send_to(peer.member_id, peer.addr, &cmd);
        }
    }

    fn become_leader(&self, st: &mut CtlState) {
        let term = st.current_term;
        let local = self.state_log.capture_highest();
        let log = match self.state_log.define_term(local.term, term, local.highest) {
            Ok(Some(log)) => log,
            Ok(None) => {
                tracing::warn!(term, "could not root leadership term");
                self.become_follower(st, term);
                return;
            }
            Err(e) => {
                tracing::warn!(term, %e, "could not define leadership term");
                self.become_follower(st, term);
                return;
            }
        };
        let writer = match log.open_writer(local.highest) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(%e, "could not open leadership writer");
                self.become_follower(st, term);
                return;
            }
        };
        st.role = Role::Leader;
        st.validated_term = st.current_term;
        st.leader_id = Some(self.config.local_member_id);
        st.leader_reply_channel = None;
        st.leader_writer = Some(writer);
        st.leadership_strikes = 0;
        for peer in st.peers.iter_mut() {
            peer.match_position = 0;
        }
        tracing::info!(term = st.current_term, "leadership established");

        // an empty write announces the term and carries the commit
        if let Err(e) = self.write_locked(st, Bytes::new()) {
            tracing::warn!(%e, "leadership announcement failed");
        }
    }

    /// Recomputes the quorum commit from the match positions and applies
    /// any pending control messages that just committed.
    fn update_commit(&self, st: &mut CtlState, info: &LogInfo) {
        let commit = quorum_commit(info.highest, &st.peers);
        if commit > st.commit_position {
            st.commit_position = commit;
            self.state_log.commit(commit);
            self.apply_committed_controls(st);
        }
    }

    fn apply_committed_controls(&self, st: &mut CtlState) {
        let appliable = self.state_log.capture_highest().appliable();
        let mut applied = false;
        st.pending_controls.retain(|(position, msg)| {
            if *position <= appliable {
                applied |= self.group.apply(msg);
                false
            } else {
                true
            }
        });
        if applied {
            self.refresh_peers(st);
        }
    }

    /// Reconciles the peer set with the group membership, preserving
    /// per-peer progress and connecting channels for newcomers.
    fn refresh_peers(&self, st: &mut CtlState) {
        let members = self.group.members();
        let mut next = Vec::with_capacity(members.len());
        for member in &members {
            if member.id == self.config.local_member_id {
                continue;
            }
            let peer = match st.peers.iter().find(|p| p.member_id == member.id) {
                Some(existing) => {
                    let mut p = existing.clone();
                    p.addr = member.addr;
                    p.role = member.role;
                    p
                }
                None => Peer::new(member),
            };
            self.manager.connect(peer.member_id, peer.addr);
            next.push(peer);
        }
        let gone: Vec<u64> = st
            .peers
            .iter()
            .filter(|p| !members.iter().any(|m| m.id == p.member_id))
            .map(|p| p.member_id)
            .collect();
        for id in &gone {
            tracing::info!(member = id, "member removed, dropping channels");
        }
        if !gone.is_empty() {
            self.manager.disconnect(|id| gone.contains(&id));
        }
        st.peers = next;
    }

    /// Validates an inbound write's leader claim. Returns false when the
    /// write is stale and must be dropped without a reply. Only a write
    /// arriving straight from the leader validates its channel; a
    /// proxied write validates the term alone.
    fn validate_leader_term(
        &self,
        st: &mut CtlState,
        from: &Arc<PeerChannel>,
        term: u64,
        from_leader: bool,
    ) -> bool {
        if term < st.current_term {
            tracing::debug!(
                term,
                current = st.current_term,
                "suppressing write from stale term"
            );
            return false;
        }
        if term > st.current_term {
            self.become_follower(st, term);
        } else if st.role == Role::Leader {
            // one leader per term: our own write echoed back is a bug
            tracing::warn!(term, "write for our own leadership term ignored");
            return false;
        } else if st.role == Role::Candidate {
            self.become_follower(st, term);
        }
        if from_leader {
            if st.validated_term != term {
                st.validated_term = term;
                tracing::info!(term, leader = from.peer_id(), "leader observed");
            }
            st.leader_id = Some(from.peer_id());
            st.leader_reply_channel = Some(from.clone());
        }
        st.election_validated = self.config.election_validation_budget;
        true
    }

    /// Applies a replicated write and acks to the leader. Shared by the
    /// direct, proxy-origin and proxied paths.
    fn apply_write(
        &self,
        from: &Arc<PeerChannel>,
        frame: &WriteFrame,
        fan_out: bool,
        from_leader: bool,
    ) -> Result<()> {
        {
            let mut st = self.state.lock();
            if !self.validate_leader_term(&mut st, from, frame.term, from_leader) {
                return Ok(());
            }
        }

        let accepted = match self
            .state_log
            .open_writer(frame.prev_term, frame.term, frame.position)?
        {
            Some(mut writer) => {
                writer.write(&frame.data, frame.highest)?;
                true
            }
            None => {
                self.query_terms(from, frame.position);
                false
            }
        };
        if accepted {
            self.state_log.commit(frame.commit);
            let info = self.state_log.capture_highest();
            let reply = Command::WriteDataReply {
                term: frame.term,
                highest: info.highest,
            };
            let reply_channel = if from_leader {
                Some(from.clone())
            } else {
                // a proxied write acks straight to the leader over our
                // own dialed channel
                let leader = self.state.lock().leader_id;
                leader.and_then(|id| self.manager.client_channel(id))
            };
            if let Some(ch) = reply_channel {
                if let Err(e) = ch.send(&reply) {
                    tracing::trace!(%e, "write ack failed");
                }
            }
        }

        if fan_out {
            let st = self.state.lock();
            let leader = st.leader_id;
            let cmd = Command::WriteViaProxy(frame.clone());
            for peer in &st.peers {
                if Some(peer.member_id) == leader {
                    continue;
                }
                self.send_to(peer.member_id, peer.addr, &cmd);
            }
        }
        Ok(())
    }

    /// Rate-limited `QUERY_TERMS` probe after a rejected write.
    fn query_terms(&self, to: &Arc<PeerChannel>, position: u64) {
        {
            let mut last = self.query_terms_last.lock();
            if let Some(at) = *last {
                if at.elapsed() < QUERY_TERMS_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        let info = self.state_log.capture_highest();
        let cmd = Command::QueryTerms {
            start: info.contig,
            end: position.max(info.contig) + 1,
        };
        if let Err(e) = to.send(&cmd) {
            tracing::trace!(%e, "query terms failed");
        }
    }

    fn handle_request_vote(
        &self,
        from: &Arc<PeerChannel>,
        term: u64,
        candidate_id: u64,
        highest_term: u64,
        highest_position: u64,
    ) {
        let mut st = self.state.lock();
        if term > st.current_term {
            self.become_follower(&mut st, term);
        }
        let local = self.state_log.capture_highest();
        let candidate_current = (highest_term, highest_position) >= (local.term, local.highest);
        let grant = term >= st.current_term
            && candidate_current
            && st.voted_for.map_or(true, |v| v == candidate_id);
        let reply_term = st.current_term.max(term).max(1);
        let value = if grant {
            st.voted_for = Some(candidate_id);
            st.election_validated = self.config.election_validation_budget;
            tracing::debug!(term, candidate_id, "vote granted");
            reply_term as i64
        } else {
            tracing::debug!(term, candidate_id, "vote denied");
            -(reply_term as i64)
        };
        drop(st);
        if let Err(e) = from.send(&Command::RequestVoteReply { term: value }) {
            tracing::trace!(%e, "vote reply failed");
        }
    }

    fn handle_vote_reply(&self, term: i64) {
        let granted = term > 0;
        let term = term.unsigned_abs();
        let mut st = self.state.lock();
        if term > st.current_term {
            self.become_follower(&mut st, term);
            return;
        }
        if !granted || st.role != Role::Candidate || term != st.current_term {
            return;
        }
        if st.grants_remaining > 0 {
            st.grants_remaining -= 1;
        }
        if st.grants_remaining == 0 {
            self.become_leader(&mut st);
        }
    }

    fn handle_write_reply(&self, from: &Arc<PeerChannel>, term: u64, highest: u64) {
        let mut st = self.state.lock();
        if term > st.current_term {
            self.become_follower(&mut st, term);
            return;
        }
        if st.role != Role::Leader || term != st.current_term {
            return;
        }
        let peer_id = from.peer_id();
        let Some(peer) = st.peers.iter_mut().find(|p| p.member_id == peer_id) else {
            return;
        };
        peer.match_position = peer.match_position.max(highest);
        let info = self.state_log.capture_highest();
        self.update_commit(&mut st, &info);
    }

    /// Serves a missing-data query by streaming whatever of `[start,
    /// end)` exists locally, ending with a missing-range notice when the
    /// tail is absent.
    fn serve_query_data(&self, from: &Arc<PeerChannel>, start: u64, end: u64) {
        let current_term = self.state.lock().current_term;
        let mut pos = start;
        while pos < end {
            let Some(log) = self.state_log.term_at(pos) else {
                let _ = from.send(&Command::QueryDataReplyMissing {
                    current_term,
                    start: pos,
                    end,
                });
                return;
            };
            let info = log.info();
            let limit = end.min(info.contig);
            if pos >= limit {
                if info.end != crate::term_log::UNBOUNDED && pos >= info.end {
                    // boundary: continue into the next term
                    continue;
                }
                let _ = from.send(&Command::QueryDataReplyMissing {
                    current_term,
                    start: pos,
                    end,
                });
                return;
            }
            let mut reader = log.open_reader(pos);
            let want = QUERY_DATA_CHUNK.min((limit - pos) as usize);
            let mut buf = vec![0u8; want];
            let n = match reader.try_read_any(&mut buf) {
                Ok(0) | Err(_) => {
                    let _ = from.send(&Command::QueryDataReplyMissing {
                        current_term,
                        start: pos,
                        end,
                    });
                    return;
                }
                Ok(n) => n,
            };
            buf.truncate(n);
            let frame = WriteFrame {
                prev_term: prev_for(&info, pos),
                term: info.term,
                position: pos,
                highest: info.highest,
                commit: info.commit,
                data: Bytes::from(buf),
            };
            if from
                .send(&Command::QueryDataReply {
                    current_term,
                    frame,
                })
                .is_err()
            {
                return;
            }
            pos += n as u64;
        }
    }

    /// Applies data received in response to a missing-data query.
    fn apply_query_data(&self, frame: &WriteFrame) -> Result<()> {
        match self
            .state_log
            .open_writer(frame.prev_term, frame.term, frame.position)?
        {
            Some(mut writer) => {
                writer.write(&frame.data, frame.highest)?;
                self.state_log.commit(frame.commit);
                let mut st = self.state.lock();
                st.missing_requests
                    .retain(|(from, to)| !(frame.position <= *from && *to <= writer.position()));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn handle_group_version(&self, from: &Arc<PeerChannel>, version: u64) {
        let ours = self.group.version();
        let _ = from.send(&Command::GroupVersionReply { version: ours });
        if version > ours {
            let _ = from.send(&Command::GroupFile { version: ours });
        }
    }

    fn handle_group_version_reply(&self, from: &Arc<PeerChannel>, version: u64) {
        let mut st = self.state.lock();
        let peer_id = from.peer_id();
        if let Some(peer) = st.peers.iter_mut().find(|p| p.member_id == peer_id) {
            peer.group_version = version;
        }
    }

    fn handle_group_file(&self, from: &Arc<PeerChannel>, version: u64) {
        let ours = self.group.version();
        let mut data = Vec::new();
        if ours > version {
            if let Err(e) = self.group.write_to(&mut data) {
                tracing::warn!(%e, "group serialization failed");
                data.clear();
            }
        }
        let _ = from.send(&Command::GroupFileReply {
            version: ours,
            data: Bytes::from(data),
        });
    }

    fn handle_group_file_reply(&self, version: u64, data: &[u8]) {
        if version <= self.group.version() || data.is_empty() {
            return;
        }
        match self.group.read_from(&mut &data[..]) {
            Ok(true) => {
                let mut st = self.state.lock();
                self.refresh_peers(&mut st);
                tracing::info!(version, "group membership updated from peer");
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(%e, "group file apply failed"),
        }
    }

    fn handle_update_role(
        &self,
        from: &Arc<PeerChannel>,
        group_version: u64,
        member_id: u64,
        role: u8,
    ) {
        let result = match MemberRole::from_u8(role) {
            Some(role) if group_version == self.group.version() => {
                match self.propose_update_role(member_id, role) {
                    Ok(_) => 0u8,
                    Err(_) => 1,
                }
            }
            _ => 1,
        };
        let _ = from.send(&Command::UpdateRoleReply {
            group_version: self.group.version(),
            result,
        });
    }

    fn handle_sync_commit(&self, from: &Arc<PeerChannel>, prev_term: u64, term: u64, position: u64) {
        let reply = match self.state_log.sync_commit(prev_term, term, position) {
            Ok(Some(durable)) => durable as i64,
            Ok(None) => -1,
            Err(e) => {
                tracing::warn!(%e, "sync commit failed");
                -1
            }
        };
        let _ = from.send(&Command::SyncCommitReply { position: reply });
    }

    fn handle_sync_commit_reply(&self, from: &Arc<PeerChannel>, position: i64) {
        if position < 0 {
            return;
        }
        let mut st = self.state.lock();
        let peer_id = from.peer_id();
        if let Some(peer) = st.peers.iter_mut().find(|p| p.member_id == peer_id) {
            peer.sync_match_position = peer.sync_match_position.max(position as u64);
        }
    }

    fn handle_leader_check(&self, from: &Arc<PeerChannel>) {
        let st = self.state.lock();
        let term = if st.role == Role::Leader {
            st.current_term as i64
        } else if st.election_validated >= 0 && st.leader_id.is_some() {
            st.validated_term as i64
        } else {
            -1
        };
        drop(st);
        let _ = from.send(&Command::LeaderCheckReply { term });
    }

    fn handle_leader_check_reply(&self, from: &Arc<PeerChannel>, term: i64) {
        let mut st = self.state.lock();
        let peer_id = from.peer_id();
        if let Some(peer) = st.peers.iter_mut().find(|p| p.member_id == peer_id) {
            peer.leader_check = term;
        }
    }

    fn election_tick(&self) {
        let mut st = self.state.lock();
        match st.role {
            Role::Leader => self.affirm_leadership(&mut st),
            Role::Candidate => {
                // election not resolved within a full tick: try again
                self.campaign(&mut st);
            }
            Role::Follower => {
                if st.election_validated >= 0 {
                    st.election_validated -= 1;
                    if st.election_validated >= 0 {
                        self.send_leader_checks(&st);
                        return;
                    }
                }
                if self.group.local_role() != MemberRole::Normal {
                    self.send_leader_checks(&st);
                    return;
                }
                let no_leader = st
                    .peers
                    .iter()
                    .filter(|p| p.is_consensus() && p.leader_check < 0)
                    .count()
                    + 1;
                let total = self.consensus_total(&st);
                if no_leader * 2 > total {
                    self.campaign(&mut st);
                } else {
                    self.send_leader_checks(&st);
                }
            }
        }
    }

    fn send_leader_checks(&self, st: &CtlState) {
        for peer in st.peers.iter().filter(|p| p.is_consensus()) {
            self.send_to(peer.member_id, peer.addr, &Command::LeaderCheck);
        }
    }

    /// Leader heartbeat: an empty write refreshes followers and carries
    /// the commit position. A leader whose commit cannot catch its
    /// highest for the whole validation budget steps down.
    fn affirm_leadership(&self, st: &mut CtlState) {
        let info = self.state_log.capture_highest();
        if info.commit < info.highest {
            st.leadership_strikes += 1;
            if st.leadership_strikes > self.config.election_validation_budget {
                tracing::warn!(
                    term = st.current_term,
                    commit = info.commit,
                    highest = info.highest,
                    "commit stalled, abandoning leadership"
                );
                let term = st.current_term;
                self.become_follower(st, term);
                return;
            }
        } else {
            st.leadership_strikes = 0;
        }
        if let Err(e) = self.write_locked(st, Bytes::new()) {
            tracing::warn!(%e, "heartbeat failed");
        }
    }

    /// One missing-data tick: query a random consensus peer for each
    /// missing range, falling back through the others.
    fn missing_data_tick(&self) {
        let (ranges, targets) = {
            let mut st = self.state.lock();
            if st.role != Role::Follower {
                st.missing_requests.clear();
                return;
            }
            st.missing_requests.clear();
            let ranges = self.state_log.missing_ranges(MISSING_RANGES_PER_TICK);
            if ranges.is_empty() {
                return;
            }
            let mut targets: Vec<(u64, SocketAddr)> = st
                .peers
                .iter()
                .filter(|p| p.is_consensus())
                .map(|p| (p.member_id, p.addr))
                .collect();
            targets.shuffle(&mut rand::thread_rng());
            for range in &ranges {
                st.missing_requests.insert(*range);
            }
            (ranges, targets)
        };
        if targets.is_empty() {
            return;
        }
        for (start, end) in ranges {
            let cmd = Command::QueryData { start, end };
            let mut sent = false;
            for (id, addr) in &targets {
                let ch = self.manager.connect(*id, *addr);
                if ch.send(&cmd).is_ok() {
                    sent = true;
                    break;
                }
            }
            if !sent {
                tracing::debug!(start, end, "no peer reachable for missing data");
            }
        }
    }

    /// One sync tick: pushes durability forward, and on the leader,
    /// drives remote syncs and compaction.
    fn sync_tick(&self) {
        let info = self.state_log.capture_highest();
        let appliable = info.appliable();
        if self.state_log.durable_position() < appliable {
            if let Err(e) = self
                .state_log
                .sync()
                .and_then(|_| self.state_log.commit_durable(appliable).map(|_| ()))
            {
                tracing::warn!(%e, "durable sync failed");
                self.report_background_error(&e);
                return;
            }
        }

        let mut st = self.state.lock();
        let version_probe = Command::GroupVersion {
            version: self.group.version(),
        };
        for peer in &st.peers {
            self.send_to(peer.member_id, peer.addr, &version_probe);
        }
        if st.role != Role::Leader {
            return;
        }
        let cmd = Command::SyncCommit {
            prev_term: prev_for(&info, appliable),
            term: info.term,
            position: appliable,
        };
        let mut compact_to = self.state_log.durable_position();
        for peer in &st.peers {
            self.send_to(peer.member_id, peer.addr, &cmd);
            if peer.is_consensus() {
                compact_to = compact_to.min(peer.sync_match_position);
            }
        }
        if compact_to > 0 {
            // compaction requests are monotone: only peers behind the
            // delivered point get another one
            let compact = Command::Compact {
                position: compact_to,
            };
            for peer in st.peers.iter_mut() {
                if peer.compact_position < compact_to
                    && self.send_to(peer.member_id, peer.addr, &compact)
                {
                    peer.compact_position = compact_to;
                }
            }
            drop(st);
            if let Err(e) = self.state_log.compact(compact_to) {
                tracing::warn!(%e, "compaction failed");
            }
        }
    }
}

/// Decrements the snapshot session count on drop.
pub struct SnapshotSession {
    controller: Arc<Controller>,
}

impl Drop for SnapshotSession {
    fn drop(&mut self) {
        self.controller
            .snapshot_sessions
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Term of the byte just below `position` within `info`'s term.
fn prev_for(info: &LogInfo, position: u64) -> u64 {
    if position == info.start {
        info.prev_term
    } else {
        info.term
    }
}

impl Controller {
    fn report_background_error(&self, e: &Error) {
        if let Some(hook) = &self.config.on_background_error {
            hook(e);
        }
    }

    async fn dispatch(&self, from: &Arc<PeerChannel>, cmd: Command) -> Result<()> {
        match cmd {
            Command::Nop => {}
            Command::RequestVote {
                term,
                candidate_id,
                highest_term,
                highest_position,
            } => self.handle_request_vote(from, term, candidate_id, highest_term, highest_position),
            Command::RequestVoteReply { term } => self.handle_vote_reply(term),
            Command::ForceElection => self.force_election(),
            Command::QueryTerms { start, end } => {
                let terms = self.state_log.term_ranges(start, end);
                let _ = from.send(&Command::QueryTermsReply { terms });
            }
            Command::QueryTermsReply { terms } => {
                for (prev_term, term, start) in terms {
                    if let Err(e) = self.state_log.define_term(prev_term, term, start) {
                        tracing::debug!(%e, term, "term import failed");
                    }
                }
            }
            Command::QueryData { start, end } => self.serve_query_data(from, start, end),
            Command::QueryDataReply { frame, .. } => self.apply_query_data(&frame)?,
            Command::QueryDataReplyMissing { start, end, .. } => {
                let mut st = self.state.lock();
                st.missing_requests.remove(&(start, end));
            }
            Command::WriteData(frame) => self.apply_write(from, &frame, false, true)?,
            Command::WriteAndProxy(frame) => self.apply_write(from, &frame, true, true)?,
            Command::WriteViaProxy(frame) => self.apply_write(from, &frame, false, false)?,
            Command::WriteDataReply { term, highest } => {
                self.handle_write_reply(from, term, highest)
            }
            Command::SyncCommit {
                prev_term,
                term,
                position,
            } => self.handle_sync_commit(from, prev_term, term, position),
            Command::SyncCommitReply { position } => self.handle_sync_commit_reply(from, position),
            Command::Compact { position } => {
                self.state_log.compact(position)?;
            }
            Command::SnapshotScore => {
                let weight = if self.role() == Role::Leader { 1.0 } else { -1.0 };
                let _ = from.send(&Command::SnapshotScoreReply {
                    active_sessions: self.snapshot_sessions.load(Ordering::Acquire),
                    weight,
                });
            }
            Command::SnapshotScoreReply {
                active_sessions,
                weight,
            } => {
                let mut st = self.state.lock();
                let peer_id = from.peer_id();
                if let Some(peer) = st.peers.iter_mut().find(|p| p.member_id == peer_id) {
                    peer.snapshot_score = Some((active_sessions, weight));
                }
            }
            Command::UpdateRole {
                group_version,
                member_id,
                role,
            } => self.handle_update_role(from, group_version, member_id, role),
            Command::UpdateRoleReply { .. } => {}
            Command::GroupVersion { version } => self.handle_group_version(from, version),
            Command::GroupVersionReply { version } => {
                self.handle_group_version_reply(from, version)
            }
            Command::GroupFile { version } => self.handle_group_file(from, version),
            Command::GroupFileReply { version, data } => {
                self.handle_group_file_reply(version, &data)
            }
            Command::LeaderCheck => self.handle_leader_check(from),
            Command::LeaderCheckReply { term } => self.handle_leader_check_reply(from, term),
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelHandler for Controller {
    async fn on_command(&self, from: &Arc<PeerChannel>, cmd: Command) -> Result<()> {
        if let Err(e) = self.dispatch(from, cmd).await {
            if !e.is_transient() {
                tracing::warn!(%e, "command handling failed");
            }
            self.report_background_error(&e);
        }
        Ok(())
    }
}

async fn election_loop(controller: Arc<Controller>) {
    let mut shutdown = controller.shutdown.subscribe();
    loop {
        let delay = rand_range(&controller.config.election_tick);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => controller.election_tick(),
        }
    }
}

async fn missing_data_loop(controller: Arc<Controller>) {
    let mut shutdown = controller.shutdown.subscribe();
    loop {
        let delay = rand_range(&controller.config.missing_data_tick);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => controller.missing_data_tick(),
        }
    }
}

async fn sync_loop(controller: Arc<Controller>) {
    let mut shutdown = controller.shutdown.subscribe();
    loop {
        let delay = rand_range(&controller.config.sync_tick);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => controller.sync_tick(),
        }
    }
}

fn rand_range(range: &std::ops::Range<u64>) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(range.clone()))
}
