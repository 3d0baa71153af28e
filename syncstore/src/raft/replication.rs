//! Leader side: taking leadership, replication rounds, commit and proposals.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::metadata::FileMetadata;
use crate::raft::entry::{
    more_up_to_date, AppendEntriesRequest, ClaimReply, ClaimRequest, FetchRequest, LogEntry,
};
use crate::raft::node::{unavailable, RaftNode, RaftState};
use crate::raft_service::RaftService;

// Slack on top of the log length for a single peer's catch-up loop.
const SYNC_RETRY_SLACK: usize = 8;

/// How long a replication round waits for peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Round {
    /// Until a majority acknowledged.
    Majority,
    /// Until every peer answered or timed out.
    Full,
}

enum PeerOutcome {
    Matched,
    Unreachable,
    Stopped,
}

impl RaftState {
    fn append_request(&self, peer_id: u64, leader_id: u64) -> AppendEntriesRequest {
        let last = self.last_log_index();
        let next = self
            .next_index
            .get(&peer_id)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev = next - 1;
        AppendEntriesRequest {
            term: self.term(),
            leader_id,
            prev_log_index: prev,
            prev_log_term: self.term_at(prev).unwrap_or(0),
            entries: self.log[prev as usize..].to_vec(),
            leader_commit: self.commit_index,
            last_log_index: last,
            last_log_term: self.last_log_term(),
        }
    }

    fn record_match(&mut self, peer_id: u64, matched: u64) {
        let entry = self.match_index.entry(peer_id).or_insert(0);
        *entry = (*entry).max(matched);
        let matched = *entry;
        self.next_index.insert(peer_id, matched + 1);
    }

    fn back_off(&mut self, peer_id: u64, conflict_index: u64) {
        let last = self.last_log_index();
        let next = self.next_index.entry(peer_id).or_insert(last + 1);
        *next = next.saturating_sub(1).min(conflict_index).max(1);
    }

    /// Commits the highest current-term index stored on a strict majority.
    fn advance_commit(&mut self, cluster_size: usize) -> bool {
        let term = self.term();
        for index in (self.commit_index + 1..=self.last_log_index()).rev() {
            if self.log[index as usize - 1].term != term {
                break;
            }
            let replicas = 1 + self.match_index.values().filter(|m| **m >= index).count();
            if replicas * 2 > cluster_size {
                self.commit_index = index;
                return true;
            }
        }
        false
    }

    fn leads(&self, term: u64) -> bool {
        self.is_leader && !self.crashed && self.term() == term
    }
}

impl RaftNode {
    fn peer(&self, peer_id: u64) -> Option<Arc<dyn RaftService>> {
        self.inner
            .peers
            .iter()
            .find(|(id, _)| *id == peer_id)
            .map(|(_, peer)| peer.clone())
    }

    /// Makes this node leader of a fresh term, unconditionally
    ///
    /// This method:
    /// 1. Bumps the term and takes leadership
    /// 2. Claims the term at every peer, which demotes any previous leader
    ///    reached; a contested term is retried one above the highest seen
    /// 3. Adopts the log of the most up-to-date peer when it is ahead, so
    ///    committed entries survive the hand-over
    ///
    /// # Returns
    ///
    /// `Unavailable` when this node is crashed
    pub async fn assign_leader(&self) -> Result<()> {
        let id = self.id();
        let mut term = {
            let mut state = self.inner.state.lock().await;
            if state.crashed {
                return Err(unavailable(id));
            }
            let term = state.term() + 1;
            state.become_leader(term, id, &self.inner.peers)?;
            term
        };
        log::info!("node {} assigned leader for term {}", id, term);

        let mut best: Option<(u64, (u64, u64))> = None;
        for _ in 0..=self.inner.peers.len() {
            let mut contested: Option<u64> = None;
            for (peer_id, reply) in self.canvass(term).await {
                match reply {
                    Ok(reply) => {
                        let position = (reply.last_log_term, reply.last_log_index);
                        if best.map_or(true, |(_, b)| more_up_to_date(position, b)) {
                            best = Some((peer_id, position));
                        }
                    }
                    Err(Error::StaleTerm { term: seen }) if seen >= term => {
                        contested = Some(contested.map_or(seen, |c| c.max(seen)));
                    }
                    Err(e) => log::debug!("node {} claim to node {} failed: {}", id, peer_id, e),
                }
            }
            let Some(seen) = contested else { break };
            term = seen + 1;
            let mut state = self.inner.state.lock().await;
            if state.crashed {
                return Err(unavailable(id));
            }
            state.become_leader(term, id, &self.inner.peers)?;
            log::info!("node {} retakes leadership in term {}", id, term);
            best = None;
        }

        if let Some((peer_id, position)) = best {
            let ours = self.inner.state.lock().await.position();
            if more_up_to_date(position, ours) {
                if let Some(peer) = self.peer(peer_id) {
                    if let Err(e) = self.adopt_log_from(term, peer_id, &peer).await {
                        log::warn!("node {} cannot adopt log of node {}: {}", id, peer_id, e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn canvass(&self, term: u64) -> Vec<(u64, Result<ClaimReply>)> {
        let req = ClaimRequest {
            term,
            candidate_id: self.id(),
        };
        let rpc_timeout = self.inner.config.rpc_timeout;
        let mut tasks = JoinSet::new();
        for (peer_id, peer) in &self.inner.peers {
            let peer = peer.clone();
            let peer_id = *peer_id;
            tasks.spawn(async move {
                let reply = timeout(rpc_timeout, peer.claim_leadership(req))
                    .await
                    .map_err(Error::from)
                    .and_then(|r| r);
                (peer_id, reply)
            });
        }
        let mut replies = Vec::with_capacity(self.inner.peers.len());
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(reply) => replies.push(reply),
                Err(e) => log::error!("claim task failed: {}", e),
            }
        }
        replies
    }

    /// Replaces the uncommitted suffix of the local log with `peer_id`'s when the
    /// peer's log is more up-to-date. Only done before this term has entries.
    async fn adopt_log_from(
        &self,
        term: u64,
        peer_id: u64,
        peer: &Arc<dyn RaftService>,
    ) -> Result<()> {
        let id = self.id();
        let (commit, commit_term) = {
            let state = self.inner.state.lock().await;
            if !state.leads(term) {
                return Err(Error::NotLeader);
            }
            (state.commit_index, state.term_at(state.commit_index).unwrap_or(0))
        };
        let req = FetchRequest {
            term,
            from_index: commit.max(1),
        };
        let mut entries = timeout(self.inner.config.rpc_timeout, peer.fetch_entries(req)).await??;
        if commit > 0 {
            // first entry overlaps our last committed one
            if entries.first().map_or(true, |e| e.term != commit_term) {
                return Err(Error::StaleLog {
                    term,
                    last_log_index: commit,
                    last_log_term: commit_term,
                });
            }
            entries.remove(0);
        }

        let mut state = self.inner.state.lock().await;
        if !state.leads(term) {
            return Err(Error::NotLeader);
        }
        if state.commit_index != commit || entries.is_empty() {
            return Ok(());
        }
        let theirs = (
            entries.last().map_or(commit_term, |e| e.term),
            commit + entries.len() as u64,
        );
        if !more_up_to_date(theirs, state.position()) {
            return Ok(());
        }
        log::info!(
            "node {} adopts {} entries after index {} from node {}",
            id,
            entries.len(),
            commit,
            peer_id
        );
        state.truncate_local(commit + 1)?;
        state.append_local(entries)?;
        let next = state.last_log_index() + 1;
        for matched in state.match_index.values_mut() {
            *matched = (*matched).min(commit);
        }
        for n in state.next_index.values_mut() {
            *n = next;
        }
        Ok(())
    }

    /// One round of AppendEntries to every peer
    ///
    /// The commit index moves as soon as a majority holds the log, so a slow
    /// peer never holds back a commit.
    ///
    /// # Arguments
    ///
    /// * `round` - Whether to wait for every peer or return once a majority
    ///   acknowledged; peers still in flight then finish in the background
    ///
    /// # Returns
    ///
    /// How many nodes, this one included, were seen holding the leader's log
    pub(crate) async fn replicate(&self, round: Round) -> Result<usize> {
        let id = self.id();
        let term = {
            let state = self.inner.state.lock().await;
            if state.crashed {
                return Err(unavailable(id));
            }
            if !state.is_leader {
                return Err(Error::NotLeader);
            }
            state.term()
        };

        let mut tasks = JoinSet::new();
        for (peer_id, peer) in &self.inner.peers {
            let node = self.clone();
            let peer = peer.clone();
            let peer_id = *peer_id;
            tasks.spawn(async move { node.sync_peer(term, peer_id, peer).await });
        }
        let mut acks = 1;
        let mut committed = false;
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(PeerOutcome::Matched) => acks += 1,
                Ok(_) => {}
                Err(e) => log::error!("replication task failed: {}", e),
            }
            if !committed && self.is_majority(acks) {
                self.commit_round(term).await?;
                committed = true;
                if round == Round::Majority {
                    tasks.detach_all();
                    break;
                }
            }
        }
        if round == Round::Full || !committed {
            self.commit_round(term).await?;
        }
        Ok(acks)
    }

    // Advances and applies the commit index from the matches seen so far.
    async fn commit_round(&self, term: u64) -> Result<()> {
        let id = self.id();
        let mut state = self.inner.state.lock().await;
        if !state.leads(term) {
            return Err(Error::NotLeader);
        }
        if state.advance_commit(self.cluster_size()) {
            log::debug!("node {} commit index now {}", id, state.commit_index);
            state.apply_committed(id);
        }
        Ok(())
    }

    async fn sync_peer(
        &self,
        term: u64,
        peer_id: u64,
        peer: Arc<dyn RaftService>,
    ) -> PeerOutcome {
        let id = self.id();
        let mut budget = self.inner.state.lock().await.log.len() + SYNC_RETRY_SLACK;
        while budget > 0 {
            budget -= 1;
            let req = {
                let state = self.inner.state.lock().await;
                if !state.leads(term) {
                    return PeerOutcome::Stopped;
                }
                state.append_request(peer_id, id)
            };
            let reply = timeout(self.inner.config.rpc_timeout, peer.append_entries(req))
                .await
                .map_err(Error::from)
                .and_then(|r| r);
            match reply {
                Ok(reply) => {
                    let mut state = self.inner.state.lock().await;
                    if !state.leads(term) {
                        return PeerOutcome::Stopped;
                    }
                    state.record_match(peer_id, reply.match_index);
                    return PeerOutcome::Matched;
                }
                Err(Error::StaleTerm { term: seen }) => {
                    let mut state = self.inner.state.lock().await;
                    if let Err(e) = state.observe_term(seen, id) {
                        log::error!("node {} cannot persist term {}: {}", id, seen, e);
                    }
                    return PeerOutcome::Stopped;
                }
                Err(Error::LogMismatch { conflict_index, .. }) => {
                    let mut state = self.inner.state.lock().await;
                    state.back_off(peer_id, conflict_index);
                }
                Err(Error::StaleLog { .. }) => {
                    if let Err(e) = self.adopt_log_from(term, peer_id, &peer).await {
                        log::warn!("node {} cannot adopt log of node {}: {}", id, peer_id, e);
                        return PeerOutcome::Unreachable;
                    }
                }
                Err(e) => {
                    log::debug!("node {} cannot reach node {}: {}", id, peer_id, e);
                    return PeerOutcome::Unreachable;
                }
            }
        }
        log::warn!("node {} gave up catching up node {}", id, peer_id);
        PeerOutcome::Unreachable
    }

    /// Replication round on demand; a no-op on followers.
    pub async fn heartbeat(&self) -> Result<()> {
        {
            let state = self.inner.state.lock().await;
            if state.crashed {
                return Err(unavailable(self.id()));
            }
            if !state.is_leader {
                return Ok(());
            }
        }
        match self.replicate(Round::Full).await {
            Ok(acks) => {
                log::debug!(
                    "node {} heartbeat reached {} of {} nodes",
                    self.id(),
                    acks,
                    self.cluster_size()
                );
                Ok(())
            }
            Err(Error::NotLeader) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Proposes a new version of a file and waits for it to commit
    ///
    /// Nothing is appended unless a majority is reachable first. A proposal
    /// that does not follow the newest committed version of the file gets a
    /// `VersionConflict` carrying that committed record; one that only clashes
    /// with an uncommitted entry gets `Unavailable` and may be retried.
    ///
    /// # Arguments
    ///
    /// * `meta` - The new record; `version` must be the stored version plus one
    ///
    /// # Returns
    ///
    /// The committed version, or `NotLeader`, `MissingBlock`, `Unavailable` or
    /// `VersionConflict`
    pub async fn update_file(&self, meta: FileMetadata) -> Result<u64> {
        let id = self.id();
        {
            let state = self.inner.state.lock().await;
            if state.crashed {
                return Err(unavailable(id));
            }
            if !state.is_leader {
                return Err(Error::NotLeader);
            }
        }

        if !meta.tombstone {
            if let Some(blocks) = &self.inner.blocks {
                let present = blocks.has_blocks(&meta.block_hash_list).await?;
                if let Some(missing) = meta
                    .block_hash_list
                    .iter()
                    .find(|h| !present.contains(h))
                {
                    return Err(Error::MissingBlock(missing.clone()));
                }
            }
        }

        let acks = self.replicate(Round::Majority).await?;
        if !self.is_majority(acks) {
            return Err(Error::Unavailable(format!(
                "only {} of {} nodes reachable",
                acks,
                self.cluster_size()
            )));
        }

        let (term, index) = {
            let mut state = self.inner.state.lock().await;
            if state.crashed {
                return Err(unavailable(id));
            }
            if !state.is_leader {
                return Err(Error::NotLeader);
            }
            let stored = state.stored(&meta.filename);
            let projected = state.projected(&meta.filename);
            if meta.version != projected.version + 1 {
                // only committed records are handed out as authoritative
                if meta.version > stored.version && projected != stored {
                    return Err(Error::Unavailable(format!(
                        "an earlier update of {} is not committed yet",
                        meta.filename
                    )));
                }
                return Err(Error::VersionConflict(Box::new(stored)));
            }
            let term = state.term();
            state.append_local(vec![LogEntry::new(term, meta.clone())])?;
            let index = state.last_log_index();
            state.pending.insert(index, None);
            (term, index)
        };
        log::debug!(
            "node {} appended {} v{} at index {}",
            id,
            meta.filename,
            meta.version,
            index
        );

        let replicated = self.replicate(Round::Majority).await;
        let mut state = self.inner.state.lock().await;
        let outcome = state.pending.remove(&index).flatten();
        let ours = state
            .log
            .get(index as usize - 1)
            .map_or(false, |e| e.term == term && e.command == meta);
        if !ours {
            return Err(Error::NotLeader);
        }
        match outcome {
            Some(Ok(())) => Ok(meta.version),
            Some(Err(current)) => Err(Error::VersionConflict(Box::new(current))),
            None => {
                let acks = replicated?;
                Err(Error::Unavailable(format!(
                    "entry {} not committed, {} of {} nodes acknowledged",
                    index,
                    acks,
                    self.cluster_size()
                )))
            }
        }
    }
}
