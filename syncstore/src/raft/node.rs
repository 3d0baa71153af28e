//! Raft node implementation
//! This module holds a node's state and the follower side of every server-to-server
//! RPC. The leader side lives in `replication.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::block::BlockStore;
use crate::error::{Error, Result};
use crate::metadata::{FileInfoMap, FileMetadata, InMemoryMetaStore, MetaStore};
use crate::raft::entry::{
    more_up_to_date, AppendEntriesReply, AppendEntriesRequest, ClaimReply, ClaimRequest,
    FetchRequest, InternalState, LogEntry,
};
use crate::raft::storage::{HardState, LogStorage};
use crate::raft_service::RaftService;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(500);

/// Peers of a node, keyed by node id.
pub type PeerSet = Vec<(u64, Arc<dyn RaftService>)>;

#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    /// Upper bound on any single outbound RPC.
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

pub(crate) struct RaftState {
    pub(crate) hard_state: HardState,
    pub(crate) is_leader: bool,
    pub(crate) log: Vec<LogEntry>,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) crashed: bool,
    // Leader bookkeeping, reset whenever leadership is (re)taken.
    pub(crate) next_index: HashMap<u64, u64>,
    pub(crate) match_index: HashMap<u64, u64>,
    // Apply outcomes awaited by in-flight proposals, by log index.
    pub(crate) pending: HashMap<u64, Option<std::result::Result<(), FileMetadata>>>,
    pub(crate) store: Box<dyn MetaStore>,
    pub(crate) storage: Box<dyn LogStorage>,
}

impl RaftState {
    pub(crate) fn term(&self) -> u64 {
        self.hard_state.term
    }

    pub(crate) fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    pub(crate) fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    /// (last term, last index), the key Raft orders logs by.
    pub(crate) fn position(&self) -> (u64, u64) {
        (self.last_log_term(), self.last_log_index())
    }

    pub(crate) fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|e| e.term)
    }

    /// Adopts a newer term seen on the wire, stepping down if leading.
    pub(crate) fn observe_term(&mut self, term: u64, id: u64) -> Result<()> {
        if term <= self.term() {
            return Ok(());
        }
        if self.is_leader {
            log::info!("node {} steps down: term {} -> {}", id, self.term(), term);
        }
        self.is_leader = false;
        self.pending.clear();
        self.hard_state = HardState {
            term,
            voted_for: None,
        };
        self.storage.save_hard_state(self.hard_state)
    }

    pub(crate) fn become_leader(&mut self, term: u64, id: u64, peers: &PeerSet) -> Result<()> {
        self.hard_state = HardState {
            term,
            voted_for: Some(id),
        };
        self.storage.save_hard_state(self.hard_state)?;
        self.is_leader = true;
        self.pending.clear();
        self.next_index.clear();
        self.match_index.clear();
        let next = self.last_log_index() + 1;
        for (peer_id, _) in peers {
            self.next_index.insert(*peer_id, next);
            self.match_index.insert(*peer_id, 0);
        }
        Ok(())
    }

    pub(crate) fn append_local(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.storage.append(&entries)?;
        self.log.extend(entries);
        Ok(())
    }

    /// Drops the uncommitted suffix starting at `from`.
    pub(crate) fn truncate_local(&mut self, from: u64) -> Result<()> {
        debug_assert!(from > self.commit_index, "committed entries are immutable");
        if from > self.last_log_index() {
            return Ok(());
        }
        self.storage.truncate_from(from)?;
        self.log.truncate(from as usize - 1);
        self.pending.retain(|index, _| *index < from);
        Ok(())
    }

    pub(crate) fn apply_committed(&mut self, id: u64) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let index = self.last_applied;
            let command = self.log[index as usize - 1].command.clone();
            let outcome = self.store.compare_and_set(command.clone());
            match &outcome {
                Ok(()) => log::debug!(
                    "node {} applied {} v{} at index {}",
                    id,
                    command.filename,
                    command.version,
                    index
                ),
                Err(current) => log::warn!(
                    "node {} rejected {} v{} at index {}: stored version is {}",
                    id,
                    command.filename,
                    command.version,
                    index,
                    current.version
                ),
            }
            if let Some(slot) = self.pending.get_mut(&index) {
                *slot = Some(outcome);
            }
        }
    }

    /// The applied record of `filename`, a version-0 tombstone when absent.
    pub(crate) fn stored(&self, filename: &str) -> FileMetadata {
        self.store
            .get(filename)
            .unwrap_or_else(|| FileMetadata::absent(filename))
    }

    /// The record a new mutation of `filename` must follow: the last uncommitted
    /// entry for it if any, else the applied one.
    pub(crate) fn projected(&self, filename: &str) -> FileMetadata {
        self.log[self.last_applied as usize..]
            .iter()
            .rev()
            .find(|e| e.command.filename == filename)
            .map(|e| e.command.clone())
            .unwrap_or_else(|| self.stored(filename))
    }
}

/// A single consensus replica. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct RaftNode {
    pub(crate) inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) id: u64,
    pub(crate) peers: PeerSet,
    pub(crate) config: RaftConfig,
    pub(crate) blocks: Option<Arc<dyn BlockStore>>,
    pub(crate) state: Mutex<RaftState>,
}

pub(crate) fn unavailable(id: u64) -> Error {
    Error::Unavailable(format!("node {} is crashed", id))
}

impl RaftNode {
    /// Creates a node, restoring term, vote and log from `storage`
    ///
    /// The metadata store starts empty and is rebuilt as entries are committed
    /// again.
    ///
    /// # Arguments
    ///
    /// * `id` - This node's id
    /// * `peers` - Every other node of the cluster
    /// * `storage` - Durable term, vote and log
    /// * `blocks` - Store that proposals are checked against, if any
    /// * `config` - Timeouts
    pub fn new(
        id: u64,
        peers: PeerSet,
        mut storage: Box<dyn LogStorage>,
        blocks: Option<Arc<dyn BlockStore>>,
        config: RaftConfig,
    ) -> Result<Self> {
        let (hard_state, log) = storage.load()?;
        let state = RaftState {
            hard_state,
            is_leader: false,
            log,
            commit_index: 0,
            last_applied: 0,
            crashed: false,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending: HashMap::new(),
            store: Box::new(InMemoryMetaStore::new()),
            storage,
        };
        Ok(RaftNode {
            inner: Arc::new(NodeInner {
                id,
                peers,
                config,
                blocks,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cluster_size(&self) -> usize {
        self.inner.peers.len() + 1
    }

    pub(crate) fn is_majority(&self, count: usize) -> bool {
        count * 2 > self.cluster_size()
    }

    /// Answered even while crashed.
    pub async fn internal_state(&self) -> InternalState {
        let state = self.inner.state.lock().await;
        InternalState {
            term: state.term(),
            is_leader: state.is_leader,
            log: state.log.clone(),
            commit_index: state.commit_index,
            crashed: state.crashed,
            meta_map: state.store.snapshot(),
        }
    }

    pub async fn crash(&self) {
        self.inner.state.lock().await.crashed = true;
        log::info!("node {} crashed", self.id());
    }

    pub async fn restore(&self) {
        self.inner.state.lock().await.crashed = false;
        log::info!("node {} restored", self.id());
    }

    pub async fn is_leader(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.is_leader && !state.crashed
    }

    /// Committed file index; only the leader answers.
    pub async fn get_file_info_map(&self) -> Result<FileInfoMap> {
        let state = self.inner.state.lock().await;
        if state.crashed {
            return Err(unavailable(self.id()));
        }
        if !state.is_leader {
            return Err(Error::NotLeader);
        }
        Ok(state.store.snapshot())
    }

    /// Follower side of replication
    ///
    /// This method:
    /// 1. Refuses a stale term and adopts a newer one, stepping down if leading
    /// 2. Refuses to be overwritten by a leader whose log is behind its own
    /// 3. Checks the entry at `prev_log_index`, then overwrites any conflicting
    ///    uncommitted suffix with the leader's entries
    /// 4. Commits up to `min(leader_commit, last new index)` and applies in order
    ///
    /// # Returns
    ///
    /// The index up to which this log now matches the leader's, or
    /// `StaleTerm`, `StaleLog` or `LogMismatch`
    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        let id = self.id();
        let mut state = self.inner.state.lock().await;
        if state.crashed {
            return Err(unavailable(id));
        }
        if req.term < state.term() {
            return Err(Error::StaleTerm { term: state.term() });
        }
        state.observe_term(req.term, id)?;
        if state.is_leader {
            log::warn!(
                "node {} saw leader {} in its own term {}, stepping down",
                id,
                req.leader_id,
                req.term
            );
            state.is_leader = false;
            state.pending.clear();
        }
        let term = state.term();

        if more_up_to_date(state.position(), (req.last_log_term, req.last_log_index)) {
            return Err(Error::StaleLog {
                term,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            });
        }

        match state.term_at(req.prev_log_index) {
            None => {
                return Err(Error::LogMismatch {
                    term,
                    conflict_index: state.last_log_index() + 1,
                })
            }
            Some(t) if t != req.prev_log_term => {
                return Err(Error::LogMismatch {
                    term,
                    conflict_index: req.prev_log_index,
                })
            }
            Some(_) => {}
        }

        let prev = req.prev_log_index;
        let last_new = prev + req.entries.len() as u64;
        let mut fresh = Vec::new();
        for (offset, entry) in req.entries.into_iter().enumerate() {
            let index = prev + 1 + offset as u64;
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            match state.term_at(index) {
                Some(t) if t == entry.term => {}
                Some(_) => {
                    if index <= state.commit_index {
                        log::error!(
                            "node {} refusing to overwrite committed entry {}",
                            id,
                            index
                        );
                        return Err(Error::StaleLog {
                            term,
                            last_log_index: state.last_log_index(),
                            last_log_term: state.last_log_term(),
                        });
                    }
                    log::debug!("node {} truncating log from index {}", id, index);
                    state.truncate_local(index)?;
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }
        state.append_local(fresh)?;

        if req.leader_commit > state.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > state.commit_index {
                state.commit_index = commit;
                state.apply_committed(id);
            }
        }

        Ok(AppendEntriesReply {
            term,
            match_index: last_new,
        })
    }

    /// Acknowledges a new leader. At most one claimant is followed per term.
    pub async fn claim_leadership(&self, req: ClaimRequest) -> Result<ClaimReply> {
        let id = self.id();
        let mut state = self.inner.state.lock().await;
        if state.crashed {
            return Err(unavailable(id));
        }
        if req.term < state.term() {
            return Err(Error::StaleTerm { term: state.term() });
        }
        state.observe_term(req.term, id)?;
        match state.hard_state.voted_for {
            // one claimant per term
            Some(other) if other != req.candidate_id => {
                return Err(Error::StaleTerm { term: state.term() });
            }
            _ => {}
        }
        state.hard_state.voted_for = Some(req.candidate_id);
        let hs = state.hard_state;
        state.storage.save_hard_state(hs)?;
        state.is_leader = false;
        log::debug!(
            "node {} follows node {} in term {}",
            id,
            req.candidate_id,
            req.term
        );
        Ok(ClaimReply {
            term: state.term(),
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        })
    }

    /// Entries from `from_index` on, for a new leader adopting this log.
    pub async fn fetch_entries(&self, req: FetchRequest) -> Result<Vec<LogEntry>> {
        let id = self.id();
        let mut state = self.inner.state.lock().await;
        if state.crashed {
            return Err(unavailable(id));
        }
        if req.term < state.term() {
            return Err(Error::StaleTerm { term: state.term() });
        }
        state.observe_term(req.term, id)?;
        let from = req.from_index.max(1) as usize - 1;
        Ok(state.log.get(from..).map(<[LogEntry]>::to_vec).unwrap_or_default())
    }
}
