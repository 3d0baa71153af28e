use serde_derive::{Deserialize, Serialize};

use crate::metadata::{FileInfoMap, FileMetadata};

/// One replicated metadata mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: FileMetadata,
}

impl LogEntry {
    pub fn new(term: u64, command: FileMetadata) -> Self {
        LogEntry { term, command }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    // Position of the leader's last entry, so a follower holding a more
    // up-to-date log can refuse to be overwritten.
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub match_index: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub term: u64,
    pub candidate_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReply {
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FetchRequest {
    pub term: u64,
    pub from_index: u64,
}

/// Read-only view of a node, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalState {
    pub term: u64,
    pub is_leader: bool,
    pub log: Vec<LogEntry>,
    pub commit_index: u64,
    pub crashed: bool,
    pub meta_map: FileInfoMap,
}

/// Raft's "at least as up-to-date" order on (last term, last index).
pub fn more_up_to_date(a: (u64, u64), b: (u64, u64)) -> bool {
    let (a_term, a_index) = a;
    let (b_term, b_index) = b;
    a_term > b_term || (a_term == b_term && a_index > b_index)
}
