//! Replicated log keeping the file index consistent across metadata servers.
//!
//! Leadership and replication rounds are driven explicitly (`assign_leader`,
//! `heartbeat`) rather than by election timers; the log-matching, majority-commit
//! and apply rules are the usual Raft ones.

pub mod entry;
pub mod node;
mod replication;
mod segment;
pub mod storage;

pub use entry::{
    AppendEntriesReply, AppendEntriesRequest, ClaimReply, ClaimRequest, FetchRequest,
    InternalState, LogEntry,
};
pub use node::{PeerSet, RaftConfig, RaftNode};
pub use storage::{FileStorage, HardState, LogStorage, MemStorage};
