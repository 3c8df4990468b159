use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cluster::meta::{ClusterMetaEntry, ClusterMetaType};

/// Consensus role of a member node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Commands replicated through the consensus log. The store only carries
/// membership and process metadata; notebook content never goes through
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetaCommand {
    /// Write one metadata entry. With `if_absent` the apply is a no-op
    /// when the key already exists (used for process registration races).
    PutMeta {
        entry: ClusterMetaEntry,
        if_absent: bool,
    },
    /// Drop one metadata entry (deregistration or heartbeat eviction)
    RemoveMeta {
        meta_type: ClusterMetaType,
        key: String,
    },
    /// No-op command (used for leader commit)
    Noop,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: MetaCommand,
}

/// Per-node consensus state.
///
/// # Safety invariants
///
/// - Election safety: one vote per node per term (`voted_for`); a
///   candidate needs a majority to become leader.
/// - Leader append-only: leaders only `append_entry()`; truncation only
///   happens on followers resolving replication conflicts.
/// - Log matching: the `AppendEntries` consistency check
///   (prev_log_index/prev_log_term) truncates conflicting suffixes before
///   appending.
/// - Leader completeness: candidates must present an up-to-date log
///   (`is_log_up_to_date`), and leaders only commit entries from their
///   own term.
/// - State machine safety: entries are applied in index order once
///   committed (`last_applied <= commit_index`), so every member's
///   MetaStore sees the same sequence of writes — this is what makes the
///   per-key version numbers monotonic cluster-wide.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,

    // Votes received in current election (for candidates)
    pub votes_received: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Get entries starting from index (inclusive)
    pub fn get_entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        if start_index == 0 {
            return self.log.clone();
        }
        let start = (start_index - 1) as usize;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// Append a new entry to the log
    pub fn append_entry(&mut self, command: MetaCommand) -> &LogEntry {
        let index = self.last_log_index() + 1;
        let entry = LogEntry {
            term: self.current_term,
            index,
            command,
        };
        self.log.push(entry);
        self.log.last().expect("just pushed")
    }

    /// Truncate log from index (inclusive) and append new entries
    pub fn truncate_and_append(&mut self, from_index: u64, entries: Vec<LogEntry>) {
        if from_index > 0 {
            let truncate_at = (from_index - 1) as usize;
            if truncate_at < self.log.len() {
                self.log.truncate(truncate_at);
            }
        } else {
            self.log.clear();
        }
        self.log.extend(entries);
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    pub fn become_follower(&mut self, term: u64) {
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.votes_received = 0;
    }

    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
