use serde::{Deserialize, Serialize};

use crate::cluster::state::{LogEntry, RaftRole, RaftState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
) -> AppendEntriesResponse {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: state.last_log_index(),
        };
    }

    // Valid AppendEntries from leader - reset to follower if we're a candidate
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    // Check if we have the prev_log entry
    if req.prev_log_index > 0 {
        match state.get_entry(req.prev_log_index) {
            None => {
                // We don't have the entry at prev_log_index
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.last_log_index(),
                };
            }
            Some(entry) => {
                if entry.term != req.prev_log_term {
                    // Term mismatch - truncate and reject
                    state.log.truncate((req.prev_log_index - 1) as usize);
                    return AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        match_index: state.last_log_index(),
                    };
                }
            }
        }
    }

    if !req.entries.is_empty() {
        let start_index = req.prev_log_index + 1;
        state.truncate_and_append(start_index, req.entries.clone());

        tracing::debug!(
            node_id = my_id,
            entries_appended = req.entries.len(),
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    // Update commit index
    if req.leader_commit > state.commit_index {
        state.commit_index = std::cmp::min(req.leader_commit, state.last_log_index());
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: state.last_log_index(),
    }
}
