use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::cluster::rpc::{
    handle_append_entries, handle_request_vote, AppendEntriesRequest, AppendEntriesResponse,
    VoteRequest, VoteResponse,
};
use crate::cluster::state::{LogEntry, MetaCommand, RaftRole, RaftState};
use crate::cluster::transport::PeerClient;
use crate::config::NodeConfig;

const RAFT_RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Message types for the consensus node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Request to append a metadata command to the log
    AppendCommand {
        command: MetaCommand,
        response_tx: tokio::sync::oneshot::Sender<Result<u64, String>>,
    },
    /// Heartbeat received from leader (resets election timeout)
    HeartbeatReceived,
    /// Trigger election
    TriggerElection,
}

/// The consensus core of one member node. Replicates `MetaCommand`s and
/// notifies the apply loop through a watch channel as the commit index
/// advances.
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    peers: Arc<Mutex<HashMap<u64, PeerClient>>>,
    /// Peers this node refuses to talk to (partition simulation); checked
    /// on both outgoing sends and incoming RPCs.
    blocked: Arc<RwLock<HashSet<u64>>>,
    message_tx: mpsc::Sender<RaftMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,
    commit_tx: watch::Sender<u64>,
}

impl RaftNode {
    pub fn new(config: NodeConfig) -> (Self, mpsc::Receiver<RaftMessage>) {
        let (message_tx, message_rx) = mpsc::channel(100);
        let (commit_tx, _) = watch::channel(0);

        let node = Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(RaftState::new())),
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            blocked: Arc::new(RwLock::new(HashSet::new())),
            message_tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            commit_tx,
        };

        (node, message_rx)
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Watch the commit index; the apply loop wakes on every advance.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Build HTTP clients for all configured peers
    pub async fn connect_to_peers(&self) {
        let mut peers = self.peers.lock().await;
        for peer_config in &self.config.peers {
            let client = PeerClient::new(peer_config.node_id, &peer_config.addr);
            tracing::info!(peer_id = peer_config.node_id, addr = %peer_config.addr, "Registered peer");
            peers.insert(peer_config.node_id, client);
        }
    }

    /// Sever the link to a peer (both directions; the transport layer
    /// consults the blocked set for incoming RPCs).
    pub async fn disconnect_peer(&self, peer_id: u64) {
        self.peers.lock().await.remove(&peer_id);
        self.blocked.write().await.insert(peer_id);
    }

    /// Restore the link to a peer
    pub async fn reconnect_peer(&self, peer_id: u64) {
        self.blocked.write().await.remove(&peer_id);
        if let Some(peer_config) = self.config.peers.iter().find(|p| p.node_id == peer_id) {
            let client = PeerClient::new(peer_config.node_id, &peer_config.addr);
            self.peers.lock().await.insert(peer_id, client);
        }
    }

    pub async fn is_blocked(&self, peer_id: u64) -> bool {
        self.blocked.read().await.contains(&peer_id)
    }

    /// Run the consensus event loop until cancelled
    pub async fn run(&self, mut message_rx: mpsc::Receiver<RaftMessage>, shutdown: CancellationToken) {
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.id, "Consensus loop stopping");
                    break;
                }

                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::AppendCommand { command, response_tx } => {
                            let result = self.handle_append_command(command).await;
                            let _ = response_tx.send(result);
                        }
                        RaftMessage::HeartbeatReceived => {
                            *self.last_heartbeat.write().await = Instant::now();
                            election_timeout = random_election_timeout(
                                self.config.election_timeout_min_ms,
                                self.config.election_timeout_max_ms,
                            );
                        }
                        RaftMessage::TriggerElection => {
                            self.start_election().await;
                        }
                    }
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = self.id,
                            elapsed_ms = elapsed.as_millis(),
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                // Heartbeat interval (for leaders)
                _ = tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)), if role == RaftRole::Leader => {
                    self.send_heartbeats().await;
                }
            }
        }
    }

    /// Start a new election
    async fn start_election(&self) {
        let mut state = self.state.write().await;
        state.become_candidate(self.id);
        let term = state.current_term;
        let last_log_index = state.last_log_index();
        let last_log_term = state.last_log_term();
        let total_nodes = self.config.peers.len() + 1; // peers + self
        let majority = (total_nodes / 2) + 1;
        drop(state);

        tracing::info!(node_id = self.id, term, "Starting election");

        let req = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };

        let peers = self.peers.lock().await;
        let mut vote_count = 1u64; // Vote for self

        for (peer_id, client) in peers.iter() {
            match timeout(RAFT_RPC_TIMEOUT, client.request_vote(&req)).await {
                Ok(Ok(resp)) => {
                    if resp.term > term {
                        // Higher term seen, become follower
                        self.state.write().await.become_follower(resp.term);
                        return;
                    }
                    if resp.vote_granted {
                        vote_count += 1;
                        tracing::debug!(
                            node_id = self.id,
                            peer_id,
                            votes = vote_count,
                            "Received vote"
                        );
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(peer_id, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::warn!(peer_id, "Vote request timed out");
                }
            }
        }
        drop(peers);

        // Check if we won
        let mut state = self.state.write().await;
        if state.role == RaftRole::Candidate && state.current_term == term {
            state.votes_received = vote_count;
            if vote_count >= majority as u64 {
                let peer_ids: Vec<u64> = self.config.peers.iter().map(|p| p.node_id).collect();
                state.become_leader(self.id, &peer_ids);
                tracing::info!(node_id = self.id, term, votes = vote_count, "Became leader");
            } else {
                tracing::debug!(
                    node_id = self.id,
                    term,
                    votes = vote_count,
                    needed = majority,
                    "Election failed, not enough votes"
                );
            }
        }
    }

    /// Send heartbeats/replication to all followers (leader only)
    async fn send_heartbeats(&self) {
        let state = self.state.read().await;
        if state.role != RaftRole::Leader {
            return;
        }

        let term = state.current_term;
        let commit_index = state.commit_index;
        let next_index = state.next_index.clone();
        let log_snapshot: Vec<LogEntry> = state.log.clone();
        drop(state);

        let peers = self.peers.lock().await;

        for (peer_id, client) in peers.iter() {
            let peer_next_index = *next_index.get(peer_id).unwrap_or(&1);
            let prev_log_index = peer_next_index.saturating_sub(1);
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                log_snapshot
                    .get((prev_log_index - 1) as usize)
                    .map(|e| e.term)
                    .unwrap_or(0)
            };

            let entries: Vec<LogEntry> = log_snapshot
                .iter()
                .filter(|e| e.index >= peer_next_index)
                .cloned()
                .collect();

            let req = AppendEntriesRequest {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            let client = client.clone();
            let peer_id = *peer_id;
            let state = self.state.clone();
            let commit_tx = self.commit_tx.clone();

            // Send AppendEntries asynchronously
            tokio::spawn(async move {
                match timeout(RAFT_RPC_TIMEOUT, client.append_entries(&req)).await {
                    Ok(Ok(resp)) => {
                        let mut state = state.write().await;

                        if resp.term > state.current_term {
                            state.become_follower(resp.term);
                            return;
                        }

                        if state.role == RaftRole::Leader && resp.success {
                            state.match_index.insert(peer_id, resp.match_index);
                            state.next_index.insert(peer_id, resp.match_index + 1);
                            Self::advance_leader_commit(&mut state, &commit_tx);
                        } else if state.role == RaftRole::Leader && !resp.success {
                            // Decrement next_index and retry
                            let current = state.next_index.get(&peer_id).copied().unwrap_or(1);
                            if current > 1 {
                                state.next_index.insert(peer_id, current - 1);
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::trace!(peer_id, error = %e, "AppendEntries failed");
                    }
                    Err(_) => {
                        tracing::trace!(peer_id, "AppendEntries timed out");
                    }
                }
            });
        }
    }

    /// Recompute the leader's commit index from the match indices.
    /// Only entries from the current term are committed.
    fn advance_leader_commit(state: &mut RaftState, commit_tx: &watch::Sender<u64>) {
        let mut match_indices: Vec<u64> = state.match_index.values().copied().collect();
        match_indices.push(state.last_log_index()); // Include self
        match_indices.sort_unstable();

        let majority_index = match_indices.len() / 2;
        let new_commit_index = match_indices[majority_index];

        if new_commit_index > state.commit_index {
            if let Some(entry) = state.get_entry(new_commit_index) {
                if entry.term == state.current_term {
                    state.commit_index = new_commit_index;
                    let _ = commit_tx.send(new_commit_index);
                    tracing::debug!(commit_index = new_commit_index, "Updated commit index");
                }
            }
        }
    }

    /// Handle a request to append a command (leader only)
    async fn handle_append_command(&self, command: MetaCommand) -> Result<u64, String> {
        let mut state = self.state.write().await;

        if state.role != RaftRole::Leader {
            return Err(format!("Not leader. Current leader: {:?}", state.leader_id));
        }

        let entry = state.append_entry(command);
        let index = entry.index;
        tracing::debug!(index, term = entry.term, "Appended command to log");

        // A single-member group commits on append
        Self::advance_leader_commit(&mut state, &self.commit_tx);

        Ok(index)
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        if self.is_blocked(req.candidate_id).await {
            // Partitioned away from the candidate: no response would reach
            // it either, so reject without mutating state.
            let state = self.state.read().await;
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        let mut state = self.state.write().await;
        let response = handle_request_vote(&mut state, &req, self.id);
        drop(state);

        // Reset election timeout if we granted vote
        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
            let _ = self.message_tx.try_send(RaftMessage::HeartbeatReceived);
        }

        response
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries_request(
        &self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        if self.is_blocked(req.leader_id).await {
            let state = self.state.read().await;
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: state.last_log_index(),
            };
        }

        let mut state = self.state.write().await;
        let old_commit = state.commit_index;
        let response = handle_append_entries(&mut state, &req, self.id);
        let new_commit = state.commit_index;
        drop(state);

        if new_commit > old_commit {
            let _ = self.commit_tx.send(new_commit);
        }

        // Reset election timeout on successful AppendEntries
        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
            let _ = self.message_tx.try_send(RaftMessage::HeartbeatReceived);
        }

        response
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Get the current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    /// Get entries that have been committed but not yet applied
    pub async fn get_committed_entries(&self) -> Vec<LogEntry> {
        let mut state = self.state.write().await;
        let mut entries = Vec::new();

        while state.last_applied < state.commit_index {
            state.last_applied += 1;
            if let Some(entry) = state.get_entry(state.last_applied) {
                entries.push(entry.clone());
            }
        }

        entries
    }

    /// Peer clients for the membership layer's broadcast paths
    pub async fn peer_clients(&self) -> Vec<PeerClient> {
        self.peers.lock().await.values().cloned().collect()
    }

    pub async fn peer_client(&self, peer_id: u64) -> Option<PeerClient> {
        self.peers.lock().await.get(&peer_id).cloned()
    }
}
