//! A scripted consensus log for tests.
//!
//! One [`LogCluster`] holds a single totally-ordered log shared by every
//! replica of a test cluster. Tests appoint the leader, cut nodes off,
//! and re-deliver committed entries; the replicas under test only ever
//! see the [`Consensus`] trait and their apply channel, so they cannot
//! tell this from a real consensus layer. The simulation keeps the
//! properties the service relies on: entries commit only while the
//! leader can reach a majority, committed entries are delivered to every
//! node in index order, a new leader's term discards the old leader's
//! uncommitted tail (so a log slot can be reused for a different entry),
//! and compaction replaces a log prefix with a snapshot that late or
//! restarted nodes receive before the remaining entries.

use std::sync::{Arc, Mutex};

use futures::channel::mpsc::UnboundedSender;

use super::persister::Persister;
use super::{ApplyMsg, Consensus, Error, Result, State};

struct LogEntry {
    term: u64,
    data: Vec<u8>,
}

struct Peer {
    apply_tx: UnboundedSender<ApplyMsg>,
    persister: Arc<dyn Persister + Sync>,
    // highest log index delivered on apply_tx, or covered by a
    // delivered snapshot
    delivered: u64,
    connected: bool,
}

struct Core {
    n: usize,
    term: u64,
    leader: Option<usize>,
    // entries after the compaction point; entries[0] sits at log index
    // snapshot_index + 1
    entries: Vec<LogEntry>,
    commit_index: u64,
    snapshot_index: u64,
    snapshot_term: u64,
    snapshot: Vec<u8>,
    peers: Vec<Option<Peer>>,
}

impl Core {
    fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    fn entry(&self, index: u64) -> &LogEntry {
        &self.entries[(index - self.snapshot_index - 1) as usize]
    }

    fn connected_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.as_ref().map_or(false, |p| p.connected))
            .count()
    }

    fn encode_state(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for e in &self.entries {
            buf.extend_from_slice(&e.term.to_le_bytes());
            buf.extend_from_slice(&(e.data.len() as u64).to_le_bytes());
            buf.extend_from_slice(&e.data);
        }
        buf
    }

    fn persist_state(&self) {
        let state = self.encode_state();
        for peer in self.peers.iter().flatten() {
            peer.persister.save_consensus_state(state.clone());
        }
    }

    fn persist_state_and_snapshot(&self) {
        let state = self.encode_state();
        for peer in self.peers.iter().flatten() {
            peer.persister
                .save_state_and_snapshot(state.clone(), self.snapshot.clone());
        }
    }

    /// Commits the log tail if the leader currently reaches a majority,
    /// and pushes newly committed entries to every connected node.
    fn maybe_commit(&mut self) {
        let leader = match self.leader {
            Some(l) => l,
            None => return,
        };
        let leader_up = self.peers[leader].as_ref().map_or(false, |p| p.connected);
        if !leader_up || self.connected_count() * 2 <= self.n {
            return;
        }
        self.commit_index = self.last_index();
        for i in 0..self.peers.len() {
            self.deliver(i);
        }
    }

    /// Pushes everything node `i` has not seen yet: the snapshot first
    /// if the node is behind the compaction point, then the committed
    /// entries in index order.
    fn deliver(&mut self, i: usize) {
        let mut delivered = match self.peers[i] {
            Some(ref p) if p.connected => p.delivered,
            _ => return,
        };
        let mut msgs = Vec::new();
        if delivered < self.snapshot_index {
            msgs.push(ApplyMsg::Snapshot {
                data: self.snapshot.clone(),
                term: self.snapshot_term,
                index: self.snapshot_index,
            });
            delivered = self.snapshot_index;
        }
        while delivered < self.commit_index {
            delivered += 1;
            let e = self.entry(delivered);
            msgs.push(ApplyMsg::Command {
                data: e.data.clone(),
                index: delivered,
            });
        }
        if let Some(ref mut p) = self.peers[i] {
            for m in msgs {
                let _ = p.apply_tx.unbounded_send(m);
            }
            p.delivered = delivered;
        }
    }
}

/// The shared log of a simulated cluster; cheap to clone.
#[derive(Clone)]
pub struct LogCluster {
    core: Arc<Mutex<Core>>,
}

impl LogCluster {
    pub fn new(n: usize) -> LogCluster {
        LogCluster {
            core: Arc::new(Mutex::new(Core {
                n,
                term: 0,
                leader: None,
                entries: Vec::new(),
                commit_index: 0,
                snapshot_index: 0,
                snapshot_term: 0,
                snapshot: Vec::new(),
                peers: (0..n).map(|_| None).collect(),
            })),
        }
    }

    /// Brings node `i` online (initially, or after a crash) and returns
    /// its consensus handle. The node catches up from the cluster's
    /// compaction point and committed log.
    pub fn connect_node(
        &self,
        i: usize,
        persister: Arc<dyn Persister + Sync>,
        apply_tx: UnboundedSender<ApplyMsg>,
    ) -> LogHandle {
        let mut core = self.core.lock().unwrap();
        assert!(core.peers[i].is_none(), "node {} is already up", i);
        core.peers[i] = Some(Peer {
            apply_tx,
            persister,
            // catch up from scratch: the current snapshot (if any) is
            // delivered first, then the committed tail
            delivered: 0,
            connected: true,
        });
        core.deliver(i);
        LogHandle {
            me: i,
            core: self.core.clone(),
        }
    }

    /// Appoints node `i` leader in a fresh term. Entries past the commit
    /// point belonged to the deposed leader and are discarded; their log
    /// slots will be reused by the new leader.
    pub fn elect(&self, i: usize) {
        let mut core = self.core.lock().unwrap();
        assert!(core.peers[i].is_some(), "electing a dead node");
        core.term += 1;
        core.leader = Some(i);
        let committed = (core.commit_index - core.snapshot_index) as usize;
        core.entries.truncate(committed);
        core.persist_state();
        debug!("sim: node {} leads term {}", i, core.term);
    }

    /// Cuts node `i` off from (or reconnects it to) the rest of the
    /// cluster. A cut-off leader keeps claiming leadership, but its
    /// proposals cannot commit while it is alone.
    pub fn set_connected(&self, i: usize, connected: bool) {
        let mut core = self.core.lock().unwrap();
        if let Some(ref mut p) = core.peers[i] {
            p.connected = connected;
        }
        if connected {
            core.deliver(i);
            core.maybe_commit();
        }
    }

    /// Re-delivers every committed entry past the compaction point to
    /// node `i`, as a recovering consensus layer might.
    pub fn replay_committed(&self, i: usize) {
        let mut core = self.core.lock().unwrap();
        let snapshot_index = core.snapshot_index;
        if let Some(ref mut p) = core.peers[i] {
            p.delivered = snapshot_index;
        }
        core.deliver(i);
    }
}

/// One node's view of the shared log.
pub struct LogHandle {
    me: usize,
    core: Arc<Mutex<Core>>,
}

impl Consensus for LogHandle {
    fn propose(&self, command: Vec<u8>) -> Result<(u64, u64)> {
        let mut core = self.core.lock().unwrap();
        if core.peers[self.me].is_none() || core.leader != Some(self.me) {
            return Err(Error::NotLeader);
        }
        let term = core.term;
        core.entries.push(LogEntry {
            term,
            data: command,
        });
        let index = core.last_index();
        // the entry lands in every node's persisted log even if it
        // never commits
        core.persist_state();
        core.maybe_commit();
        Ok((index, term))
    }

    fn state(&self) -> State {
        let core = self.core.lock().unwrap();
        State {
            term: core.term,
            is_leader: core.leader == Some(self.me) && core.peers[self.me].is_some(),
        }
    }

    fn snapshot(&self, included_index: u64, snapshot: &[u8]) {
        let mut core = self.core.lock().unwrap();
        if included_index <= core.snapshot_index {
            return;
        }
        assert!(
            included_index <= core.commit_index,
            "snapshot at {} is past the commit point {}",
            included_index,
            core.commit_index
        );
        core.snapshot_term = core.entry(included_index).term;
        let drop_count = (included_index - core.snapshot_index) as usize;
        core.entries.drain(..drop_count);
        core.snapshot_index = included_index;
        core.snapshot = snapshot.to_vec();
        core.persist_state_and_snapshot();
        debug!("sim: compacted through index {}", included_index);
    }

    fn kill(&self) {
        let mut core = self.core.lock().unwrap();
        // dropping the peer drops apply_tx, which ends the node's
        // apply stream
        core.peers[self.me] = None;
        if core.leader == Some(self.me) {
            core.leader = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc::{unbounded, UnboundedReceiver};

    use super::*;
    use crate::consensus::persister::SimplePersister;

    fn drain(rx: &mut UnboundedReceiver<ApplyMsg>) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        while let Ok(Some(msg)) = rx.try_next() {
            if let ApplyMsg::Command { data, index } = msg {
                out.push((index, data));
            }
        }
        out
    }

    fn two_node_cluster() -> (LogCluster, Vec<LogHandle>, Vec<UnboundedReceiver<ApplyMsg>>) {
        let cluster = LogCluster::new(2);
        let mut handles = Vec::new();
        let mut rxs = Vec::new();
        for i in 0..2 {
            let (tx, rx) = unbounded();
            handles.push(cluster.connect_node(i, Arc::new(SimplePersister::new()), tx));
            rxs.push(rx);
        }
        (cluster, handles, rxs)
    }

    #[test]
    fn test_propose_requires_leadership() {
        let (cluster, handles, mut rxs) = two_node_cluster();
        assert_eq!(handles[0].propose(vec![1]), Err(Error::NotLeader));

        cluster.elect(0);
        assert!(handles[0].state().is_leader());
        assert!(!handles[1].state().is_leader());

        let (index, term) = handles[0].propose(vec![1]).unwrap();
        assert_eq!((index, term), (1, 1));
        assert_eq!(drain(&mut rxs[0]), vec![(1, vec![1])]);
        assert_eq!(drain(&mut rxs[1]), vec![(1, vec![1])]);
    }

    #[test]
    fn test_isolated_leader_cannot_commit() {
        let (cluster, handles, mut rxs) = two_node_cluster();
        cluster.elect(0);
        cluster.set_connected(0, false);

        // still believes it leads, and still accepts proposals
        assert!(handles[0].state().is_leader());
        let (index, _) = handles[0].propose(vec![7]).unwrap();
        assert_eq!(index, 1);
        assert!(drain(&mut rxs[0]).is_empty());
        assert!(drain(&mut rxs[1]).is_empty());

        // a new leader's term discards the tail and reuses the slot
        cluster.elect(1);
        cluster.set_connected(0, true);
        let (index, term) = handles[1].propose(vec![9]).unwrap();
        assert_eq!((index, term), (1, 2));
        assert_eq!(drain(&mut rxs[0]), vec![(1, vec![9])]);
        assert_eq!(drain(&mut rxs[1]), vec![(1, vec![9])]);
    }

    #[test]
    fn test_snapshot_compacts_and_late_node_catches_up() {
        let cluster = LogCluster::new(3);
        let mut handles = Vec::new();
        let mut rxs = Vec::new();
        for i in 0..2 {
            let (tx, rx) = unbounded();
            handles.push(cluster.connect_node(i, Arc::new(SimplePersister::new()), tx));
            rxs.push(rx);
        }
        cluster.elect(0);
        for x in 1..=4u8 {
            handles[0].propose(vec![x]).unwrap();
        }
        drain(&mut rxs[0]);

        let state_len = |cluster: &LogCluster| {
            let core = cluster.core.lock().unwrap();
            let persister = &core.peers[0].as_ref().unwrap().persister;
            persister.consensus_state().len()
        };
        let before = state_len(&cluster);
        handles[0].snapshot(3, b"snap");
        // compacting twice at the same point changes nothing
        handles[0].snapshot(3, b"snap");
        let after = state_len(&cluster);
        assert!(after < before, "log did not shrink ({} -> {})", before, after);

        // a node that joins late gets the snapshot, then the tail
        let (tx, mut rx) = unbounded();
        let _h2 = cluster.connect_node(2, Arc::new(SimplePersister::new()), tx);
        match rx.try_next().unwrap().unwrap() {
            ApplyMsg::Snapshot { data, index, .. } => {
                assert_eq!(data, b"snap".to_vec());
                assert_eq!(index, 3);
            }
            _ => panic!("expected a snapshot first"),
        }
        assert_eq!(drain(&mut rx), vec![(4, vec![4])]);
    }
}
