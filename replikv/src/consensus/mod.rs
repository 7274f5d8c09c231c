//! The contract between the key/value service and the consensus layer.
//!
//! The service does not replicate anything itself. It hands encoded
//! commands to an external consensus log through [`Consensus`] and
//! rebuilds its state from the committed output delivered as
//! [`ApplyMsg`]s. This module defines exactly the slice of that layer
//! the service consumes; real deployments plug in their consensus
//! implementation, tests plug in the scripted log from [`sim`].

use std::{error, fmt, result};

pub mod persister;
#[cfg(test)]
pub mod sim;

/// Committed output of the consensus layer, delivered to the service in
/// strict log order. A snapshot may jump the index forward past entries
/// the receiver never saw individually.
pub enum ApplyMsg {
    Command {
        data: Vec<u8>,
        index: u64,
    },
    Snapshot {
        data: Vec<u8>,
        term: u64,
        index: u64,
    },
}

/// Role of a consensus peer at some instant.
#[derive(Default, Clone, Debug)]
pub struct State {
    pub term: u64,
    pub is_leader: bool,
}

impl State {
    /// The current term of this peer.
    pub fn term(&self) -> u64 {
        self.term
    }
    /// Whether this peer believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Encode(simcodec::EncodeError),
    NotLeader,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Encode(ref e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Handle to one peer of the consensus cluster.
pub trait Consensus: Send + Sync + 'static {
    /// Starts agreement on an encoded command. Returns the log slot the
    /// command will occupy if this peer is still leader when the slot
    /// commits, as `(index, term)`, or [`Error::NotLeader`]. Must not
    /// block; nothing guarantees the command ever commits, and callers
    /// learn the outcome from the committed stream only.
    fn propose(&self, command: Vec<u8>) -> Result<(u64, u64)>;

    /// The peer's current term and leadership claim.
    fn state(&self) -> State;

    /// Hands over a state capture covering the log up to and including
    /// `included_index`, allowing the log to be truncated. Idempotent;
    /// re-snapshotting at or below the current compaction point is a
    /// no-op.
    fn snapshot(&self, included_index: u64, snapshot: &[u8]);

    /// Shuts this peer down.
    fn kill(&self);
}
