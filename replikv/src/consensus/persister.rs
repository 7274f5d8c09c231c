//! Storage for consensus state and service snapshots.
//!
//! The consensus layer owns the contents; the service only reads its
//! snapshot back at startup and polls `consensus_state().len()` to
//! decide when the log has grown enough to be worth compacting.

use std::sync::{Arc, Mutex};

pub trait Persister: Send + 'static {
    fn consensus_state(&self) -> Vec<u8>;
    fn save_consensus_state(&self, state: Vec<u8>);
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>);
    fn snapshot(&self) -> Vec<u8>;
}

impl<T: ?Sized + Persister> Persister for Box<T> {
    fn consensus_state(&self) -> Vec<u8> {
        (**self).consensus_state()
    }
    fn save_consensus_state(&self, state: Vec<u8>) {
        (**self).save_consensus_state(state)
    }
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        (**self).save_state_and_snapshot(state, snapshot)
    }
    fn snapshot(&self) -> Vec<u8> {
        (**self).snapshot()
    }
}

impl<T: ?Sized + Sync + Persister> Persister for Arc<T> {
    fn consensus_state(&self) -> Vec<u8> {
        (**self).consensus_state()
    }
    fn save_consensus_state(&self, state: Vec<u8>) {
        (**self).save_consensus_state(state)
    }
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        (**self).save_state_and_snapshot(state, snapshot)
    }
    fn snapshot(&self) -> Vec<u8> {
        (**self).snapshot()
    }
}

#[derive(Default)]
struct Stored {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// An in-memory persister. Both blobs are replaced wholesale; the pair
/// is written atomically so a snapshot is never paired with a log that
/// predates it.
pub struct SimplePersister {
    stored: Mutex<Stored>,
}

impl SimplePersister {
    pub fn new() -> SimplePersister {
        SimplePersister {
            stored: Mutex::default(),
        }
    }
}

impl Persister for SimplePersister {
    fn consensus_state(&self) -> Vec<u8> {
        self.stored.lock().unwrap().state.clone()
    }

    fn save_consensus_state(&self, state: Vec<u8>) {
        self.stored.lock().unwrap().state = state;
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        let mut stored = self.stored.lock().unwrap();
        stored.state = state;
        stored.snapshot = snapshot;
    }

    fn snapshot(&self) -> Vec<u8> {
        self.stored.lock().unwrap().snapshot.clone()
    }
}
