use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use rand::Rng;

use crate::proto::kvpb::*;

/// Pause after sweeping the whole replica set without success, so a
/// cluster in the middle of an election is not hammered.
const SWEEP_PAUSE: Duration = Duration::from_micros(100);

/// A client session. One clerk issues one request at a time; its tokens
/// are unique across every clerk that will ever talk to the cluster, so
/// the replicas can recognize a retry of an operation they already
/// performed.
pub struct Clerk {
    pub name: String,
    servers: Vec<KvClient>,
    // chosen once per session; 63 bits so the id stays positive in any
    // signed decoding
    client_id: u64,
    seq: AtomicU64,
    // index of the replica last believed to be leader; shared with the
    // background eviction tasks, and allowed to be stale
    leader: Arc<AtomicUsize>,
}

impl fmt::Debug for Clerk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Clerk").field("name", &self.name).finish()
    }
}

impl Clerk {
    pub fn new(name: String, servers: Vec<KvClient>) -> Clerk {
        Clerk {
            name,
            servers,
            client_id: rand::thread_rng().gen::<u64>() >> 1,
            seq: AtomicU64::new(0),
            leader: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mints the token for the next logical call. Incremented exactly
    /// once per call, before any retrying starts, so every resend of the
    /// call carries the same token.
    fn next_token(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.client_id, seq)
    }

    /// Fetches the current value for a key; returns "" if the key does
    /// not exist. Keeps trying forever in the face of all other errors.
    pub fn get(&self, key: String) -> String {
        let token = self.next_token();
        let args = GetRequest {
            token: token.clone(),
            key,
        };
        let reply = send_until_ok(&self.servers, &self.leader, |client| {
            match block_on(client.get(&args)) {
                Ok(reply) if reply.err == ErrCode::Ok as i32 => Some(reply),
                _ => None,
            }
        });
        debug!("{}: get {} done", self.name, token);
        self.release_token(token);
        reply.value
    }

    pub fn put(&self, key: String, value: String) {
        let token = self.next_token();
        let args = PutAppendRequest {
            token: token.clone(),
            key,
            value,
        };
        send_until_ok(&self.servers, &self.leader, |client| {
            match block_on(client.put(&args)) {
                Ok(reply) if reply.err == ErrCode::Ok as i32 => Some(()),
                _ => None,
            }
        });
        debug!("{}: put {} done", self.name, token);
        self.release_token(token);
    }

    pub fn append(&self, key: String, value: String) {
        let token = self.next_token();
        let args = PutAppendRequest {
            token: token.clone(),
            key,
            value,
        };
        send_until_ok(&self.servers, &self.leader, |client| {
            match block_on(client.append(&args)) {
                Ok(reply) if reply.err == ErrCode::Ok as i32 => Some(()),
                _ => None,
            }
        });
        debug!("{}: append {} done", self.name, token);
        self.release_token(token);
    }

    /// Tells the cluster that this token's reply has been consumed and
    /// its dedup record can be dropped. Fire-and-forget: the user call
    /// has already succeeded, so nobody waits for the eviction.
    fn release_token(&self, token: String) {
        let servers = self.servers.clone();
        let leader = self.leader.clone();
        thread::spawn(move || {
            let args = NotifyRequest { token };
            send_until_ok(&servers, &leader, |client| {
                match block_on(client.notify(&args)) {
                    Ok(reply) if reply.err == ErrCode::Ok as i32 => Some(()),
                    // the target is gone for good, so there is nobody
                    // left to tell; the record dies with it anyway
                    Err(simrpc::RpcError::Dead) => Some(()),
                    _ => None,
                }
            });
        });
    }
}

/// The shared retry loop: walk the replica set from the leader hint
/// until some replica returns a definitive reply. A transport failure,
/// `WrongLeader` and `Timeout` all look the same from here; advance the
/// hint and try the next replica.
fn send_until_ok<T>(
    servers: &[KvClient],
    leader: &AtomicUsize,
    mut call: impl FnMut(&KvClient) -> Option<T>,
) -> T {
    let mut misses = 0;
    loop {
        let i = leader.load(Ordering::Relaxed) % servers.len();
        if let Some(reply) = call(&servers[i]) {
            return reply;
        }
        leader.store((i + 1) % servers.len(), Ordering::Relaxed);
        misses += 1;
        if misses == servers.len() {
            misses = 0;
            thread::sleep(SWEEP_PAUSE);
        }
    }
}
