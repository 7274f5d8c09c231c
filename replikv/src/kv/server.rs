use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use futures::channel::mpsc::UnboundedReceiver;
use futures::channel::oneshot;
use futures::executor::block_on;
use futures::stream::StreamExt;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::consensus::persister::Persister;
use crate::consensus::{self, ApplyMsg, Consensus};
use crate::proto::kvpb::*;

/// How long a handler waits for its log slot to be applied before
/// answering `Timeout`.
const COMMIT_TIMEOUT: Duration = Duration::from_millis(300);

/// Poll interval of the compaction driver.
const COMPACTION_INTERVAL: Duration = Duration::from_millis(5);

/// The replica state machine. Everything here is rebuilt from the
/// committed log alone, so replicas that applied the same prefix hold
/// identical stores, and a snapshot of these four fields is a complete
/// capture.
#[derive(Default)]
struct Store {
    kv: BTreeMap<String, String>,
    // tokens whose operation has been applied and not yet evicted
    executed: BTreeSet<String>,
    // token -> value produced when its operation was applied
    results: BTreeMap<String, String>,
    last_applied: u64,
}

impl Store {
    /// Applies one committed command. Returns whether the store was
    /// mutated; duplicate tokens and stale indices are not, but they
    /// still advance `last_applied` when the index is fresh.
    fn apply(&mut self, index: u64, cmd: Command) -> bool {
        if index <= self.last_applied {
            // replayed delivery after a snapshot install
            return false;
        }
        let mutated = match CommandKind::from_i32(cmd.kind) {
            None | Some(CommandKind::Unknown) => {
                panic!("unknown command kind {} at index {}", cmd.kind, index)
            }
            Some(CommandKind::Evict) => {
                // cmd.key names the token to drop; dropping an absent
                // token is a no-op
                self.executed.remove(&cmd.key);
                self.results.remove(&cmd.key);
                true
            }
            Some(kind) => {
                if self.executed.contains(&cmd.token) {
                    false
                } else {
                    let result = match kind {
                        CommandKind::Get => {
                            self.kv.get(&cmd.key).cloned().unwrap_or_default()
                        }
                        CommandKind::Put => {
                            self.kv.insert(cmd.key, cmd.value);
                            String::new()
                        }
                        CommandKind::Append => {
                            self.kv.entry(cmd.key).or_default().push_str(&cmd.value);
                            String::new()
                        }
                        _ => unreachable!(),
                    };
                    self.results.insert(cmd.token.clone(), result);
                    self.executed.insert(cmd.token);
                    true
                }
            }
        };
        self.last_applied = index;
        mutated
    }

    /// Serializes the full store for compaction.
    fn encode(&self) -> Vec<u8> {
        let state = SnapshotState {
            kv: self.kv.clone(),
            executed: self.executed.iter().cloned().collect(),
            results: self.results.clone(),
            last_applied_index: self.last_applied,
        };
        let mut buf = vec![];
        // encoding into a fresh Vec cannot fail
        simcodec::encode(&state, &mut buf).unwrap();
        buf
    }

    /// Replaces the whole store with a decoded capture.
    fn install(&mut self, data: &[u8]) {
        let state: SnapshotState = match simcodec::decode(data) {
            Ok(state) => state,
            Err(e) => panic!("corrupt snapshot: {:?}", e),
        };
        self.kv = state.kv;
        self.executed = state.executed.into_iter().collect();
        self.results = state.results;
        self.last_applied = state.last_applied_index;
    }
}

pub struct KvServer {
    me: usize,
    consensus: Arc<dyn Consensus>,
    persister: Arc<dyn Persister + Sync>,
    // compact once the persisted consensus state outgrows this;
    // `None` disables compaction
    max_log_bytes: Option<usize>,
    store: Mutex<Store>,
    // signalled by the apply loop after every delivery
    applied: Condvar,
    dead: AtomicBool,
    // taken by the apply loop when the node starts
    apply_ch: Mutex<Option<UnboundedReceiver<ApplyMsg>>>,
}

impl KvServer {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        me: usize,
        persister: Arc<dyn Persister + Sync>,
        apply_ch: UnboundedReceiver<ApplyMsg>,
        max_log_bytes: Option<usize>,
    ) -> KvServer {
        let mut store = Store::default();
        let snapshot = persister.snapshot();
        if !snapshot.is_empty() {
            store.install(&snapshot);
            info!("S{} restored through index {}", me, store.last_applied);
        }
        KvServer {
            me,
            consensus,
            persister,
            max_log_bytes,
            store: Mutex::new(store),
            applied: Condvar::new(),
            dead: AtomicBool::new(false),
            apply_ch: Mutex::new(Some(apply_ch)),
        }
    }

    fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn is_leader(&self) -> bool {
        self.consensus.state().is_leader()
    }

    fn propose(&self, cmd: &Command) -> consensus::Result<(u64, u64)> {
        let mut buf = vec![];
        simcodec::encode(cmd, &mut buf).map_err(consensus::Error::Encode)?;
        self.consensus.propose(buf)
    }

    /// Parks the calling handler until the log has been applied at least
    /// through `index`, the commit timeout elapses, or the server dies.
    /// Returns the re-acquired guard and whether the wait timed out.
    /// Spurious wakeups only re-run the checks.
    fn wait_applied<'a>(
        &self,
        mut store: MutexGuard<'a, Store>,
        index: u64,
    ) -> (MutexGuard<'a, Store>, bool) {
        let deadline = Instant::now() + COMMIT_TIMEOUT;
        while store.last_applied < index && !self.killed() {
            let now = Instant::now();
            if now >= deadline {
                return (store, true);
            }
            let (guard, _) = self.applied.wait_timeout(store, deadline - now).unwrap();
            store = guard;
        }
        (store, false)
    }

    fn do_get(&self, args: GetRequest) -> GetReply {
        if self.killed() {
            return GetReply::default();
        }
        let mut reply = GetReply::default();
        let store = self.store.lock().unwrap();
        if !self.is_leader() {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }

        // A retry of a request that already went through the log:
        // answer from the recorded result without proposing again.
        if store.executed.contains(&args.token) {
            reply.err = ErrCode::Ok as i32;
            reply.value = self.recorded_result(&store, &args.token);
            return reply;
        }

        let cmd = Command {
            token: args.token.clone(),
            kind: CommandKind::Get as i32,
            key: args.key,
            value: String::new(),
        };
        let index = match self.propose(&cmd) {
            Ok((index, term)) => {
                debug!("S{} get {} at index {} term {}", self.me, args.token, index, term);
                index
            }
            Err(_) => {
                reply.err = ErrCode::WrongLeader as i32;
                return reply;
            }
        };

        let (store, timed_out) = self.wait_applied(store, index);
        if self.killed() {
            return GetReply::default();
        }
        if !self.is_leader() {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }
        if timed_out {
            debug!("S{} get {} timed out", self.me, args.token);
            reply.err = ErrCode::Timeout as i32;
            return reply;
        }
        // The slot was applied, but a new leader may have filled it with
        // a different entry; only the token proves our command survived.
        if !store.executed.contains(&args.token) {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }
        reply.err = ErrCode::Ok as i32;
        reply.value = self.recorded_result(&store, &args.token);
        reply
    }

    fn do_put_append(&self, kind: CommandKind, args: PutAppendRequest) -> PutAppendReply {
        if self.killed() {
            return PutAppendReply::default();
        }
        let mut reply = PutAppendReply::default();
        let store = self.store.lock().unwrap();
        if !self.is_leader() {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }

        if store.executed.contains(&args.token) {
            debug!("S{} {:?} {} already executed", self.me, kind, args.token);
            reply.err = ErrCode::Ok as i32;
            return reply;
        }

        let cmd = Command {
            token: args.token.clone(),
            kind: kind as i32,
            key: args.key,
            value: args.value,
        };
        let index = match self.propose(&cmd) {
            Ok((index, term)) => {
                debug!(
                    "S{} {:?} {} at index {} term {}",
                    self.me, kind, args.token, index, term
                );
                index
            }
            Err(_) => {
                reply.err = ErrCode::WrongLeader as i32;
                return reply;
            }
        };

        let (store, timed_out) = self.wait_applied(store, index);
        if self.killed() {
            return PutAppendReply::default();
        }
        if !self.is_leader() {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }
        if timed_out {
            debug!("S{} {:?} {} timed out", self.me, kind, args.token);
            reply.err = ErrCode::Timeout as i32;
            return reply;
        }
        if !store.executed.contains(&args.token) {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }
        reply.err = ErrCode::Ok as i32;
        reply
    }

    fn do_notify(&self, args: NotifyRequest) -> NotifyReply {
        if self.killed() {
            return NotifyReply::default();
        }
        let mut reply = NotifyReply::default();
        let store = self.store.lock().unwrap();
        if !self.is_leader() {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }

        // Eviction is idempotent, so it carries no dedup token of its
        // own and is proposed even when the record is already gone.
        let cmd = Command {
            token: String::new(),
            kind: CommandKind::Evict as i32,
            key: args.token,
            value: String::new(),
        };
        let index = match self.propose(&cmd) {
            Ok((index, _term)) => index,
            Err(_) => {
                reply.err = ErrCode::WrongLeader as i32;
                return reply;
            }
        };

        // Block like the other handlers, so a burst of eviction traffic
        // cannot outrun the apply loop.
        let (_store, timed_out) = self.wait_applied(store, index);
        if self.killed() {
            return NotifyReply::default();
        }
        if !self.is_leader() {
            reply.err = ErrCode::WrongLeader as i32;
            return reply;
        }
        if timed_out {
            reply.err = ErrCode::Timeout as i32;
            return reply;
        }
        reply.err = ErrCode::Ok as i32;
        reply
    }

    /// Reads the result recorded for an executed token. While a token
    /// sits in `executed`, its result must exist; anything else means
    /// the apply loop or the consensus layer broke an invariant, and a
    /// wrong answer would be worse than a crash.
    fn recorded_result(&self, store: &Store, token: &str) -> String {
        match store.results.get(token) {
            Some(value) => value.clone(),
            None => panic!("S{}: token {} executed but its result is gone", self.me, token),
        }
    }
}

/// Drains the committed stream into the store. Runs on its own thread
/// until the consensus layer closes the channel or the node dies.
fn run_apply_loop(server: Arc<KvServer>) {
    let mut apply_ch = server
        .apply_ch
        .lock()
        .unwrap()
        .take()
        .expect("apply loop started twice");
    thread::spawn(move || {
        while let Some(msg) = block_on(apply_ch.next()) {
            if server.killed() {
                break;
            }
            match msg {
                ApplyMsg::Command { data, index } => {
                    let cmd: Command = match simcodec::decode(&data) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            panic!("S{}: malformed log entry at {}: {:?}", server.me, index, e)
                        }
                    };
                    let mut store = server.store.lock().unwrap();
                    store.apply(index, cmd);
                    server.applied.notify_all();
                }
                ApplyMsg::Snapshot { data, term, index } => {
                    let mut store = server.store.lock().unwrap();
                    if index > store.last_applied {
                        debug!("S{} installing snapshot at {} term {}", server.me, index, term);
                        store.install(&data);
                    }
                    server.applied.notify_all();
                }
            }
        }
        debug!("S{} apply loop exits", server.me);
    });
}

/// Snapshots the store whenever the persisted consensus state outgrows
/// the configured bound, handing the capture to the consensus layer for
/// log truncation. Re-snapshotting at an unchanged index is harmless.
fn run_compaction_driver(server: Arc<KvServer>) {
    let limit = match server.max_log_bytes {
        Some(limit) => limit,
        None => return,
    };
    thread::spawn(move || {
        while !server.killed() {
            if server.persister.consensus_state().len() > limit {
                let store = server.store.lock().unwrap();
                let index = store.last_applied;
                let blob = store.encode();
                drop(store);
                if index > 0 {
                    server.consensus.snapshot(index, &blob);
                }
            }
            thread::sleep(COMPACTION_INTERVAL);
        }
    });
}

/// The RPC front of one replica. Handlers park while waiting for their
/// log slot, so each request is shifted onto the handler pool and the
/// transport's executor is never blocked.
#[derive(Clone)]
pub struct Node {
    server: Arc<KvServer>,
    handlers: Arc<ThreadPool>,
}

impl Node {
    pub fn new(kv: KvServer) -> Node {
        let server = Arc::new(kv);
        run_apply_loop(server.clone());
        run_compaction_driver(server.clone());
        let handlers = Arc::new(ThreadPoolBuilder::new().num_threads(8).build().unwrap());
        Node { server, handlers }
    }

    /// Stops this replica: no new work is accepted, parked handlers are
    /// woken so they can observe the flag, and the consensus handle is
    /// shut down with it.
    pub fn kill(&self) {
        self.server.dead.store(true, Ordering::SeqCst);
        self.server.consensus.kill();
        self.server.applied.notify_all();
        info!("S{} killed", self.server.me);
    }

    /// The current term of this replica's consensus peer.
    pub fn term(&self) -> u64 {
        self.server.consensus.state().term()
    }

    /// Whether this replica believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.server.is_leader()
    }
}

#[async_trait::async_trait]
impl KvService for Node {
    async fn get(&self, args: GetRequest) -> simrpc::Result<GetReply> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        self.handlers.spawn(move || {
            let _ = tx.send(this.server.do_get(args));
        });
        rx.await.map_err(|_| simrpc::RpcError::Dead)
    }

    async fn put(&self, args: PutAppendRequest) -> simrpc::Result<PutAppendReply> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        self.handlers.spawn(move || {
            let _ = tx.send(this.server.do_put_append(CommandKind::Put, args));
        });
        rx.await.map_err(|_| simrpc::RpcError::Dead)
    }

    async fn append(&self, args: PutAppendRequest) -> simrpc::Result<PutAppendReply> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        self.handlers.spawn(move || {
            let _ = tx.send(this.server.do_put_append(CommandKind::Append, args));
        });
        rx.await.map_err(|_| simrpc::RpcError::Dead)
    }

    async fn notify(&self, args: NotifyRequest) -> simrpc::Result<NotifyReply> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        self.handlers.spawn(move || {
            let _ = tx.send(this.server.do_notify(args));
        });
        rx.await.map_err(|_| simrpc::RpcError::Dead)
    }
}
