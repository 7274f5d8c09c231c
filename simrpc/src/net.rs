//! The transport fabric: named endpoints on one side, servers on the
//! other, and a network in between that can lose traffic, delay it, or
//! retire a server out from under its callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;
use futures::executor::ThreadPool;
use futures::future::{self, BoxFuture, Either};
use futures_timer::Delay;
use log::debug;
use rand::{thread_rng, Rng};

use crate::{Result, RpcError};

pub type RpcFuture<T> = BoxFuture<'static, T>;

/// Server-side glue produced by `service!`: turns a method name and a
/// raw request into a raw reply.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, method: &str, req: &[u8]) -> RpcFuture<Result<Vec<u8>>>;
}

/// How long a call to a missing or disabled target stalls (at most)
/// before it is reported lost. Short, so a caller can sweep a whole
/// replica set quickly.
const UNREACHABLE_STALL_MS: u64 = 100;
/// Odds (out of 1000) that an unreliable link eats the request, and the
/// same again for the reply.
const LOSS_PER_MILLE: u64 = 100;
/// Largest latency an unreliable link adds to a request (ms).
const JITTER_MS: u64 = 27;
/// Calls already inside a handler notice the server's retirement within
/// this many milliseconds.
const RETIRE_TICK_MS: u64 = 100;

struct ServerInner {
    name: String,
    handler: Arc<dyn RpcHandler>,
    // flipped once this incarnation is removed or replaced
    retired: AtomicBool,
    handled: AtomicUsize,
}

/// One incarnation of a named server. Registering a new incarnation
/// under the same name retires this one: its in-flight calls fail
/// instead of answering for state that has been superseded.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(name: String, handler: Arc<dyn RpcHandler>) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                name,
                handler,
                retired: AtomicBool::new(false),
                handled: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// How many requests reached this incarnation's handler.
    pub fn call_count(&self) -> usize {
        self.inner.handled.load(Ordering::Relaxed)
    }

    fn retire(&self) {
        self.inner.retired.store(true, Ordering::SeqCst);
    }

    fn retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }
}

// one endpoint's view of the world
struct Link {
    enabled: bool,
    target: Option<String>,
}

struct Fabric {
    links: HashMap<String, Link>,
    servers: HashMap<String, Server>,
}

struct NetworkInner {
    unreliable: AtomicBool,
    reorder_replies: AtomicBool,
    fabric: Mutex<Fabric>,
    pool: ThreadPool,
}

/// Owner of every link and server in one simulated deployment.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new() -> Network {
        Network {
            inner: Arc::new(NetworkInner {
                unreliable: AtomicBool::new(false),
                reorder_replies: AtomicBool::new(false),
                fabric: Mutex::new(Fabric {
                    links: HashMap::new(),
                    servers: HashMap::new(),
                }),
                pool: ThreadPool::new().unwrap(),
            }),
        }
    }

    /// Lose roughly a tenth of requests and of replies, and add jitter
    /// to the rest.
    pub fn set_unreliable(&self, yes: bool) {
        self.inner.unreliable.store(yes, Ordering::Release);
    }

    /// Hold most replies back for a while, so replies overtake each
    /// other.
    pub fn set_reorder_replies(&self, yes: bool) {
        self.inner.reorder_replies.store(yes, Ordering::Release);
    }

    /// Registers a server, retiring any previous incarnation of the
    /// same name.
    pub fn add_server(&self, server: Server) {
        let mut fabric = self.inner.fabric.lock().unwrap();
        if let Some(old) = fabric.servers.insert(server.name().to_owned(), server) {
            old.retire();
        }
    }

    /// Takes a named server off the network and retires it.
    pub fn remove_server(&self, name: &str) {
        let mut fabric = self.inner.fabric.lock().unwrap();
        if let Some(old) = fabric.servers.remove(name) {
            old.retire();
        }
    }

    /// Creates a named endpoint. It reaches nothing until it is wired
    /// to a server and enabled.
    pub fn endpoint(&self, name: String) -> Endpoint {
        let mut fabric = self.inner.fabric.lock().unwrap();
        fabric.links.insert(
            name.clone(),
            Link {
                enabled: false,
                target: None,
            },
        );
        Endpoint {
            name,
            net: self.clone(),
        }
    }

    /// Points an endpoint at a server.
    pub fn wire(&self, endpoint: &str, server: &str) {
        let mut fabric = self.inner.fabric.lock().unwrap();
        if let Some(link) = fabric.links.get_mut(endpoint) {
            link.target = Some(server.to_owned());
        }
    }

    pub fn set_enabled(&self, endpoint: &str, enabled: bool) {
        debug!(
            "link {} is {}",
            endpoint,
            if enabled { "up" } else { "down" }
        );
        let mut fabric = self.inner.fabric.lock().unwrap();
        if let Some(link) = fabric.links.get_mut(endpoint) {
            link.enabled = enabled;
        }
    }

    /// The live server an endpoint can currently reach, if any.
    fn route(&self, endpoint: &str) -> Option<Server> {
        let fabric = self.inner.fabric.lock().unwrap();
        let link = fabric.links.get(endpoint)?;
        if !link.enabled {
            return None;
        }
        fabric.servers.get(link.target.as_ref()?).cloned()
    }
}

/// Per-call fault decisions, rolled up front so delivery itself is
/// straight-line.
struct FaultPlan {
    drop_request: bool,
    drop_reply: bool,
    request_delay: Duration,
    reply_delay: Duration,
}

impl FaultPlan {
    fn roll(unreliable: bool, reorder: bool) -> FaultPlan {
        let mut rng = thread_rng();
        let mut plan = FaultPlan {
            drop_request: false,
            drop_reply: false,
            request_delay: Duration::from_millis(0),
            reply_delay: Duration::from_millis(0),
        };
        if unreliable {
            plan.drop_request = rng.gen::<u64>() % 1000 < LOSS_PER_MILLE;
            plan.drop_reply = rng.gen::<u64>() % 1000 < LOSS_PER_MILLE;
            plan.request_delay = Duration::from_millis(rng.gen::<u64>() % JITTER_MS);
        }
        if reorder && rng.gen::<u64>() % 3 > 0 {
            let spread = 1 + rng.gen::<u64>() % 2000;
            plan.reply_delay = Duration::from_millis(200 + rng.gen::<u64>() % spread);
        }
        plan
    }
}

/// A named caller. Clones share the same link.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    net: Network,
}

impl Endpoint {
    pub fn call<Req, Rsp>(&self, method: &'static str, req: &Req) -> RpcFuture<Result<Rsp>>
    where
        Req: simcodec::Message,
        Rsp: simcodec::Message + 'static,
    {
        let mut buf = vec![];
        if let Err(e) = simcodec::encode(req, &mut buf) {
            return Box::pin(future::err(RpcError::Codec(e.to_string())));
        }

        let inner = &self.net.inner;
        let plan = FaultPlan::roll(
            inner.unreliable.load(Ordering::Acquire),
            inner.reorder_replies.load(Ordering::Acquire),
        );
        let (tx, rx) = oneshot::channel();

        match self.net.route(&self.name) {
            Some(server) => {
                debug!("{} -> {} {}", self.name, server.name(), method);
                inner.pool.spawn_ok(async move {
                    let _ = tx.send(carry(server, method, buf, plan).await);
                });
            }
            None => {
                // nothing on the other end, or the link is down: stall
                // a little, then report the call lost
                let stall =
                    Duration::from_millis(thread_rng().gen::<u64>() % UNREACHABLE_STALL_MS);
                inner.pool.spawn_ok(async move {
                    Delay::new(stall).await;
                    let _ = tx.send(Err(RpcError::Lost));
                });
            }
        }

        Box::pin(async move {
            match rx.await {
                Ok(Ok(bytes)) => {
                    simcodec::decode(&bytes).map_err(|e| RpcError::Codec(e.to_string()))
                }
                Ok(Err(e)) => Err(e),
                // the network itself is gone
                Err(_) => Err(RpcError::Dead),
            }
        })
    }
}

/// Walks one call through its fault plan and the server's handler.
async fn carry(
    server: Server,
    method: &'static str,
    req: Vec<u8>,
    plan: FaultPlan,
) -> Result<Vec<u8>> {
    Delay::new(plan.request_delay).await;
    if plan.drop_request {
        return Err(RpcError::Lost);
    }
    if server.retired() {
        return Err(RpcError::Dead);
    }
    server.inner.handled.fetch_add(1, Ordering::Relaxed);

    // Race the handler against retirement: a reply from a superseded
    // incarnation must never reach the caller.
    let mut handler = server.inner.handler.handle(method, &req);
    let outcome = loop {
        let tick = Delay::new(Duration::from_millis(RETIRE_TICK_MS));
        match future::select(handler, tick).await {
            Either::Left((outcome, _)) => break outcome,
            Either::Right((_, rest)) => {
                if server.retired() {
                    return Err(RpcError::Dead);
                }
                handler = rest;
            }
        }
    };
    let reply = outcome?;

    if server.retired() {
        return Err(RpcError::Dead);
    }
    if plan.drop_reply {
        return Err(RpcError::Lost);
    }
    Delay::new(plan.reply_delay).await;
    Ok(reply)
}
