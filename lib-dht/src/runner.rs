//! The owning thread: binds sockets (or an HTTP proxy client), drives
//! the single-threaded event loop, and exposes a thread-safe handle
//! other parts of an embedding application can call into without ever
//! touching the DHT's internal state directly (spec.md §3 "no locks are
//! taken on internal structures", §4.F).
//!
//! Grounded in the teacher's dedicated-thread-plus-channel pattern for
//! isolating actor-like state (`lib-consensus`/`lib-network` each spawn
//! a worker thread and talk to it through a channel); generalized here
//! to a `parking_lot`-guarded command queue plus a `Notify` wakeup,
//! since the engine thread runs its own `tokio` current-thread runtime
//! rather than blocking on a channel recv.

use crate::clock::{Clock, SystemClock};
use crate::config::{RunnerConfig, Transport};
use crate::crypto::{CryptoProvider, DefaultCryptoProvider, Identity};
use crate::dht::{Dht, ListenEvent, ListenHandle};
use crate::error::{ConfigError, DhtError};
use crate::id::IdHash;
use crate::proxy::ProxyClient;
use crate::secure::{verify_and_decrypt, PlainValue, SecureDht};
use crate::stats::{Stats, StatsSnapshot};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

type Reply<T> = std::sync::mpsc::Sender<T>;

enum Command {
    PutUnsigned { key: IdHash, data: Vec<u8>, user_type: String, ttl: Option<Duration>, reply: Reply<Result<u64, DhtError>> },
    PutSigned { key: IdHash, data: Vec<u8>, user_type: String, ttl: Option<Duration>, reply: Reply<Result<u64, DhtError>> },
    PutEncrypted { key: IdHash, data: Vec<u8>, user_type: String, recipient: IdHash, ttl: Option<Duration>, reply: Reply<Result<u64, DhtError>> },
    Get { key: IdHash, reply: Reply<Result<Vec<PlainValue>, DhtError>> },
    Listen { key: IdHash, reply: Reply<(ListenHandle, tokio::sync::mpsc::UnboundedReceiver<ListenEvent>)> },
    CancelListen { handle: ListenHandle },
    CancelPut { key: IdHash, value_id: u64 },
    Ping { addr: std::net::SocketAddr, reply: Reply<anyhow::Result<()>> },
    Stats { reply: Reply<StatsSnapshot> },
    Shutdown { reply: Reply<()> },
}

/// Thread-safe façade over a running DHT node. Every method enqueues a
/// command and blocks on a reply channel — callers are never handed a
/// reference into the engine thread's state.
#[derive(Clone)]
pub struct RunnerHandle {
    queue: Arc<Mutex<VecDeque<Command>>>,
    wake: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl RunnerHandle {
    fn push(&self, cmd: Command) {
        self.queue.lock().push_back(cmd);
        self.wake.notify_one();
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, DhtError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(DhtError::NotRunning);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.push(build(tx));
        rx.recv().map_err(|_| DhtError::NotRunning)
    }

    pub fn put_unsigned(&self, key: IdHash, data: Vec<u8>, user_type: impl Into<String>, ttl: Option<Duration>) -> Result<u64, DhtError> {
        let user_type = user_type.into();
        self.call(|reply| Command::PutUnsigned { key, data, user_type, ttl, reply })?
    }

    pub fn put_signed(&self, key: IdHash, data: Vec<u8>, user_type: impl Into<String>, ttl: Option<Duration>) -> Result<u64, DhtError> {
        let user_type = user_type.into();
        self.call(|reply| Command::PutSigned { key, data, user_type, ttl, reply })?
    }

    pub fn put_encrypted(&self, key: IdHash, data: Vec<u8>, user_type: impl Into<String>, recipient: IdHash, ttl: Option<Duration>) -> Result<u64, DhtError> {
        let user_type = user_type.into();
        self.call(|reply| Command::PutEncrypted { key, data, user_type, recipient, ttl, reply })?
    }

    pub fn get(&self, key: IdHash) -> Result<Vec<PlainValue>, DhtError> {
        self.call(|reply| Command::Get { key, reply })?
    }

    pub fn listen(&self, key: IdHash) -> Result<(ListenHandle, tokio::sync::mpsc::UnboundedReceiver<ListenEvent>), DhtError> {
        self.call(|reply| Command::Listen { key, reply })
    }

    pub fn cancel_listen(&self, handle: ListenHandle) {
        self.push(Command::CancelListen { handle });
    }

    /// Cancel a pending or already-stored put (spec.md §4.I). Fire and
    /// forget, like `cancel_listen` — there is nothing useful to reply
    /// with.
    pub fn cancel_put(&self, key: IdHash, value_id: u64) {
        self.push(Command::CancelPut { key, value_id });
    }

    pub fn ping(&self, addr: std::net::SocketAddr) -> Result<(), DhtError> {
        self.call(|reply| Command::Ping { addr, reply })?.map_err(|e| DhtError::ValueRejected { reason: e.to_string() })
    }

    pub fn stats(&self) -> Result<StatsSnapshot, DhtError> {
        self.call(|reply| Command::Stats { reply })
    }

    /// Idempotent graceful shutdown: flushes any permanent re-announce
    /// and persistence writes on the engine thread, then joins it.
    /// Calling this more than once is a no-op (spec.md §4.F).
    pub fn shutdown(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let (tx, rx) = std::sync::mpsc::channel();
            self.push(Command::Shutdown { reply: tx });
            let _ = rx.recv();
        }
    }
}

enum Engine {
    Direct(SecureDht),
    Proxy { client: ProxyClient, identity: Identity, crypto: Arc<dyn CryptoProvider> },
}

/// Owns the dedicated OS thread and its single-threaded `tokio` runtime.
/// Core state (`RoutingTable`, `Storage`, `SearchState`) lives entirely
/// on that thread; `RunnerHandle` is the only thing other threads ever
/// touch.
pub struct Runner {
    handle: RunnerHandle,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Runner {
    /// Spawn the engine thread and block until the node has bound its
    /// sockets (or validated its proxy URL) and is ready to accept
    /// commands — a misconfigured bind address is a startup-time error
    /// (spec.md §1), not a silent failure discovered on first use.
    pub fn run(own_id: IdHash, identity: Identity, config: RunnerConfig) -> Result<Self, ConfigError> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let wake = Arc::new(Notify::new());
        let running = Arc::new(AtomicBool::new(true));

        let handle = RunnerHandle { queue: queue.clone(), wake: wake.clone(), running: running.clone() };
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), ConfigError>>();

        let thread_queue = queue;
        let thread_wake = wake;
        let thread_running = running;

        let join = std::thread::Builder::new()
            .name("lib-dht-engine".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ConfigError::CryptoInit(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(engine_main(own_id, identity, config, thread_queue, thread_wake, thread_running, ready_tx));
            })
            .expect("failed to spawn lib-dht engine thread");

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Runner { handle, join: Some(join) }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConfigError::CryptoInit("engine thread exited before signaling readiness".into())),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

async fn engine_main(
    own_id: IdHash,
    identity: Identity,
    config: RunnerConfig,
    queue: Arc<Mutex<VecDeque<Command>>>,
    wake: Arc<Notify>,
    running: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<Result<(), ConfigError>>,
) {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stats = Arc::new(Stats::default());

    let mut engine = match &config.transport {
        Transport::Udp { bind_v4, bind_v6 } => {
            match Dht::new(own_id, *bind_v4, *bind_v6, config.storage_byte_budget, clock.clone(), stats.clone()).await {
                Ok(dht) => {
                    let mut secure = SecureDht::new(dht, identity, crypto.clone());
                    if let Err(e) = secure.publish_identity().await {
                        info!(error = ?e, "no identity to publish (anonymous node)");
                    }
                    Engine::Direct(secure)
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(ConfigError::BindFailed {
                        port: bind_v4.port(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                    }));
                    return;
                }
            }
        }
        Transport::Proxy { proxy_url } => match ProxyClient::new(proxy_url.clone()) {
            Ok(client) => Engine::Proxy { client, identity, crypto: crypto.clone() },
            Err(e) => {
                let _ = ready_tx.send(Err(ConfigError::InvalidAddress(e.to_string())));
                return;
            }
        },
    };

    if let Engine::Direct(secure) = &mut engine {
        if let Some(path) = &config.persist_path {
            restore_persisted_state(secure, path);
        }
        secure.dht_mut().bootstrap(&config.bootstrap).await.ok();
    }

    let _ = ready_tx.send(Ok(()));

    let mut periodic = tokio::time::interval(config.periodic_interval);
    periodic.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if !running.load(Ordering::Acquire) && queue.lock().is_empty() {
            break;
        }

        tokio::select! {
            _ = wake.notified() => {
                drain_commands(&queue, &mut engine).await;
            }
            _ = periodic.tick() => {
                if let Engine::Direct(secure) = &mut engine {
                    if let Err(e) = secure.dht_mut().periodic().await {
                        error!(error = ?e, "periodic maintenance tick failed");
                    }
                }
            }
            (from, msg) = recv_direct(&mut engine) => {
                if let Engine::Direct(secure) = &mut engine {
                    if let Err(e) = secure.dht_mut().dispatch(from, msg).await {
                        error!(error = ?e, "dispatch error");
                    }
                }
            }
        }

        drain_commands(&queue, &mut engine).await;
    }

    if let Engine::Direct(secure) = &mut engine {
        if let Some(path) = &config.persist_path {
            persist_state(secure, path);
        }
    }
}

/// Await the next datagram when running in direct mode; in proxy mode
/// there is no local socket to poll, so this future never resolves and
/// the `select!` arm simply never fires (the command queue and periodic
/// tick remain the only active branches).
async fn recv_direct(engine: &mut Engine) -> (std::net::SocketAddr, crate::wire::Message) {
    match engine {
        Engine::Direct(secure) => loop {
            match secure.dht_mut().recv_message().await {
                Ok(pair) => return pair,
                Err(_) => continue,
            }
        },
        Engine::Proxy { .. } => std::future::pending().await,
    }
}

async fn drain_commands(queue: &Arc<Mutex<VecDeque<Command>>>, engine: &mut Engine) {
    loop {
        let cmd = queue.lock().pop_front();
        let cmd = match cmd {
            Some(c) => c,
            None => break,
        };
        handle_command(cmd, engine).await;
    }
}

async fn handle_command(cmd: Command, engine: &mut Engine) {
    match cmd {
        Command::PutUnsigned { key, data, user_type, ttl, reply } => {
            let result = match engine {
                Engine::Direct(secure) => secure.put_unsigned(key, data, &user_type, ttl).await,
                Engine::Proxy { client, .. } => {
                    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
                    let mut value = Value::new(0, data, user_type, now);
                    let id = value.resolve_id();
                    client.put(key, &value, ttl).await.map(|()| id)
                }
            };
            let _ = reply.send(result);
        }
        Command::PutSigned { key, data, user_type, ttl, reply } => {
            let result = match engine {
                Engine::Direct(secure) => secure.put_signed(key, data, &user_type, ttl).await,
                Engine::Proxy { client, identity, crypto } => sign_and_put_via_proxy(client, identity, crypto.as_ref(), key, data, user_type, ttl).await,
            };
            let _ = reply.send(result);
        }
        Command::PutEncrypted { key, data, user_type, recipient, ttl, reply } => {
            let result = match engine {
                Engine::Direct(secure) => secure.put_encrypted(key, data, &user_type, recipient, ttl).await,
                Engine::Proxy { .. } => Err(DhtError::PermissionDenied { reason: "encrypted put over proxy transport is not supported".into() }),
            };
            let _ = reply.send(result);
        }
        Command::Get { key, reply } => {
            let result = match engine {
                Engine::Direct(secure) => secure.get(key).await,
                Engine::Proxy { client, identity, crypto } => match client.get(key).await {
                    Ok(raw) => verify_and_decrypt(key, raw, identity, crypto.as_ref(), false),
                    Err(e) => Err(e),
                },
            };
            let _ = reply.send(result);
        }
        Command::Listen { key, reply } => {
            let result = match engine {
                Engine::Direct(secure) => secure.listen(key),
                Engine::Proxy { client, .. } => {
                    let rx = client.listen(key);
                    (ListenHandle(0), rx)
                }
            };
            let _ = reply.send(result);
        }
        Command::CancelListen { handle } => {
            if let Engine::Direct(secure) = engine {
                secure.cancel_listen(handle);
            }
        }
        Command::CancelPut { key, value_id } => {
            if let Engine::Direct(secure) = engine {
                secure.cancel_put(key, value_id);
            }
        }
        Command::Ping { addr, reply } => {
            let result = match engine {
                Engine::Direct(secure) => secure.dht_mut().ping(addr).await,
                Engine::Proxy { .. } => Err(anyhow::anyhow!("ping is not meaningful over proxy transport")),
            };
            let _ = reply.send(result);
        }
        Command::Stats { reply } => {
            let snapshot = match engine {
                Engine::Direct(secure) => secure.dht().stats(),
                Engine::Proxy { .. } => StatsSnapshot::default(),
            };
            let _ = reply.send(snapshot);
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

async fn sign_and_put_via_proxy(
    client: &ProxyClient,
    identity: &Identity,
    crypto: &dyn CryptoProvider,
    key: IdHash,
    data: Vec<u8>,
    user_type: String,
    ttl: Option<Duration>,
) -> Result<u64, DhtError> {
    let private_key = identity.private_key.as_ref().ok_or_else(|| DhtError::PermissionDenied { reason: "no private key configured".into() })?;
    let public_key = identity.public_key().ok_or_else(|| DhtError::PermissionDenied { reason: "no certificate configured".into() })?;
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();

    let mut value = Value::new(0, data, user_type, now);
    let id = value.resolve_id();
    value.owner = Some(public_key);
    value.signature = Some(crypto.sign(private_key, &value.signable_bytes()));
    client.put(key, &value, ttl).await?;
    Ok(id)
}

fn restore_persisted_state(secure: &mut SecureDht, path: &PathBuf) {
    match crate::persist::load(path) {
        Ok(restored) => {
            let node_count = restored.nodes.len();
            let value_count = restored.values.len();
            if let Some(identity) = restored.identity {
                secure.set_identity(identity);
            }
            secure.dht_mut().restore_nodes(restored.nodes);
            secure.dht_mut().restore_values(restored.values);
            info!(path = %path.display(), node_count, value_count, "restored persisted state");
        }
        Err(e) => error!(path = %path.display(), error = %e, "failed to restore persisted state"),
    }
}

fn persist_state(secure: &mut SecureDht, path: &PathBuf) {
    if let Err(e) = crate::persist::require_parent_dir(path) {
        error!(error = %e, "not persisting state");
        return;
    }
    let nodes = secure.dht().snapshot_nodes();
    let values = secure.dht().snapshot_values();
    if let Err(e) = crate::persist::save(path, secure.identity(), &nodes, &values) {
        error!(path = %path.display(), error = %e, "failed to persist state");
    }
}
