//! The running actor process: registration, peer table, state space, and
//! the RPC serve loop (§4.1, §3 "Actor").
//!
//! This is the entry point a spawned child process's `main` calls into
//! (§6 "Spawn interface"). A parent that merely opens a nursery and never
//! accepts inbound RPCs of its own does not need this module directly —
//! [`crate::nursery::Nursery`] drives the peer table's pending-peer side on
//! its own — but any actor that wants to be `find_actor`-reachable, or that
//! itself spawns a nursery and expects children to connect back, runs it.

use std::sync::Arc;

use anymap::Map;
use dashmap::DashMap;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
};

use crate::{
    arbiter,
    channel::{Channel, Inbound},
    dispatch::Dispatcher,
    error::{BrooderError, TransportError},
    ident::{ArbiterAddr, ListenAddr, Uid},
    wire::RemoteErrorInfo,
};

/// Whether waiting for a peer's first channel is still open, or was
/// cancelled out from under the waiter (§4.3 "cancel").
enum PendingPeer {
    Waiting(watch::Sender<Option<Channel>>),
    Cancelled,
}

/// Per-actor table of currently connected peers plus pending-peer "first
/// channel established" events, keyed by the peer's UID (§3 "Actor").
///
/// Uses a `watch` channel rather than a one-shot so that both the task
/// driving `start_actor` and a later, concurrent `Nursery::cancel()` can
/// each hold their own receiver over the same event (§4.3's "wait on its
/// pending-peer event" from inside `cancel`, independent of whoever called
/// `start_actor`).
#[derive(Default)]
pub struct PeerTable {
    peers: DashMap<Uid, Channel>,
    pending: DashMap<Uid, PendingPeer>,
}

impl PeerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers interest in `uid`'s first channel, to be resolved by
    /// [`PeerTable::complete`] once the child connects back. Must be called
    /// *before* the corresponding process is started (§4.3 "start_actor").
    pub fn expect(&self, uid: Uid) -> watch::Receiver<Option<Channel>> {
        let (tx, rx) = watch::channel(None);
        self.pending.insert(uid, PendingPeer::Waiting(tx));
        rx
    }

    /// Marks a previously-`expect`ed peer as cancelled: dropping the sender
    /// makes every outstanding receiver's next `changed()` resolve to an
    /// error, which is how a waiter distinguishes "connected" from
    /// "cancelled before connecting".
    pub fn cancel_pending(&self, uid: &Uid) {
        if let Some(mut entry) = self.pending.get_mut(uid) {
            *entry = PendingPeer::Cancelled;
        }
    }

    /// Called by the accept loop once `channel`'s handshake completes:
    /// installs it in the peer table and fires the pending-peer event, if
    /// one was registered for this UID.
    fn complete(&self, channel: Channel) {
        let uid = channel.peer_uid().clone();
        if let Some((_, pending)) = self.pending.remove(&uid) {
            if let PendingPeer::Waiting(tx) = pending {
                let _ = tx.send(Some(channel.clone()));
            }
        }
        self.peers.insert(uid, channel);
    }

    /// The live channel to `uid`, if one is currently connected.
    pub fn get(&self, uid: &Uid) -> Option<Channel> {
        self.peers.get(uid).map(|e| e.value().clone())
    }

    pub fn remove(&self, uid: &Uid) {
        self.peers.remove(uid);
    }
}

/// The actor-local state space (§3, §9 "Global state"): owned by the running
/// actor and passed by reference into in-actor tasks. The pub/sub fan-out
/// anchors its per-slot bookkeeping here under a stable type key.
#[derive(Default)]
pub struct ActorState {
    slots: Mutex<Map<dyn anymap::any::Any + Send + Sync>>,
}

impl ActorState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Gets or creates the `T`-keyed entry in the state space.
    pub async fn get_or_insert_with<T, F>(&self, default: F) -> T
    where
        T: 'static + Clone + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut slots = self.slots.lock().await;
        slots.entry::<T>().or_insert_with(default).clone()
    }
}

/// Configuration an actor process is constructed from (§6 "Spawn
/// interface", §4.8 "Configuration").
#[derive(Clone, Debug)]
pub struct ActorConfig {
    pub name: String,
    pub bind_addr: ListenAddr,
    pub arbiter_addr: ArbiterAddr,
    /// Set when this actor was spawned by a nursery; `None` for the arbiter
    /// and any standalone root actor.
    pub parent_addr: Option<ListenAddr>,
    pub rpc_modules: Vec<String>,
    pub loglevel: tracing::Level,
}

/// A running actor: its identity, peer table, and state space, handed to
/// dispatched RPC handlers via `Arc` so they can reach back into it.
pub struct ActorRuntime {
    pub uid: Uid,
    pub config: ActorConfig,
    pub peers: Arc<PeerTable>,
    pub state: Arc<ActorState>,
}

/// A bound actor whose accept loop is running as a background task: the
/// handle a `demo`-style process keeps to open a nursery on its own
/// [`ActorRuntime`] before that loop has wound down.
pub struct BoundActor {
    pub runtime: Arc<ActorRuntime>,
    pub shutdown: crate::shutdown::ShutdownHandle,
    serve_task: tokio::task::JoinHandle<()>,
}

impl BoundActor {
    /// Requests a graceful shutdown of the accept loop.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Awaits the accept loop's exit.
    pub async fn join(self) {
        let _ = self.serve_task.await;
    }
}

/// Binds `config.bind_addr`, registers with the arbiter (unless this actor
/// *is* the arbiter), connects back to the parent if one was given, and
/// spawns the accept loop as a background task, returning immediately with
/// the now-usable [`ActorRuntime`] (§4.1). Used by callers — such as a
/// `demo` entry point — that need to open a [`crate::nursery::Nursery`] on
/// this actor's own runtime without waiting for it to be cancelled first.
pub async fn bootstrap_actor(config: ActorConfig, dispatcher: Dispatcher) -> Result<BoundActor, BrooderError> {
    let uid = Uid::new(config.name.clone());
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| BrooderError::Transport(TransportError::Io(e)))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| BrooderError::Transport(TransportError::Io(e)))?;

    let runtime = Arc::new(ActorRuntime {
        uid: uid.clone(),
        config: ActorConfig { bind_addr: bound_addr, ..config.clone() },
        peers: PeerTable::new(),
        state: ActorState::new(),
    });

    let (shutdown_stream, shutdown_handle) = crate::shutdown::ShutdownStream::new(tokio_stream::wrappers::TcpListenerStream::new(listener));

    if bound_addr != config.arbiter_addr {
        register_with_arbiter(&runtime).await?;
    }

    if let Some(parent_addr) = config.parent_addr {
        connect_to_parent(&runtime, parent_addr, dispatcher.clone(), shutdown_handle.clone()).await?;
    }

    tracing::info!(uid = %runtime.uid, addr = %bound_addr, "actor serving");
    let serve_task = tokio::spawn({
        let runtime = runtime.clone();
        let shutdown_handle = shutdown_handle.clone();
        async move { serve(runtime, dispatcher, shutdown_stream, shutdown_handle).await }
    });

    Ok(BoundActor { runtime, shutdown: shutdown_handle, serve_task })
}

/// Binds, registers, connects, and serves inbound connections until
/// cancelled (§4.1). Returns once a `cancel-actor` directive unwinds the
/// serve loop — the caller (the spawned process's `main`) exits after this
/// returns, which is what the parent's nursery observes as the child
/// terminating.
pub async fn run_actor(config: ActorConfig, dispatcher: Dispatcher) -> Result<Arc<ActorRuntime>, BrooderError> {
    let bound = bootstrap_actor(config, dispatcher).await?;
    let runtime = bound.runtime.clone();
    bound.join().await;
    Ok(runtime)
}

async fn register_with_arbiter(runtime: &Arc<ActorRuntime>) -> Result<(), BrooderError> {
    let (channel, mut inbound) = Channel::connect(runtime.config.arbiter_addr, runtime.uid.clone())
        .await
        .map_err(BrooderError::Transport)?;
    channel
        .send(crate::wire::WireMessage::Register {
            uid: runtime.uid.clone(),
            addr: runtime.config.bind_addr,
        })
        .map_err(BrooderError::Transport)?;
    // Keep the registration channel open for the life of the process; its
    // closure on exit is the arbiter's unregister signal (§4.1).
    tokio::spawn(async move { while inbound.recv().await.is_some() {} });
    Ok(())
}

/// Connects back to the parent that spawned this actor (§4.1 step 3). The
/// parent's nursery builds its portal to us over this very connection — our
/// side must answer its `rpc-call`/`cancel-actor` traffic the same way the
/// accept loop answers any other peer's (§4.3), not merely keep it open.
async fn connect_to_parent(
    runtime: &Arc<ActorRuntime>,
    parent_addr: ListenAddr,
    dispatcher: Dispatcher,
    shutdown_handle: crate::shutdown::ShutdownHandle,
) -> Result<(), BrooderError> {
    let (channel, inbound) = Channel::connect(parent_addr, runtime.uid.clone())
        .await
        .map_err(BrooderError::Transport)?;
    let runtime = runtime.clone();
    tokio::spawn(async move {
        serve_dispatch(&runtime, dispatcher, &channel, inbound, shutdown_handle).await;
    });
    Ok(())
}

async fn serve<S>(
    runtime: Arc<ActorRuntime>,
    dispatcher: Dispatcher,
    mut incoming: crate::shutdown::ShutdownStream<S>,
    shutdown_handle: crate::shutdown::ShutdownHandle,
) where
    S: futures::Stream<Item = std::io::Result<tokio::net::TcpStream>> + Unpin,
{
    use futures::StreamExt;
    while let Some(conn) = incoming.next().await {
        match conn {
            Ok(stream) => {
                let runtime = runtime.clone();
                let dispatcher = dispatcher.clone();
                let shutdown_handle = shutdown_handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_peer(runtime, dispatcher, stream, shutdown_handle).await {
                        tracing::warn!(error = %e, "peer connection ended with an error");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "accept error"),
        }
    }
}

async fn handle_peer(
    runtime: Arc<ActorRuntime>,
    dispatcher: Dispatcher,
    stream: tokio::net::TcpStream,
    shutdown_handle: crate::shutdown::ShutdownHandle,
) -> Result<(), TransportError> {
    let (channel, inbound) = Channel::handshake(stream, runtime.uid.clone()).await?;
    runtime.peers.complete(channel.clone());

    serve_dispatch(&runtime, dispatcher, &channel, inbound, shutdown_handle).await;

    runtime.peers.remove(channel.peer_uid());
    Ok(())
}

/// Drives one channel's `Inbound` traffic: resolves `rpc-call`s against
/// `dispatcher` and replies over `channel`, and unwinds the actor on
/// `cancel-actor` (§4.1 step 3, §4.3). Shared by the accept loop's per-peer
/// connections and by the child's connect-back to its parent, since the
/// parent issues exactly this `rpc-call`/`cancel-actor` traffic over that
/// connection too.
async fn serve_dispatch(
    runtime: &Arc<ActorRuntime>,
    dispatcher: Dispatcher,
    channel: &Channel,
    mut inbound: tokio::sync::mpsc::UnboundedReceiver<Inbound>,
    shutdown_handle: crate::shutdown::ShutdownHandle,
) {
    while let Some(msg) = inbound.recv().await {
        match msg {
            Inbound::Call { cid, module, function, kwargs } => {
                let channel = channel.clone();
                let allowed = runtime.config.rpc_modules.is_empty() || runtime.config.rpc_modules.iter().any(|m| m == &module);
                if !allowed {
                    channel.reply_error(
                        cid,
                        RemoteErrorInfo {
                            kind: "NotAllowed".into(),
                            message: format!("module {module:?} is not in this actor's allow-list"),
                            traceback: String::new(),
                        },
                    );
                    continue;
                }
                let handler = dispatcher.resolve(&module, &function);
                tokio::spawn(async move {
                    match handler {
                        Some(handler) => match handler(kwargs).await {
                            Ok(crate::dispatch::RpcOutcome::Single(value)) => channel.reply_return(cid, value),
                            Ok(crate::dispatch::RpcOutcome::Stream(mut stream)) => {
                                use futures::StreamExt;
                                while let Some(item) = stream.next().await {
                                    channel.reply_yield(cid, item);
                                }
                                channel.reply_stop(cid);
                            }
                            Err(e) => channel.reply_error(
                                cid,
                                RemoteErrorInfo {
                                    kind: e.kind,
                                    message: e.message,
                                    traceback: e.traceback,
                                },
                            ),
                        },
                        None => channel.reply_error(
                            cid,
                            RemoteErrorInfo {
                                kind: "NotFound".into(),
                                message: format!("no such function {module}::{function}"),
                                traceback: String::new(),
                            },
                        ),
                    }
                });
            }
            Inbound::CancelActor => {
                tracing::info!(uid = %runtime.uid, "received cancel-actor; unwinding");
                shutdown_handle.shutdown();
                channel.close();
                break;
            }
            Inbound::Register { .. } | Inbound::Unregister { .. } | Inbound::Find { .. } | Inbound::RegistryDump => {
                tracing::warn!("non-arbiter actor received a registry-protocol message; ignoring");
            }
        }
    }
}

/// Opens a channel to the arbiter and asks for addresses registered under
/// `name`, returning a portal to the first reachable one (§4.1 "find_actor").
pub async fn find_actor(runtime: &ActorRuntime, name: &str) -> Result<crate::portal::Portal, BrooderError> {
    arbiter::find_actor(runtime.config.arbiter_addr, runtime.uid.clone(), name).await
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[tokio::test]
    async fn complete_resolves_a_pending_expect() {
        let table = PeerTable::new();
        let uid = Uid::new("child");
        let mut rx = table.expect(uid.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Channel::handshake(stream, Uid::new("parent")).await.unwrap()
        });
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (_client_channel, _client_inbound) = Channel::handshake(client_stream, uid.clone()).await.unwrap();
        let (server_channel, _server_inbound) = accept.await.unwrap();

        // The server side's peer_uid is whatever the connecting client sent
        // as its own uid during the handshake — here, the "child" we're
        // waiting on — mirroring how `handle_peer`'s accept loop calls `complete`.
        table.complete(server_channel);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());
        assert!(table.get(&uid).is_some());
    }

    #[tokio::test]
    async fn cancel_pending_makes_the_waiter_see_none() {
        let table = PeerTable::new();
        let uid = Uid::new("child");
        let mut rx = table.expect(uid.clone());

        table.cancel_pending(&uid);
        drop(table);
        assert!(rx.changed().await.is_err());
    }

    #[tokio::test]
    async fn state_space_entries_are_keyed_by_type_and_created_once() {
        let state = ActorState::new();
        let first = state.get_or_insert_with(|| 7_i32).await;
        let second = state.get_or_insert_with(|| 99_i32).await;
        assert_eq!(first, 7);
        assert_eq!(second, 7);
    }
}
