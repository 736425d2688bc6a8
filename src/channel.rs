//! The channel: a live, bidirectional, demultiplexed connection to one peer.
//!
//! §9 ("Cyclic lifetimes") resolves the portal/channel/actor cycle by making
//! the channel the sole owner of the transport; this module is that owner.
//! A [`Channel`] is backed by a writer task draining an outbound queue and a
//! reader task demultiplexing inbound frames: replies to calls *we* issued
//! are routed to the matching [`PendingCall`] and never surface to callers;
//! everything else (an incoming `rpc-call`, `cancel-actor`, or registry
//! message) is forwarded on an [`Inbound`] stream for the owning actor to
//! handle.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::codec::Framed;

use crate::{
    error::TransportError,
    ident::{ListenAddr, Uid},
    wire::{codec::MessageCodec, CallId, RemoteErrorInfo, WireMessage},
};

/// A streamed reply's in-flight events, as routed from `rpc-yield`/`rpc-stop`/`rpc-error`.
#[derive(Debug)]
pub enum StreamEvent {
    Yield(Value),
    Stop,
    Error(RemoteErrorInfo),
}

enum PendingCall {
    Single(oneshot::Sender<Result<Value, RemoteErrorInfo>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

/// The reply to a registry-protocol request (§4.5), routed out-of-band from
/// the `cid`-keyed RPC machinery since `find`/`get-registry` carry no `cid`.
#[derive(Debug)]
pub enum RegistryReply {
    Find(Vec<ListenAddr>),
    Dump(Vec<(Uid, Vec<ListenAddr>)>),
}

/// A message arriving on a channel that is addressed to the local actor
/// rather than a reply to an outstanding call.
#[derive(Debug)]
pub enum Inbound {
    /// An incoming RPC invocation to dispatch and answer.
    Call {
        cid: CallId,
        module: String,
        function: String,
        kwargs: Value,
    },
    /// A graceful cancellation request for the whole actor.
    CancelActor,
    /// Arbiter-bound: register `addr` under `uid`.
    Register { uid: Uid, addr: ListenAddr },
    /// Arbiter-bound: remove `addr` (or all addresses) for `uid`.
    Unregister { uid: Uid, addr: Option<ListenAddr> },
    /// Arbiter-bound: look up addresses for the first UID named `name`.
    Find { name: String },
    /// Arbiter-bound: dump the full registry (test/diagnostic use, §4.5).
    RegistryDump,
}

/// A live, bidirectional channel to one peer. Cheaply cloneable; every clone
/// shares the same outbound queue and pending-call table.
#[derive(Clone)]
pub struct Channel {
    peer_uid: Uid,
    outbound: mpsc::UnboundedSender<WireMessage>,
    pending: Arc<DashMap<CallId, PendingCall>>,
    registry_waiter: Arc<Mutex<Option<oneshot::Sender<RegistryReply>>>>,
    closed: Arc<AtomicBool>,
    tasks: Arc<[tokio::task::AbortHandle; 2]>,
}

impl Channel {
    /// Connects to `addr` as a client and performs the UID handshake.
    pub async fn connect(addr: ListenAddr, local_uid: Uid) -> Result<(Channel, mpsc::UnboundedReceiver<Inbound>), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream, local_uid).await
    }

    /// Wraps an already-accepted stream and performs the UID handshake.
    pub async fn handshake(
        stream: TcpStream,
        local_uid: Uid,
    ) -> Result<(Channel, mpsc::UnboundedReceiver<Inbound>), TransportError> {
        let mut framed = Framed::new(stream, MessageCodec::default());
        framed.send(WireMessage::Handshake { uid: local_uid }).await?;
        let peer_uid = match framed.next().await {
            Some(Ok(WireMessage::Handshake { uid })) => uid,
            Some(Ok(_)) => return Err(TransportError::UnexpectedMessage),
            Some(Err(e)) => return Err(e),
            None => return Err(TransportError::HandshakeFailed),
        };

        let (mut sink, mut stream) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let pending: Arc<DashMap<CallId, PendingCall>> = Arc::new(DashMap::new());
        let registry_waiter: Arc<Mutex<Option<oneshot::Sender<RegistryReply>>>> = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_task = tokio::spawn({
            let pending = pending.clone();
            let registry_waiter = registry_waiter.clone();
            let closed = closed.clone();
            async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(msg) => route_inbound(msg, &pending, &registry_waiter, &inbound_tx).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "channel read error, closing");
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::Release);
                // Fail every call still awaiting a reply with ChannelClosed (§7).
                let stale: Vec<CallId> = pending.iter().map(|e| *e.key()).collect();
                for cid in stale {
                    if let Some((_, call)) = pending.remove(&cid) {
                        match call {
                            PendingCall::Single(tx) => {
                                let _ = tx.send(Err(RemoteErrorInfo {
                                    kind: "ChannelClosed".into(),
                                    message: "peer closed the channel".into(),
                                    traceback: String::new(),
                                }));
                            }
                            PendingCall::Stream(tx) => {
                                let _ = tx.send(StreamEvent::Error(RemoteErrorInfo {
                                    kind: "ChannelClosed".into(),
                                    message: "peer closed the channel".into(),
                                    traceback: String::new(),
                                }));
                            }
                        }
                    }
                }
            }
        });

        Ok((
            Channel {
                peer_uid,
                outbound: outbound_tx,
                pending,
                registry_waiter,
                closed,
                tasks: Arc::new([writer_task.abort_handle(), reader_task.abort_handle()]),
            },
            inbound_rx,
        ))
    }

    /// Closes the channel locally without notifying the remote side: stops
    /// the reader/writer tasks and marks the channel closed (§4.2 "close").
    pub fn close(&self) {
        for task in self.tasks.iter() {
            task.abort();
        }
        self.closed.store(true, Ordering::Release);
    }

    /// The UID of the peer at the other end of this channel.
    pub fn peer_uid(&self) -> &Uid {
        &self.peer_uid
    }

    /// Whether the underlying transport has observed a close.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }

    /// Sends a raw [`WireMessage`] without tracking a reply.
    pub fn send(&self, msg: WireMessage) -> Result<(), TransportError> {
        self.outbound.send(msg).map_err(|_| TransportError::HandshakeFailed)
    }

    /// Issues `rpc-call{module, function, kwargs}` expecting a single
    /// terminal value, returning a receiver for the reply.
    pub fn call_single(
        &self,
        cid: CallId,
        module: impl Into<String>,
        function: impl Into<String>,
        kwargs: Value,
    ) -> oneshot::Receiver<Result<Value, RemoteErrorInfo>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(cid, PendingCall::Single(tx));
        let _ = self.send(WireMessage::RpcCall {
            cid,
            module: module.into(),
            function: function.into(),
            kwargs,
        });
        rx
    }

    /// Issues `rpc-call{module, function, kwargs}` expecting a stream of
    /// `rpc-yield`s terminated by `rpc-stop`.
    pub fn call_stream(
        &self,
        cid: CallId,
        module: impl Into<String>,
        function: impl Into<String>,
        kwargs: Value,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(cid, PendingCall::Stream(tx));
        let _ = self.send(WireMessage::RpcCall {
            cid,
            module: module.into(),
            function: function.into(),
            kwargs,
        });
        rx
    }

    /// Replies to an inbound call with its terminal value.
    pub fn reply_return(&self, cid: CallId, value: Value) {
        let _ = self.send(WireMessage::RpcReturn { cid, value });
    }

    /// Replies to an inbound call with one streamed item.
    pub fn reply_yield(&self, cid: CallId, value: Value) {
        let _ = self.send(WireMessage::RpcYield { cid, value });
    }

    /// Terminates a streamed reply.
    pub fn reply_stop(&self, cid: CallId) {
        let _ = self.send(WireMessage::RpcStop { cid });
    }

    /// Replies to an inbound call with a structured error.
    pub fn reply_error(&self, cid: CallId, error: RemoteErrorInfo) {
        let _ = self.send(WireMessage::RpcError { cid, error });
    }

    /// Sends `find{name}` and awaits the matching `find-result`. Used by
    /// `find_actor` on a transient channel to the arbiter (§4.1).
    pub async fn request_find(&self, name: impl Into<String>) -> Result<Vec<ListenAddr>, TransportError> {
        let (tx, rx) = oneshot::channel();
        *self.registry_waiter.lock().await = Some(tx);
        self.send(WireMessage::Find { name: name.into() })?;
        match rx.await.map_err(|_| TransportError::HandshakeFailed)? {
            RegistryReply::Find(addrs) => Ok(addrs),
            RegistryReply::Dump(_) => Err(TransportError::UnexpectedMessage),
        }
    }

    /// Sends `get-registry` and awaits the dump. Test/diagnostic use (§4.5).
    pub async fn request_registry_dump(&self) -> Result<Vec<(Uid, Vec<ListenAddr>)>, TransportError> {
        let (tx, rx) = oneshot::channel();
        *self.registry_waiter.lock().await = Some(tx);
        self.send(WireMessage::GetRegistry)?;
        match rx.await.map_err(|_| TransportError::HandshakeFailed)? {
            RegistryReply::Dump(entries) => Ok(entries),
            RegistryReply::Find(_) => Err(TransportError::UnexpectedMessage),
        }
    }

    /// Replies to a `find` request.
    pub fn reply_find_result(&self, addrs: Vec<ListenAddr>) {
        let _ = self.send(WireMessage::FindResult { addrs });
    }

    /// Replies to a `get-registry` request.
    pub fn reply_registry_dump(&self, entries: Vec<(Uid, Vec<ListenAddr>)>) {
        let _ = self.send(WireMessage::RegistryDump { entries });
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer_uid", &self.peer_uid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn route_inbound(
    msg: WireMessage,
    pending: &DashMap<CallId, PendingCall>,
    registry_waiter: &Mutex<Option<oneshot::Sender<RegistryReply>>>,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
) {
    match msg {
        WireMessage::Handshake { .. } => {
            tracing::warn!("received a second handshake after channel setup; ignoring");
        }
        WireMessage::RpcReturn { cid, value } => {
            if let Some((_, PendingCall::Single(tx))) = pending.remove(&cid) {
                let _ = tx.send(Ok(value));
            }
        }
        WireMessage::RpcError { cid, error } => match pending.remove(&cid) {
            Some((_, PendingCall::Single(tx))) => {
                let _ = tx.send(Err(error));
            }
            Some((_, PendingCall::Stream(tx))) => {
                let _ = tx.send(StreamEvent::Error(error));
            }
            None => {}
        },
        WireMessage::RpcYield { cid, value } => {
            if let Some(entry) = pending.get(&cid) {
                if let PendingCall::Stream(tx) = entry.value() {
                    let _ = tx.send(StreamEvent::Yield(value));
                }
            }
        }
        WireMessage::RpcStop { cid } => {
            if let Some((_, PendingCall::Stream(tx))) = pending.remove(&cid) {
                let _ = tx.send(StreamEvent::Stop);
            }
        }
        WireMessage::RpcCall { cid, module, function, kwargs } => {
            let _ = inbound_tx.send(Inbound::Call { cid, module, function, kwargs });
        }
        WireMessage::CancelActor => {
            let _ = inbound_tx.send(Inbound::CancelActor);
        }
        WireMessage::Register { uid, addr } => {
            let _ = inbound_tx.send(Inbound::Register { uid, addr });
        }
        WireMessage::Unregister { uid, addr } => {
            let _ = inbound_tx.send(Inbound::Unregister { uid, addr });
        }
        WireMessage::Find { name } => {
            let _ = inbound_tx.send(Inbound::Find { name });
        }
        WireMessage::FindResult { addrs } => {
            if let Some(tx) = registry_waiter.lock().await.take() {
                let _ = tx.send(RegistryReply::Find(addrs));
            } else {
                tracing::warn!("received an unsolicited find-result; ignoring");
            }
        }
        WireMessage::GetRegistry => {
            let _ = inbound_tx.send(Inbound::RegistryDump);
        }
        WireMessage::RegistryDump { entries } => {
            if let Some(tx) = registry_waiter.lock().await.take() {
                let _ = tx.send(RegistryReply::Dump(entries));
            } else {
                tracing::warn!("received an unsolicited registry-dump; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::ident::Uid;

    #[tokio::test]
    async fn a_call_reaches_its_handler_and_the_reply_reaches_the_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (server, mut inbound) = Channel::handshake(stream, Uid::new("server")).await.unwrap();
            match inbound.recv().await.unwrap() {
                Inbound::Call { cid, module, function, .. } => {
                    assert_eq!(module, "greet");
                    assert_eq!(function, "hi");
                    server.reply_return(cid, serde_json::json!("hello"));
                }
                other => panic!("expected Inbound::Call, got {other:?}"),
            }
        });

        let (client, _inbound) = Channel::connect(addr, Uid::new("client")).await.unwrap();
        assert_eq!(client.peer_uid().name, "server");

        let cid = uuid::Uuid::new_v4();
        let rx = client.call_single(cid, "greet", "hi", serde_json::json!({}));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply, serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn a_closed_channel_fails_its_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Accept the handshake, then drop the connection without replying.
            let (server, _inbound) = Channel::handshake(stream, Uid::new("server")).await.unwrap();
            server.close();
        });

        let (client, _inbound) = Channel::connect(addr, Uid::new("client")).await.unwrap();
        let cid = uuid::Uuid::new_v4();
        let rx = client.call_single(cid, "greet", "hi", serde_json::json!({}));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind, "ChannelClosed");
    }
}
