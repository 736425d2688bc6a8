//! The portal (§4.2): the caller-side handle bound to one channel.
//!
//! Per §9's "Cyclic lifetimes" note, the portal holds a non-owning handle —
//! cloning [`Channel`] is cheap and doesn't extend its lifetime beyond the
//! owning actor's peer table (or, for a transient arbiter lookup, beyond the
//! portal itself, which is the channel's only owner in that case).

use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    channel::{Channel, Inbound, StreamEvent},
    error::PortalError,
    wire::RemoteErrorInfo,
};

impl From<RemoteErrorInfo> for PortalError {
    fn from(e: RemoteErrorInfo) -> Self {
        PortalError::RemoteError {
            kind: e.kind,
            message: e.message,
            traceback: e.traceback,
        }
    }
}

/// The outcome of `run`/`result`: either a single terminal value or a
/// sequence of streamed ones (§9 "Generators as results").
pub enum RunResult {
    Single(Value),
    Stream(mpsc::UnboundedReceiver<StreamEvent>),
}

impl RunResult {
    /// Expects [`RunResult::Single`], deserializing it to `T`.
    pub fn into_single<T: DeserializeOwned>(self) -> Result<T, PortalError> {
        match self {
            RunResult::Single(v) => serde_json::from_value(v).map_err(|_| PortalError::NoPendingResult),
            RunResult::Stream(_) => Err(PortalError::NoPendingResult),
        }
    }

    /// Expects [`RunResult::Stream`], adapting it into a plain item stream
    /// that yields `Err(RemoteError)` once and ends on an error frame.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, PortalError>> + Unpin {
        match self {
            RunResult::Stream(rx) => StreamWrapper::Real(rx),
            RunResult::Single(v) => StreamWrapper::Single(Some(v)),
        }
    }
}

enum StreamWrapper {
    Real(mpsc::UnboundedReceiver<StreamEvent>),
    Single(Option<Value>),
}

impl Stream for StreamWrapper {
    type Item = Result<Value, PortalError>;

    fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        let me = self.get_mut();
        match me {
            StreamWrapper::Single(v) => std::task::Poll::Ready(v.take().map(Ok)),
            StreamWrapper::Real(rx) => match rx.poll_recv(cx) {
                std::task::Poll::Ready(Some(StreamEvent::Yield(v))) => std::task::Poll::Ready(Some(Ok(v))),
                std::task::Poll::Ready(Some(StreamEvent::Stop)) | std::task::Poll::Ready(None) => std::task::Poll::Ready(None),
                std::task::Poll::Ready(Some(StreamEvent::Error(e))) => std::task::Poll::Ready(Some(Err(e.into()))),
                std::task::Poll::Pending => std::task::Poll::Pending,
            },
        }
    }
}

/// A pending submission recorded by `_submit_for_result`, awaited later by
/// `result()`.
enum Pending {
    Single(tokio::sync::oneshot::Receiver<Result<Value, crate::wire::RemoteErrorInfo>>),
    Stream(mpsc::UnboundedReceiver<StreamEvent>),
}

/// The caller-side RPC handle over one channel.
pub struct Portal {
    channel: Channel,
    pending: Option<Pending>,
    /// Kept alive so the channel's reader task's sends don't silently fail;
    /// a portal doesn't otherwise act on unsolicited inbound traffic.
    _inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl Portal {
    pub(crate) fn new(channel: Channel, inbound: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self {
            channel,
            pending: None,
            _inbound: inbound,
        }
    }

    /// The UID of the actor this portal is bound to.
    pub fn peer_uid(&self) -> &crate::ident::Uid {
        self.channel.peer_uid()
    }

    /// Invokes `module::function(kwargs)` remotely and awaits its outcome
    /// (§4.2). The result is `Single` unless the remote function is a
    /// streaming generator, in which case it is `Stream`.
    pub async fn run(&self, module: &str, function: &str, kwargs: impl Serialize) -> Result<RunResult, PortalError> {
        let kwargs = serde_json::to_value(kwargs).map_err(|_| PortalError::NoPendingResult)?;
        self.run_value(module, function, kwargs).await
    }

    /// As [`Portal::run`], but with kwargs already encoded as a JSON value.
    pub async fn run_value(&self, module: &str, function: &str, kwargs: Value) -> Result<RunResult, PortalError> {
        if self.channel.is_closed() {
            return Err(PortalError::ChannelClosed);
        }
        let cid = Uuid::new_v4();
        let rx = self.channel.call_single(cid, module, function, kwargs);
        match rx.await {
            Ok(Ok(v)) => Ok(RunResult::Single(v)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PortalError::ChannelClosed),
        }
    }

    /// As [`Portal::run`], but for functions known to stream their result.
    pub async fn run_streaming(&self, module: &str, function: &str, kwargs: impl Serialize) -> Result<RunResult, PortalError> {
        let kwargs = serde_json::to_value(kwargs).map_err(|_| PortalError::NoPendingResult)?;
        if self.channel.is_closed() {
            return Err(PortalError::ChannelClosed);
        }
        let cid = Uuid::new_v4();
        Ok(RunResult::Stream(self.channel.call_stream(cid, module, function, kwargs)))
    }

    /// Non-blocking variant: submits the call and records the pending call,
    /// to be awaited later with [`Portal::result`]. Used by
    /// `Nursery::run_in_actor`.
    pub fn submit_for_result(&mut self, module: &str, function: &str, kwargs: impl Serialize, streaming: bool) -> Result<(), PortalError> {
        if self.channel.is_closed() {
            return Err(PortalError::ChannelClosed);
        }
        let kwargs = serde_json::to_value(kwargs).map_err(|_| PortalError::NoPendingResult)?;
        let cid = Uuid::new_v4();
        self.pending = Some(if streaming {
            Pending::Stream(self.channel.call_stream(cid, module, function, kwargs))
        } else {
            Pending::Single(self.channel.call_single(cid, module, function, kwargs))
        });
        Ok(())
    }

    /// Awaits the pending submission recorded by [`Portal::submit_for_result`].
    pub async fn result(&mut self) -> Result<RunResult, PortalError> {
        match self.pending.take() {
            Some(Pending::Single(rx)) => match rx.await {
                Ok(Ok(v)) => Ok(RunResult::Single(v)),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(PortalError::ChannelClosed),
            },
            Some(Pending::Stream(rx)) => Ok(RunResult::Stream(rx)),
            None => Err(PortalError::NoPendingResult),
        }
    }

    /// Whether a result has been submitted but not yet awaited.
    pub fn has_pending_result(&self) -> bool {
        self.pending.is_some()
    }

    /// Sends a graceful cancel directive and waits, up to `grace`, for the
    /// channel to close (§4.2, §5).
    pub async fn cancel_actor(&self, grace: Duration) -> Result<(), PortalError> {
        if self.channel.is_closed() {
            return Ok(());
        }
        self.channel.send(crate::wire::WireMessage::CancelActor)?;
        let deadline = tokio::time::Instant::now() + grace;
        while !self.channel.is_closed() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Closes the channel without notifying the remote side (§4.2).
    pub fn close(&self) {
        self.channel.close();
    }

    /// Whether the bound channel has observed a close (§3 "Portal").
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::ident::Uid;

    async fn connected_pair() -> (Portal, Channel, mpsc::UnboundedReceiver<Inbound>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Channel::handshake(stream, Uid::new("server")).await.unwrap()
        });
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (client_channel, client_inbound) = Channel::handshake(client_stream, Uid::new("client")).await.unwrap();
        let (server_channel, server_inbound) = accept.await.unwrap();
        (Portal::new(client_channel, client_inbound), server_channel, server_inbound)
    }

    #[tokio::test]
    async fn run_value_returns_the_single_reply() {
        let (portal, server, mut server_inbound) = connected_pair().await;
        tokio::spawn(async move {
            match server_inbound.recv().await.unwrap() {
                Inbound::Call { cid, .. } => server.reply_return(cid, serde_json::json!(42)),
                other => panic!("expected Inbound::Call, got {other:?}"),
            }
        });

        let result = portal.run_value("math", "answer", serde_json::json!({})).await.unwrap();
        let value: i64 = result.into_single().unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn run_streaming_yields_every_item_then_stops() {
        let (portal, server, mut server_inbound) = connected_pair().await;
        tokio::spawn(async move {
            match server_inbound.recv().await.unwrap() {
                Inbound::Call { cid, .. } => {
                    for i in 0..3 {
                        server.reply_yield(cid, serde_json::json!(i));
                    }
                    server.reply_stop(cid);
                }
                other => panic!("expected Inbound::Call, got {other:?}"),
            }
        });

        let result = portal.run_streaming("counter", "count_up", serde_json::json!({})).await.unwrap();
        let items: Vec<_> = result.into_stream().map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
    }

    #[tokio::test]
    async fn a_remote_error_surfaces_from_run_value() {
        let (portal, server, mut server_inbound) = connected_pair().await;
        tokio::spawn(async move {
            match server_inbound.recv().await.unwrap() {
                Inbound::Call { cid, .. } => server.reply_error(
                    cid,
                    crate::wire::RemoteErrorInfo {
                        kind: "ZeroDivisionError".into(),
                        message: "division by zero".into(),
                        traceback: String::new(),
                    },
                ),
                other => panic!("expected Inbound::Call, got {other:?}"),
            }
        });

        let err = portal.run_value("math", "divide", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, PortalError::RemoteError { kind, .. } if kind == "ZeroDivisionError"));
    }

    #[tokio::test]
    async fn cancel_actor_returns_once_the_channel_closes() {
        let (portal, server, mut server_inbound) = connected_pair().await;
        tokio::spawn(async move {
            assert!(matches!(server_inbound.recv().await, Some(Inbound::CancelActor)));
            server.close();
        });

        portal.cancel_actor(Duration::from_secs(1)).await.unwrap();
        assert!(portal.is_closed());
    }
}
