//! The wire-level message taxonomy (§6) and its framing.
//!
//! Every message that crosses a channel is one variant of [`WireMessage`],
//! encoded with `serde_json` and framed with a four-byte length prefix
//! ([`tokio_util::codec::LengthDelimitedCodec`]). `RpcCall`'s `kwargs` and
//! `RpcYield`/`RpcReturn`'s `value` are themselves `serde_json::Value`, which
//! needs a self-describing format to deserialize; `serde_json` is also what
//! the teacher binary this is built from already reaches for.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ident::{ListenAddr, Uid};

/// Opaque call identifier, fresh per RPC invocation.
pub type CallId = uuid::Uuid;

/// A structured remote error, carried by `rpc-error`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteErrorInfo {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

/// Every message shape defined in §6's wire taxonomy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    /// Handshake exchanged on every new channel before any other message.
    Handshake { uid: Uid },

    /// Invoke `module::function(kwargs)` remotely.
    RpcCall {
        cid: CallId,
        module: String,
        function: String,
        kwargs: Value,
    },
    /// One item of a streamed result.
    RpcYield { cid: CallId, value: Value },
    /// The terminal, single-value result of a call.
    RpcReturn { cid: CallId, value: Value },
    /// Marks the end of a streamed result (no further `RpcYield` will follow).
    RpcStop { cid: CallId },
    /// The remote function raised; carries kind + message + traceback.
    RpcError { cid: CallId, error: RemoteErrorInfo },

    /// Graceful cancellation request, addressed to the whole actor (no cid).
    CancelActor,

    /// Registers `uid` at `addr` with the arbiter.
    Register { uid: Uid, addr: ListenAddr },
    /// Removes `addr` (or all addresses, if `addr` is `None`) for `uid`.
    Unregister { uid: Uid, addr: Option<ListenAddr> },
    /// Looks up any UID whose name matches.
    Find { name: String },
    /// Response to `Find`.
    FindResult { addrs: Vec<ListenAddr> },
    /// Requests a full registry dump (test/diagnostic use, §4.5).
    GetRegistry,
    /// Response to `GetRegistry`.
    RegistryDump {
        entries: Vec<(Uid, Vec<ListenAddr>)>,
    },
}

pub mod codec {
    //! Framing glue: a length-delimited codec over JSON-encoded
    //! [`super::WireMessage`] values.

    use bytes::{Buf, BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

    use super::WireMessage;
    use crate::error::TransportError;

    /// Encodes/decodes [`WireMessage`] frames over an underlying
    /// length-delimited byte stream.
    #[derive(Default)]
    pub struct MessageCodec {
        inner: LengthDelimitedCodec,
    }

    impl Encoder<WireMessage> for MessageCodec {
        type Error = TransportError;

        fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
            let payload = serde_json::to_vec(&item).map_err(TransportError::Encode)?;
            let mut framed = BytesMut::with_capacity(payload.len());
            framed.put_slice(&payload);
            self.inner
                .encode(framed.split().freeze(), dst)
                .map_err(TransportError::Io)
        }
    }

    impl Decoder for MessageCodec {
        type Item = WireMessage;
        type Error = TransportError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            match self.inner.decode(src)? {
                Some(mut frame) => {
                    let bytes = frame.copy_to_bytes(frame.remaining());
                    let msg = serde_json::from_slice(&bytes).map_err(TransportError::Decode)?;
                    Ok(Some(msg))
                }
                None => Ok(None),
            }
        }
    }

    impl From<std::io::Error> for TransportError {
        fn from(e: std::io::Error) -> Self {
            TransportError::Io(e)
        }
    }

    #[cfg(test)]
    mod tests {
        use bytes::BytesMut;

        use super::*;
        use crate::wire::{CallId, WireMessage};

        #[test]
        fn a_call_and_its_streamed_reply_survive_the_wire() {
            let mut codec = MessageCodec::default();
            let cid: CallId = uuid::Uuid::new_v4();

            let call = WireMessage::RpcCall {
                cid,
                module: "counter".into(),
                function: "count_up".into(),
                kwargs: serde_json::json!({}),
            };

            // A partial frame must not decode until the rest of it arrives.
            let mut full = BytesMut::new();
            codec.encode(call, &mut full).unwrap();
            let last_byte = full.split_off(full.len() - 1);
            assert!(codec.decode(&mut full).unwrap().is_none());
            full.unsplit(last_byte);

            match codec.decode(&mut full).unwrap().unwrap() {
                WireMessage::RpcCall { cid: got_cid, module, function, .. } => {
                    assert_eq!(got_cid, cid);
                    assert_eq!(module, "counter");
                    assert_eq!(function, "count_up");
                }
                other => panic!("expected RpcCall, got {other:?}"),
            }

            let yield_msg = WireMessage::RpcYield {
                cid,
                value: serde_json::json!(0),
            };
            let stop = WireMessage::RpcStop { cid };
            let mut buf = BytesMut::new();
            codec.encode(yield_msg, &mut buf).unwrap();
            codec.encode(stop, &mut buf).unwrap();

            match codec.decode(&mut buf).unwrap().unwrap() {
                WireMessage::RpcYield { cid: got_cid, value } => {
                    assert_eq!(got_cid, cid);
                    assert_eq!(value, serde_json::json!(0));
                }
                other => panic!("expected RpcYield, got {other:?}"),
            }
            match codec.decode(&mut buf).unwrap().unwrap() {
                WireMessage::RpcStop { cid: got_cid } => assert_eq!(got_cid, cid),
                other => panic!("expected RpcStop, got {other:?}"),
            }
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
    }
}
