// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::unnecessary_lazy_evaluations)]
#![warn(missing_docs)]

//! A multi-process actor runtime: each actor is a real OS process reached
//! over a length-delimited, JSON-encoded TCP channel. A [`nursery`]
//! spawns and supervises child actors, a [`portal`] is the caller-side RPC
//! handle to one of them, [`pubsub`] multiplexes a single producer to many
//! topic-filtered subscribers, and the [`arbiter`] is the cluster's
//! name-to-address registry.

pub mod actor;
pub mod arbiter;
pub mod channel;
pub mod dispatch;
pub mod error;
pub mod ident;
pub mod nursery;
pub mod portal;
pub mod pubsub;
mod scope;
mod scope_registry;
mod shutdown;
pub mod wire;

pub use actor::{ActorConfig, ActorRuntime, ActorState, PeerTable};
pub use channel::Channel;
pub use dispatch::{Dispatcher, RemoteError, RpcOutcome};
pub use error::{BrooderError, ErrorLevel};
pub use ident::{ArbiterAddr, ListenAddr, Uid};
pub use nursery::{ActorHandle, ActorSpawner, Nursery};
pub use portal::{Portal, RunResult};
pub use pubsub::{PublisherRegistry, SubscriberCtx};
pub use scope::{Runtime, RuntimeScope, ScopeView, ROOT};
pub use shutdown::{ShutdownHandle, ShutdownStream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_display_includes_name_and_instance() {
        let uid = Uid::new("demo");
        let rendered = uid.to_string();
        assert!(rendered.starts_with("demo["));
    }
}
