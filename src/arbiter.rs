//! The arbiter registry protocol (§4.5).
//!
//! A well-known singleton actor that maps UIDs to listen addresses.
//! [`run_arbiter`] is the service side (run inside the actor whose listen
//! address equals the cluster's `arbiter_addr`); [`find_actor`] is the
//! caller-side client helper any actor uses to resolve a name.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::net::TcpListener;

use crate::{
    channel::{Channel, Inbound},
    error::{BrooderError, RegistryError, TransportError},
    ident::{ArbiterAddr, ListenAddr, Uid},
    portal::Portal,
};

/// The arbiter's live registry: `uid -> listen addresses`.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<Uid, Vec<ListenAddr>>,
}

impl Registry {
    fn register(&self, uid: Uid, addr: ListenAddr) {
        let mut addrs = self.entries.entry(uid.clone()).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
        tracing::debug!(uid = %uid, addr = %addr, "registered actor");
    }

    fn unregister(&self, uid: &Uid, addr: Option<ListenAddr>) {
        match addr {
            Some(addr) => {
                if let Some(mut addrs) = self.entries.get_mut(uid) {
                    addrs.retain(|a| a != &addr);
                }
            }
            None => {
                self.entries.remove(uid);
            }
        }
        tracing::debug!(uid = %uid, "unregistered actor");
    }

    fn find(&self, name: &str) -> Vec<ListenAddr> {
        self.entries
            .iter()
            .find(|e| e.key().name == name)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn dump(&self) -> Vec<(Uid, Vec<ListenAddr>)> {
        self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

/// Runs the arbiter's service loop: binds `bind_addr`, accepts connections,
/// and answers `register`/`unregister`/`find`/`get-registry` for the life of
/// the process. The registry starts with a single entry — the arbiter
/// itself — per §3.
pub async fn run_arbiter(bind_addr: ArbiterAddr, self_uid: Uid) -> Result<(), BrooderError> {
    let registry = std::sync::Arc::new(Registry::default());
    registry.register(self_uid.clone(), bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| BrooderError::Transport(TransportError::Io(e)))?;
    tracing::info!(addr = %bind_addr, "arbiter listening");

    loop {
        let (stream, peer) = listener.accept().await.map_err(TransportError::Io)?;
        let registry = registry.clone();
        let self_uid = self_uid.clone();
        tokio::spawn(async move {
            let (channel, mut inbound) = match Channel::handshake(stream, self_uid).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "handshake with prospective registrant failed");
                    return;
                }
            };
            let mut registered_uid: Option<Uid> = None;
            while let Some(msg) = inbound.recv().await {
                match msg {
                    Inbound::Register { uid, addr } => {
                        registry.register(uid.clone(), addr);
                        registered_uid = Some(uid);
                    }
                    Inbound::Unregister { uid, addr } => registry.unregister(&uid, addr),
                    Inbound::Find { name } => channel.reply_find_result(registry.find(&name)),
                    Inbound::RegistryDump => channel.reply_registry_dump(registry.dump()),
                    Inbound::CancelActor | Inbound::Call { .. } => {
                        tracing::warn!("arbiter received a non-registry message; ignoring");
                    }
                }
            }
            // Closure is the unregister signal (§4.1): no explicit RPC required.
            if let Some(uid) = registered_uid {
                registry.unregister(&uid, None);
            }
        });
    }
}

/// Opens a transient channel to the arbiter, asks for addresses registered
/// under `name`, and returns a portal to the first reachable one.
pub async fn find_actor(arbiter_addr: ArbiterAddr, caller_uid: Uid, name: &str) -> Result<Portal, BrooderError> {
    let (channel, _inbound) = Channel::connect(arbiter_addr, caller_uid.clone())
        .await
        .map_err(RegistryError::Transport)?;
    let addrs = channel.request_find(name).await.map_err(RegistryError::Transport)?;
    let addr = addrs
        .first()
        .copied()
        .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
    let (peer_channel, inbound) = Channel::connect(addr, caller_uid)
        .await
        .map_err(RegistryError::Transport)?;
    Ok(Portal::new(peer_channel, inbound))
}

/// Dumps the full registry from the arbiter — test/diagnostic use (§4.5, §8).
pub async fn get_registry(arbiter_addr: ArbiterAddr, caller_uid: Uid) -> Result<HashMap<Uid, Vec<ListenAddr>>, BrooderError> {
    let (channel, _inbound) = Channel::connect(arbiter_addr, caller_uid)
        .await
        .map_err(RegistryError::Transport)?;
    let entries = channel.request_registry_dump().await.map_err(RegistryError::Transport)?;
    Ok(entries.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ListenAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn find_returns_every_address_registered_under_a_name() {
        let registry = Registry::default();
        let uid = Uid::new("worker");
        registry.register(uid.clone(), addr(9001));
        registry.register(uid, addr(9002));

        let mut found = registry.find("worker");
        found.sort();
        assert_eq!(found, vec![addr(9001), addr(9002)]);
        assert!(registry.find("nobody").is_empty());
    }

    #[test]
    fn registering_the_same_address_twice_does_not_duplicate_it() {
        let registry = Registry::default();
        let uid = Uid::new("worker");
        registry.register(uid.clone(), addr(9001));
        registry.register(uid, addr(9001));
        assert_eq!(registry.find("worker"), vec![addr(9001)]);
    }

    #[test]
    fn unregistering_one_address_leaves_the_others() {
        let registry = Registry::default();
        let uid = Uid::new("worker");
        registry.register(uid.clone(), addr(9001));
        registry.register(uid.clone(), addr(9002));

        registry.unregister(&uid, Some(addr(9001)));
        assert_eq!(registry.find("worker"), vec![addr(9002)]);
    }

    #[test]
    fn unregistering_without_an_address_drops_the_whole_entry() {
        let registry = Registry::default();
        let uid = Uid::new("worker");
        registry.register(uid.clone(), addr(9001));

        registry.unregister(&uid, None);
        assert!(registry.find("worker").is_empty());
        assert!(registry.dump().is_empty());
    }
}
