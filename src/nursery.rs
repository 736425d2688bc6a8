//! The actor nursery (§4.3): a scoped supervisor over child actor processes.
//!
//! Each "actor" in this runtime is a whole OS process (§5), so the nursery's
//! job of tracking and tearing down its children is built on
//! [`tokio::process::Child`] rather than on in-process task handles. The
//! parent's [`crate::actor::PeerTable`] supplies the "child connected back"
//! event the teacher's original actor-spawning code got for free from a
//! shared address space.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    process::Command,
    sync::{mpsc, watch, Mutex},
};

use crate::{
    actor::{ActorRuntime, PeerTable},
    channel::Channel,
    error::{NurseryError, PortalError},
    ident::{ArbiterAddr, ListenAddr, Uid},
    portal::{Portal, RunResult},
};

/// Builds the `tokio::process::Command` used to spawn a child actor (§6
/// "Spawn interface"): every constructor argument the child needs crosses as
/// a CLI flag, since an OS process — unlike an in-process task — inherits no
/// closure.
#[derive(Clone, Debug)]
pub struct ActorSpawner {
    program: PathBuf,
    /// Arguments prepended before the actor flags, e.g. a subcommand name.
    base_args: Vec<String>,
}

impl ActorSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), base_args: Vec::new() }
    }

    /// The spawner that re-execs the current binary under its `actor`
    /// subcommand, the convention `bin/brooder-demo` follows.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self { program: std::env::current_exe()?, base_args: vec!["actor".into()] })
    }

    fn command(&self, spec: &ActorSpawnSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--name")
            .arg(&spec.name)
            .arg("--bind-addr")
            .arg(spec.bind_addr.to_string())
            .arg("--arbiter-addr")
            .arg(spec.arbiter_addr.to_string())
            .arg("--parent-addr")
            .arg(spec.parent_addr.to_string())
            .arg("--loglevel")
            .arg(spec.loglevel.to_string());
        if !spec.rpc_modules.is_empty() {
            cmd.arg("--rpc-modules").arg(spec.rpc_modules.join(","));
        }
        if !spec.statespace.is_null() {
            cmd.arg("--statespace").arg(spec.statespace.to_string());
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

struct ActorSpawnSpec {
    name: String,
    bind_addr: ListenAddr,
    arbiter_addr: ArbiterAddr,
    parent_addr: ListenAddr,
    rpc_modules: Vec<String>,
    statespace: Value,
    loglevel: tracing::Level,
}

/// A caller-facing, shareable handle to a nursery-spawned actor: the same
/// portal both the caller and the owning nursery act through, so the
/// nursery can harvest a `run_in_actor` result or send `cancel_actor` while
/// the caller independently calls `run`/`result` on it.
#[derive(Clone)]
pub struct ActorHandle {
    portal: Arc<Mutex<Portal>>,
}

impl ActorHandle {
    pub async fn peer_uid(&self) -> Uid {
        self.portal.lock().await.peer_uid().clone()
    }

    pub async fn run(&self, module: &str, function: &str, kwargs: impl Serialize) -> Result<RunResult, PortalError> {
        self.portal.lock().await.run(module, function, kwargs).await
    }

    pub async fn run_streaming(&self, module: &str, function: &str, kwargs: impl Serialize) -> Result<RunResult, PortalError> {
        self.portal.lock().await.run_streaming(module, function, kwargs).await
    }

    /// Awaits the result submitted by `Nursery::run_in_actor`.
    pub async fn result(&self) -> Result<RunResult, PortalError> {
        self.portal.lock().await.result().await
    }

    pub async fn has_pending_result(&self) -> bool {
        self.portal.lock().await.has_pending_result()
    }

    pub async fn is_closed(&self) -> bool {
        self.portal.lock().await.is_closed()
    }
}

enum ChildState {
    /// The process was started but hasn't connected back yet. Holds a clone
    /// of its pending-peer receiver so a concurrent `cancel()` can race the
    /// same event independently of whatever task called `start_actor`.
    PendingSpawn(watch::Receiver<Option<Channel>>),
    Connected {
        portal: Arc<Mutex<Portal>>,
        /// Set by `run_in_actor`: cancel this actor once its result is
        /// harvested at `wait()` time, even if the caller never awaits it.
        cancel_after_result: bool,
    },
}

struct ChildEntry {
    process: Mutex<tokio::process::Child>,
    state: Mutex<ChildState>,
}

/// Waits until either the pending-peer event resolves to a connected
/// channel, or its sender is dropped (cancelled before connecting).
async fn wait_for_peer(rx: &mut watch::Receiver<Option<Channel>>) -> Option<Channel> {
    loop {
        if let Some(channel) = rx.borrow().clone() {
            return Some(channel);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

/// A scoped supervisor over a set of child actor processes (§4.3).
///
/// Dropping a nursery does not, by itself, tear down its children — the
/// structured exit protocol in [`Nursery::close`] is the caller's
/// responsibility to invoke from the owning scope's unwind path, mirroring
/// the teacher's scope-exit contract for plain tasks.
pub struct Nursery {
    parent_addr: ListenAddr,
    arbiter_addr: ArbiterAddr,
    peers: Arc<PeerTable>,
    spawner: ActorSpawner,
    children: Arc<DashMap<Uid, ChildEntry>>,
    cancel_deadline: Duration,
    cancelled: AtomicBool,
}

impl Nursery {
    /// Opens a nursery anchored on `parent`'s peer table and listen address,
    /// so children spawned through it connect back to `parent`.
    pub fn open(parent: &ActorRuntime, spawner: ActorSpawner, cancel_deadline: Duration) -> Self {
        Self {
            parent_addr: parent.config.bind_addr,
            arbiter_addr: parent.config.arbiter_addr,
            peers: parent.peers.clone(),
            spawner,
            children: Arc::new(DashMap::new()),
            cancel_deadline,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Spawns a fresh actor process and blocks until it connects back,
    /// returning a handle to its portal (§4.3 "start_actor").
    pub async fn start_actor(
        &self,
        name: impl Into<String>,
        bind_addr: ListenAddr,
        rpc_modules: Vec<String>,
        statespace: Value,
        loglevel: tracing::Level,
    ) -> Result<ActorHandle, NurseryError> {
        let uid = Uid::new(name.into());
        let mut rx = self.peers.expect(uid.clone());

        let spec = ActorSpawnSpec {
            name: uid.name.clone(),
            bind_addr,
            arbiter_addr: self.arbiter_addr,
            parent_addr: self.parent_addr,
            rpc_modules,
            statespace,
            loglevel,
        };
        let process = self
            .spawner
            .command(&spec)
            .spawn()
            .map_err(|source| NurseryError::SpawnFailure { name: uid.name.clone(), source })?;

        self.children.insert(
            uid.clone(),
            ChildEntry { process: Mutex::new(process), state: Mutex::new(ChildState::PendingSpawn(rx.clone())) },
        );

        let channel = match wait_for_peer(&mut rx).await {
            Some(channel) => channel,
            None => {
                self.children.remove(&uid);
                return Err(NurseryError::TimeoutExceeded(format!("{uid} never connected back before being cancelled")));
            }
        };
        tracing::info!(uid = %uid, "actor connected back to nursery");

        let (_tx, dummy_inbound) = mpsc::unbounded_channel();
        let portal = Arc::new(Mutex::new(Portal::new(channel, dummy_inbound)));
        if let Some(entry) = self.children.get(&uid) {
            *entry.state.lock().await = ChildState::Connected { portal: portal.clone(), cancel_after_result: false };
        }
        Ok(ActorHandle { portal })
    }

    /// Starts an actor whose allow-list is just `module`, submits a call to
    /// `module::function(kwargs)`, and marks it for cancellation once the
    /// result is harvested (§4.3 "run_in_actor").
    pub async fn run_in_actor(
        &self,
        name: impl Into<String>,
        bind_addr: ListenAddr,
        module: &'static str,
        function: &'static str,
        kwargs: impl Serialize,
        streaming: bool,
        loglevel: tracing::Level,
    ) -> Result<ActorHandle, NurseryError> {
        let handle = self.start_actor(name, bind_addr, vec![module.to_string()], Value::Null, loglevel).await?;
        {
            let mut portal = handle.portal.lock().await;
            portal.submit_for_result(module, function, kwargs, streaming)?;
        }
        let uid = handle.peer_uid().await;
        if let Some(entry) = self.children.get(&uid) {
            let mut state = entry.state.lock().await;
            if let ChildState::Connected { cancel_after_result, .. } = &mut *state {
                *cancel_after_result = true;
            }
        }
        Ok(handle)
    }

    /// Joins every tracked child: harvests the cancel-after-result set's
    /// results (cancelling those actors), then waits for each process's OS
    /// exit, removing it from the table as it completes (§4.3 "wait").
    pub async fn wait(&self) -> Result<(), NurseryError> {
        let uids: Vec<Uid> = self.children.iter().map(|e| e.key().clone()).collect();
        let mut first_err = None;
        for uid in uids {
            if let Err(e) = self.join_one(&uid).await {
                tracing::warn!(uid = %uid, error = %e, "error joining child actor");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            self.children.remove(&uid);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn join_one(&self, uid: &Uid) -> Result<(), NurseryError> {
        let Some(entry) = self.children.get(uid) else { return Ok(()) };

        let cancel_portal = {
            let state = entry.state.lock().await;
            match &*state {
                ChildState::Connected { portal, cancel_after_result: true } => Some(portal.clone()),
                _ => None,
            }
        };
        if let Some(portal) = cancel_portal {
            let mut p = portal.lock().await;
            if p.has_pending_result() {
                match p.result().await {
                    Ok(RunResult::Stream(mut rx)) => {
                        if rx.try_recv().is_ok() {
                            tracing::warn!(uid = %uid, "cancelling run_in_actor call with an unexhausted result stream");
                        }
                    }
                    Ok(RunResult::Single(_)) => {}
                    Err(e) => tracing::warn!(uid = %uid, error = %e, "run_in_actor call ended in error"),
                }
            }
            if !p.is_closed() {
                let _ = p.cancel_actor(self.cancel_deadline).await;
            }
        }

        let mut process = entry.process.lock().await;
        match tokio::time::timeout(self.cancel_deadline, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(uid = %uid, status = %status, "child process exited");
                Ok(())
            }
            Ok(Err(source)) => Err(NurseryError::SpawnFailure { name: uid.name.clone(), source }),
            Err(_) => {
                tracing::warn!(uid = %uid, "timed out waiting for child exit, killing");
                let _ = process.start_kill();
                let _ = process.wait().await;
                Err(NurseryError::TimeoutExceeded(format!("process exit for {uid}")))
            }
        }
    }

    /// Tears down every child under the nursery's cancel deadline, then
    /// joins them (§4.3 "cancel"). With `hard_kill`, every child is killed
    /// directly instead of being asked to unwind gracefully.
    pub async fn cancel(&self, hard_kill: bool) -> Result<(), NurseryError> {
        self.cancelled.store(true, Ordering::Release);
        let uids: Vec<Uid> = self.children.iter().map(|e| e.key().clone()).collect();
        let deadline = self.cancel_deadline;

        let tasks = uids.into_iter().map(|uid| {
            let children = self.children.clone();
            let peers = self.peers.clone();
            async move {
                let Some(entry) = children.get(&uid) else { return };

                if hard_kill {
                    let mut process = entry.process.lock().await;
                    let _ = process.start_kill();
                    return;
                }

                let pending_rx = {
                    let state = entry.state.lock().await;
                    match &*state {
                        ChildState::PendingSpawn(rx) => Some(rx.clone()),
                        ChildState::Connected { .. } => None,
                    }
                };

                let portal = if let Some(mut rx) = pending_rx {
                    peers.cancel_pending(&uid);
                    match wait_for_peer(&mut rx).await {
                        Some(channel) => {
                            let (_tx, dummy) = mpsc::unbounded_channel();
                            Some(Portal::new(channel, dummy))
                        }
                        None => None,
                    }
                } else {
                    None
                };

                match portal {
                    Some(portal) => {
                        let _ = portal.cancel_actor(deadline).await;
                    }
                    None => {
                        // Either already connected (handled via the Connected
                        // branch below) or truly never arrived: hard-kill.
                        let state = entry.state.lock().await;
                        if let ChildState::Connected { portal, .. } = &*state {
                            let p = portal.lock().await;
                            let _ = p.cancel_actor(deadline).await;
                        } else {
                            drop(state);
                            let mut process = entry.process.lock().await;
                            let _ = process.start_kill();
                        }
                    }
                }
            }
        });
        futures::future::join_all(tasks).await;

        self.wait().await
    }

    /// The structured exit protocol (§4.3 "Structured exit protocol"): given
    /// how the nursery's body scope exited, drives the matching
    /// cancel/wait sequence. `body_result` is `Err` for both error and
    /// cancellation exits; `cancelled` distinguishes the two so the caller
    /// can run this under a shielded scope for the cancellation case.
    pub async fn close(&self, body_failed: bool) -> Result<(), NurseryError> {
        if body_failed {
            self.cancel(false).await
        } else {
            match self.wait().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "wait() failed during normal nursery exit, cancelling remaining children");
                    self.cancel(false).await?;
                    Err(e)
                }
            }
        }
    }

    /// A snapshot of currently tracked children's UIDs, for diagnostics.
    pub fn children(&self) -> Vec<Uid> {
        self.children.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ListenAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn current_exe_spawner_prepends_the_actor_subcommand() {
        let spawner = ActorSpawner::current_exe().unwrap();
        let spec = ActorSpawnSpec {
            name: "greeter".into(),
            bind_addr: addr(0),
            arbiter_addr: addr(9000),
            parent_addr: addr(9001),
            rpc_modules: vec!["greet".into()],
            statespace: Value::Null,
            loglevel: tracing::Level::INFO,
        };
        let cmd = spawner.command(&spec);
        let args = args_of(&cmd);
        assert_eq!(args.first().map(String::as_str), Some("actor"));
        assert!(args.windows(2).any(|w| w[0] == "--name" && w[1] == "greeter"));
        assert!(args.windows(2).any(|w| w[0] == "--rpc-modules" && w[1] == "greet"));
    }

    #[test]
    fn an_empty_rpc_allow_list_omits_the_flag_entirely() {
        let spawner = ActorSpawner::new("/usr/bin/true");
        let spec = ActorSpawnSpec {
            name: "root".into(),
            bind_addr: addr(0),
            arbiter_addr: addr(9000),
            parent_addr: addr(9001),
            rpc_modules: Vec::new(),
            statespace: Value::Null,
            loglevel: tracing::Level::INFO,
        };
        let cmd = spawner.command(&spec);
        assert!(!args_of(&cmd).iter().any(|a| a == "--rpc-modules"));
    }

    #[tokio::test]
    async fn wait_on_an_empty_nursery_is_a_no_op() {
        let nursery = Nursery {
            parent_addr: addr(0),
            arbiter_addr: addr(9000),
            peers: Arc::new(PeerTable::default()),
            spawner: ActorSpawner::new("/usr/bin/true"),
            children: Arc::new(DashMap::new()),
            cancel_deadline: Duration::from_secs(1),
            cancelled: AtomicBool::new(false),
        };
        nursery.wait().await.unwrap();
        assert!(nursery.children().is_empty());
    }
}

/// Dumps registered actor addresses as seen by the arbiter — convenience
/// re-export so demo code doesn't need to reach into [`crate::arbiter`]
/// directly just to print the current cluster view (§8 "S5").
pub async fn registry_snapshot(arbiter_addr: ArbiterAddr, caller_uid: Uid) -> Result<HashMap<Uid, Vec<ListenAddr>>, crate::error::BrooderError> {
    crate::arbiter::get_registry(arbiter_addr, caller_uid).await
}
