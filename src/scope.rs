//! `RuntimeScope`: the task-tree abstraction the nursery is built on.
//!
//! Adapted from the teacher's `runtime::scope` module. The teacher used this
//! to supervise typed, mailbox-style actors (`spawn_actor`/`spawn_actor_supervised`);
//! this crate's actors are whole OS processes reached over a channel, so that
//! spawning machinery is gone. What remains — scoped plain-task spawning,
//! `Abortable` bodies, and join-then-drop teardown — is exactly the shielded,
//! scope-tree cancellation primitive §5 and §9 call for, and is what
//! [`crate::nursery::Nursery`] wraps.

use std::{error::Error, ops::Deref};

use futures::future::{AbortHandle, Abortable};
use tokio::task::JoinHandle;

use crate::{
    error::RuntimeError,
    scope_registry::{Scope, ScopeId, ROOT_SCOPE},
    shutdown::ShutdownHandle,
};

/// A read-only view into a scope, exposing navigation but not mutation.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct ScopeView(pub(crate) Scope);

impl ScopeView {
    /// The id of this scope.
    pub fn id(&self) -> ScopeId {
        self.0.id()
    }

    /// The parent scope, if any.
    pub fn parent(&self) -> Option<ScopeView> {
        self.0.parent().cloned().map(ScopeView)
    }

    /// This scope's children.
    pub async fn children(&self) -> Vec<ScopeView> {
        self.0.children().await.into_iter().map(ScopeView).collect()
    }

    /// Requests a graceful shutdown of whatever is listening on this scope's
    /// [`ShutdownHandle`], if it has one.
    pub fn shutdown(&self) {
        self.0.shutdown();
    }

    /// Aborts every task in this scope and its descendants.
    pub(crate) async fn abort(&self) {
        self.0.abort().await;
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

/// A node in the cancellation tree plus the join handles of the plain tasks
/// spawned directly within it.
#[derive(Debug)]
pub struct RuntimeScope {
    pub(crate) scope: ScopeView,
    pub(crate) join_handles: Vec<JoinHandle<Result<(), RuntimeError>>>,
}

impl Deref for RuntimeScope {
    type Target = ScopeView;

    fn deref(&self) -> &Self::Target {
        &self.scope
    }
}

impl RuntimeScope {
    pub(crate) fn root(abort_handle: AbortHandle) -> Self {
        Self {
            scope: ScopeView(Scope::root(abort_handle)),
            join_handles: Default::default(),
        }
    }

    pub(crate) async fn child(&self, shutdown_handle: Option<ShutdownHandle>, abort_handle: Option<AbortHandle>) -> Self {
        Self {
            scope: ScopeView(self.scope.0.child(shutdown_handle, abort_handle).await),
            join_handles: Default::default(),
        }
    }

    /// Runs `f` in a fresh child scope, aborting the child's tasks if `f`
    /// errors or the parent's own cancellation fires, then joining before
    /// returning.
    pub async fn scope<S, F, O>(&self, f: S) -> Result<O, RuntimeError>
    where
        O: Send + Sync,
        S: Send + FnOnce(&mut RuntimeScope) -> F,
        F: std::future::Future<Output = Result<O, Box<dyn Error + Send + Sync>>>,
    {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let mut child_scope = self.child(None, Some(abort_handle)).await;
        let res = Abortable::new(f(&mut child_scope), abort_registration).await;
        if let Ok(Err(_)) = res {
            child_scope.abort().await;
        }
        child_scope.join().await;
        match res {
            Ok(res) => res.map_err(RuntimeError::ScopeLaunchError),
            Err(_) => Err(RuntimeError::AbortedScope(child_scope.id())),
        }
    }

    /// Awaits every plain task spawned directly in this scope, then detaches
    /// it from its parent.
    pub(crate) async fn join(&mut self) {
        tracing::debug!(scope = %self.scope.id(), "joining scope");
        for handle in self.join_handles.drain(..) {
            handle.await.ok();
        }
        self.scope.0.detach().await;
    }

    /// Spawns a plain task within a fresh child scope of this one, returning
    /// an [`AbortHandle`] that cancels just that task's scope.
    pub async fn spawn_task<T, F>(&mut self, f: T) -> AbortHandle
    where
        T: Send + FnOnce(&mut RuntimeScope) -> F,
        F: 'static + std::future::Future<Output = Result<(), Box<dyn Error + Send + Sync>>> + Send,
    {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let mut child_scope = self.child(None, Some(abort_handle.clone())).await;
        let fut = f(&mut child_scope);
        let child_task = tokio::spawn(async move {
            let res = Abortable::new(fut, abort_registration).await;
            child_scope.abort().await;
            child_scope.join().await;
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    tracing::error!(scope = %child_scope.id(), error = %e, "task exited with error");
                    Err(RuntimeError::TaskError(e))
                }
                Err(_) => Err(RuntimeError::AbortedScope(child_scope.id())),
            }
        });
        self.join_handles.push(child_task);
        abort_handle
    }
}

/// Lets `Runtime::launch` take a plain `async fn(&mut RuntimeScope) -> ...`
/// without the caller having to box its future by hand.
#[allow(missing_docs)]
pub trait AsyncFn<'a, O> {
    type Output: 'a + std::future::Future<Output = O> + Send;
    fn call(self, cx: &'a mut RuntimeScope) -> Self::Output;
}

impl<'a, F, Fut, O> AsyncFn<'a, O> for F
where
    F: FnOnce(&'a mut RuntimeScope) -> Fut,
    Fut: 'a + std::future::Future<Output = O> + Send,
{
    type Output = Fut;
    fn call(self, cx: &'a mut RuntimeScope) -> Self::Output {
        (self)(cx)
    }
}

/// The root of a whole runtime: launches the top-level body in an abortable
/// scope and guarantees its descendants are joined before returning.
pub struct Runtime;

impl Runtime {
    /// Launches `f` as the root scope of the runtime.
    pub async fn launch<F>(f: F) -> Result<(), RuntimeError>
    where
        for<'a> F: AsyncFn<'a, Result<(), Box<dyn Error + Send + Sync>>>,
    {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let mut scope = RuntimeScope::root(abort_handle);
        let res = Abortable::new(f.call(&mut scope), abort_registration).await;
        if let Ok(Err(_)) = res {
            scope.abort().await;
        }
        scope.join().await;
        match res {
            Ok(res) => res.map_err(RuntimeError::ScopeLaunchError),
            Err(_) => Err(RuntimeError::AbortedScope(scope.id())),
        }
    }
}

/// Ties a scope lookup by id back to the root, used by tests and the nursery
/// when navigating to the top of the tree.
pub const ROOT: ScopeId = ROOT_SCOPE;

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn launch_joins_its_spawned_tasks_before_returning() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_inner = ran.clone();
        Runtime::launch(move |scope| {
            let ran = ran_inner.clone();
            async move {
                scope
                    .spawn_task(move |_| async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await;
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn an_erroring_body_surfaces_as_a_scope_launch_error() {
        let result = Runtime::launch(|_scope| async move {
            Err::<(), _>("boom".into())
        })
        .await;
        assert!(matches!(result, Err(RuntimeError::ScopeLaunchError(_))));
    }

    #[tokio::test]
    async fn a_child_scope_is_joined_and_detached_after_its_body_completes() {
        Runtime::launch(|scope| async move {
            let outcome = scope
                .scope(|_child| async move { Ok::<_, Box<dyn Error + Send + Sync>>(42) })
                .await
                .unwrap();
            assert_eq!(outcome, 42);
            assert!(scope.children().await.is_empty());
            Ok(())
        })
        .await
        .unwrap();
    }
}
