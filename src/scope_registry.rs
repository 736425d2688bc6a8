//! The scope tree: a hierarchy of cancellation domains.
//!
//! Adapted from the teacher's `runtime::registry` module. The original carried
//! a generic dependency-injection mechanism (`DepSignal`/`DepStatus`) for
//! typed actor state; the nursery has no use for that, so this keeps only the
//! parent/child bookkeeping and abort/shutdown propagation — exactly the
//! shape the nursery's cancellation tree needs (§4.3, §5 "Cancellation").

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::future::AbortHandle;
use tokio::sync::RwLock;
pub use uuid::Uuid;

use crate::shutdown::ShutdownHandle;

/// Identifies a node in the scope tree.
pub type ScopeId = Uuid;

/// The root scope id, always a nil UUID.
pub const ROOT_SCOPE: Uuid = Uuid::nil();

/// A node in the scope tree: a cancellation domain that can hold child
/// scopes, each of which is aborted when its parent is.
#[derive(Clone, Debug)]
pub struct Scope {
    pub(crate) inner: Arc<ScopeInner>,
    valid: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct ScopeInner {
    pub(crate) id: ScopeId,
    shutdown_handle: Option<ShutdownHandle>,
    abort_handle: Option<AbortHandle>,
    parent: Option<Scope>,
    children: RwLock<Vec<Scope>>,
}

impl Scope {
    pub(crate) fn root(abort_handle: AbortHandle) -> Scope {
        Scope {
            inner: Arc::new(ScopeInner {
                id: ROOT_SCOPE,
                shutdown_handle: None,
                abort_handle: Some(abort_handle),
                parent: None,
                children: Default::default(),
            }),
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) async fn child(&self, shutdown_handle: Option<ShutdownHandle>, abort_handle: Option<AbortHandle>) -> Self {
        let id = Uuid::new_v4();
        let child = Scope {
            inner: Arc::new(ScopeInner {
                id,
                shutdown_handle,
                abort_handle,
                parent: Some(self.clone()),
                children: Default::default(),
            }),
            valid: Arc::new(AtomicBool::new(true)),
        };
        self.inner.children.write().await.push(child.clone());
        child
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub(crate) fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    pub(crate) async fn children(&self) -> Vec<Scope> {
        self.inner.children.read().await.clone()
    }

    /// Removes this scope from its parent's child list.
    pub(crate) async fn detach(&self) {
        if let Some(parent) = self.inner.parent.as_ref() {
            parent
                .inner
                .children
                .write()
                .await
                .retain(|c| c.inner.id != self.inner.id);
        }
    }

    /// Requests a graceful shutdown: triggers the scope's shutdown handle (if
    /// any) so its owning loop can unwind on its own, without aborting tasks.
    pub(crate) fn shutdown(&self) {
        self.valid.store(false, Ordering::Release);
        if let Some(handle) = self.inner.shutdown_handle.as_ref() {
            handle.shutdown();
        } else if let Some(abort) = self.inner.abort_handle.as_ref() {
            abort.abort();
        }
    }

    /// Aborts this scope and every descendant scope, depth-first.
    pub(crate) async fn abort(&self) {
        self.valid.store(false, Ordering::Release);
        for child in self.children().await {
            Box::pin(child.abort()).await;
        }
        if let Some(handle) = self.inner.shutdown_handle.as_ref() {
            handle.shutdown();
        }
        if let Some(abort) = self.inner.abort_handle.as_ref() {
            abort.abort();
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use futures::future::AbortHandle;

    use super::*;

    #[tokio::test]
    async fn detach_removes_a_child_from_its_parent() {
        let (abort, _reg) = AbortHandle::new_pair();
        let root = Scope::root(abort);
        let child = root.child(None, None).await;

        assert_eq!(root.children().await.len(), 1);
        child.detach().await;
        assert!(root.children().await.is_empty());
    }

    #[tokio::test]
    async fn abort_invalidates_the_whole_subtree() {
        let (abort, _reg) = AbortHandle::new_pair();
        let root = Scope::root(abort);
        let child = root.child(None, None).await;
        let grandchild = child.child(None, None).await;

        root.abort().await;
        assert!(!root.is_valid());
        assert!(!child.is_valid());
        assert!(!grandchild.is_valid());
    }

    #[tokio::test]
    async fn a_fresh_scope_is_valid_and_has_no_children() {
        let (abort, _reg) = AbortHandle::new_pair();
        let root = Scope::root(abort);
        assert!(root.is_valid());
        assert!(root.children().await.is_empty());
        assert_eq!(root.id(), ROOT_SCOPE);
    }
}
