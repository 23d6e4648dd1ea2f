//! Optimistic mutations: apply locally, call the server, roll back on failure.
//!
//! An operation always ends either confirmed or rolled back. If the future is
//! dropped while the remote call is still pending, the rollback runs from the
//! guard's `Drop`, so a cancelled operation cannot leave its local effect
//! behind.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Confirmed,
    RolledBack,
}

struct RollbackGuard<R: FnOnce()> {
    rollback: Option<R>,
}

impl<R: FnOnce()> RollbackGuard<R> {
    fn resolve(&mut self, resolution: Resolution) {
        let rollback = self.rollback.take();
        if let (Resolution::RolledBack, Some(rollback)) = (resolution, rollback) {
            rollback();
        }
        debug!(?resolution, "Optimistic operation resolved");
    }
}

impl<R: FnOnce()> Drop for RollbackGuard<R> {
    fn drop(&mut self) {
        if let Some(rollback) = self.rollback.take() {
            warn!("Optimistic operation dropped before the server answered; rolling back");
            rollback();
        }
    }
}

/// A forward mutation, its inverse, and the remote call that decides between them.
pub struct OptimisticOperation<A, R, F> {
    apply: A,
    rollback: R,
    remote_call: F,
}

impl<A, R, F, Fut, T, E> OptimisticOperation<A, R, F>
where
    A: FnOnce(),
    R: FnOnce(),
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    pub fn new(apply: A, rollback: R, remote_call: F) -> Self {
        Self {
            apply,
            rollback,
            remote_call,
        }
    }

    /// `apply` runs before the remote call is created. On failure `rollback`
    /// has already run when the error is returned.
    pub async fn execute(self) -> Result<T, E> {
        let Self {
            apply,
            rollback,
            remote_call,
        } = self;

        apply();
        let mut guard = RollbackGuard {
            rollback: Some(rollback),
        };

        match remote_call().await {
            Ok(value) => {
                guard.resolve(Resolution::Confirmed);
                Ok(value)
            }
            Err(err) => {
                guard.resolve(Resolution::RolledBack);
                Err(err)
            }
        }
    }
}

/// Entry point for one-off optimistic operations.
pub struct OptimisticExecutor;

impl OptimisticExecutor {
    pub async fn execute<A, R, F, Fut, T, E>(apply: A, rollback: R, remote_call: F) -> Result<T, E>
    where
        A: FnOnce(),
        R: FnOnce(),
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        OptimisticOperation::new(apply, rollback, remote_call)
            .execute()
            .await
    }
}

// ============================================================================
// STATE CELLS
// ============================================================================

/// Somewhere a value can be read whole and written whole.
pub trait StateCell<T> {
    fn get(&self) -> T;
    fn set(&self, value: T);
}

#[derive(Debug, Default)]
pub struct SharedState<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for SharedState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedState<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }
}

impl<T: Clone> StateCell<T> for SharedState<T> {
    fn get(&self) -> T {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, value: T) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// A cell projected through a getter and setter, e.g. one field in the cache.
pub struct FnCell<G, S> {
    getter: G,
    setter: S,
}

impl<G, S> FnCell<G, S> {
    pub fn new(getter: G, setter: S) -> Self {
        Self { getter, setter }
    }
}

impl<T, G, S> StateCell<T> for FnCell<G, S>
where
    G: Fn() -> T,
    S: Fn(T),
{
    fn get(&self) -> T {
        (self.getter)()
    }

    fn set(&self, value: T) {
        (self.setter)(value)
    }
}

/// Snapshot-based optimistic updates over one cell.
///
/// Rollback restores the value captured before `update` ran, not an inverse.
/// Two interleaved operations on the same cell therefore resolve as "last
/// rollback wins": a late failure can overwrite an earlier success.
pub struct OptimisticState<C> {
    cell: C,
}

impl<C> OptimisticState<C> {
    pub fn new(cell: C) -> Self {
        Self { cell }
    }

    pub fn cell(&self) -> &C {
        &self.cell
    }

    pub async fn execute<T, U, F, Fut, V, E>(&self, update: U, remote_call: F) -> Result<V, E>
    where
        C: StateCell<T>,
        T: Clone,
        U: FnOnce(&T) -> T,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let snapshot = self.cell.get();
        let next = update(&snapshot);
        OptimisticOperation::new(
            || self.cell.set(next),
            || self.cell.set(snapshot),
            remote_call,
        )
        .execute()
        .await
    }

    /// Like `execute`, then replace the optimistic guess with the value the
    /// server confirmed. `confirm` receives the remote result and the current
    /// value.
    pub async fn execute_confirmed<T, U, F, Fut, V, E, K>(
        &self,
        update: U,
        remote_call: F,
        confirm: K,
    ) -> Result<V, E>
    where
        C: StateCell<T>,
        T: Clone,
        U: FnOnce(&T) -> T,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        K: FnOnce(&V, &T) -> T,
    {
        let result = self.execute(update, remote_call).await?;
        let current = self.cell.get();
        self.cell.set(confirm(&result, &current));
        Ok(result)
    }
}
