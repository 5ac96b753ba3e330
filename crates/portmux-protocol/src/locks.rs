//! Named exclusive locks used as liveness signals.
//!
//! A side of a channel holds its lock for as long as it is alive. The other
//! side watches for the release: a release without a formal close or
//! completion means the peer went away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::trace;

/// A held lock. Released exactly once, on [`LockGuard::release`] or drop.
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Build a guard running `release` when it is let go.
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            trace!(lock = %self.name, "releasing lock");
            release();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// A source of named exclusive locks shared by every party that can see
/// the same names.
pub trait LockManager: Send + Sync + 'static {
    /// Wait for exclusive ownership of `name`.
    fn acquire(&self, name: &str) -> BoxFuture<'static, LockGuard>;

    /// Resolve once `name` is released by its current holder.
    ///
    /// Resolves immediately if nobody holds `name` right now.
    fn on_release(&self, name: &str) -> BoxFuture<'static, ()>;
}

/// Process-local [`LockManager`].
///
/// Every clone shares the same lock table, so clones handed to both sides
/// of a conversation see each other's locks.
#[derive(Clone, Default)]
pub struct LocalLockManager {
    cells: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently held.
    pub fn is_held(&self, name: &str) -> bool {
        lock_cells(&self.cells).contains_key(name)
    }

    fn try_take(&self, name: &str) -> Result<LockGuard, watch::Receiver<bool>> {
        let mut cells = lock_cells(&self.cells);
        if let Some(held) = cells.get(name) {
            return Err(held.subscribe());
        }
        let (cell, _) = watch::channel(true);
        cells.insert(name.to_string(), cell);
        drop(cells);

        let table = self.cells.clone();
        let owned = name.to_string();
        Ok(LockGuard::new(name, move || {
            if let Some(cell) = lock_cells(&table).remove(&owned) {
                cell.send_replace(false);
            }
        }))
    }
}

impl LockManager for LocalLockManager {
    fn acquire(&self, name: &str) -> BoxFuture<'static, LockGuard> {
        let manager = self.clone();
        let name = name.to_string();
        async move {
            loop {
                match manager.try_take(&name) {
                    Ok(guard) => return guard,
                    Err(mut held) => {
                        trace!(lock = %name, "waiting for lock");
                        let _ = held.wait_for(|held| !*held).await;
                    }
                }
            }
        }
        .boxed()
    }

    fn on_release(&self, name: &str) -> BoxFuture<'static, ()> {
        let held = lock_cells(&self.cells).get(name).map(watch::Sender::subscribe);
        async move {
            if let Some(mut held) = held {
                let _ = held.wait_for(|held| !*held).await;
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for LocalLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLockManager")
            .field("held", &lock_cells(&self.cells).len())
            .finish()
    }
}

fn lock_cells(
    cells: &Mutex<HashMap<String, watch::Sender<bool>>>,
) -> MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
    cells.lock().unwrap_or_else(PoisonError::into_inner)
}
