//! Runtime pool of managed object instances for one source.
//!
//! Every instance is in exactly one of three places: the idle queue, the
//! borrowed set, or gone (lost). All transitions between them, and waiter
//! admission, happen under one `parking_lot::Mutex`, so two requesters can
//! never observe the same idle instance. Source code (construction,
//! recycle, validate) always runs outside that lock.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ManagedObjectConfig;
use crate::core::managed_object::ErasedSource;
use crate::core::{
    Capabilities, KernelError, ManagedObjectSource, ManagedObjectUser, PooledObject, ProcessId,
};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedObjectPoolStats {
    /// Instances waiting for reuse.
    pub idle: usize,
    /// Instances currently owned by a user.
    pub borrowed: usize,
    /// Constructions in progress.
    pub constructing: usize,
    /// Requests queued for an instance.
    pub waiting: usize,
    /// Instances ever constructed.
    pub created: u64,
    /// Instances returned via `return_instance`.
    pub returned: u64,
    /// Instances discarded via `lose` (including failed recycle/validate).
    pub lost: u64,
}

struct PoolState {
    idle: VecDeque<PooledObject>,
    borrowed: HashSet<u64>,
    constructing: usize,
    waiters: VecDeque<Box<dyn ManagedObjectUser>>,
    created: u64,
    returned: u64,
    lost: u64,
}

impl PoolState {
    fn live(&self) -> usize {
        self.idle.len() + self.borrowed.len() + self.constructing
    }

    fn can_construct(&self, max_size: Option<usize>) -> bool {
        max_size.is_none_or(|max| self.live() < max)
    }
}

/// What `source` decided to do while holding the lock.
enum Admission {
    Reuse(PooledObject, Box<dyn ManagedObjectUser>),
    Construct(Box<dyn ManagedObjectUser>),
    Queued,
    Exhausted(Box<dyn ManagedObjectUser>),
}

/// Process-wide pool identities; instances carry theirs back on release.
static NEXT_POOL_UID: AtomicU64 = AtomicU64::new(1);

/// Pool of instances for one managed object source.
pub struct ManagedObjectPool {
    name: String,
    index: usize,
    uid: u64,
    config: ManagedObjectConfig,
    source: Arc<dyn ErasedSource>,
    capabilities: Capabilities,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl ManagedObjectPool {
    /// Create a pool around `source`.
    ///
    /// `index` identifies the pool inside a kernel; standalone pools use 0.
    ///
    /// # Errors
    ///
    /// Returns `KernelError::InvalidConfig` if the policy is invalid.
    pub fn new<S: ManagedObjectSource>(
        name: impl Into<String>,
        index: usize,
        config: ManagedObjectConfig,
        source: S,
    ) -> Result<Self, KernelError> {
        config.validate().map_err(KernelError::InvalidConfig)?;
        let capabilities = ManagedObjectSource::capabilities(&source);
        Ok(Self {
            name: name.into(),
            index,
            uid: NEXT_POOL_UID.fetch_add(1, Ordering::Relaxed),
            config,
            source: Arc::new(source),
            capabilities,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                borrowed: HashSet::new(),
                constructing: 0,
                waiters: VecDeque::new(),
                created: 0,
                returned: 0,
                lost: 0,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool policy.
    #[must_use]
    pub const fn config(&self) -> &ManagedObjectConfig {
        &self.config
    }

    /// Request an instance; `user` is called back exactly once.
    ///
    /// An idle instance is handed over immediately. Otherwise a new one is
    /// constructed if the size bound allows, or the request is queued
    /// (FIFO). A full waiter queue fails the request with
    /// `KernelError::PoolExhausted`.
    pub fn source(&self, user: Box<dyn ManagedObjectUser>) {
        let mut user = Some(user);
        loop {
            let Some(current) = user.take() else { return };
            let admission = {
                let mut state = self.state.lock();
                if let Some(object) = state.idle.pop_front() {
                    state.borrowed.insert(object.id);
                    Admission::Reuse(object, current)
                } else if state.can_construct(self.config.max_size) {
                    state.constructing += 1;
                    Admission::Construct(current)
                } else if state.waiters.len() < self.config.max_waiters {
                    state.waiters.push_back(current);
                    Admission::Queued
                } else {
                    Admission::Exhausted(current)
                }
            };

            match admission {
                Admission::Reuse(object, current) => {
                    if self.capabilities.contains(Capabilities::VALIDATE)
                        && !self.source.validate(object.object.as_ref())
                    {
                        debug!(pool = %self.name, instance = object.id, "idle instance failed validation");
                        self.discard(object);
                        user = Some(current);
                        continue;
                    }
                    current.complete(object);
                }
                Admission::Construct(current) => {
                    self.construct_for(current);
                    self.serve_waiters();
                }
                Admission::Queued => {
                    debug!(pool = %self.name, "request queued for instance");
                }
                Admission::Exhausted(current) => {
                    warn!(pool = %self.name, "managed object pool exhausted");
                    current.failed(KernelError::PoolExhausted(self.name.clone()).into());
                }
            }
        }
    }

    /// Construct an instance for `user`; the caller has already reserved a
    /// construction slot. Returns whether construction succeeded.
    fn construct_for(&self, user: Box<dyn ManagedObjectUser>) -> bool {
        match self.source.create() {
            Ok(object) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                {
                    let mut state = self.state.lock();
                    state.constructing -= 1;
                    state.created += 1;
                    state.borrowed.insert(id);
                }
                debug!(pool = %self.name, instance = id, "instance constructed");
                user.complete(PooledObject {
                    id,
                    pool: self.index,
                    owner: self.uid,
                    capabilities: self.capabilities,
                    object,
                });
                true
            }
            Err(cause) => {
                self.state.lock().constructing -= 1;
                warn!(pool = %self.name, error = %cause, "instance construction failed");
                let pool = self.name.clone();
                user.failed(cause.context(format!("sourcing from pool `{pool}` failed")));
                false
            }
        }
    }

    /// Construct instances for queued requests while the size bound allows.
    fn serve_waiters(&self) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.waiters.is_empty() || !state.can_construct(self.config.max_size) {
                    return;
                }
                state.constructing += 1;
                state.waiters.pop_front()
            };
            match waiter {
                Some(waiter) => {
                    self.construct_for(waiter);
                }
                None => {
                    self.state.lock().constructing -= 1;
                    return;
                }
            }
        }
    }

    /// Return a borrowed instance.
    ///
    /// The oldest queued request receives it directly; otherwise it becomes
    /// idle (pooled sources) or is dropped (unpooled sources). A failed
    /// recycle loses the instance instead.
    ///
    /// # Errors
    ///
    /// Returns `KernelError::NotBorrowed` if the instance is not currently
    /// borrowed from this pool.
    pub fn return_instance(&self, mut object: PooledObject) -> Result<(), KernelError> {
        if object.owner != self.uid || !self.state.lock().borrowed.contains(&object.id) {
            return Err(self.not_borrowed(object.id));
        }

        if self.capabilities.contains(Capabilities::RECYCLE) {
            if let Err(cause) = self.source.recycle(object.object.as_mut()) {
                warn!(pool = %self.name, instance = object.id, error = %cause, "recycle failed; instance lost");
                return self.lose(object);
            }
        }

        let handoff = {
            let mut state = self.state.lock();
            if !state.borrowed.contains(&object.id) {
                return Err(self.not_borrowed(object.id));
            }
            state.returned += 1;
            if self.config.pooled {
                match state.waiters.pop_front() {
                    Some(waiter) => Some((waiter, object)),
                    None => {
                        state.borrowed.remove(&object.id);
                        state.idle.push_back(object);
                        None
                    }
                }
            } else {
                state.borrowed.remove(&object.id);
                drop(state);
                drop(object);
                self.serve_waiters();
                None
            }
        };

        if let Some((waiter, object)) = handoff {
            debug!(pool = %self.name, instance = object.id, "instance handed to queued request");
            waiter.complete(object);
        }
        Ok(())
    }

    /// Mark a borrowed instance permanently unusable.
    ///
    /// # Errors
    ///
    /// Returns `KernelError::NotBorrowed` if the instance is not currently
    /// borrowed from this pool.
    pub fn lose(&self, object: PooledObject) -> Result<(), KernelError> {
        {
            let mut state = self.state.lock();
            if object.owner != self.uid || !state.borrowed.remove(&object.id) {
                return Err(self.not_borrowed(object.id));
            }
            state.lost += 1;
        }
        warn!(pool = %self.name, instance = object.id, "instance lost");
        drop(object);
        self.serve_waiters();
        Ok(())
    }

    /// Drop an instance that was reserved as borrowed but never handed out.
    fn discard(&self, object: PooledObject) {
        {
            let mut state = self.state.lock();
            state.borrowed.remove(&object.id);
            state.lost += 1;
        }
        drop(object);
    }

    fn not_borrowed(&self, instance: u64) -> KernelError {
        KernelError::NotBorrowed {
            pool: self.name.clone(),
            instance,
        }
    }

    /// Notify a process-aware source that `object` now belongs to `process`.
    pub(crate) fn bind_process(&self, object: &mut PooledObject, process: ProcessId) {
        if object.capabilities.contains(Capabilities::PROCESS_AWARE) {
            self.source.bind_process(object.object.as_mut(), process);
        }
    }

    /// Blocking convenience wrapper around [`ManagedObjectPool::source`].
    ///
    /// If the timeout elapses the queued request stays registered; an
    /// instance delivered to it later is returned to the pool.
    ///
    /// # Errors
    ///
    /// Returns the sourcing failure, or `KernelError::PoolExhausted` on timeout.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> anyhow::Result<PooledObject> {
        let (tx, rx) = bounded(1);
        self.source(Box::new(ChannelUser {
            tx,
            pool: Arc::clone(self),
        }));
        rx.recv_timeout(timeout)
            .unwrap_or_else(|_| Err(KernelError::PoolExhausted(self.name.clone()).into()))
    }

    /// Current occupancy.
    #[must_use]
    pub fn stats(&self) -> ManagedObjectPoolStats {
        let state = self.state.lock();
        ManagedObjectPoolStats {
            idle: state.idle.len(),
            borrowed: state.borrowed.len(),
            constructing: state.constructing,
            waiting: state.waiters.len(),
            created: state.created,
            returned: state.returned,
            lost: state.lost,
        }
    }
}

impl std::fmt::Debug for ManagedObjectPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObjectPool")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// User adapter delivering the outcome over a channel.
struct ChannelUser {
    tx: Sender<anyhow::Result<PooledObject>>,
    pool: Arc<ManagedObjectPool>,
}

impl ManagedObjectUser for ChannelUser {
    fn complete(self: Box<Self>, object: PooledObject) {
        if let Err(crossbeam_channel::SendError(Ok(object))) = self.tx.send(Ok(object)) {
            // Requester timed out; give the instance back.
            if let Err(e) = self.pool.return_instance(object) {
                warn!(pool = %self.pool.name, error = %e, "late instance could not be returned");
            }
        }
    }

    fn failed(self: Box<Self>, cause: anyhow::Error) {
        let _ = self.tx.send(Err(cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source_fn;
    use std::sync::atomic::AtomicUsize;

    fn pool(config: ManagedObjectConfig) -> Arc<ManagedObjectPool> {
        let counter = Arc::new(AtomicUsize::new(0));
        Arc::new(
            ManagedObjectPool::new(
                "test",
                0,
                config,
                source_fn(move || Ok(counter.fetch_add(1, Ordering::SeqCst))),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_idle_instance_is_reused() {
        let pool = pool(ManagedObjectConfig::pooled(Some(1)));
        let first = pool.acquire(Duration::from_secs(1)).unwrap();
        let id = first.id();
        pool.return_instance(first).unwrap();

        let second = pool.acquire(Duration::from_secs(1)).unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.get::<usize>(), Some(&0));
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_double_return_is_rejected() {
        let pool = pool(ManagedObjectConfig::pooled(None));
        let object = pool.acquire(Duration::from_secs(1)).unwrap();
        let forged = PooledObject {
            id: object.id(),
            pool: 0,
            owner: pool.uid,
            capabilities: Capabilities::NONE,
            object: Box::new(0_usize),
        };
        pool.return_instance(object).unwrap();
        assert!(matches!(
            pool.return_instance(forged),
            Err(KernelError::NotBorrowed { .. })
        ));
    }

    #[test]
    fn test_lost_instance_is_replaced() {
        let pool = pool(ManagedObjectConfig::pooled(Some(1)));
        let object = pool.acquire(Duration::from_secs(1)).unwrap();
        let lost_id = object.id();
        pool.lose(object).unwrap();

        let fresh = pool.acquire(Duration::from_secs(1)).unwrap();
        assert_ne!(fresh.id(), lost_id);
        let stats = pool.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_unpooled_source_never_reuses() {
        let pool = pool(ManagedObjectConfig::eager());
        let a = pool.acquire(Duration::from_secs(1)).unwrap();
        pool.return_instance(a).unwrap();
        let b = pool.acquire(Duration::from_secs(1)).unwrap();
        assert_eq!(b.get::<usize>(), Some(&1));
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_exhausted_waiter_queue_fails_fast() {
        let pool = pool(ManagedObjectConfig::pooled(Some(1)).with_max_waiters(0));
        let _held = pool.acquire(Duration::from_secs(1)).unwrap();
        let err = pool.acquire(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KernelError>(),
            Some(KernelError::PoolExhausted(_))
        ));
    }
}
