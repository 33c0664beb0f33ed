//! Managed object sources and the capabilities they advertise.
//!
//! A [`ManagedObjectSource`] knows how to build instances of one resource
//! type. The [`ManagedObjectPool`](crate::core::ManagedObjectPool) wraps a
//! source, tracks which instances are idle or borrowed, and hands them to
//! [`ManagedObjectUser`]s through callbacks.

use std::any::Any;
use std::fmt;
use std::ops::BitOr;

use crate::core::ProcessId;

/// Optional behaviours of a managed object source, resolved once per bind.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No optional behaviour.
    pub const NONE: Self = Self(0);
    /// `recycle` runs whenever an instance is returned.
    pub const RECYCLE: Self = Self(1);
    /// `bind_process` runs whenever an instance is bound to a process.
    pub const PROCESS_AWARE: Self = Self(1 << 1);
    /// `validate` runs before an idle instance is reused.
    pub const VALIDATE: Self = Self(1 << 2);

    /// Whether every capability in `other` is present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two capability sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::RECYCLE) {
            set.entry(&"recycle");
        }
        if self.contains(Self::PROCESS_AWARE) {
            set.entry(&"process_aware");
        }
        if self.contains(Self::VALIDATE) {
            set.entry(&"validate");
        }
        set.finish()
    }
}

/// Factory for one resource type.
pub trait ManagedObjectSource: Send + Sync + 'static {
    /// The resource type.
    type Object: Send + 'static;

    /// Construct a new instance.
    ///
    /// # Errors
    ///
    /// Construction failures are reported to the requesting user only.
    fn create(&self) -> anyhow::Result<Self::Object>;

    /// Optional behaviours this source implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// Reset an instance on return. Failure marks the instance lost.
    ///
    /// # Errors
    ///
    /// Any error discards the instance.
    fn recycle(&self, _object: &mut Self::Object) -> anyhow::Result<()> {
        Ok(())
    }

    /// Check an idle instance before reuse.
    fn validate(&self, _object: &Self::Object) -> bool {
        true
    }

    /// Inform an instance of the process that now owns it.
    fn bind_process(&self, _object: &mut Self::Object, _process: ProcessId) {}
}

/// Source built from a construction closure.
pub struct FnSource<F> {
    create: F,
}

/// Build a source from a closure.
pub const fn source_fn<T, F>(create: F) -> FnSource<F>
where
    T: Send + 'static,
    F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
{
    FnSource { create }
}

impl<T, F> ManagedObjectSource for FnSource<F>
where
    T: Send + 'static,
    F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
{
    type Object = T;

    fn create(&self) -> anyhow::Result<T> {
        (self.create)()
    }
}

/// Type-erased view of a source used by the pool.
pub(crate) trait ErasedSource: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn Any + Send>>;
    fn recycle(&self, object: &mut (dyn Any + Send)) -> anyhow::Result<()>;
    fn validate(&self, object: &(dyn Any + Send)) -> bool;
    fn bind_process(&self, object: &mut (dyn Any + Send), process: ProcessId);
}

impl<S: ManagedObjectSource> ErasedSource for S {
    fn create(&self) -> anyhow::Result<Box<dyn Any + Send>> {
        let object = ManagedObjectSource::create(self)?;
        Ok(Box::new(object))
    }

    fn recycle(&self, object: &mut (dyn Any + Send)) -> anyhow::Result<()> {
        match object.downcast_mut::<S::Object>() {
            Some(object) => ManagedObjectSource::recycle(self, object),
            None => anyhow::bail!("instance type does not match its source"),
        }
    }

    fn validate(&self, object: &(dyn Any + Send)) -> bool {
        object
            .downcast_ref::<S::Object>()
            .is_some_and(|object| ManagedObjectSource::validate(self, object))
    }

    fn bind_process(&self, object: &mut (dyn Any + Send), process: ProcessId) {
        if let Some(object) = object.downcast_mut::<S::Object>() {
            ManagedObjectSource::bind_process(self, object, process);
        }
    }
}

/// A borrowed instance together with its pool identity.
pub struct PooledObject {
    pub(crate) id: u64,
    pub(crate) pool: usize,
    pub(crate) owner: u64,
    pub(crate) capabilities: Capabilities,
    pub(crate) object: Box<dyn Any + Send>,
}

impl PooledObject {
    /// Instance identifier, unique within its pool.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Index of the owning pool within the kernel.
    #[must_use]
    pub const fn pool_index(&self) -> usize {
        self.pool
    }

    /// Capabilities cached at bind time.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Borrow the instance as `T`.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }

    /// Mutably borrow the instance as `T`.
    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.object.downcast_mut::<T>()
    }
}

impl fmt::Debug for PooledObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledObject")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Receiver of an asynchronous sourcing request.
///
/// Exactly one of `complete` or `failed` is invoked per request, possibly
/// on another thread (when a queued request is served by a return).
pub trait ManagedObjectUser: Send + 'static {
    /// The instance is now owned by this user.
    fn complete(self: Box<Self>, object: PooledObject);

    /// The instance could not be sourced.
    fn failed(self: Box<Self>, cause: anyhow::Error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_set_ops() {
        let caps = Capabilities::RECYCLE | Capabilities::VALIDATE;
        assert!(caps.contains(Capabilities::RECYCLE));
        assert!(caps.contains(Capabilities::VALIDATE));
        assert!(!caps.contains(Capabilities::PROCESS_AWARE));
        assert!(caps.contains(Capabilities::NONE));
        assert_eq!(format!("{caps:?}"), r#"{"recycle", "validate"}"#);
    }

    #[test]
    fn test_erased_source_roundtrip() {
        let source = source_fn(|| Ok(41_u32));
        let mut object = ErasedSource::create(&source).unwrap();
        assert!(ErasedSource::validate(&source, object.as_ref()));
        assert!(ErasedSource::recycle(&source, object.as_mut()).is_ok());

        let wrong: Box<dyn Any + Send> = Box::new("text");
        assert!(!ErasedSource::validate(&source, wrong.as_ref()));
    }
}
