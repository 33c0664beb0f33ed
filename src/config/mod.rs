//! Configuration models for teams, managed objects, listeners and the kernel.

pub mod kernel;
pub mod listener;
pub mod managed_object;
pub mod team;

pub use kernel::KernelConfig;
pub use listener::{ListenerConfig, TlsConfig};
pub use managed_object::ManagedObjectConfig;
pub use team::{TeamConfig, TeamStrategy};
