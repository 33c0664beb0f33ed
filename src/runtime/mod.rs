//! Kernel runtime surface exposed to collaborators.

pub mod kernel;

pub use kernel::{Kernel, KernelState};
