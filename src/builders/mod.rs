//! Builders to assemble a kernel from descriptors.

pub mod kernel_builder;

pub use kernel_builder::KernelBuilder;
