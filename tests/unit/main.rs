//! Unit tests for individual components

mod buffer_pool_test;
mod config_test;
mod error_test;
mod protocol_test;
