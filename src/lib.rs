//! # Team Kernel
//!
//! An execution kernel for request-driven services. Work is described as a
//! graph of tasks; each task names the team that runs it, the managed
//! objects it borrows, the task that follows it, and the handlers that take
//! over when it fails.
//!
//! ## Building blocks
//!
//! - **Teams**: thread-per-job, fixed-pool, single-thread and caller-runs
//!   execution strategies behind one `assign` operation.
//! - **Managed object pools**: bounded pools of expensive resources
//!   (connections, sessions) with waiting borrowers served in arrival order.
//! - **Execution engine**: binds dependencies, dispatches jobs to teams,
//!   follows next links and escalates typed failures to handler tasks.
//! - **Socket manager**: non-blocking listeners with optional TLS that
//!   decode requests through a pluggable [`infra::CommunicationProtocol`]
//!   and start one process per request.
//! - **Buffer pool**: size-bucketed reusable byte buffers for socket I/O.
//!
//! ## Example
//!
//! ```rust,ignore
//! use team_kernel::config::TeamConfig;
//! use team_kernel::core::{Outcome, TaskSpec};
//! use team_kernel::runtime::Kernel;
//!
//! let kernel = Kernel::builder()
//!     .team(TeamConfig::fixed_pool("workers", 4))
//!     .managed_object("db", team_kernel::core::source_fn(|| Ok(Connection::open()?)))
//!     .task(
//!         TaskSpec::new("load", "workers", |ctx| {
//!             let conn = ctx.object::<Connection>(0).ok_or_else(|| anyhow::anyhow!("no db"))?;
//!             conn.ping()?;
//!             Ok(Outcome::next())
//!         })
//!         .depends_on("db"),
//!     )
//!     .startup_job("load", None)
//!     .build()?;
//!
//! kernel.open_kernel()?;
//! // ...
//! kernel.close_kernel();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders that assemble a kernel from configuration and task specs.
pub mod builders;
/// Configuration models for teams, pools, listeners and the kernel.
pub mod config;
/// Teams, managed objects, task graphs and the execution engine.
pub mod core;
/// Buffers, wire protocols and the socket manager.
pub mod infra;
/// Kernel lifecycle.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use builders::KernelBuilder;
pub use runtime::{Kernel, KernelState};
