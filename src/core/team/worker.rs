//! Persistent worker threads for fixed-pool and single-thread teams.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use tracing::debug;

use super::{TeamCounters, TeamJob};

thread_local! {
    // Address of the owning team's counters; 0 off worker threads.
    static CURRENT_TEAM: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread is a worker of the team owning `counters`.
pub(super) fn is_current(counters: &Arc<TeamCounters>) -> bool {
    CURRENT_TEAM.with(|current| current.get() == Arc::as_ptr(counters) as usize)
}

/// Spawn a worker that blocks on the shared queue until every sender is gone.
///
/// `recv` keeps yielding queued jobs after the team drops its sender, so
/// stopping a team drains the queue instead of discarding it.
pub(super) fn spawn_worker(
    team: &str,
    worker_id: usize,
    rx: Receiver<Box<dyn TeamJob>>,
    counters: Arc<TeamCounters>,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    let team_name = team.to_string();
    thread::Builder::new()
        .name(format!("{team}-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            CURRENT_TEAM.with(|current| current.set(Arc::as_ptr(&counters) as usize));
            debug!(team = %team_name, worker_id, "worker thread started");
            while let Ok(job) = rx.recv() {
                counters.queued.fetch_sub(1, Ordering::Relaxed);
                counters.execute(job);
            }
            debug!(team = %team_name, worker_id, "worker channel closed, exiting");
        })
}
