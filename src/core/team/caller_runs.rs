//! Trampolined execution for caller-runs teams.
//!
//! A caller-runs job that assigns another caller-runs job from inside its
//! body would recurse once per link of the causal chain. Instead, the
//! outermost call on a thread owns a FIFO of deferred jobs and drains it
//! after its own job returns, keeping stack depth constant.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use super::{TeamCounters, TeamJob};

struct Deferred {
    job: Box<dyn TeamJob>,
    counters: Arc<TeamCounters>,
}

thread_local! {
    static TRAMPOLINE: RefCell<Option<VecDeque<Deferred>>> = const { RefCell::new(None) };
}

/// Clears the trampoline even if a job unwinds past the drain loop.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with(|t| *t.borrow_mut() = None);
    }
}

pub(super) fn run_trampolined(job: Box<dyn TeamJob>, counters: Arc<TeamCounters>) {
    let mut pending = Some(Deferred { job, counters });
    let nested = TRAMPOLINE.with(|t| {
        let mut slot = t.borrow_mut();
        match slot.as_mut() {
            Some(queue) => {
                if let Some(deferred) = pending.take() {
                    queue.push_back(deferred);
                }
                true
            }
            None => {
                *slot = Some(VecDeque::new());
                false
            }
        }
    });
    if nested {
        return;
    }

    let _guard = DrainGuard;
    let mut next = pending;
    while let Some(Deferred { job, counters }) = next {
        counters.execute(job);
        next = TRAMPOLINE.with(|t| t.borrow_mut().as_mut().and_then(VecDeque::pop_front));
    }
}

/// Depth of deferred jobs on this thread, for tests.
#[cfg(test)]
fn deferred_len() -> Option<usize> {
    TRAMPOLINE.with(|t| t.borrow().as_ref().map(VecDeque::len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn chain(n: usize, order: Arc<Mutex<Vec<usize>>>, counters: Arc<TeamCounters>) {
        if n == 0 {
            return;
        }
        let inner = Arc::clone(&counters);
        run_trampolined(
            Box::new(move || {
                order.lock().push(n);
                chain(n - 1, Arc::clone(&order), inner);
            }),
            counters,
        );
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(TeamCounters::default());
        chain(50_000, Arc::clone(&order), Arc::clone(&counters));
        let order = order.lock();
        assert_eq!(order.len(), 50_000);
        assert_eq!(order.first(), Some(&50_000));
        assert_eq!(order.last(), Some(&1));
        assert!(deferred_len().is_none());
    }
}
