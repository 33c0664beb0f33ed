//! Bridge from decoded requests to engine processes.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{CompletionHook, Engine, KernelError, ProcessReport, ProcessStatus, TaskId, TeamJob};
use crate::infra::protocol::CommunicationProtocol;
use crate::infra::socket::outbound::ResponseCompletion;
use crate::infra::socket::{ConnectionHandler, Inbound, ResponseWriter};

/// Starts one engine process per decoded request.
///
/// The process's first task receives an [`Inbound`] argument. If the
/// process ends without sending a response, the protocol's failure
/// response is queued in its place so the connection never hangs.
///
/// Processes are started on the first task's team, so dependency binding
/// and source construction never run on the selector thread. A team whose
/// queue is full rejects the request with the failure response.
#[derive(Debug, Clone)]
pub struct EngineDispatch {
    engine: Arc<Engine>,
    task: TaskId,
}

impl EngineDispatch {
    /// Dispatch requests to `task`.
    #[must_use]
    pub const fn new(engine: Arc<Engine>, task: TaskId) -> Self {
        Self { engine, task }
    }
}

/// Team job that starts the request's process.
struct StartProcess<P: CommunicationProtocol> {
    engine: Arc<Engine>,
    task: TaskId,
    inbound: Inbound<P>,
    on_reject: ResponseCompletion<P>,
}

impl<P: CommunicationProtocol> StartProcess<P> {
    fn reject(&self, cause: KernelError) {
        warn!(connection = self.inbound.writer.connection_id(), error = %cause, "request not dispatched");
        self.on_reject.finish(Some(&anyhow::Error::new(cause)));
    }
}

impl<P: CommunicationProtocol> TeamJob for StartProcess<P> {
    fn run(self: Box<Self>) {
        let Self {
            engine,
            task,
            inbound,
            on_reject,
        } = *self;
        let connection = inbound.writer.connection_id();
        let on_finish = inbound.writer.completion();
        let hook: CompletionHook = Box::new(move |report: &ProcessReport| {
            if report.status != ProcessStatus::Completed {
                debug!(connection, process = %report.id, status = ?report.status, "request process did not complete");
            }
            on_finish.finish(report.failure.as_deref());
        });
        if let Err(e) = engine.invoke_with_hook(task, Some(Box::new(inbound)), hook) {
            warn!(connection, error = %e, "request not dispatched");
            on_reject.finish(Some(&anyhow::Error::new(e)));
        }
    }

    fn cancel(self: Box<Self>, cause: KernelError) {
        self.reject(cause);
    }
}

impl<P: CommunicationProtocol> ConnectionHandler<P> for EngineDispatch {
    fn on_request(&self, request: P::Request, writer: ResponseWriter<P>) {
        let on_reject = writer.completion();
        let start = StartProcess {
            engine: Arc::clone(&self.engine),
            task: self.task,
            inbound: Inbound::<P> { request, writer },
            on_reject,
        };
        let Some(team) = self.engine.task_team(self.task) else {
            start.reject(KernelError::UnknownName {
                kind: "task",
                name: format!("#{}", self.task.index()),
            });
            return;
        };
        // Never block the selector on a full queue; the team cancels the
        // job, which queues the failure response.
        let _ = team.try_assign(Box::new(start));
    }
}
