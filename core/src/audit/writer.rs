//! Store I/O on a dedicated thread, so callers can stop waiting for a slow
//! disk without abandoning the write half-way.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Instant;

use fortress_common::audit::AuditError;
use tracing::{error, warn};

use super::store::AuditStore;

type Job = Box<dyn FnOnce(&dyn AuditStore) + Send>;

/// Receives the result of a submitted job.
pub(super) type Ticket<T> = Receiver<Result<T, AuditError>>;

pub(super) struct StoreWriter {
    store: Arc<dyn AuditStore>,
    /// `None` when the thread could not be started; jobs then run inline.
    jobs: Option<Sender<Job>>,
}

impl StoreWriter {
    pub(super) fn spawn(store: Arc<dyn AuditStore>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = store.clone();
        let spawned = thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || {
                // Jobs run in submission order until the log is dropped.
                while let Ok(job) = rx.recv() {
                    job(worker.as_ref());
                }
            });

        let jobs = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!(error = %e, "audit writer thread unavailable, writing inline");
                None
            }
        };
        Self { store, jobs }
    }

    /// Queues `job` behind every job submitted before it.
    pub(super) fn submit<T, F>(&self, job: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn AuditStore) -> Result<T, AuditError> + Send + 'static,
    {
        let (done, ticket) = mpsc::channel();
        let job: Job = Box::new(move |store: &dyn AuditStore| {
            // The caller may have stopped waiting; the result is then dropped.
            let _ = done.send(job(store));
        });

        match &self.jobs {
            Some(jobs) => {
                if let Err(mpsc::SendError(job)) = jobs.send(job) {
                    error!("audit writer thread stopped, writing inline");
                    job(self.store.as_ref());
                }
            }
            None => job(self.store.as_ref()),
        }
        ticket
    }
}

/// Waits for `ticket` until `deadline`. `None` means the job is still
/// running and the ticket can be waited on again later.
pub(super) fn wait_until<T>(ticket: &Ticket<T>, deadline: Instant) -> Option<Result<T, AuditError>> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match ticket.recv_timeout(remaining) {
        Ok(result) => Some(result),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(AuditError::Io(std::io::Error::other(
            "audit writer dropped the job",
        )))),
    }
}
