use std::sync::Arc;
use std::time::Duration;

use fortress_common::audit::{AuditPayload, RunId, Severity};
use fortress_common::error::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::MapperInner;

/// A background sweep loop and its stop signal.
///
/// The signal is only observed between sweeps: a sweep in progress always
/// runs to completion (or to its own timeout).
pub(super) struct ScanLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScanLoop {
    pub(super) fn spawn(
        mapper: Arc<MapperInner>,
        interface: String,
        network_cidr: String,
        interval: Duration,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(mapper, interface, network_cidr, interval, stop_rx));
        Self { stop, handle }
    }

    pub(super) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raises the stop signal and waits up to `timeout` for the loop to exit.
    pub(super) async fn stop_within(&mut self, timeout: Duration) -> bool {
        self.stop.send_replace(true);
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "continuous scan task ended abnormally");
                true
            }
            Err(_) => false,
        }
    }
}

async fn run(
    mapper: Arc<MapperInner>,
    interface: String,
    network_cidr: String,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        match mapper.scan(RunId::system(), None, &interface, &network_cidr).await {
            Ok(targets) => debug!(found = targets.len(), "periodic sweep finished"),
            // Backend failures were audited by the sweep itself.
            Err(Error::ScanFailed { .. }) => {}
            Err(e) => {
                warn!(error = %e, "periodic sweep skipped");
                let payload = AuditPayload::ScanFailed {
                    interface: interface.clone(),
                    network: network_cidr.clone(),
                    reason: e.to_string(),
                };
                if let Err(e) = mapper.audit().append(RunId::system(), None, Severity::Warning, payload) {
                    warn!(error = %e, "could not audit skipped sweep");
                }
            }
        }

        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!(interface = %interface, "continuous scan loop exited");
}
