//! Per-task coordination of the active prober and the passive correlator.
//!
//! Phases: starting (correlator launched) -> probing -> awaiting correlation
//! -> arbitrating -> done. The coordinator owns the timeout clock; the correlator
//! thread is always stopped and joined before the task is reported.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::capture::{CaptureError, Correlator, OutcomeSlot};
use crate::probe::Prober;
use crate::services::service_name;
use crate::types::{AbandonedTask, CaptureOutcome, PortStatus, Protocol, ScanResult, ScanTask, TaskOutcome};

/// Head start given to the capture before the probe goes out.
///
/// Best effort only: a slow capture open can still miss the first reply.
pub const TCP_SETTLE: Duration = Duration::from_millis(50);
pub const UDP_SETTLE: Duration = Duration::from_millis(100);

/// Extra time the correlator may run on its own past the coordinator's timeout.
const CAPTURE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Starting,
    Probing,
    AwaitingCorrelation,
    Arbitrating,
    Done,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPhase::Starting => "starting",
            TaskPhase::Probing => "probing",
            TaskPhase::AwaitingCorrelation => "awaiting-correlation",
            TaskPhase::Arbitrating => "arbitrating",
            TaskPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Runs tasks against one target, capturing on one interface.
#[derive(Debug, Clone)]
pub struct TaskCoordinator {
    target: Ipv4Addr,
    interface: String,
    timeout: Duration,
}

impl TaskCoordinator {
    pub fn new(target: Ipv4Addr, interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target,
            interface: interface.into(),
            timeout,
        }
    }

    pub async fn run(&self, task: ScanTask) -> TaskOutcome {
        let ScanTask { port, protocol } = task;
        trace!(port, %protocol, phase = %TaskPhase::Starting, "task phase");

        let prober = Prober::new(self.target, port);
        let correlator = Correlator::new(self.interface.clone(), self.target, port, protocol)
            .with_deadline(self.timeout * 2 + CAPTURE_GRACE);
        let (slot, rx) = OutcomeSlot::channel();
        let stop = CancellationToken::new();
        let correlator_stop = stop.clone();
        let correlator_thread =
            tokio::task::spawn_blocking(move || correlator.run(&slot, &correlator_stop));

        let settle = match protocol {
            Protocol::Tcp => TCP_SETTLE,
            Protocol::Udp => UDP_SETTLE,
        };
        time::sleep(settle).await;

        trace!(port, %protocol, phase = %TaskPhase::Probing, "task phase");
        let probe = match protocol {
            Protocol::Tcp => ProbeResult::Tcp(prober.probe_tcp(self.timeout).await),
            Protocol::Udp => ProbeResult::Udp {
                sent: prober.probe_udp().await,
            },
        };

        trace!(port, %protocol, phase = %TaskPhase::AwaitingCorrelation, "task phase");
        let capture = match time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(port, %protocol, "no correlation before timeout, stopping capture");
                None
            }
        };
        stop.cancel();

        let capture_failed = match correlator_thread.await {
            Ok(Ok(())) => false,
            Ok(Err(CaptureError::Open { .. } | CaptureError::Filter { .. })) => true,
            // a read error after listening started still left the probe observable
            Ok(Err(CaptureError::Read(_))) => false,
            Err(e) => {
                warn!(port, %protocol, error = %e, "correlator thread panicked");
                true
            }
        };

        trace!(port, %protocol, phase = %TaskPhase::Arbitrating, "task phase");
        let status = match probe {
            ProbeResult::Tcp(probe_status) => Some(arbitrate_tcp(probe_status, capture.as_ref())),
            ProbeResult::Udp { sent } => arbitrate_udp(sent, capture.as_ref(), capture_failed),
        };

        trace!(port, %protocol, phase = %TaskPhase::Done, "task phase");
        match status {
            Some(status) => {
                debug!(port, %protocol, %status, "task classified");
                TaskOutcome::Completed(ScanResult {
                    port,
                    protocol,
                    status,
                    service: service_name(port, protocol).to_string(),
                    header_bytes: capture
                        .filter(|c| c.found)
                        .map(|c| c.header_bytes)
                        .unwrap_or_default(),
                })
            }
            None => TaskOutcome::Abandoned(AbandonedTask {
                task,
                reason: "UDP probe could not be sent".to_string(),
            }),
        }
    }
}

enum ProbeResult {
    Tcp(PortStatus),
    Udp { sent: bool },
}

/// A decisive capture beats the connect result; otherwise the connect result stands.
pub fn arbitrate_tcp(probe: PortStatus, capture: Option<&CaptureOutcome>) -> PortStatus {
    match capture {
        Some(c) if c.found && c.status != PortStatus::Unknown => c.status,
        _ => probe,
    }
}

/// UDP has no connect result, so any captured reply decides, `Unknown` included.
///
/// `None` means the probe never left the host and the task is abandoned.
/// Silence after a successful send is `OpenOrFiltered`.
pub fn arbitrate_udp(
    sent: bool,
    capture: Option<&CaptureOutcome>,
    capture_failed: bool,
) -> Option<PortStatus> {
    if !sent {
        return None;
    }
    let status = match capture {
        Some(c) if c.found => c.status,
        _ if capture_failed => PortStatus::Unknown,
        _ => PortStatus::OpenOrFiltered,
    };
    Some(status)
}
