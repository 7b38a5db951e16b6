//! Passive correlator: watches one interface for the target's reaction to a probe.
//!
//! The blocking pcap loop runs on its own thread. It hands its verdict back through
//! an [`OutcomeSlot`], which is resolved exactly once per task no matter which exit
//! path gets there first (a matching packet, a stop request, or the loop ending).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use pcap::{Active, Capture, Linktype};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::classify::{classify, ClassifyContext};
use crate::types::{CaptureOutcome, Protocol};

pub const ETHERNET_OFFSET: usize = 14;
pub const NULL_OFFSET: usize = 4;
pub const LINUX_SLL_OFFSET: usize = 16;

/// Read timeout of the capture handle; bounds how long a stop request can go unnoticed.
const READ_TIMEOUT_MS: i32 = 100;
/// Ethernet(14) + max IPv4(60) + max TCP(60), and enough for an ICMP quote.
const SNAPLEN: i32 = 256;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("couldn't open interface {interface}: {reason}")]
    Open { interface: String, reason: String },
    #[error("couldn't apply capture filter \"{filter}\": {reason}")]
    Filter { filter: String, reason: String },
    #[error("capture read failed: {0}")]
    Read(String),
}

/// Single-resolution handoff of a [`CaptureOutcome`] to the waiting coordinator.
pub struct OutcomeSlot {
    resolved: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<CaptureOutcome>>>,
}

impl OutcomeSlot {
    pub fn channel() -> (Self, oneshot::Receiver<CaptureOutcome>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            resolved: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        };
        (slot, rx)
    }

    /// Deliver `outcome` if nothing has been delivered yet. Returns whether this call won.
    pub fn resolve(&self, outcome: CaptureOutcome) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            // The receiver may already have given up on a timeout.
            let _ = tx.send(outcome);
        }
        true
    }

    #[cfg(test)]
    fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

/// Bytes of link-layer framing in front of the IP header.
///
/// Unrecognised link types are treated as Ethernet.
pub fn link_offset(linktype: Linktype) -> usize {
    match linktype {
        Linktype::ETHERNET => ETHERNET_OFFSET,
        Linktype::NULL | Linktype::LOOP => NULL_OFFSET,
        Linktype::LINUX_SLL => LINUX_SLL_OFFSET,
        other => {
            debug!(linktype = other.0, "unrecognised link type, assuming Ethernet framing");
            ETHERNET_OFFSET
        }
    }
}

/// Kernel filter for replies to a probe of `target:port`.
pub fn capture_filter(target: Ipv4Addr, port: u16, protocol: Protocol) -> String {
    match protocol {
        Protocol::Tcp => format!("tcp and src host {target} and src port {port}"),
        Protocol::Udp => format!(
            "(udp and src host {target} and src port {port}) \
             or (icmp and src host {target} and icmp[icmptype] = icmp-unreach)"
        ),
    }
}

/// What the capture loop should do after a packet has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Break,
}

/// Listens on one interface for the reply to one probe.
#[derive(Debug, Clone)]
pub struct Correlator {
    interface: String,
    target: Ipv4Addr,
    port: u16,
    protocol: Protocol,
    deadline: Option<Duration>,
}

impl Correlator {
    pub fn new(interface: impl Into<String>, target: Ipv4Addr, port: u16, protocol: Protocol) -> Self {
        Self {
            interface: interface.into(),
            target,
            port,
            protocol,
            deadline: None,
        }
    }

    /// Stop on its own after `limit` even if nobody calls for a stop.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    /// Run the capture until a reply is classified, `stop` fires, or the deadline passes.
    ///
    /// `slot` is always resolved before this returns, with `found = false` when no
    /// reply was seen. The capture handle is closed on every path.
    pub fn run(&self, slot: &OutcomeSlot, stop: &CancellationToken) -> Result<(), CaptureError> {
        let result = self.capture(slot, stop);
        if let Err(e) = &result {
            warn!(port = self.port, protocol = %self.protocol, error = %e, "capture failed");
        }
        if slot.resolve(CaptureOutcome::not_found()) {
            debug!(port = self.port, protocol = %self.protocol, "capture ended without a reply");
        }
        result
    }

    fn capture(&self, slot: &OutcomeSlot, stop: &CancellationToken) -> Result<(), CaptureError> {
        let mut cap = self.open()?;
        let ctx = ClassifyContext {
            link_offset: link_offset(cap.get_datalink()),
            probed_port: self.port,
            protocol: self.protocol,
        };

        let filter = capture_filter(self.target, self.port, self.protocol);
        cap.filter(&filter, true).map_err(|e| CaptureError::Filter {
            filter: filter.clone(),
            reason: e.to_string(),
        })?;
        debug!(interface = %self.interface, %filter, link_offset = ctx.link_offset, "capture listening");

        let deadline = self.deadline.map(|d| Instant::now() + d);
        capture_loop(&mut cap, stop, deadline, |frame| {
            let Some(verdict) = classify(frame, &ctx) else {
                trace!(port = self.port, protocol = %self.protocol, "ignoring frame that does not answer this probe");
                return LoopControl::Continue;
            };
            debug!(port = self.port, protocol = %self.protocol, status = %verdict.status, "reply captured");
            slot.resolve(CaptureOutcome {
                found: true,
                status: verdict.status,
                header_bytes: verdict.header_bytes,
            });
            LoopControl::Break
        })
        // `cap` dropped here, closing the handle
    }

    fn open(&self) -> Result<Capture<Active>, CaptureError> {
        let open_err = |e: pcap::Error| CaptureError::Open {
            interface: self.interface.clone(),
            reason: e.to_string(),
        };
        Capture::from_device(self.interface.as_str())
            .map_err(open_err)?
            .promisc(false)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .immediate_mode(true)
            .open()
            .map_err(open_err)
    }
}

/// Feed captured frames to `handler` until it breaks, `stop` fires, or `deadline` passes.
fn capture_loop<F>(
    cap: &mut Capture<Active>,
    stop: &CancellationToken,
    deadline: Option<Instant>,
    mut handler: F,
) -> Result<(), CaptureError>
where
    F: FnMut(&[u8]) -> LoopControl,
{
    loop {
        if stop.is_cancelled() {
            trace!("capture stop requested");
            return Ok(());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            trace!("capture deadline reached");
            return Ok(());
        }
        match cap.next_packet() {
            Ok(packet) => {
                if handler(packet.data) == LoopControl::Break {
                    return Ok(());
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                if stop.is_cancelled() {
                    return Ok(());
                }
                return Err(CaptureError::Read(e.to_string()));
            }
        }
    }
}
