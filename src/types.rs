use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Transport protocol of a scan task.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Final classification of one (port, protocol) pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Open,
    Closed,
    Filtered,
    OpenOrFiltered,
    Unknown,
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Open => "open",
            PortStatus::Closed => "closed",
            PortStatus::Filtered => "filtered",
            PortStatus::OpenOrFiltered => "open_or_filtered",
            PortStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a port to check over one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanTask {
    pub port: u16,
    pub protocol: Protocol,
}

/// What the passive correlator saw for one task.
///
/// `header_bytes` holds at most [`HEADER_SNIPPET_LEN`] bytes starting at the IP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub found: bool,
    pub status: PortStatus,
    pub header_bytes: Vec<u8>,
}

pub const HEADER_SNIPPET_LEN: usize = 16;

impl CaptureOutcome {
    pub fn not_found() -> Self {
        Self {
            found: false,
            status: PortStatus::Unknown,
            header_bytes: Vec::new(),
        }
    }
}

/// One classified (port, protocol) pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub port: u16,
    pub protocol: Protocol,
    pub status: PortStatus,
    pub service: String,
    pub header_bytes: Vec<u8>,
}

/// A task that finished without a classification, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedTask {
    pub task: ScanTask,
    pub reason: String,
}

/// How a single task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(ScanResult),
    Abandoned(AbandonedTask),
}

/// Everything a finished scan produced.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub target: Ipv4Addr,
    pub total: u64,
    pub results: Vec<ScanResult>,
    pub abandoned: Vec<AbandonedTask>,
}

impl ScanReport {
    /// Non-closed results ordered by port, then protocol.
    pub fn observed(&self) -> Vec<&ScanResult> {
        let mut out: Vec<&ScanResult> = self
            .results
            .iter()
            .filter(|r| r.status != PortStatus::Closed)
            .collect();
        out.sort_by_key(|r| (r.port, r.protocol));
        out
    }

    pub fn closed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == PortStatus::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(port: u16, protocol: Protocol, status: PortStatus) -> ScanResult {
        ScanResult {
            port,
            protocol,
            status,
            service: "unknown".into(),
            header_bytes: Vec::new(),
        }
    }

    #[test]
    fn observed_hides_closed_and_sorts() {
        let report = ScanReport {
            target: Ipv4Addr::LOCALHOST,
            total: 4,
            results: vec![
                result(443, Protocol::Udp, PortStatus::OpenOrFiltered),
                result(22, Protocol::Tcp, PortStatus::Closed),
                result(443, Protocol::Tcp, PortStatus::Open),
                result(53, Protocol::Udp, PortStatus::Open),
            ],
            abandoned: Vec::new(),
        };
        let seen: Vec<(u16, Protocol)> = report
            .observed()
            .into_iter()
            .map(|r| (r.port, r.protocol))
            .collect();
        assert_eq!(
            seen,
            vec![(53, Protocol::Udp), (443, Protocol::Tcp), (443, Protocol::Udp)]
        );
        assert_eq!(report.closed_count(), 1);
        // the underlying collection keeps everything
        assert_eq!(report.results.len(), 4);
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&PortStatus::OpenOrFiltered).unwrap();
        assert_eq!(s, "\"open_or_filtered\"");
        let p = serde_json::to_string(&Protocol::Udp).unwrap();
        assert_eq!(p, "\"UDP\"");
    }
}
