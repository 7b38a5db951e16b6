//! Risk annotation of classified results.
//!
//! Open ports are scored against static tables of ports associated with malware,
//! remote administration, file sharing and development servers. Results scoring at
//! or above the sensitivity threshold, plus any run of five or more consecutive
//! open ports, are reported as suspicious together with the reasons.

use std::collections::BTreeSet;
use std::fmt;

use crate::types::{PortStatus, Protocol, ScanResult};

/// Ports tied to well-known malware.
const MALWARE_PORTS: &[u16] = &[
    1243, 1999, 2001, 2115, 2140, 3129, 3150, 4590, 5000, 5001, 5011, 6400, 6670, 6711, 6712,
    6713, 6776, 7000, 7300, 7301, 7306, 7307, 7308, 9872, 9873, 9874, 9875, 10067, 10167, 12223,
    12345, 12346, 16969, 20034, 21544, 30100, 31337, 31338, 54321,
];

const ADMIN_PORTS: &[u16] = &[
    22, 23, 135, 139, 445, 1433, 1521, 3306, 3389, 5432, 5900, 5901, 5902, 5903, 5904, 5905, 6000,
    6001, 6002, 8080, 8443, 9200,
];

const TROJAN_PORTS: &[u16] = &[
    1234, 1243, 1245, 1492, 1600, 1807, 1981, 1999, 2001, 2023, 2115, 2140, 2989, 3024, 3150,
    3700, 4000, 4092, 4590, 5000, 5001, 5011, 5321, 5400, 5401, 5402, 5550, 5569, 5637, 5638,
    6400, 6670, 6771, 6776, 6912, 6969, 7000, 7300, 7301, 7306, 7307, 7308, 7789, 9872, 9873,
    9874, 9875, 9989, 10067, 10167, 11000, 11223, 12076, 12223, 12345, 12346, 12361, 12362,
    13000, 16969, 20000, 20001, 20034, 21544, 22222, 23456, 26274, 30100, 30101, 30102, 31336,
    31337, 31338, 33333, 40412, 40421, 40422, 40423, 40426, 47262, 50505, 50766, 53001, 54320,
    54321, 61466, 65000,
];

const BACKDOOR_PORTS: &[u16] = &[
    1524, 1999, 2001, 4444, 6667, 6668, 6669, 7000, 8080, 8888, 9999, 10000, 31337, 31338, 54321,
];

const P2P_PORTS: &[u16] = &[
    411, 412, 1214, 4661, 4662, 4665, 4672, 6346, 6347, 6881, 6882, 6883, 6884, 6885, 6886, 6887,
    6888, 6889, 6890, 6891, 6892, 6893, 6894, 6895, 6896, 6897, 6898, 6899, 6969,
];

/// Development servers that rarely belong on a production host.
const DEV_PORTS: &[u16] = &[3000, 4000, 5000, 8000, 8080, 8081, 8888, 9000, 9090];

/// Consecutive open ports needed before the run itself is suspicious.
const RUN_LEN: usize = 5;

const RUN_REASON: &str = "part of a run of consecutive open ports";
const NO_CATEGORY_REASON: &str = "open port with no specific risk category";

/// How eager the analysis is to flag a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl Sensitivity {
    /// Minimum risk score for a port to be flagged.
    pub fn threshold(self) -> u32 {
        match self {
            Sensitivity::Low => 40,
            Sensitivity::Medium => 25,
            Sensitivity::High => 15,
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
        };
        f.write_str(s)
    }
}

/// A result worth a closer look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspicious {
    pub result: ScanResult,
    pub score: u32,
    pub reason: String,
}

fn listed(table: &[u16], port: u16) -> bool {
    table.binary_search(&port).is_ok()
}

/// Dynamic range, round numbers in the low registered range, or 31000-33000.
fn is_unusual(port: u16) -> bool {
    port > 49152
        || ((1024..=5000).contains(&port) && port % 1000 == 0)
        || (31000..=33000).contains(&port)
}

/// Risk score of one result. Only `Open` results score; everything else is 0.
pub fn risk_score(result: &ScanResult) -> u32 {
    if result.status != PortStatus::Open {
        return 0;
    }
    let port = result.port;
    let weights = [
        (listed(MALWARE_PORTS, port), 50),
        (listed(TROJAN_PORTS, port), 40),
        (listed(BACKDOOR_PORTS, port), 35),
        (listed(P2P_PORTS, port), 25),
        (listed(ADMIN_PORTS, port), 20),
        (is_unusual(port), 15),
        (listed(DEV_PORTS, port), 15),
    ];
    10 + weights
        .iter()
        .filter(|(hit, _)| *hit)
        .map(|(_, w)| w)
        .sum::<u32>()
}

/// Why `port` looks risky, as a `; ` separated list.
pub fn risk_reason(port: u16, sensitivity: Sensitivity) -> String {
    let mut reasons = Vec::new();
    if listed(MALWARE_PORTS, port) {
        reasons.push("associated with known malware");
    }
    if listed(TROJAN_PORTS, port) {
        reasons.push("commonly used by trojans");
    }
    if listed(BACKDOOR_PORTS, port) {
        reasons.push("typical backdoor port");
    }
    if listed(P2P_PORTS, port) {
        reasons.push("peer-to-peer port that may break policy");
    }
    if listed(ADMIN_PORTS, port) {
        reasons.push("sensitive administrative service exposed");
    }
    if is_unusual(port) {
        reasons.push("port in an unusual range");
    }
    if listed(DEV_PORTS, port) {
        reasons.push("development server port");
    }
    if sensitivity == Sensitivity::High && port > 10000 && port < u16::MAX {
        reasons.push("high port uncommon for standard services");
    }

    if reasons.is_empty() {
        NO_CATEGORY_REASON.to_string()
    } else {
        reasons.join("; ")
    }
}

/// Open (protocol, port) pairs that sit in a run of at least five consecutive open ports.
fn consecutive_runs(results: &[ScanResult]) -> BTreeSet<(Protocol, u16)> {
    let open: BTreeSet<(Protocol, u16)> = results
        .iter()
        .filter(|r| r.status == PortStatus::Open)
        .map(|r| (r.protocol, r.port))
        .collect();
    let open: Vec<(Protocol, u16)> = open.into_iter().collect();

    let mut in_run = BTreeSet::new();
    for window in open.windows(RUN_LEN) {
        let consecutive = window
            .windows(2)
            .all(|w| w[0].0 == w[1].0 && w[1].1 == w[0].1 + 1);
        if consecutive {
            in_run.extend(window.iter().copied());
        }
    }
    in_run
}

/// Flag results scoring at or above the sensitivity threshold, plus runs of
/// consecutive open ports. Closed results are never flagged. Sorted by (port, protocol).
pub fn suspicious(results: &[ScanResult], sensitivity: Sensitivity) -> Vec<Suspicious> {
    let threshold = sensitivity.threshold();
    let runs = consecutive_runs(results);

    let mut flagged: Vec<Suspicious> = results
        .iter()
        .filter(|r| r.status != PortStatus::Closed)
        .filter_map(|r| {
            let score = risk_score(r);
            let reason = if score >= threshold {
                risk_reason(r.port, sensitivity)
            } else if runs.contains(&(r.protocol, r.port)) {
                RUN_REASON.to_string()
            } else {
                return None;
            };
            Some(Suspicious {
                result: r.clone(),
                score,
                reason,
            })
        })
        .collect();
    flagged.sort_by_key(|s| (s.result.port, s.result.protocol));
    flagged
}

/// Host-wide warning: too many admin services, any known malware port, or over 20 open ports.
pub fn host_pattern(results: &[ScanResult]) -> Option<&'static str> {
    let open: Vec<u16> = results
        .iter()
        .filter(|r| r.status == PortStatus::Open)
        .map(|r| r.port)
        .collect();

    if open.iter().filter(|&&p| listed(ADMIN_PORTS, p)).count() > 3 {
        Some("more than three administrative services are open")
    } else if open.iter().any(|&p| listed(MALWARE_PORTS, p)) {
        Some("a port associated with known malware is open")
    } else if open.len() > 20 {
        Some("more than 20 ports are open")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(port: u16) -> ScanResult {
        with_status(port, PortStatus::Open)
    }

    fn with_status(port: u16, status: PortStatus) -> ScanResult {
        ScanResult {
            port,
            protocol: Protocol::Tcp,
            status,
            service: "unknown".into(),
            header_bytes: Vec::new(),
        }
    }

    #[test]
    fn tables_are_sorted() {
        for table in [
            MALWARE_PORTS,
            ADMIN_PORTS,
            TROJAN_PORTS,
            BACKDOOR_PORTS,
            P2P_PORTS,
            DEV_PORTS,
        ] {
            assert!(table.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn score_adds_categories() {
        // malware + trojan + backdoor + unusual range
        assert_eq!(risk_score(&open(31337)), 10 + 50 + 40 + 35 + 15);
        assert_eq!(risk_score(&open(22)), 10 + 20);
        assert_eq!(risk_score(&open(8080)), 10 + 35 + 20 + 15);
        assert_eq!(risk_score(&open(443)), 10);
    }

    #[test]
    fn only_open_results_score() {
        assert_eq!(risk_score(&with_status(31337, PortStatus::Closed)), 0);
        assert_eq!(risk_score(&with_status(31337, PortStatus::OpenOrFiltered)), 0);
        assert_eq!(risk_score(&with_status(31337, PortStatus::Filtered)), 0);
    }

    #[test]
    fn sensitivity_moves_the_threshold() {
        let results = vec![open(22), open(443), open(12345)];

        let low: Vec<u16> = suspicious(&results, Sensitivity::Low)
            .iter()
            .map(|s| s.result.port)
            .collect();
        assert_eq!(low, vec![12345]);

        let medium: Vec<u16> = suspicious(&results, Sensitivity::Medium)
            .iter()
            .map(|s| s.result.port)
            .collect();
        assert_eq!(medium, vec![22, 12345]);
    }

    #[test]
    fn reasons_are_joined() {
        let reason = risk_reason(8080, Sensitivity::Medium);
        assert!(reason.contains("typical backdoor port"));
        assert!(reason.contains("sensitive administrative service exposed"));
        assert!(reason.contains("; "));
        assert_eq!(risk_reason(443, Sensitivity::Medium), NO_CATEGORY_REASON);
        assert!(risk_reason(20500, Sensitivity::High).contains("high port"));
        assert!(!risk_reason(20500, Sensitivity::Medium).contains("high port"));
    }

    #[test]
    fn consecutive_open_ports_are_flagged() {
        let results: Vec<ScanResult> = (100..105).map(open).chain([open(200)]).collect();
        let flagged = suspicious(&results, Sensitivity::Low);
        let ports: Vec<u16> = flagged.iter().map(|s| s.result.port).collect();
        assert_eq!(ports, vec![100, 101, 102, 103, 104]);
        assert!(flagged.iter().all(|s| s.reason == RUN_REASON));
    }

    #[test]
    fn runs_do_not_cross_protocols() {
        let mut results: Vec<ScanResult> = (100..103).map(open).collect();
        results.extend((103..105).map(|port| ScanResult {
            protocol: Protocol::Udp,
            ..open(port)
        }));
        assert!(suspicious(&results, Sensitivity::Low).is_empty());
    }

    #[test]
    fn closed_results_are_never_flagged() {
        let results = vec![with_status(31337, PortStatus::Closed)];
        assert!(suspicious(&results, Sensitivity::High).is_empty());
    }

    #[test]
    fn host_patterns() {
        assert_eq!(host_pattern(&[open(443)]), None);
        assert!(host_pattern(&[open(22), open(23), open(445), open(3389)]).is_some());
        assert!(host_pattern(&[open(54321)]).is_some());
        let many: Vec<ScanResult> = (1000..1021).map(|p| open(p * 2)).collect();
        assert_eq!(host_pattern(&many), Some("more than 20 ports are open"));
    }
}
