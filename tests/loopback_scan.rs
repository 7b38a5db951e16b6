//! Live capture scenarios on the loopback interface.
//!
//! These need permission to capture on `lo` (root or CAP_NET_RAW), so they are
//! ignored by default: `sudo cargo test --test loopback_scan -- --ignored`.
//! The capture gets only a best-effort head start before the probe is sent, so
//! each scenario is retried a few times before it is considered failed.

use std::net::Ipv4Addr;
use std::time::Duration;

use sniffscan_rs::config::ScanConfig;
use sniffscan_rs::coordinator::TaskCoordinator;
use sniffscan_rs::scanner;
use sniffscan_rs::types::{PortStatus, Protocol, ScanTask, TaskOutcome};

const LOOPBACK_IF: &str = "lo";
const ATTEMPTS: usize = 3;

async fn status_of(port: u16, protocol: Protocol) -> Option<PortStatus> {
    let coordinator =
        TaskCoordinator::new(Ipv4Addr::LOCALHOST, LOOPBACK_IF, Duration::from_millis(1000));
    match coordinator.run(ScanTask { port, protocol }).await {
        TaskOutcome::Completed(r) => Some(r.status),
        TaskOutcome::Abandoned(_) => None,
    }
}

async fn eventually(port: u16, protocol: Protocol, expected: PortStatus) {
    let mut last = None;
    for _ in 0..ATTEMPTS {
        last = status_of(port, protocol).await;
        if last == Some(expected) {
            return;
        }
    }
    panic!("{protocol} port {port}: expected {expected}, last saw {last:?}");
}

fn unused_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

fn unused_udp_port() -> u16 {
    let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    s.local_addr().unwrap().port()
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs capture privileges on lo"]
async fn tcp_listener_is_open() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    eventually(port, Protocol::Tcp, PortStatus::Open).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs capture privileges on lo"]
async fn tcp_without_listener_is_closed() {
    eventually(unused_port(), Protocol::Tcp, PortStatus::Closed).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs capture privileges on lo"]
async fn udp_without_listener_is_closed() {
    eventually(unused_udp_port(), Protocol::Udp, PortStatus::Closed).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs capture privileges on lo"]
async fn silent_udp_listener_is_open_or_filtered() {
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = silent.local_addr().unwrap().port();
    eventually(port, Protocol::Udp, PortStatus::OpenOrFiltered).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs capture privileges on lo"]
async fn full_scan_reports_every_task() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let closed = unused_port();

    let config = ScanConfig::new(
        "127.0.0.1",
        vec![open, closed],
        vec![Protocol::Tcp, Protocol::Udp],
        LOOPBACK_IF.into(),
        800,
        2,
        None,
    )
    .unwrap();
    let report = scanner::scan(&config).await.unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.results.len() + report.abandoned.len(), 4);
    assert!(report
        .results
        .iter()
        .any(|r| r.port == open && r.protocol == Protocol::Tcp && r.status == PortStatus::Open));
}
