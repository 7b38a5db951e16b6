use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::{TcpSocket, UdpSocket};
use tokio::time;
use tracing::{debug, warn};

use crate::types::PortStatus;

/// Active side of a task: provokes the reaction the correlator is watching for.
#[derive(Debug, Clone, Copy)]
pub struct Prober {
    addr: SocketAddrV4,
}

impl Prober {
    pub fn new(target: Ipv4Addr, port: u16) -> Self {
        Self {
            addr: SocketAddrV4::new(target, port),
        }
    }

    /// Non-blocking connect bounded by `timeout`.
    ///
    /// Completed handshake -> `Open`, connect error -> `Closed`,
    /// no answer in time -> `Filtered`, no local socket -> `Unknown`.
    pub async fn probe_tcp(&self, timeout: Duration) -> PortStatus {
        let socket = match TcpSocket::new_v4() {
            Ok(s) => s,
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "couldn't create TCP socket");
                return PortStatus::Unknown;
            }
        };

        match time::timeout(timeout, socket.connect(SocketAddr::V4(self.addr))).await {
            Ok(Ok(_stream)) => PortStatus::Open,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "connect refused");
                PortStatus::Closed
            }
            Err(_) => PortStatus::Filtered,
        }
    }

    /// Send one empty datagram. `true` only means the local stack accepted it.
    pub async fn probe_udp(&self) -> bool {
        let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "couldn't create UDP socket");
                return false;
            }
        };

        match socket.send_to(&[], self.addr).await {
            Ok(_) => true,
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "UDP probe send failed");
                false
            }
        }
    }
}
