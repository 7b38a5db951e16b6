//! Classification of a captured reply into a port status.
//!
//! Everything here is a pure function of the captured bytes: no I/O, no state.
//! Header fields are only read through `etherparse` slices, which check lengths
//! before handing out a view, so short or garbled frames end up as `Unknown`.

use etherparse::{
    icmpv4::DestUnreachableHeader, Icmpv4Slice, Icmpv4Type, IpNumber, Ipv4HeaderSlice, NetSlice,
    SlicedPacket, TransportSlice, UdpHeaderSlice,
};

use crate::types::{PortStatus, Protocol, HEADER_SNIPPET_LEN};

/// Per-task facts the classifier needs besides the bytes themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyContext {
    /// Bytes to skip before the IP header starts.
    pub link_offset: usize,
    /// The port the active probe was sent to.
    pub probed_port: u16,
    /// Transport of the active probe. Replies on another transport belong to another task.
    pub protocol: Protocol,
}

/// Status derived from one captured frame, plus the leading IP header bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: PortStatus,
    pub header_bytes: Vec<u8>,
}

/// Classify one captured frame.
///
/// Returns `None` when the frame does not answer this task's probe: a TCP segment
/// seen by a UDP task, a UDP datagram or ICMP message seen by a TCP task, or an
/// ICMP port-unreachable that refers to a different port. Such frames must not
/// resolve the task.
pub fn classify(frame: &[u8], ctx: &ClassifyContext) -> Option<Classification> {
    let ip = frame.get(ctx.link_offset..).unwrap_or(&[]);
    let header_bytes = ip.iter().take(HEADER_SNIPPET_LEN).copied().collect();

    let status = match SlicedPacket::from_ip(ip) {
        Ok(packet) => status_of(&packet, ctx)?,
        Err(_) => PortStatus::Unknown,
    };

    Some(Classification {
        status,
        header_bytes,
    })
}

fn status_of(packet: &SlicedPacket<'_>, ctx: &ClassifyContext) -> Option<PortStatus> {
    // IPv6 is never probed.
    if !matches!(packet.net, Some(NetSlice::Ipv4(_))) {
        return Some(PortStatus::Unknown);
    }

    let status = match (&packet.transport, ctx.protocol) {
        (Some(TransportSlice::Tcp(tcp)), Protocol::Tcp) => {
            if tcp.rst() {
                PortStatus::Closed
            } else if tcp.ack() {
                // SYN+ACK, or a bare ACK from an established exchange
                PortStatus::Open
            } else {
                PortStatus::Unknown
            }
        }
        // A closed UDP port answers with ICMP, never with UDP.
        (Some(TransportSlice::Udp(_)), Protocol::Udp) => PortStatus::Open,
        (Some(TransportSlice::Icmpv4(icmp)), Protocol::Udp) => {
            return icmp_status(icmp, ctx.probed_port)
        }
        // answers a probe on the other transport
        (Some(TransportSlice::Tcp(_) | TransportSlice::Udp(_) | TransportSlice::Icmpv4(_)), _) => {
            return None
        }
        _ => PortStatus::Unknown,
    };
    Some(status)
}

fn icmp_status(icmp: &Icmpv4Slice<'_>, probed_port: u16) -> Option<PortStatus> {
    match icmp.icmp_type() {
        Icmpv4Type::DestinationUnreachable(DestUnreachableHeader::Port) => {
            if embedded_udp_dst_port(icmp.payload()) == Some(probed_port) {
                Some(PortStatus::Closed)
            } else {
                None
            }
        }
        _ => Some(PortStatus::Unknown),
    }
}

/// Destination port of the UDP datagram quoted inside an ICMP error.
///
/// The quote is the original IP header followed by at least 8 bytes of the
/// transport header; only the header lengths are checked, not the total length,
/// since routers are free to truncate the quoted datagram.
pub fn embedded_udp_dst_port(quoted: &[u8]) -> Option<u16> {
    let ip = Ipv4HeaderSlice::from_slice(quoted).ok()?;
    if ip.protocol() != IpNumber::UDP {
        return None;
    }
    let rest = quoted.get(ip.slice().len()..)?;
    let udp = UdpHeaderSlice::from_slice(rest).ok()?;
    Some(udp.destination_port())
}
