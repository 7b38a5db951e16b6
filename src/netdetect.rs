use anyhow::{anyhow, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::debug;

/// An IPv4 address bound to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalV4 {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub loopback: bool,
}

/// Pick the interface to capture replies from `target` on.
///
/// Loopback targets use the loopback interface; otherwise the interface whose
/// IPv4 network contains the target wins, then the first non-loopback IPv4 interface.
pub fn detect_capture_interface(target: Ipv4Addr) -> Result<String> {
    let locals: Vec<LocalV4> = get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(ref v4) => Some(LocalV4 {
                loopback: iface.is_loopback(),
                name: iface.name.clone(),
                ip: v4.ip,
                netmask: v4.netmask,
            }),
            IfAddr::V6(_) => None,
        })
        .collect();

    let name = select_interface(&locals, target)
        .ok_or_else(|| anyhow!("no IPv4 interface found to capture traffic from {target}"))?;
    debug!(interface = %name, %target, "selected capture interface");
    Ok(name)
}

/// Interface selection over an already-enumerated address list.
pub fn select_interface(locals: &[LocalV4], target: Ipv4Addr) -> Option<String> {
    if target.is_loopback() {
        return locals
            .iter()
            .find(|l| l.loopback)
            .map(|l| l.name.clone());
    }

    let on_link = locals.iter().find(|l| {
        !l.loopback
            && interface_network(l.ip, l.netmask)
                .map(|net| net.contains(&target))
                .unwrap_or(false)
    });
    if let Some(l) = on_link {
        return Some(l.name.clone());
    }

    locals
        .iter()
        .find(|l| !l.loopback)
        .map(|l| l.name.clone())
}

/// The network an interface address belongs to, e.g. `192.168.1.42/255.255.255.0` -> `192.168.1.0/24`.
pub fn interface_network(ip: Ipv4Addr, netmask: Ipv4Addr) -> Option<Ipv4Net> {
    Ipv4Net::with_netmask(ip, netmask).ok().map(|n| n.trunc())
}
