use crate::types::Protocol;

/// Best-effort service name for a port, `"unknown"` when the port is not in the table.
pub fn service_name(port: u16, protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => tcp_service(port),
        Protocol::Udp => udp_service(port),
    }
    .unwrap_or("unknown")
}

fn tcp_service(port: u16) -> Option<&'static str> {
    let name = match port {
        20 => "ftp-data",
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        389 => "ldap",
        443 => "https",
        445 => "microsoft-ds",
        993 => "imaps",
        995 => "pop3s",
        1433 => "ms-sql-s",
        1521 => "oracle",
        3306 => "mysql",
        3389 => "ms-wbt-server",
        5432 => "postgresql",
        5900 => "vnc",
        6379 => "redis",
        8080 => "http-proxy",
        8443 => "https-alt",
        _ => return None,
    };
    Some(name)
}

fn udp_service(port: u16) -> Option<&'static str> {
    let name = match port {
        53 => "domain",
        67 => "bootps",
        68 => "bootpc",
        69 => "tftp",
        123 => "ntp",
        135 => "msrpc",
        137 => "netbios-ns",
        138 => "netbios-dgm",
        139 => "netbios-ssn",
        161 => "snmp",
        514 => "syslog",
        1900 => "ssdp",
        5353 => "mdns",
        _ => return None,
    };
    Some(name)
}
