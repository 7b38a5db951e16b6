use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::types::{PortStatus, Protocol, ScanReport};

/// One row of the JSON report. Closed ports never appear.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub ip: String,
    pub port: u16,
    pub status: PortStatus,
    pub protocol: Protocol,
    pub service: String,
    pub header_bytes: String,
}

/// Report rows for every observed (non-closed) result, ordered by port then protocol.
pub fn report_entries(report: &ScanReport) -> Vec<ReportEntry> {
    let ip = report.target.to_string();
    report
        .observed()
        .into_iter()
        .map(|r| ReportEntry {
            ip: ip.clone(),
            port: r.port,
            status: r.status,
            protocol: r.protocol,
            service: r.service.clone(),
            header_bytes: format_header_bytes(&r.header_bytes),
        })
        .collect()
}

/// `[0x45, 0x00, 0x3c]` -> `"45 00 3c"`.
pub fn format_header_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write the report as a pretty JSON array.
pub fn write_json_report(path: &Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create report file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, &report_entries(report))
        .with_context(|| format!("failed to write report: {}", path.display()))?;
    Ok(())
}
