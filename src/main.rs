use std::net::IpAddr;
use std::path::PathBuf;

use sniffscan_rs::config::{ScanConfig, DEFAULT_TIMEOUT_MS};
use sniffscan_rs::report::{format_header_bytes, write_json_report};
use sniffscan_rs::risk::{self, Sensitivity};
use sniffscan_rs::types::{Protocol, ScanReport};
use sniffscan_rs::{netdetect, ports, scanner};

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Port scanner that confirms each probe against the reply captured on the wire.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sniffscan-rs",
    version,
    about = "Port scanner that confirms each TCP/UDP probe against the reply captured on the wire.",
    long_about = None
)]
struct Cli {
    /// IPv4 address of the host to scan.
    target: String,

    /// Ports to scan: comma separated ports and ranges (e.g. 22,80,8000-8010).
    #[arg(short = 'p', long, default_value = ports::default_port_spec())]
    ports: String,

    /// Scan TCP ports (the default when no protocol flag is given).
    #[arg(long)]
    tcp: bool,

    /// Scan UDP ports.
    #[arg(short = 'u', long)]
    udp: bool,

    /// Interface to capture replies on. Auto-detected from the target when omitted.
    #[arg(short = 'i', long)]
    interface: Option<String>,

    /// Probe and reply timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Worker threads (0 = one per available CPU).
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Write results as pretty JSON to this path (optional).
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// How eagerly open ports are flagged as suspicious.
    #[arg(long, default_value = "medium", value_enum)]
    sensitivity: SensitivityArg,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum SensitivityArg {
    Low,
    Medium,
    High,
}

impl From<SensitivityArg> for Sensitivity {
    fn from(s: SensitivityArg) -> Self {
        match s {
            SensitivityArg::Low => Sensitivity::Low,
            SensitivityArg::Medium => Sensitivity::Medium,
            SensitivityArg::High => Sensitivity::High,
        }
    }
}

impl Cli {
    fn protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::new();
        if self.tcp || !self.udp {
            protocols.push(Protocol::Tcp);
        }
        if self.udp {
            protocols.push(Protocol::Udp);
        }
        protocols
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let port_list = ports::parse_ports_str(&cli.ports).context("invalid --ports value")?;
    let interface = match &cli.interface {
        Some(name) => name.clone(),
        None => match cli.target.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => netdetect::detect_capture_interface(v4)?,
            // leave it empty; validation below reports the bad target
            _ => String::new(),
        },
    };
    let sensitivity = Sensitivity::from(cli.sensitivity);
    let config = ScanConfig::new(
        &cli.target,
        port_list,
        cli.protocols(),
        interface,
        cli.timeout_ms,
        cli.threads,
        cli.output.clone(),
    )?;

    println!("sniffscan-rs configuration:");
    println!("  target       : {}", config.target);
    println!("  ports        : {}", config.ports.len());
    println!("  tasks        : {}", config.task_count());
    println!(
        "  protocols    : {}",
        config
            .protocols
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  interface    : {}", config.interface);
    println!("  timeout_ms   : {}", config.timeout.as_millis());
    println!("  threads      : {}", config.threads);
    println!("  sensitivity  : {}", sensitivity);
    println!(
        "  output       : {}",
        config
            .output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    let report = runtime.block_on(scanner::scan(&config))?;

    print_results_table(&report);
    print_suspicious(&report, sensitivity);

    if let Some(path) = config.output.as_deref() {
        if let Err(e) = write_json_report(path, &report) {
            eprintln!("Failed to write JSON to {}: {e:#}", path.display());
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    println!("\nScan finished at {}", now_rfc3339());
    Ok(())
}

fn print_results_table(report: &ScanReport) {
    let observed = report.observed();
    let port_w = "port/proto".len();
    let status_w = "open_or_filtered".len();
    let mut service_w = "service".len();
    for r in &observed {
        service_w = service_w.max(r.service.len());
    }

    println!(
        "\nObserved ports on {}: {} (scanned: {}, closed hidden: {}, abandoned: {})",
        report.target,
        observed.len(),
        report.total,
        report.closed_count(),
        report.abandoned.len()
    );
    println!(
        "{:<port_w$}  {:<status_w$}  {:<service_w$}  header",
        "port/proto", "status", "service",
    );
    println!("{:-<port_w$}  {:-<status_w$}  {:-<service_w$}  {:-<6}", "", "", "", "");
    for r in observed {
        let port_proto = format!("{}/{}", r.port, r.protocol.to_string().to_lowercase());
        println!(
            "{:<port_w$}  {:<status_w$}  {:<service_w$}  {}",
            port_proto,
            r.status.as_str(),
            r.service,
            format_header_bytes(&r.header_bytes),
        );
    }
    for a in &report.abandoned {
        println!("  abandoned {}/{}: {}", a.task.port, a.task.protocol, a.reason);
    }
}

fn print_suspicious(report: &ScanReport, sensitivity: Sensitivity) {
    let flagged = risk::suspicious(&report.results, sensitivity);
    let pattern = risk::host_pattern(&report.results);
    if flagged.is_empty() && pattern.is_none() {
        return;
    }

    println!("\nSuspicious ports (sensitivity {sensitivity}):");
    for s in &flagged {
        println!(
            "  {}/{:<4} score {:>3}  {}",
            s.result.port,
            s.result.protocol.to_string().to_lowercase(),
            s.score,
            s.reason
        );
    }
    if let Some(pattern) = pattern {
        println!("  warning: {pattern}");
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
