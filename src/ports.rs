use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;

/// Port specification used when none is given on the command line.
pub fn default_port_spec() -> &'static str {
    "1-1024"
}

/// Parse a port specification into a sorted, deduplicated list of ports (1..=65535).
///
/// Supported tokens, separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and empty tokens are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut seen = BTreeSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");

        for token in line.split(',').map(str::trim) {
            if token.is_empty() {
                continue;
            }

            if let Some((a, b)) = token.split_once('-') {
                let start = parse_port_str(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {token}"))?;
                let end = parse_port_str(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {token}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                seen.extend(start..=end);
                continue;
            }

            let p = parse_port_str(token)
                .with_context(|| format!("line {line_no}: invalid port value: {token}"))?;
            seen.insert(p);
        }
    }

    Ok(seen.into_iter().collect())
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
