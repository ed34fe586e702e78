use anyhow::Result;
use hostscan_core::types::{Finding, ModuleResult, ScanResult};

const RULE: &str = "─────────────────────────────────────────────────────────────\n";
const BANNER: &str = "═══════════════════════════════════════════════════════════════\n";

/// Format scan result as human-readable text
pub fn format_text(result: &ScanResult) -> String {
    let mut output = String::new();

    // Header
    output.push_str(BANNER);
    output.push_str("              Host Compromise Assessment\n");
    output.push_str(BANNER);
    output.push('\n');

    output.push_str(&format!("Scanner Version: {}\n", result.version));
    output.push_str(&format!("Timestamp: {}\n", result.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
    output.push_str(&format!("Hostname: {}\n", result.hostname));
    output.push_str(&format!("OS: {}\n", result.os));
    output.push_str(&format!("IP: {}\n", result.ip));
    output.push_str(&format!("Duration: {} ms\n\n", result.duration_ms));

    let summary = &result.summary;
    output.push_str(RULE);
    output.push_str("VERDICT\n");
    output.push_str(RULE);
    output.push_str(&format!("Status: {}\n", summary.status));
    output.push_str(&format!("Total Findings: {}\n\n", summary.total));

    output.push_str("Findings by Severity:\n");
    for (label, count) in [
        ("CRITICAL", summary.critical),
        ("HIGH", summary.high),
        ("MEDIUM", summary.medium),
        ("LOW", summary.low),
        ("INFO", summary.info),
    ] {
        if count > 0 {
            output.push_str(&format!("  {:<9} {}\n", format!("{}:", label), count));
        }
    }
    output.push('\n');

    for module in &result.modules {
        if module.findings.is_empty() && module.error.is_none() {
            continue;
        }

        output.push_str(RULE);
        output.push_str(&format!("{} ({} ms)\n", module.module.as_str().to_uppercase(), module.duration_ms));
        output.push_str(RULE);

        if let Some(error) = &module.error {
            output.push_str(&format!("\n[ERROR] module failed: {}\n", error));
        }

        for finding in &module.findings {
            output.push_str(&format!("\n{} [{}] {}\n", finding.id, finding.severity, finding.title));
            output.push_str(&format!("    {}\n", finding.description));
            if let Some(remediation) = &finding.remediation {
                output.push_str(&format!("    → {}\n", remediation));
            }
        }

        output.push('\n');
    }

    output.push_str(BANNER);
    output.push_str("                    End of Report\n");
    output.push_str(BANNER);

    output
}

/// Format scan result as JSON
pub fn format_json(result: &ScanResult, pretty: bool) -> Result<String> {
    if pretty {
        Ok(serde_json::to_string_pretty(result)?)
    } else {
        Ok(serde_json::to_string(result)?)
    }
}

/// Format scan result as a Markdown report
pub fn format_markdown(result: &ScanResult) -> String {
    let mut output = String::new();
    let summary = &result.summary;

    output.push_str(&format!("# Host scan: {}\n\n", result.hostname));
    output.push_str(&format!(
        "- **Status:** {}\n- **Scanned:** {}\n- **OS:** {}\n- **IP:** {}\n- **Version:** {}\n\n",
        summary.status,
        result.timestamp.to_rfc3339(),
        result.os,
        result.ip,
        result.version
    ));

    output.push_str("| Critical | High | Medium | Low | Info | Total |\n");
    output.push_str("|---|---|---|---|---|---|\n");
    output.push_str(&format!(
        "| {} | {} | {} | {} | {} | {} |\n\n",
        summary.critical, summary.high, summary.medium, summary.low, summary.info, summary.total
    ));

    let failed: Vec<&ModuleResult> = result.modules.iter().filter(|m| m.error.is_some()).collect();
    if !failed.is_empty() {
        output.push_str("## Module errors\n\n");
        for module in failed {
            output.push_str(&format!(
                "- `{}`: {}\n",
                module.module,
                module.error.as_deref().unwrap_or_default()
            ));
        }
        output.push('\n');
    }

    if result.findings.is_empty() {
        output.push_str("No findings.\n");
        return output;
    }

    output.push_str("## Findings\n\n");
    output.push_str("| ID | Severity | Module | Title |\n");
    output.push_str("|---|---|---|---|\n");
    for finding in &result.findings {
        output.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            finding.id,
            finding.severity,
            finding.module,
            escape_cell(&finding.title)
        ));
    }
    output.push('\n');

    for finding in &result.findings {
        output.push_str(&markdown_detail(finding));
    }

    output
}

fn markdown_detail(finding: &Finding) -> String {
    let mut section = format!("### {} {}\n\n{}\n", finding.id, finding.title, finding.description);
    if let Some(remediation) = &finding.remediation {
        section.push_str(&format!("\n**Remediation:** {}\n", remediation));
    }
    section.push('\n');
    section
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hostscan_core::types::{ModuleName, Severity, Summary};

    fn sample() -> ScanResult {
        let mut finding = Finding::new(
            ModuleName::Rootkit,
            Severity::Critical,
            "Dynamic linker preload is configured",
            "/etc/ld.so.preload forces a library into every process",
        )
        .with_remediation("Empty the file");
        finding.id = "RK-001".to_string();
        let findings = vec![finding];
        ScanResult {
            version: "0.1.0".to_string(),
            timestamp: Utc::now(),
            hostname: "web-01".to_string(),
            os: "Debian GNU/Linux 12 (bookworm)".to_string(),
            ip: "10.0.0.5".to_string(),
            modules: vec![
                ModuleResult {
                    module: ModuleName::Rootkit,
                    findings: findings.clone(),
                    records: serde_json::Value::Null,
                    duration_ms: 12,
                    error: None,
                },
                ModuleResult {
                    module: ModuleName::Network,
                    findings: Vec::new(),
                    records: serde_json::Value::Null,
                    duration_ms: 3,
                    error: Some("collection failed: boom".to_string()),
                },
            ],
            summary: Summary::calculate(&findings),
            findings,
            duration_ms: 20,
        }
    }

    #[test]
    fn test_text_lists_findings_and_errors() {
        let text = format_text(&sample());
        assert!(text.contains("Status: COMPROMISED"));
        assert!(text.contains("RK-001 [CRITICAL] Dynamic linker preload is configured"));
        assert!(text.contains("[ERROR] module failed: collection failed: boom"));
    }

    #[test]
    fn test_markdown_table() {
        let markdown = format_markdown(&sample());
        assert!(markdown.contains("| RK-001 | CRITICAL | rootkit | Dynamic linker preload is configured |"));
        assert!(markdown.contains("- `network`: collection failed: boom"));
    }

    #[test]
    fn test_json_round_trips_wire_names() {
        let json = format_json(&sample(), false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["maxSeverity"], "CRITICAL");
        assert_eq!(value["modules"][0]["durationMs"], 12);
    }
}
