use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use super::{Finding, ModuleName, Severity};

/// Output of one collector run, consumed only by the matching analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedData {
    pub module: ModuleName,
    pub records: serde_json::Value,
    #[serde(default)]
    pub raw: String,
}

impl CollectedData {
    pub fn new(module: ModuleName, records: serde_json::Value) -> Self {
        Self {
            module,
            records,
            raw: String::new(),
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }
}

/// Identification of the scanned host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub ip: String,
}

/// Result of one module, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleResult {
    pub module: ModuleName,
    pub findings: Vec<Finding>,
    pub records: serde_json::Value,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Scan-level verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Compromised,
    ThreatsFound,
    Warnings,
    Informational,
    Clean,
}

impl ScanStatus {
    /// Derive the verdict from the highest severity present
    pub fn from_max_severity(max: Option<Severity>) -> Self {
        match max {
            Some(Severity::Critical) => ScanStatus::Compromised,
            Some(Severity::High) => ScanStatus::ThreatsFound,
            Some(Severity::Medium) => ScanStatus::Warnings,
            Some(Severity::Low) | Some(Severity::Info) => ScanStatus::Informational,
            None => ScanStatus::Clean,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Compromised => "COMPROMISED",
            ScanStatus::ThreatsFound => "THREATS_FOUND",
            ScanStatus::Warnings => "WARNINGS",
            ScanStatus::Informational => "INFORMATIONAL",
            ScanStatus::Clean => "CLEAN",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity counts over all findings of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
    pub status: ScanStatus,
    pub max_severity: Option<Severity>,
}

impl Summary {
    /// Count findings by severity in a single pass
    pub fn calculate(findings: &[Finding]) -> Self {
        let mut summary = Summary {
            total: 0,
            critical: 0,
            high: 0,
            medium: 0,
            low: 0,
            info: 0,
            status: ScanStatus::Clean,
            max_severity: None,
        };

        for finding in findings {
            summary.total += 1;
            match finding.severity {
                Severity::Critical => summary.critical += 1,
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
                Severity::Info => summary.info += 1,
            }
            if summary.max_severity.map_or(true, |max| finding.severity > max) {
                summary.max_severity = Some(finding.severity);
            }
        }

        summary.status = ScanStatus::from_max_severity(summary.max_severity);
        summary
    }
}

/// Complete result of a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub os: String,
    pub ip: String,
    pub modules: Vec<ModuleResult>,
    pub findings: Vec<Finding>,
    pub summary: Summary,
    pub duration_ms: u64,
}

impl ScanResult {
    /// Modules that failed, with their error text
    pub fn failed_modules(&self) -> impl Iterator<Item = (&ModuleName, &str)> {
        self.modules
            .iter()
            .filter_map(|m| m.error.as_deref().map(|e| (&m.module, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity) -> Finding {
        Finding::new(ModuleName::Network, severity, "t", "d")
    }

    fn findings(critical: usize, high: usize, medium: usize, low: usize, info: usize) -> Vec<Finding> {
        let mut all = Vec::new();
        for (count, severity) in [
            (info, Severity::Info),
            (low, Severity::Low),
            (medium, Severity::Medium),
            (high, Severity::High),
            (critical, Severity::Critical),
        ] {
            all.extend((0..count).map(|_| finding(severity)));
        }
        all
    }

    #[test]
    fn test_status_ignores_magnitude_below_top_severity() {
        let summary = Summary::calculate(&findings(0, 0, 1, 5, 9));
        assert_eq!(summary.status, ScanStatus::Warnings);
        assert_eq!(summary.max_severity, Some(Severity::Medium));
        assert_eq!(summary.total, 15);
    }

    #[test]
    fn test_status_ladder() {
        assert_eq!(Summary::calculate(&findings(1, 0, 0, 0, 0)).status, ScanStatus::Compromised);
        assert_eq!(Summary::calculate(&findings(0, 2, 7, 0, 0)).status, ScanStatus::ThreatsFound);
        assert_eq!(Summary::calculate(&findings(0, 0, 0, 1, 0)).status, ScanStatus::Informational);
        assert_eq!(Summary::calculate(&findings(0, 0, 0, 0, 3)).status, ScanStatus::Informational);
        assert_eq!(Summary::calculate(&[]).status, ScanStatus::Clean);
    }

    #[test]
    fn test_total_equals_bucket_sum() {
        let summary = Summary::calculate(&findings(2, 3, 4, 5, 6));
        assert_eq!(
            summary.total,
            summary.critical + summary.high + summary.medium + summary.low + summary.info
        );
        assert_eq!(summary.total, 20);
    }

    #[test]
    fn test_summary_wire_names() {
        let json = serde_json::to_value(Summary::calculate(&findings(0, 1, 0, 0, 0))).unwrap();
        assert_eq!(json["status"], "THREATS_FOUND");
        assert_eq!(json["maxSeverity"], "HIGH");
    }
}
