use serde::{Deserialize, Serialize};
use super::{ModuleName, Severity};

/// Longest excerpt of matched text embedded in a finding description
pub const MAX_EXCERPT: usize = 150;

/// A single security observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Module-scoped sequential identifier, e.g. "NET-001"
    pub id: String,

    /// Module that produced the finding
    pub module: ModuleName,

    /// Severity level
    pub severity: Severity,

    /// Short headline
    pub title: String,

    /// Human-readable explanation
    pub description: String,

    /// Structured evidence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Optional remediation advice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Finding {
    /// Create a new finding. The id is assigned when it is pushed into a [`FindingSet`].
    pub fn new(
        module: ModuleName,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            module,
            severity,
            title: title.into(),
            description: description.into(),
            details: None,
            remediation: None,
        }
    }

    /// Attach structured evidence
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Add remediation advice to the finding
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

/// Ordered findings of one module, numbered in the order rules fire
#[derive(Debug)]
pub struct FindingSet {
    module: ModuleName,
    findings: Vec<Finding>,
}

impl FindingSet {
    pub fn new(module: ModuleName) -> Self {
        Self {
            module,
            findings: Vec::new(),
        }
    }

    pub fn push(&mut self, mut finding: Finding) {
        finding.module = self.module;
        finding.id = format!("{}-{:03}", self.module.id_prefix(), self.findings.len() + 1);
        self.findings.push(finding);
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn into_vec(self) -> Vec<Finding> {
        self.findings
    }
}

/// Cut matched text down to [`MAX_EXCERPT`] characters
pub fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_EXCERPT {
        return trimmed.to_string();
    }
    trimmed.chars().take(MAX_EXCERPT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_push_order() {
        let mut set = FindingSet::new(ModuleName::Systemd);
        set.push(Finding::new(ModuleName::Systemd, Severity::High, "a", "a"));
        set.push(Finding::new(ModuleName::Systemd, Severity::Low, "b", "b"));
        set.push(Finding::new(ModuleName::Systemd, Severity::Info, "c", "c"));

        let ids: Vec<_> = set.into_vec().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["SVC-001", "SVC-002", "SVC-003"]);
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        assert_eq!(excerpt(&long).chars().count(), MAX_EXCERPT);
        assert_eq!(excerpt("  short  "), "short");
    }

    #[test]
    fn test_optional_fields_skipped_when_absent() {
        let finding = Finding::new(ModuleName::Ssh, Severity::Info, "t", "d");
        let json = serde_json::to_value(&finding).unwrap();
        assert!(json.get("details").is_none());
        assert!(json.get("remediation").is_none());
        assert_eq!(json["module"], "ssh");
        assert_eq!(json["severity"], "INFO");
    }
}
