use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for security findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a free-text severity from the threat database.
    ///
    /// Unknown labels fall back to `Medium`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            "info" => Severity::Info,
            _ => Severity::Medium,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Process exit code for the highest severity of a scan
    pub fn exit_code(max: Option<Severity>) -> i32 {
        match max {
            Some(Severity::Critical) | Some(Severity::High) => 3,
            Some(Severity::Medium) => 2,
            Some(Severity::Low) | Some(Severity::Info) => 1,
            None => 0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_from_label_defaults_to_medium() {
        assert_eq!(Severity::from_label("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::from_label(" high "), Severity::High);
        assert_eq!(Severity::from_label("severe"), Severity::Medium);
        assert_eq!(Severity::from_label(""), Severity::Medium);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Severity::exit_code(Some(Severity::Critical)), 3);
        assert_eq!(Severity::exit_code(Some(Severity::High)), 3);
        assert_eq!(Severity::exit_code(Some(Severity::Medium)), 2);
        assert_eq!(Severity::exit_code(Some(Severity::Low)), 1);
        assert_eq!(Severity::exit_code(Some(Severity::Info)), 1);
        assert_eq!(Severity::exit_code(None), 0);
    }

    #[test]
    fn test_serializes_as_label() {
        let json = serde_json::to_string(&Severity::High).unwrap();
        assert_eq!(json, "\"HIGH\"");
    }
}
