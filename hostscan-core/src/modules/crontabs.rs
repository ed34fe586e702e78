use std::collections::HashSet;

use crate::exec::{shell_quote, CommandRunner};
use crate::intel::ThreatIntel;
use crate::types::*;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::accounts::login_users;
use super::{
    content_lines, decode_records, encode_records, lenient_vec, Analyzer, Collector, QUICK,
};

/// Drop-in directories read by cron and anacron
const CRON_DIRS: &[&str] = &[
    "/etc/cron.d",
    "/etc/cron.hourly",
    "/etc/cron.daily",
    "/etc/cron.weekly",
    "/etc/cron.monthly",
];

/// Per-user spool locations (Debian, then RHEL)
const SPOOL_DIRS: &[&str] = &["/var/spool/cron/crontabs", "/var/spool/cron"];

static DOWNLOAD_TO_SHELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(curl|wget|fetch)\b[^|]*\|\s*(sudo\s+)?(ba|da|z|k)?sh\b").expect("valid regex")
});
static BASE64_DECODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)base64\s+(-d|--decode|-D)\b").expect("valid regex"));
static TEMP_EXEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[\s;&|=])(/tmp|/var/tmp|/dev/shm)/").expect("valid regex"));
static HIDDEN_EXEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/\.[A-Za-z0-9_][A-Za-z0-9_.-]*/").expect("valid regex"));
static ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\s*=").expect("valid regex"));

/// One crontab-like text and where it came from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronSource {
    pub label: String,
    pub content: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CrontabRecords {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub sources: Vec<CronSource>,
}

/// Crontab Collector
///
/// Gathers system, drop-in and per-user crontabs
pub struct CrontabsCollector;

impl CrontabsCollector {
    fn push(sources: &mut Vec<CronSource>, label: String, content: String) {
        if !content.trim().is_empty() {
            sources.push(CronSource { label, content });
        }
    }

    fn user_crontab(runner: &dyn CommandRunner, user: &str) -> String {
        runner
            .execute(&format!("crontab -l -u {}", shell_quote(user)), QUICK)
            .stdout
    }

    fn list_dir(runner: &dyn CommandRunner, dir: &str) -> Vec<String> {
        runner
            .execute(&format!("ls -1 {}", shell_quote(dir)), QUICK)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Collector for CrontabsCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let mut sources = Vec::new();
        let mut seen_users = HashSet::new();

        Self::push(&mut sources, "crontab:root".to_string(), Self::user_crontab(runner, "root"));
        seen_users.insert("root".to_string());

        Self::push(
            &mut sources,
            "/etc/crontab".to_string(),
            runner.execute("cat /etc/crontab", QUICK).stdout,
        );

        for dir in CRON_DIRS {
            for name in Self::list_dir(runner, dir) {
                let path = format!("{}/{}", dir, name);
                let content = runner.execute(&format!("cat {}", shell_quote(&path)), QUICK).stdout;
                Self::push(&mut sources, path, content);
            }
        }

        for user in login_users(runner) {
            if seen_users.insert(user.username.clone()) {
                let content = Self::user_crontab(runner, &user.username);
                Self::push(&mut sources, format!("crontab:{}", user.username), content);
            }
        }

        // Spool files for accounts that no longer have a login shell, or no account at all
        for dir in SPOOL_DIRS {
            for name in Self::list_dir(runner, dir) {
                if name == "crontabs" || seen_users.contains(&name) {
                    continue;
                }
                let path = format!("{}/{}", dir, name);
                let content = runner.execute(&format!("cat {}", shell_quote(&path)), QUICK).stdout;
                Self::push(&mut sources, path, content);
                seen_users.insert(name);
            }
        }

        let raw = sources
            .iter()
            .map(|s| format!("# {}\n{}", s.label, s.content))
            .collect::<Vec<_>>()
            .join("\n");
        let records = CrontabRecords { sources };
        Ok(CollectedData::new(ModuleName::Crontabs, encode_records(&records)?).with_raw(raw))
    }
}

/// Crontab Analyzer
///
/// Evaluates every scheduled command line independently
pub struct CrontabsAnalyzer;

impl CrontabsAnalyzer {
    fn finding(severity: Severity, title: &str, source: &CronSource, line: &str, remediation: &str) -> Finding {
        let text = excerpt(line);
        Finding::new(
            ModuleName::Crontabs,
            severity,
            title,
            format!("{}: {}", source.label, text),
        )
        .with_details(json!({ "source": source.label, "line": text }))
        .with_remediation(remediation)
    }
}

impl Analyzer for CrontabsAnalyzer {
    fn analyze(&self, data: &CollectedData, _intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: CrontabRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Crontabs);

        for source in &records.sources {
            for line in content_lines(&source.content) {
                if ASSIGNMENT.is_match(line) {
                    continue;
                }

                if DOWNLOAD_TO_SHELL.is_match(line) {
                    findings.push(Self::finding(
                        Severity::Critical,
                        "Cron job pipes a download into a shell",
                        source,
                        line,
                        "Remove the entry; download-and-execute cron jobs are the classic miner/botnet persistence",
                    ));
                }

                if BASE64_DECODE.is_match(line) {
                    findings.push(Self::finding(
                        Severity::High,
                        "Cron job decodes base64 payload",
                        source,
                        line,
                        "Decode the payload offline and remove the entry if it is not recognised",
                    ));
                }

                let from_temp = TEMP_EXEC.is_match(line);
                if from_temp {
                    findings.push(Self::finding(
                        Severity::High,
                        "Cron job executes from temporary directory",
                        source,
                        line,
                        "Scheduled jobs should not run files from /tmp, /var/tmp or /dev/shm",
                    ));
                }

                if !from_temp && HIDDEN_EXEC.is_match(line) {
                    findings.push(Self::finding(
                        Severity::High,
                        "Cron job executes from hidden directory",
                        source,
                        line,
                        "Inspect the hidden directory referenced by the job",
                    ));
                }
            }
        }

        Ok(findings.into_vec())
    }
}
