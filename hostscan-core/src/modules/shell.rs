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
use super::{decode_records, encode_records, lenient_vec, Analyzer, Collector, QUICK};

const SYSTEM_PROFILES: &[&str] = &[
    "/etc/profile",
    "/etc/bash.bashrc",
    "/etc/bashrc",
    "/etc/environment",
    "/etc/zsh/zshrc",
    "/etc/zsh/zprofile",
];

const USER_PROFILES: &[&str] = &[
    ".bashrc",
    ".bash_profile",
    ".bash_login",
    ".bash_logout",
    ".profile",
    ".zshrc",
    ".zprofile",
];

const PROFILE_D: &str = "/etc/profile.d";

/// Token table, scanned in order. A line yields at most one hit per label.
static TOKENS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("download", r"\b(curl|wget)\b"),
        ("network-utility", r"\b(nc|ncat|netcat|socat|telnet)\b"),
        ("dynamic-exec", r"\beval\b|(?:^|[\s;&|(])(?:source|\.)\s+<\("),
        ("base64", r"(?i)base64\s+(-d|--decode|-D)\b"),
        ("exec", r"\bexec\s+[^\s0-9<>]"),
        ("device-redirection", r"/dev/(tcp|udp)/"),
        ("onion", r"(?i)\b[a-z2-7]{16,56}\.onion\b"),
        ("obfuscated-http", r"(?i)(\\x68\\x74\\x74\\x70|aHR0cDovL|aHR0cHM6Ly)"),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// `eval` of a stock environment generator, as shipped in distribution and tool init snippets
static BENIGN_EVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\beval\s+"?\$\(\s*(?:[A-Z_]+=\S+\s+)*(?:/(?:usr/(?:local/)?|opt/homebrew/|home/linuxbrew/\.linuxbrew/)?bin/)?(?:dircolors|lesspipe(?:\.sh)?|ssh-agent|gpg-agent|keychain|pyenv|rbenv|nodenv|direnv|brew|starship|zoxide)\b[^$`;|&()]*\)"?"#,
    )
    .expect("valid regex")
});

/// One token hit in a startup file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellHit {
    pub file: String,
    pub line: usize,
    pub pattern: String,
    pub text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShellRecords {
    pub files_scanned: Vec<String>,
    #[serde(deserialize_with = "lenient_vec")]
    pub hits: Vec<ShellHit>,
}

/// Shell Startup File Collector
///
/// Reads login and interactive shell startup files and records token hits
pub struct ShellCollector;

impl ShellCollector {
    fn candidates(runner: &dyn CommandRunner) -> Vec<String> {
        let mut files: Vec<String> = SYSTEM_PROFILES.iter().map(|p| p.to_string()).collect();

        let mut homes = vec!["/root".to_string()];
        homes.extend(login_users(runner).into_iter().map(|u| u.home));
        let mut seen = HashSet::new();
        for home in homes.into_iter().filter(|h| !h.is_empty() && h != "/") {
            if seen.insert(home.clone()) {
                let home = home.trim_end_matches('/').to_string();
                files.extend(USER_PROFILES.iter().map(|f| format!("{}/{}", home, f)));
            }
        }

        let listing = runner.execute(&format!("ls -1 {}", PROFILE_D), QUICK);
        files.extend(
            listing
                .lines()
                .filter(|name| name.ends_with(".sh"))
                .map(|name| format!("{}/{}", PROFILE_D, name)),
        );
        files
    }

    /// Every non-comment token hit in `content`, with 1-based line numbers
    pub fn scan(file: &str, content: &str) -> Vec<ShellHit> {
        let mut hits = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            for (label, regex) in TOKENS.iter() {
                if !regex.is_match(text) {
                    continue;
                }
                if *label == "dynamic-exec" && !regex.is_match(&BENIGN_EVAL.replace_all(text, "")) {
                    continue;
                }
                hits.push(ShellHit {
                    file: file.to_string(),
                    line: index + 1,
                    pattern: label.to_string(),
                    text: excerpt(text),
                });
            }
        }
        hits
    }
}

impl Collector for ShellCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let mut files_scanned = Vec::new();
        let mut hits = Vec::new();
        let mut raw = Vec::new();

        for file in Self::candidates(runner) {
            let output = runner.execute(&format!("cat {}", shell_quote(&file)), QUICK);
            if !output.is_success() {
                continue;
            }
            hits.extend(Self::scan(&file, &output.stdout));
            raw.push(format!("# {}\n{}", file, output.stdout));
            files_scanned.push(file);
        }

        tracing::debug!(files = files_scanned.len(), hits = hits.len(), "shell startup files scanned");
        let records = ShellRecords { files_scanned, hits };
        Ok(CollectedData::new(ModuleName::Shell, encode_records(&records)?).with_raw(raw.join("\n")))
    }
}

/// Shell Startup File Analyzer
pub struct ShellAnalyzer;

impl ShellAnalyzer {
    fn severity_for(pattern: &str) -> Severity {
        match pattern {
            "base64" | "exec" | "obfuscated-http" => Severity::Medium,
            _ => Severity::High,
        }
    }

    fn describe(pattern: &str) -> &'static str {
        match pattern {
            "download" => "downloads content when a shell starts",
            "network-utility" => "invokes a raw network utility",
            "dynamic-exec" => "evaluates dynamically produced code",
            "base64" => "decodes base64 data",
            "exec" => "replaces the shell with another program",
            "device-redirection" => "redirects through /dev/tcp or /dev/udp (reverse shell idiom)",
            "onion" => "references a Tor hidden service",
            "obfuscated-http" => "contains an encoded URL",
            _ => "matches a suspicious token",
        }
    }
}

impl Analyzer for ShellAnalyzer {
    fn analyze(&self, data: &CollectedData, _intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: ShellRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Shell);

        for hit in &records.hits {
            let text = excerpt(&hit.text);
            findings.push(
                Finding::new(
                    ModuleName::Shell,
                    Self::severity_for(&hit.pattern),
                    format!("Suspicious {} in {}", hit.pattern, hit.file),
                    format!("Line {} {}: {}", hit.line, Self::describe(&hit.pattern), text),
                )
                .with_details(json!({
                    "file": hit.file,
                    "line": hit.line,
                    "pattern": hit.pattern,
                    "text": text,
                }))
                .with_remediation("Review the startup file; injected lines run for every login"),
            );
        }

        Ok(findings.into_vec())
    }
}
