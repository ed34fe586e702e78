use crate::exec::{shell_quote, CommandRunner};
use crate::intel::ThreatIntel;
use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    content_lines, decode_records, encode_records, lenient_vec, Analyzer, Collector,
    DEEP_SEARCH, QUICK, STANDARD,
};

const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";

/// Directives of interest in sshd_config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshdConfig {
    pub password_auth: String,
    pub permit_root_login: String,
    pub permit_empty_passwords: String,
    pub port: String,
}

impl SshdConfig {
    /// First non-comment occurrence of each directive wins, as sshd itself reads it
    pub fn parse(content: &str) -> Self {
        let mut config = Self::default();
        for line in content_lines(content) {
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let slot = match key.to_lowercase().as_str() {
                "passwordauthentication" => &mut config.password_auth,
                "permitrootlogin" => &mut config.permit_root_login,
                "permitemptypasswords" => &mut config.permit_empty_passwords,
                "port" => &mut config.port,
                _ => continue,
            };
            if slot.is_empty() {
                *slot = value.trim().to_string();
            }
        }
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizedKeysFile {
    pub path: String,
    /// Key type and comment of each entry; key material is not kept
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub user: String,
    pub tty: String,
    pub login: String,
    pub from: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConnection {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshRecords {
    #[serde(deserialize_with = "lenient_vec")]
    pub authorized_keys: Vec<AuthorizedKeysFile>,
    pub sshd_config: SshdConfig,
    #[serde(deserialize_with = "lenient_vec")]
    pub active_sessions: Vec<Session>,
    #[serde(deserialize_with = "lenient_vec")]
    pub connections: Vec<SshConnection>,
}

/// SSH Access Collector
///
/// Authorized keys, daemon configuration and who is connected right now
pub struct SshCollector;

impl SshCollector {
    /// `type comment` for each key line, skipping any leading options field
    fn summarize_keys(content: &str) -> Vec<String> {
        content_lines(content)
            .filter_map(|line| {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                let start = tokens
                    .iter()
                    .position(|t| t.starts_with("ssh-") || t.starts_with("ecdsa-") || t.starts_with("sk-"))?;
                let key_type = tokens[start];
                let comment = tokens.get(start + 2..).map(|c| c.join(" ")).unwrap_or_default();
                Some(if comment.is_empty() {
                    key_type.to_string()
                } else {
                    format!("{} {}", key_type, comment)
                })
            })
            .collect()
    }

    fn parse_who(output: &str) -> Vec<Session> {
        output
            .lines()
            .filter_map(|line| {
                let (head, from) = match line.split_once('(') {
                    Some((head, rest)) => (head, rest.trim_end().trim_end_matches(')')),
                    None => (line, ""),
                };
                let mut tokens = head.split_whitespace();
                let user = tokens.next()?;
                let tty = tokens.next()?;
                Some(Session {
                    user: user.to_string(),
                    tty: tty.to_string(),
                    login: tokens.collect::<Vec<_>>().join(" "),
                    from: from.to_string(),
                })
            })
            .collect()
    }

    /// `ss` output filtered to established state omits the State column
    fn parse_connections(output: &str) -> Vec<SshConnection> {
        output
            .lines()
            .filter(|l| !l.starts_with("Recv-Q"))
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 4 {
                    return None;
                }
                Some(SshConnection {
                    local: fields[2].to_string(),
                    remote: fields[3].to_string(),
                })
            })
            .collect()
    }
}

impl Collector for SshCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let mut raw = Vec::new();

        let found = runner.execute(
            "find / -xdev -type f \\( -name authorized_keys -o -name authorized_keys2 \\) 2>/dev/null",
            DEEP_SEARCH,
        );
        let mut authorized_keys = Vec::new();
        for path in found.lines() {
            let content = runner.execute(&format!("cat {}", shell_quote(path)), QUICK).stdout;
            authorized_keys.push(AuthorizedKeysFile {
                path: path.to_string(),
                keys: Self::summarize_keys(&content),
            });
        }
        raw.push(found.stdout);

        let config = runner.execute(&format!("cat {}", SSHD_CONFIG), QUICK);
        let sshd_config = SshdConfig::parse(&config.stdout);
        raw.push(config.stdout);

        let who = runner.execute("who", QUICK);
        let active_sessions = Self::parse_who(&who.stdout);
        raw.push(who.stdout);

        let ss = runner.execute(
            "ss -tnp state established '( sport = :22 or dport = :22 )'",
            STANDARD,
        );
        let connections = Self::parse_connections(&ss.stdout);
        raw.push(ss.stdout);

        let records = SshRecords {
            authorized_keys,
            sshd_config,
            active_sessions,
            connections,
        };
        Ok(CollectedData::new(ModuleName::Ssh, encode_records(&records)?).with_raw(raw.join("\n")))
    }
}

/// SSH Access Analyzer
pub struct SshAnalyzer;

impl Analyzer for SshAnalyzer {
    fn analyze(&self, data: &CollectedData, _intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: SshRecords = decode_records(data);
        let config = &records.sshd_config;
        let mut findings = FindingSet::new(ModuleName::Ssh);

        if config.password_auth == "yes" {
            findings.push(
                Finding::new(
                    ModuleName::Ssh,
                    Severity::High,
                    "SSH password authentication enabled",
                    "PasswordAuthentication is set to 'yes'; the daemon is exposed to credential brute-forcing",
                )
                .with_details(json!({ "file": SSHD_CONFIG, "port": config.port }))
                .with_remediation("Set PasswordAuthentication no and use key-based authentication"),
            );
        }

        if config.permit_root_login == "yes" {
            findings.push(
                Finding::new(
                    ModuleName::Ssh,
                    Severity::Medium,
                    "SSH root login permitted",
                    "PermitRootLogin is set to 'yes'",
                )
                .with_details(json!({ "file": SSHD_CONFIG }))
                .with_remediation("Set PermitRootLogin to 'prohibit-password' or 'no'"),
            );
        }

        if config.permit_empty_passwords == "yes" {
            findings.push(
                Finding::new(
                    ModuleName::Ssh,
                    Severity::Critical,
                    "SSH permits empty passwords",
                    "PermitEmptyPasswords is set to 'yes'",
                )
                .with_details(json!({ "file": SSHD_CONFIG }))
                .with_remediation("Set PermitEmptyPasswords no immediately"),
            );
        }

        if records.active_sessions.len() > 1 {
            let users: Vec<String> = records
                .active_sessions
                .iter()
                .map(|s| if s.from.is_empty() { s.user.clone() } else { format!("{}@{}", s.user, s.from) })
                .collect();
            findings.push(
                Finding::new(
                    ModuleName::Ssh,
                    Severity::Info,
                    format!("{} active login sessions", records.active_sessions.len()),
                    format!("Logged in: {}", excerpt(&users.join(", "))),
                )
                .with_details(json!({ "sessions": records.active_sessions, "connections": records.connections })),
            );
        }

        for file in records.authorized_keys.iter().filter(|f| !f.keys.is_empty()) {
            findings.push(
                Finding::new(
                    ModuleName::Ssh,
                    Severity::Info,
                    format!("Authorized keys in {}", file.path),
                    format!("{} key(s) grant login: {}", file.keys.len(), excerpt(&file.keys.join(", "))),
                )
                .with_details(json!({ "path": file.path, "keys": file.keys }))
                .with_remediation("Confirm every key belongs to a known operator"),
            );
        }

        Ok(findings.into_vec())
    }
}
