use crate::exec::CommandRunner;
use crate::intel::ThreatIntel;
use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{decode_records, encode_records, Analyzer, Collector, STANDARD};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UfwStatus {
    pub active: bool,
    /// Verbose status output, rules included
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Fail2banStatus {
    pub running: bool,
    pub jails: Vec<String>,
    pub sshd_jail: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallRecords {
    pub ufw: UfwStatus,
    pub fail2ban: Fail2banStatus,
    /// `iptables -L -n` verbatim
    pub iptables: String,
}

/// Firewall Collector
///
/// UFW and fail2ban state plus the raw iptables listing
pub struct FirewallCollector;

impl FirewallCollector {
    /// Jail names from the `Jail list:` line of `fail2ban-client status`
    fn parse_jails(output: &str) -> Vec<String> {
        output
            .lines()
            .find_map(|line| line.split_once("Jail list:"))
            .map(|(_, list)| {
                list.split(',')
                    .map(str::trim)
                    .filter(|j| !j.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Collector for FirewallCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let ufw = runner.execute("ufw status verbose", STANDARD);
        let f2b = runner.execute("fail2ban-client status", STANDARD);
        let running = f2b.is_success() && !f2b.stdout.trim().is_empty();
        let sshd = if running {
            runner.execute("fail2ban-client status sshd", STANDARD).is_success()
        } else {
            false
        };
        let iptables = runner.execute("iptables -L -n", STANDARD);

        let records = FirewallRecords {
            ufw: UfwStatus {
                active: ufw.stdout.contains("Status: active"),
                output: ufw.stdout.clone(),
            },
            fail2ban: Fail2banStatus {
                running,
                jails: Self::parse_jails(&f2b.stdout),
                sshd_jail: sshd,
            },
            iptables: iptables.stdout.clone(),
        };
        let raw = [ufw.stdout, f2b.stdout, iptables.stdout].join("\n");
        Ok(CollectedData::new(ModuleName::Firewall, encode_records(&records)?).with_raw(raw))
    }
}

/// Firewall Analyzer
pub struct FirewallAnalyzer;

impl FirewallAnalyzer {
    /// UFW rule admitting SSH from any source
    fn ufw_ssh_rule(output: &str) -> Option<&str> {
        output.lines().map(str::trim).find(|line| {
            let target = line.split_whitespace().next().unwrap_or("");
            let is_ssh = matches!(target, "22" | "22/tcp" | "OpenSSH" | "ssh" | "ssh/tcp");
            is_ssh && line.contains("ALLOW IN") && line.contains("Anywhere")
        })
    }

    /// Policy of a chain header such as `Chain INPUT (policy ACCEPT)`
    fn extract_policy(line: &str) -> Option<&str> {
        let start = line.find("policy ")? + "policy ".len();
        let rest = &line[start..];
        rest.find(')').map(|end| &rest[..end])
    }

    /// What the iptables INPUT chain says about port 22
    fn iptables_evidence(listing: &str) -> Option<String> {
        let mut in_input = false;
        let mut policy_accept = false;
        for line in listing.lines() {
            if line.starts_with("Chain ") {
                in_input = line.starts_with("Chain INPUT");
                if in_input {
                    policy_accept = Self::extract_policy(line) == Some("ACCEPT");
                }
                continue;
            }
            // target prot opt source destination [match...]
            let fields: Vec<&str> = line.split_whitespace().collect();
            if in_input
                && fields.first() == Some(&"ACCEPT")
                && fields.get(3) == Some(&"0.0.0.0/0")
                && fields.contains(&"dpt:22")
            {
                return Some(format!("iptables INPUT rule: {}", excerpt(line)));
            }
        }
        policy_accept.then(|| "iptables INPUT chain default policy is ACCEPT".to_string())
    }
}

impl Analyzer for FirewallAnalyzer {
    fn analyze(&self, data: &CollectedData, _intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: FirewallRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Firewall);

        if !records.ufw.active {
            findings.push(
                Finding::new(
                    ModuleName::Firewall,
                    Severity::High,
                    "UFW firewall inactive",
                    "UFW is not installed or not enabled; no host firewall policy is enforced through it",
                )
                .with_remediation("Enable it with: ufw default deny incoming && ufw allow from <admin-net> to any port 22 && ufw enable"),
            );
        }

        if !records.fail2ban.running {
            findings.push(
                Finding::new(
                    ModuleName::Firewall,
                    Severity::Medium,
                    "fail2ban not running",
                    "No brute-force protection is active for network services",
                )
                .with_remediation("Install fail2ban and enable the sshd jail"),
            );
        } else if !records.fail2ban.sshd_jail {
            findings.push(
                Finding::new(
                    ModuleName::Firewall,
                    Severity::Medium,
                    "fail2ban sshd jail not enabled",
                    format!(
                        "fail2ban is running but does not protect SSH (jails: {})",
                        if records.fail2ban.jails.is_empty() { "none".to_string() } else { records.fail2ban.jails.join(", ") }
                    ),
                )
                .with_details(json!({ "jails": records.fail2ban.jails }))
                .with_remediation("Enable [sshd] in /etc/fail2ban/jail.local and reload fail2ban"),
            );
        }

        // An inactive UFW is always reported as open; iptables only supplies the evidence
        let evidence = if records.ufw.active {
            Self::ufw_ssh_rule(&records.ufw.output).map(|rule| format!("UFW rule: {}", excerpt(rule)))
        } else {
            Some(
                Self::iptables_evidence(&records.iptables)
                    .unwrap_or_else(|| "UFW inactive and no iptables rule restricts port 22".to_string()),
            )
        };

        if let Some(evidence) = evidence {
            findings.push(
                Finding::new(
                    ModuleName::Firewall,
                    Severity::Medium,
                    "SSH open to all addresses",
                    format!("Port 22 accepts connections from any source ({})", evidence),
                )
                .with_details(json!({ "evidence": evidence }))
                .with_remediation("Restrict SSH to known administrative networks or a VPN"),
            );
        }

        Ok(findings.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;

    fn analyze(records: serde_json::Value) -> Vec<Finding> {
        let intel = ThreatIntel::embedded().unwrap();
        FirewallAnalyzer
            .analyze(&CollectedData::new(ModuleName::Firewall, records), &intel)
            .unwrap()
    }

    const LOCKED_DOWN_IPTABLES: &str = "\
Chain INPUT (policy DROP)
target     prot opt source               destination
ACCEPT     tcp  --  10.0.0.0/8           0.0.0.0/0            tcp dpt:22
";

    #[test]
    fn test_inactive_ufw_reports_ssh_open_regardless_of_iptables() {
        for iptables in ["", LOCKED_DOWN_IPTABLES] {
            let findings = analyze(json!({
                "ufw": { "active": false },
                "fail2ban": { "running": true, "sshdJail": true },
                "iptables": iptables
            }));
            let summary: Vec<_> = findings.iter().map(|f| (f.severity, f.title.as_str())).collect();
            assert_eq!(
                summary,
                vec![
                    (Severity::High, "UFW firewall inactive"),
                    (Severity::Medium, "SSH open to all addresses"),
                ]
            );
        }
    }

    #[test]
    fn test_iptables_evidence() {
        let open = "Chain INPUT (policy DROP)\nACCEPT     tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:22\n";
        assert!(FirewallAnalyzer::iptables_evidence(open).unwrap().contains("dpt:22"));

        let permissive = "Chain INPUT (policy ACCEPT)\ntarget     prot opt source               destination\n\nChain FORWARD (policy DROP)\n";
        assert_eq!(
            FirewallAnalyzer::iptables_evidence(permissive).as_deref(),
            Some("iptables INPUT chain default policy is ACCEPT")
        );
        assert_eq!(FirewallAnalyzer::iptables_evidence(LOCKED_DOWN_IPTABLES), None);
    }

    #[test]
    fn test_active_ufw_only_flags_open_ssh_rule() {
        let restricted = "Status: active\n\nTo                         Action      From\n--                         ------      ----\n22/tcp                     ALLOW IN    10.0.0.0/8\n";
        let findings = analyze(json!({
            "ufw": { "active": true, "output": restricted },
            "fail2ban": { "running": true, "sshdJail": true }
        }));
        assert!(findings.is_empty());

        let open = "Status: active\n22/tcp                     ALLOW IN    Anywhere\n";
        let findings = analyze(json!({
            "ufw": { "active": true, "output": open },
            "fail2ban": { "running": true, "jails": ["nginx-http-auth"], "sshdJail": false }
        }));
        let titles: Vec<_> = findings.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, vec!["fail2ban sshd jail not enabled", "SSH open to all addresses"]);
        assert_eq!(findings[1].id, "FW-002");
    }

    #[test]
    fn test_collect() {
        let runner = ScriptedRunner::new()
            .ok("ufw status verbose", "Status: active\nDefault: deny (incoming)\n")
            .ok("fail2ban-client status", "Status\n|- Number of jail:\t2\n`- Jail list:\tnginx-http-auth, sshd\n")
            .ok("fail2ban-client status sshd", "Status for the jail: sshd\n")
            .ok("iptables -L -n", "Chain INPUT (policy DROP)\n");

        let data = FirewallCollector.collect(&runner).unwrap();
        let records: FirewallRecords = decode_records(&data);
        assert!(records.ufw.active);
        assert!(records.fail2ban.running);
        assert!(records.fail2ban.sshd_jail);
        assert_eq!(records.fail2ban.jails, vec!["nginx-http-auth", "sshd"]);
        assert_eq!(records.iptables, "Chain INPUT (policy DROP)\n");
    }

    #[test]
    fn test_missing_tools_degrade_to_inactive() {
        let data = FirewallCollector.collect(&ScriptedRunner::new()).unwrap();
        let records: FirewallRecords = decode_records(&data);
        assert!(!records.ufw.active);
        assert!(!records.fail2ban.running);
        assert!(records.fail2ban.jails.is_empty());
    }
}
