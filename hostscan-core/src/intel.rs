//! Threat intelligence knowledge base.
//!
//! Six read-only tables loaded once before a scan starts. Every analyzer
//! receives the same shared instance.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{KnowledgeBaseError, KnowledgeBaseResult};
use crate::types::Severity;

const HASHES_FILE: &str = "hashes.json";
const IPS_FILE: &str = "ips.json";
const PROCESSES_FILE: &str = "processes.json";
const PATHS_FILE: &str = "paths.json";
const SERVICES_FILE: &str = "services.json";
const PORTS_FILE: &str = "ports.json";

/// Known-malicious file digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashEntry {
    pub hash: String,
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    pub severity: String,
}

/// Known-malicious remote address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpEntry {
    pub ip: String,
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    pub severity: String,
}

/// Process signature: a substring, or a regex when `regex` is set. Both ignore case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pattern: String,
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub regex: bool,
}

/// Path prefix associated with malware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    pub severity: String,
}

/// Systemd unit name used by malware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub severity: String,
}

/// Port associated with malware, either as a listener or as a remote endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    pub name: String,
    pub direction: String,
    pub severity: String,
}

impl HashEntry {
    pub fn severity(&self) -> Severity {
        Severity::from_label(&self.severity)
    }
}

impl IpEntry {
    pub fn severity(&self) -> Severity {
        Severity::from_label(&self.severity)
    }
}

impl ProcessEntry {
    pub fn severity(&self) -> Severity {
        Severity::from_label(&self.severity)
    }
}

impl PathEntry {
    pub fn severity(&self) -> Severity {
        Severity::from_label(&self.severity)
    }
}

impl ServiceEntry {
    pub fn severity(&self) -> Severity {
        Severity::from_label(&self.severity)
    }
}

impl PortEntry {
    pub fn severity(&self) -> Severity {
        Severity::from_label(&self.severity)
    }
}

/// Which side of a socket a port query describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Listening,
    Outbound,
}

impl PortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortDirection::Listening => "listening",
            PortDirection::Outbound => "outbound",
        }
    }
}

enum ProcessMatcher {
    Substring(String),
    Pattern(Regex),
}

struct ProcessRule {
    matcher: ProcessMatcher,
    entry: ProcessEntry,
}

/// Row counts per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntelStats {
    pub hashes: usize,
    pub ips: usize,
    pub processes: usize,
    pub paths: usize,
    pub services: usize,
    pub ports: usize,
}

/// Read-only threat intelligence store
pub struct ThreatIntel {
    hashes: HashMap<String, HashEntry>,
    ips: HashMap<String, IpEntry>,
    /// Priority order: the first matching rule wins
    processes: Vec<ProcessRule>,
    paths: Vec<PathEntry>,
    services: HashMap<String, ServiceEntry>,
    ports: Vec<PortEntry>,
}

impl ThreatIntel {
    /// Knowledge base compiled into the binary
    pub fn embedded() -> KnowledgeBaseResult<Self> {
        Self::from_sources(|file| {
            let text = match file {
                HASHES_FILE => include_str!("../data/hashes.json"),
                IPS_FILE => include_str!("../data/ips.json"),
                PROCESSES_FILE => include_str!("../data/processes.json"),
                PATHS_FILE => include_str!("../data/paths.json"),
                SERVICES_FILE => include_str!("../data/services.json"),
                PORTS_FILE => include_str!("../data/ports.json"),
                other => return Err(KnowledgeBaseError::FileNotFound(other.to_string())),
            };
            Ok(text.to_string())
        })
    }

    /// Load the six data files from a directory
    pub fn load_dir(dir: impl AsRef<Path>) -> KnowledgeBaseResult<Self> {
        let dir = dir.as_ref();
        Self::from_sources(|file| {
            let path = dir.join(file);
            if !path.is_file() {
                return Err(KnowledgeBaseError::FileNotFound(path.display().to_string()));
            }
            fs::read_to_string(&path).map_err(|e| KnowledgeBaseError::Io {
                file: path.display().to_string(),
                msg: e.to_string(),
            })
        })
    }

    fn from_sources<F>(read: F) -> KnowledgeBaseResult<Self>
    where
        F: Fn(&str) -> KnowledgeBaseResult<String>,
    {
        let hashes: Vec<HashEntry> = parse_table(HASHES_FILE, &read(HASHES_FILE)?)?;
        let ips: Vec<IpEntry> = parse_table(IPS_FILE, &read(IPS_FILE)?)?;
        let processes: Vec<ProcessEntry> = parse_table(PROCESSES_FILE, &read(PROCESSES_FILE)?)?;
        let paths: Vec<PathEntry> = parse_table(PATHS_FILE, &read(PATHS_FILE)?)?;
        let services: Vec<ServiceEntry> = parse_table(SERVICES_FILE, &read(SERVICES_FILE)?)?;
        let ports: Vec<PortEntry> = parse_table(PORTS_FILE, &read(PORTS_FILE)?)?;

        let processes = processes
            .into_iter()
            .map(|entry| {
                let matcher = if entry.regex {
                    let re = RegexBuilder::new(&entry.pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| KnowledgeBaseError::InvalidPattern {
                            file: PROCESSES_FILE.to_string(),
                            pattern: entry.pattern.clone(),
                            msg: e.to_string(),
                        })?;
                    ProcessMatcher::Pattern(re)
                } else {
                    ProcessMatcher::Substring(entry.pattern.to_lowercase())
                };
                Ok(ProcessRule { matcher, entry })
            })
            .collect::<KnowledgeBaseResult<Vec<_>>>()?;

        let intel = Self {
            hashes: first_wins(hashes, |e| e.hash.to_lowercase()),
            ips: first_wins(ips, |e| e.ip.clone()),
            processes,
            paths,
            services: first_wins(services, |e| e.name.clone()),
            ports,
        };

        tracing::debug!(stats = ?intel.stats(), "threat intelligence loaded");
        Ok(intel)
    }

    /// Case-insensitive digest lookup
    pub fn lookup_hash(&self, digest: &str) -> Option<&HashEntry> {
        self.hashes.get(&digest.trim().to_lowercase())
    }

    /// Exact address lookup, no CIDR semantics
    pub fn lookup_ip(&self, address: &str) -> Option<&IpEntry> {
        self.ips.get(address)
    }

    /// Scan process rules in insertion order against `"name command_line"`.
    ///
    /// Earlier rules shadow later ones; the data file order is the priority.
    pub fn match_process(&self, name: &str, command_line: &str) -> Option<&ProcessEntry> {
        let haystack = format!("{} {}", name, command_line);
        let lowered = haystack.to_lowercase();
        self.processes
            .iter()
            .find(|rule| match &rule.matcher {
                ProcessMatcher::Substring(needle) => lowered.contains(needle.as_str()),
                ProcessMatcher::Pattern(re) => re.is_match(&haystack),
            })
            .map(|rule| &rule.entry)
    }

    /// Prefix match, or equality with the prefix minus its trailing slash
    pub fn match_path(&self, path: &str) -> Option<&PathEntry> {
        self.paths.iter().find(|entry| {
            path.starts_with(entry.path.as_str()) || path == entry.path.trim_end_matches('/')
        })
    }

    /// Exact unit name match; callers strip `.service` and template suffixes
    pub fn match_service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    /// Listening entries answer only listening queries. Every other stored
    /// direction is treated as outbound and answers only outbound queries.
    pub fn match_port(&self, port: u16, direction: PortDirection) -> Option<&PortEntry> {
        self.ports.iter().find(|entry| {
            entry.port == port
                && match direction {
                    PortDirection::Listening => entry.direction == "listening",
                    PortDirection::Outbound => entry.direction != "listening",
                }
        })
    }

    pub fn stats(&self) -> IntelStats {
        IntelStats {
            hashes: self.hashes.len(),
            ips: self.ips.len(),
            processes: self.processes.len(),
            paths: self.paths.len(),
            services: self.services.len(),
            ports: self.ports.len(),
        }
    }
}

fn parse_table<T: DeserializeOwned>(file: &str, text: &str) -> KnowledgeBaseResult<Vec<T>> {
    serde_json::from_str(text).map_err(|e| KnowledgeBaseError::Parse {
        file: file.to_string(),
        msg: e.to_string(),
    })
}

/// Key a table by `key`, keeping the earliest row for a repeated key
fn first_wins<E>(entries: Vec<E>, key: impl Fn(&E) -> String) -> HashMap<String, E> {
    let mut table = HashMap::with_capacity(entries.len());
    for entry in entries {
        table.entry(key(&entry)).or_insert(entry);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intel() -> ThreatIntel {
        ThreatIntel::embedded().unwrap()
    }

    #[test]
    fn test_embedded_tables_load() {
        let stats = intel().stats();
        assert!(stats.processes > 0);
        assert!(stats.paths > 0);
        assert!(stats.ports > 0);
    }

    #[test]
    fn test_hash_lookup_ignores_case() {
        let intel = intel();
        let upper = "275A021BBFB6489E54D471899F7DB9D1663FC695EC2FE2A2C4538AABF651FD0F";
        assert!(intel.lookup_hash(upper).is_some());
        assert!(intel.lookup_hash("deadbeef").is_none());
    }

    #[test]
    fn test_ip_lookup_is_exact() {
        let intel = intel();
        assert!(intel.lookup_ip("198.51.100.23").is_some());
        assert!(intel.lookup_ip("198.51.100.2").is_none());
    }

    #[test]
    fn test_process_first_match_wins() {
        let intel = intel();
        // Both "kinsing" and "kdevtmpfsi" rules apply; the earlier rule is reported
        let hit = intel
            .match_process("kdevtmpfsi", "/tmp/kdevtmpfsi --kinsing")
            .unwrap();
        assert_eq!(hit.name, "Kinsing cryptominer");
    }

    #[test]
    fn test_process_regex_rule() {
        let intel = intel();
        let hit = intel
            .match_process("worker", "./worker -o stratum+tcp://pool.example:3333")
            .unwrap();
        assert_eq!(hit.family.as_deref(), Some("cryptominer"));
        assert!(intel.match_process("bash", "-bash").is_none());
    }

    #[test]
    fn test_process_match_is_case_insensitive() {
        assert!(intel().match_process("XMRig", "").is_some());
    }

    #[test]
    fn test_path_prefix_and_bare_directory() {
        let intel = intel();
        assert_eq!(
            intel.match_path("/etc/data/libsystem.so").unwrap().path,
            "/etc/data/"
        );
        assert_eq!(intel.match_path("/etc/data").unwrap().path, "/etc/data/");
        assert!(intel.match_path("/etc/passwd").is_none());
    }

    #[test]
    fn test_service_match_is_exact() {
        let intel = intel();
        assert!(intel.match_service("kinsing").is_some());
        assert!(intel.match_service("kinsing.service").is_none());
    }

    #[test]
    fn test_port_direction_asymmetry() {
        let intel = intel();
        let outbound = intel.match_port(3333, PortDirection::Outbound).unwrap();
        assert_eq!(outbound.direction, "outbound");
        assert!(intel.match_port(3333, PortDirection::Listening).is_none());

        let listening = intel.match_port(31337, PortDirection::Listening).unwrap();
        assert_eq!(listening.direction, "listening");
        assert!(intel.match_port(31337, PortDirection::Outbound).is_none());

        // 4444 carries one entry per direction
        assert_eq!(intel.match_port(4444, PortDirection::Listening).unwrap().severity(), Severity::Critical);
        assert_eq!(intel.match_port(4444, PortDirection::Outbound).unwrap().severity(), Severity::High);
    }

    fn write_all(dir: &Path) {
        for (name, body) in [
            (HASHES_FILE, "[]"),
            (IPS_FILE, "[]"),
            (PROCESSES_FILE, "[]"),
            (PATHS_FILE, r#"[{"path": "/opt/bad/", "name": "bad", "severity": "nonsense"}]"#),
            (SERVICES_FILE, "[]"),
            (PORTS_FILE, "[]"),
        ] {
            fs::write(dir.join(name), body).unwrap();
        }
    }

    #[test]
    fn test_load_dir_and_unknown_severity() {
        let dir = tempfile::tempdir().unwrap();
        write_all(dir.path());

        let intel = ThreatIntel::load_dir(dir.path()).unwrap();
        let hit = intel.match_path("/opt/bad/x").unwrap();
        assert_eq!(hit.severity(), Severity::Medium);
    }

    #[test]
    fn test_regex_rule_ignores_case_of_pattern_and_input() {
        let dir = tempfile::tempdir().unwrap();
        write_all(dir.path());
        fs::write(
            dir.path().join(PROCESSES_FILE),
            r#"[{"pattern": "XMRig\\s+-o", "name": "miner", "severity": "high", "regex": true}]"#,
        )
        .unwrap();

        let intel = ThreatIntel::load_dir(dir.path()).unwrap();
        assert!(intel.match_process("xmrig", "/opt/XMRIG -o pool:3333").is_some());
        assert!(intel.match_process("xmrig", "/opt/xmrig --help").is_none());
    }

    #[test]
    fn test_repeated_keys_keep_first_row() {
        let dir = tempfile::tempdir().unwrap();
        write_all(dir.path());
        fs::write(
            dir.path().join(HASHES_FILE),
            r#"[{"hash": "ABC123", "name": "first", "severity": "critical"},
                {"hash": "abc123", "name": "second", "severity": "low"}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join(IPS_FILE),
            r#"[{"ip": "192.0.2.7", "name": "first", "severity": "high"},
                {"ip": "192.0.2.7", "name": "second", "severity": "low"}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join(SERVICES_FILE),
            r#"[{"name": "miner", "description": "first", "severity": "critical"},
                {"name": "miner", "description": "second", "severity": "low"}]"#,
        )
        .unwrap();

        let intel = ThreatIntel::load_dir(dir.path()).unwrap();
        assert_eq!(intel.lookup_hash("abc123").unwrap().name, "first");
        assert_eq!(intel.lookup_ip("192.0.2.7").unwrap().name, "first");
        assert_eq!(intel.match_service("miner").unwrap().description.as_deref(), Some("first"));
        assert_eq!(intel.stats().hashes, 1);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_all(dir.path());
        fs::remove_file(dir.path().join(PORTS_FILE)).unwrap();

        let err = ThreatIntel::load_dir(dir.path()).err().unwrap();
        assert!(matches!(err, KnowledgeBaseError::FileNotFound(_)));
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_all(dir.path());
        fs::write(dir.path().join(IPS_FILE), "{ not json").unwrap();

        let err = ThreatIntel::load_dir(dir.path()).err().unwrap();
        assert!(matches!(err, KnowledgeBaseError::Parse { .. }));
    }

    #[test]
    fn test_invalid_regex_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_all(dir.path());
        fs::write(
            dir.path().join(PROCESSES_FILE),
            r#"[{"pattern": "(", "name": "x", "severity": "high", "regex": true}]"#,
        )
        .unwrap();

        let err = ThreatIntel::load_dir(dir.path()).err().unwrap();
        assert!(matches!(err, KnowledgeBaseError::InvalidPattern { .. }));
    }
}
