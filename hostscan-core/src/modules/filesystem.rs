use crate::exec::{shell_quote, CommandRunner};
use crate::intel::ThreatIntel;
use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    base_name, decode_records, encode_records, lenient_vec, under_temp_dir, Analyzer, Collector,
    DEEP_SEARCH, HIDDEN_DIR_ALLOWLIST, QUICK, SEARCH, STANDARD,
};

/// System directories that should never hold world-writable files
const WORLD_WRITABLE_DIRS: &[&str] = &[
    "/etc",
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
    "/opt",
];

const BINARY_DIRS: &[&str] = &["/bin", "/sbin", "/usr/bin", "/usr/sbin", "/usr/local/bin"];

/// Package ownership queries, tried in order
const PACKAGE_QUERIES: &[&str] = &["dpkg -S", "rpm -qf", "pacman -Qo"];

const RECENT_WINDOW_DAYS: u32 = 30;
const MAX_HASHED: usize = 200;
const MAX_RECENT_LISTED: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempExecutable {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuidBinary {
    pub path: String,
    pub packaged: bool,
    pub owner: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilesystemRecords {
    #[serde(deserialize_with = "lenient_vec")]
    pub temp_executables: Vec<TempExecutable>,
    /// Executables from the shallow /var scan, outside temp directories
    pub var_executables: Vec<String>,
    pub hidden_dirs: Vec<String>,
    pub world_writable: Vec<String>,
    #[serde(deserialize_with = "lenient_vec")]
    pub suid_binaries: Vec<SuidBinary>,
    pub recent_binaries: Vec<String>,
}

/// Filesystem Artifact Collector
///
/// Dropped executables, hidden directories, permission anomalies and recent changes
pub struct FilesystemCollector;

impl FilesystemCollector {
    fn sha256(runner: &dyn CommandRunner, path: &str) -> String {
        runner
            .execute(&format!("sha256sum {}", shell_quote(path)), QUICK)
            .stdout
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// First package manager that claims the file
    fn owning_package(runner: &dyn CommandRunner, path: &str) -> Option<String> {
        PACKAGE_QUERIES.iter().find_map(|query| {
            let output = runner.execute(&format!("{} {}", query, shell_quote(path)), QUICK);
            if output.is_success() && !output.stdout.trim().is_empty() {
                output.lines().next().map(str::to_string)
            } else {
                None
            }
        })
    }
}

impl Collector for FilesystemCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let mut raw = Vec::new();

        let temp = runner.execute(
            "find /tmp /var/tmp /dev/shm -xdev -type f -perm /111 2>/dev/null",
            SEARCH,
        );
        let temp_executables = temp
            .lines()
            .enumerate()
            .map(|(i, path)| TempExecutable {
                path: path.to_string(),
                // Every path is reported; only the first MAX_HASHED are hashed
                sha256: if i < MAX_HASHED { Self::sha256(runner, path) } else { String::new() },
            })
            .collect();
        raw.push(temp.stdout);

        let var = runner.execute("find /var -maxdepth 2 -type f -perm /111 2>/dev/null", STANDARD);
        let var_executables = var
            .lines()
            .filter(|p| !under_temp_dir(p))
            .map(str::to_string)
            .collect();
        raw.push(var.stdout);

        let hidden = runner.execute(
            "find / /root -mindepth 1 -maxdepth 1 -type d -name '.*' 2>/dev/null",
            QUICK,
        );
        let hidden_dirs = hidden.lines().map(str::to_string).collect();
        raw.push(hidden.stdout);

        let writable = runner.execute(
            &format!(
                "find {} -xdev -type f -perm -0002 2>/dev/null",
                WORLD_WRITABLE_DIRS.join(" ")
            ),
            SEARCH,
        );
        let world_writable = writable.lines().map(str::to_string).collect();
        raw.push(writable.stdout);

        let suid = runner.execute("find / -xdev -type f -perm -4000 2>/dev/null", DEEP_SEARCH);
        let suid_binaries = suid
            .lines()
            .map(|path| {
                let owner = Self::owning_package(runner, path);
                SuidBinary {
                    path: path.to_string(),
                    packaged: owner.is_some(),
                    owner: owner.unwrap_or_default(),
                }
            })
            .collect();
        raw.push(suid.stdout);

        let recent = runner.execute(
            &format!(
                "find {} -xdev -type f -mtime -{} 2>/dev/null",
                BINARY_DIRS.join(" "),
                RECENT_WINDOW_DAYS
            ),
            SEARCH,
        );
        let recent_binaries = recent.lines().map(str::to_string).collect();
        raw.push(recent.stdout);

        let records = FilesystemRecords {
            temp_executables,
            var_executables,
            hidden_dirs,
            world_writable,
            suid_binaries,
            recent_binaries,
        };
        Ok(CollectedData::new(ModuleName::Filesystem, encode_records(&records)?).with_raw(raw.join("\n")))
    }
}

/// Filesystem Artifact Analyzer
pub struct FilesystemAnalyzer;

impl FilesystemAnalyzer {
    fn temp_executable(entry: &TempExecutable, intel: &ThreatIntel) -> Finding {
        if let Some(known) = intel.lookup_hash(&entry.sha256) {
            return Finding::new(
                ModuleName::Filesystem,
                known.severity(),
                format!("Known malware: {}", known.name),
                format!("{} matches the digest of {}", entry.path, known.name),
            )
            .with_details(json!({ "path": entry.path, "sha256": entry.sha256, "family": known.family }))
            .with_remediation("Kill anything running from the file, remove it and look for its persistence");
        }

        if let Some(known) = intel.match_path(&entry.path) {
            return Finding::new(
                ModuleName::Filesystem,
                known.severity(),
                format!("Known malware path: {}", known.name),
                format!("{} is a location used by {}", entry.path, known.name),
            )
            .with_details(json!({ "path": entry.path, "sha256": entry.sha256, "family": known.family }))
            .with_remediation("Remove the file and look for the process or job that dropped it");
        }

        Finding::new(
            ModuleName::Filesystem,
            Severity::High,
            "Executable in temporary directory",
            format!("{} is executable and lives in a world-writable temp directory", entry.path),
        )
        .with_details(json!({ "path": entry.path, "sha256": entry.sha256 }))
        .with_remediation("Identify what created the file; legitimate software rarely executes from temp directories")
    }
}

impl Analyzer for FilesystemAnalyzer {
    fn analyze(&self, data: &CollectedData, intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: FilesystemRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Filesystem);

        for entry in &records.temp_executables {
            findings.push(Self::temp_executable(entry, intel));
        }

        for path in records.var_executables.iter().filter(|p| !under_temp_dir(p)) {
            if let Some(known) = intel.match_path(path) {
                findings.push(
                    Finding::new(
                        ModuleName::Filesystem,
                        known.severity(),
                        format!("Known malware path: {}", known.name),
                        format!("{} is a location used by {}", path, known.name),
                    )
                    .with_details(json!({ "path": path, "family": known.family }))
                    .with_remediation("Remove the file and look for the process or job that dropped it"),
                );
            }
        }

        for dir in &records.hidden_dirs {
            let name = base_name(dir.trim_end_matches('/'));
            if HIDDEN_DIR_ALLOWLIST.contains(&name) {
                continue;
            }
            findings.push(
                Finding::new(
                    ModuleName::Filesystem,
                    Severity::Medium,
                    format!("Hidden directory {}", dir),
                    format!("{} is a hidden directory at the top of a system tree", dir),
                )
                .with_details(json!({ "path": dir }))
                .with_remediation("List its contents; malware often stages payloads in dot-directories"),
            );
        }

        for binary in records.suid_binaries.iter().filter(|b| !b.packaged) {
            findings.push(
                Finding::new(
                    ModuleName::Filesystem,
                    Severity::High,
                    "SUID binary not owned by any package",
                    format!("{} runs with its owner's privileges and no package manager claims it", binary.path),
                )
                .with_details(json!({ "path": binary.path }))
                .with_remediation(format!("Verify the binary, then remove the bit with: chmod u-s {}", binary.path)),
            );
        }

        for path in &records.world_writable {
            findings.push(
                Finding::new(
                    ModuleName::Filesystem,
                    Severity::Medium,
                    "World-writable system file",
                    format!("{} can be modified by any user", path),
                )
                .with_details(json!({ "path": path }))
                .with_remediation(format!("Run: chmod o-w {}", path)),
            );
        }

        if !records.recent_binaries.is_empty() {
            let listed: Vec<&String> = records.recent_binaries.iter().take(MAX_RECENT_LISTED).collect();
            findings.push(
                Finding::new(
                    ModuleName::Filesystem,
                    Severity::Low,
                    format!(
                        "{} system binaries modified in the last {} days",
                        records.recent_binaries.len(),
                        RECENT_WINDOW_DAYS
                    ),
                    "Recently changed binaries are expected after updates; unexpected ones may be trojanized",
                )
                .with_details(json!({ "count": records.recent_binaries.len(), "paths": listed }))
                .with_remediation("Cross-check against package manager logs (dpkg --verify / rpm -Va)"),
            );
        }

        Ok(findings.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;

    const EICAR_SHA256: &str = "275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f";

    fn analyze(records: serde_json::Value) -> Vec<Finding> {
        let intel = ThreatIntel::embedded().unwrap();
        FilesystemAnalyzer
            .analyze(&CollectedData::new(ModuleName::Filesystem, records), &intel)
            .unwrap()
    }

    #[test]
    fn test_temp_executable_precedence() {
        let findings = analyze(json!({
            "tempExecutables": [
                { "path": "/tmp/payload", "sha256": EICAR_SHA256 },
                { "path": "/tmp/kdevtmpfsi", "sha256": "00" },
                { "path": "/dev/shm/run", "sha256": "" }
            ]
        }));
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].title, "Known malware: EICAR test file");
        assert_eq!(findings[1].severity, Severity::Critical);
        assert_eq!(findings[2].title, "Executable in temporary directory");
        assert_eq!(findings[2].severity, Severity::High);
    }

    #[test]
    fn test_hidden_dirs_respect_allowlist() {
        let findings = analyze(json!({ "hiddenDirs": ["/root/.cache", "/.x", "/root/.ssh", "/root/.lol/"] }));
        let paths: Vec<_> = findings.iter().map(|f| f.details.as_ref().unwrap()["path"].clone()).collect();
        assert_eq!(paths, vec![json!("/.x"), json!("/root/.lol/")]);
        assert!(findings.iter().all(|f| f.severity == Severity::Medium));
    }

    #[test]
    fn test_recent_binaries_single_low_finding() {
        let paths: Vec<String> = (0..25).map(|i| format!("/usr/bin/tool{}", i)).collect();
        let findings = analyze(json!({ "recentBinaries": paths }));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Low);
        let details = findings[0].details.as_ref().unwrap();
        assert_eq!(details["count"], 25);
        assert_eq!(details["paths"].as_array().unwrap().len(), 20);
    }

    #[test]
    fn test_collect_classifies_suid_by_package_manager() {
        let runner = ScriptedRunner::new()
            .ok("find /tmp /var/tmp /dev/shm -xdev -type f -perm /111 2>/dev/null", "/tmp/x\n")
            .ok("sha256sum '/tmp/x'", &format!("{}  /tmp/x\n", EICAR_SHA256))
            .ok("find /var -maxdepth 2 -type f -perm /111 2>/dev/null", "/var/tmp/x\n/var/run-me\n")
            .ok(
                "find / -xdev -type f -perm -4000 2>/dev/null",
                "/usr/bin/passwd\n/usr/bin/sudo\n/opt/backdoor\n",
            )
            .ok("dpkg -S '/usr/bin/passwd'", "passwd: /usr/bin/passwd\n")
            .fail("dpkg -S '/usr/bin/sudo'", "")
            .ok("rpm -qf '/usr/bin/sudo'", "sudo-1.9.15-1.x86_64\n")
            .ok(
                "find /etc /bin /sbin /usr/bin /usr/sbin /usr/local/bin /usr/local/sbin /opt -xdev -type f -perm -0002 2>/dev/null",
                "/etc/cron.d/open\n",
            );

        let data = FilesystemCollector.collect(&runner).unwrap();
        let records: FilesystemRecords = decode_records(&data);
        assert_eq!(records.temp_executables[0].sha256, EICAR_SHA256);
        assert_eq!(records.var_executables, vec!["/var/run-me"]);
        let packaged: Vec<_> = records.suid_binaries.iter().map(|b| b.packaged).collect();
        assert_eq!(packaged, vec![true, true, false]);
        assert_eq!(records.suid_binaries[1].owner, "sudo-1.9.15-1.x86_64");
        assert!(runner.calls().contains(&"pacman -Qo '/opt/backdoor'".to_string()));

        let intel = ThreatIntel::embedded().unwrap();
        let findings = FilesystemAnalyzer.analyze(&data, &intel).unwrap();
        let severities: Vec<_> = findings.iter().map(|f| f.severity).collect();
        assert_eq!(severities, vec![Severity::High, Severity::High, Severity::Medium]);
        assert_eq!(findings[1].title, "SUID binary not owned by any package");
        assert_eq!(findings[2].id, "FS-003");
    }

    #[test]
    fn test_every_temp_executable_is_reported_past_hash_limit() {
        let listing: String = (0..250).map(|i| format!("/tmp/drop{}\n", i)).collect();
        let runner = ScriptedRunner::new()
            .ok("find /tmp /var/tmp /dev/shm -xdev -type f -perm /111 2>/dev/null", &listing);

        let data = FilesystemCollector.collect(&runner).unwrap();
        let records: FilesystemRecords = decode_records(&data);
        assert_eq!(records.temp_executables.len(), 250);
        assert_eq!(records.temp_executables[249].path, "/tmp/drop249");
        assert!(records.temp_executables[249].sha256.is_empty());

        let hashed = runner.calls().iter().filter(|c| c.starts_with("sha256sum")).count();
        assert_eq!(hashed, MAX_HASHED);

        let intel = ThreatIntel::embedded().unwrap();
        let findings = FilesystemAnalyzer.analyze(&data, &intel).unwrap();
        assert_eq!(findings.len(), 250);
        assert!(findings.iter().all(|f| f.title == "Executable in temporary directory"));
    }
}
