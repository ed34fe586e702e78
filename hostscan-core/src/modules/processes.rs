use crate::exec::CommandRunner;
use crate::intel::ThreatIntel;
use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    base_name, binary_of, decode_records, encode_records, lenient_vec,
    suspicious_hidden_component, under_temp_dir, Analyzer, Collector, STANDARD,
};

const CPU_THRESHOLD: f64 = 80.0;

/// One row of `ps aux`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessEntry {
    pub user: String,
    pub pid: u32,
    pub cpu: f64,
    pub mem: f64,
    pub vsz: u64,
    pub rss: u64,
    pub tty: String,
    pub stat: String,
    pub start: String,
    pub time: String,
    pub command: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProcessRecords {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub processes: Vec<ProcessEntry>,
}

/// Process Table Collector
///
/// Parses `ps aux`, dropping the header and kernel threads
pub struct ProcessesCollector;

impl ProcessesCollector {
    fn parse_ps(output: &str) -> Vec<ProcessEntry> {
        output.lines().filter_map(Self::parse_line).collect()
    }

    fn parse_line(line: &str) -> Option<ProcessEntry> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 11 {
            return None;
        }

        // Header row: USER PID %CPU ...
        let pid = parts[1].parse().ok()?;
        let command = parts[10..].join(" ");

        // Kernel threads show up as [kthreadd], [kworker/0:1] ...
        if command.starts_with('[') && command.ends_with(']') {
            return None;
        }

        Some(ProcessEntry {
            user: parts[0].to_string(),
            pid,
            cpu: parts[2].parse().unwrap_or(0.0),
            mem: parts[3].parse().unwrap_or(0.0),
            vsz: parts[4].parse().unwrap_or(0),
            rss: parts[5].parse().unwrap_or(0),
            tty: parts[6].to_string(),
            stat: parts[7].to_string(),
            start: parts[8].to_string(),
            time: parts[9].to_string(),
            command,
        })
    }
}

impl Collector for ProcessesCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let output = runner.execute("ps aux", STANDARD);
        let records = ProcessRecords {
            processes: Self::parse_ps(&output.stdout),
        };
        Ok(CollectedData::new(ModuleName::Processes, encode_records(&records)?).with_raw(output.stdout))
    }
}

/// Process Analyzer
///
/// Flags known malware signatures, binaries in temp or hidden directories, and CPU hogs
pub struct ProcessesAnalyzer;

impl Analyzer for ProcessesAnalyzer {
    fn analyze(&self, data: &CollectedData, intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: ProcessRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Processes);

        for process in &records.processes {
            let binary = binary_of(&process.command);
            let name = base_name(binary);
            let command = excerpt(&process.command);

            if let Some(hit) = intel.match_process(name, &process.command) {
                findings.push(
                    Finding::new(
                        ModuleName::Processes,
                        hit.severity(),
                        format!("Known malicious process: {}", hit.name),
                        format!("PID {} ({}) matches signature '{}': {}", process.pid, process.user, hit.pattern, command),
                    )
                    .with_details(json!({
                        "pid": process.pid,
                        "user": process.user,
                        "command": command,
                        "signature": hit.name,
                        "family": hit.family,
                    }))
                    .with_remediation(format!(
                        "Kill the process (kill -9 {}), remove its binary and look for the persistence mechanism that started it",
                        process.pid
                    )),
                );
            }

            if under_temp_dir(binary) {
                findings.push(
                    Finding::new(
                        ModuleName::Processes,
                        Severity::High,
                        "Process running from temporary directory",
                        format!("PID {} ({}) executes {}", process.pid, process.user, binary),
                    )
                    .with_details(json!({ "pid": process.pid, "user": process.user, "binary": binary, "command": command }))
                    .with_remediation("Legitimate software rarely runs from /tmp, /var/tmp or /dev/shm; inspect the binary and its parent process"),
                );
            }

            if let Some(dir) = suspicious_hidden_component(binary) {
                findings.push(
                    Finding::new(
                        ModuleName::Processes,
                        Severity::High,
                        "Process running from hidden directory",
                        format!("PID {} ({}) executes {} from hidden directory '{}'", process.pid, process.user, binary, dir),
                    )
                    .with_details(json!({ "pid": process.pid, "user": process.user, "binary": binary, "hiddenDir": dir }))
                    .with_remediation("Inspect the hidden directory and the binary; malware commonly hides in dot-directories"),
                );
            }

            if process.cpu > CPU_THRESHOLD {
                findings.push(
                    Finding::new(
                        ModuleName::Processes,
                        Severity::Medium,
                        "Sustained high CPU usage",
                        format!("PID {} ({}) uses {:.1}% CPU: {}", process.pid, process.user, process.cpu, command),
                    )
                    .with_details(json!({ "pid": process.pid, "cpu": process.cpu, "command": command }))
                    .with_remediation("Confirm the workload is expected; cryptominers typically pin the CPU"),
                );
            }
        }

        Ok(findings.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;

    const PS: &str = "\
USER         PID %CPU %MEM    VSZ   RSS TTY      STAT START   TIME COMMAND
root           1  0.0  0.1 167744 11800 ?        Ss   Oct01   0:12 /sbin/init splash
root           2  0.0  0.0      0     0 ?        S    Oct01   0:00 [kthreadd]
www-data    4242 97.3  2.0 300000 40000 ?        Sl   10:02 120:00 /tmp/.x/kdevtmpfsi -o pool
alice       5150  0.5  1.0  20000  9000 pts/0    S+   11:00   0:01 vim notes.txt
garbage line
";

    fn analyze(records: serde_json::Value) -> Vec<Finding> {
        let intel = ThreatIntel::embedded().unwrap();
        let data = CollectedData::new(ModuleName::Processes, records);
        ProcessesAnalyzer.analyze(&data, &intel).unwrap()
    }

    #[test]
    fn test_parse_skips_header_kernel_threads_and_junk() {
        let entries = ProcessesCollector::parse_ps(PS);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].command, "/sbin/init splash");
        assert_eq!(entries[1].pid, 4242);
        assert_eq!(entries[1].cpu, 97.3);
        assert_eq!(entries[2].tty, "pts/0");
    }

    #[test]
    fn test_collect_uses_ps() {
        let runner = ScriptedRunner::new().ok("ps aux", PS);
        let data = ProcessesCollector.collect(&runner).unwrap();
        assert_eq!(data.records["processes"].as_array().unwrap().len(), 3);
        assert_eq!(runner.calls(), vec!["ps aux"]);
    }

    #[test]
    fn test_missing_ps_yields_empty_records() {
        let data = ProcessesCollector.collect(&ScriptedRunner::new()).unwrap();
        assert!(data.records["processes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_miner_yields_signature_temp_hidden_and_cpu_findings() {
        let records = json!({ "processes": ProcessesCollector::parse_ps(PS) });
        let findings = analyze(records);

        let severities: Vec<_> = findings.iter().map(|f| f.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Critical, Severity::High, Severity::High, Severity::Medium]
        );
        assert_eq!(findings[0].id, "PROC-001");
        assert_eq!(findings[3].id, "PROC-004");
        assert!(findings.iter().all(|f| f.details.as_ref().unwrap()["pid"] == 4242));
    }

    #[test]
    fn test_benign_processes_are_quiet() {
        let findings = analyze(json!({
            "processes": [
                { "user": "root", "pid": 1, "cpu": 0.0, "command": "/sbin/init" },
                { "user": "bob", "pid": 7, "cpu": 12.0, "command": "/home/bob/.cargo/bin/rust-analyzer" }
            ]
        }));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_malformed_entry_is_defaulted() {
        let findings = analyze(json!({
            "processes": [ { "pid": "not-a-number", "command": "/tmp/x" }, "junk" ]
        }));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let records = json!({ "processes": ProcessesCollector::parse_ps(PS) });
        assert_eq!(analyze(records.clone()), analyze(records));
    }
}
