use crate::exec::CommandRunner;
use crate::intel::ThreatIntel;
use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    content_lines, decode_records, encode_records, lenient_vec, under_temp_dir, Analyzer,
    Collector, QUICK, SEARCH,
};

const LD_PRELOAD_FILE: &str = "/etc/ld.so.preload";

/// Directory used by an ld.so.preload rootkit family to stage its library
const KNOWN_MALWARE_DIR: &str = "/etc/data";

/// /etc subtrees that legitimately ship shared objects
const LEGIT_ETC_PREFIXES: &[&str] = &["/etc/alternatives/", "/etc/ssl/", "/etc/security/"];

/// Loadable kernel module rootkits seen in the wild
const KNOWN_LKM_ROOTKITS: &[&str] = &[
    "diamorphine",
    "reptile",
    "suterusu",
    "adore",
    "adore_ng",
    "knark",
    "kovid",
    "rkduck",
    "nuk3gh0st",
    "sutersu",
    "brokepkg",
    "singularity",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MalwareDir {
    pub path: String,
    pub exists: bool,
    pub contents: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RootkitRecords {
    /// Verbatim content of /etc/ld.so.preload
    pub ld_preload: String,
    #[serde(deserialize_with = "lenient_vec")]
    pub suspicious_libraries: Vec<String>,
    pub malware_dir: MalwareDir,
    #[serde(deserialize_with = "lenient_vec")]
    pub kernel_modules: Vec<String>,
}

/// Rootkit Indicator Collector
///
/// Reads the preload file, hunts for stray shared objects and lists kernel modules
pub struct RootkitCollector;

impl RootkitCollector {
    fn is_suspicious_library(path: &str) -> bool {
        if under_temp_dir(path) {
            return true;
        }
        path.starts_with("/etc/") && !LEGIT_ETC_PREFIXES.iter().any(|p| path.starts_with(p))
    }

    /// Module names from `lsmod`, skipping the header
    fn parse_lsmod(output: &str) -> Vec<String> {
        output
            .lines()
            .skip_while(|l| l.starts_with("Module"))
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }
}

impl Collector for RootkitCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let preload = runner.execute(&format!("cat {}", LD_PRELOAD_FILE), QUICK);

        let libraries = runner.execute(
            "find /tmp /var/tmp /dev/shm /etc -maxdepth 4 -type f -name '*.so*' 2>/dev/null",
            SEARCH,
        );
        let suspicious_libraries = libraries
            .lines()
            .filter(|p| Self::is_suspicious_library(p))
            .map(str::to_string)
            .collect();

        let listing = runner.execute(&format!("ls -1A {}", KNOWN_MALWARE_DIR), QUICK);
        let malware_dir = MalwareDir {
            path: KNOWN_MALWARE_DIR.to_string(),
            exists: listing.is_success(),
            contents: listing.lines().map(str::to_string).collect(),
        };

        let lsmod = runner.execute("lsmod", QUICK);

        let records = RootkitRecords {
            ld_preload: preload.stdout.clone(),
            suspicious_libraries,
            malware_dir,
            kernel_modules: Self::parse_lsmod(&lsmod.stdout),
        };
        let raw = [preload.stdout, libraries.stdout, listing.stdout, lsmod.stdout].join("\n");
        Ok(CollectedData::new(ModuleName::Rootkit, encode_records(&records)?).with_raw(raw))
    }
}

/// Rootkit Analyzer
///
/// Any preload entry is treated as hostile; stray libraries and known artifacts follow
pub struct RootkitAnalyzer;

impl Analyzer for RootkitAnalyzer {
    fn analyze(&self, data: &CollectedData, _intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: RootkitRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Rootkit);

        let entries: Vec<&str> = content_lines(&records.ld_preload).collect();
        if !entries.is_empty() {
            findings.push(
                Finding::new(
                    ModuleName::Rootkit,
                    Severity::Critical,
                    "Dynamic linker preload is configured",
                    format!(
                        "{} forces {} into every process: {}",
                        LD_PRELOAD_FILE,
                        if entries.len() == 1 { "a library" } else { "libraries" },
                        excerpt(&entries.join(", "))
                    ),
                )
                .with_details(json!({ "file": LD_PRELOAD_FILE, "entries": entries }))
                .with_remediation(format!(
                    "Userland rootkits hide via {}. Boot from trusted media, empty the file and remove the listed libraries",
                    LD_PRELOAD_FILE
                )),
            );
        }

        for library in &records.suspicious_libraries {
            findings.push(
                Finding::new(
                    ModuleName::Rootkit,
                    Severity::High,
                    "Shared library in unexpected location",
                    format!("{} is not where packaged libraries live", library),
                )
                .with_details(json!({ "path": library }))
                .with_remediation("Check which process loads the library (lsof) and remove it if unexplained"),
            );
        }

        if records.malware_dir.exists {
            findings.push(
                Finding::new(
                    ModuleName::Rootkit,
                    Severity::Critical,
                    format!("Known malware directory {} present", records.malware_dir.path),
                    format!(
                        "{} is used to stage ld.so.preload rootkit libraries ({} entries)",
                        records.malware_dir.path,
                        records.malware_dir.contents.len()
                    ),
                )
                .with_details(json!({ "path": records.malware_dir.path, "contents": records.malware_dir.contents }))
                .with_remediation("Treat the host as compromised: isolate it and rebuild from known-good media"),
            );
        }

        for module in &records.kernel_modules {
            if KNOWN_LKM_ROOTKITS.contains(&module.to_lowercase().as_str()) {
                findings.push(
                    Finding::new(
                        ModuleName::Rootkit,
                        Severity::Critical,
                        format!("Known rootkit kernel module loaded: {}", module),
                        format!("lsmod lists '{}', a known loadable kernel module rootkit", module),
                    )
                    .with_details(json!({ "module": module }))
                    .with_remediation("Kernel-level compromise: isolate the host and reinstall"),
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

    fn analyze(records: serde_json::Value) -> Vec<Finding> {
        let intel = ThreatIntel::embedded().unwrap();
        RootkitAnalyzer
            .analyze(&CollectedData::new(ModuleName::Rootkit, records), &intel)
            .unwrap()
    }

    #[test]
    fn test_single_preload_entry_is_one_critical() {
        let findings = analyze(json!({ "ldPreload": "# managed\n/etc/data/libsystem.so\n" }));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(
            findings[0].details.as_ref().unwrap()["entries"],
            json!(["/etc/data/libsystem.so"])
        );
    }

    #[test]
    fn test_comment_only_preload_is_clean() {
        assert!(analyze(json!({ "ldPreload": "# nothing\n\n" })).is_empty());
    }

    #[test]
    fn test_collector_classifies_libraries() {
        let runner = ScriptedRunner::new()
            .ok(
                "find /tmp /var/tmp /dev/shm /etc -maxdepth 4 -type f -name '*.so*' 2>/dev/null",
                "/tmp/.x/libhide.so\n/etc/alternatives/libblas.so.3\n/etc/data/libsystem.so\n/etc/ssl/engines/libpkcs11.so\n",
            )
            .ok("ls -1A /etc/data", "libsystem.so\n")
            .ok("lsmod", "Module                  Size  Used by\ndiamorphine            16384  0\next4                  999424  1\n");

        let data = RootkitCollector.collect(&runner).unwrap();
        let records: RootkitRecords = decode_records(&data);
        assert_eq!(records.ld_preload, "");
        assert_eq!(records.suspicious_libraries, vec!["/tmp/.x/libhide.so", "/etc/data/libsystem.so"]);
        assert!(records.malware_dir.exists);
        assert_eq!(records.kernel_modules, vec!["diamorphine", "ext4"]);

        let intel = ThreatIntel::embedded().unwrap();
        let findings = RootkitAnalyzer.analyze(&data, &intel).unwrap();
        let severities: Vec<_> = findings.iter().map(|f| f.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::High, Severity::High, Severity::Critical, Severity::Critical]
        );
        assert_eq!(findings[3].id, "RK-004");
    }

    #[test]
    fn test_missing_malware_dir() {
        let data = RootkitCollector.collect(&ScriptedRunner::new()).unwrap();
        let records: RootkitRecords = decode_records(&data);
        assert!(!records.malware_dir.exists);
        assert!(records.kernel_modules.is_empty());
    }
}
