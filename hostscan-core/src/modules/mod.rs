pub(crate) mod accounts;
pub mod credentials;
pub mod crontabs;
pub mod filesystem;
pub mod firewall;
pub mod network;
pub mod processes;
pub mod rootkit;
pub mod shell;
pub mod ssh;
pub mod systemd;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::exec::CommandRunner;
use crate::intel::ThreatIntel;
use crate::types::*;

/// Config file reads
pub(crate) const QUICK: Duration = Duration::from_secs(2);
/// Single-tool status queries
pub(crate) const STANDARD: Duration = Duration::from_secs(10);
/// Bounded directory searches
pub(crate) const SEARCH: Duration = Duration::from_secs(30);
/// Filesystem-wide searches
pub(crate) const DEEP_SEARCH: Duration = Duration::from_secs(60);

/// Directories where dropped payloads usually land
pub(crate) const TEMP_DIRS: &[&str] = &["/tmp/", "/var/tmp/", "/dev/shm/"];

/// Dot-directories that legitimately hold binaries or data
pub(crate) const HIDDEN_DIR_ALLOWLIST: &[&str] = &[
    ".cache",
    ".config",
    ".local",
    ".npm",
    ".nvm",
    ".cargo",
    ".rustup",
    ".pyenv",
    ".rbenv",
    ".gem",
    ".vscode-server",
    ".cursor-server",
    ".git",
    ".ssh",
    ".gnupg",
    ".docker",
    ".kube",
    ".ansible",
    ".mozilla",
    ".java",
    ".m2",
    ".gradle",
    ".deno",
    ".bun",
    ".X11-unix",
    ".ICE-unix",
    ".font-unix",
    ".XIM-unix",
    ".Test-unix",
];

/// Gathers raw OS state for one module
pub trait Collector: Send + Sync {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData>;
}

/// Turns collected records into findings. Must not perform I/O.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, data: &CollectedData, intel: &ThreatIntel) -> Result<Vec<Finding>>;
}

struct ModuleEntry {
    collector: Box<dyn Collector>,
    analyzer: Box<dyn Analyzer>,
}

/// Binds every module name to one collector and one analyzer
pub struct ModuleRegistry {
    entries: HashMap<ModuleName, ModuleEntry>,
}

impl ModuleRegistry {
    /// The production table
    pub fn standard() -> Self {
        let mut registry = Self {
            entries: HashMap::new(),
        };
        for name in ModuleName::ALL {
            let (collector, analyzer): (Box<dyn Collector>, Box<dyn Analyzer>) = match name {
                ModuleName::Processes => (
                    Box::new(processes::ProcessesCollector),
                    Box::new(processes::ProcessesAnalyzer),
                ),
                ModuleName::Network => (
                    Box::new(network::NetworkCollector),
                    Box::new(network::NetworkAnalyzer),
                ),
                ModuleName::Systemd => (
                    Box::new(systemd::SystemdCollector),
                    Box::new(systemd::SystemdAnalyzer),
                ),
                ModuleName::Crontabs => (
                    Box::new(crontabs::CrontabsCollector),
                    Box::new(crontabs::CrontabsAnalyzer),
                ),
                ModuleName::Rootkit => (
                    Box::new(rootkit::RootkitCollector),
                    Box::new(rootkit::RootkitAnalyzer),
                ),
                ModuleName::Ssh => (Box::new(ssh::SshCollector), Box::new(ssh::SshAnalyzer)),
                ModuleName::Shell => (
                    Box::new(shell::ShellCollector),
                    Box::new(shell::ShellAnalyzer),
                ),
                ModuleName::Filesystem => (
                    Box::new(filesystem::FilesystemCollector),
                    Box::new(filesystem::FilesystemAnalyzer),
                ),
                ModuleName::Firewall => (
                    Box::new(firewall::FirewallCollector),
                    Box::new(firewall::FirewallAnalyzer),
                ),
                ModuleName::Credentials => (
                    Box::new(credentials::CredentialsCollector),
                    Box::new(credentials::CredentialsAnalyzer),
                ),
            };
            registry.entries.insert(name, ModuleEntry { collector, analyzer });
        }
        registry
    }

    /// Replace the binding for one module
    pub fn with_module(
        mut self,
        name: ModuleName,
        collector: impl Collector + 'static,
        analyzer: impl Analyzer + 'static,
    ) -> Self {
        self.entries.insert(
            name,
            ModuleEntry {
                collector: Box::new(collector),
                analyzer: Box::new(analyzer),
            },
        );
        self
    }

    pub fn collector(&self, name: ModuleName) -> Option<&dyn Collector> {
        self.entries.get(&name).map(|e| e.collector.as_ref())
    }

    pub fn analyzer(&self, name: ModuleName) -> Option<&dyn Analyzer> {
        self.entries.get(&name).map(|e| e.analyzer.as_ref())
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Decode collector records, falling back to defaults for anything malformed
pub(crate) fn decode_records<T: DeserializeOwned + Default>(data: &CollectedData) -> T {
    if data.records.is_null() {
        return T::default();
    }
    match serde_json::from_value(data.records.clone()) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(module = %data.module, error = %e, "malformed records, using defaults");
            T::default()
        }
    }
}

/// Decode a list element by element; a malformed element becomes its default
pub(crate) fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).unwrap_or_default())
            .collect(),
        _ => Vec::new(),
    })
}

/// Serialize typed records for a [`CollectedData`]
pub(crate) fn encode_records<T: serde::Serialize>(records: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(records)?)
}

pub(crate) fn under_temp_dir(path: &str) -> bool {
    TEMP_DIRS.iter().any(|dir| path.starts_with(dir))
}

/// First dot-directory component of `path` that is not allow-listed
pub(crate) fn suspicious_hidden_component(path: &str) -> Option<&str> {
    let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    // The final component is the file itself
    components.pop();
    components.into_iter().find(|c| {
        c.starts_with('.') && *c != "." && *c != ".." && !HIDDEN_DIR_ALLOWLIST.contains(c)
    })
}

/// Program path from a command line, ignoring leading `KEY=value` pairs
pub(crate) fn binary_of(command: &str) -> &str {
    command
        .split_whitespace()
        .find(|token| !token.contains('=') || token.starts_with('/'))
        .unwrap_or("")
}

/// Last path component
pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Lines that carry content: not blank, not `#` comments
pub(crate) fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}
