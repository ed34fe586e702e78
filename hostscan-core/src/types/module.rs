use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of detection modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleName {
    Processes,
    Network,
    Systemd,
    Crontabs,
    Rootkit,
    Ssh,
    Shell,
    Filesystem,
    Firewall,
    Credentials,
}

impl ModuleName {
    /// Canonical execution order
    pub const ALL: [ModuleName; 10] = [
        ModuleName::Processes,
        ModuleName::Network,
        ModuleName::Systemd,
        ModuleName::Crontabs,
        ModuleName::Rootkit,
        ModuleName::Ssh,
        ModuleName::Shell,
        ModuleName::Filesystem,
        ModuleName::Firewall,
        ModuleName::Credentials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleName::Processes => "processes",
            ModuleName::Network => "network",
            ModuleName::Systemd => "systemd",
            ModuleName::Crontabs => "crontabs",
            ModuleName::Rootkit => "rootkit",
            ModuleName::Ssh => "ssh",
            ModuleName::Shell => "shell",
            ModuleName::Filesystem => "filesystem",
            ModuleName::Firewall => "firewall",
            ModuleName::Credentials => "credentials",
        }
    }

    /// Prefix used for finding ids, e.g. `NET` in `NET-001`
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ModuleName::Processes => "PROC",
            ModuleName::Network => "NET",
            ModuleName::Systemd => "SVC",
            ModuleName::Crontabs => "CRON",
            ModuleName::Rootkit => "RK",
            ModuleName::Ssh => "SSH",
            ModuleName::Shell => "SHELL",
            ModuleName::Filesystem => "FS",
            ModuleName::Firewall => "FW",
            ModuleName::Credentials => "CRED",
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ModuleName::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| format!("unknown module '{}'", s))
    }
}
