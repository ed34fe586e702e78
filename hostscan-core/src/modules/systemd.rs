use crate::exec::{shell_quote, CommandRunner};
use crate::intel::ThreatIntel;
use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    binary_of, decode_records, encode_records, lenient_vec, suspicious_hidden_component,
    Analyzer, Collector, QUICK, STANDARD,
};

/// Directories probed when `systemctl show` does not report a fragment path
const UNIT_DIRS: &[&str] = &[
    "/etc/systemd/system",
    "/run/systemd/system",
    "/usr/local/lib/systemd/system",
    "/usr/lib/systemd/system",
    "/lib/systemd/system",
];

/// ExecStart locations that never hold packaged daemons
const SUSPICIOUS_EXEC_DIRS: &[&str] = &["/tmp/", "/var/tmp/", "/dev/shm/", "/run/user/", "/var/run/user/"];

/// Locations of distribution-managed binaries
const STANDARD_BIN_DIRS: &[&str] = &[
    "/usr/bin/",
    "/usr/sbin/",
    "/bin/",
    "/sbin/",
    "/usr/lib/",
    "/lib/",
    "/usr/libexec/",
    "/usr/share/",
    "/snap/",
];

/// Seconds below which an always-restarting service is considered a watchdog
const RESTART_SEC_THRESHOLD: f64 = 30.0;

/// Units shipped by mainstream distributions; their unit files are not inspected
const STANDARD_UNITS: &[&str] = &[
    "accounts-daemon", "acpid", "anacron", "apparmor", "apport", "atd", "auditd",
    "avahi-daemon", "blk-availability", "bluetooth", "chrony", "chronyd", "cloud-config",
    "cloud-final", "cloud-init", "cloud-init-local", "console-setup", "containerd", "cron",
    "crond", "cups", "cups-browsed", "dbus", "dbus-broker", "dm-event", "docker",
    "e2scrub_reap", "finalrd", "firewalld", "fstrim", "fwupd", "gdm", "getty@",
    "gpu-manager", "grub-common", "grub-initrd-fallback", "irqbalance", "iscsid",
    "keyboard-setup", "kdump", "kerneloops", "lightdm", "lm-sensors", "lvm2-monitor",
    "lxd-agent", "mdmonitor", "ModemManager", "multipathd", "netfilter-persistent",
    "networkd-dispatcher", "NetworkManager", "NetworkManager-dispatcher",
    "NetworkManager-wait-online", "nftables", "nginx", "open-iscsi", "open-vm-tools",
    "openvpn", "plymouth", "polkit", "postfix", "qemu-guest-agent", "rasdaemon",
    "rc-local", "rngd", "rsyslog", "rtkit-daemon", "secureboot-db", "selinux-autorelabel-mark",
    "setvtrgb", "smartd", "snapd", "snapd.apparmor", "snapd.autoimport", "snapd.core-fixup",
    "snapd.recovery-chooser-trigger", "snapd.seeded", "snapd.system-shutdown", "ssh", "sshd",
    "sssd", "switcheroo-control", "sysstat", "systemd-fsck-root", "systemd-networkd",
    "systemd-networkd-wait-online", "systemd-pstore", "systemd-resolved", "systemd-timesyncd",
    "systemd-homed", "systemd-oomd", "systemd-userdbd", "systemd-boot-update",
    "systemd-network-generator", "systemd-remount-fs", "systemd-sysext", "systemd-confext",
    "systemd-journald", "systemd-logind", "systemd-udevd", "systemd-machined",
    "systemd-journal-upload", "systemd-journal-remote", "serial-getty@", "autovt@",
    "thermald", "tuned", "ua-reboot-cmds",
    "ubuntu-advantage", "udisks2", "ufw", "unattended-upgrades", "upower", "vgauth",
    "whoopsie", "wpa_supplicant", "fail2ban", "apache2", "httpd", "mysql", "mariadb",
    "postgresql", "redis-server", "php-fpm", "libvirtd", "vmtoolsd", "hv-kvp-daemon",
    "google-guest-agent", "google-osconfig-agent", "amazon-ssm-agent", "walinuxagent",
    "waagent", "pmlogger", "pmcd", "tailscaled", "zfs-import-cache", "zfs-mount",
    "zfs-share", "zfs-zed",
];

/// An enabled service unit and, when inspected, its key directives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceUnit {
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_sec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standard_output: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SystemdRecords {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub services: Vec<ServiceUnit>,
}

/// Systemd Services Collector
///
/// Lists enabled services and reads unit files of anything non-standard
pub struct SystemdCollector;

impl SystemdCollector {
    /// Parse: "service-name.service  enabled  enabled"
    fn parse_unit_files(output: &str) -> Vec<ServiceUnit> {
        let mut services = Vec::new();

        for line in output.lines() {
            if line.contains("UNIT FILE") || line.trim().is_empty() || line.contains("unit files listed") {
                continue;
            }
            let mut parts = line.split_whitespace();
            if let (Some(name), Some(state)) = (parts.next(), parts.next()) {
                if name.ends_with(".service") {
                    services.push(ServiceUnit {
                        name: name.to_string(),
                        state: state.to_string(),
                        ..Default::default()
                    });
                }
            }
        }

        services
    }

    fn is_standard(unit: &str) -> bool {
        let base = normalize_unit_name(unit);
        STANDARD_UNITS.contains(&base.as_str())
    }

    fn locate_unit_file(runner: &dyn CommandRunner, unit: &str) -> Option<String> {
        let quoted = shell_quote(unit);
        let shown = runner.execute(&format!("systemctl show -p FragmentPath {}", quoted), QUICK);
        if let Some(path) = shown
            .lines()
            .find_map(|l| l.strip_prefix("FragmentPath="))
            .filter(|p| !p.is_empty())
        {
            return Some(path.to_string());
        }

        UNIT_DIRS.iter().map(|dir| format!("{}/{}", dir, unit)).find(|candidate| {
            runner
                .execute(&format!("test -f {}", shell_quote(candidate)), QUICK)
                .is_success()
        })
    }

    /// Keep the first value of each directive of interest
    fn parse_unit_file(content: &str, unit: &mut ServiceUnit) {
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            let slot = match key.trim() {
                "ExecStart" => &mut unit.exec_start,
                "Restart" => &mut unit.restart,
                "RestartSec" => &mut unit.restart_sec,
                "StandardOutput" => &mut unit.standard_output,
                _ => continue,
            };
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value);
            }
        }
    }
}

impl Collector for SystemdCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let output = runner.execute(
            "systemctl list-unit-files --type=service --state=enabled --no-pager --no-legend",
            STANDARD,
        );
        let mut raw = output.stdout.clone();
        let mut services = Self::parse_unit_files(&output.stdout);

        for unit in services.iter_mut().filter(|u| !Self::is_standard(&u.name)) {
            let Some(path) = Self::locate_unit_file(runner, &unit.name) else {
                continue;
            };
            let content = runner.execute(&format!("cat {}", shell_quote(&path)), QUICK);
            Self::parse_unit_file(&content.stdout, unit);
            unit.unit_file = Some(path);
            raw.push_str(&content.stdout);
        }

        let records = SystemdRecords { services };
        Ok(CollectedData::new(ModuleName::Systemd, encode_records(&records)?).with_raw(raw))
    }
}

/// `foo.service` / `foo@bar.service` → `foo` / `foo@`
fn normalize_unit_name(unit: &str) -> String {
    let base = unit.trim_end_matches(".service");
    match base.split_once('@') {
        Some((prefix, _)) => format!("{}@", prefix),
        None => base.to_string(),
    }
}

/// Binary of an ExecStart line, without systemd's `-@:+!` prefixes
fn exec_binary(exec_start: &str) -> &str {
    binary_of(exec_start.trim_start_matches(&['-', '@', ':', '+', '!'][..]))
}

/// RestartSec in seconds; bare numbers are seconds. Unset means systemd's 100ms default.
fn restart_seconds(value: Option<&str>) -> f64 {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return 0.1;
    };
    let mut total = 0.0;
    for token in value.split_whitespace() {
        let split = token
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(token.len());
        let (number, unit) = token.split_at(split);
        let Ok(number) = number.parse::<f64>() else {
            return f64::MAX;
        };
        total += match unit {
            "" | "s" | "sec" | "second" | "seconds" => number,
            "ms" | "msec" => number / 1000.0,
            "us" | "usec" => number / 1_000_000.0,
            "m" | "min" | "minute" | "minutes" => number * 60.0,
            "h" | "hr" | "hour" | "hours" => number * 3600.0,
            _ => return f64::MAX,
        };
    }
    total
}

/// Systemd Services Analyzer
///
/// Flags malicious unit names and persistence patterns in unit files
pub struct SystemdAnalyzer;

impl Analyzer for SystemdAnalyzer {
    fn analyze(&self, data: &CollectedData, intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: SystemdRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Systemd);

        for unit in &records.services {
            let base = normalize_unit_name(&unit.name);
            let exec_start = unit.exec_start.as_deref().unwrap_or("");
            let binary = exec_binary(exec_start);
            let details = json!({
                "unit": unit.name,
                "unitFile": unit.unit_file,
                "execStart": excerpt(exec_start),
            });

            if let Some(hit) = intel.match_service(base.trim_end_matches('@')) {
                findings.push(
                    Finding::new(
                        ModuleName::Systemd,
                        hit.severity(),
                        format!("Known malicious service: {}", unit.name),
                        hit.description.clone().unwrap_or_else(|| format!("{} matches a known malware unit name", unit.name)),
                    )
                    .with_details(details.clone())
                    .with_remediation(format!(
                        "Stop and disable the unit (systemctl disable --now {}), then remove its unit file and binary",
                        unit.name
                    )),
                );
            }

            if SUSPICIOUS_EXEC_DIRS.iter().any(|dir| binary.starts_with(dir)) {
                findings.push(
                    Finding::new(
                        ModuleName::Systemd,
                        Severity::High,
                        format!("Service {} executes from a temporary location", unit.name),
                        format!("ExecStart={}", excerpt(exec_start)),
                    )
                    .with_details(details.clone())
                    .with_remediation(format!("Inspect {} and disable the unit if it is not expected", binary)),
                );
            }

            if let Some(dir) = suspicious_hidden_component(binary) {
                findings.push(
                    Finding::new(
                        ModuleName::Systemd,
                        Severity::High,
                        format!("Service {} executes from hidden directory", unit.name),
                        format!("ExecStart binary {} lives under '{}'", binary, dir),
                    )
                    .with_details(details.clone())
                    .with_remediation("Hidden directories are a common malware hiding place; verify the binary's origin"),
                );
            }

            let always = unit.restart.as_deref().map(str::trim) == Some("always");
            let restart_sec = restart_seconds(unit.restart_sec.as_deref());
            let non_standard = !binary.is_empty() && !STANDARD_BIN_DIRS.iter().any(|dir| binary.starts_with(dir));
            if always && restart_sec < RESTART_SEC_THRESHOLD && non_standard {
                findings.push(
                    Finding::new(
                        ModuleName::Systemd,
                        Severity::Medium,
                        format!("Service {} respawns aggressively", unit.name),
                        format!("Restart=always with RestartSec={}s for non-standard binary {}", restart_sec, binary),
                    )
                    .with_details(details.clone())
                    .with_remediation("Aggressive respawn keeps malware alive after it is killed; confirm the service is legitimate"),
                );
            }

            if unit.standard_output.as_deref().map(str::trim) == Some("null") {
                findings.push(
                    Finding::new(
                        ModuleName::Systemd,
                        Severity::Medium,
                        format!("Service {} discards its output", unit.name),
                        "StandardOutput=null hides the service's activity from the journal",
                    )
                    .with_details(details)
                    .with_remediation("Confirm why the unit suppresses logging"),
                );
            }
        }

        Ok(findings.into_vec())
    }
}
