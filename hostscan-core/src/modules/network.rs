use crate::exec::CommandRunner;
use crate::intel::{PortDirection, ThreatIntel};
use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{decode_records, encode_records, lenient_vec, Analyzer, Collector, STANDARD};

/// Remote ports probed by IoT botnets (telnet, alt-telnet, Huawei HG532)
const BOTNET_SCAN_PORTS: &[u16] = &[23, 2323, 37215];

/// Highest port considered privileged
const PRIVILEGED_PORT_MAX: u16 = 1024;

/// A socket in LISTEN/UNCONN state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListeningSocket {
    pub proto: String,
    pub local_address: String,
    pub local_port: u16,
    pub process: String,
}

/// An established connection to a non-loopback peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Connection {
    pub proto: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub process: String,
    pub state: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NetworkRecords {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub listening: Vec<ListeningSocket>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub connections: Vec<Connection>,
}

/// Socket Table Collector
///
/// Parses `ss` output for listeners and established connections
pub struct NetworkCollector;

impl NetworkCollector {
    /// Split `addr:port`, handling `[v6]:port` and `%iface` scope suffixes
    pub(crate) fn parse_endpoint(endpoint: &str) -> Option<(String, u16)> {
        let (address, port) = if let Some(rest) = endpoint.strip_prefix('[') {
            let (address, port) = rest.rsplit_once("]:")?;
            (address, port)
        } else {
            endpoint.rsplit_once(':')?
        };

        let address = address.split('%').next().unwrap_or(address);
        // Wildcard ports ("*") carry no number
        let port = port.parse().ok()?;
        Some((address.to_string(), port))
    }

    /// Owner annotation: `users:(("sshd",pid=812,fd=3))`
    pub(crate) fn parse_process(annotation: &str) -> String {
        annotation
            .split_once("((\"")
            .and_then(|(_, rest)| rest.split_once('"'))
            .map(|(name, _)| name.to_string())
            .unwrap_or_default()
    }

    fn is_loopback(address: &str) -> bool {
        address.starts_with("127.") || address == "::1" || address == "::ffff:127.0.0.1"
    }

    /// `ss -tulnp`: Netid State Recv-Q Send-Q Local Peer [Process]
    fn parse_listening(output: &str) -> Vec<ListeningSocket> {
        let mut sockets = Vec::new();

        for line in output.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 {
                continue;
            }
            let state = parts[1];
            if state != "LISTEN" && state != "UNCONN" {
                continue;
            }
            if let Some((address, port)) = Self::parse_endpoint(parts[4]) {
                sockets.push(ListeningSocket {
                    proto: parts[0].to_string(),
                    local_address: address,
                    local_port: port,
                    process: parts.get(6..).map(|p| Self::parse_process(&p.join(" "))).unwrap_or_default(),
                });
            }
        }

        sockets
    }

    /// `ss -tunp`: established sockets with their peer
    fn parse_connections(output: &str) -> Vec<Connection> {
        let mut connections = Vec::new();

        for line in output.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                continue;
            }
            let state = parts[1];
            if state == "LISTEN" || state == "UNCONN" || state == "State" {
                continue;
            }
            let (Some((local_address, local_port)), Some((remote_address, remote_port))) =
                (Self::parse_endpoint(parts[4]), Self::parse_endpoint(parts[5]))
            else {
                continue;
            };
            if Self::is_loopback(&remote_address) {
                continue;
            }
            connections.push(Connection {
                proto: parts[0].to_string(),
                local_address,
                local_port,
                remote_address,
                remote_port,
                process: parts.get(6..).map(|p| Self::parse_process(&p.join(" "))).unwrap_or_default(),
                state: state.to_string(),
            });
        }

        connections
    }
}

impl Collector for NetworkCollector {
    fn collect(&self, runner: &dyn CommandRunner) -> Result<CollectedData> {
        let listening = runner.execute("ss -tulnp", STANDARD);
        let connections = runner.execute("ss -tunp", STANDARD);

        let records = NetworkRecords {
            listening: Self::parse_listening(&listening.stdout),
            connections: Self::parse_connections(&connections.stdout),
        };
        let raw = format!("{}\n{}", listening.stdout, connections.stdout);
        Ok(CollectedData::new(ModuleName::Network, encode_records(&records)?).with_raw(raw))
    }
}

/// Network Exposure Analyzer
///
/// Matches peers and listeners against threat intel and botnet heuristics
pub struct NetworkAnalyzer;

impl NetworkAnalyzer {
    fn is_any_interface(address: &str) -> bool {
        matches!(address, "0.0.0.0" | "::" | "*")
    }

    fn process_label(process: &str) -> &str {
        if process.is_empty() { "unknown process" } else { process }
    }
}

impl Analyzer for NetworkAnalyzer {
    fn analyze(&self, data: &CollectedData, intel: &ThreatIntel) -> Result<Vec<Finding>> {
        let records: NetworkRecords = decode_records(data);
        let mut findings = FindingSet::new(ModuleName::Network);

        for conn in &records.connections {
            let remote = format!("{}:{}", conn.remote_address, conn.remote_port);
            let details = json!({
                "proto": conn.proto,
                "local": format!("{}:{}", conn.local_address, conn.local_port),
                "remote": remote,
                "process": conn.process,
                "state": conn.state,
            });

            if let Some(hit) = intel.lookup_ip(&conn.remote_address) {
                findings.push(
                    Finding::new(
                        ModuleName::Network,
                        hit.severity(),
                        format!("Connection to known malicious IP: {}", hit.name),
                        format!("{} is connected to {}", Self::process_label(&conn.process), remote),
                    )
                    .with_details(details.clone())
                    .with_remediation(format!("Block {} at the firewall and investigate the owning process", conn.remote_address)),
                );
            }

            if let Some(hit) = intel.match_port(conn.remote_port, PortDirection::Outbound) {
                findings.push(
                    Finding::new(
                        ModuleName::Network,
                        hit.severity(),
                        format!("Outbound connection to suspicious port {}", conn.remote_port),
                        format!("{} is connected to {} ({})", Self::process_label(&conn.process), remote, hit.name),
                    )
                    .with_details(details.clone())
                    .with_remediation("Verify the remote service; mining pools and C2 servers commonly use these ports"),
                );
            }

            if BOTNET_SCAN_PORTS.contains(&conn.remote_port) {
                findings.push(
                    Finding::new(
                        ModuleName::Network,
                        Severity::High,
                        format!("Outbound connection to botnet scan port {}", conn.remote_port),
                        format!("{} is connected to {}; IoT botnets propagate over this port", Self::process_label(&conn.process), remote),
                    )
                    .with_details(details)
                    .with_remediation("Identify the process and check for Mirai-style infection"),
                );
            }
        }

        for sock in &records.listening {
            let local = format!("{}:{}", sock.local_address, sock.local_port);
            let details = json!({ "proto": sock.proto, "local": local, "process": sock.process });

            if let Some(hit) = intel.match_port(sock.local_port, PortDirection::Listening) {
                findings.push(
                    Finding::new(
                        ModuleName::Network,
                        hit.severity(),
                        format!("Listening on known backdoor port {}", sock.local_port),
                        format!("{} listens on {} ({})", Self::process_label(&sock.process), local, hit.name),
                    )
                    .with_details(details.clone())
                    .with_remediation("Stop the listener and remove the binary if it is not an authorized service"),
                );
            }

            if sock.local_port > PRIVILEGED_PORT_MAX && Self::is_any_interface(&sock.local_address) {
                findings.push(
                    Finding::new(
                        ModuleName::Network,
                        Severity::Info,
                        format!("High port {} exposed on all interfaces", sock.local_port),
                        format!("{} listens on {}", Self::process_label(&sock.process), local),
                    )
                    .with_details(details)
                    .with_remediation("Bind to localhost if the service does not need to be reachable from the network"),
                );
            }
        }

        Ok(findings.into_vec())
    }
}
