use crate::exec::CommandRunner;
use crate::modules::QUICK;
use crate::types::PlatformInfo;

const UNKNOWN: &str = "unknown";

/// Identify the host. Every field falls back to "unknown".
pub fn detect(runner: &dyn CommandRunner) -> PlatformInfo {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty());

    let os = parse_os_release(&runner.execute("cat /etc/os-release", QUICK).stdout);
    let kernel = first_token(&runner.execute("uname -r", QUICK).stdout);
    let ip = first_token(&runner.execute("hostname -I", QUICK).stdout);

    PlatformInfo {
        hostname: hostname.unwrap_or_else(|| UNKNOWN.to_string()),
        os: os.unwrap_or_else(|| UNKNOWN.to_string()),
        kernel: kernel.unwrap_or_else(|| UNKNOWN.to_string()),
        ip: ip.unwrap_or_else(|| UNKNOWN.to_string()),
    }
}

/// `PRETTY_NAME` from os-release text, quotes removed
fn parse_os_release(content: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "PRETTY_NAME")
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

fn first_token(output: &str) -> Option<String> {
    output.split_whitespace().next().map(str::to_string)
}
