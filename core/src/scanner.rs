//! The default discovery backend.
//!
//! Discovery is delegated to `arp-scan`, run as a child process against the
//! validated interface and network. Its plain output (`ip<TAB>mac<TAB>vendor`)
//! is turned into [`Target`]s.
//!
//! **Architectural Note:**
//! The mapper only knows the [`NetworkScanner`] port. Any other backend
//! (a wireless survey tool, a fixture in tests) plugs in the same way.

use std::net::IpAddr;
use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use fortress_common::config::ConfigStore;
use fortress_common::network::range::ScanNetwork;
use fortress_common::network::target::{MacAddr, Target};
use fortress_common::scanning::NetworkScanner;
use tokio::process::Command;
use tracing::{debug, trace};

pub struct ArpScanner {
    command: String,
}

impl ArpScanner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_config(cfg: &ConfigStore) -> Self {
        Self::new(cfg.get_or("scan.command", "arp-scan".to_string()))
    }
}

#[async_trait]
impl NetworkScanner for ArpScanner {
    async fn scan(&self, interface: &str, network: &ScanNetwork) -> anyhow::Result<Vec<Target>> {
        debug!(command = %self.command, interface, %network, "starting arp sweep");

        let output = Command::new(&self.command)
            .arg("--interface")
            .arg(interface)
            .arg("--plain")
            .arg(network.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", self.command, output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_sweep(&stdout, network))
    }
}

/// Parses `arp-scan --plain` output. Lines that do not parse, and replies
/// from outside `network`, are dropped. Duplicate replies keep the first.
pub fn parse_sweep(output: &str, network: &ScanNetwork) -> Vec<Target> {
    let mut targets: Vec<Target> = Vec::new();

    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(ip), Some(mac)) = (fields.next(), fields.next()) else {
            trace!(line, "skipping unparseable sweep line");
            continue;
        };
        let (Ok(ip), Ok(mac)) = (ip.trim().parse::<IpAddr>(), mac.trim().parse::<MacAddr>()) else {
            trace!(line, "skipping unparseable sweep line");
            continue;
        };
        if !network.contains(ip) || targets.iter().any(|t| t.id == mac) {
            continue;
        }

        let mut target = Target::new(mac).with_ip(ip);
        target.vendor = fields
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.starts_with('('))
            .map(str::to_string);
        targets.push(target);
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_output() {
        let network = ScanNetwork::parse("192.168.1.0/24").unwrap();
        let output = "192.168.1.1\t00:11:22:33:44:55\tTP-LINK TECHNOLOGIES CO.,LTD.\n\
                      192.168.1.20\taa:bb:cc:dd:ee:ff\t(Unknown)\n\
                      192.168.1.20\taa:bb:cc:dd:ee:ff\t(Unknown) (DUP: 2)\n\
                      10.0.0.9\t11:11:11:11:11:11\tElsewhere\n\
                      garbage line\n";

        let targets = parse_sweep(output, &network);

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].vendor.as_deref(), Some("TP-LINK TECHNOLOGIES CO.,LTD."));
        assert_eq!(targets[0].ip, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(targets[1].id.to_string(), "aa:bb:cc:dd:ee:ff");
        assert!(targets[1].vendor.is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let scanner = ArpScanner::new("fortress-no-such-scanner");
        let network = ScanNetwork::parse("10.0.0.0/30").unwrap();
        assert!(scanner.scan("eth0", &network).await.is_err());
    }
}
