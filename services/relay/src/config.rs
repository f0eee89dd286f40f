//! Relay configuration.
//!
//! Flags can also be supplied through `RELAY_*` environment variables. The
//! target list is a text file with one host per line; the relay reaches every
//! target on the same port it listens on.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use crate::fanout::TargetAddr;
use crate::lifecycle::RelayConfig;

/// Which relay to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Persistent TCP connections with reconnection.
    Tcp,
    /// Stateless datagram fan-out.
    Udp,
}

/// Relay command line.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "relay",
    version,
    about = "Replicate inbound traffic to a fixed set of target servers"
)]
pub struct Config {
    /// Port to listen on; targets are reached on the same port.
    #[arg(long, env = "RELAY_PORT")]
    pub port: u16,

    /// Path to the file listing target hosts, one per line.
    #[arg(long, env = "RELAY_CONFIG", default_value = "config.txt")]
    pub config: PathBuf,

    /// Enable debug logging.
    #[arg(long, env = "RELAY_DEBUG")]
    pub debug: bool,

    /// Relay transport.
    #[arg(long, value_enum, env = "RELAY_TRANSPORT", default_value_t = Transport::Tcp)]
    pub transport: Transport,

    /// Emit logs as JSON lines.
    #[arg(long, env = "RELAY_LOG_JSON")]
    pub log_json: bool,

    /// Timeout for each outbound connect, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Delay between reconnect passes, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub reconnect_interval_ms: u64,

    /// Bound on the shutdown sequence, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    pub grace_period_ms: u64,
}

impl Config {
    /// Listen address: all IPv4 interfaces on the configured port.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(10))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(50))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Read the target list and attach the relay port to each host.
    pub fn load_targets(&self) -> Result<Vec<TargetAddr>> {
        Ok(read_target_list(&self.config)?
            .into_iter()
            .map(|host| TargetAddr::new(host, self.port))
            .collect())
    }

    /// Build the TCP relay configuration for the given targets.
    pub fn relay_config(&self, targets: Vec<TargetAddr>) -> RelayConfig {
        let mut config = RelayConfig::new(self.bind_addr(), targets);
        config.connect_timeout = self.connect_timeout();
        config.reconnect_interval = self.reconnect_interval();
        config.grace_period = self.grace_period();
        config
    }
}

/// Read a target list file.
pub fn read_target_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read target list {}", path.display()))?;
    Ok(parse_target_list(&contents))
}

/// One host per non-empty line, trimmed. Order and repeats are kept.
pub fn parse_target_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_target_list() {
        let hosts = parse_target_list("10.0.0.2\n\n  10.0.0.1  \r\n\t\n10.0.0.2\n");
        assert_eq!(hosts, vec!["10.0.0.2", "10.0.0.1", "10.0.0.2"]);
        assert!(parse_target_list("\n \n").is_empty());
    }

    #[test]
    fn test_read_target_list() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "192.168.1.10").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "fd00::1").unwrap();

        let hosts = read_target_list(file.path()).unwrap();
        assert_eq!(hosts, vec!["192.168.1.10", "fd00::1"]);
    }

    #[test]
    fn test_read_missing_target_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let err = read_target_list(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to read target list"));
    }

    #[test]
    fn test_cli_defaults() {
        let config = Config::try_parse_from(["relay", "--port", "9000"]).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.config, PathBuf::from("config.txt"));
        assert!(!config.debug);
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:9000");

        let relay = config.relay_config(Vec::new());
        assert_eq!(relay.connect_timeout, Duration::from_secs(5));
        assert_eq!(relay.reconnect_interval, Duration::from_secs(10));
        assert_eq!(relay.grace_period, Duration::from_secs(3));
    }

    #[test]
    fn test_cli_requires_port() {
        assert!(Config::try_parse_from(["relay"]).is_err());
    }

    #[test]
    fn test_cli_flags() {
        let config = Config::try_parse_from([
            "relay",
            "--port",
            "7000",
            "--config",
            "/etc/relay/targets.txt",
            "--debug",
            "--transport",
            "udp",
            "--reconnect-interval-ms",
            "1",
        ])
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.transport, Transport::Udp);
        assert_eq!(config.config, PathBuf::from("/etc/relay/targets.txt"));
        // Clamped to the minimum interval.
        assert_eq!(config.reconnect_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_load_targets_uses_listen_port() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.1\n10.0.0.2").unwrap();

        let path = file.path().to_str().unwrap();
        let config = Config::try_parse_from(["relay", "--port", "7100", "--config", path]).unwrap();
        let targets = config.load_targets().unwrap();
        assert_eq!(
            targets,
            vec![TargetAddr::new("10.0.0.1", 7100), TargetAddr::new("10.0.0.2", 7100)]
        );
    }
}
