//! Command line arguments and the JSON configuration file.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::info;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::hostmap::{DEFAULT_DNS_PORT, HostMap, parse_upstream};
use crate::resolver::HostMaps;

#[derive(Parser, Debug)]
#[command(name = "dnsoverride")]
#[command(about = "DNS proxy with local glob overrides and an answer cache", long_about = None)]
pub struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.json")]
    pub file: PathBuf,

    /// Inline JSON configuration, used instead of the file
    #[arg(long)]
    pub json_config: Option<String>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Cache expiration in seconds; zero or negative disables expiration
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub expiration: i64,

    /// Listen on the outbound interface address instead of the configured host
    #[arg(long)]
    pub use_outbound: bool,

    /// Port used together with an autodetected listen address
    #[arg(short, long, default_value_t = DEFAULT_DNS_PORT)]
    pub port: u16,

    /// Upstream exchange timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}

/// The JSON configuration document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Listen address, `ip:port` or `ip`
    pub host: String,
    /// Upstream used when no `servers` pattern matches
    pub default_dns: String,
    pub servers: HostMap,
    pub domains: HostMap,
    pub vars: HostMap,
}

impl DnsConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&body)
    }

    /// Compile the override tables. Any bad pattern is fatal.
    pub fn compile(&self) -> Result<HostMaps> {
        Ok(HostMaps {
            domains: self.domains.compile()?,
            vars: self.vars.compile()?,
            servers: self.servers.compile_servers()?,
        })
    }
}

/// Everything the proxy needs to start.
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub default_upstream: SocketAddr,
    pub maps: HostMaps,
    pub expiration: Option<Duration>,
    pub exchange_timeout: Duration,
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = match &args.json_config {
            Some(json) => DnsConfig::from_json(json)?,
            None => DnsConfig::from_file(&args.file)?,
        };
        Self::new(args, config)
    }

    pub fn new(args: &Args, config: DnsConfig) -> Result<Self> {
        if config.default_dns.trim().is_empty() {
            return Err(Error::Config("default_dns is required".into()));
        }
        let default_upstream = parse_upstream(&config.default_dns)?;

        let bind_addr = if config.host.trim().is_empty() || args.use_outbound {
            let ip = outbound_ip()?;
            info!("using outbound address {}", ip);
            SocketAddr::new(ip, args.port)
        } else {
            parse_listen(&config.host, args.port)?
        };

        let maps = config.compile()?;
        info!(
            "compiled {} domain, {} variable and {} server patterns",
            maps.domains.len(),
            maps.vars.len(),
            maps.servers.len()
        );

        Ok(Self {
            bind_addr,
            default_upstream,
            maps,
            expiration: expiration_from_secs(args.expiration),
            exchange_timeout: Duration::from_millis(args.timeout_ms.max(1)),
        })
    }
}

fn expiration_from_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

fn parse_listen(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| Error::Config(format!("invalid host {host:?}")))
}

/// Local address of the interface used to reach the internet.
///
/// Connecting a UDP socket sends nothing; it only picks a route.
pub fn outbound_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(("8.8.8.8", 80))?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["dnsoverride"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    const SAMPLE: &str = r#"{
        "host": "127.0.0.1:5353",
        "default_dns": "1.1.1.1",
        "servers": {"**.corp": "10.0.0.53:53"},
        "domains": {"*.dev.test": "127.0.0.1", "api.test": "backend"},
        "vars": {"backend": "192.168.1.20"}
    }"#;

    #[test]
    fn args_defaults() {
        let args = args(&[]);

        assert_eq!(args.file, PathBuf::from("config.json"));
        assert_eq!(args.log_level, "info");
        assert_eq!(args.expiration, -1);
        assert_eq!(args.port, 53);
        assert!(!args.use_outbound);
    }

    #[test]
    fn args_accept_negative_expiration() {
        assert_eq!(args(&["--expiration", "-5"]).expiration, -5);
        assert_eq!(args(&["-e", "30"]).expiration, 30);
    }

    #[test]
    fn settings_from_inline_json() {
        let args = args(&["--json-config", SAMPLE, "--expiration", "30"]);
        let settings = Settings::from_args(&args).unwrap();

        assert_eq!(settings.bind_addr, "127.0.0.1:5353".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.default_upstream, "1.1.1.1:53".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.expiration, Some(Duration::from_secs(30)));
        assert_eq!(settings.exchange_timeout, Duration::from_secs(2));
        assert_eq!(settings.maps.domains.len(), 2);
        assert_eq!(settings.maps.vars.len(), 1);
        assert_eq!(
            settings.maps.servers.find("git.corp."),
            Some(&"10.0.0.53:53".parse::<SocketAddr>().unwrap())
        );
    }

    #[test]
    fn host_without_port_uses_port_flag() {
        let config = DnsConfig {
            host: "127.0.0.1".into(),
            default_dns: "9.9.9.9:53".into(),
            ..Default::default()
        };
        let settings = Settings::new(&args(&["--port", "5300"]), config).unwrap();

        assert_eq!(settings.bind_addr, "127.0.0.1:5300".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn non_positive_expiration_disables_cache_expiry() {
        assert_eq!(expiration_from_secs(-1), None);
        assert_eq!(expiration_from_secs(0), None);
        assert_eq!(expiration_from_secs(5), Some(Duration::from_secs(5)));
    }

    #[test]
    fn missing_default_dns_is_rejected() {
        let config = DnsConfig {
            host: "127.0.0.1:53".into(),
            ..Default::default()
        };

        assert!(matches!(Settings::new(&args(&[]), config), Err(Error::Config(_))));
    }

    #[test]
    fn bad_pattern_is_fatal() {
        let json = r#"{"host": "127.0.0.1:53", "default_dns": "1.1.1.1", "domains": {"{oops": "1.2.3.4"}}"#;
        let args = args(&["--json-config", json]);

        assert!(matches!(Settings::from_args(&args), Err(Error::Compile { .. })));
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(DnsConfig::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let args = args(&["--file", "/nonexistent/dnsoverride.json"]);

        assert!(matches!(Settings::from_args(&args), Err(Error::Config(_))));
    }
}
