//! Configuration model: YAML load/save, validation, and timestamped backups.
//!
//! The config file is the only persistent state in the system. Every mutating
//! API route rewrites it through [`Config::save`], which snapshots the
//! previous file into `config_backups/` first.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Serde adapter for duration fields that accepts either plain seconds
/// (`300`) or a suffixed string (`"30s"`, `"5m"`, `"24h"`).
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

pub(crate) fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("invalid duration: {text}"))?;
    let (value, unit) = text.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {text}"))?;
    let multiplier = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(Duration::from_secs(value * multiplier))
}

pub(crate) fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub interface: String,
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub lease_time: Duration,
    pub api_port: u16,
    #[serde(default)]
    pub api_host: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub allow_any_server_ip: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            port: 67,
            lease_time: Duration::from_secs(86400),
            api_port: 8080,
            api_host: String::new(),
            log_level: default_log_level(),
            log_file: default_log_file(),
            debug: false,
            allow_any_server_ip: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "dhcp.log".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub subnet: String,
    pub netmask: Ipv4Addr,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub default_gateway: String,
    #[serde(default)]
    pub dns1: String,
    #[serde(default)]
    pub dns2: String,
    #[serde(default)]
    pub lease_time: u32,
    #[serde(default)]
    pub renewal_time: u32,
    #[serde(default)]
    pub rebinding_time: u32,
    #[serde(default)]
    pub broadcast_address: Option<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: "192.168.1.0/24".to_string(),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            start_ip: Ipv4Addr::new(192, 168, 1, 100),
            end_ip: Ipv4Addr::new(192, 168, 1, 200),
            dns_servers: Vec::new(),
            domain_name: String::new(),
            default_gateway: String::new(),
            dns1: String::new(),
            dns2: String::new(),
            lease_time: 0,
            renewal_time: 0,
            rebinding_time: 0,
            broadcast_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gateway {
    pub name: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
}

/// A static MAC-to-IP reservation, materialized into the pool at boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    pub alias: String,
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Device {
    pub mac: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub retry_count: u32,
    pub method: ProbeMethod,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_http_path")]
    pub http_path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retry_count: 3,
            method: ProbeMethod::Ping,
            tcp_port: default_tcp_port(),
            http_path: default_http_path(),
        }
    }
}

fn default_tcp_port() -> u16 {
    80
}

fn default_http_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Ping,
    Tcp,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between scans.
    pub scan_interval: u64,
    pub max_concurrency: usize,
    /// Per-IP ping timeout in milliseconds.
    pub ping_timeout: u64,
    /// Hours a device may stay inactive before its record is dropped.
    pub inactive_timeout: u64,
    #[serde(default)]
    pub auto_conflict: bool,
    #[serde(default, with = "duration_serde")]
    pub conflict_timeout: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_interval: 300,
            max_concurrency: 32,
            ping_timeout: 1000,
            inactive_timeout: 24,
            auto_conflict: true,
            conflict_timeout: Duration::from_secs(3600),
            log_level: default_log_level(),
        }
    }
}

/// A timestamped snapshot under `config_backups/`.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub path: PathBuf,
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the config back to `path`, snapshotting the previous file into
    /// `config_backups/config_{yyyymmdd_hhmmss}.yaml` first.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        backup_config(path).await?;
        let content = self.to_yaml_string()?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if parse_cidr(&self.network.subnet).is_none() {
            return Err(Error::InvalidConfig(format!(
                "invalid subnet: {} (expected CIDR notation)",
                self.network.subnet
            )));
        }

        if u32::from(self.network.start_ip) > u32::from(self.network.end_ip) {
            return Err(Error::InvalidConfig(format!(
                "start_ip {} is after end_ip {}",
                self.network.start_ip, self.network.end_ip
            )));
        }

        let mut default_count = 0;
        let mut seen_names = std::collections::HashSet::new();
        for gateway in &self.gateways {
            if !seen_names.insert(gateway.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate gateway name: {}",
                    gateway.name
                )));
            }
            if gateway.is_default {
                default_count += 1;
            }
        }
        if default_count > 1 {
            return Err(Error::InvalidConfig(
                "only one gateway may be marked default".to_string(),
            ));
        }
        if default_count == 0 && !self.gateways.is_empty() {
            return Err(Error::InvalidConfig(
                "one gateway must be marked default".to_string(),
            ));
        }

        for binding in &self.bindings {
            normalize_mac(&binding.mac).map_err(|_| {
                Error::InvalidConfig(format!("invalid binding MAC: {}", binding.mac))
            })?;
        }

        match self.server.api_host.as_str() {
            "" | "0.0.0.0" | "localhost" => {}
            host => {
                if host.parse::<Ipv4Addr>().is_err() {
                    return Err(Error::InvalidConfig(format!("invalid api_host: {host}")));
                }
            }
        }

        Ok(())
    }

    /// Lease duration for newly minted dynamic leases. `server.lease_time`
    /// wins; `network.lease_time` (seconds) is the legacy fallback.
    pub fn lease_duration(&self) -> Duration {
        if !self.server.lease_time.is_zero() {
            self.server.lease_time
        } else if self.network.lease_time > 0 {
            Duration::from_secs(self.network.lease_time as u64)
        } else {
            Duration::from_secs(86400)
        }
    }

    pub fn default_gateway(&self) -> Option<&Gateway> {
        self.gateways.iter().find(|gateway| gateway.is_default)
    }

    pub fn find_gateway(&self, name: &str) -> Option<&Gateway> {
        self.gateways.iter().find(|gateway| gateway.name == name)
    }

    pub fn find_binding_by_mac(&self, mac: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|binding| normalize_mac(&binding.mac).ok().as_deref() == Some(mac))
    }

    pub fn find_device_by_mac(&self, mac: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|device| normalize_mac(&device.mac).ok().as_deref() == Some(mac))
    }

    pub fn add_or_update_device(&mut self, device: Device) {
        match self
            .devices
            .iter_mut()
            .find(|existing| existing.mac.eq_ignore_ascii_case(&device.mac))
        {
            Some(existing) => *existing = device,
            None => self.devices.push(device),
        }
    }

    pub fn broadcast_address(&self, server_ip: Ipv4Addr) -> Ipv4Addr {
        if let Some(broadcast) = self.network.broadcast_address {
            return broadcast;
        }
        let ip = u32::from(server_ip);
        let mask = u32::from(self.network.netmask);
        Ipv4Addr::from(ip | !mask)
    }
}

/// Copies the current file (if any) into `config_backups/` next to it.
pub async fn backup_config(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let backup_dir = backup_dir(path);
    tokio::fs::create_dir_all(&backup_dir).await?;

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let backup_file = backup_dir.join(format!("config_{timestamp}.yaml"));
    tokio::fs::copy(path, backup_file).await?;

    Ok(())
}

fn backup_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("config_backups")
}

/// Lists backups next to `config_path`, newest first.
pub async fn list_backups(config_path: &Path) -> Result<Vec<BackupInfo>> {
    let dir = backup_dir(config_path);
    let mut backups = Vec::new();

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
        Err(error) => return Err(error.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name
            .strip_prefix("config_")
            .and_then(|rest| rest.strip_suffix(".yaml"))
        else {
            continue;
        };
        let Ok(naive) = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S") else {
            continue;
        };
        let Some(timestamp) = Local.from_local_datetime(&naive).single() else {
            continue;
        };
        let metadata = entry.metadata().await?;
        backups.push(BackupInfo {
            filename: name.clone(),
            timestamp: timestamp.with_timezone(&Utc),
            size: metadata.len(),
            path: dir.join(name),
        });
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(backups)
}

/// Copies a named backup over the live config file.
pub async fn restore_backup(config_path: &Path, filename: &str) -> Result<Config> {
    if filename.contains('/') || filename.contains("..") {
        return Err(Error::InvalidConfig(format!(
            "invalid backup filename: {filename}"
        )));
    }
    let source = backup_dir(config_path).join(filename);
    if !source.exists() {
        return Err(Error::NotFound(format!("backup {filename}")));
    }
    let content = tokio::fs::read_to_string(&source).await?;
    let config = Config::from_yaml_str(&content)?;
    backup_config(config_path).await?;
    tokio::fs::write(config_path, content).await?;
    Ok(config)
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    (prefix <= 32).then_some((addr, prefix))
}

/// Normalizes a MAC address to canonical lower-case colon-separated form.
/// Accepts `:`/`-` separators and bare 12-digit hex.
pub fn normalize_mac(mac: &str) -> Result<String> {
    let cleaned = mac.trim().to_ascii_lowercase().replace('-', ":");
    if !cleaned.contains(':') {
        if cleaned.len() == 12 && cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(cleaned
                .as_bytes()
                .chunks(2)
                .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(":"));
        }
        return Err(Error::InvalidMac(mac.to_string()));
    }

    let octets: Vec<&str> = cleaned.split(':').collect();
    if octets.len() != 6
        || octets
            .iter()
            .any(|part| part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return Err(Error::InvalidMac(mac.to_string()));
    }

    Ok(octets.join(":"))
}

pub fn is_valid_mac(mac: &str) -> bool {
    normalize_mac(mac).is_ok()
}

pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(255)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_config() -> Config {
        Config {
            server: ServerConfig {
                interface: "eth0".to_string(),
                port: 67,
                lease_time: Duration::from_secs(86400),
                api_port: 8080,
                ..ServerConfig::default()
            },
            network: NetworkConfig {
                subnet: "192.168.1.0/24".to_string(),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                start_ip: Ipv4Addr::new(192, 168, 1, 100),
                end_ip: Ipv4Addr::new(192, 168, 1, 200),
                dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
                domain_name: "lan.local".to_string(),
                ..NetworkConfig::default()
            },
            gateways: vec![Gateway {
                name: "main".to_string(),
                ip: Ipv4Addr::new(192, 168, 1, 1),
                is_default: true,
                description: "primary uplink".to_string(),
                dns_servers: Vec::new(),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_validation_accepts_good_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let mut bad_subnet = test_config();
        bad_subnet.network.subnet = "192.168.1.0".to_string();
        assert!(bad_subnet.validate().is_err());

        let mut inverted_range = test_config();
        inverted_range.network.start_ip = Ipv4Addr::new(192, 168, 1, 200);
        inverted_range.network.end_ip = Ipv4Addr::new(192, 168, 1, 100);
        assert!(inverted_range.validate().is_err());

        let mut two_defaults = test_config();
        two_defaults.gateways.push(Gateway {
            name: "backup".to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 2),
            is_default: true,
            description: String::new(),
            dns_servers: Vec::new(),
        });
        assert!(two_defaults.validate().is_err());

        let mut no_default = test_config();
        no_default.gateways[0].is_default = false;
        assert!(no_default.validate().is_err());

        let mut bad_mac = test_config();
        bad_mac.bindings.push(Binding {
            alias: "bad".to_string(),
            mac: "not-a-mac".to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 150),
            gateway: String::new(),
            hostname: String::new(),
        });
        assert!(bad_mac.validate().is_err());

        let mut bad_api_host = test_config();
        bad_api_host.server.api_host = "example.com".to_string();
        assert!(bad_api_host.validate().is_err());
    }

    #[test]
    fn test_api_host_accepted_forms() {
        for host in ["", "0.0.0.0", "localhost", "10.0.0.5"] {
            let mut config = test_config();
            config.server.api_host = host.to_string();
            assert!(config.validate().is_ok(), "api_host {host:?} should pass");
        }
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = test_config();
        let yaml = config.to_yaml_string().unwrap();
        let reloaded = Config::from_yaml_str(&yaml).unwrap();

        assert_eq!(reloaded.network.start_ip, config.network.start_ip);
        assert_eq!(reloaded.network.end_ip, config.network.end_ip);
        assert_eq!(reloaded.gateways, config.gateways);
        assert_eq!(reloaded.server.port, config.server.port);
        assert_eq!(reloaded.server.lease_time, config.server.lease_time);
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_duration_yaml_forms() {
        let yaml = "interval: 30s\ntimeout: 5\nretry_count: 2\nmethod: tcp\n";
        let health: HealthCheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(health.interval, Duration::from_secs(30));
        assert_eq!(health.timeout, Duration::from_secs(5));
        assert_eq!(health.method, ProbeMethod::Tcp);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("AA-BB-CC-DD-EE-FF").unwrap(),
            "aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(normalize_mac("aabbccddeeff").unwrap(), "aa:bb:cc:dd:ee:ff");
        assert!(normalize_mac("aa:bb:cc:dd:ee").is_err());
        assert!(normalize_mac("zz:bb:cc:dd:ee:ff").is_err());
        assert!(normalize_mac("").is_err());
    }

    #[test]
    fn test_gateway_lookups() {
        let mut config = test_config();
        config.gateways.push(Gateway {
            name: "backup".to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 2),
            is_default: false,
            description: String::new(),
            dns_servers: Vec::new(),
        });

        assert_eq!(config.default_gateway().unwrap().name, "main");
        assert_eq!(
            config.find_gateway("backup").unwrap().ip,
            Ipv4Addr::new(192, 168, 1, 2)
        );
        assert!(config.find_gateway("missing").is_none());
    }

    #[test]
    fn test_device_upsert() {
        let mut config = test_config();
        config.add_or_update_device(Device {
            mac: "aa:bb:cc:dd:ee:01".to_string(),
            device_type: "laptop".to_string(),
            ..Device::default()
        });
        config.add_or_update_device(Device {
            mac: "AA:BB:CC:DD:EE:01".to_string(),
            device_type: "desktop".to_string(),
            ..Device::default()
        });

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].device_type, "desktop");
    }

    #[test]
    fn test_broadcast_address() {
        let config = test_config();
        assert_eq!(
            config.broadcast_address(Ipv4Addr::new(192, 168, 1, 1)),
            Ipv4Addr::new(192, 168, 1, 255)
        );

        let mut explicit = test_config();
        explicit.network.broadcast_address = Some(Ipv4Addr::new(192, 168, 1, 127));
        assert_eq!(
            explicit.broadcast_address(Ipv4Addr::new(192, 168, 1, 1)),
            Ipv4Addr::new(192, 168, 1, 127)
        );
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("valid-host.local"), "valid-host.local");
        assert_eq!(sanitize_hostname("bad\x00host"), "badhost");
        assert_eq!(sanitize_hostname("has spaces"), "hasspaces");
    }

    #[tokio::test]
    async fn test_save_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let config = test_config();
        config.save(&path).await.unwrap();
        assert!(list_backups(&path).await.unwrap().is_empty());

        config.save(&path).await.unwrap();
        let backups = list_backups(&path).await.unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].filename.starts_with("config_"));
        assert!(backups[0].filename.ends_with(".yaml"));
    }

    #[tokio::test]
    async fn test_restore_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = test_config();
        config.save(&path).await.unwrap();
        config.network.domain_name = "changed.local".to_string();
        config.save(&path).await.unwrap();

        let backups = list_backups(&path).await.unwrap();
        let restored = restore_backup(&path, &backups[0].filename).await.unwrap();
        assert_eq!(restored.network.domain_name, "lan.local");

        let on_disk = Config::load(&path).await.unwrap();
        assert_eq!(on_disk.network.domain_name, "lan.local");

        assert!(restore_backup(&path, "missing.yaml").await.is_err());
        assert!(restore_backup(&path, "../evil.yaml").await.is_err());
    }
}
