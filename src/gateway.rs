//! Gateway health checking and selection.
//!
//! A background loop probes every configured gateway on a fixed interval and
//! keeps a name-to-healthy map. Response composition asks [`HealthChecker::pick`]
//! for the router to advertise; selection works on a snapshot of the status
//! map so no lock is held across probe I/O.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, Gateway, HealthCheckConfig, ProbeMethod};
use crate::error::{Error, Result};

const RETRY_DELAY: Duration = Duration::from_secs(1);

impl ProbeMethod {
    /// One probe attempt against `ip`, bounded by the configured timeout.
    pub async fn probe(
        &self,
        ip: Ipv4Addr,
        health: &HealthCheckConfig,
        client: &reqwest::Client,
    ) -> bool {
        match self {
            Self::Ping => {
                // -W takes whole seconds; clamp sub-second timeouts up to 1.
                let timeout_secs = health.timeout.as_secs().max(1);
                let result = tokio::time::timeout(
                    health.timeout.max(Duration::from_secs(1)),
                    tokio::process::Command::new("ping")
                        .arg("-c")
                        .arg("1")
                        .arg("-W")
                        .arg(timeout_secs.to_string())
                        .arg(ip.to_string())
                        .output(),
                )
                .await;
                matches!(result, Ok(Ok(output)) if output.status.success())
            }
            Self::Tcp => {
                let address = (ip, health.tcp_port);
                matches!(
                    tokio::time::timeout(health.timeout, tokio::net::TcpStream::connect(address))
                        .await,
                    Ok(Ok(_))
                )
            }
            Self::Http => {
                let url = format!("http://{ip}{}", health.http_path);
                match client.get(&url).send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        (200..400).contains(&status)
                    }
                    Err(_) => false,
                }
            }
        }
    }
}

pub struct HealthChecker {
    gateways: Vec<Gateway>,
    health: HealthCheckConfig,
    status: RwLock<HashMap<String, bool>>,
    http_client: reqwest::Client,
}

impl HealthChecker {
    /// Every gateway starts out healthy until the first probe round says
    /// otherwise.
    pub fn new(config: &Config) -> Result<Self> {
        let status = config
            .gateways
            .iter()
            .map(|gateway| (gateway.name.clone(), true))
            .collect();

        let http_client = reqwest::Client::builder()
            .timeout(config.health_check.timeout)
            .build()
            .map_err(|error| Error::InvalidConfig(format!("http probe client: {error}")))?;

        Ok(Self {
            gateways: config.gateways.clone(),
            health: config.health_check.clone(),
            status: RwLock::new(status),
            http_client,
        })
    }

    /// Probe loop: one immediate round, then one per interval until the
    /// token fires. In-flight probes are bounded by their timeouts.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.gateways.is_empty() {
            return;
        }
        info!("gateway health checker started");

        self.check_all().await;

        let mut ticker =
            tokio::time::interval(self.health.interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("gateway health checker stopped");
                    return;
                }
                _ = ticker.tick() => self.check_all().await,
            }
        }
    }

    async fn check_all(&self) {
        let probes = self.gateways.iter().map(|gateway| async {
            let healthy = self.probe_with_retries(gateway.ip).await;
            (gateway.name.clone(), healthy)
        });
        let results = futures::future::join_all(probes).await;

        let mut status = self.status.write().await;
        for (name, healthy) in results {
            let previous = status.insert(name.clone(), healthy);
            if previous != Some(healthy) {
                if healthy {
                    info!(gateway = %name, "gateway became healthy");
                } else {
                    warn!(gateway = %name, "gateway became unhealthy");
                }
            }
        }
        drop(status);

        debug!("gateway probe round complete");
    }

    async fn probe_with_retries(&self, ip: Ipv4Addr) -> bool {
        let attempts = self.health.retry_count.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            if self
                .health
                .method
                .probe(ip, &self.health, &self.http_client)
                .await
            {
                return true;
            }
        }
        false
    }

    pub async fn is_healthy(&self, name: &str) -> bool {
        *self.status.read().await.get(name).unwrap_or(&false)
    }

    /// Snapshot of the last-known probe outcomes.
    pub async fn status(&self) -> HashMap<String, bool> {
        self.status.read().await.clone()
    }

    /// Picks the gateway to advertise: the preferred one when healthy, else
    /// the healthy default, else the first healthy gateway in config order,
    /// else the default regardless (graceful degradation).
    pub async fn pick(&self, preferred: &str) -> Option<Gateway> {
        let status = self.status().await;
        select_gateway(&self.gateways, &status, preferred).cloned()
    }
}

fn select_gateway<'a>(
    gateways: &'a [Gateway],
    status: &HashMap<String, bool>,
    preferred: &str,
) -> Option<&'a Gateway> {
    let healthy = |name: &str| *status.get(name).unwrap_or(&false);

    if !preferred.is_empty()
        && healthy(preferred)
        && let Some(gateway) = gateways.iter().find(|gateway| gateway.name == preferred)
    {
        return Some(gateway);
    }

    let default = gateways.iter().find(|gateway| gateway.is_default);
    if let Some(gateway) = default
        && healthy(&gateway.name)
    {
        return Some(gateway);
    }

    if let Some(gateway) = gateways.iter().find(|gateway| healthy(&gateway.name)) {
        return Some(gateway);
    }

    if default.is_some() {
        warn!("no healthy gateway, falling back to the default");
    }
    default
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateways() -> Vec<Gateway> {
        vec![
            Gateway {
                name: "main".to_string(),
                ip: Ipv4Addr::new(192, 168, 1, 1),
                is_default: true,
                description: String::new(),
                dns_servers: Vec::new(),
            },
            Gateway {
                name: "backup".to_string(),
                ip: Ipv4Addr::new(192, 168, 1, 2),
                is_default: false,
                description: String::new(),
                dns_servers: Vec::new(),
            },
            Gateway {
                name: "vpn".to_string(),
                ip: Ipv4Addr::new(192, 168, 1, 3),
                is_default: false,
                description: String::new(),
                dns_servers: Vec::new(),
            },
        ]
    }

    fn status_of(entries: &[(&str, bool)]) -> HashMap<String, bool> {
        entries
            .iter()
            .map(|(name, healthy)| (name.to_string(), *healthy))
            .collect()
    }

    #[test]
    fn test_healthy_preferred_wins() {
        let gateways = gateways();
        let status = status_of(&[("main", true), ("backup", true), ("vpn", true)]);

        let picked = select_gateway(&gateways, &status, "vpn").unwrap();
        assert_eq!(picked.name, "vpn");
    }

    #[test]
    fn test_unhealthy_preferred_falls_back_to_default() {
        let gateways = gateways();
        let status = status_of(&[("main", true), ("backup", true), ("vpn", false)]);

        let picked = select_gateway(&gateways, &status, "vpn").unwrap();
        assert_eq!(picked.name, "main");
    }

    #[test]
    fn test_unhealthy_default_falls_back_to_first_healthy() {
        let gateways = gateways();
        let status = status_of(&[("main", false), ("backup", true), ("vpn", true)]);

        let picked = select_gateway(&gateways, &status, "").unwrap();
        assert_eq!(picked.name, "backup");
    }

    #[test]
    fn test_all_unhealthy_degrades_to_default() {
        let gateways = gateways();
        let status = status_of(&[("main", false), ("backup", false), ("vpn", false)]);

        let picked = select_gateway(&gateways, &status, "backup").unwrap();
        assert_eq!(picked.name, "main");
    }

    #[test]
    fn test_unknown_preferred_ignored() {
        let gateways = gateways();
        let status = status_of(&[("main", true), ("backup", true), ("vpn", true)]);

        let picked = select_gateway(&gateways, &status, "missing").unwrap();
        assert_eq!(picked.name, "main");
    }

    #[test]
    fn test_no_gateways_yields_none() {
        assert!(select_gateway(&[], &HashMap::new(), "").is_none());
    }

    #[tokio::test]
    async fn test_initial_status_is_healthy() {
        let mut config = Config::default();
        config.gateways = gateways();

        let checker = HealthChecker::new(&config).unwrap();
        assert!(checker.is_healthy("main").await);
        assert!(checker.is_healthy("vpn").await);
        assert!(!checker.is_healthy("missing").await);
        assert_eq!(checker.status().await.len(), 3);
    }

    #[tokio::test]
    async fn test_pick_follows_status_updates() {
        let mut config = Config::default();
        config.gateways = gateways();
        let checker = HealthChecker::new(&config).unwrap();

        assert_eq!(checker.pick("backup").await.unwrap().name, "backup");

        {
            let mut status = checker.status.write().await;
            status.insert("backup".to_string(), false);
        }
        assert_eq!(checker.pick("backup").await.unwrap().name, "main");
    }
}
