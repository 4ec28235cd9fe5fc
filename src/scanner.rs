//! Periodic sweep of the DHCP range to find active devices and IP conflicts.
//!
//! Each scan pings every address in the pool range with bounded concurrency,
//! resolves responding hosts through the OS ARP table and reverse DNS, tags
//! them with an OUI vendor guess, and cross-checks the results against the
//! lease table: an IP answered by a MAC other than its lease holder is
//! quarantined via [`AddressPool::mark_conflict`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ScannerConfig, normalize_mac};
use crate::pool::AddressPool;

const SCAN_LOG_CAPACITY: usize = 1000;
const SCAN_LOG_TAIL: usize = 100;

/// One discovered device, keyed by MAC in the result table.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub vendor: String,
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
    pub response_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub running: bool,
    pub progress_percent: u8,
    pub scanned: usize,
    pub total: usize,
    pub found: usize,
    pub conflicted: usize,
    pub current_ip: String,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub next_scan_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ScanState {
    running: bool,
    scanning: bool,
    progress_percent: u8,
    scanned: usize,
    total: usize,
    found: usize,
    conflicted: usize,
    current_ip: String,
    last_scan_at: Option<DateTime<Utc>>,
    next_scan_at: Option<DateTime<Utc>>,
    results: HashMap<String, ScanResult>,
}

pub struct NetworkScanner {
    config: ScannerConfig,
    start_ip: Ipv4Addr,
    end_ip: Ipv4Addr,
    pool: Arc<AddressPool>,
    state: RwLock<ScanState>,
    log: Mutex<Vec<String>>,
}

impl NetworkScanner {
    pub fn new(config: &Config, pool: Arc<AddressPool>) -> Self {
        Self {
            config: config.scanner.clone(),
            start_ip: config.network.start_ip,
            end_ip: config.network.end_ip,
            pool,
            state: RwLock::new(ScanState {
                running: config.scanner.enabled,
                ..ScanState::default()
            }),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Scan loop: one immediate sweep when enabled, then one per interval.
    /// `start`/`stop` flip the running flag; the loop itself lives until the
    /// token fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.state.read().await.running {
            let scanner = Arc::clone(&self);
            tokio::spawn(async move { scanner.perform_scan().await });
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.scan_interval.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("network scanner stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if self.state.read().await.running {
                        self.perform_scan().await;
                    }
                }
            }
        }
    }

    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if state.running {
                return;
            }
            state.running = true;
        }
        self.add_log("scanner started").await;
        let scanner = Arc::clone(self);
        tokio::spawn(async move { scanner.perform_scan().await });
    }

    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if !state.running {
            return;
        }
        state.running = false;
        drop(state);
        self.add_log("scanner stopped").await;
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn status(&self) -> ScanStatus {
        let state = self.state.read().await;
        ScanStatus {
            running: state.running,
            progress_percent: state.progress_percent,
            scanned: state.scanned,
            total: state.total,
            found: state.found,
            conflicted: state.conflicted,
            current_ip: state.current_ip.clone(),
            last_scan_at: state.last_scan_at,
            next_scan_at: state.next_scan_at,
        }
    }

    pub async fn results(&self) -> HashMap<String, ScanResult> {
        self.state.read().await.results.clone()
    }

    /// The most recent scan-log lines (bounded tail).
    pub async fn scan_log(&self) -> Vec<String> {
        let log = self.log.lock().await;
        let skip = log.len().saturating_sub(SCAN_LOG_TAIL);
        log[skip..].to_vec()
    }

    async fn add_log(&self, message: &str) {
        let mut log = self.log.lock().await;
        log.push(format!("[{}] {message}", Utc::now().format("%H:%M:%S")));
        let overflow = log.len().saturating_sub(SCAN_LOG_CAPACITY);
        if overflow > 0 {
            log.drain(..overflow);
        }
    }

    async fn perform_scan(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if !state.running || state.scanning {
                return;
            }
            state.scanning = true;
            state.scanned = 0;
            state.found = 0;
            state.progress_percent = 0;
            state.total = (u32::from(self.end_ip) - u32::from(self.start_ip) + 1) as usize;
        }

        let started = std::time::Instant::now();
        let total = self.state.read().await.total;
        self.add_log(&format!("scan started, {total} addresses")).await;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(total);

        for ip_num in u32::from(self.start_ip)..=u32::from(self.end_ip) {
            let ip = Ipv4Addr::from(ip_num);
            let scanner = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                let device = scanner.probe_ip(ip).await;

                let mut state = scanner.state.write().await;
                state.scanned += 1;
                state.progress_percent =
                    ((state.scanned * 100) / state.total.max(1)).min(100) as u8;
                state.current_ip = ip.to_string();
                if device.is_some() {
                    state.found += 1;
                }
                drop(state);

                device
            }));
        }

        let mut devices = HashMap::new();
        for handle in handles {
            if let Ok(Some(device)) = handle.await {
                self.add_log(&format!(
                    "found device: {} ({}) {}",
                    device.mac, device.ip, device.hostname
                ))
                .await;
                devices.insert(device.mac.clone(), device);
            }
        }

        let conflicts = if self.config.auto_conflict {
            self.check_conflicts(&devices).await
        } else {
            0
        };

        {
            let mut state = self.state.write().await;
            merge_results(&mut state.results, devices);
            cleanup_inactive(&mut state.results, self.config.inactive_timeout);

            state.conflicted = conflicts;
            state.progress_percent = 100;
            state.current_ip = String::new();
            state.last_scan_at = Some(Utc::now());
            state.next_scan_at =
                Some(Utc::now() + TimeDelta::seconds(self.config.scan_interval as i64));
            state.scanning = false;
        }

        let elapsed = started.elapsed();
        info!(?elapsed, conflicts, "network scan complete");
        self.add_log(&format!(
            "scan complete in {:.1}s, {} conflicts",
            elapsed.as_secs_f64(),
            conflicts
        ))
        .await;
    }

    async fn probe_ip(&self, ip: Ipv4Addr) -> Option<ScanResult> {
        let started = std::time::Instant::now();
        if !ping(ip, self.config.ping_timeout).await {
            return None;
        }
        let response_ms = started.elapsed().as_millis() as u64;

        let arp = tokio::fs::read_to_string("/proc/net/arp").await.ok()?;
        let mac = find_mac_in_arp(&arp, ip)?;
        let hostname = reverse_lookup(ip).await.unwrap_or_default();

        Some(ScanResult {
            vendor: vendor_for_mac(&mac).to_string(),
            mac,
            ip,
            hostname,
            is_active: true,
            last_seen: Utc::now(),
            response_ms,
        })
    }

    /// Marks every scanned IP whose lease belongs to a different MAC.
    async fn check_conflicts(&self, devices: &HashMap<String, ScanResult>) -> usize {
        let mut conflicts = 0;
        for (mac, device) in devices {
            if let Some(lease) = self.pool.get_lease(device.ip).await
                && lease.mac != *mac
            {
                warn!(
                    ip = %device.ip,
                    seen_mac = %mac,
                    leased_mac = %lease.mac,
                    "IP conflict detected"
                );
                self.pool.mark_conflict(device.ip).await;
                self.add_log(&format!(
                    "conflict: {} answered by {} but leased to {}",
                    device.ip, mac, lease.mac
                ))
                .await;
                conflicts += 1;
            }
        }
        conflicts
    }
}

async fn ping(ip: Ipv4Addr, timeout_ms: u64) -> bool {
    let timeout_secs = (timeout_ms / 1000).max(1);
    let result = tokio::time::timeout(
        Duration::from_millis(timeout_ms.max(1000) + 500),
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

/// Resolves a hostname for `ip` through the system resolver.
async fn reverse_lookup(ip: Ipv4Addr) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::process::Command::new("getent")
            .arg("hosts")
            .arg(ip.to_string())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_getent_hostname(&String::from_utf8_lossy(&output.stdout))
}

fn parse_getent_hostname(output: &str) -> Option<String> {
    let name = output.lines().next()?.split_whitespace().nth(1)?;
    Some(name.trim_end_matches('.').to_string())
}

/// Finds the hardware address the kernel ARP table holds for `ip`.
/// `/proc/net/arp` rows: IP address, HW type, Flags, HW address, Mask, Device.
fn find_mac_in_arp(content: &str, ip: Ipv4Addr) -> Option<String> {
    let ip = ip.to_string();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != ip {
            continue;
        }
        // Flags 0x0 means an incomplete entry.
        if fields[2] == "0x0" || fields[3] == "00:00:00:00:00:00" {
            return None;
        }
        return normalize_mac(fields[3]).ok();
    }
    None
}

fn vendor_for_mac(mac: &str) -> &'static str {
    const OUI_VENDORS: &[(&str, &str)] = &[
        ("00:50:56", "VMware"),
        ("00:0c:29", "VMware"),
        ("00:1a:11", "Google"),
        ("00:16:3e", "Xen"),
        ("52:54:00", "QEMU"),
    ];
    OUI_VENDORS
        .iter()
        .find(|(prefix, _)| mac.starts_with(prefix))
        .map(|(_, vendor)| *vendor)
        .unwrap_or("Unknown")
}

fn merge_results(results: &mut HashMap<String, ScanResult>, seen: HashMap<String, ScanResult>) {
    for device in results.values_mut() {
        if !seen.contains_key(&device.mac) {
            device.is_active = false;
        }
    }
    for (mac, device) in seen {
        match results.get_mut(&mac) {
            Some(existing) => {
                existing.ip = device.ip;
                existing.hostname = device.hostname;
                existing.last_seen = device.last_seen;
                existing.is_active = true;
                existing.response_ms = device.response_ms;
            }
            None => {
                results.insert(mac, device);
            }
        }
    }
    debug!(devices = results.len(), "scan results merged");
}

/// Drops records that have been inactive longer than `inactive_hours`.
fn cleanup_inactive(results: &mut HashMap<String, ScanResult>, inactive_hours: u64) {
    let cutoff = Utc::now() - TimeDelta::hours(inactive_hours as i64);
    results.retain(|_, device| device.is_active || device.last_seen >= cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> Arc<AddressPool> {
        let mut config = Config::default();
        config.network.start_ip = Ipv4Addr::new(192, 168, 1, 100);
        config.network.end_ip = Ipv4Addr::new(192, 168, 1, 110);
        Arc::new(AddressPool::new(&config).unwrap())
    }

    fn device(mac: &str, ip: Ipv4Addr) -> ScanResult {
        ScanResult {
            mac: mac.to_string(),
            ip,
            hostname: String::new(),
            vendor: vendor_for_mac(mac).to_string(),
            is_active: true,
            last_seen: Utc::now(),
            response_ms: 3,
        }
    }

    #[test]
    fn test_vendor_lookup() {
        assert_eq!(vendor_for_mac("00:50:56:aa:bb:cc"), "VMware");
        assert_eq!(vendor_for_mac("52:54:00:12:34:56"), "QEMU");
        assert_eq!(vendor_for_mac("aa:bb:cc:dd:ee:ff"), "Unknown");
    }

    #[test]
    fn test_arp_parsing() {
        let arp = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.50     0x1         0x2         AA:BB:CC:DD:EE:01     *        eth0
192.168.1.51     0x1         0x0         00:00:00:00:00:00     *        eth0
";
        assert_eq!(
            find_mac_in_arp(arp, Ipv4Addr::new(192, 168, 1, 50)),
            Some("aa:bb:cc:dd:ee:01".to_string())
        );
        assert_eq!(find_mac_in_arp(arp, Ipv4Addr::new(192, 168, 1, 51)), None);
        assert_eq!(find_mac_in_arp(arp, Ipv4Addr::new(192, 168, 1, 52)), None);
    }

    #[test]
    fn test_getent_parsing() {
        assert_eq!(
            parse_getent_hostname("192.168.1.50      printer.lan.local\n"),
            Some("printer.lan.local".to_string())
        );
        assert_eq!(
            parse_getent_hostname("192.168.1.50      host.\n"),
            Some("host".to_string())
        );
        assert_eq!(parse_getent_hostname(""), None);
    }

    #[test]
    fn test_merge_marks_absent_inactive() {
        let mut results = HashMap::new();
        let first = HashMap::from([
            ("aa:bb:cc:dd:ee:01".to_string(), device("aa:bb:cc:dd:ee:01", Ipv4Addr::new(192, 168, 1, 101))),
            ("aa:bb:cc:dd:ee:02".to_string(), device("aa:bb:cc:dd:ee:02", Ipv4Addr::new(192, 168, 1, 102))),
        ]);
        merge_results(&mut results, first);
        assert_eq!(results.len(), 2);

        let second = HashMap::from([(
            "aa:bb:cc:dd:ee:01".to_string(),
            device("aa:bb:cc:dd:ee:01", Ipv4Addr::new(192, 168, 1, 103)),
        )]);
        merge_results(&mut results, second);

        let moved = &results["aa:bb:cc:dd:ee:01"];
        assert!(moved.is_active);
        assert_eq!(moved.ip, Ipv4Addr::new(192, 168, 1, 103));
        assert!(!results["aa:bb:cc:dd:ee:02"].is_active);
    }

    #[test]
    fn test_cleanup_inactive_drops_stale_records() {
        let mut results = HashMap::new();
        let mut stale = device("aa:bb:cc:dd:ee:01", Ipv4Addr::new(192, 168, 1, 101));
        stale.is_active = false;
        stale.last_seen = Utc::now() - TimeDelta::hours(30);
        results.insert(stale.mac.clone(), stale);

        let mut fresh = device("aa:bb:cc:dd:ee:02", Ipv4Addr::new(192, 168, 1, 102));
        fresh.is_active = false;
        results.insert(fresh.mac.clone(), fresh);

        cleanup_inactive(&mut results, 24);
        assert!(!results.contains_key("aa:bb:cc:dd:ee:01"));
        assert!(results.contains_key("aa:bb:cc:dd:ee:02"));
    }

    #[tokio::test]
    async fn test_conflict_cross_check() {
        let pool = test_pool();
        let lease = pool
            .request_ip("aa:bb:cc:dd:ee:01", None, "")
            .await
            .unwrap();

        let mut config = Config::default();
        config.network.start_ip = Ipv4Addr::new(192, 168, 1, 100);
        config.network.end_ip = Ipv4Addr::new(192, 168, 1, 110);
        let scanner = Arc::new(NetworkScanner::new(&config, Arc::clone(&pool)));

        // A different MAC answered on the leased IP.
        let devices = HashMap::from([(
            "aa:bb:cc:dd:ee:99".to_string(),
            device("aa:bb:cc:dd:ee:99", lease.ip),
        )]);
        let conflicts = scanner.check_conflicts(&devices).await;

        assert_eq!(conflicts, 1);
        assert!(pool.is_conflict(lease.ip).await);
    }

    #[tokio::test]
    async fn test_matching_lease_is_not_a_conflict() {
        let pool = test_pool();
        let lease = pool
            .request_ip("aa:bb:cc:dd:ee:01", None, "")
            .await
            .unwrap();

        let mut config = Config::default();
        config.network.start_ip = Ipv4Addr::new(192, 168, 1, 100);
        config.network.end_ip = Ipv4Addr::new(192, 168, 1, 110);
        let scanner = Arc::new(NetworkScanner::new(&config, Arc::clone(&pool)));

        let devices = HashMap::from([(
            lease.mac.clone(),
            device(&lease.mac, lease.ip),
        )]);
        assert_eq!(scanner.check_conflicts(&devices).await, 0);
        assert!(!pool.is_conflict(lease.ip).await);
    }

    #[tokio::test]
    async fn test_start_stop_controls() {
        let mut config = Config::default();
        config.network.start_ip = Ipv4Addr::new(192, 168, 1, 100);
        config.network.end_ip = Ipv4Addr::new(192, 168, 1, 100);
        let scanner = Arc::new(NetworkScanner::new(&config, test_pool()));

        assert!(!scanner.is_running().await);
        scanner.start().await;
        assert!(scanner.is_running().await);
        scanner.stop().await;
        assert!(!scanner.is_running().await);

        let log = scanner.scan_log().await;
        assert!(log.iter().any(|line| line.contains("scanner started")));
        assert!(log.iter().any(|line| line.contains("scanner stopped")));
    }

    #[tokio::test]
    async fn test_status_snapshot_defaults() {
        let mut config = Config::default();
        config.scanner.enabled = true;
        let scanner = Arc::new(NetworkScanner::new(&config, test_pool()));

        let status = scanner.status().await;
        assert!(status.running);
        assert_eq!(status.progress_percent, 0);
        assert_eq!(status.found, 0);
        assert!(status.last_scan_at.is_none());
    }
}
