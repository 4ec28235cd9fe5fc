//! The authoritative lease table.
//!
//! Maps IPs to leases and MACs to IPs, and tracks a set of conflicted
//! addresses that are temporarily unallocatable. Static reservations from the
//! configuration are materialized here at construction and can never be
//! released or expired.
//!
//! # Thread Safety
//!
//! A single [`RwLock`] protects the whole mutable state (leases, MAC index,
//! conflict set). Mutating operations take the exclusive lock; queries take
//! the shared lock. Within one MAC all DHCP handling is therefore serialized.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, normalize_mac};
use crate::error::{Error, Result};

/// How long a conflicted IP stays unallocatable (1 hour).
const CONFLICT_TTL_SECONDS: i64 = 3600;

/// Lease time advertised for static reservations (1 year).
pub const STATIC_LEASE_SECONDS: i64 = 365 * 24 * 3600;

/// Cadence of the background expiry sweeper.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// An IP-to-MAC binding with a validity window.
#[derive(Debug, Clone)]
pub struct Lease {
    pub ip: Ipv4Addr,
    /// Canonical lower-case colon-separated MAC.
    pub mac: String,
    pub hostname: String,
    pub start_time: DateTime<Utc>,
    pub lease_duration: TimeDelta,
    pub is_static: bool,
    /// Logical gateway the lease is bound to; empty for dynamic leases.
    pub gateway_name: String,
    /// Router IP actually answered on the most recent response.
    pub gateway_ip: Option<Ipv4Addr>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        if self.is_static {
            return false;
        }
        Utc::now() > self.start_time + self.lease_duration
    }

    /// Remaining validity; static leases report one year.
    pub fn remaining(&self) -> TimeDelta {
        if self.is_static {
            return TimeDelta::seconds(STATIC_LEASE_SECONDS);
        }
        (self.start_time + self.lease_duration - Utc::now()).max(TimeDelta::zero())
    }

    /// Lease time to advertise in responses, in seconds.
    pub fn advertised_seconds(&self) -> u32 {
        if self.is_static {
            STATIC_LEASE_SECONDS as u32
        } else {
            self.lease_duration.num_seconds().max(0) as u32
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    leases: HashMap<Ipv4Addr, Lease>,
    mac_to_ip: HashMap<String, Ipv4Addr>,
    conflicts: HashMap<Ipv4Addr, DateTime<Utc>>,
}

impl PoolState {
    /// An IP can be handed out iff it is not conflicted and not held by a
    /// static or unexpired dynamic lease. Callers hold the pool lock.
    fn is_available(&self, ip: Ipv4Addr) -> bool {
        if self.conflicts.contains_key(&ip) {
            return false;
        }
        match self.leases.get(&ip) {
            None => true,
            Some(lease) => !lease.is_static && lease.is_expired(),
        }
    }

    fn drop_lease(&mut self, ip: Ipv4Addr) {
        if let Some(lease) = self.leases.remove(&ip) {
            self.mac_to_ip.remove(&lease.mac);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_ips: u32,
    pub static_leases: usize,
    pub dynamic_leases: usize,
    pub expired_leases: usize,
    pub available_ips: u32,
    pub utilization: f64,
}

#[derive(Debug)]
pub struct AddressPool {
    start_ip: Ipv4Addr,
    end_ip: Ipv4Addr,
    lease_duration: TimeDelta,
    state: RwLock<PoolState>,
}

impl AddressPool {
    /// Builds the pool and materializes every configured reservation as a
    /// static lease, failing fast on bad syntax or duplicate MAC/IP.
    pub fn new(config: &Config) -> Result<Self> {
        let start_ip = config.network.start_ip;
        let end_ip = config.network.end_ip;
        if u32::from(start_ip) > u32::from(end_ip) {
            return Err(Error::InvalidConfig(format!(
                "pool range {start_ip} - {end_ip} is inverted"
            )));
        }

        let mut state = PoolState::default();
        for binding in &config.bindings {
            let mac = normalize_mac(&binding.mac)?;
            if state.leases.contains_key(&binding.ip) {
                return Err(Error::Duplicate(format!(
                    "reservation IP {}",
                    binding.ip
                )));
            }
            if state.mac_to_ip.contains_key(&mac) {
                return Err(Error::Duplicate(format!("reservation MAC {mac}")));
            }

            let lease = Lease {
                ip: binding.ip,
                mac: mac.clone(),
                hostname: binding.hostname.clone(),
                start_time: Utc::now(),
                lease_duration: TimeDelta::zero(),
                is_static: true,
                gateway_name: binding.gateway.clone(),
                gateway_ip: None,
            };
            state.mac_to_ip.insert(mac.clone(), binding.ip);
            state.leases.insert(binding.ip, lease);

            debug!(
                alias = %binding.alias,
                mac = %mac,
                ip = %binding.ip,
                "materialized static reservation"
            );
        }

        info!("address pool initialized, range {start_ip} - {end_ip}");

        Ok(Self {
            start_ip,
            end_ip,
            lease_duration: TimeDelta::from_std(config.lease_duration())
                .unwrap_or_else(|_| TimeDelta::seconds(86400)),
            state: RwLock::new(state),
        })
    }

    pub fn start_ip(&self) -> Ipv4Addr {
        self.start_ip
    }

    pub fn end_ip(&self) -> Ipv4Addr {
        self.end_ip
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let target = u32::from(ip);
        target >= u32::from(self.start_ip) && target <= u32::from(self.end_ip)
    }

    pub fn range_size(&self) -> u32 {
        u32::from(self.end_ip) - u32::from(self.start_ip) + 1
    }

    /// The allocation algorithm.
    ///
    /// 1. A static lease for this MAC wins unconditionally.
    /// 2. An unexpired dynamic lease renews in place, unless its IP has been
    ///    marked conflicted, in which case it is dropped and reallocated.
    /// 3. An expired dynamic lease is dropped.
    /// 4. A requested IP inside the range is honored when available.
    /// 5. Otherwise the first available address in ascending order wins.
    pub async fn request_ip(
        &self,
        client_mac: &str,
        requested_ip: Option<Ipv4Addr>,
        hostname: &str,
    ) -> Result<Lease> {
        let mac = normalize_mac(client_mac)?;
        let mut state = self.state.write().await;

        if let Some(&existing_ip) = state.mac_to_ip.get(&mac) {
            let existing = state.leases.get(&existing_ip).cloned();
            if let Some(lease) = existing {
                if lease.is_static {
                    return Ok(lease);
                }
                if !lease.is_expired() {
                    if state.conflicts.contains_key(&existing_ip) {
                        info!(ip = %existing_ip, mac = %mac, "lease sits on conflicted IP, reallocating");
                        state.drop_lease(existing_ip);
                    } else {
                        let lease = state
                            .leases
                            .get_mut(&existing_ip)
                            .ok_or(Error::LeaseNotFound(mac.clone()))?;
                        lease.start_time = Utc::now();
                        lease.hostname = hostname.to_string();
                        debug!(ip = %existing_ip, mac = %mac, "renewed lease");
                        return Ok(lease.clone());
                    }
                } else {
                    state.drop_lease(existing_ip);
                }
            } else {
                state.mac_to_ip.remove(&mac);
            }
        }

        if let Some(requested) = requested_ip
            && !requested.is_unspecified()
            && self.in_range(requested)
            && state.is_available(requested)
        {
            return Ok(self.allocate(&mut state, requested, &mac, hostname));
        }

        let ip = self
            .find_available(&state)
            .ok_or(Error::PoolExhausted)?;
        Ok(self.allocate(&mut state, ip, &mac, hostname))
    }

    fn allocate(
        &self,
        state: &mut PoolState,
        ip: Ipv4Addr,
        mac: &str,
        hostname: &str,
    ) -> Lease {
        // The slot may hold an expired dynamic lease for another MAC.
        state.drop_lease(ip);

        let lease = Lease {
            ip,
            mac: mac.to_string(),
            hostname: hostname.to_string(),
            start_time: Utc::now(),
            lease_duration: self.lease_duration,
            is_static: false,
            gateway_name: String::new(),
            gateway_ip: None,
        };
        state.mac_to_ip.insert(mac.to_string(), ip);
        state.leases.insert(ip, lease.clone());
        info!(ip = %ip, mac = %mac, "allocated lease");
        lease
    }

    fn find_available(&self, state: &PoolState) -> Option<Ipv4Addr> {
        let start = u32::from(self.start_ip);
        let end = u32::from(self.end_ip);
        (start..=end)
            .map(Ipv4Addr::from)
            .find(|&ip| state.is_available(ip))
    }

    /// Refreshes the MAC's lease in place, keeping the pool's IP. Returns
    /// `None` when the MAC has no lease.
    pub async fn renew_by_mac(&self, client_mac: &str, hostname: &str) -> Option<Lease> {
        let mac = normalize_mac(client_mac).ok()?;
        let mut state = self.state.write().await;
        let ip = *state.mac_to_ip.get(&mac)?;
        let lease = state.leases.get_mut(&ip)?;
        if !lease.is_static {
            lease.start_time = Utc::now();
            if !hostname.is_empty() {
                lease.hostname = hostname.to_string();
            }
        }
        Some(lease.clone())
    }

    /// Removes the dynamic lease for this MAC. Static bindings are refused.
    pub async fn release_ip(&self, client_mac: &str) -> Result<()> {
        let mac = normalize_mac(client_mac)?;
        let mut state = self.state.write().await;

        let ip = *state
            .mac_to_ip
            .get(&mac)
            .ok_or_else(|| Error::LeaseNotFound(mac.clone()))?;
        let lease = state
            .leases
            .get(&ip)
            .ok_or_else(|| Error::LeaseNotFound(mac.clone()))?;

        if lease.is_static {
            return Err(Error::StaticLease(ip));
        }

        state.drop_lease(ip);
        info!(ip = %ip, mac = %mac, "released lease");
        Ok(())
    }

    /// Force-drops every dynamic lease held by this MAC, leaving static
    /// bindings untouched. Returns the number removed.
    pub async fn remove_all_leases_by_mac(&self, client_mac: &str) -> usize {
        let Ok(mac) = normalize_mac(client_mac) else {
            return 0;
        };
        let mut state = self.state.write().await;

        let ips: Vec<Ipv4Addr> = state
            .leases
            .values()
            .filter(|lease| lease.mac == mac && !lease.is_static)
            .map(|lease| lease.ip)
            .collect();

        for ip in &ips {
            state.drop_lease(*ip);
        }
        if !ips.is_empty() {
            info!(mac = %mac, count = ips.len(), "dropped dynamic leases");
        }
        ips.len()
    }

    /// Records the router that actually answered for this MAC's lease.
    pub async fn bind_gateway(&self, client_mac: &str, gateway_ip: Ipv4Addr) {
        let Ok(mac) = normalize_mac(client_mac) else {
            return;
        };
        let mut state = self.state.write().await;
        if let Some(&ip) = state.mac_to_ip.get(&mac)
            && let Some(lease) = state.leases.get_mut(&ip)
        {
            lease.gateway_ip = Some(gateway_ip);
        }
    }

    pub async fn mark_conflict(&self, ip: Ipv4Addr) {
        let mut state = self.state.write().await;
        state.conflicts.insert(ip, Utc::now());
        info!(ip = %ip, "marked IP as conflicted");
    }

    pub async fn is_conflict(&self, ip: Ipv4Addr) -> bool {
        self.state.read().await.conflicts.contains_key(&ip)
    }

    pub async fn conflict_ips(&self) -> HashMap<Ipv4Addr, DateTime<Utc>> {
        self.state.read().await.conflicts.clone()
    }

    pub async fn get_lease(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.state.read().await.leases.get(&ip).cloned()
    }

    pub async fn get_lease_by_mac(&self, client_mac: &str) -> Option<Lease> {
        let mac = normalize_mac(client_mac).ok()?;
        let state = self.state.read().await;
        let ip = state.mac_to_ip.get(&mac)?;
        state.leases.get(ip).cloned()
    }

    pub async fn all_leases(&self) -> Vec<Lease> {
        self.state.read().await.leases.values().cloned().collect()
    }

    pub async fn active_leases(&self) -> Vec<Lease> {
        self.state
            .read()
            .await
            .leases
            .values()
            .filter(|lease| !lease.is_expired())
            .cloned()
            .collect()
    }

    /// Every allocatable address in the range. Sweeps expired state first;
    /// the two steps do not form one atomic snapshot.
    pub async fn available_ips(&self) -> Vec<Ipv4Addr> {
        self.cleanup().await;
        let state = self.state.read().await;
        let start = u32::from(self.start_ip);
        let end = u32::from(self.end_ip);
        (start..=end)
            .map(Ipv4Addr::from)
            .filter(|&ip| state.is_available(ip))
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.read().await;
        let total = self.range_size();

        let mut static_count = 0;
        let mut dynamic_count = 0;
        let mut expired_count = 0;
        for lease in state.leases.values() {
            if lease.is_static {
                static_count += 1;
            } else if lease.is_expired() {
                expired_count += 1;
            } else {
                dynamic_count += 1;
            }
        }

        let occupied = (static_count + dynamic_count) as u32;
        PoolStats {
            total_ips: total,
            static_leases: static_count,
            dynamic_leases: dynamic_count,
            expired_leases: expired_count,
            available_ips: total.saturating_sub(occupied),
            utilization: f64::from(occupied) / f64::from(total) * 100.0,
        }
    }

    /// Drops expired dynamic leases and conflict entries older than the TTL.
    /// Returns the number of leases dropped.
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.write().await;

        let expired: Vec<Ipv4Addr> = state
            .leases
            .values()
            .filter(|lease| !lease.is_static && lease.is_expired())
            .map(|lease| lease.ip)
            .collect();
        for ip in &expired {
            state.drop_lease(*ip);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "dropped expired leases");
        }

        let cutoff = Utc::now() - TimeDelta::seconds(CONFLICT_TTL_SECONDS);
        let stale = state
            .conflicts
            .iter()
            .filter(|(_, marked)| **marked < cutoff)
            .map(|(ip, _)| *ip)
            .collect::<Vec<_>>();
        for ip in &stale {
            state.conflicts.remove(ip);
            debug!(ip = %ip, "conflict entry expired");
        }

        expired.len()
    }

    /// Spawns the hourly expiry sweeper, stopped by `cancel`.
    pub fn start_cleanup_task(self: &Arc<Self>, cancel: CancellationToken) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.cleanup().await;
                    }
                }
            }
        });
    }
}
