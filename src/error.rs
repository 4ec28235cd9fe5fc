use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("No available IP addresses in pool")]
    PoolExhausted,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    #[error("No lease found for MAC address {0}")]
    LeaseNotFound(String),

    #[error("Cannot release static binding for {0}")]
    StaticLease(Ipv4Addr),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Configuration reload already in progress")]
    ReloadBusy,
}

pub type Result<T> = std::result::Result<T, Error>;
