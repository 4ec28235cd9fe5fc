pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod logstream;
pub mod options;
pub mod packet;
pub mod pool;
pub mod scanner;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::HealthChecker;
pub use lifecycle::Lifecycle;
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use pool::{AddressPool, Lease};
pub use scanner::NetworkScanner;
pub use server::DhcpEngine;
