#![deny(missing_docs)]
#![doc = "Tessera: sharded health-record tables over an in-process cluster."]

pub mod cluster;
pub mod config;
pub mod demo;
pub mod entity;
pub mod shell;

pub use cluster::Cluster;
pub use config::{ConfigError, TesseraConfig};

/// Returns `true` if the library is properly linked and the default
/// configuration yields a valid cluster.
///
/// # Examples
///
/// ```
/// assert!(tessera::health_check());
/// ```
pub fn health_check() -> bool {
    Cluster::from_config(&TesseraConfig::default()).is_ok()
}
