pub mod config;
pub mod db;
pub mod manager;
pub mod models;
pub mod scanner;

pub use manager::{ScanManager, StartedScan};
pub use scanner::{NmapProbe, Probe};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
