use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cluster session init failed: {0}")]
    Init(String),

    #[error("Invalid image reference: {0:?}")]
    InvalidImage(String),

    #[error("{0} has no selector")]
    NoSelector(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

/// Seconds slept between verification loop iterations
pub const RETRY_INTERVAL_SECONDS: u64 = 10;
/// Global verification timeout (seconds) unless overridden
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
/// Container restart count at which a pod is flagged unstable
pub const DEFAULT_RESTART_THRESHOLD: i32 = 3;
/// Concurrent workload inspection tasks
pub const DEFAULT_POOL_WORKERS: usize = 40;

mod image;
pub use image::{parse_image_reference, ImageReference};
mod session;
pub use session::{RevisionInfo, Session, SessionOptions};
mod discover;
pub use discover::{Discovery, DiscoveryOptions, Kind, WorkloadSnapshot};
mod mapping;
pub use mapping::{invert_aliases, ComponentMap, ComponentMapEntry, ContainerType, PodInfo};
mod verify;
pub use verify::{Status, VersionResults};
mod audit;
pub use audit::{AuditResult, Auditor};
mod driver;
pub use driver::{Driver, VerifyOpts};
mod report;
pub use report::Report;
