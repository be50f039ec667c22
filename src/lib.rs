//! Vehicle Uplink: durable telemetry delivery for vehicle trackers
//!
//! Location fixes are buffered in an on-disk queue and delivered in batches
//! to a remote ingestion endpoint with retry, backoff and accounted loss.
//!
//! ## Modules
//!
//! - **uplink**: sample queue, delivery worker, retry policy, controller
//! - **acquisition**: fix sources (stdin / recorded JSON-lines tracks)
//! - **config**: TOML configuration with validation

pub mod acquisition;
pub mod config;
pub mod uplink;

pub use config::UplinkConfig;
pub use uplink::{
    ControllerSettings, FixReading, HttpIngestClient, IngestClient, Sample, SampleQueue,
    UplinkController, UplinkError, UplinkStatus,
};
