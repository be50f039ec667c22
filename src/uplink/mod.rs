//! Uplink — durable batched delivery of location samples
//!
//! Fixes become samples, samples are persisted before anything touches the
//! network, and a single background worker ships them to the ingestion
//! endpoint.
//!
//! ## Architecture
//!
//! - **SampleQueue**: sled-backed FIFO with per-vehicle sequence numbers and bounded capacity
//! - **RetryPolicy**: exponential backoff with jitter
//! - **IngestClient**: one batch per POST, all-or-nothing
//! - **TokenProvider**: bearer tokens for the endpoint
//! - **DeliveryWorker**: take batch, send, ack / requeue / kill
//! - **UplinkController**: start/stop lifecycle and the submit entry point
//!
//! ## Guarantees
//!
//! - At-least-once: a sample leaves the queue only after a 2xx for its batch
//! - Bounded: at capacity the oldest pending sample is evicted and counted
//! - No silent loss: every eviction and abandoned sample is in `lost_total`
//! - Crash safe: in-flight batches return to pending on restart

pub mod auth;
pub mod client;
pub mod controller;
pub mod motion;
pub mod queue;
pub mod retry;
pub mod types;
pub mod worker;

pub use auth::{FileTokenStore, StaticToken, TokenProvider};
pub use client::{DeliveryError, Disposition, HttpIngestClient, IngestClient};
pub use controller::{ControllerSettings, UplinkController, UplinkError, UplinkState, UplinkStatus};
pub use motion::MotionTracker;
pub use queue::{QueueError, SampleQueue};
pub use retry::RetryPolicy;
pub use types::{EntryId, EntryState, FixReading, QueueEntry, QueueStats, Sample, SampleRecord};
pub use worker::{BatchOutcome, DeliveryWorker, WorkerStats};
