//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery. Every field of `UplinkConfig`
//! defaults to one of these.

// ============================================================================
// Ingestion Endpoint
// ============================================================================

/// Batch ingestion endpoint of the tracking backend.
pub const INGEST_URL: &str = "http://192.168.1.100:3000/api/location/batch";

/// Timeout for a single batch send (ms). A timed-out send counts as a failure.
pub const SEND_TIMEOUT_MS: u64 = 15_000;

// ============================================================================
// Sample Queue
// ============================================================================

/// Directory of the sled database backing the sample queue.
pub const QUEUE_PATH: &str = "./data/uplink_queue.db";

/// Maximum number of entries held in the queue before the oldest are evicted.
///
/// 10 000 samples at one fix per 10 s is a little over a day offline.
pub const QUEUE_CAPACITY: usize = 10_000;

/// Maximum number of samples per network send.
pub const BATCH_SIZE: usize = 50;

/// Flush sled after every queue mutation.
pub const SYNC_WRITES: bool = true;

// ============================================================================
// Retry
// ============================================================================

/// First retry delay (ms).
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound on any retry delay (ms). 300 000 = 5 minutes.
pub const RETRY_MAX_DELAY_MS: u64 = 300_000;

/// Jitter applied to each retry delay, as a fraction of the delay.
pub const RETRY_JITTER_FRACTION: f64 = 0.2;

/// Failed attempts before a sample is declared dead.
pub const RETRY_MAX_ATTEMPTS: u32 = 8;

// ============================================================================
// Lifecycle
// ============================================================================

/// How long `stop()` waits for the worker to finish its current batch (ms).
pub const SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Motion
// ============================================================================

/// Displacement (m) above which a vehicle is considered moving.
pub const MOVING_THRESHOLD_M: f64 = 2.0;

// ============================================================================
// Auth
// ============================================================================

/// File holding the bearer token for the ingestion endpoint.
pub const TOKEN_PATH: &str = "./data/uplink_token";
