//! Uplink data types: fixes, samples, queue entries and the wire record

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// Conversion factor from m/s (platform fix speed) to km/h (wire speed)
pub const MPS_TO_KMH: f64 = 3.6;

/// Identifier of a queue entry. Increases monotonically, so key order is FIFO order.
pub type EntryId = u64;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on the process-monotonic clock.
pub fn monotonic_ms() -> u64 {
    let start = PROCESS_START.get_or_init(Instant::now);
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Current wall-clock time as unix epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A raw location fix as produced by the platform fix source
///
/// Field names follow the JSON emitted by the fix replay tooling
/// (`{"latitude": .., "longitude": .., "speed_mps": ..}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixReading {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in m/s
    #[serde(default)]
    pub speed_mps: f64,
    /// Bearing in degrees
    #[serde(default)]
    pub bearing: f64,
    /// Horizontal accuracy in meters
    #[serde(default)]
    pub accuracy_m: f64,
    /// Altitude in meters
    #[serde(default)]
    pub altitude_m: f64,
    /// Capture time (unix epoch ms). Defaults to the time the fix is received.
    #[serde(default)]
    pub captured_at_ms: Option<i64>,
    /// Capture time on the monotonic clock (ms). Defaults to the process clock.
    #[serde(default)]
    pub monotonic_ms: Option<u64>,
}

/// One location observation for a vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub vehicle_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub bearing: f64,
    pub accuracy_m: f64,
    pub altitude_m: f64,
    /// True when displacement since the previous fix exceeds the motion threshold
    pub is_moving: bool,
    /// Capture time on the monotonic clock (ms)
    pub captured_monotonic_ms: u64,
    /// Capture time (unix epoch ms)
    pub captured_at_ms: i64,
    /// Per-vehicle sequence number; assigned by the queue at enqueue time
    #[serde(default)]
    pub sequence_number: u64,
}

impl Sample {
    /// Build a sample from a raw fix. The sequence number stays 0 until enqueued.
    pub fn from_fix(vehicle_id: i64, fix: &FixReading, is_moving: bool) -> Self {
        Self {
            vehicle_id,
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_kmh: fix.speed_mps * MPS_TO_KMH,
            bearing: fix.bearing,
            accuracy_m: fix.accuracy_m,
            altitude_m: fix.altitude_m,
            is_moving,
            captured_monotonic_ms: fix.monotonic_ms.unwrap_or_else(monotonic_ms),
            captured_at_ms: fix.captured_at_ms.unwrap_or_else(now_epoch_ms),
            sequence_number: 0,
        }
    }
}

/// Delivery state of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Waiting for delivery (possibly not yet eligible for retry)
    Pending,
    /// Reserved by a batch that is being sent
    InFlight,
    /// Accepted by the endpoint
    Delivered,
    /// Abandoned after a permanent rejection or too many attempts
    Dead,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Pending => write!(f, "PENDING"),
            EntryState::InFlight => write!(f, "IN_FLIGHT"),
            EntryState::Delivered => write!(f, "DELIVERED"),
            EntryState::Dead => write!(f, "DEAD"),
        }
    }
}

/// A sample plus its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub sample: Sample,
    /// Number of failed delivery attempts so far
    pub attempts: u32,
    /// Earliest time (unix epoch ms) the entry may be sent again
    pub next_retry_at_ms: i64,
    pub state: EntryState,
    /// When the entry was appended (unix epoch ms)
    pub enqueued_at_ms: i64,
}

/// Ingestion endpoint payload element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRecord {
    pub vehicle_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub bearing: f64,
    pub accuracy_meters: f64,
    pub altitude_meters: f64,
    pub is_moving: bool,
    pub sequence_number: u64,
    pub captured_at_epoch_ms: i64,
}

impl From<&Sample> for SampleRecord {
    fn from(sample: &Sample) -> Self {
        Self {
            vehicle_id: sample.vehicle_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
            speed_kmh: sample.speed_kmh,
            bearing: sample.bearing,
            accuracy_meters: sample.accuracy_m,
            altitude_meters: sample.altitude_m,
            is_moving: sample.is_moving,
            sequence_number: sample.sequence_number,
            captured_at_epoch_ms: sample.captured_at_ms,
        }
    }
}

/// Snapshot of queue occupancy and lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub delivered_total: u64,
    pub dead_total: u64,
    pub evicted_total: u64,
    /// Samples lost for any reason (dead + evicted)
    pub lost_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix() -> FixReading {
        FixReading {
            latitude: 52.52,
            longitude: 13.405,
            speed_mps: 10.0,
            bearing: 90.0,
            accuracy_m: 4.5,
            altitude_m: 34.0,
            captured_at_ms: Some(1_700_000_000_000),
            monotonic_ms: Some(42),
        }
    }

    #[test]
    fn test_sample_from_fix_converts_speed() {
        let sample = Sample::from_fix(7, &fix(), true);
        assert!((sample.speed_kmh - 36.0).abs() < 1e-9);
        assert_eq!(sample.vehicle_id, 7);
        assert_eq!(sample.captured_at_ms, 1_700_000_000_000);
        assert_eq!(sample.captured_monotonic_ms, 42);
        assert_eq!(sample.sequence_number, 0);
    }

    #[test]
    fn test_record_uses_camel_case_keys() {
        let mut sample = Sample::from_fix(7, &fix(), false);
        sample.sequence_number = 3;
        let json = serde_json::to_value(SampleRecord::from(&sample)).unwrap();

        for key in [
            "vehicleId",
            "latitude",
            "longitude",
            "speedKmh",
            "bearing",
            "accuracyMeters",
            "altitudeMeters",
            "isMoving",
            "sequenceNumber",
            "capturedAtEpochMs",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["sequenceNumber"], 3);
        assert_eq!(json["isMoving"], false);
    }

    #[test]
    fn test_fix_reading_defaults() {
        let fix: FixReading =
            serde_json::from_str(r#"{"latitude": 1.0, "longitude": 2.0}"#).unwrap();
        assert_eq!(fix.speed_mps, 0.0);
        assert!(fix.captured_at_ms.is_none());
    }
}
