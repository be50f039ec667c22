//! Motion derivation from consecutive fixes
//!
//! A vehicle counts as moving when it has travelled more than the configured
//! threshold since the previous fix. The first fix of a stream is stationary.

use super::types::{FixReading, Sample};

/// Mean Earth radius (m)
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates, in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Remembers the last fix of a stream to derive the moving flag
#[derive(Debug, Clone)]
pub struct MotionTracker {
    threshold_m: f64,
    last: Option<(f64, f64)>,
}

impl MotionTracker {
    pub fn new(threshold_m: f64) -> Self {
        Self {
            threshold_m,
            last: None,
        }
    }

    /// Record a fix and report whether the vehicle moved since the previous one.
    pub fn observe(&mut self, fix: &FixReading) -> bool {
        let moving = self.last.is_some_and(|(lat, lon)| {
            haversine_distance(lat, lon, fix.latitude, fix.longitude) > self.threshold_m
        });
        self.last = Some((fix.latitude, fix.longitude));
        moving
    }

    /// Turn a fix into a sample for `vehicle_id`, updating the motion state.
    pub fn sample_for(&mut self, vehicle_id: i64, fix: &FixReading) -> Sample {
        let moving = self.observe(fix);
        Sample::from_fix(vehicle_id, fix, moving)
    }

    /// Forget the previous fix (new tracking session).
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix_at(latitude: f64, longitude: f64) -> FixReading {
        FixReading {
            latitude,
            longitude,
            speed_mps: 0.0,
            bearing: 0.0,
            accuracy_m: 5.0,
            altitude_m: 0.0,
            captured_at_ms: None,
            monotonic_ms: None,
        }
    }

    #[test]
    fn test_haversine_one_degree_longitude_at_equator() {
        let dist = haversine_distance(0.0, 0.0, 0.0, 1.0);
        assert!((dist - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn test_first_fix_is_stationary() {
        let mut tracker = MotionTracker::new(2.0);
        assert!(!tracker.observe(&fix_at(10.0, 10.0)));
    }

    #[test]
    fn test_threshold() {
        let mut tracker = MotionTracker::new(2.0);
        tracker.observe(&fix_at(0.0, 0.0));
        // ~1.1 m north
        assert!(!tracker.observe(&fix_at(0.00001, 0.0)));
        // ~3.3 m further north
        assert!(tracker.observe(&fix_at(0.00004, 0.0)));
    }

    #[test]
    fn test_reset_forgets_previous_fix() {
        let mut tracker = MotionTracker::new(2.0);
        tracker.observe(&fix_at(0.0, 0.0));
        tracker.reset();
        assert!(!tracker.observe(&fix_at(1.0, 1.0)));
    }

    #[test]
    fn test_sample_for_sets_vehicle_and_motion() {
        let mut tracker = MotionTracker::new(2.0);
        tracker.sample_for(3, &fix_at(0.0, 0.0));
        let sample = tracker.sample_for(3, &fix_at(0.001, 0.0));
        assert_eq!(sample.vehicle_id, 3);
        assert!(sample.is_moving);
    }
}
