//! Uplink Controller — lifecycle of the delivery pipeline
//!
//! `Stopped → Running{vehicle_id} → Stopped`. While running, exactly one
//! [`DeliveryWorker`] task drains the queue. Stopping never discards queued
//! samples; they are delivered on the next start.
//!
//! Only one uplink stream may run per process. The running worker task holds
//! a process-wide claim; a second controller's `start` fails with
//! [`UplinkError::AlreadyRunning`] until that worker has exited.

use super::client::IngestClient;
use super::motion::MotionTracker;
use super::queue::{QueueError, SampleQueue};
use super::retry::RetryPolicy;
use super::types::{FixReading, QueueEntry, QueueStats, Sample};
use super::worker::{DeliveryWorker, WorkerStats};
use crate::config::UplinkConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    #[error("uplink is not running")]
    NotRunning,
    #[error("uplink is already running for vehicle {running}")]
    AlreadyRunning { running: i64 },
    #[error("sample for vehicle {submitted} rejected: uplink is running for vehicle {running}")]
    VehicleMismatch { running: i64, submitted: i64 },
    #[error("invalid vehicle id {0}")]
    InvalidVehicle(i64),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkState {
    Stopped,
    Running,
}

/// Snapshot returned by [`UplinkController::status`]
#[derive(Debug, Clone, Serialize)]
pub struct UplinkStatus {
    pub state: UplinkState,
    pub vehicle_id: Option<i64>,
    pub queue: QueueStats,
}

/// Timing and sizing knobs for the worker
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub batch_size: usize,
    pub send_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub moving_threshold_m: f64,
    pub retry: RetryPolicy,
}

impl ControllerSettings {
    pub fn from_config(config: &UplinkConfig) -> Self {
        Self {
            batch_size: config.queue.batch_size,
            send_timeout: config.endpoint.timeout(),
            shutdown_timeout: config.lifecycle.shutdown_timeout(),
            moving_threshold_m: config.motion.moving_threshold_m,
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&UplinkConfig::default())
    }
}

/// Owner of the process-wide stream slot
#[derive(Debug, Clone, Copy)]
struct StreamOwner {
    controller: u64,
    claim: u64,
    vehicle_id: i64,
}

static ACTIVE_STREAM: Mutex<Option<StreamOwner>> = Mutex::new(None);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn stream_slot() -> MutexGuard<'static, Option<StreamOwner>> {
    ACTIVE_STREAM.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held by a running worker task. Frees the stream slot when dropped.
struct StreamClaim {
    claim: u64,
}

impl StreamClaim {
    fn acquire(controller: u64, vehicle_id: i64) -> Result<Self, UplinkError> {
        let mut slot = stream_slot();
        if let Some(owner) = *slot {
            if owner.controller != controller {
                return Err(UplinkError::AlreadyRunning {
                    running: owner.vehicle_id,
                });
            }
        }

        let claim = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        *slot = Some(StreamOwner {
            controller,
            claim,
            vehicle_id,
        });
        Ok(Self { claim })
    }
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        let mut slot = stream_slot();
        if slot.is_some_and(|owner| owner.claim == self.claim) {
            *slot = None;
            debug!("Uplink stream released");
        }
    }
}

struct ActiveUplink {
    vehicle_id: i64,
    cancel: CancellationToken,
    handle: JoinHandle<Result<WorkerStats, QueueError>>,
}

struct ControllerState {
    active: Option<ActiveUplink>,
    motion: MotionTracker,
}

/// Owns the queue handle and the running worker
pub struct UplinkController {
    id: u64,
    queue: Arc<SampleQueue>,
    client: Arc<dyn IngestClient>,
    settings: ControllerSettings,
    state: Mutex<ControllerState>,
}

impl UplinkController {
    pub fn new(
        queue: Arc<SampleQueue>,
        client: Arc<dyn IngestClient>,
        settings: ControllerSettings,
    ) -> Self {
        let motion = MotionTracker::new(settings.moving_threshold_m);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            queue,
            client,
            settings,
            state: Mutex::new(ControllerState {
                active: None,
                motion,
            }),
        }
    }

    pub fn queue(&self) -> &Arc<SampleQueue> {
        &self.queue
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        // A panic while holding the lock leaves the state consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start delivering for `vehicle_id`. Must be called from within a tokio runtime.
    pub async fn start(&self, vehicle_id: i64) -> Result<(), UplinkError> {
        if vehicle_id <= 0 {
            return Err(UplinkError::InvalidVehicle(vehicle_id));
        }

        let mut state = self.lock_state();

        if let Some(current) = state.active.as_ref() {
            if !current.handle.is_finished() {
                if current.vehicle_id == vehicle_id {
                    return Ok(());
                }
                return Err(UplinkError::AlreadyRunning {
                    running: current.vehicle_id,
                });
            }
            warn!(
                vehicle_id = current.vehicle_id,
                "Previous delivery worker exited on its own, restarting"
            );
        }

        let claim = StreamClaim::acquire(self.id, vehicle_id)?;

        let recovered = self.queue.reset_in_flight()?;
        if recovered > 0 {
            info!(recovered, "Returned in-flight samples to pending");
        }

        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.client),
            self.settings.retry.clone(),
            self.settings.batch_size,
            self.settings.send_timeout,
        );
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _claim = claim;
            worker.run(run_cancel).await
        });

        state.active = Some(ActiveUplink {
            vehicle_id,
            cancel,
            handle,
        });
        state.motion.reset();

        info!(vehicle_id, endpoint = self.client.endpoint(), "Uplink started");
        Ok(())
    }

    /// Stop the worker, waiting up to the shutdown timeout for the current
    /// batch to settle. Returns the worker's counters when it exited cleanly.
    pub async fn stop(&self) -> Result<Option<WorkerStats>, UplinkError> {
        let Some(mut active) = self.lock_state().active.take() else {
            return Ok(None);
        };

        active.cancel.cancel();
        info!(vehicle_id = active.vehicle_id, "Stopping uplink");

        let outcome = tokio::time::timeout(self.settings.shutdown_timeout, &mut active.handle).await;
        match outcome {
            Ok(Ok(Ok(stats))) => {
                info!(vehicle_id = active.vehicle_id, "Uplink stopped");
                Ok(Some(stats))
            }
            Ok(Ok(Err(e))) => {
                error!(vehicle_id = active.vehicle_id, error = %e, "Delivery worker failed");
                Err(e.into())
            }
            Ok(Err(join_err)) => {
                error!(vehicle_id = active.vehicle_id, error = %join_err, "Delivery worker panicked");
                Ok(None)
            }
            Err(_) => {
                warn!(
                    vehicle_id = active.vehicle_id,
                    timeout_ms = u64::try_from(self.settings.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Delivery worker did not stop in time, aborting; in-flight samples will be retried"
                );
                active.handle.abort();
                // Wait for the aborted task to be dropped so the stream is free on return
                let _ = active.handle.await;
                Ok(None)
            }
        }
    }

    /// Queue a sample for the running vehicle. Never touches the network.
    pub fn submit(&self, sample: Sample) -> Result<QueueEntry, UplinkError> {
        let state = self.lock_state();
        let running = state.active.as_ref().ok_or(UplinkError::NotRunning)?;
        if sample.vehicle_id != running.vehicle_id {
            return Err(UplinkError::VehicleMismatch {
                running: running.vehicle_id,
                submitted: sample.vehicle_id,
            });
        }
        Ok(self.queue.enqueue(sample)?)
    }

    /// Turn a raw fix into a sample for the running vehicle and queue it.
    pub fn on_fix(&self, fix: &FixReading) -> Result<QueueEntry, UplinkError> {
        let mut state = self.lock_state();
        let vehicle_id = state
            .active
            .as_ref()
            .map(|a| a.vehicle_id)
            .ok_or(UplinkError::NotRunning)?;
        let sample = state.motion.sample_for(vehicle_id, fix);
        Ok(self.queue.enqueue(sample)?)
    }

    /// Poll until the queue is empty. Returns `false` if `cancel` fired first.
    pub async fn drain(&self, poll: Duration, cancel: &CancellationToken) -> Result<bool, UplinkError> {
        let mut interval = tokio::time::interval(poll);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(false),
                _ = interval.tick() => {
                    if self.queue.is_empty()? {
                        info!("Sample queue drained");
                        return Ok(true);
                    }
                }
            }
        }
    }

    pub fn status(&self) -> Result<UplinkStatus, UplinkError> {
        let vehicle_id = self
            .lock_state()
            .active
            .as_ref()
            .filter(|a| !a.handle.is_finished())
            .map(|a| a.vehicle_id);

        Ok(UplinkStatus {
            state: if vehicle_id.is_some() {
                UplinkState::Running
            } else {
                UplinkState::Stopped
            },
            vehicle_id,
            queue: self.queue.stats()?,
        })
    }

    pub fn is_running(&self) -> bool {
        self.lock_state()
            .active
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }
}

impl Drop for UplinkController {
    fn drop(&mut self) {
        // The worker releases the stream slot once it sees the cancel
        if let Some(active) = self.lock_state().active.take() {
            active.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uplink::client::DeliveryError;
    use crate::uplink::types::SampleRecord;
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl IngestClient for AcceptAll {
        async fn send_batch(&self, _records: &[SampleRecord]) -> Result<(), DeliveryError> {
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "accept-all"
        }
    }

    fn fix() -> FixReading {
        FixReading {
            latitude: 51.5,
            longitude: -0.12,
            speed_mps: 10.0,
            bearing: 90.0,
            accuracy_m: 4.0,
            altitude_m: 12.0,
            captured_at_ms: None,
            monotonic_ms: None,
        }
    }

    /// Tests that start a controller share the process-wide stream slot
    static STREAM: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    fn controller() -> (tempfile::TempDir, UplinkController) {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(SampleQueue::open(tmp.path().join("queue"), 100, false).unwrap());
        let ctrl = UplinkController::new(queue, Arc::new(AcceptAll), ControllerSettings::default());
        (tmp, ctrl)
    }

    #[tokio::test]
    async fn test_rejects_invalid_vehicle() {
        let (_tmp, ctrl) = controller();
        assert!(matches!(ctrl.start(0).await, Err(UplinkError::InvalidVehicle(0))));
        assert!(matches!(ctrl.start(-1).await, Err(UplinkError::InvalidVehicle(-1))));
        assert!(!ctrl.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_for_same_vehicle() {
        let _stream = STREAM.lock().await;
        let (_tmp, ctrl) = controller();
        ctrl.start(7).await.unwrap();
        ctrl.start(7).await.unwrap();
        assert!(matches!(
            ctrl.start(8).await,
            Err(UplinkError::AlreadyRunning { running: 7 })
        ));
        ctrl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_requires_running() {
        let (_tmp, ctrl) = controller();
        let sample = Sample::from_fix(7, &fix(), false);
        assert!(matches!(ctrl.submit(sample), Err(UplinkError::NotRunning)));
        assert!(matches!(ctrl.on_fix(&fix()), Err(UplinkError::NotRunning)));
    }

    #[tokio::test]
    async fn test_submit_rejects_other_vehicle() {
        let _stream = STREAM.lock().await;
        let (_tmp, ctrl) = controller();
        ctrl.start(7).await.unwrap();
        let sample = Sample::from_fix(9, &fix(), false);
        assert!(matches!(
            ctrl.submit(sample),
            Err(UplinkError::VehicleMismatch { running: 7, submitted: 9 })
        ));
        ctrl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let (_tmp, ctrl) = controller();
        assert!(ctrl.stop().await.unwrap().is_none());
        assert_eq!(ctrl.status().unwrap().state, UplinkState::Stopped);
    }

    #[tokio::test]
    async fn test_on_fix_uses_running_vehicle() {
        let _stream = STREAM.lock().await;
        let (_tmp, ctrl) = controller();
        ctrl.start(7).await.unwrap();
        let entry = ctrl.on_fix(&fix()).unwrap();
        assert_eq!(entry.sample.vehicle_id, 7);
        assert!((entry.sample.speed_kmh - 36.0).abs() < 1e-9);
        assert!(!entry.sample.is_moving);

        let status = ctrl.status().unwrap();
        assert_eq!(status.state, UplinkState::Running);
        assert_eq!(status.vehicle_id, Some(7));
        ctrl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_stream_per_process() {
        let _stream = STREAM.lock().await;
        let (_tmp_a, a) = controller();
        let (_tmp_b, b) = controller();

        a.start(7).await.unwrap();
        assert!(matches!(
            b.start(8).await,
            Err(UplinkError::AlreadyRunning { running: 7 })
        ));
        assert!(matches!(
            b.start(7).await,
            Err(UplinkError::AlreadyRunning { running: 7 })
        ));
        assert!(!b.is_running());

        a.stop().await.unwrap();
        b.start(8).await.unwrap();
        assert!(matches!(
            a.start(7).await,
            Err(UplinkError::AlreadyRunning { running: 8 })
        ));
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_controller_frees_stream() {
        let _stream = STREAM.lock().await;
        let (_tmp_a, a) = controller();
        a.start(7).await.unwrap();
        drop(a);

        let (_tmp_b, b) = controller();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while b.start(8).await.is_err() {
            assert!(tokio::time::Instant::now() < deadline, "stream never released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_resets_motion() {
        let _stream = STREAM.lock().await;
        let (_tmp, ctrl) = controller();
        let mut far = fix();
        far.latitude += 1.0;

        ctrl.start(7).await.unwrap();
        ctrl.on_fix(&fix()).unwrap();
        assert!(ctrl.on_fix(&far).unwrap().sample.is_moving);
        ctrl.stop().await.unwrap();

        // First fix after a restart has nothing to compare against
        ctrl.start(7).await.unwrap();
        assert!(!ctrl.on_fix(&fix()).unwrap().sample.is_moving);
        ctrl.stop().await.unwrap();
    }
}
