//! Delivery worker — drains the sample queue and sends batches to the endpoint
//!
//! One worker runs per active uplink. Between batches it sleeps until either a
//! new sample is enqueued or the earliest pending retry becomes eligible. A
//! send in progress is never interrupted by cancellation: its result is always
//! applied to the queue before the worker exits.

use super::client::{DeliveryError, Disposition, IngestClient};
use super::queue::{QueueError, SampleQueue};
use super::retry::RetryPolicy;
use super::types::{now_epoch_ms, EntryId, QueueEntry, SampleRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one batch send, as applied to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Endpoint accepted the batch; entries acked
    Delivered(usize),
    /// Send failed; entries requeued with backoff (`requeued`) or abandoned
    /// after too many attempts (`killed`)
    Retrying { requeued: usize, killed: usize },
    /// Auth failure; entries deferred without counting an attempt
    Deferred(usize),
    /// Endpoint rejected the payload for good; entries killed
    Rejected(usize),
}

/// Lifetime counters of one worker run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub samples_delivered: u64,
    pub samples_abandoned: u64,
}

/// Background task delivering queued samples
pub struct DeliveryWorker {
    queue: Arc<SampleQueue>,
    client: Arc<dyn IngestClient>,
    retry: RetryPolicy,
    batch_size: usize,
    send_timeout: Duration,
    consecutive_auth_failures: u32,
    stats: WorkerStats,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<SampleQueue>,
        client: Arc<dyn IngestClient>,
        retry: RetryPolicy,
        batch_size: usize,
        send_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            client,
            retry,
            batch_size: batch_size.max(1),
            send_timeout,
            consecutive_auth_failures: 0,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run until `cancel` fires. Only a corrupted queue ends the loop early.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WorkerStats, QueueError> {
        info!(
            endpoint = self.client.endpoint(),
            batch_size = self.batch_size,
            "Delivery worker started"
        );

        while !cancel.is_cancelled() {
            let step = match self.deliver_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => self.wait_for_work(&cancel).await,
                Err(e) => Err(e),
            };

            match step {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Delivery worker stopping: sample queue is corrupted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Sample queue error, backing off");
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(self.retry.base_delay) => {}
                    }
                }
            }
        }

        info!(
            batches_sent = self.stats.batches_sent,
            batches_failed = self.stats.batches_failed,
            samples_delivered = self.stats.samples_delivered,
            samples_abandoned = self.stats.samples_abandoned,
            "Delivery worker stopped"
        );
        Ok(self.stats)
    }

    /// Take one batch and send it. Returns `None` when nothing is eligible.
    pub async fn deliver_once(&mut self) -> Result<Option<BatchOutcome>, QueueError> {
        let batch = self.queue.take_batch(self.batch_size)?;
        if batch.is_empty() {
            return Ok(None);
        }

        let records: Vec<SampleRecord> = batch.iter().map(|e| SampleRecord::from(&e.sample)).collect();
        debug!(samples = records.len(), "Sending batch");

        let result = match tokio::time::timeout(self.send_timeout, self.client.send_batch(&records)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        };

        self.settle(&batch, result).map(Some)
    }

    /// Apply a send result to the queue.
    fn settle(
        &mut self,
        batch: &[QueueEntry],
        result: Result<(), DeliveryError>,
    ) -> Result<BatchOutcome, QueueError> {
        let ids: Vec<EntryId> = batch.iter().map(|e| e.id).collect();

        let error = match result {
            Ok(()) => {
                let acked = self.queue.ack(&ids)?;
                self.consecutive_auth_failures = 0;
                self.stats.batches_sent += 1;
                self.stats.samples_delivered += acked as u64;
                info!(samples = acked, "Batch delivered");
                return Ok(BatchOutcome::Delivered(acked));
            }
            Err(e) => e,
        };

        self.stats.batches_failed += 1;

        match error.disposition() {
            Disposition::Retry => {
                self.consecutive_auth_failures = 0;
                let mut by_attempt: BTreeMap<u32, Vec<EntryId>> = BTreeMap::new();
                let mut exhausted = Vec::new();
                for entry in batch {
                    if self.retry.is_exhausted(entry.attempts + 1) {
                        exhausted.push(entry.id);
                    } else {
                        by_attempt.entry(entry.attempts).or_default().push(entry.id);
                    }
                }

                let mut requeued = 0;
                for (attempt, ids) in &by_attempt {
                    let delay = self.retry.delay_for(*attempt);
                    requeued += self.queue.requeue(ids, delay)?;
                    warn!(
                        error = %error,
                        samples = ids.len(),
                        attempt = attempt + 1,
                        next_retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Batch delivery failed, will retry"
                    );
                }

                let killed = if exhausted.is_empty() {
                    0
                } else {
                    error!(
                        error = %error,
                        samples = exhausted.len(),
                        max_attempts = self.retry.max_attempts,
                        "Max delivery attempts exceeded — abandoning samples"
                    );
                    self.queue.kill(&exhausted)?
                };
                self.stats.samples_abandoned += killed as u64;

                Ok(BatchOutcome::Retrying { requeued, killed })
            }
            Disposition::Defer => {
                let delay = self.retry.delay_for(self.consecutive_auth_failures);
                self.consecutive_auth_failures = self.consecutive_auth_failures.saturating_add(1);
                let deferred = self.queue.defer(&ids, delay)?;
                warn!(
                    error = %error,
                    samples = deferred,
                    consecutive_failures = self.consecutive_auth_failures,
                    next_retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Batch not authorized, token refresh requested"
                );
                Ok(BatchOutcome::Deferred(deferred))
            }
            Disposition::Abandon => {
                let killed = self.queue.kill(&ids)?;
                self.stats.samples_abandoned += killed as u64;
                error!(error = %error, samples = killed, "Batch permanently rejected by endpoint");
                Ok(BatchOutcome::Rejected(killed))
            }
        }
    }

    /// Sleep until a sample is enqueued, a retry becomes eligible, or cancellation.
    async fn wait_for_work(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        let notified = self.queue.notified();

        match self.queue.next_eligible_at()? {
            Some(at) => {
                let wait = u64::try_from(at.saturating_sub(now_epoch_ms())).unwrap_or(0);
                if wait == 0 {
                    return Ok(());
                }
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = notified => {}
                    () = tokio::time::sleep(Duration::from_millis(wait)) => {}
                }
            }
            None => {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = notified => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uplink::types::{FixReading, Sample};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Client answering from a script; an empty script means success.
    struct ScriptedClient {
        script: Mutex<Vec<Result<(), DeliveryError>>>,
        sent: Mutex<Vec<Vec<SampleRecord>>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<(), DeliveryError>>) -> Self {
            Self {
                script: Mutex::new(script),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IngestClient for ScriptedClient {
        async fn send_batch(&self, records: &[SampleRecord]) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(records.to_vec());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }

        fn endpoint(&self) -> &str {
            "scripted"
        }
    }

    fn sample() -> Sample {
        let fix = FixReading {
            latitude: 1.0,
            longitude: 2.0,
            speed_mps: 0.0,
            bearing: 0.0,
            accuracy_m: 1.0,
            altitude_m: 0.0,
            captured_at_ms: Some(0),
            monotonic_ms: Some(0),
        };
        Sample::from_fix(7, &fix, false)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_fraction: 0.0,
            max_attempts: 3,
        }
    }

    fn setup(script: Vec<Result<(), DeliveryError>>) -> (tempfile::TempDir, Arc<SampleQueue>, Arc<ScriptedClient>, DeliveryWorker) {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(SampleQueue::open(tmp.path().join("queue"), 100, false).unwrap());
        let client = Arc::new(ScriptedClient::new(script));
        let worker = DeliveryWorker::new(
            Arc::clone(&queue),
            client.clone(),
            policy(),
            10,
            Duration::from_secs(5),
        );
        (tmp, queue, client, worker)
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let (_tmp, _queue, client, mut worker) = setup(vec![]);
        assert_eq!(worker.deliver_once().await.unwrap(), None);
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_acks_batch() {
        let (_tmp, queue, client, mut worker) = setup(vec![]);
        for _ in 0..3 {
            queue.enqueue(sample()).unwrap();
        }

        let outcome = worker.deliver_once().await.unwrap();
        assert_eq!(outcome, Some(BatchOutcome::Delivered(3)));
        assert!(queue.is_empty().unwrap());
        assert_eq!(client.sent.lock().unwrap()[0].len(), 3);
        assert_eq!(worker.stats().samples_delivered, 3);
    }

    #[tokio::test]
    async fn test_failure_requeues_then_kills() {
        let (_tmp, queue, _client, mut worker) = setup(vec![
            Err(DeliveryError::Server(500)),
            Err(DeliveryError::Server(500)),
            Err(DeliveryError::Server(500)),
        ]);
        queue.enqueue(sample()).unwrap();

        for expected_attempts in 1..=2 {
            let outcome = worker.deliver_once().await.unwrap();
            assert_eq!(outcome, Some(BatchOutcome::Retrying { requeued: 1, killed: 0 }));
            assert_eq!(queue.entries().unwrap()[0].attempts, expected_attempts);
        }

        let outcome = worker.deliver_once().await.unwrap();
        assert_eq!(outcome, Some(BatchOutcome::Retrying { requeued: 0, killed: 1 }));
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.stats().unwrap().lost_total, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_never_kills() {
        let script = (0..10)
            .map(|_| Err(DeliveryError::Auth("no token".to_string())))
            .collect();
        let (_tmp, queue, _client, mut worker) = setup(script);
        queue.enqueue(sample()).unwrap();

        for _ in 0..10 {
            let outcome = worker.deliver_once().await.unwrap();
            assert_eq!(outcome, Some(BatchOutcome::Deferred(1)));
        }
        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 0);

        // Token is back
        assert_eq!(worker.deliver_once().await.unwrap(), Some(BatchOutcome::Delivered(1)));
    }

    #[tokio::test]
    async fn test_permanent_rejection_kills_immediately() {
        let (_tmp, queue, _client, mut worker) = setup(vec![Err(DeliveryError::PermanentRejection {
            status: 400,
            digest: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        })]);
        queue.enqueue(sample()).unwrap();
        queue.enqueue(sample()).unwrap();

        let outcome = worker.deliver_once().await.unwrap();
        assert_eq!(outcome, Some(BatchOutcome::Rejected(2)));
        assert_eq!(queue.stats().unwrap().dead_total, 2);
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel() {
        let (_tmp, _queue, _client, worker) = setup(vec![]);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats, WorkerStats::default());
    }
}
