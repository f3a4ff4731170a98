//! Provisioning queue tests with a recording hardware operator.

use crate::config::ProvisioningQueueConfig;
use crate::error::QueueError;
use crate::hardware::HardwareOperator;
use crate::metrics::ClaimMetrics;
use crate::provisioning_queue::{ProvisioningOperation, ProvisioningQueue};
use crate::test_fixtures::{host_in_state, with_bmc};
use crds::{HostState, PhysicalHost};
use prometheus::Registry;
use redfish_client::RedfishError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sleeps for a fixed time and tracks peak concurrency.
#[derive(Default)]
struct RecordingOperator {
    delay: Duration,
    fail: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    executed: AtomicUsize,
}

impl RecordingOperator {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl HardwareOperator for RecordingOperator {
    async fn execute(&self, _host: &PhysicalHost, _operation: ProvisioningOperation) -> Result<(), RedfishError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.executed.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(RedfishError::Api("BMC returned 503".to_string()))
        } else {
            Ok(())
        }
    }
}

fn config() -> ProvisioningQueueConfig {
    ProvisioningQueueConfig {
        max_concurrent_ops: 5,
        bmc_cooldown_period: Duration::from_millis(200),
        max_queue_size: 10,
        worker_count: 3,
        poll_interval: Duration::from_millis(5),
        request_timeout: Duration::from_secs(10),
        shutdown_grace_period: Duration::from_secs(2),
    }
}

fn host(name: &str, bmc: &str) -> PhysicalHost {
    with_bmc(host_in_state(name, HostState::Provisioning), bmc)
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_bmc_operations_respect_cooldown() {
    let operator = Arc::new(RecordingOperator::with_delay(Duration::from_millis(30)));
    let queue = ProvisioningQueue::new(config(), operator.clone());
    queue.start().await;

    // Two systems behind one chassis BMC
    let first = queue
        .submit_request(host("blade-1", "https://10.0.0.5/redfish/v1/Systems/1"), None, ProvisioningOperation::Provision)
        .await
        .unwrap();
    let second = queue
        .submit_request(host("blade-2", "https://10.0.0.5:443/redfish/v1/Systems/2"), None, ProvisioningOperation::Provision)
        .await
        .unwrap();

    let (a, b) = tokio::join!(queue.wait_for_result(first, WAIT), queue.wait_for_result(second, WAIT));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.success && b.success);

    let (earlier, later) = if a.started_at < b.started_at { (a, b) } else { (b, a) };
    assert!(
        later.started_at.unwrap() >= earlier.completed_at + config().bmc_cooldown_period,
        "second operation started inside the cooldown window"
    );
    assert_eq!(operator.peak.load(Ordering::SeqCst), 1);
    queue.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_concurrency_limit() {
    let operator = Arc::new(RecordingOperator::with_delay(Duration::from_millis(50)));
    let queue = ProvisioningQueue::new(
        ProvisioningQueueConfig {
            max_concurrent_ops: 2,
            worker_count: 6,
            ..config()
        },
        operator.clone(),
    );
    queue.start().await;

    let mut tickets = Vec::new();
    for i in 0..6 {
        let h = host(&format!("h{i}"), &format!("https://10.0.1.{i}"));
        tickets.push(queue.submit_request(h, None, ProvisioningOperation::Deprovision).await.unwrap());
    }
    for ticket in tickets {
        assert!(queue.wait_for_result(ticket, WAIT).await.unwrap().success);
    }

    assert!(operator.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(operator.executed.load(Ordering::SeqCst), 6);
    queue.stop().await;
}

#[tokio::test]
async fn test_capacity_rejects_overflow() {
    let operator = Arc::new(RecordingOperator::default());
    let queue = ProvisioningQueue::new(
        ProvisioningQueueConfig {
            max_queue_size: 3,
            ..config()
        },
        operator,
    );

    // Workers not started, nothing completes
    for i in 0..3 {
        queue
            .submit_request(host(&format!("h{i}"), &format!("10.0.2.{i}")), None, ProvisioningOperation::Provision)
            .await
            .unwrap();
    }
    let err = queue
        .submit_request(host("h3", "10.0.2.3"), None, ProvisioningOperation::Provision)
        .await
        .unwrap_err();

    assert_eq!(err, QueueError::Full { capacity: 3 });
    assert_eq!(queue.status().await.pending, 3);
}

#[tokio::test]
async fn test_host_is_never_double_enqueued() {
    let queue = ProvisioningQueue::new(config(), Arc::new(RecordingOperator::default()));
    let h = host("h1", "10.0.3.1");

    queue.submit_request(h.clone(), None, ProvisioningOperation::Provision).await.unwrap();
    let err = queue
        .submit_request(h, Some("default/m1".to_string()), ProvisioningOperation::Deprovision)
        .await
        .unwrap_err();

    assert_eq!(err, QueueError::AlreadyQueued("default/h1".to_string()));
}

#[tokio::test]
async fn test_retryability_follows_operation_kind() {
    let queue = ProvisioningQueue::new(config(), Arc::new(RecordingOperator::failing()));
    queue.start().await;

    let provision = queue
        .submit_request(host("h1", "10.0.4.1"), None, ProvisioningOperation::Provision)
        .await
        .unwrap();
    let release = queue
        .submit_request(host("h2", "10.0.4.2"), None, ProvisioningOperation::Release)
        .await
        .unwrap();

    let provision = queue.wait_for_result(provision, WAIT).await.unwrap();
    let release = queue.wait_for_result(release, WAIT).await.unwrap();

    assert!(!provision.success);
    assert!(provision.retryable);
    assert!(provision.error.unwrap().contains("503"));
    assert!(!release.success);
    assert!(!release.retryable);
    queue.stop().await;
}

#[tokio::test]
async fn test_wait_timeout_cancels_request() {
    let queue = ProvisioningQueue::new(config(), Arc::new(RecordingOperator::default()));
    let ticket = queue
        .submit_request(host("h1", "10.0.5.1"), None, ProvisioningOperation::Provision)
        .await
        .unwrap();

    let err = queue.wait_for_result(ticket, Duration::from_millis(20)).await.unwrap_err();
    assert_eq!(err, QueueError::Timeout(Duration::from_millis(20)));

    // The cancelled request is dropped on the next scheduling pass
    queue.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.status().await.pending, 0);
    queue.stop().await;
}

#[tokio::test]
async fn test_stop_refuses_new_work_and_fails_leftovers() {
    let queue = ProvisioningQueue::new(
        ProvisioningQueueConfig {
            shutdown_grace_period: Duration::from_millis(20),
            ..config()
        },
        Arc::new(RecordingOperator::default()),
    );
    let ticket = queue
        .submit_request(host("h1", "10.0.6.1"), None, ProvisioningOperation::Provision)
        .await
        .unwrap();

    queue.stop().await;

    let result = queue.wait_for_result(ticket, WAIT).await.unwrap();
    assert!(!result.success);
    assert!(result.started_at.is_none());
    let err = queue
        .submit_request(host("h2", "10.0.6.2"), None, ProvisioningOperation::Provision)
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_drains_in_flight_work() {
    let operator = Arc::new(RecordingOperator::with_delay(Duration::from_millis(100)));
    let metrics = ClaimMetrics::new(&Registry::new()).unwrap();
    let queue = ProvisioningQueue::with_metrics(config(), operator.clone(), metrics);
    queue.start().await;

    let a = queue
        .submit_request(host("a", "10.0.8.1"), None, ProvisioningOperation::Provision)
        .await
        .unwrap();
    let b = queue
        .submit_request(host("b", "10.0.8.1"), None, ProvisioningOperation::Provision)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    queue.stop().await;

    assert!(started.elapsed() >= Duration::from_millis(250));
    let a = queue.wait_for_result(a, WAIT).await.unwrap();
    let b = queue.wait_for_result(b, WAIT).await.unwrap();
    assert!(a.success, "{:?}", a.error);
    assert!(b.success, "{:?}", b.error);
    assert_eq!(operator.executed.load(Ordering::SeqCst), 2);
    assert!(queue.status().await.stopping);
}

#[tokio::test]
async fn test_permit_is_reentrant_and_blocks_shared_bmc() {
    let queue = ProvisioningQueue::new(config(), Arc::new(RecordingOperator::default()));
    let cancel = CancellationToken::new();
    let a = host("a", "https://10.0.7.1/redfish/v1/Systems/1");
    let b = host("b", "https://10.0.7.1/redfish/v1/Systems/2");

    let outer = queue.acquire_bmc_permit(&a, &cancel).await.unwrap();
    let inner = tokio::time::timeout(Duration::from_millis(50), queue.acquire_bmc_permit(&a, &cancel))
        .await
        .expect("re-entrant acquire must not block")
        .unwrap();

    // Same BMC is busy
    let blocked = tokio::time::timeout(Duration::from_millis(50), queue.acquire_bmc_permit(&b, &cancel)).await;
    assert!(blocked.is_err());

    queue.release_bmc_permit(inner).await;
    assert_eq!(queue.status().await.permits_held, 1);
    queue.release_bmc_permit(outer).await;
    let released_at = Instant::now();

    let permit = queue.acquire_bmc_permit(&b, &cancel).await.unwrap();
    assert!(released_at.elapsed() >= config().bmc_cooldown_period - Duration::from_millis(5));
    queue.release_bmc_permit(permit).await;
}

#[tokio::test]
async fn test_permit_wait_honours_cancellation() {
    let queue = ProvisioningQueue::new(
        ProvisioningQueueConfig {
            max_concurrent_ops: 1,
            ..config()
        },
        Arc::new(RecordingOperator::default()),
    );
    let cancel = CancellationToken::new();
    let _held = queue.acquire_bmc_permit(&host("a", "10.0.8.1"), &cancel).await.unwrap();

    let waiter = CancellationToken::new();
    let child = waiter.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.cancel();
    });

    let err = queue.acquire_bmc_permit(&host("b", "10.0.8.2"), &waiter).await.unwrap_err();
    assert_eq!(err, QueueError::Cancelled("default/b".to_string()));
}
