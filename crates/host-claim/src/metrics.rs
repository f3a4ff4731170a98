//! Prometheus metrics for claim coordination and the provisioning queue.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `metal_claim_claims_total` | Counter | `coordinator`, `outcome` |
//! | `metal_claim_leader_transitions_total` | Counter | `transition` |
//! | `metal_claim_provisioning_duration_seconds` | Histogram | `operation`, `outcome` |
//! | `metal_claim_queue_depth` | Gauge | `queue` |

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use thiserror::Error;

/// BMC operations take seconds to minutes.
pub const PROVISIONING_BUCKETS: &[f64] = &[0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Outcome label of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A host was newly claimed
    Claimed,
    /// The machine already owned a host
    Replayed,
    /// No host matched the requirements
    NoCandidates,
    /// Every matching host was taken by a concurrent claim
    LostRaces,
    /// Infrastructure or validation failure
    Failed,
}

impl ClaimOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ClaimOutcome::Claimed => "claimed",
            ClaimOutcome::Replayed => "replayed",
            ClaimOutcome::NoCandidates => "no_candidates",
            ClaimOutcome::LostRaces => "lost_races",
            ClaimOutcome::Failed => "failed",
        }
    }
}

/// Claim and provisioning metrics; cheap to clone.
#[derive(Clone, Debug)]
pub struct ClaimMetrics {
    claims_total: CounterVec,
    leader_transitions_total: CounterVec,
    provisioning_duration: HistogramVec,
    queue_depth: GaugeVec,
}

impl ClaimMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let claims_total = CounterVec::new(
            Opts::new("metal_claim_claims_total", "Claim attempts by outcome"),
            &["coordinator", "outcome"],
        )?;
        registry.register(Box::new(claims_total.clone()))?;

        let leader_transitions_total = CounterVec::new(
            Opts::new(
                "metal_claim_leader_transitions_total",
                "Leadership acquired or lost by this replica",
            ),
            &["transition"],
        )?;
        registry.register(Box::new(leader_transitions_total.clone()))?;

        let provisioning_duration = HistogramVec::new(
            HistogramOpts::new(
                "metal_claim_provisioning_duration_seconds",
                "Time from dequeue to completion of BMC operations",
            )
            .buckets(PROVISIONING_BUCKETS.to_vec()),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(provisioning_duration.clone()))?;

        let queue_depth = GaugeVec::new(
            Opts::new("metal_claim_queue_depth", "Requests waiting in a queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            claims_total,
            leader_transitions_total,
            provisioning_duration,
            queue_depth,
        })
    }

    /// Counts one claim attempt.
    pub fn record_claim(&self, coordinator: &str, outcome: ClaimOutcome) {
        self.claims_total
            .with_label_values(&[coordinator, outcome.as_str()])
            .inc();
    }

    /// Counts a leadership change.
    pub fn record_leader_transition(&self, leading: bool) {
        let transition = if leading { "started" } else { "stopped" };
        self.leader_transitions_total
            .with_label_values(&[transition])
            .inc();
    }

    /// Records how long a provisioning operation ran.
    pub fn observe_operation(&self, operation: &str, succeeded: bool, duration: Duration) {
        let outcome = if succeeded { "success" } else { "failure" };
        self.provisioning_duration
            .with_label_values(&[operation, outcome])
            .observe(duration.as_secs_f64());
    }

    /// Sets the current depth of a queue.
    #[allow(clippy::cast_precision_loss, reason = "queue depths are small")]
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth.with_label_values(&[queue]).set(depth as f64);
    }
}

/// Renders `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
}
