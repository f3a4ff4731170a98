//! Leader-side claim ordering
//!
//! Older machines and machines with no placement constraints go first.
//! Equal priorities are served in arrival order.

use crate::claim::{ClaimRequest, ClaimResult};
use crate::config::PriorityPolicy;
use crate::error::ClaimError;
use chrono::{DateTime, Utc};
use crds::meta::creation_time;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Priority of a claim under `policy` at `now`.
pub fn compute_priority(policy: &PriorityPolicy, request: &ClaimRequest, now: DateTime<Utc>) -> i64 {
    let age_minutes = creation_time(&request.machine.metadata)
        .map(|created| (now - created).num_minutes().max(0))
        .unwrap_or_default();
    let mut priority = policy.base + age_minutes.saturating_mul(policy.per_minute_of_age);
    if request.requirements.is_untagged() {
        priority += policy.untagged_bonus;
    }
    priority
}

/// A claim waiting at the leader.
#[derive(Debug)]
pub struct LeaderCoordinatedClaim {
    pub id: Uuid,
    pub request: ClaimRequest,
    pub priority: i64,
    /// Attempts that ended in "retry later"
    pub retries: u32,
    pub enqueued_at: Instant,
    responder: Option<oneshot::Sender<Result<ClaimResult, ClaimError>>>,
}

impl LeaderCoordinatedClaim {
    /// Wraps `request`; the caller awaits the returned receiver.
    pub fn new(
        request: ClaimRequest,
        priority: i64,
    ) -> (Self, oneshot::Receiver<Result<ClaimResult, ClaimError>>) {
        let (tx, rx) = oneshot::channel();
        let claim = Self {
            id: Uuid::new_v4(),
            request,
            priority,
            retries: 0,
            enqueued_at: Instant::now(),
            responder: Some(tx),
        };
        (claim, rx)
    }

    /// Delivers the outcome; a caller that stopped waiting is ignored.
    pub fn respond(mut self, outcome: Result<ClaimResult, ClaimError>) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(outcome);
        }
    }

    /// The caller gave up waiting.
    pub fn is_abandoned(&self) -> bool {
        self.responder.as_ref().is_none_or(oneshot::Sender::is_closed)
    }
}

struct Entry {
    sequence: u64,
    claim: LeaderCoordinatedClaim,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower sequence
    fn cmp(&self, other: &Self) -> Ordering {
        self.claim
            .priority
            .cmp(&other.claim.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Max-priority queue of leader claims, FIFO among equals
#[derive(Default)]
pub struct ClaimPriorityQueue {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

impl std::fmt::Debug for ClaimPriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimPriorityQueue")
            .field("len", &self.heap.len())
            .finish()
    }
}

impl ClaimPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, claim: LeaderCoordinatedClaim) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Entry { sequence, claim });
    }

    pub fn pop(&mut self) -> Option<LeaderCoordinatedClaim> {
        self.heap.pop().map(|e| e.claim)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek_priority(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.claim.priority)
    }

    /// Longest time any queued claim has waited.
    pub fn oldest_enqueued(&self) -> Option<Instant> {
        self.heap.iter().map(|e| e.claim.enqueued_at).min()
    }

    /// Removes every claim, highest priority first.
    pub fn drain_ordered(&mut self) -> Vec<LeaderCoordinatedClaim> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(claim) = self.pop() {
            drained.push(claim);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::machine_named;
    use crds::meta::from_utc;

    fn request(name: &str, age_minutes: i64, tags: &[&str], now: DateTime<Utc>) -> ClaimRequest {
        let mut machine = machine_named(name);
        machine.metadata.creation_timestamp = Some(from_utc(now - chrono::Duration::minutes(age_minutes)).unwrap());
        machine.spec.host_selector.preferred_tags = tags.iter().map(|t| (*t).to_string()).collect();
        ClaimRequest::for_machine(machine)
    }

    fn enqueue(queue: &mut ClaimPriorityQueue, request: ClaimRequest, now: DateTime<Utc>) {
        let priority = compute_priority(&PriorityPolicy::default(), &request, now);
        queue.push(LeaderCoordinatedClaim::new(request, priority).0);
    }

    fn names(queue: &mut ClaimPriorityQueue) -> Vec<String> {
        queue
            .drain_ordered()
            .into_iter()
            .map(|c| c.request.machine.metadata.name.unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_priority_formula() {
        let now = Utc::now();
        let policy = PriorityPolicy::default();
        assert_eq!(compute_priority(&policy, &request("a", 10, &["gpu"], now), now), 110);
        assert_eq!(compute_priority(&policy, &request("b", 10, &[], now), now), 160);
    }

    #[test]
    fn test_older_claims_first() {
        let now = Utc::now();
        let mut queue = ClaimPriorityQueue::new();
        enqueue(&mut queue, request("one", 1, &["ssd"], now), now);
        enqueue(&mut queue, request("sixty", 60, &["ssd"], now), now);
        enqueue(&mut queue, request("ten", 10, &["ssd"], now), now);

        assert_eq!(names(&mut queue), vec!["sixty", "ten", "one"]);
    }

    #[test]
    fn test_untagged_beats_tagged_of_same_age() {
        let now = Utc::now();
        let mut queue = ClaimPriorityQueue::new();
        enqueue(&mut queue, request("tagged", 10, &["ssd"], now), now);
        enqueue(&mut queue, request("untagged", 10, &[], now), now);

        assert_eq!(names(&mut queue), vec!["untagged", "tagged"]);
    }

    #[test]
    fn test_fifo_among_equal_priorities() {
        let now = Utc::now();
        let mut queue = ClaimPriorityQueue::new();
        for name in ["first", "second", "third"] {
            enqueue(&mut queue, request(name, 5, &["ssd"], now), now);
        }
        assert_eq!(names(&mut queue), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_abandoned_claim_detected() {
        let now = Utc::now();
        let (claim, rx) = LeaderCoordinatedClaim::new(request("m", 0, &[], now), 100);
        assert!(!claim.is_abandoned());
        drop(rx);
        assert!(claim.is_abandoned());
    }
}
