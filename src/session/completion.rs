use super::CompletionOutcome;
use crate::device::DeviceState;
use crate::error::{LmConnectError, Result};
use crate::shot::{ShotEvent, ShotType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Per-session counters shared between the event path and the session script
#[derive(Debug)]
pub struct SessionCounters {
    target: u32,
    shots_received: AtomicU32,
    preliminary_shots: AtomicU32,
    informational_shots: AtomicU32,
    state_changes: AtomicU64,
    configuration_changes: AtomicU64,
    last_state: Mutex<Option<DeviceState>>,
}

impl SessionCounters {
    pub fn new(target: u32) -> Self {
        Self {
            target,
            shots_received: AtomicU32::new(0),
            preliminary_shots: AtomicU32::new(0),
            informational_shots: AtomicU32::new(0),
            state_changes: AtomicU64::new(0),
            configuration_changes: AtomicU64::new(0),
            last_state: Mutex::new(None),
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Final shots counted toward the target
    pub fn shots_received(&self) -> u32 {
        self.shots_received.load(Ordering::Acquire)
    }

    pub fn preliminary_shots(&self) -> u32 {
        self.preliminary_shots.load(Ordering::Acquire)
    }

    /// Non-final shots other than preliminary ones
    pub fn informational_shots(&self) -> u32 {
        self.informational_shots.load(Ordering::Acquire)
    }

    pub fn state_changes(&self) -> u64 {
        self.state_changes.load(Ordering::Acquire)
    }

    pub fn configuration_changes(&self) -> u64 {
        self.configuration_changes.load(Ordering::Acquire)
    }

    pub fn last_state(&self) -> Option<DeviceState> {
        *self.last_state.lock()
    }

    pub fn is_complete(&self) -> bool {
        self.shots_received() >= self.target
    }

    pub(crate) fn record_state(&self, state: DeviceState) {
        self.state_changes.fetch_add(1, Ordering::AcqRel);
        *self.last_state.lock() = Some(state);
    }

    pub(crate) fn record_configuration(&self) {
        self.configuration_changes.fetch_add(1, Ordering::AcqRel);
    }
}

/// Counts final shots and releases the session's completion wait once.
///
/// A tracker and its waiter are created together by [`ShotTracker::arm`]; a
/// new session arms a new pair.
#[derive(Debug)]
pub struct ShotTracker {
    counters: Arc<SessionCounters>,
    release: Mutex<Option<oneshot::Sender<CompletionOutcome>>>,
}

impl ShotTracker {
    /// Target 0 is released immediately.
    pub fn arm(counters: Arc<SessionCounters>) -> (Self, CompletionWaiter) {
        let (sender, receiver) = oneshot::channel();
        let tracker = Self {
            counters,
            release: Mutex::new(Some(sender)),
        };

        if tracker.counters.target() == 0 {
            tracker.release(CompletionOutcome::TargetReached { shots: 0 });
        }

        (tracker, CompletionWaiter { receiver })
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }

    /// Count a shot. Returns true if this shot released the waiter.
    pub fn record(&self, event: &ShotEvent) -> bool {
        if !event.is_final() {
            match event.shot_type {
                ShotType::Preliminary => self.counters.preliminary_shots.fetch_add(1, Ordering::AcqRel),
                _ => self.counters.informational_shots.fetch_add(1, Ordering::AcqRel),
            };
            return false;
        }

        let shots = self.counters.shots_received.fetch_add(1, Ordering::AcqRel) + 1;
        shots >= self.counters.target() && self.release(CompletionOutcome::TargetReached { shots })
    }

    /// Release the waiter because the device went away
    pub fn device_lost(&self) -> bool {
        self.release(CompletionOutcome::DeviceLost {
            shots: self.counters.shots_received(),
        })
    }

    pub fn is_released(&self) -> bool {
        self.release.lock().is_none()
    }

    fn release(&self, outcome: CompletionOutcome) -> bool {
        match self.release.lock().take() {
            Some(sender) => {
                // The waiter may already be gone
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Session-script side of a [`ShotTracker`]
#[derive(Debug)]
pub struct CompletionWaiter {
    receiver: oneshot::Receiver<CompletionOutcome>,
}

impl CompletionWaiter {
    /// Resolves once the tracker releases, or fails if the tracker was dropped
    pub async fn wait(&mut self) -> Result<CompletionOutcome> {
        (&mut self.receiver).await.map_err(|_| {
            LmConnectError::session("shot tracking stopped before the session completed")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shot::ShotRecord;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shot(shot_type: ShotType) -> ShotEvent {
        ShotEvent::new(shot_type, ShotRecord::new("shot", "LM-1", Utc::now()))
    }

    #[tokio::test]
    async fn test_only_final_shots_count() {
        let counters = Arc::new(SessionCounters::new(2));
        let (tracker, mut waiter) = ShotTracker::arm(counters.clone());

        assert!(!tracker.record(&shot(ShotType::Preliminary)));
        assert!(!tracker.record(&shot(ShotType::Normalized)));
        assert!(!tracker.record(&shot(ShotType::Flight)));
        assert!(!tracker.is_released());
        assert!(tracker.record(&shot(ShotType::Flight)));

        assert_eq!(
            waiter.wait().await.unwrap(),
            CompletionOutcome::TargetReached { shots: 2 }
        );
        assert_eq!(counters.preliminary_shots(), 1);
        assert_eq!(counters.informational_shots(), 1);
    }

    #[tokio::test]
    async fn test_release_happens_once() {
        let counters = Arc::new(SessionCounters::new(1));
        let (tracker, mut waiter) = ShotTracker::arm(counters.clone());

        assert!(tracker.record(&shot(ShotType::Flight)));
        assert!(!tracker.record(&shot(ShotType::Flight)));
        assert!(!tracker.device_lost());

        assert_eq!(
            waiter.wait().await.unwrap(),
            CompletionOutcome::TargetReached { shots: 1 }
        );
        assert_eq!(counters.shots_received(), 2);
    }

    #[tokio::test]
    async fn test_zero_target_releases_at_arm() {
        let (tracker, mut waiter) = ShotTracker::arm(Arc::new(SessionCounters::new(0)));

        assert!(tracker.is_released());
        let outcome = timeout(Duration::from_millis(100), waiter.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::TargetReached { shots: 0 });
    }

    #[tokio::test]
    async fn test_concurrent_shots_release_exactly_once() {
        let counters = Arc::new(SessionCounters::new(50));
        let (tracker, mut waiter) = ShotTracker::arm(counters.clone());
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    let shot_type = if i % 2 == 0 {
                        ShotType::Flight
                    } else {
                        ShotType::Preliminary
                    };
                    tracker.record(&shot(shot_type))
                })
            })
            .collect();

        let mut releases = 0;
        for handle in handles {
            if handle.await.unwrap() {
                releases += 1;
            }
        }

        assert_eq!(releases, 1);
        assert_eq!(counters.shots_received(), 50);
        assert_eq!(counters.preliminary_shots(), 50);
        assert_eq!(
            waiter.wait().await.unwrap(),
            CompletionOutcome::TargetReached { shots: 50 }
        );
    }

    #[tokio::test]
    async fn test_rearming_starts_fresh() {
        let first = Arc::new(SessionCounters::new(1));
        let (tracker, mut waiter) = ShotTracker::arm(first);
        tracker.record(&shot(ShotType::Flight));
        waiter.wait().await.unwrap();

        let second = Arc::new(SessionCounters::new(1));
        let (tracker, mut waiter) = ShotTracker::arm(second.clone());
        assert!(!tracker.is_released());
        assert_eq!(second.shots_received(), 0);

        assert!(timeout(Duration::from_millis(20), waiter.wait()).await.is_err());
        drop(tracker);
    }

    #[tokio::test]
    async fn test_dropped_tracker_fails_the_wait() {
        let (tracker, mut waiter) = ShotTracker::arm(Arc::new(SessionCounters::new(3)));
        drop(tracker);

        assert!(matches!(
            waiter.wait().await,
            Err(LmConnectError::Session { .. })
        ));
    }
}
