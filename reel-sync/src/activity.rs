//! Sliding-window activity tracking for the adaptive sync cadence.
//!
//! Local mutations are timestamped into a window; the count decides
//! between the collaborating and active tiers. Samples are never persisted.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SyncCadenceConfig;

/// Sync cadence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTier {
    /// Nobody else around; sync timer dormant.
    Solo,
    Collaborating,
    /// Heavy local editing; shortest interval.
    Active,
}

impl SyncTier {
    /// Timer interval for this tier, `None` when the timer should not run.
    pub fn interval(&self, config: &SyncCadenceConfig) -> Option<Duration> {
        match self {
            SyncTier::Solo => None,
            SyncTier::Collaborating => Some(config.collaborating_interval()),
            SyncTier::Active => Some(config.active_interval()),
        }
    }
}

/// Timestamps of recent local mutations.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    samples: VecDeque<Instant>,
    window: Duration,
    threshold: usize,
}

impl ActivityTracker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            threshold: threshold.max(1),
        }
    }

    pub fn from_config(config: &SyncCadenceConfig) -> Self {
        Self::new(config.activity_window(), config.activity_threshold)
    }

    /// Record a local mutation at `now`.
    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.samples.push_back(now);
    }

    /// Drop samples that fell out of the window.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.samples.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mutations within the trailing window.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.samples.len()
    }

    /// Tier for the given number of other participants.
    pub fn tier(&mut self, others: usize, now: Instant) -> SyncTier {
        if others == 0 {
            SyncTier::Solo
        } else if self.count(now) >= self.threshold {
            SyncTier::Active
        } else {
            SyncTier::Collaborating
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ActivityTracker {
        ActivityTracker::from_config(&SyncCadenceConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_solo_regardless_of_activity() {
        let mut t = tracker();
        for _ in 0..10 {
            t.record(Instant::now());
        }
        assert_eq!(t.tier(0, Instant::now()), SyncTier::Solo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_enters_active() {
        let mut t = tracker();
        for _ in 0..4 {
            t.record(Instant::now());
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert_eq!(t.tier(1, Instant::now()), SyncTier::Collaborating);

        t.record(Instant::now());
        assert_eq!(t.tier(1, Instant::now()), SyncTier::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_reverts_tier() {
        let mut t = tracker();
        for _ in 0..5 {
            t.record(Instant::now());
        }
        assert_eq!(t.tier(2, Instant::now()), SyncTier::Active);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(t.count(Instant::now()), 0);
        assert_eq!(t.tier(2, Instant::now()), SyncTier::Collaborating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_age_out_individually() {
        let mut t = tracker();
        t.record(Instant::now());
        tokio::time::advance(Duration::from_secs(30)).await;
        t.record(Instant::now());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(t.count(Instant::now()), 1);
    }

    #[test]
    fn test_tier_intervals() {
        let config = SyncCadenceConfig::default();
        assert_eq!(SyncTier::Solo.interval(&config), None);
        assert_eq!(SyncTier::Collaborating.interval(&config), Some(Duration::from_secs(5)));
        assert_eq!(SyncTier::Active.interval(&config), Some(Duration::from_secs(3)));
    }
}
