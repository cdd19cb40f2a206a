use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Duration, Instant};

use leaky_bucket::RateLimiter;

use crate::server_config::OracleLimits;

/// Process-wide submission budget for the classification oracle.
///
/// The bucket starts full at `burst` and refills one slot every
/// `window / (max_submissions - burst)`, so no window of `window_secs` ever
/// sees more than `max_submissions` acquisitions. Callers wait for a slot
/// instead of being rejected.
///
/// A rate-limit answer from the oracle opens a backoff window. Acquisitions
/// wait until the window closes; a caller that already slept part of it only
/// waits for the remainder.
#[derive(Clone)]
pub struct RateLimiters {
    oracle: Arc<RateLimiter>,
    backoff_until: Arc<Mutex<Option<Instant>>>,
    backoff_duration: Duration,
}

impl RateLimiters {
    pub fn new(max_submissions: usize, window: Duration, burst: usize, backoff: Duration) -> Self {
        let max_submissions = max_submissions.max(1);
        let burst = burst.clamp(1, max_submissions);
        let refill_slots = (max_submissions - burst).max(1) as u32;
        let interval = (window / refill_slots).max(Duration::from_millis(1));

        let oracle = RateLimiter::builder()
            .initial(burst)
            .interval(interval)
            .max(burst)
            .refill(1)
            .build();

        Self {
            oracle: Arc::new(oracle),
            backoff_until: Arc::new(Mutex::new(None)),
            backoff_duration: backoff,
        }
    }

    pub fn from_limits(limits: &OracleLimits) -> Self {
        Self::new(
            limits.max_submissions,
            Duration::from_secs(limits.window_secs),
            limits.burst,
            Duration::from_secs(limits.backoff_secs),
        )
    }

    fn backoff_deadline(&self) -> Option<Instant> {
        let deadline = *self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        deadline.filter(|deadline| *deadline > Instant::now())
    }

    pub async fn acquire_one(&self) {
        if let Some(deadline) = self.backoff_deadline() {
            tokio::time::sleep_until(deadline).await;
        }
        self.oracle.acquire_one().await;
    }

    pub fn trigger_backoff(&self) {
        if self.backoff_deadline().is_some() {
            return;
        }
        tracing::info!("Triggering oracle backoff for {:?}", self.backoff_duration);
        *self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + self.backoff_duration);
    }

    pub fn is_backing_off(&self) -> bool {
        self.backoff_deadline().is_some()
    }

    pub fn get_status(&self) -> String {
        let bucket = format!("{}/{}", self.oracle.balance(), self.oracle.max());
        if self.is_backing_off() {
            format!("oracle: {} (BACKOFF)", bucket)
        } else {
            format!("oracle: {}", bucket)
        }
    }
}
