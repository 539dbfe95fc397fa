//! Injectable shims: the clock and the operation recorder.
//!
//! The reconciler sleeps between retries and computes refresh deadlines
//! from "now"; routing both through a trait lets tests drive a simulated
//! clock instead of waiting out real backoffs.

use std::time::{Duration, Instant};

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// The real monotonic clock.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sink for coarse operation telemetry ("resync-filter-v4",
/// "update-filter-v4").  Hosts wire this to whatever op tracker they run.
pub trait OpRecorder: Send + Sync {
    fn record(&mut self, operation: &str);
}

pub struct NoopRecorder;

impl OpRecorder for NoopRecorder {
    fn record(&mut self, _operation: &str) {}
}
