//! Rollway wait – poll a condition until it holds, fails, times out or is cancelled.
//!
//! The first evaluation runs immediately; later ones follow a fixed interval.
//! Errors that report a missing resource count as "not yet" rather than failure.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

mod deployment;

pub use deployment::{is_rolled_out, wait_for_deployment, DeploymentReady};
pub use tokio_util::sync::CancellationToken;

/// Errors that can mean "the resource does not exist yet".
pub trait Absence {
    fn is_absent(&self) -> bool;
}

impl Absence for kube::Error {
    fn is_absent(&self) -> bool {
        matches!(self, kube::Error::Api(ae) if ae.code == 404)
    }
}

/// A check against live state, evaluated once per tick.
#[async_trait::async_trait]
pub trait Condition: Send {
    type Error: Absence + std::error::Error + Send + Sync + 'static;

    /// `Ok(true)` when satisfied, `Ok(false)` when not yet.
    async fn check(&mut self) -> Result<bool, Self::Error>;
}

/// Adapter turning an async closure into a [`Condition`].
pub struct FnCondition<F>(F);

pub fn condition_fn<F, Fut, E>(f: F) -> FnCondition<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool, E>> + Send + 'static,
    E: Absence + std::error::Error + Send + Sync + 'static,
{
    FnCondition(f)
}

#[async_trait::async_trait]
impl<F, Fut, E> Condition for FnCondition<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool, E>> + Send + 'static,
    E: Absence + std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn check(&mut self) -> Result<bool, E> {
        (self.0)().await
    }
}

/// Result of one evaluation after folding absence into `Pending`.
#[derive(Debug, PartialEq, Eq)]
pub enum Probe<E> {
    Ready,
    Pending,
    Failed(E),
}

impl<E: Absence> Probe<E> {
    pub fn classify(r: Result<bool, E>) -> Self {
        match r {
            Ok(true) => Probe::Ready,
            Ok(false) => Probe::Pending,
            Err(e) if e.is_absent() => Probe::Pending,
            Err(e) => Probe::Failed(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E: std::error::Error + 'static> {
    #[error("condition not met within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("wait cancelled")]
    Cancelled,
    #[error("condition failed: {0}")]
    Condition(#[source] E),
}

impl<E: std::error::Error + 'static> WaitError<E> {
    pub fn is_deadline(&self) -> bool {
        matches!(self, WaitError::DeadlineExceeded(_))
    }
}

/// Poll cadence and overall budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5), timeout: Duration::from_secs(300) }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        // A zero interval would spin.
        Self { interval: interval.max(Duration::from_millis(1)), timeout }
    }

    /// Read `ROLLWAY_WAIT_INTERVAL_SECS` / `ROLLWAY_WAIT_TIMEOUT_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs);
        Self::new(
            secs("ROLLWAY_WAIT_INTERVAL_SECS").unwrap_or(d.interval),
            secs("ROLLWAY_WAIT_TIMEOUT_SECS").unwrap_or(d.timeout),
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Evaluate `cond` until it is satisfied.
///
/// Sleeps and in-flight evaluations both race `cancel`, so cancellation is
/// observed within one interval. The last sleep is clipped to the deadline.
pub async fn wait_until<C: Condition>(mut cond: C, cfg: PollConfig, cancel: &CancellationToken) -> Result<(), WaitError<C::Error>> {
    let start = Instant::now();
    let deadline = start + cfg.timeout;
    let mut polls = 0u64;
    loop {
        polls += 1;
        counter!("wait_polls", 1u64);
        let probe = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            r = cond.check() => Probe::classify(r),
            _ = sleep_until(deadline) => Probe::Pending,
        };
        match probe {
            Probe::Ready => {
                info!(polls, elapsed_ms = start.elapsed().as_millis() as u64, "condition met");
                return Ok(());
            }
            Probe::Failed(e) => return Err(WaitError::Condition(e)),
            Probe::Pending => debug!(polls, "condition pending"),
        }

        let now = Instant::now();
        if now >= deadline {
            counter!("wait_timeouts", 1u64);
            return Err(WaitError::DeadlineExceeded(cfg.timeout));
        }
        let wake = (now + cfg.interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = sleep_until(wake) => {}
        }
    }
}
