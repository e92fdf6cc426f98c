//! Bounded wait for a remote object to reach a target state.
//!
//! DRP has no push channel for machine transitions, so callers poll a status
//! probe until the status lands in a target set. The loop is:
//!
//! 1. sleep `delay` (lets a just-submitted action take effect),
//! 2. call the probe; a probe error ends the wait immediately,
//! 3. stop on `done`, on a target state, or on a state in neither set,
//! 4. otherwise sleep the poll interval and go again until `timeout` elapses.
//!
//! Elapsed time counts from the start of [`wait_for_state`], delay included.
//! All timing goes through `tokio::time`, so tests run on paused virtual time.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::ProviderError;

/// Deadline offset used when `timeout` overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A state value the poller can compare against pending and target sets.
pub trait PollState: Clone + Debug + Send {
    /// Whether this observed state satisfies `expected`.
    fn matches(&self, expected: &Self) -> bool;
}

/// Raw DRP status strings match by prefix, so `"6:Deployed"` satisfies `"6:"`.
impl PollState for String {
    fn matches(&self, expected: &Self) -> bool {
        self.starts_with(expected.as_str())
    }
}

/// One probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation<S> {
    /// The current remote state.
    pub state: S,
    /// The probe already knows the outcome; polling stops with `state`.
    pub done: bool,
}

impl<S> Observation<S> {
    /// An observation that leaves the decision to the pending/target sets.
    pub fn new(state: S) -> Self {
        Self { state, done: false }
    }

    /// An observation that ends polling.
    pub fn done(state: S) -> Self {
        Self { state, done: true }
    }
}

/// How the wait between probes evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Always wait `min_poll_interval`.
    #[default]
    Fixed,
    /// Double the wait after each probe, capped at `max`.
    Exponential {
        /// Upper bound for the wait.
        max: Duration,
    },
}

impl Backoff {
    fn next(self, current: Duration) -> Duration {
        match self {
            Self::Fixed => current,
            Self::Exponential { max } => current.saturating_mul(2).min(max.max(current)),
        }
    }
}

/// Parameters of a single wait.
#[derive(Debug, Clone)]
pub struct PollConfig<S> {
    /// States meaning "still transitioning".
    pub pending: Vec<S>,
    /// States meaning "done".
    pub target: Vec<S>,
    /// Overall budget, measured from the start of the wait.
    pub timeout: Duration,
    /// Sleep before the first probe.
    pub delay: Duration,
    /// Initial wait between probes.
    pub min_poll_interval: Duration,
    /// Growth of the wait between probes.
    pub backoff: Backoff,
}

impl<S> PollConfig<S> {
    /// A config with no delay and a one second interval.
    pub fn new(pending: Vec<S>, target: Vec<S>, timeout: Duration) -> Self {
        Self {
            pending,
            target,
            timeout,
            delay: Duration::ZERO,
            min_poll_interval: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }

    /// Set the delay before the first probe.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the initial interval between probes.
    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Why a wait ended without reaching a target state.
#[derive(Debug, Error)]
pub enum PollError<S, E> {
    /// The probe itself failed.
    #[error("status probe failed: {0}")]
    Probe(#[source] E),

    /// The timeout elapsed while the object was still pending.
    #[error("timeout after {timeout:?} waiting for {target:?}, last state {last_state:?}")]
    Timeout {
        /// The last state the probe reported.
        last_state: S,
        /// The states being waited for.
        target: Vec<S>,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The object reached a state in neither the pending nor the target set.
    #[error("unexpected state {state:?}, wanted {target:?}")]
    UnexpectedState {
        /// The offending state.
        state: S,
        /// The states being waited for.
        target: Vec<S>,
    },

    /// The pending and target sets share a state.
    #[error("pending and target states overlap: {0:?}")]
    OverlappingStates(Vec<S>),
}

impl<S, E> PollError<S, E> {
    /// Whether the caller should undo partial work (release a machine, etc).
    ///
    /// Probe failures say nothing about the remote object, so they do not.
    pub fn warrants_cleanup(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::UnexpectedState { .. })
    }
}

impl<S: Debug> From<PollError<S, ProviderError>> for ProviderError {
    fn from(err: PollError<S, ProviderError>) -> Self {
        match err {
            PollError::Probe(inner) => inner,
            err @ PollError::Timeout { .. } => ProviderError::DeadlineExceeded(err.to_string()),
            err @ PollError::UnexpectedState { .. } => {
                ProviderError::FailedPrecondition(err.to_string())
            },
            err @ PollError::OverlappingStates(_) => ProviderError::Sdk(err.to_string()),
        }
    }
}

fn matches_any<S: PollState>(state: &S, set: &[S]) -> bool {
    set.iter().any(|expected| state.matches(expected))
}

/// Poll `probe` until it reports a target state or the wait fails.
///
/// Returns the final observed state on success.
pub async fn wait_for_state<S, E, F, Fut>(
    config: &PollConfig<S>,
    mut probe: F,
) -> Result<S, PollError<S, E>>
where
    S: PollState,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<S>, E>>,
{
    let overlap: Vec<S> = config
        .pending
        .iter()
        .filter(|p| {
            config
                .target
                .iter()
                .any(|t| p.matches(t) || t.matches(p))
        })
        .cloned()
        .collect();
    if !overlap.is_empty() {
        return Err(PollError::OverlappingStates(overlap));
    }

    let start = Instant::now();
    // Timeouts too large to represent never expire.
    let deadline = start
        .checked_add(config.timeout)
        .unwrap_or_else(|| start + FAR_FUTURE);
    let mut interval = config.min_poll_interval;
    let mut attempt: u32 = 0;

    if !config.delay.is_zero() {
        tokio::time::sleep(config.delay).await;
    }

    loop {
        attempt += 1;
        let observation = probe().await.map_err(PollError::Probe)?;
        trace!(attempt, state = ?observation.state, done = observation.done, "probed state");

        if observation.done || matches_any(&observation.state, &config.target) {
            debug!(attempt, state = ?observation.state, "reached target state");
            return Ok(observation.state);
        }

        if !matches_any(&observation.state, &config.pending) {
            return Err(PollError::UnexpectedState {
                state: observation.state,
                target: config.target.clone(),
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                last_state: observation.state,
                target: config.target.clone(),
                timeout: config.timeout,
            });
        }

        let wait = interval.min(deadline - now);
        debug!(attempt, state = ?observation.state, ?wait, "still pending");
        tokio::time::sleep(wait).await;
        interval = config.backoff.next(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn states(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    /// A probe replaying `script`, repeating the last entry forever.
    fn scripted(
        script: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::future::Ready<Result<Observation<String>, ProviderError>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let state = script[n.min(script.len() - 1)].to_string();
            std::future::ready(Ok(Observation::new(state)))
        }
    }

    fn deploy_config(timeout: Duration) -> PollConfig<String> {
        PollConfig::new(states(&["9:"]), states(&["6:"]), timeout)
            .with_delay(Duration::from_secs(10))
            .with_min_poll_interval(Duration::from_secs(3))
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_target_returns_after_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let state = assert_ok!(
            wait_for_state(
                &deploy_config(Duration::from_secs(60)),
                scripted(vec!["6:Deployed"], calls.clone())
            )
            .await
        );

        assert_eq!(state, "6:Deployed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = PollConfig::new(states(&["9:"]), states(&["6:"]), Duration::from_secs(60));
        let start = Instant::now();

        let state = assert_ok!(
            wait_for_state(&config, scripted(vec!["9:", "9:", "6:"], calls.clone())).await
        );

        assert_eq!(state, "6:");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = PollConfig::new(states(&["6:"]), states(&["4:"]), Duration::from_secs(1))
            .with_min_poll_interval(Duration::from_secs(3));
        let start = Instant::now();

        let err = assert_err!(wait_for_state(&config, scripted(vec!["6:"], calls)).await);

        match &err {
            PollError::Timeout {
                last_state,
                timeout,
                ..
            } => {
                assert_eq!(last_state, "6:");
                assert_eq!(*timeout, Duration::from_secs(1));
            },
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(err.warrants_cleanup());
        // The interval is clipped to the remaining budget.
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_within_one_interval_of_deadline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let timeout = Duration::from_secs(25 * 60);
        let start = Instant::now();

        let err = assert_err!(
            wait_for_state(&deploy_config(timeout), scripted(vec!["9:"], calls.clone())).await
        );

        assert!(matches!(err, PollError::Timeout { .. }));
        assert!(start.elapsed() >= timeout);
        assert!(start.elapsed() <= timeout + Duration::from_secs(3));
        assert!(calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_state_fails_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let err = assert_err!(
            wait_for_state(
                &deploy_config(Duration::from_secs(600)),
                scripted(vec!["9:", "11:FailedDeployment"], calls.clone())
            )
            .await
        );

        match &err {
            PollError::UnexpectedState { state, .. } => assert_eq!(state, "11:FailedDeployment"),
            other => panic!("expected unexpected state, got {:?}", other),
        }
        assert!(err.warrants_cleanup());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = PollConfig::new(states(&["9:"]), states(&["6:"]), Duration::from_secs(60));

        let probe = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 3 {
                    Err(ProviderError::Unavailable("connection reset".to_string()))
                } else {
                    Ok(Observation::new("9:".to_string()))
                }
            }
        };

        let err = assert_err!(wait_for_state(&config, probe).await);

        assert!(matches!(
            err,
            PollError::Probe(ProviderError::Unavailable(_))
        ));
        assert!(!err.warrants_cleanup());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_observation_stops_polling() {
        let config = PollConfig::new(states(&["6:"]), states(&["4:"]), Duration::from_secs(60));
        let state = assert_ok!(
            wait_for_state(&config, || async {
                Ok::<_, ProviderError>(Observation::done("gone".to_string()))
            })
            .await
        );
        assert_eq!(state, "gone");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = PollConfig::new(states(&["9:"]), states(&["6:"]), Duration::MAX);

        let state =
            assert_ok!(wait_for_state(&config, scripted(vec!["9:", "6:"], calls.clone())).await);

        assert_eq!(state, "6:");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_sets_rejected_before_probing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = PollConfig::new(states(&["6:"]), states(&["6:"]), Duration::from_secs(60));

        let err = assert_err!(wait_for_state(&config, scripted(vec!["6:"], calls.clone())).await);

        assert!(matches!(err, PollError::OverlappingStates(_)));
        assert!(!err.warrants_cleanup());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_is_capped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = PollConfig::new(states(&["9:"]), states(&["6:"]), Duration::from_secs(600))
            .with_min_poll_interval(Duration::from_secs(1))
            .with_backoff(Backoff::Exponential {
                max: Duration::from_secs(4),
            });
        let start = Instant::now();

        assert_ok!(
            wait_for_state(&config, scripted(vec!["9:", "9:", "9:", "9:", "6:"], calls)).await
        );

        // Waits of 1, 2, 4 and 4 seconds.
        assert_eq!(start.elapsed(), Duration::from_secs(11));
    }

    #[test]
    fn test_backoff_next() {
        let fixed = Backoff::Fixed;
        assert_eq!(fixed.next(Duration::from_secs(3)), Duration::from_secs(3));

        let exp = Backoff::Exponential {
            max: Duration::from_secs(10),
        };
        assert_eq!(exp.next(Duration::from_secs(3)), Duration::from_secs(6));
        assert_eq!(exp.next(Duration::from_secs(6)), Duration::from_secs(10));
    }

    #[test]
    fn test_poll_error_into_provider_error() {
        let timeout: PollError<String, ProviderError> = PollError::Timeout {
            last_state: "6:".to_string(),
            target: states(&["4:"]),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            ProviderError::from(timeout),
            ProviderError::DeadlineExceeded(_)
        ));

        let unexpected: PollError<String, ProviderError> = PollError::UnexpectedState {
            state: "8:".to_string(),
            target: states(&["6:"]),
        };
        assert!(matches!(
            ProviderError::from(unexpected),
            ProviderError::FailedPrecondition(_)
        ));

        let probe: PollError<String, ProviderError> =
            PollError::Probe(ProviderError::NotFound("machines/abc".to_string()));
        assert!(ProviderError::from(probe).is_not_found());
    }

    #[test]
    fn test_string_prefix_matching() {
        assert!("6:Deployed".to_string().matches(&"6:".to_string()));
        assert!(!"16:".to_string().matches(&"6:".to_string()));
    }
}
