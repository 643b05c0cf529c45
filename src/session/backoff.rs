use crate::config::BackoffConfig;
use chrono::Local;
use std::time::Duration;

type JitterSource = Box<dyn FnMut() -> f64 + Send>;

/// Exponential reconnect delay with jitter
///
/// Successive delays never shrink until [`Backoff::reset`], and never exceed
/// the cap.
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    jitter: f64,
    attempt: u32,
    last: Duration,
    /// Uniform sample in [0, 1)
    sample: JitterSource,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("base", &self.base)
            .field("factor", &self.factor)
            .field("cap", &self.cap)
            .field("attempt", &self.attempt)
            .field("last", &self.last)
            .finish()
    }
}

/// Sub-second clock noise; enough to spread pendants restarted together
fn clock_jitter() -> f64 {
    f64::from(Local::now().timestamp_subsec_nanos() % 1_000_000_000) / 1e9
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::with_jitter_source(config, clock_jitter)
    }

    pub fn with_jitter_source(
        config: &BackoffConfig,
        sample: impl FnMut() -> f64 + Send + 'static,
    ) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            factor: config.factor.max(1.0),
            cap: Duration::from_millis(config.cap_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
            last: Duration::ZERO,
            sample: Box::new(sample),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let nominal = self.base.as_secs_f64() * self.factor.powi(exponent);
        let noise = (self.sample)().clamp(0.0, 1.0);
        let jittered = nominal * (1.0 + self.jitter * noise);
        let capped = Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64()));

        let delay = capped.max(self.last);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
