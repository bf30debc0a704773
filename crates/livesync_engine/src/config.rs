//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Longest TTL the authority accepts by default (one year).
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for a sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Items fetched per page by iterators.
    pub page_size: u32,
    /// Largest TTL accepted by client-side validation.
    pub max_ttl: Duration,
    /// Maximum number of objects per subscribe command.
    pub subscription_batch_size: usize,
    /// Backoff policy for subscription attempts.
    pub subscription_retry: RetryConfig,
    /// Retry policy for mutate-with-merge.
    pub mutate: MutateConfig,
    /// Number of items an iterator's producer may buffer ahead of the reader.
    pub iterator_buffer: usize,
}

impl SyncConfig {
    /// Creates a new sync configuration with default settings.
    pub fn new() -> Self {
        Self {
            page_size: 100,
            max_ttl: DEFAULT_MAX_TTL,
            subscription_batch_size: 1000,
            subscription_retry: RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(10)),
            mutate: MutateConfig::default(),
            iterator_buffer: 100,
        }
    }

    /// Sets the iterator page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the maximum TTL accepted by validation.
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Sets the subscribe batch size.
    pub fn with_subscription_batch_size(mut self, size: usize) -> Self {
        self.subscription_batch_size = size.max(1);
        self
    }

    /// Sets the subscription retry policy.
    pub fn with_subscription_retry(mut self, retry: RetryConfig) -> Self {
        self.subscription_retry = retry;
        self
    }

    /// Sets the mutate-with-merge policy.
    pub fn with_mutate(mut self, mutate: MutateConfig) -> Self {
        self.mutate = mutate;
        self
    }

    /// Sets the iterator buffer depth.
    pub fn with_iterator_buffer(mut self, buffer: usize) -> Self {
        self.iterator_buffer = buffer.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `None` retries until shutdown.
    pub max_attempts: Option<u32>,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries until shutdown.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::new(0)
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if attempt number `attempt` (1-indexed) is allowed.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for mutate-with-merge.
#[derive(Debug, Clone)]
pub struct MutateConfig {
    /// Attempts before a conflict is surfaced to the caller.
    pub max_attempts: u32,
    /// Pause between attempts. Only the delays are used; the attempt
    /// bound is `max_attempts`.
    pub retry: RetryConfig,
}

impl MutateConfig {
    /// Creates a new mutate configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry: RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(500)),
        }
    }

    /// Sets the delay policy between attempts.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = RetryConfig {
            max_attempts: None,
            ..retry
        };
        self
    }
}

impl Default for MutateConfig {
    fn default() -> Self {
        Self::new(8)
    }
}
