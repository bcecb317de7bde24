use std::time::Duration;

use duet_common::helpers::env_u64;

use crate::backoff::Backoff;

const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 8_000;
const DEFAULT_RECONNECT_ATTEMPTS: u64 = 5;
const DEFAULT_OFFER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OFFER_RETRIES: u64 = 2;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ACQUIRE_RETRIES: u64 = 2;
const DEFAULT_ACQUIRE_RETRY_MS: u64 = 500;
const DEFAULT_EVENT_QUEUE: u64 = 64;

/// Timing and retry policy for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    /// First reconnection delay; doubles per attempt.
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_attempts: u32,
    /// How long an offer may go unanswered.
    pub offer_timeout: Duration,
    /// Resends of an unanswered offer on a connected call before it is
    /// treated as a lost connection. The first offer is resent until
    /// `connect_timeout` instead.
    pub offer_retries: u32,
    /// Bound on the initial `Connecting` phase.
    pub connect_timeout: Duration,
    /// Extra attempts for a busy capture device.
    pub acquire_retries: u32,
    pub acquire_retry_delay: Duration,
    pub event_queue: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS as u32,
            offer_timeout: Duration::from_millis(DEFAULT_OFFER_TIMEOUT_MS),
            offer_retries: DEFAULT_OFFER_RETRIES as u32,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            acquire_retries: DEFAULT_ACQUIRE_RETRIES as u32,
            acquire_retry_delay: Duration::from_millis(DEFAULT_ACQUIRE_RETRY_MS),
            event_queue: DEFAULT_EVENT_QUEUE as usize,
        }
    }
}

impl CallConfig {
    /// Defaults overridden by `DUET_*` environment variables.
    pub fn from_env() -> Self {
        let ms = |name: &str, default: u64| Duration::from_millis(env_u64(name, default));
        Self {
            reconnect_initial: ms("DUET_RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS)
                .max(Duration::from_millis(10)),
            reconnect_max: ms("DUET_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS),
            reconnect_attempts: env_u64("DUET_RECONNECT_ATTEMPTS", DEFAULT_RECONNECT_ATTEMPTS)
                .min(u32::MAX as u64) as u32,
            offer_timeout: ms("DUET_OFFER_TIMEOUT_MS", DEFAULT_OFFER_TIMEOUT_MS)
                .max(Duration::from_millis(100)),
            offer_retries: env_u64("DUET_OFFER_RETRIES", DEFAULT_OFFER_RETRIES)
                .min(u32::MAX as u64) as u32,
            connect_timeout: ms("DUET_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            acquire_retries: env_u64("DUET_ACQUIRE_RETRIES", DEFAULT_ACQUIRE_RETRIES)
                .min(u32::MAX as u64) as u32,
            acquire_retry_delay: ms("DUET_ACQUIRE_RETRY_MS", DEFAULT_ACQUIRE_RETRY_MS),
            event_queue: env_u64("DUET_EVENT_QUEUE", DEFAULT_EVENT_QUEUE).clamp(1, 4096) as usize,
        }
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            self.reconnect_initial,
            self.reconnect_max,
            self.reconnect_attempts,
        )
    }
}
