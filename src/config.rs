//! Runtime configuration loaded from environment variables.
//!
//! Every knob has a default so the server starts with nothing set. Values
//! that fail to parse fall back to the default; values that parse but make
//! no sense together are rejected by [`SyncConfig::validate`].

use std::time::Duration;

use crate::doc::codec::FragmentLimits;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_FLUSH_QUIET_MS: u64 = 2_000;
const DEFAULT_FLUSH_MAX_STALENESS_MS: u64 = 30_000;
const DEFAULT_FLUSH_RETRY_BASE_MS: u64 = 500;
const DEFAULT_FLUSH_RETRY_MAX_MS: u64 = 30_000;
const DEFAULT_ROOM_GRACE_MS: u64 = 10_000;
const DEFAULT_ROOM_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_HYDRATION_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MUTATION_RATE_PER_SEC: f64 = 50.0;
const DEFAULT_MUTATION_BURST: f64 = 500.0;
const DEFAULT_AWARENESS_RATE_PER_SEC: f64 = 120.0;
const DEFAULT_AWARENESS_BURST: f64 = 240.0;
const DEFAULT_AWARENESS_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_AWARENESS_SWEEP_MS: u64 = 1_000;
const DEFAULT_MAX_FRAGMENT_OPS: usize = 500;
const DEFAULT_MAX_FIELD_BYTES: usize = 256 * 1024;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("FLUSH_QUIET_MS must not exceed FLUSH_MAX_STALENESS_MS")]
    QuietExceedsStaleness,
    #[error("FLUSH_RETRY_BASE_MS must not exceed FLUSH_RETRY_MAX_MS")]
    RetryBaseExceedsMax,
    #[error("AWARENESS_SWEEP_MS must not exceed AWARENESS_TIMEOUT_MS")]
    SweepExceedsTimeout,
    #[error("MAX_FRAGMENT_OPS must not exceed MUTATION_BURST")]
    OpsExceedBurst,
}

/// Debounce and retry timing for one room's flushes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushConfig {
    /// Quiet interval after the last edit before a flush.
    pub quiet: Duration,
    /// Upper bound on how long an edit may stay unflushed.
    pub max_staleness: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

/// Token-bucket parameters for one traffic class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub rate_per_sec: f64,
    pub burst: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub port: u16,
    /// `None` runs with the in-memory snapshot store and open access.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub flush: FlushConfig,
    /// How long an empty room stays alive waiting for a rejoin.
    pub room_grace: Duration,
    pub room_queue_capacity: usize,
    pub client_queue_capacity: usize,
    pub hydration_timeout: Duration,
    pub mutation_bucket: BucketConfig,
    pub awareness_bucket: BucketConfig,
    pub awareness_timeout: Duration,
    pub awareness_sweep: Duration,
    pub fragment_limits: FragmentLimits,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            flush: FlushConfig {
                quiet: Duration::from_millis(DEFAULT_FLUSH_QUIET_MS),
                max_staleness: Duration::from_millis(DEFAULT_FLUSH_MAX_STALENESS_MS),
                retry_base: Duration::from_millis(DEFAULT_FLUSH_RETRY_BASE_MS),
                retry_max: Duration::from_millis(DEFAULT_FLUSH_RETRY_MAX_MS),
            },
            room_grace: Duration::from_millis(DEFAULT_ROOM_GRACE_MS),
            room_queue_capacity: DEFAULT_ROOM_QUEUE_CAPACITY,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            hydration_timeout: Duration::from_millis(DEFAULT_HYDRATION_TIMEOUT_MS),
            mutation_bucket: BucketConfig { rate_per_sec: DEFAULT_MUTATION_RATE_PER_SEC, burst: DEFAULT_MUTATION_BURST },
            awareness_bucket: BucketConfig {
                rate_per_sec: DEFAULT_AWARENESS_RATE_PER_SEC,
                burst: DEFAULT_AWARENESS_BURST,
            },
            awareness_timeout: Duration::from_millis(DEFAULT_AWARENESS_TIMEOUT_MS),
            awareness_sweep: Duration::from_millis(DEFAULT_AWARENESS_SWEEP_MS),
            fragment_limits: FragmentLimits { max_ops: DEFAULT_MAX_FRAGMENT_OPS, max_field_bytes: DEFAULT_MAX_FIELD_BYTES },
        }
    }
}

impl SyncConfig {
    /// Read every knob from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            flush: FlushConfig {
                quiet: env_ms("FLUSH_QUIET_MS", DEFAULT_FLUSH_QUIET_MS),
                max_staleness: env_ms("FLUSH_MAX_STALENESS_MS", DEFAULT_FLUSH_MAX_STALENESS_MS),
                retry_base: env_ms("FLUSH_RETRY_BASE_MS", DEFAULT_FLUSH_RETRY_BASE_MS),
                retry_max: env_ms("FLUSH_RETRY_MAX_MS", DEFAULT_FLUSH_RETRY_MAX_MS),
            },
            room_grace: env_ms("ROOM_GRACE_MS", DEFAULT_ROOM_GRACE_MS),
            room_queue_capacity: env_parse("ROOM_QUEUE_CAPACITY", DEFAULT_ROOM_QUEUE_CAPACITY),
            client_queue_capacity: env_parse("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY),
            hydration_timeout: env_ms("HYDRATION_TIMEOUT_MS", DEFAULT_HYDRATION_TIMEOUT_MS),
            mutation_bucket: BucketConfig {
                rate_per_sec: env_parse("MUTATION_RATE_PER_SEC", DEFAULT_MUTATION_RATE_PER_SEC),
                burst: env_parse("MUTATION_BURST", DEFAULT_MUTATION_BURST),
            },
            awareness_bucket: BucketConfig {
                rate_per_sec: env_parse("AWARENESS_RATE_PER_SEC", DEFAULT_AWARENESS_RATE_PER_SEC),
                burst: env_parse("AWARENESS_BURST", DEFAULT_AWARENESS_BURST),
            },
            awareness_timeout: env_ms("AWARENESS_TIMEOUT_MS", DEFAULT_AWARENESS_TIMEOUT_MS),
            awareness_sweep: env_ms("AWARENESS_SWEEP_MS", DEFAULT_AWARENESS_SWEEP_MS),
            fragment_limits: FragmentLimits {
                max_ops: env_parse("MAX_FRAGMENT_OPS", DEFAULT_MAX_FRAGMENT_OPS),
                max_field_bytes: env_parse("MAX_FIELD_BYTES", DEFAULT_MAX_FIELD_BYTES),
            },
        }
    }

    /// Reject combinations the room and persistence loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, bool); 9] = [
            ("FLUSH_QUIET_MS", self.flush.quiet.is_zero()),
            ("FLUSH_RETRY_BASE_MS", self.flush.retry_base.is_zero()),
            ("ROOM_QUEUE_CAPACITY", self.room_queue_capacity == 0),
            ("CLIENT_QUEUE_CAPACITY", self.client_queue_capacity == 0),
            ("HYDRATION_TIMEOUT_MS", self.hydration_timeout.is_zero()),
            ("MUTATION_RATE_PER_SEC", self.mutation_bucket.rate_per_sec <= 0.0),
            ("AWARENESS_RATE_PER_SEC", self.awareness_bucket.rate_per_sec <= 0.0),
            ("AWARENESS_SWEEP_MS", self.awareness_sweep.is_zero()),
            ("MAX_FRAGMENT_OPS", self.fragment_limits.max_ops == 0),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero(name));
        }
        if self.flush.quiet > self.flush.max_staleness {
            return Err(ConfigError::QuietExceedsStaleness);
        }
        if self.flush.retry_base > self.flush.retry_max {
            return Err(ConfigError::RetryBaseExceedsMax);
        }
        if self.awareness_sweep > self.awareness_timeout {
            return Err(ConfigError::SweepExceedsTimeout);
        }
        // A fragment is charged one token per op; a bigger one could never pass.
        #[allow(clippy::cast_precision_loss)]
        let max_ops = self.fragment_limits.max_ops as f64;
        if max_ops > self.mutation_bucket.burst {
            return Err(ConfigError::OpsExceedBurst);
        }
        Ok(())
    }
}
