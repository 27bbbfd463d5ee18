//! Rate-limited API key pool
//!
//! Every key carries its own token bucket (a governor direct rate limiter).
//! [`KeyPool::select`] hands out the best key that can be used right now and
//! waits for the earliest refill when every bucket is empty.
//!
//! # Example
//!
//! ```no_run
//! use coc_tracker::tracker::keys::{default_quota, KeyPool};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = KeyPool::load_from_file("keys.txt".as_ref(), default_quota()).await?;
//! let cancel = CancellationToken::new();
//! let key = pool.select(&cancel).await?;
//! println!("using {key:?}");
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Tokens refilled per second for every key
pub const DEFAULT_RATE_PER_SECOND: u32 = 1;

/// Bucket size for every key
pub const DEFAULT_BURST: u32 = 35;

/// Pause between sweeps when no key reports a usable wait time
const RESERVATION_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Lower bound for a sleep in the blocking phase, avoids spinning on zero waits
const MIN_WAIT: Duration = Duration::from_millis(1);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Errors produced by the key pool
#[derive(Error, Debug)]
pub enum KeyPoolError {
    /// The key file could not be read
    #[error("Failed to read key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The key source contained no usable key
    #[error("No API keys loaded from {0}")]
    NoKeys(String),

    /// Rate or burst of zero
    #[error("Invalid key quota: rate and burst must be greater than 0")]
    InvalidQuota,

    /// The caller's cancellation token fired while waiting for a key
    #[error("Key selection cancelled")]
    Cancelled,
}

impl KeyPoolError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Build the per-key quota
///
/// Returns `None` when either value is zero.
pub fn quota(rate_per_second: u32, burst: u32) -> Option<Quota> {
    let rate = NonZeroU32::new(rate_per_second)?;
    let burst = NonZeroU32::new(burst)?;
    Some(Quota::per_second(rate).allow_burst(burst))
}

/// Quota used when nothing else is configured (1 request/second, burst of 35)
pub fn default_quota() -> Quota {
    quota(DEFAULT_RATE_PER_SECOND, DEFAULT_BURST)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
}

/// Split a newline-delimited key list into keys
///
/// Lines are trimmed and blank lines are dropped.
pub fn parse_keys(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// An API credential handed out by the pool
///
/// `Debug` and `Display` only ever show a masked form.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// The raw secret, for building the request
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Masked representation safe for logs
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 4 {
            return "****".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{tail}")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiKey").field(&self.masked()).finish()
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Usage counter snapshot for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUsage {
    /// Masked key
    pub key: String,

    /// Number of times the key was handed out
    pub times_used: u64,
}

struct KeyEntry {
    key: ApiKey,
    limiter: DirectLimiter,
    burst: u32,
    times_used: AtomicU64,
}

impl KeyEntry {
    fn new(key: String, quota: Quota) -> Self {
        Self {
            key: ApiKey(key),
            limiter: RateLimiter::direct(quota),
            burst: quota.burst_size().get(),
            times_used: AtomicU64::new(0),
        }
    }

    fn hand_out(&self) -> ApiKey {
        self.times_used.fetch_add(1, Ordering::Relaxed);
        self.key.clone()
    }
}

enum Sweep {
    Granted(usize),
    Wait(Duration),
}

/// Pool of API keys with independent throttles
///
/// The limiters update their state with atomic compare-and-swap, so the
/// pool can be shared behind an `Arc` without an outer lock.
pub struct KeyPool {
    /// Kept in descending burst order; equal bursts keep source order
    keys: Vec<KeyEntry>,
}

impl KeyPool {
    /// Build a pool where every key shares the same quota
    pub fn from_keys<I>(keys: I, quota: Quota) -> Result<Self, KeyPoolError>
    where
        I: IntoIterator<Item = String>,
    {
        Self::from_entries(keys.into_iter().map(|key| (key, quota)))
    }

    /// Build a pool with an individual quota per key
    pub fn from_entries<I>(entries: I) -> Result<Self, KeyPoolError>
    where
        I: IntoIterator<Item = (String, Quota)>,
    {
        let mut keys: Vec<KeyEntry> = entries
            .into_iter()
            .map(|(key, quota)| KeyEntry::new(key, quota))
            .collect();

        if keys.is_empty() {
            return Err(KeyPoolError::NoKeys("key list".to_string()));
        }

        keys.sort_by(|a, b| b.burst.cmp(&a.burst));

        Ok(Self { keys })
    }

    /// Load a newline-delimited key file
    ///
    /// # Errors
    ///
    /// Returns `KeyPoolError::Io` if the file cannot be read and
    /// `KeyPoolError::NoKeys` if it holds no key.
    pub async fn load_from_file(path: &Path, quota: Quota) -> Result<Self, KeyPoolError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| KeyPoolError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let keys = parse_keys(&content);
        if keys.is_empty() {
            return Err(KeyPoolError::NoKeys(path.display().to_string()));
        }

        Self::from_keys(keys, quota)
    }

    /// Number of keys in the pool
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false for a constructed pool
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Take a key if one is usable right now
    ///
    /// Only the returned key consumes a token.
    pub fn try_select(&self) -> Option<ApiKey> {
        self.keys
            .iter()
            .find(|entry| entry.limiter.check().is_ok())
            .map(KeyEntry::hand_out)
    }

    /// Take a key, waiting for a refill if every bucket is empty
    ///
    /// # Errors
    ///
    /// Returns `KeyPoolError::Cancelled` if `cancel` fires while waiting.
    pub async fn select(&self, cancel: &CancellationToken) -> Result<ApiKey, KeyPoolError> {
        loop {
            if cancel.is_cancelled() {
                return Err(KeyPoolError::Cancelled);
            }

            let wait = match self.sweep() {
                Sweep::Granted(index) => return Ok(self.keys[index].hand_out()),
                Sweep::Wait(wait) => wait,
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "All keys throttled, waiting");

            tokio::select! {
                _ = cancel.cancelled() => return Err(KeyPoolError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Usage counters, in pool order
    pub fn usage(&self) -> Vec<KeyUsage> {
        self.keys
            .iter()
            .map(|entry| KeyUsage {
                key: entry.key.masked(),
                times_used: entry.times_used.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn sweep(&self) -> Sweep {
        let now = DefaultClock::default().now();
        let mut shortest: Option<Duration> = None;

        for (index, entry) in self.keys.iter().enumerate() {
            match entry.limiter.check() {
                Ok(()) => return Sweep::Granted(index),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(now);
                    shortest = Some(shortest.map_or(wait, |current| current.min(wait)));
                }
            }
        }

        Sweep::Wait(
            shortest
                .map(|wait| wait.max(MIN_WAIT))
                .unwrap_or(RESERVATION_RETRY_INTERVAL),
        )
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.usage())
            .finish()
    }
}
