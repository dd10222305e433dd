use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the given 1-based failed attempt: `base * 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => {
                tracing::error!(
                    label = label,
                    attempts = attempt,
                    error = %err,
                    "giving up after final attempt"
                );
                return Err(err);
            }
            Err(err) => {
                let wait = policy.delay_after(attempt);
                tracing::warn!(
                    label = label,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

pub async fn with_timeout<T, Fut>(duration: Duration, label: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "{} timed out after {:.1}s",
            label,
            duration.as_secs_f64()
        )),
    }
}

pub fn cache_key(parts: &[&str]) -> String {
    format!("{:x}", md5::compute(parts.join("\u{1f}")))
}

/// Bounded map with per-entry expiry. Evicts the oldest insert when full.
#[derive(Debug)]
pub struct TtlCache<V> {
    max_size: usize,
    ttl: Option<Duration>,
    next_seq: u64,
    entries: HashMap<String, CacheEntry<V>>,
}

#[derive(Debug)]
struct CacheEntry<V> {
    inserted: Instant,
    seq: u64,
    value: V,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            next_seq: 0,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        let expired = self
            .ttl
            .map(|ttl| entry.inserted.elapsed() > ttl)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            tracing::debug!(key = key, "cache entry expired");
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: String, value: V) {
        self.next_seq += 1;
        self.entries.insert(
            key,
            CacheEntry {
                inserted: Instant::now(),
                seq: self.next_seq,
                value,
            },
        );
        while self.entries.len() > self.max_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
