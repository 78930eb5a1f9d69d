//! Epsilon-greedy host selection with linear time decay
//!
//! Every host keeps a short ring of time buckets counting successes and
//! failures. A bucket's weight falls linearly from 1 to 0 as it ages through
//! the decay window, so old failures stop counting. `get` usually returns the
//! best-scoring host and sometimes a random one, which lets recovered hosts
//! back into rotation.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use super::config::Host;
use crate::error::DriverError;

/// Buckets per host; each covers a fifth of the decay window
pub const BUCKET_COUNT: usize = 5;

#[derive(Debug, Clone)]
struct Bucket {
    start: Instant,
    successes: u32,
    failures: u32,
}

#[derive(Debug, Clone)]
struct HostEntry {
    host: Host,
    buckets: VecDeque<Bucket>,
    last_mark: Option<Instant>,
    active: bool,
}

impl HostEntry {
    fn new(host: Host) -> Self {
        Self {
            host,
            buckets: VecDeque::with_capacity(BUCKET_COUNT),
            last_mark: None,
            active: true,
        }
    }

    fn record(&mut self, now: Instant, success: bool, decay: Duration) {
        let width = decay / BUCKET_COUNT as u32;
        let fits = self
            .buckets
            .back()
            .is_some_and(|b| now.saturating_duration_since(b.start) < width);
        if !fits {
            self.buckets.push_back(Bucket {
                start: now,
                successes: 0,
                failures: 0,
            });
            while self.buckets.len() > BUCKET_COUNT {
                self.buckets.pop_front();
            }
        }

        if let Some(bucket) = self.buckets.back_mut() {
            if success {
                bucket.successes += 1;
            } else {
                bucket.failures += 1;
            }
        }
        self.last_mark = Some(now);
    }

    /// Weighted share of successes; 1.0 without recent observations
    fn score(&self, now: Instant, decay: Duration) -> f64 {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for bucket in &self.buckets {
            let age = now.saturating_duration_since(bucket.start);
            let weight = (1.0 - age.as_secs_f64() / decay.as_secs_f64()).clamp(0.0, 1.0);
            weighted += weight * f64::from(bucket.successes);
            total += weight * f64::from(bucket.successes + bucket.failures);
        }

        if total > 0.0 {
            weighted / total
        } else {
            1.0
        }
    }

    fn expired(&self, now: Instant, decay: Duration) -> bool {
        self.last_mark
            .map_or(true, |last| now.saturating_duration_since(last) >= decay)
    }
}

struct Inner {
    hosts: Vec<HostEntry>,
    rng: StdRng,
    closed: bool,
}

pub struct HostPool {
    epsilon: f64,
    decay: Duration,
    inner: Mutex<Inner>,
}

impl HostPool {
    pub fn new(hosts: Vec<Host>, epsilon: f64, decay: Duration) -> Self {
        Self::with_rng(hosts, epsilon, decay, StdRng::from_entropy())
    }

    /// Deterministic random choices
    pub fn with_seed(hosts: Vec<Host>, epsilon: f64, decay: Duration, seed: u64) -> Self {
        Self::with_rng(hosts, epsilon, decay, StdRng::seed_from_u64(seed))
    }

    fn with_rng(hosts: Vec<Host>, epsilon: f64, decay: Duration, rng: StdRng) -> Self {
        let mut entries: Vec<HostEntry> = Vec::with_capacity(hosts.len());
        for host in hosts {
            if !entries.iter().any(|e| e.host == host) {
                entries.push(HostEntry::new(host));
            }
        }

        Self {
            epsilon: epsilon.clamp(0.0, 1.0),
            decay: decay.max(Duration::from_millis(BUCKET_COUNT as u64)),
            inner: Mutex::new(Inner {
                hosts: entries,
                rng,
                closed: false,
            }),
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn decay(&self) -> Duration {
        self.decay
    }

    /// Pick a host to send the next query to
    pub fn get(&self) -> Option<Host> {
        self.get_at(&[], Instant::now())
    }

    /// Like [`HostPool::get`], but passes over `tried` while any other active
    /// host remains
    pub fn get_excluding(&self, tried: &[Host]) -> Option<Host> {
        self.get_at(tried, Instant::now())
    }

    fn get_at(&self, tried: &[Host], now: Instant) -> Option<Host> {
        let mut inner = self.inner.lock();
        let Inner { hosts, rng, .. } = &mut *inner;

        let mut active: Vec<&HostEntry> = hosts
            .iter()
            .filter(|e| e.active && !tried.contains(&e.host))
            .collect();
        if active.is_empty() {
            active = hosts.iter().filter(|e| e.active).collect();
        }
        if active.is_empty() {
            return None;
        }

        if rng.gen::<f64>() < self.epsilon {
            let index = rng.gen_range(0..active.len());
            return Some(active[index].host.clone());
        }

        let mut best = active[0];
        let mut best_score = best.score(now, self.decay);
        for &entry in &active[1..] {
            let score = entry.score(now, self.decay);
            if score > best_score {
                best = entry;
                best_score = score;
            }
        }
        Some(best.host.clone())
    }

    /// Record the outcome of a query sent to `host`.
    ///
    /// Only connection errors count against the host; any other error means
    /// the server answered.
    pub fn mark(&self, host: &Host, err: Option<&DriverError>) {
        let success = !err.is_some_and(DriverError::is_connection_error);
        self.mark_at(host, success, Instant::now());
    }

    fn mark_at(&self, host: &Host, success: bool, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.hosts.iter_mut().find(|e| e.host == *host) {
            entry.record(now, success, self.decay);
        }
    }

    /// Make exactly `hosts` active. Dropped hosts keep their history until it decays.
    pub fn set_hosts(&self, hosts: Vec<Host>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        for entry in inner.hosts.iter_mut() {
            entry.active = hosts.contains(&entry.host);
        }
        for host in hosts {
            if !inner.hosts.iter().any(|e| e.host == host) {
                inner.hosts.push(HostEntry::new(host));
            }
        }
        let decay = self.decay;
        inner.hosts.retain(|e| e.active || !e.expired(now, decay));
    }

    pub fn add_host(&self, host: Host) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        match inner.hosts.iter_mut().find(|e| e.host == host) {
            Some(entry) => entry.active = true,
            None => inner.hosts.push(HostEntry::new(host)),
        }
    }

    pub fn remove_host(&self, host: &Host) {
        let now = Instant::now();
        let decay = self.decay;
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.hosts.iter_mut().find(|e| e.host == *host) {
            entry.active = false;
        }
        inner.hosts.retain(|e| e.active || !e.expired(now, decay));
    }

    /// Active hosts in insertion order
    pub fn hosts(&self) -> Vec<Host> {
        self.inner
            .lock()
            .hosts
            .iter()
            .filter(|e| e.active)
            .map(|e| e.host.clone())
            .collect()
    }

    pub fn score(&self, host: &Host) -> Option<f64> {
        self.score_at(host, Instant::now())
    }

    fn score_at(&self, host: &Host, now: Instant) -> Option<f64> {
        self.inner
            .lock()
            .hosts
            .iter()
            .find(|e| e.host == *host)
            .map(|e| e.score(now, self.decay))
    }

    /// Forget every observation
    pub fn reset_all(&self) {
        for entry in self.inner.lock().hosts.iter_mut() {
            entry.buckets.clear();
            entry.last_mark = None;
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.hosts.clear();
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("epsilon", &self.epsilon)
            .field("decay", &self.decay)
            .field("hosts", &self.hosts())
            .finish()
    }
}
