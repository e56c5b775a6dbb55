//! Leaky-bucket admission control.
//!
//! Two flavors: a single [`LeakyBucket`] shared by everything behind one
//! server key, and [`IpBuckets`], a per-remote-IP collector with a bounded
//! LRU map so spoofed source addresses cannot grow memory without bound.
//!
//! A bucket holds up to `capacity` tokens and drains at `leak_per_sec`.
//! `try_acquire` debits the full cost atomically or refuses it entirely,
//! so concurrent spikes cannot double-spend capacity.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct BucketState {
    level: f64,
    updated: Instant,
}

impl BucketState {
    fn new(now: Instant) -> Self {
        Self { level: 0.0, updated: now }
    }

    fn try_acquire(&mut self, cost: f64, capacity: f64, leak_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.level = (self.level - elapsed * leak_per_sec).max(0.0);
        self.updated = now;

        if self.level + cost > capacity {
            return false;
        }
        self.level += cost;
        true
    }
}

/// A single leaky bucket.
pub struct LeakyBucket {
    capacity: f64,
    leak_per_sec: f64,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    pub fn new(leak_per_sec: u32, capacity: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            leak_per_sec: f64::from(leak_per_sec),
            state: Mutex::new(BucketState::new(Instant::now())),
        }
    }

    /// Debits `cost` tokens, or refuses without debiting anything.
    pub fn try_acquire(&self, cost: u32) -> bool {
        self.try_acquire_at(cost, Instant::now())
    }

    fn try_acquire_at(&self, cost: u32, now: Instant) -> bool {
        self.state.lock().try_acquire(f64::from(cost), self.capacity, self.leak_per_sec, now)
    }
}

/// A collector of per-IP leaky buckets with LRU-bounded size.
pub struct IpBuckets {
    capacity: f64,
    leak_per_sec: f64,
    buckets: Mutex<LruCache<IpAddr, BucketState>>,
}

impl IpBuckets {
    const MAX_TRACKED_IPS: usize = 100_000;

    pub fn new(leak_per_sec: u32, capacity: u32) -> Self {
        Self::with_max_tracked(leak_per_sec, capacity, Self::MAX_TRACKED_IPS)
    }

    pub fn with_max_tracked(leak_per_sec: u32, capacity: u32, max_tracked: usize) -> Self {
        let cap = NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity: f64::from(capacity),
            leak_per_sec: f64::from(leak_per_sec),
            buckets: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Debits `cost` tokens from the bucket of `ip`, creating it on first
    /// sight and evicting the least recently seen IP at capacity.
    pub fn try_acquire(&self, ip: IpAddr, cost: u32) -> bool {
        self.try_acquire_at(ip, cost, Instant::now())
    }

    fn try_acquire_at(&self, ip: IpAddr, cost: u32, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        if buckets.peek(&ip).is_none() {
            buckets.put(ip, BucketState::new(now));
        }
        let Some(state) = buckets.get_mut(&ip) else {
            return false;
        };
        state.try_acquire(f64::from(cost), self.capacity, self.leak_per_sec, now)
    }

    pub fn tracked_ips(&self) -> usize {
        self.buckets.lock().len()
    }
}
