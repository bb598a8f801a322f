//! Sliding-window rate limiter for write-class operations.
//!
//! Each actor owns an independent window of admission timestamps. The outer
//! map lock is held only long enough to fetch or create the actor's window,
//! so unrelated actors never serialize behind each other's pruning.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateLimitConfig;

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<String, Arc<Mutex<VecDeque<Instant>>>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(cfg.max_requests, cfg.window())
    }

    /// Prune-then-admit: drops timestamps older than the window, then admits
    /// and records the request only if the window has room. Denials leave the
    /// window untouched.
    pub fn admit(&self, actor: &str) -> bool {
        let window = self.window_for(actor);
        let mut stamps = lock_unpoisoned(&window);
        let now = Instant::now();
        self.prune(&mut stamps, now);
        if stamps.len() >= self.max_requests {
            debug!(actor, in_window = stamps.len(), "rate limit exceeded");
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// How many requests the actor could still make right now.
    pub fn remaining(&self, actor: &str) -> usize {
        let window = self.window_for(actor);
        let mut stamps = lock_unpoisoned(&window);
        self.prune(&mut stamps, Instant::now());
        self.max_requests.saturating_sub(stamps.len())
    }

    fn prune(&self, stamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = stamps.front() {
            if now.duration_since(*oldest) < self.window {
                break;
            }
            stamps.pop_front();
        }
    }

    fn window_for(&self, actor: &str) -> Arc<Mutex<VecDeque<Instant>>> {
        let mut map = lock_unpoisoned(&self.windows);
        map.entry(actor.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
