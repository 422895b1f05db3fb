//! Sliding-window rate limiter keyed by ticket and command hash.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt for `key`. Returns `true` (blocked) once
    /// `max_attempts` attempts already fall inside the window; blocked
    /// attempts are not recorded.
    pub fn hit(&self, key: &str, max_attempts: u32, decay: Duration) -> bool {
        self.hit_at(key, max_attempts, decay, Instant::now())
    }

    /// Expired attempts are dropped for every key on each hit, and keys whose
    /// window is empty are removed.
    pub fn hit_at(&self, key: &str, max_attempts: u32, decay: Duration, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|_, window| {
            while let Some(&oldest) = window.front() {
                if now.saturating_duration_since(oldest) >= decay {
                    window.pop_front();
                } else {
                    break;
                }
            }
            !window.is_empty()
        });

        if max_attempts == 0 {
            return true;
        }
        let window = windows.entry(key.to_string()).or_default();
        if window.len() >= max_attempts as usize {
            return true;
        }
        window.push_back(now);
        false
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
