//! Fixed-window request limiting keyed by client IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Windows are pruned once this many clients are tracked.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: u64,
    count: u32,
}

pub struct RateLimiter {
    max_requests: u32,
    window_secs: u64,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs: window_secs.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts a request from `ip`. Returns `false` once the window is spent.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.check_at(ip, now)
    }

    pub fn check_at(&self, ip: IpAddr, now_secs: u64) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() > PRUNE_THRESHOLD {
            let span = self.window_secs;
            windows.retain(|_, w| now_secs < w.started.saturating_add(span));
        }

        let window = windows.entry(ip).or_insert(Window {
            started: now_secs,
            count: 0,
        });
        if now_secs >= window.started.saturating_add(self.window_secs) {
            *window = Window {
                started: now_secs,
                count: 0,
            };
        }

        window.count = window.count.saturating_add(1);
        window.count <= self.max_requests
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
