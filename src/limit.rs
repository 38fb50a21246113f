//! Source rate limiting.
//!
//! [`IpLimiter`] keeps one bounded counting window per source address. A
//! background sweeper evicts windows of sources that went quiet, bounding
//! memory under address churn.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often stale per-IP windows are swept out.
const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u64,
}

/// Per-source-IP bounded-window rate limiter.
pub struct IpLimiter {
    max: u64,
    interval: Duration,
    lookup: Mutex<HashMap<IpAddr, Window>>,
}

impl IpLimiter {
    pub fn new(max: u64, interval: Duration) -> Self {
        Self {
            max,
            interval,
            lookup: Mutex::new(HashMap::new()),
        }
    }

    /// Record one packet from `ip` and decide whether it is allowed.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_n(ip, 1)
    }

    /// Record `n` packets from `ip` and decide whether they are allowed.
    pub fn allow_n(&self, ip: IpAddr, n: u64) -> bool {
        self.allow_n_at(ip, n, Instant::now())
    }

    fn allow_n_at(&self, ip: IpAddr, n: u64, now: Instant) -> bool {
        let mut lookup = self.lookup.lock();

        let window = lookup.entry(ip).or_insert(Window {
            started_at: now,
            count: 0,
        });

        // Roll an expired window forward; the new samples count toward the
        // fresh window.
        if now.duration_since(window.started_at) > self.interval {
            window.started_at = now;
            window.count = 0;
        }

        window.count += n;
        window.count <= self.max
    }

    /// Remove windows that started more than one interval ago.
    fn sweep_at(&self, now: Instant) {
        let mut lookup = self.lookup.lock();
        let before = lookup.len();

        lookup.retain(|_, window| now.duration_since(window.started_at) <= self.interval);

        let evicted = before - lookup.len();
        if evicted > 0 {
            debug!(evicted, tracked = lookup.len(), "swept stale limiter windows");
        }
    }

    /// Spawn the background sweeper; it runs until `cancel` fires.
    pub fn spawn_gc(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.sweep_at(Instant::now()),
                }
            }
        });
    }
}

/// Global variant of [`IpLimiter`] without the per-source dimension.
pub struct Limiter {
    max: u64,
    interval: Duration,
    window: Mutex<Window>,
}

impl Limiter {
    pub fn new(max: u64, interval: Duration) -> Self {
        Self {
            max,
            interval,
            window: Mutex::new(Window {
                started_at: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    pub fn allow_n(&self, n: u64) -> bool {
        self.allow_n_at(n, Instant::now())
    }

    fn allow_n_at(&self, n: u64, now: Instant) -> bool {
        let mut window = self.window.lock();

        if now.duration_since(window.started_at) > self.interval {
            window.started_at = now;
            window.count = 0;
        }

        window.count += n;
        window.count <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_allows_up_to_max_within_window() {
        let limiter = IpLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_n_at(ip(1), 1, now));
        assert!(limiter.allow_n_at(ip(1), 1, now));
        assert!(limiter.allow_n_at(ip(1), 1, now));
        assert!(!limiter.allow_n_at(ip(1), 1, now));
        assert!(!limiter.allow_n_at(ip(1), 1, now));
    }

    #[test]
    fn test_sources_are_limited_independently() {
        let limiter = IpLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_n_at(ip(1), 1, now));
        assert!(!limiter.allow_n_at(ip(1), 1, now));
        assert!(limiter.allow_n_at(ip(2), 1, now));
    }

    #[test]
    fn test_window_resets_after_interval() {
        let limiter = IpLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.allow_n_at(ip(1), 2, start));
        assert!(!limiter.allow_n_at(ip(1), 1, start));

        // Just past the interval the window rolls and counting restarts at 1.
        let later = start + Duration::from_secs(61);
        assert!(limiter.allow_n_at(ip(1), 1, later));
        assert!(limiter.allow_n_at(ip(1), 1, later));
        assert!(!limiter.allow_n_at(ip(1), 1, later));
    }

    #[test]
    fn test_batch_that_crosses_max_is_denied() {
        let limiter = IpLimiter::new(5, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_n_at(ip(1), 5, now));
        assert!(!limiter.allow_n_at(ip(1), 2, now));
    }

    #[test]
    fn test_sweep_evicts_only_stale_windows() {
        let limiter = IpLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();

        limiter.allow_n_at(ip(1), 1, start);
        limiter.allow_n_at(ip(2), 1, start + Duration::from_secs(50));

        limiter.sweep_at(start + Duration::from_secs(70));

        assert_eq!(limiter.lookup.lock().len(), 1);
        assert!(limiter.lookup.lock().contains_key(&ip(2)));
    }

    #[test]
    fn test_global_limiter_window() {
        let limiter = Limiter::new(2, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_n_at(1, now));
        assert!(limiter.allow_n_at(1, now));
        assert!(!limiter.allow_n_at(1, now));

        assert!(limiter.allow_n_at(1, now + Duration::from_secs(61)));
    }
}
