use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

/// Extra ring capacity beyond the configured request limit, so a window that
/// keeps absorbing rejected requests does not immediately overwrite entries
/// that are still inside the time window.
const WINDOW_SLACK: usize = 10;

/// A window untouched for this long is compacted by the background pass.
const STALE_WINDOW_AGE: Duration = Duration::from_secs(30);

const MIN_COMPACTION_INTERVAL: Duration = Duration::from_secs(30);
const MAX_COMPACTION_INTERVAL: Duration = Duration::from_secs(300);

/// Per-host admission counter. `observe` records the access and reports
/// whether the caller was already at its limit; the current request is
/// recorded even when rejected.
pub trait Limiter: Send + Sync {
    fn observe(&self, ip: &str) -> bool;
    /// Stops background work. Safe to call more than once.
    fn close(&self);
}

/// Counter bound to hosts configured with the (-1, -1) sentinel pair.
pub struct UnlimitedLimiter;

impl Limiter for UnlimitedLimiter {
    fn observe(&self, _ip: &str) -> bool {
        false
    }

    fn close(&self) {}
}

/// Fixed-capacity circular buffer of access timestamps for one client.
/// The `count` live entries starting at `head` are in arrival order.
struct AccessWindow {
    accesses: Vec<Instant>,
    head: usize,
    tail: usize,
    count: usize,
    capacity: usize,
    last_compaction: Instant,
}

impl AccessWindow {
    fn new(capacity: usize) -> Self {
        Self {
            accesses: vec![Instant::now(); capacity],
            head: 0,
            tail: 0,
            count: 0,
            capacity,
            last_compaction: Instant::now(),
        }
    }

    fn add(&mut self, t: Instant) {
        self.accesses[self.tail] = t;
        self.tail = (self.tail + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        } else {
            // Ring is full, the oldest entry is overwritten.
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// Counts live entries strictly after `cutoff`. `None` means the process
    /// has not been up for a full window yet, so everything is live.
    fn count_valid(&self, cutoff: Option<Instant>) -> usize {
        let mut valid = 0;
        for i in 0..self.count {
            let idx = (self.head + i) % self.capacity;
            if cutoff.is_none_or(|c| self.accesses[idx] > c) {
                valid += 1;
            }
        }
        valid
    }

    /// Advances `head` past contiguous entries at or before `cutoff`.
    fn compact(&mut self, cutoff: Option<Instant>) {
        if let Some(cutoff) = cutoff {
            while self.count > 0 && self.accesses[self.head] <= cutoff {
                self.head = (self.head + 1) % self.capacity;
                self.count -= 1;
            }
        }
        self.last_compaction = Instant::now();
    }
}

/// Sliding-window per-IP rate limiter: one ring buffer of timestamps per
/// client, all behind a single write lock. A companion thread compacts stale
/// windows and drops empty ones so steady-state memory stays proportional to
/// the set of IPs active within the window.
pub struct SlidingWindowLimiter {
    windows: RwLock<HashMap<String, AccessWindow>>,
    window: Duration,
    max_requests: usize,
    shutdown: Mutex<Option<Sender<()>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window_secs: u64, max_requests: usize) -> Arc<Self> {
        let (tx, rx) = channel::<()>();
        let limiter = Arc::new(Self {
            windows: RwLock::new(HashMap::new()),
            window: Duration::from_secs(window_secs),
            max_requests,
            shutdown: Mutex::new(Some(tx)),
        });

        let interval = (limiter.window / 2).clamp(MIN_COMPACTION_INTERVAL, MAX_COMPACTION_INTERVAL);
        let worker = limiter.clone();
        thread::spawn(move || {
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => worker.compact_stale(),
                    // Sender taken by close(), or dropped with the limiter.
                    _ => break,
                }
            }
        });

        limiter
    }

    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.window)
    }

    /// Background pass: compact windows not touched recently and drop the
    /// ones that emptied out.
    fn compact_stale(&self) {
        let now = Instant::now();
        let cutoff = self.cutoff(now);

        let mut windows = self.windows.write();
        let before = windows.len();
        windows.retain(|_, window| {
            if window.last_compaction.elapsed() < STALE_WINDOW_AGE {
                return true;
            }
            window.compact(cutoff);
            window.count > 0
        });
        if windows.len() < before {
            debug!("compaction dropped {} idle window(s)", before - windows.len());
        }
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.windows.read().len()
    }
}

impl Limiter for SlidingWindowLimiter {
    fn observe(&self, ip: &str) -> bool {
        let now = Instant::now();
        let cutoff = self.cutoff(now);

        let mut windows = self.windows.write();
        let window = windows
            .entry(ip.to_string())
            .or_insert_with(|| AccessWindow::new(self.max_requests + WINDOW_SLACK));

        if window.last_compaction.elapsed() > self.window / 4 {
            window.compact(cutoff);
        }

        let valid = window.count_valid(cutoff);
        window.add(now);

        valid >= self.max_requests
    }

    fn close(&self) {
        // Taking the sender disconnects the channel and ends the thread.
        let _ = self.shutdown.lock().take();
    }
}
