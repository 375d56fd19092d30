use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default rotation window for redirect correlation
pub const DEFAULT_TRACE_WINDOW: Duration = Duration::from_secs(60);

const MIN_TRACE_WINDOW: Duration = Duration::from_millis(1);

/// Two generations of `path -> raw request` entries
#[derive(Debug)]
struct Generations {
    current: HashMap<String, String>,
    previous: HashMap<String, String>,
    next_rotation: Instant,
}

impl Generations {
    /// Rotate when the clock has passed the rotation point.
    ///
    /// Rotation points stay aligned to whole windows, so an entry written
    /// during one window survives at most until the end of the next one.
    fn rotate(&mut self, now: Instant, window: Duration) {
        if now < self.next_rotation {
            return;
        }

        let behind = now - self.next_rotation;
        if behind >= window {
            // idle for more than a window: both generations are stale
            self.current.clear();
            self.previous.clear();
        } else {
            self.previous = std::mem::take(&mut self.current);
        }

        let into_window = behind.as_nanos() % window.as_nanos();
        self.next_rotation = now + (window - Duration::from_nanos(into_window as u64));
    }
}

/// Process-wide cache correlating a redirect target path with the request
/// that produced the redirect.
///
/// Writes land in the current generation, reads fall back to the previous
/// one. The clock is checked lazily on every access; no timer task exists.
#[derive(Debug)]
pub struct RedirectTrace {
    window: Duration,
    inner: Mutex<Generations>,
}

impl RedirectTrace {
    /// Create a trace with the default 60 second window
    pub fn new() -> Self {
        Self::with_window(DEFAULT_TRACE_WINDOW)
    }

    /// Create a trace rotating every `window`
    pub fn with_window(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    fn starting_at(window: Duration, start: Instant) -> Self {
        let window = window.max(MIN_TRACE_WINDOW);
        Self {
            window,
            inner: Mutex::new(Generations {
                current: HashMap::new(),
                previous: HashMap::new(),
                next_rotation: start + window,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `request` as the origin of a redirect to `path`
    pub fn set(&self, path: impl Into<String>, request: impl Into<String>) {
        self.set_at(path.into(), request.into(), Instant::now());
    }

    /// Look up the request that redirected to `path`, if still recent
    pub fn get(&self, path: &str) -> Option<String> {
        self.get_at(path, Instant::now())
    }

    fn set_at(&self, path: String, request: String, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.rotate(now, self.window);
        inner.current.insert(path, request);
    }

    fn get_at(&self, path: &str, now: Instant) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.rotate(now, self.window);
        inner
            .current
            .get(path)
            .or_else(|| inner.previous.get(path))
            .cloned()
    }
}

impl Default for RedirectTrace {
    fn default() -> Self {
        Self::new()
    }
}
