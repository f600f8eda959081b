use serde::{Deserialize, Serialize};
use table_core::Timestamp;

pub const SCROLL_DEBOUNCE_MS: f64 = 500.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scroll {
    pub x: f64,
    pub y: f64,
}

impl Scroll {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn relative_to(self, origin: Scroll) -> Scroll {
        Scroll::new(self.x - origin.x, self.y - origin.y)
    }
}

/// Coalesces grid scroll positions before they are committed to state.
///
/// The first observed position is the origin and committed offsets are
/// relative to it. Clock values are milliseconds from any monotonic source.
#[derive(Debug, Clone)]
pub struct ScrollDebouncer {
    delay: f64,
    origin: Option<Scroll>,
    pending: Option<(Scroll, Timestamp)>,
}

impl Default for ScrollDebouncer {
    fn default() -> Self {
        Self::new(SCROLL_DEBOUNCE_MS)
    }
}

impl ScrollDebouncer {
    pub fn new(delay_ms: f64) -> Self {
        Self {
            delay: delay_ms.max(0.0),
            origin: None,
            pending: None,
        }
    }

    pub fn observe(&mut self, position: Scroll, now: Timestamp) {
        let origin = *self.origin.get_or_insert(position);
        self.pending = Some((position.relative_to(origin), now));
    }

    /// The pending offset, once `delay` has passed since the last observation.
    pub fn poll(&mut self, now: Timestamp) -> Option<Scroll> {
        match self.pending {
            Some((offset, at)) if now - at >= self.delay => {
                self.pending = None;
                Some(offset)
            }
            _ => None,
        }
    }

    /// Milliseconds until `poll` would commit, if anything is pending.
    pub fn remaining(&self, now: Timestamp) -> Option<f64> {
        self.pending
            .map(|(_, at)| (self.delay - (now - at)).max(0.0))
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Forget the origin, e.g. when the grid is remounted.
    pub fn reset(&mut self) {
        self.origin = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_latest_offset_after_quiet_period() {
        let mut d = ScrollDebouncer::default();
        d.observe(Scroll::new(0.0, 40.0), 0.0);
        d.observe(Scroll::new(0.0, 140.0), 100.0);
        d.observe(Scroll::new(10.0, 240.0), 200.0);
        assert_eq!(d.poll(600.0), None);
        assert_eq!(d.remaining(600.0), Some(100.0));
        assert_eq!(d.poll(700.0), Some(Scroll::new(10.0, 200.0)));
        assert_eq!(d.poll(2000.0), None);
    }

    #[test]
    fn cancel_discards_pending() {
        let mut d = ScrollDebouncer::new(50.0);
        d.observe(Scroll::new(0.0, 0.0), 0.0);
        d.observe(Scroll::new(0.0, 5.0), 1.0);
        d.cancel();
        assert_eq!(d.poll(100.0), None);
        assert_eq!(d.remaining(100.0), None);
    }
}
