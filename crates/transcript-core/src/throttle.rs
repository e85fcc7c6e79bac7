use std::time::{Duration, Instant};

/// Trailing-edge throttle holding the latest value.
///
/// The first push after an idle period arms a deadline `interval` later;
/// pushes before that deadline replace the pending value without moving it.
#[derive(Debug, Clone)]
pub struct TrailingThrottle<T> {
    interval: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> TrailingThrottle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn push(&mut self, value: T, now: Instant) {
        let deadline = match self.pending.take() {
            Some((_, deadline)) => deadline,
            None => now + self.interval,
        };
        self.pending = Some((value, deadline));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, deadline)| *deadline)
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref().map(|(value, _)| value)
    }

    /// Release the pending value once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((_, deadline)) if *deadline <= now => self.pending.take().map(|(value, _)| value),
            _ => None,
        }
    }

    /// Release the pending value immediately.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(value, _)| value)
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(500);

    #[test]
    fn emits_latest_value_on_trailing_edge() {
        let start = Instant::now();
        let mut throttle = TrailingThrottle::new(INTERVAL);
        throttle.push("a", start);
        throttle.push("b", start + Duration::from_millis(200));
        assert_eq!(throttle.deadline(), Some(start + INTERVAL));

        assert_eq!(throttle.poll(start + Duration::from_millis(499)), None);
        assert_eq!(throttle.poll(start + INTERVAL), Some("b"));
        assert_eq!(throttle.poll(start + INTERVAL), None);
    }

    #[test]
    fn rearms_after_release() {
        let start = Instant::now();
        let mut throttle = TrailingThrottle::new(INTERVAL);
        throttle.push(1, start);
        assert_eq!(throttle.poll(start + INTERVAL), Some(1));

        let later = start + Duration::from_secs(2);
        throttle.push(2, later);
        assert_eq!(throttle.deadline(), Some(later + INTERVAL));
    }

    #[test]
    fn flush_and_cancel_clear_pending_value() {
        let start = Instant::now();
        let mut throttle = TrailingThrottle::new(INTERVAL);
        throttle.push(1, start);
        assert_eq!(throttle.flush(), Some(1));
        throttle.push(2, start);
        throttle.cancel();
        assert_eq!(throttle.pending(), None);
        assert_eq!(throttle.deadline(), None);
    }
}
