//! Reconnection backoff: exponential growth with a ceiling, jittered delays,
//! and a mandatory-stop deadline that bounds the wait so user-visible send
//! timeouts can fire before a reconnect attempt completes.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    /// Budget measured from the first attempt after a reset; once exceeded,
    /// the next delay is clamped down to fit inside it.
    mandatory_stop: Duration,
    next: Duration,
    first_attempt: Option<Instant>,
    mandatory_stop_made: bool,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration, mandatory_stop: Duration) -> Self {
        Self {
            initial,
            max,
            mandatory_stop,
            next: initial,
            first_attempt: None,
            mandatory_stop_made: false,
        }
    }

    /// Delay before the next reconnection attempt.
    pub(crate) fn next(&mut self) -> Duration {
        let mut current = self.next;
        self.next = (self.next * 2).min(self.max);

        let first = *self.first_attempt.get_or_insert_with(Instant::now);
        if !self.mandatory_stop_made {
            let elapsed = first.elapsed();
            if elapsed + current > self.mandatory_stop {
                current = self.mandatory_stop.saturating_sub(elapsed).max(self.initial);
                self.mandatory_stop_made = true;
            }
        }

        // Full jitter: draw uniformly from [0, current] so simultaneous
        // clients don't retry in lockstep.
        if current > Duration::ZERO {
            current = current.mul_f64(rand::thread_rng().gen_range(0.0..=1.0));
        }
        current
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.initial;
        self.first_attempt = None;
        self.mandatory_stop_made = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(60), Duration::from_secs(30))
    }

    #[test]
    fn delays_stay_under_the_doubling_ceiling() {
        let mut b = backoff();
        // Ceiling doubles from the initial value and never exceeds the cap.
        let mut ceiling = Duration::from_millis(100);
        for _ in 0..12 {
            let d = b.next();
            assert!(d <= ceiling, "delay {d:?} above ceiling {ceiling:?}");
            ceiling = (ceiling * 2).min(Duration::from_secs(60));
        }
    }

    #[test]
    fn jitter_spans_the_full_range() {
        // With full jitter, first delays are uniform over [0, 100ms]; across
        // many draws both halves of the range must show up.
        let mut low = false;
        let mut high = false;
        for _ in 0..200 {
            let d = backoff().next();
            assert!(d <= Duration::from_millis(100));
            low |= d < Duration::from_millis(40);
            high |= d > Duration::from_millis(60);
        }
        assert!(low, "no delay landed in the lower part of the range");
        assert!(high, "no delay landed in the upper part of the range");
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut b = backoff();
        for _ in 0..5 {
            b.next();
        }
        b.reset();
        assert!(b.next() <= Duration::from_millis(100));
    }

    #[test]
    fn mandatory_stop_caps_a_long_delay() {
        let mut b =
            Backoff::new(Duration::from_millis(100), Duration::from_secs(60), Duration::from_millis(400));
        // Grow past the mandatory stop budget.
        b.next();
        b.next();
        let capped = b.next();
        assert!(capped <= Duration::from_millis(400));
    }
}
