// src/timer.rs - One-shot monotonic timers for the event loop
use std::future;
use tokio::time::{Duration, Instant, sleep_until};

/// A one-shot relative timer with edge-triggered readiness.
///
/// `fired()` resolves exactly once per arming and clears the deadline as it
/// resolves; while disarmed it never resolves, so it can sit in a `select!`
/// arm permanently. Arming with a non-positive duration disarms.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    deadline: Option<Instant>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    pub fn arm(&mut self, seconds: f64) {
        if seconds <= 0.0 {
            self.deadline = None;
        } else {
            self.deadline = Some(Instant::now() + Duration::from_secs_f64(seconds));
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whole seconds left, rounded up once the fraction exceeds 500 ms.
    /// Disarmed timers report zero.
    pub fn remaining(&self) -> u64 {
        match self.deadline {
            None => 0,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                let secs = left.as_secs();
                if left.subsec_nanos() > 500_000_000 {
                    secs + 1
                } else {
                    secs
                }
            }
        }
    }

    /// Exact time left, for re-arming after a pause.
    pub fn remaining_secs_f64(&self) -> f64 {
        match self.deadline {
            None => 0.0,
            Some(d) => d.saturating_duration_since(Instant::now()).as_secs_f64(),
        }
    }

    /// Resolves when the armed deadline passes, then disarms. Pending forever
    /// while disarmed.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(d) => {
                sleep_until(d).await;
                self.deadline = None;
            }
            None => future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_then_disarms() {
        let mut t = OneShotTimer::new();
        t.arm(2.0);
        assert!(t.is_armed());
        t.fired().await;
        assert!(!t.is_armed());
        assert_eq!(t.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let mut t = OneShotTimer::new();
        tokio::select! {
            _ = t.fired() => panic!("disarmed timer fired"),
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_arm_disarms() {
        let mut t = OneShotTimer::new();
        t.arm(3.0);
        t.arm(0.0);
        assert!(!t.is_armed());
        t.arm(3.0);
        t.arm(-1.0);
        assert!(!t.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_rounds_up_past_half_second() {
        let mut t = OneShotTimer::new();
        t.arm(2.75);
        // 2 s + 750 ms left: rounds up
        assert_eq!(t.remaining(), 3);
        tokio::time::advance(Duration::from_millis(500)).await;
        // 2 s + 250 ms left: rounds down
        assert_eq!(t.remaining(), 2);
        t.fired().await;
        assert_eq!(t.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_is_idempotent() {
        let mut t = OneShotTimer::new();
        t.disarm();
        t.disarm();
        t.arm(1.0);
        t.disarm();
        t.disarm();
        assert!(!t.is_armed());
    }
}
