//! C11 — CircuitBreaker: generic closed/open/half-open state machine used
//! by BackupService to wrap file I/O (§4.11).

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    cooldown: Duration,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(State::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            failure_threshold,
            cooldown,
            opened_at: Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        self.state.load(Ordering::Acquire).into()
    }

    fn transition_if_cooldown_elapsed(&self) {
        if self.state() == State::Open {
            let elapsed = self.opened_at.lock().unwrap().map(|t| t.elapsed() >= self.cooldown).unwrap_or(false);
            if elapsed {
                self.state.store(State::HalfOpen as u8, Ordering::Release);
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.state.store(State::Closed as u8, Ordering::Release);
    }

    fn record_failure(&self) {
        match self.state() {
            State::HalfOpen => self.trip(),
            _ => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    self.trip();
                }
            }
        }
    }

    fn trip(&self) {
        self.state.store(State::Open as u8, Ordering::Release);
        *self.opened_at.lock().unwrap() = Some(Instant::now());
    }

    /// Runs `op` named `operation` if the breaker allows it; records the
    /// outcome to drive the state machine.
    pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        self.transition_if_cooldown_elapsed();
        if self.state() == State::Open {
            return Err(AppError::BreakerOpen(operation.to_string()));
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            let _ = breaker.execute("op", || async { Err::<(), _>(AppError::BadRequest("x".into())) }).await;
        }
        let result = breaker.execute("op", || async { Ok::<_, AppError>(()) }).await;
        assert!(matches!(result, Err(AppError::BreakerOpen(_))));
    }

    #[tokio::test]
    async fn half_open_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        let _ = breaker.execute("op", || async { Err::<(), _>(AppError::BadRequest("x".into())) }).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = breaker.execute("op", || async { Ok::<_, AppError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        let _ = breaker.execute("op", || async { Err::<(), _>(AppError::BadRequest("x".into())) }).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = breaker.execute("op", || async { Err::<(), _>(AppError::BadRequest("x".into())) }).await;
        assert_eq!(breaker.state(), State::Open);
    }
}
