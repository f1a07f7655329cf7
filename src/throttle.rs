//! Admission control for recorded invocations
//!
//! A [`Throttle`] is consulted once per intercepted call and decides whether
//! the call's record is kept for delivery.
//!
//! | Policy | State | Behavior |
//! |--------|-------|----------|
//! | [`Percentage`] | none | admit with probability `p` |
//! | [`Rate`] | window start + count under one mutex | admit at most `n` per fixed window `d` |
//! | [`every`] | as `Rate` | admit one call per interval |
//!
//! # Known limitation
//!
//! `Rate` is a fixed-window counter, not a sliding window. A window opens at
//! the first call after the previous one expired, so up to `2n` calls can be
//! admitted across a window boundary within a span shorter than `d`.

use rand::Rng;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised while configuring a throttle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThrottleError {
    #[error("Percentage must be within [0.0, 1.0], got {0}")]
    FractionOutOfRange(f64),

    #[error("Rate window must be longer than zero")]
    ZeroWindow,
}

/// Admission policy for observed invocations
pub trait Throttle: Send + Sync + fmt::Debug {
    /// `true` when this invocation should be discarded
    fn reject(&self) -> bool;
}

/// Stateless probabilistic sampling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentage {
    fraction: f64,
}

impl Percentage {
    /// Admit each call with probability `fraction`
    pub fn new(fraction: f64) -> Result<Self, ThrottleError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ThrottleError::FractionOutOfRange(fraction));
        }
        Ok(Percentage { fraction })
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }
}

impl Throttle for Percentage {
    fn reject(&self) -> bool {
        // gen::<f64>() is in [0, 1): p = 0 rejects everything, p = 1 nothing
        rand::thread_rng().gen::<f64>() >= self.fraction
    }
}

#[derive(Debug)]
struct Window {
    start: Option<Instant>,
    count: u64,
}

/// Fixed-window rate limiter: at most `max` admissions per `per`
#[derive(Debug)]
pub struct Rate {
    max: u64,
    per: Duration,
    window: Mutex<Window>,
}

impl Rate {
    pub fn new(max: u64, per: Duration) -> Result<Self, ThrottleError> {
        if per.is_zero() {
            return Err(ThrottleError::ZeroWindow);
        }
        Ok(Rate {
            max,
            per,
            window: Mutex::new(Window {
                start: None,
                count: 0,
            }),
        })
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn per(&self) -> Duration {
        self.per
    }

    /// Decide for a call observed at `now`
    ///
    /// Calls must be presented with non-decreasing `now` for the window to
    /// behave as a fixed window.
    pub fn reject_at(&self, now: Instant) -> bool {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let expired = match window.start {
            Some(start) => now.saturating_duration_since(start) >= self.per,
            None => true,
        };
        if expired {
            window.start = Some(now);
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);
        window.count > self.max
    }
}

impl Throttle for Rate {
    fn reject(&self) -> bool {
        self.reject_at(Instant::now())
    }
}

/// Builder for `rate(n).per(d)`
#[derive(Debug, Clone, Copy)]
pub struct RateBuilder {
    max: u64,
}

impl RateBuilder {
    pub fn per(self, per: Duration) -> Result<Rate, ThrottleError> {
        Rate::new(self.max, per)
    }
}

/// `percent(0.25)` admits roughly a quarter of all calls
pub fn percent(fraction: f64) -> Result<Percentage, ThrottleError> {
    Percentage::new(fraction)
}

/// `rate(2).per(Duration::from_secs(1))`
pub fn rate(max: u64) -> RateBuilder {
    RateBuilder { max }
}

/// One admission per `interval`
pub fn every(interval: Duration) -> Result<Rate, ThrottleError> {
    Rate::new(1, interval)
}
