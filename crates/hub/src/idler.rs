// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cooperative yielding primitive bounding how long synchronous work runs
//! before ceding control back to the scheduler.
//!
//! Queue drains and graph serialization thread an [`Idler`] through their
//! inner loops: they call [`Idler::should_idle`] between units of work and
//! await [`Idler::idle`] when it fires. Cancelling an idler is the one
//! cancellation mechanism those loops observe.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Cancelled;

/// Default interval after which synchronous work should yield.
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(16);

pub type IdleFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Cancelled>> + Send + 'a>>;

pub trait Idler: Send + Sync {
    /// True once the caller has been running longer than the idle interval,
    /// or when the idler was cancelled.
    fn should_idle(&self) -> bool;

    /// Suspend until the scheduler has had a chance to run other work, then
    /// reset the internal clock. Fails with [`Cancelled`] if cancelled.
    fn idle(&self) -> IdleFuture<'_>;

    /// Flip the kill flag. Idempotent; observed by both `should_idle` and
    /// `idle`.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Wall-clock idler used in production.
pub struct TickIdler {
    interval: Duration,
    last_yield: Mutex<Instant>,
    cancelled: AtomicBool,
}

impl TickIdler {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_IDLE_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_yield: Mutex::new(Instant::now()),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl Default for TickIdler {
    fn default() -> Self {
        Self::new()
    }
}

impl Idler for TickIdler {
    fn should_idle(&self) -> bool {
        self.is_cancelled() || self.last_yield.lock().elapsed() > self.interval
    }

    fn idle(&self) -> IdleFuture<'_> {
        Box::pin(async move {
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            tokio::task::yield_now().await;
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            *self.last_yield.lock() = Instant::now();
            Ok(())
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Deterministic idler for tests.
///
/// `should_idle` alternates between false and true on successive calls, so a
/// work loop consumes exactly two units per batch. `idle` blocks until the
/// test steps it with [`TestIdler::next`], or forever-resolves once
/// [`TestIdler::run`] was called.
pub struct TestIdler {
    cancelled: AtomicBool,
    running: AtomicBool,
    flip: AtomicBool,
    step: Notify,
}

impl TestIdler {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            flip: AtomicBool::new(false),
            step: Notify::new(),
        }
    }

    /// Release one pending `idle()` and give the woken task time to run up
    /// to its next suspension point. Only meaningful on a current-thread
    /// test runtime.
    pub async fn next(&self) {
        self.step.notify_one();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Disable all future idling: every `idle()` resolves immediately and
    /// `should_idle` stays false.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        self.step.notify_one();
    }
}

impl Default for TestIdler {
    fn default() -> Self {
        Self::new()
    }
}

impl Idler for TestIdler {
    fn should_idle(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        if self.running.load(Ordering::Acquire) {
            return false;
        }
        self.flip.fetch_xor(true, Ordering::AcqRel)
    }

    fn idle(&self) -> IdleFuture<'_> {
        Box::pin(async move {
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            if !self.running.load(Ordering::Acquire) {
                self.step.notified().await;
            }
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            Ok(())
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.step.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[path = "idler_tests.rs"]
mod tests;
