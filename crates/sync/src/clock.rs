//! Stamp sources.

use datsync_common::{now_stamp, Stamp};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time as a [`Stamp`].
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Stamp;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Stamp {
        now_stamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: Stamp) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Stamp) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Stamp {
        self.0.load(Ordering::SeqCst)
    }
}
