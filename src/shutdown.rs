//! Cooperative shutdown signal.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// A latch shared by the subscription loop and the workers.
///
/// Once triggered it stays triggered. Sleeps taken through
/// [`Shutdown::wait_timeout`] end early when it fires.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock() = true;
        condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for up to `timeout`. Returns true if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let mut triggered = flag.lock();
        if !*triggered {
            let _ = condvar.wait_while_for(&mut triggered, |t| !*t, timeout);
        }
        *triggered
    }
}
